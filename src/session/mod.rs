//! Job sessions: named groups of jobs backed by one tracker.
//!
//! The [`SessionManager`] remembers session names in a [`Storer`] and hands
//! out [`JobSession`]s. Each session owns a tracker built by the factory
//! registered for the manager's [`SessionType`].

mod handle;
pub mod libsql_store;
pub mod storage;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use handle::{ArrayJobHandle, JobHandle};
pub(crate) use handle::aggregate_state;
pub use libsql_store::LibSqlStore;
pub use storage::{KeyType, MemoryStore, Storer};

use crate::error::{Error, StoreError, TrackerError, WorkflowError};
use crate::template::JobTemplate;
use crate::tracker::{JobTracker, ProcessTracker};

/// Backend kinds a session manager can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Process,
    Container,
    Batch,
    Remote,
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Process => "process",
            Self::Container => "container",
            Self::Batch => "batch",
            Self::Remote => "remote",
        };
        write!(f, "{s}")
    }
}

/// Builds the tracker for a session name.
pub type TrackerFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn JobTracker>, TrackerError> + Send + Sync>;

/// What the store remembers about a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub contact: String,
    pub session_type: SessionType,
    pub created_at: DateTime<Utc>,
}

/// Creates, opens and destroys job sessions of one backend kind.
pub struct SessionManager {
    session_type: SessionType,
    store: Arc<dyn Storer>,
    factories: RwLock<HashMap<SessionType, TrackerFactory>>,
    trackers: Mutex<HashMap<String, Arc<dyn JobTracker>>>,
}

impl SessionManager {
    /// Manager over `store`. Only [`SessionType::Process`] has a built-in
    /// tracker; other kinds need [`SessionManager::register_tracker`].
    pub async fn new(session_type: SessionType, store: Arc<dyn Storer>) -> Result<Self, Error> {
        store.init().await?;
        let mut factories: HashMap<SessionType, TrackerFactory> = HashMap::new();
        factories.insert(
            SessionType::Process,
            Arc::new(|name: &str| -> Result<Arc<dyn JobTracker>, TrackerError> {
                Ok(Arc::new(ProcessTracker::new(name)))
            }),
        );
        debug!(session_type = %session_type, "Session manager created");
        Ok(Self {
            session_type,
            store,
            factories: RwLock::new(factories),
            trackers: Mutex::new(HashMap::new()),
        })
    }

    /// Process session manager with an in-memory store.
    pub async fn process() -> Result<Self, Error> {
        Self::new(SessionType::Process, Arc::new(MemoryStore::new())).await
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    /// Plug in the tracker implementation for a backend kind.
    pub fn register_tracker(&self, session_type: SessionType, factory: TrackerFactory) {
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_type, factory);
    }

    async fn tracker_for(&self, name: &str) -> Result<Arc<dyn JobTracker>, Error> {
        let mut trackers = self.trackers.lock().await;
        if let Some(tracker) = trackers.get(name) {
            return Ok(Arc::clone(tracker));
        }
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&self.session_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnsupportedSessionType(self.session_type.to_string()))?;
        let tracker = factory(name)?;
        trackers.insert(name.to_string(), Arc::clone(&tracker));
        Ok(tracker)
    }

    /// Create a new session. `contact` defaults to the name.
    pub async fn create_job_session(&self, name: &str, contact: &str) -> Result<JobSession, Error> {
        if self.store.exists(KeyType::JobSession, name).await? {
            return Err(WorkflowError::SessionExists {
                name: name.to_string(),
            }
            .into());
        }
        let contact = if contact.is_empty() { name } else { contact };
        let tracker = self.tracker_for(name).await?;
        let info = SessionInfo {
            name: name.to_string(),
            contact: contact.to_string(),
            session_type: self.session_type,
            created_at: Utc::now(),
        };
        let value = serde_json::to_string(&info)
            .map_err(|e| StoreError::Query(format!("encode session {name}: {e}")))?;
        self.store.put(KeyType::JobSession, name, &value).await?;
        info!(session = %name, session_type = %self.session_type, "Job session created");
        Ok(JobSession::new(info.name, info.contact, tracker))
    }

    /// Open an existing session.
    pub async fn open_job_session(&self, name: &str) -> Result<JobSession, Error> {
        if !self.store.exists(KeyType::JobSession, name).await? {
            return Err(WorkflowError::SessionNotFound {
                name: name.to_string(),
            }
            .into());
        }
        let value = self.store.get(KeyType::JobSession, name).await?;
        let contact = match serde_json::from_str::<SessionInfo>(&value) {
            Ok(info) => info.contact,
            Err(e) => {
                warn!(session = %name, error = %e, "Unreadable session record");
                name.to_string()
            }
        };
        let tracker = self.tracker_for(name).await?;
        debug!(session = %name, "Job session opened");
        Ok(JobSession::new(name, contact, tracker))
    }

    /// Forget a session and shut its tracker down.
    pub async fn destroy_job_session(&self, name: &str) -> Result<(), Error> {
        if !self.store.exists(KeyType::JobSession, name).await? {
            return Err(WorkflowError::SessionNotFound {
                name: name.to_string(),
            }
            .into());
        }
        self.store.delete(KeyType::JobSession, name).await?;
        if let Some(tracker) = self.trackers.lock().await.remove(name) {
            tracker.shutdown().await?;
        }
        info!(session = %name, "Job session destroyed");
        Ok(())
    }

    pub async fn job_session_names(&self) -> Result<Vec<String>, Error> {
        Ok(self.store.list(KeyType::JobSession).await?)
    }

    /// Record a reservation session. Reservations are bookkeeping only.
    pub async fn create_reservation_session(&self, name: &str, contact: &str) -> Result<(), Error> {
        if self.store.exists(KeyType::ReservationSession, name).await? {
            return Err(WorkflowError::SessionExists {
                name: name.to_string(),
            }
            .into());
        }
        let contact = if contact.is_empty() { name } else { contact };
        self.store
            .put(KeyType::ReservationSession, name, contact)
            .await?;
        Ok(())
    }

    pub async fn reservation_session_names(&self) -> Result<Vec<String>, Error> {
        Ok(self.store.list(KeyType::ReservationSession).await?)
    }

    /// Shut down every tracker and release the store.
    pub async fn close(&self) -> Result<(), Error> {
        let trackers: Vec<_> = self.trackers.lock().await.drain().collect();
        for (name, tracker) in trackers {
            if let Err(e) = tracker.shutdown().await {
                warn!(session = %name, error = %e, "Tracker shutdown failed");
            }
        }
        self.store.exit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_type", &self.session_type)
            .finish()
    }
}

/// An open job session.
#[derive(Clone)]
pub struct JobSession {
    name: String,
    contact: String,
    tracker: Arc<dyn JobTracker>,
    closed: Arc<AtomicBool>,
}

impl JobSession {
    fn new(name: impl Into<String>, contact: impl Into<String>, tracker: Arc<dyn JobTracker>) -> Self {
        Self {
            name: name.into(),
            contact: contact.into(),
            tracker,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contact(&self) -> &str {
        &self.contact
    }

    pub fn tracker(&self) -> Arc<dyn JobTracker> {
        Arc::clone(&self.tracker)
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkflowError::SessionClosed.into());
        }
        Ok(())
    }

    pub async fn run_job(&self, template: JobTemplate) -> Result<JobHandle, Error> {
        self.check_open()?;
        let id = self.tracker.add_job(template).await?;
        Ok(JobHandle::new(id, &self.name, Arc::clone(&self.tracker)))
    }

    pub async fn run_bulk_jobs(
        &self,
        template: JobTemplate,
        begin: i64,
        end: i64,
        step: i64,
        max_parallel: i64,
    ) -> Result<ArrayJobHandle, Error> {
        self.check_open()?;
        let id = self
            .tracker
            .add_array_job(template, begin, end, step, max_parallel)
            .await?;
        Ok(ArrayJobHandle::new(id, &self.name, Arc::clone(&self.tracker)))
    }

    /// Every job of the session.
    pub async fn jobs(&self) -> Result<Vec<JobHandle>, Error> {
        self.check_open()?;
        Ok(self
            .tracker
            .list_jobs()
            .await?
            .into_iter()
            .map(|id| JobHandle::new(id, &self.name, Arc::clone(&self.tracker)))
            .collect())
    }

    pub async fn job_array(&self, id: &str) -> Result<ArrayJobHandle, Error> {
        self.check_open()?;
        self.tracker.list_array_jobs(id).await?;
        Ok(ArrayJobHandle::new(id, &self.name, Arc::clone(&self.tracker)))
    }

    pub async fn job_categories(&self) -> Result<Vec<String>, Error> {
        self.check_open()?;
        Ok(self.tracker.list_job_categories().await?)
    }

    /// Stop using the session. Jobs keep running in the tracker.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for JobSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSession")
            .field("name", &self.name)
            .field("contact", &self.contact)
            .finish()
    }
}
