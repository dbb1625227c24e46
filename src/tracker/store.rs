//! In-memory registry of the jobs a process tracker has accepted.

use std::collections::HashMap;

use super::JobState;
use crate::template::JobTemplate;

/// One process belonging to a job. Single jobs have exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalJob {
    /// Array task index, 0 for single jobs.
    pub task_index: i64,
    pub state: JobState,
    /// Process id, 0 while nothing has been spawned.
    pub pid: u32,
}

/// Job templates and process ids keyed by job id.
#[derive(Debug, Default)]
pub struct JobStore {
    job_ids: Vec<String>,
    templates: HashMap<String, JobTemplate>,
    jobs: HashMap<String, Vec<InternalJob>>,
    is_array: HashMap<String, bool>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a running single job.
    pub fn save_job(&mut self, id: &str, template: JobTemplate, pid: u32) {
        self.job_ids.push(id.to_string());
        self.templates.insert(id.to_string(), template);
        self.jobs.insert(
            id.to_string(),
            vec![InternalJob {
                task_index: 0,
                state: JobState::Running,
                pid,
            }],
        );
        self.is_array.insert(id.to_string(), false);
    }

    /// Reserve queued placeholders for every array task.
    pub fn save_array_job(&mut self, array_id: &str, template: JobTemplate, indices: &[i64]) {
        self.job_ids.push(array_id.to_string());
        self.templates.insert(array_id.to_string(), template);
        self.jobs.insert(
            array_id.to_string(),
            indices
                .iter()
                .map(|&task_index| InternalJob {
                    task_index,
                    state: JobState::Queued,
                    pid: 0,
                })
                .collect(),
        );
        self.is_array.insert(array_id.to_string(), true);
    }

    /// Record the process of a started array task.
    pub fn save_array_job_pid(&mut self, array_id: &str, task_index: i64, pid: u32) -> bool {
        let Some(task) = self
            .jobs
            .get_mut(array_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.task_index == task_index))
        else {
            return false;
        };
        task.pid = pid;
        task.state = JobState::Running;
        true
    }

    /// Mark an array task as never started.
    pub fn mark_array_task_failed(&mut self, array_id: &str, task_index: i64) {
        if let Some(task) = self
            .jobs
            .get_mut(array_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.task_index == task_index))
        {
            task.state = JobState::Failed;
        }
    }

    /// True for known single jobs, array jobs, and array task ids.
    pub fn has_job(&self, id: &str) -> bool {
        let (base, task) = split_task_id(id);
        match (self.jobs.get(base), task) {
            (Some(_), None) => true,
            (Some(tasks), Some(index)) => tasks.iter().any(|t| t.task_index == index),
            (None, _) => false,
        }
    }

    pub fn is_array_job(&self, id: &str) -> bool {
        self.is_array.get(id).copied().unwrap_or(false)
    }

    /// Process id for a single job or an array task id, 0 if not started.
    pub fn pid_of(&self, id: &str) -> Option<u32> {
        let (base, task) = split_task_id(id);
        let tasks = self.jobs.get(base)?;
        match task {
            None => tasks.first().map(|t| t.pid),
            Some(index) => tasks.iter().find(|t| t.task_index == index).map(|t| t.pid),
        }
    }

    /// Template of a job; array tasks resolve to their array's template.
    pub fn template_of(&self, id: &str) -> Option<&JobTemplate> {
        let (base, _) = split_task_id(id);
        self.templates.get(base)
    }

    /// Ids of every task of an array job, in submission order.
    pub fn array_task_ids(&self, array_id: &str) -> Option<Vec<String>> {
        if !self.is_array_job(array_id) {
            return None;
        }
        self.jobs.get(array_id).map(|tasks| {
            tasks
                .iter()
                .map(|t| task_id(array_id, t.task_index))
                .collect()
        })
    }

    /// Every id that might carry bus state for `id`: the id itself and, for
    /// arrays, all task ids.
    pub fn state_keys(&self, id: &str) -> Vec<String> {
        let mut keys = vec![id.to_string()];
        if let Some(tasks) = self.array_task_ids(id) {
            keys.extend(tasks);
        }
        keys
    }

    pub fn job_ids(&self) -> &[String] {
        &self.job_ids
    }

    /// Forget one task of an array job. Once the last task is gone the array
    /// itself is removed and `true` is returned.
    pub fn remove_array_task(&mut self, array_id: &str, task_index: i64) -> bool {
        let Some(tasks) = self.jobs.get_mut(array_id) else {
            return false;
        };
        tasks.retain(|t| t.task_index != task_index);
        if !tasks.is_empty() {
            return false;
        }
        self.remove_job(array_id);
        true
    }

    /// Forget a job. Array jobs take all their tasks with them.
    pub fn remove_job(&mut self, id: &str) {
        self.job_ids.retain(|j| j != id);
        self.templates.remove(id);
        self.jobs.remove(id);
        self.is_array.remove(id);
    }
}

/// `"<arrayId>.<index>"`.
pub fn task_id(array_id: &str, task_index: i64) -> String {
    format!("{array_id}.{task_index}")
}

/// Split `"<id>.<index>"` on the first dot. Ids without a numeric suffix have
/// no task part.
pub fn split_task_id(id: &str) -> (&str, Option<i64>) {
    match id.split_once('.') {
        Some((base, index)) => match index.parse() {
            Ok(index) => (base, Some(index)),
            Err(_) => (id, None),
        },
        None => (id, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_job() {
        let mut store = JobStore::new();
        store.save_job("1", JobTemplate::command("sleep", ["1"]), 4711);
        assert!(store.has_job("1"));
        assert!(!store.is_array_job("1"));
        assert_eq!(store.pid_of("1"), Some(4711));
        assert_eq!(store.template_of("1").unwrap().remote_command, "sleep");
        assert_eq!(store.job_ids(), ["1".to_string()]);

        store.remove_job("1");
        assert!(!store.has_job("1"));
        assert!(store.job_ids().is_empty());
    }

    #[test]
    fn test_array_job() {
        let mut store = JobStore::new();
        store.save_array_job("2", JobTemplate::command("true", Vec::<String>::new()), &[1, 3, 5]);
        assert!(store.is_array_job("2"));
        assert!(store.has_job("2.3"));
        assert!(!store.has_job("2.4"));
        assert_eq!(store.pid_of("2.3"), Some(0));
        assert_eq!(
            store.array_task_ids("2").unwrap(),
            vec!["2.1".to_string(), "2.3".to_string(), "2.5".to_string()]
        );

        assert!(store.save_array_job_pid("2", 3, 99));
        assert!(!store.save_array_job_pid("2", 4, 99));
        assert_eq!(store.pid_of("2.3"), Some(99));
        assert_eq!(store.template_of("2.5").unwrap().remote_command, "true");
        assert_eq!(store.state_keys("2").len(), 4);

        store.remove_job("2");
        assert!(!store.has_job("2.1"));
    }

    #[test]
    fn test_removing_last_task_removes_array() {
        let mut store = JobStore::new();
        store.save_array_job("7", JobTemplate::command("true", Vec::<String>::new()), &[1, 2]);
        assert!(!store.remove_array_task("7", 1));
        assert!(!store.has_job("7.1"));
        assert!(store.has_job("7.2"));
        assert_eq!(store.state_keys("7"), ["7", "7.2"]);

        assert!(store.remove_array_task("7", 2));
        assert!(!store.has_job("7"));
        assert!(store.job_ids().is_empty());
        assert!(!store.remove_array_task("7", 2));
    }

    #[test]
    fn test_split_task_id() {
        assert_eq!(split_task_id("12.4"), ("12", Some(4)));
        assert_eq!(split_task_id("12"), ("12", None));
        assert_eq!(split_task_id("a.b"), ("a.b", None));
    }
}
