//! End-to-end workflows against the local process backend.
//!
//! Every test runs real processes and is wrapped in a timeout so a stuck
//! wait fails the test instead of hanging the suite.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::time::timeout;

use jobflow::{
    Context, Error, JobHandle, JobState, JobTemplate, JobTemplateField, ProcessConfig,
    Replacement, Workflow,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

async fn workflow() -> Workflow {
    let wf = Workflow::new(Context::process().await).await;
    assert!(!wf.has_error(), "workflow creation failed: {:?}", wf.error());
    wf
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_success() {
    timeout(TEST_TIMEOUT, async {
        let wf = workflow().await;
        let mut job = wf
            .run("sleep", ["0"])
            .await
            .then_run("sleep", ["0"])
            .await
            .wait()
            .await;

        assert!(job.success().await);
        let infos = job.job_infos().await;
        assert_eq!(infos.len(), 2);
        for info in infos {
            assert_eq!(info.state, JobState::Done);
            assert_eq!(info.exit_status, 0);
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn fan_out_runs_in_parallel() {
    timeout(TEST_TIMEOUT, async {
        let wf = workflow().await;
        let started = Instant::now();
        let job = wf
            .run("sleep", ["1"])
            .await
            .resubmit(99)
            .await
            .synchronize()
            .await;

        assert_eq!(job.len(), 100);
        assert!(!job.errored());
        assert!(!job.any_failed().await);
        for info in job.job_infos().await {
            assert!(info.state.is_terminal());
        }
        // one second of sleep each, run side by side
        assert!(started.elapsed() < Duration::from_secs(10));
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn array_respects_throttle() {
    timeout(TEST_TIMEOUT, async {
        let wf = workflow().await;
        let job = wf
            .run_array_job(1, 10, 1, 3, "/bin/sh", ["-c", "sleep 0.2 && exit 0"])
            .await;
        assert!(!job.errored());
        let tasks = job.list_all().await;
        assert_eq!(tasks.len(), 10);

        let peak = Arc::new(AtomicUsize::new(0));
        let monitor = {
            let peak = Arc::clone(&peak);
            let tasks = tasks.clone();
            tokio::spawn(async move {
                loop {
                    let mut running = 0;
                    let mut finished = 0;
                    for task in &tasks {
                        match task.state().await {
                            JobState::Running => running += 1,
                            s if s.is_terminal() => finished += 1,
                            _ => {}
                        }
                    }
                    peak.fetch_max(running, Ordering::SeqCst);
                    if finished == tasks.len() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        let mut job = job.wait().await;
        monitor.await.unwrap();
        assert_eq!(job.state().await, JobState::Done);
        for task in &tasks {
            assert_eq!(task.state().await, JobState::Done);
        }
        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak concurrency {peak}");
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_array_task_is_cancelled() {
    timeout(TEST_TIMEOUT, async {
        let wf = workflow().await;
        let job = wf.run_array_job(1, 10, 1, 1, "sleep", ["10"]).await;
        let tasks = job.list_all().await;
        let fifth = tasks
            .iter()
            .find(|t| t.id().ends_with(".5"))
            .expect("task 5 exists")
            .clone();
        assert_eq!(fifth.state().await, JobState::Queued);

        fifth.terminate().await.unwrap();
        assert_eq!(fifth.state().await, JobState::Failed);
        let info = fifth.info().await.unwrap();
        assert_eq!(info.sub_state, "cancelled");
        assert!(info.dispatch_time.is_none());

        // the first task is unaffected
        assert_ne!(tasks[0].state().await, JobState::Failed);

        let job = job.kill().await.wait().await;
        assert!(job.any_failed().await);
        for task in &tasks {
            assert_eq!(task.state().await, JobState::Failed);
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn matrix_product() {
    timeout(TEST_TIMEOUT, async {
        let wf = workflow().await;
        let job = wf
            .run_matrix_t(
                JobTemplate::command("{{C}}", ["{{A}}"]),
                Replacement::new(&[JobTemplateField::RemoteCommand], "{{C}}", ["sleep", "echo"]),
                Replacement::new(&[JobTemplateField::Args], "{{A}}", ["0.1", "0.2"]),
            )
            .await
            .synchronize()
            .await;
        assert!(!job.errored());
        assert_eq!(job.len(), 4);

        let mut commands: HashMap<String, usize> = HashMap::new();
        job.for_each(async |task: &JobHandle| -> Result<(), Error> {
            assert_eq!(task.state().await, JobState::Done);
            *commands.entry(task.template().await?.remote_command).or_default() += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(commands.get("sleep"), Some(&2));
        assert_eq!(commands.get("echo"), Some(&2));

        let empty = wf
            .run_matrix_t(
                JobTemplate::command("sleep", ["0"]),
                Replacement::new(&[], "", Vec::<String>::new()),
                Replacement::new(&[], "", Vec::<String>::new()),
            )
            .await;
        assert!(empty.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn output_with_placeholder_expansion() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProcessConfig::default();
        config.default_template.output_path =
            dir.path().join("out-{{ .ID }}").to_string_lossy().into_owned();
        let ctx = Context::process_with_config(config).await;
        let wf = Workflow::new(ctx).await;

        let mut job = wf.run("echo", ["hello"]).await;
        assert_eq!(job.output().await, "hello");
        let stored = job.template().await.unwrap();
        assert!(!stored.output_path.ends_with("{{ .ID }}"));
        assert!(std::path::Path::new(&stored.output_path).is_file());
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_survive_in_database_file() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessConfig {
            db_file: Some(dir.path().join("wfl.db")),
            session_name: "persisted".to_string(),
            ..Default::default()
        };
        let first = Workflow::new(Context::process_with_config(config.clone()).await).await;
        assert!(!first.has_error());
        first.close();
        drop(first);

        let second = Workflow::new(Context::process_with_config(config).await).await;
        assert!(!second.has_error(), "{:?}", second.error());
        assert_eq!(second.session_name(), "persisted");
    })
    .await
    .expect("test timed out");
}
