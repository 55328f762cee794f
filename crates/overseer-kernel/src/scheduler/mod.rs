//! Deferred task scheduler
//!
//! Holds delayed and repeating jobs created by executed actions. Every job
//! is tracked by id so it can be listed and cancelled; one-shot jobs drop
//! out of the table once they have run. Dropping the scheduler aborts all
//! outstanding jobs.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Identifier of a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduledTaskId(Ulid);

impl ScheduledTaskId {
    /// Generate a fresh id
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ScheduledTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ScheduledTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Called outside a Tokio runtime
    #[error("no async runtime available to run scheduled tasks")]
    NoRuntime,

    /// Repeat interval of zero
    #[error("repeat interval must be greater than zero")]
    ZeroInterval,
}

/// Public view of a pending job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTaskInfo {
    /// Job id
    pub id: ScheduledTaskId,
    /// Human-readable description
    pub description: String,
    /// Repeat interval, `None` for one-shots
    pub repeat_every: Option<Duration>,
}

struct TaskEntry {
    description: String,
    repeat_every: Option<Duration>,
    handle: AbortHandle,
}

/// Tracks and runs deferred jobs on the ambient Tokio runtime
#[derive(Default)]
pub struct TaskScheduler {
    tasks: Arc<DashMap<ScheduledTaskId, TaskEntry>>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending", &self.tasks.len())
            .finish()
    }
}

impl TaskScheduler {
    /// Create an empty scheduler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` after `delay`, then every `repeat_every` if given
    ///
    /// Job failures are logged and do not stop a repeating job.
    ///
    /// # Errors
    /// No Tokio runtime is running, or the repeat interval is zero.
    pub fn schedule<F, Fut, E>(
        &self,
        description: impl Into<String>,
        delay: Duration,
        repeat_every: Option<Duration>,
        job: F,
    ) -> Result<ScheduledTaskId, SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if repeat_every.is_some_and(|p| p.is_zero()) {
            return Err(SchedulerError::ZeroInterval);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let id = ScheduledTaskId::new();
        let description = description.into();
        let tasks = Arc::clone(&self.tasks);
        let (ready_tx, ready_rx) = oneshot::channel::<()>();

        let handle = runtime.spawn(async move {
            // Wait until the entry is registered so a one-shot cannot
            // finish and unregister before it was ever inserted.
            if ready_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            loop {
                if let Err(e) = job().await {
                    warn!(task_id = %id, error = %e, "Scheduled task failed");
                }
                match repeat_every {
                    Some(period) => tokio::time::sleep(period).await,
                    None => break,
                }
            }
            tasks.remove(&id);
            debug!(task_id = %id, "Scheduled task finished");
        });

        info!(task_id = %id, %description, delay_secs = delay.as_secs(), repeating = repeat_every.is_some(), "Task scheduled");
        self.tasks.insert(
            id,
            TaskEntry {
                description,
                repeat_every,
                handle: handle.abort_handle(),
            },
        );
        let _ = ready_tx.send(());
        Ok(id)
    }

    /// Cancel a job; `false` if it was unknown or already finished
    pub fn cancel(&self, id: ScheduledTaskId) -> bool {
        match self.tasks.remove(&id) {
            Some((_, entry)) => {
                entry.handle.abort();
                info!(task_id = %id, "Task cancelled");
                true
            }
            None => false,
        }
    }

    /// Jobs that have not finished, ordered by id
    #[must_use]
    pub fn pending(&self) -> Vec<ScheduledTaskInfo> {
        let mut out: Vec<ScheduledTaskInfo> = self
            .tasks
            .iter()
            .map(|entry| ScheduledTaskInfo {
                id: *entry.key(),
                description: entry.description.clone(),
                repeat_every: entry.repeat_every,
            })
            .collect();
        out.sort_by_key(|info| info.id);
        out
    }

    /// Number of unfinished jobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if no jobs are pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort every outstanding job
    pub fn shutdown(&self) {
        let ids: Vec<ScheduledTaskId> = self.tasks.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.tasks.remove(&id) {
                entry.handle.abort();
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_job(counter: &Arc<AtomicU32>) -> impl Fn() -> futures::future::Ready<Result<(), String>> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_runs_once_and_unregisters() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule("ping", Duration::from_secs(10), None, counting_job(&counter))
            .unwrap();
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_job_runs_until_cancelled() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let id = scheduler
            .schedule(
                "digest",
                Duration::from_secs(1),
                Some(Duration::from_secs(5)),
                counting_job(&counter),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_keeps_repeating() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        scheduler
            .schedule("flaky", Duration::ZERO, Some(Duration::from_secs(1)), move || {
                c.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Err::<(), _>("send failed".to_string()))
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.pending().len(), 1);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let scheduler = TaskScheduler::new();
        let err = scheduler
            .schedule("bad", Duration::ZERO, Some(Duration::ZERO), || async { Ok::<(), String>(()) })
            .unwrap_err();
        assert_eq!(err, SchedulerError::ZeroInterval);
    }

    #[test]
    fn scheduling_outside_runtime_fails() {
        let scheduler = TaskScheduler::new();
        let err = scheduler
            .schedule("x", Duration::ZERO, None, || async { Ok::<(), String>(()) })
            .unwrap_err();
        assert_eq!(err, SchedulerError::NoRuntime);
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule("later", Duration::from_secs(3600), None, counting_job(&counter))
            .unwrap();
        scheduler.shutdown();
        assert!(scheduler.is_empty());
    }
}
