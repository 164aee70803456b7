//! Cooperative lifecycle shared by every long-running component.
//!
//! A [`Lifecycle`] couples a cancellation token with the join handles of the
//! tasks it spawned and the first error any of them returned. Tasks poll the
//! token at every blocking wait. `stop` cancels, joins every task and returns
//! the recorded error; calling it again returns the same result.

use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error reported by a component task.
///
/// `Clone` so a stopped lifecycle can hand the same result to every caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{task}: {message}")]
pub struct TaskError {
    pub task: String,
    pub message: String,
}

impl TaskError {
    pub fn new(task: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            task: task.into(),
            message: message.to_string(),
        }
    }
}

/// Contract implemented by every long-running component of the agent.
#[async_trait]
pub trait Component: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Begin the component's work on its own tasks
    async fn start(&self) -> Result<(), TaskError>;

    /// Cancel and wait for the component's tasks, returning the first error
    async fn stop(&self) -> Result<(), TaskError>;
}

#[derive(Default)]
struct Inner {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    first_error: Arc<Mutex<Option<TaskError>>>,
    outcome: tokio::sync::Mutex<Option<Result<(), TaskError>>>,
}

/// Cancellation token plus tracked tasks for one component instance.
#[derive(Clone, Default)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by the component's tasks
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// True once cancellation was requested
    pub fn is_dying(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once cancellation was requested
    pub async fn dying(&self) {
        self.inner.token.cancelled().await
    }

    /// Spawn a tracked task. A task returning an error cancels its siblings.
    pub fn spawn<F>(&self, task: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let task = task.into();
        let token = self.inner.token.clone();
        let first_error = Arc::clone(&self.inner.first_error);
        let handle = tokio::spawn(async move {
            match fut.await {
                Ok(()) => debug!(task = %task, "task exited"),
                Err(e) => {
                    warn!(task = %task, error = %e, "task failed");
                    first_error.lock().unwrap().get_or_insert(e);
                    token.cancel();
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(handle);
    }

    /// Record `reason` (if it is the first error) and request cancellation.
    pub fn kill(&self, reason: Option<TaskError>) {
        if let Some(e) = reason {
            self.inner.first_error.lock().unwrap().get_or_insert(e);
        }
        self.inner.token.cancel();
    }

    /// Cancel, wait for every tracked task and return the first recorded error.
    pub async fn stop(&self) -> Result<(), TaskError> {
        let mut outcome = self.inner.outcome.lock().await;
        if let Some(result) = outcome.as_ref() {
            return result.clone();
        }

        self.inner.token.cancel();
        self.join_all().await;

        let result = match self.inner.first_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        *outcome = Some(result.clone());
        result
    }

    async fn join_all(&self) {
        // Tasks may spawn siblings while shutting down, so drain until empty.
        loop {
            let handles = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        self.inner
                            .first_error
                            .lock()
                            .unwrap()
                            .get_or_insert(TaskError::new("task", "panicked"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_cancels_and_joins() {
        let lifecycle = Lifecycle::new();
        let exited = Arc::new(AtomicBool::new(false));
        let token = lifecycle.token();
        let flag = Arc::clone(&exited);
        lifecycle.spawn("waiter", async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        assert!(lifecycle.stop().await.is_ok());
        assert!(exited.load(Ordering::SeqCst));
        assert!(lifecycle.is_dying());
    }

    #[tokio::test]
    async fn test_stop_returns_first_error() {
        let lifecycle = Lifecycle::new();
        lifecycle.spawn("failing", async { Err(TaskError::new("failing", "boom")) });
        let token = lifecycle.token();
        lifecycle.spawn("sibling", async move {
            // Cancelled by the failing sibling, not by stop().
            token.cancelled().await;
            Ok(())
        });

        tokio::time::timeout(Duration::from_secs(1), lifecycle.dying())
            .await
            .unwrap();
        let err = lifecycle.stop().await.unwrap_err();
        assert_eq!(err.task, "failing");
        assert_eq!(err.message, "boom");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let lifecycle = Lifecycle::new();
        lifecycle.spawn("failing", async { Err(TaskError::new("failing", "once")) });

        let first = lifecycle.stop().await;
        lifecycle.kill(Some(TaskError::new("late", "ignored")));
        let second = lifecycle.stop().await;
        assert_eq!(first, second);
        assert_eq!(second.unwrap_err().message, "once");
    }

    #[tokio::test]
    async fn test_kill_records_reason() {
        let lifecycle = Lifecycle::new();
        lifecycle.kill(Some(TaskError::new("manual", "shutdown requested")));
        assert!(lifecycle.is_dying());
        assert_eq!(lifecycle.stop().await.unwrap_err().task, "manual");
    }

    #[tokio::test]
    async fn test_panicking_task_is_reported() {
        let lifecycle = Lifecycle::new();
        lifecycle.spawn("panics", async {
            if true {
                panic!("plugin exploded");
            }
            Ok(())
        });
        let err = lifecycle.stop().await.unwrap_err();
        assert_eq!(err.message, "panicked");
    }
}
