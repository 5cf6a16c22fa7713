//! # Batch Coordinator
//!
//! Purpose: Run many logical requests concurrently behind a single
//! "wait for all" boundary.
//!
//! ## Design Principles
//! 1. **Task Group**: A running batch owns a `JoinSet`; every scheduled
//!    operation is a task in it.
//! 2. **Caller Scoped**: The batch is bound to the task inside `execute`
//!    through a task-local, so unrelated tasks never join it.
//! 3. **Drain to Quiescence**: Waiting repeats until no task is left, so
//!    operations scheduled while draining are awaited too.
//! 4. **Always Stop**: However `execute` ends (success, error, panic or the
//!    future being dropped) unfinished tasks are aborted and the
//!    coordinator returns to idle.
//!
//! ## State Machine
//!
//! ```text
//! Idle --execute--> Running --body done--> Draining --all joined--> Idle
//!                      |                                            ^
//!                      +------------- body error / drop ------------+
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use hbridge_common::{BridgeError, BridgeResult};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type Tasks = Arc<Mutex<Option<JoinSet<()>>>>;

/// The batch the current task belongs to. Operations spawned into a batch
/// carry it along, so they can schedule follow-up work on the same barrier.
#[derive(Clone)]
struct ActiveBatch {
    owner: u64,
    /// `None` once the batch has stopped.
    tasks: Tasks,
}

tokio::task_local! {
    static ACTIVE: ActiveBatch;
}

impl ActiveBatch {
    /// Spawns `op` onto the barrier, handing it back when the batch stopped.
    fn spawn<F>(&self, op: F) -> Result<(), F>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        match tasks.as_mut() {
            Some(set) => {
                set.spawn(ACTIVE.scope(self.clone(), op));
                Ok(())
            }
            None => Err(op),
        }
    }
}

/// Coordinates batches for the tasks that call [`BatchCoordinator::execute`].
///
/// A batch belongs to the task running `execute` and to the operations it
/// schedules. Other tasks sharing the coordinator run their own batches or
/// run operations inline. Clones are the same coordinator.
#[derive(Clone)]
pub struct BatchCoordinator {
    id: u64,
}

impl Default for BatchCoordinator {
    fn default() -> Self {
        BatchCoordinator {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl BatchCoordinator {
    pub fn new() -> Self {
        BatchCoordinator::default()
    }

    /// True while the calling task is inside this coordinator's `execute`.
    pub fn is_running(&self) -> bool {
        self.active().is_some()
    }

    fn active(&self) -> Option<ActiveBatch> {
        ACTIVE
            .try_with(|batch| (batch.owner == self.id).then(|| batch.clone()))
            .ok()
            .flatten()
    }

    /// Runs `body`, then waits for every operation it scheduled.
    ///
    /// Returns `NestedBatch` when the calling task is already inside a batch
    /// of this coordinator. When `body` fails its error is returned and
    /// pending operations are aborted.
    pub async fn execute<F, Fut, T>(&self, body: F) -> BridgeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        if self.is_running() {
            return Err(BridgeError::NestedBatch);
        }
        let batch = ActiveBatch {
            owner: self.id,
            tasks: Arc::new(Mutex::new(Some(JoinSet::new()))),
        };
        let _stop = StopOnDrop {
            tasks: batch.tasks.clone(),
        };
        debug!(batch = self.id, "batch started");

        let tasks = batch.tasks.clone();
        let value = ACTIVE
            .scope(batch, async move {
                let value = body().await?;
                drain(&tasks).await;
                Ok::<T, BridgeError>(value)
            })
            .await?;
        debug!(batch = self.id, "batch drained");
        Ok(value)
    }

    /// Adds `op` to the calling task's running batch.
    pub fn schedule<F>(&self, op: F) -> BridgeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.active() {
            Some(batch) => batch.spawn(op).map_err(|_| BridgeError::NoActiveBatch),
            None => Err(BridgeError::NoActiveBatch),
        }
    }

    /// Schedules `op` when the calling task is inside a batch, otherwise
    /// awaits it inline.
    pub async fn run<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inline = match self.active() {
            Some(batch) => match batch.spawn(op) {
                Ok(()) => return,
                Err(op) => op,
            },
            None => op,
        };
        inline.await;
    }
}

async fn drain(tasks: &Mutex<Option<JoinSet<()>>>) {
    loop {
        let mut pending = {
            let mut tasks = tasks.lock();
            match tasks.as_mut() {
                Some(set) if !set.is_empty() => std::mem::take(set),
                _ => return,
            }
        };
        while let Some(joined) = pending.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
            }
        }
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Aborts whatever is left of the batch and marks it stopped.
struct StopOnDrop {
    tasks: Tasks,
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        let tasks = self.tasks.lock().take();
        if let Some(mut tasks) = tasks {
            if !tasks.is_empty() {
                debug!(pending = tasks.len(), "aborting unfinished batch operations");
            }
            tasks.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn waits_for_all_operations() {
        let batch = BatchCoordinator::new();
        let done = Arc::new(AtomicUsize::new(0));

        batch
            .execute(|| async {
                for delay in [30u64, 10, 20] {
                    let done = done.clone();
                    batch.schedule(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                    })?;
                }
                Ok::<_, BridgeError>(())
            })
            .await
            .unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(!batch.is_running());
    }

    #[tokio::test]
    async fn operations_scheduled_while_draining_are_awaited() {
        let batch = BatchCoordinator::new();
        let done = Arc::new(AtomicUsize::new(0));

        batch
            .execute(|| async {
                let inner = batch.clone();
                let counter = done.clone();
                batch.schedule(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let counter2 = counter.clone();
                    inner
                        .schedule(async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            counter2.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    counter.fetch_add(1, Ordering::SeqCst);
                })?;
                Ok::<_, BridgeError>(())
            })
            .await
            .unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn nested_execute_is_rejected() {
        let batch = BatchCoordinator::new();
        let result = batch
            .execute(|| async { batch.execute(|| async { Ok(()) }).await })
            .await;
        assert!(matches!(result, Err(BridgeError::NestedBatch)));
        assert!(!batch.is_running());
    }

    #[tokio::test]
    async fn body_error_aborts_pending_operations() {
        let batch = BatchCoordinator::new();
        let done = Arc::new(AtomicUsize::new(0));

        let result: BridgeResult<()> = batch
            .execute(|| async {
                let done = done.clone();
                batch.schedule(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })?;
                Err(BridgeError::InvalidEndpoint("stop".into()))
            })
            .await;

        assert!(matches!(result, Err(BridgeError::InvalidEndpoint(_))));
        assert!(!batch.is_running());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_outside_a_batch_is_inline() {
        let batch = BatchCoordinator::new();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        batch
            .run(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(matches!(batch.schedule(async {}), Err(BridgeError::NoActiveBatch)));
    }

    #[tokio::test]
    async fn dropping_execute_resets_state() {
        let batch = BatchCoordinator::new();
        let pending = batch.execute(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(timed_out.is_err());
        assert!(!batch.is_running());
    }

    #[tokio::test]
    async fn other_tasks_do_not_join_a_running_batch() {
        let batch = BatchCoordinator::new();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let holder = batch.clone();
        let running = tokio::spawn(async move {
            holder
                .execute(move || async move {
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        });
        entered_rx.await.unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        batch
            .run(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!batch.is_running());
        assert!(matches!(batch.schedule(async {}), Err(BridgeError::NoActiveBatch)));

        let independent = batch.execute(|| async { Ok(7) }).await;
        assert_eq!(independent.unwrap(), 7);

        release_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn separate_coordinators_keep_separate_batches() {
        let outer = BatchCoordinator::new();
        let inner = BatchCoordinator::new();

        let result = outer
            .execute(|| async {
                assert!(outer.is_running());
                assert!(!inner.is_running());
                inner.execute(|| async { Ok(inner.is_running()) }).await
            })
            .await;
        assert!(result.unwrap());
    }
}
