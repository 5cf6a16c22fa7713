//! Whole-call deadlines.

use std::future::Future;
use std::time::Duration;

use hbridge_common::{BridgeError, BridgeResult};

/// Picks the deadline for one call: the per-call override wins over the
/// adapter default; neither means unbounded.
pub(crate) fn effective_deadline(per_call: Option<Duration>, default: Option<Duration>) -> Option<Duration> {
    per_call.or(default)
}

/// Runs `fut` under `deadline`.
///
/// On expiry the future is dropped, which aborts its I/O and releases any
/// lease it holds, and `BridgeError::Timeout` is returned.
pub(crate) async fn guard<F, T>(deadline: Option<Duration>, fut: F) -> BridgeResult<T>
where
    F: Future<Output = BridgeResult<T>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(?limit, "call deadline expired");
                Err(BridgeError::Timeout)
            }
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_call_override_wins() {
        let short = Some(Duration::from_millis(10));
        let long = Some(Duration::from_secs(1));
        assert_eq!(effective_deadline(short, long), short);
        assert_eq!(effective_deadline(None, long), long);
        assert_eq!(effective_deadline(None, None), None);
    }

    #[tokio::test]
    async fn expiry_drops_the_future() {
        struct Flag(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Flag(dropped.clone());
        let result: BridgeResult<()> = guard(Some(Duration::from_millis(50)), async move {
            let _flag = flag;
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(BridgeError::Timeout)));
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unbounded_runs_to_completion() {
        let value = guard(None, async { Ok::<_, BridgeError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
