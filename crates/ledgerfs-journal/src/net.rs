//! Shared plumbing for the tokio-facing components

use ledgerfs_common::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Run `fut` under `timeout`, mapping socket failures to connection errors
pub(crate) async fn io_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::connection(e.to_string())),
        Err(_) => Err(Error::Timeout),
    }
}

/// Run blocking engine work off the async runtime
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::internal(format!("blocking task failed: {e}")))?
}

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Sleep for `duration`, waking early once `shutdown` is set.
/// Returns false if shutdown was requested.
pub(crate) async fn sleep_unless(shutdown: &AtomicBool, duration: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(SHUTDOWN_POLL)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_unless_wakes_on_shutdown() {
        let shutdown = AtomicBool::new(false);
        assert!(sleep_unless(&shutdown, Duration::from_millis(10)).await);

        shutdown.store(true, Ordering::Relaxed);
        let start = std::time::Instant::now();
        assert!(!sleep_unless(&shutdown, Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_io_timeout_maps_errors() {
        let ok = io_timeout(Duration::from_secs(1), async { Ok::<_, std::io::Error>(3) }).await;
        assert_eq!(ok.unwrap(), 3);

        let failed = io_timeout(Duration::from_secs(1), async {
            Err::<(), _>(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
        })
        .await;
        assert!(matches!(failed, Err(Error::ConnectionFailed(_))));

        let slow = io_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, std::io::Error>(())
        })
        .await;
        assert!(matches!(slow, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_blocking_propagates_result() {
        assert_eq!(blocking(|| Ok(7)).await.unwrap(), 7);
        let err = blocking(|| Err::<(), _>(Error::storage("x"))).await;
        assert!(matches!(err, Err(Error::Storage(_))));
    }
}
