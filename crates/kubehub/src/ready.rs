//! Readiness waiter: retry a cheap probe at a fixed interval until it passes.
//!
//! There is no built-in deadline; callers bound the wait with the
//! cancellation token.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use k8test_core::ResourceError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub async fn wait_until_ready<F, Fut>(cancel: &CancellationToken, interval: Duration, what: &str, mut probe: F) -> Result<()>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ResourceError::Cancelled(what.to_string()).into()),
            res = probe() => res,
        };
        match outcome {
            Ok(()) => {
                debug!(what, attempts, "ready");
                return Ok(());
            }
            Err(e) => debug!(what, attempts, error = %e, "not ready yet"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(ResourceError::Cancelled(what.to_string()).into()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Connect-and-disconnect probe.
pub async fn tcp_probe(address: &str, port: i32) -> Result<()> {
    let port = u16::try_from(port).with_context(|| format!("invalid port {}", port))?;
    let stream = tokio::net::TcpStream::connect((address, port)).await.with_context(|| format!("connecting to {}:{}", address, port))?;
    drop(stream);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_until_probe_passes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let cancel = CancellationToken::new();
        wait_until_ready(&cancel, Duration::from_millis(5), "flaky", move || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 { Err(anyhow::anyhow!("not yet")) } else { Ok(()) }
            }
        })
        .await
        .expect("ready");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_ends_the_wait() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });
        let err = wait_until_ready(&cancel, Duration::from_millis(5), "never", || async { Err(anyhow::anyhow!("down")) }).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ResourceError>(), Some(ResourceError::Cancelled(w)) if w == "never"));
    }

    #[tokio::test]
    async fn tcp_probe_reaches_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port() as i32;
        tcp_probe("127.0.0.1", port).await.expect("connects");
        assert!(tcp_probe("127.0.0.1", -1).await.is_err());
    }
}
