//! Blocking readiness probes: poll a predicate or an HTTP readiness URL
//! until success. Used by sidecar mode to wait on the co-located service
//! before the Registrar starts consuming, and by the Broker/Registrar
//! startup path to wait on `ensure_can_connect`.

use std::future::Future;
use std::time::Duration;

const WAIT_FOR_PREDICATE_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_FOR_API_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_FOR_API_TIMEOUT: Duration = Duration::from_secs(60);

/// Polls `predicate` until it resolves to `true`, sleeping
/// [`WAIT_FOR_PREDICATE_INTERVAL`] between attempts.
pub async fn wait_for_true<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        if predicate().await {
            return;
        }
        tokio::time::sleep(WAIT_FOR_PREDICATE_INTERVAL).await;
    }
}

/// Polls `url` with `GET` until it returns a status `< 300`, used in
/// sidecar mode to wait on the co-located service's readiness endpoint.
pub async fn wait_for_api(client: &reqwest::Client, url: &str) {
    loop {
        match client.get(url).timeout(WAIT_FOR_API_TIMEOUT).send().await {
            Ok(response) if response.status().as_u16() < 300 => {
                tracing::info!(url, "readiness check succeeded");
                return;
            }
            Ok(response) => {
                tracing::warn!(url, status = response.status().as_u16(), "main API is not ready");
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "main API is not ready");
            }
        }
        tokio::time::sleep(WAIT_FOR_API_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn wait_for_true_returns_once_predicate_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        wait_for_true(move || {
            let attempts = attempts_clone.clone();
            async move { attempts.fetch_add(1, Ordering::SeqCst) >= 2 }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
