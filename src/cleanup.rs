use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::ResponseCache;

/// Drops expired cache entries. Wakes every `period`.
pub async fn cache_purge_loop(cache: Arc<ResponseCache>, period: Duration, cancel: CancellationToken) {
    info!(period = ?period, "cache purge started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cache purge shutting down");
                return;
            }
            _ = tokio::time::sleep(period) => {}
        }

        let purged = cache.purge_expired();
        if purged > 0 {
            info!(purged, remaining = cache.len(), "purged expired cache entries");
        } else {
            debug!(entries = cache.len(), "no expired cache entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedResponse;
    use crate::models::Backend;

    #[tokio::test]
    async fn purges_on_each_tick_until_cancelled() {
        let cache = Arc::new(ResponseCache::default());
        let response = CachedResponse {
            text: "x".to_string(),
            backend: Backend::Remote,
            model: "gpt-4".to_string(),
        };
        cache.set("stale", response.clone(), Duration::ZERO);
        cache.insert("fresh", response);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(cache_purge_loop(cache.clone(), Duration::from_millis(10), cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
