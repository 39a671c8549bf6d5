//! Cache-first strategy for static assets.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{
  CacheGenerationManager, CacheResult, CanonicalKey, GenerationStore, PendingWrites,
};
use crate::error::NetworkFailure;
use crate::http::{Fetch, Request, Response};

/// Serve from the generations (static, then runtime) without touching the network; on a
/// miss, fetch and copy 2xx responses into the static generation in the background.
///
/// Network failures on a miss are returned as-is. A missing asset that cannot be fetched
/// was never installed, and masking that would hide a broken deployment.
pub async fn cache_first<S, F>(
  manager: &Arc<CacheGenerationManager<S>>,
  fetcher: &F,
  pending: &PendingWrites,
  request: &Request,
) -> Result<CacheResult<Response>, NetworkFailure>
where
  S: GenerationStore,
  F: Fetch,
{
  let key = CanonicalKey::for_request(request);

  match manager.lookup(&key) {
    Ok(Some(entry)) => return Ok(CacheResult::from_cache(entry.response, entry.cached_at)),
    Ok(None) => debug!(key = %key, "Static cache miss"),
    // Treat as a miss; the network may still have it
    Err(e) => warn!(key = %key, error = %e, "Static cache lookup failed"),
  }

  let response = fetcher.fetch(request).await?;

  if response.is_success() {
    let manager = Arc::clone(manager);
    let copy = response.clone();
    pending.spawn_blocking(move || {
      if let Err(e) = manager.put_static(&key, &copy) {
        warn!(key = %key, error = %e, "Failed to cache static asset");
      }
    });
  }

  Ok(CacheResult::from_network(response))
}
