//! Network-first strategy for API requests.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{
  CacheGenerationManager, CacheResult, CanonicalKey, GenerationStore, PendingWrites,
};
use crate::http::{offline_response, Fetch, Request, Response};

/// Serve from the network, falling back to the runtime generation, then to a synthesized
/// 503. Always yields a response.
///
/// 2xx responses are returned immediately and copied into the runtime generation in the
/// background. Other statuses are returned untouched and never cached.
pub async fn network_first<S, F>(
  manager: &Arc<CacheGenerationManager<S>>,
  fetcher: &F,
  pending: &PendingWrites,
  request: &Request,
) -> CacheResult<Response>
where
  S: GenerationStore,
  F: Fetch,
{
  let key = CanonicalKey::for_request(request);

  match fetcher.fetch(request).await {
    Ok(response) => {
      if response.is_success() {
        let manager = Arc::clone(manager);
        let copy = response.clone();
        pending.spawn_blocking(move || {
          if let Err(e) = manager.put_runtime(&key, &copy) {
            warn!(key = %key, error = %e, "Failed to cache API response");
          }
        });
      } else {
        debug!(key = %key, status = response.status, "Upstream error status, not caching");
      }
      CacheResult::from_network(response)
    }
    Err(failure) => {
      warn!(url = failure.url(), error = %failure, "Network failed, trying runtime cache");

      match manager.lookup_runtime(&key) {
        Ok(Some(entry)) => CacheResult::from_cache(entry.response, entry.cached_at),
        Ok(None) => CacheResult::synthesized(offline_response()),
        Err(e) => {
          warn!(key = %key, error = %e, "Runtime cache lookup failed");
          CacheResult::synthesized(offline_response())
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{GenerationId, ResponseSource, SqliteStorage};
  use crate::http::testing::StubFetcher;
  use url::Url;

  const URL: &str = "https://app.test/api/balance";

  fn setup() -> (Arc<CacheGenerationManager<SqliteStorage>>, StubFetcher, PendingWrites) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = CacheGenerationManager::new(
      storage,
      GenerationId::new("app-static", "v1"),
      GenerationId::new("app-runtime", "v1"),
    );
    (Arc::new(manager), StubFetcher::new(), PendingWrites::new())
  }

  fn request() -> Request {
    Request::get(Url::parse(URL).unwrap())
  }

  #[tokio::test]
  async fn test_success_is_returned_and_cached() {
    let (manager, fetcher, pending) = setup();
    fetcher.respond(URL, Response::new(200, r#"{"balance":10}"#));

    let result = network_first(&manager, &fetcher, &pending, &request()).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.data.body, br#"{"balance":10}"#);

    pending.flush().await;
    let entry = manager
      .lookup_runtime(&CanonicalKey::for_request(&request()))
      .unwrap()
      .expect("cached");
    assert_eq!(entry.response, result.data);
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_cached() {
    let (manager, fetcher, pending) = setup();
    fetcher.respond(URL, Response::new(500, "boom"));

    let result = network_first(&manager, &fetcher, &pending, &request()).await;
    assert_eq!(result.data.status, 500);
    assert_eq!(result.source, ResponseSource::Network);

    pending.flush().await;
    assert!(manager
      .lookup_runtime(&CanonicalKey::for_request(&request()))
      .unwrap()
      .is_none());
    assert!(!manager.storage().has_generation("app-runtime-v1").unwrap());
  }

  #[tokio::test]
  async fn test_error_status_does_not_replace_cached_entry() {
    let (manager, fetcher, pending) = setup();
    fetcher.respond(URL, Response::new(200, "good"));
    network_first(&manager, &fetcher, &pending, &request()).await;
    pending.flush().await;

    fetcher.respond(URL, Response::new(502, "bad gateway"));
    network_first(&manager, &fetcher, &pending, &request()).await;
    pending.flush().await;

    let entry = manager
      .lookup_runtime(&CanonicalKey::for_request(&request()))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response.body, b"good");
  }

  #[tokio::test]
  async fn test_network_failure_serves_runtime_entry() {
    let (manager, fetcher, pending) = setup();
    fetcher.respond(URL, Response::new(200, r#"{"balance":10}"#));
    network_first(&manager, &fetcher, &pending, &request()).await;
    pending.flush().await;

    fetcher.go_offline(URL);
    let result = network_first(&manager, &fetcher, &pending, &request()).await;

    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.data, Response::new(200, r#"{"balance":10}"#));
  }

  #[tokio::test]
  async fn test_network_failure_without_entry_synthesizes_offline_response() {
    let (manager, fetcher, pending) = setup();

    let result = network_first(&manager, &fetcher, &pending, &request()).await;

    assert_eq!(result.source, ResponseSource::Synthesized);
    assert_eq!(result.data, offline_response());
  }
}
