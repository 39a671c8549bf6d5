use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::{CacheGenerationManager, CacheResult, GenerationStore, PendingWrites};
use crate::cache::{ActivationOutcome, InstallReport};
use crate::error::{ActivationError, InstallError, NetworkFailure};
use crate::http::{Fetch, Request, Response};

use super::cache_first::cache_first;
use super::network_first::network_first;
use super::policy::{PolicySelector, RequestClass, Route};

/// Sits between the application and its origin.
///
/// Cross-origin requests go straight to the network. Same-origin requests are classified
/// and handed to the matching strategy. Until the first activation succeeds nothing is
/// intercepted.
pub struct Interceptor<S: GenerationStore, F: Fetch> {
  origin: Url,
  policy: PolicySelector,
  manager: Arc<CacheGenerationManager<S>>,
  fetcher: F,
  pending: PendingWrites,
}

impl<S: GenerationStore, F: Fetch> Interceptor<S, F> {
  pub fn new(
    origin: Url,
    policy: PolicySelector,
    manager: Arc<CacheGenerationManager<S>>,
    fetcher: F,
  ) -> Self {
    Self {
      origin,
      policy,
      manager,
      fetcher,
      pending: PendingWrites::new(),
    }
  }

  pub fn manager(&self) -> &Arc<CacheGenerationManager<S>> {
    &self.manager
  }

  /// Detached cache writes started by this interceptor.
  pub fn pending(&self) -> &PendingWrites {
    &self.pending
  }

  /// Install the static generation from the manifest.
  pub async fn boot(&self, manifest: &[String]) -> Result<InstallReport, InstallError> {
    self
      .manager
      .install(&self.fetcher, &self.origin, manifest)
      .await
  }

  /// Garbage collect stale generations and start intercepting.
  pub async fn activate(&self) -> Result<ActivationOutcome, ActivationError> {
    self.manager.activate().await
  }

  /// Handle one outbound request.
  ///
  /// `Err` only for network failures on paths that do not recover from them: pass-through
  /// traffic and static-asset cache misses. API requests always produce a response.
  pub async fn intercept(
    &self,
    request: &Request,
  ) -> Result<CacheResult<Response>, NetworkFailure> {
    if !self.manager.is_serving() {
      debug!(url = %request.url, state = %self.manager.state(), "Not active, passing through");
      return self.passthrough(request).await;
    }

    let result = match self.policy.route(&self.origin, &request.url) {
      Route::CrossOrigin => self.passthrough(request).await,
      Route::SameOrigin(RequestClass::Api) => {
        Ok(network_first(&self.manager, &self.fetcher, &self.pending, request).await)
      }
      Route::SameOrigin(RequestClass::Static) => {
        cache_first(&self.manager, &self.fetcher, &self.pending, request).await
      }
    };

    if let Ok(result) = &result {
      debug!(url = %request.url, source = %result.source, status = result.data.status, "Intercepted");
    }
    result
  }

  async fn passthrough(&self, request: &Request) -> Result<CacheResult<Response>, NetworkFailure> {
    self
      .fetcher
      .fetch(request)
      .await
      .map(CacheResult::passthrough)
  }
}
