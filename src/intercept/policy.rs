use url::Url;

/// Caching policy class of a same-origin request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Under the API prefix: network-first
  Api,
  /// Everything else: cache-first
  Static,
}

/// Where an intercepted request goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Different origin: passed through, never classified or cached
  CrossOrigin,
  SameOrigin(RequestClass),
}

/// Maps request paths to a policy class.
#[derive(Debug, Clone)]
pub struct PolicySelector {
  api_prefix: String,
}

impl PolicySelector {
  pub fn new(api_prefix: impl Into<String>) -> Self {
    Self {
      api_prefix: api_prefix.into(),
    }
  }

  pub fn classify(&self, path: &str) -> RequestClass {
    if path.starts_with(&self.api_prefix) {
      RequestClass::Api
    } else {
      RequestClass::Static
    }
  }

  /// Filter cross-origin requests, then classify the rest.
  pub fn route(&self, origin: &Url, url: &Url) -> Route {
    if url.origin() != origin.origin() {
      return Route::CrossOrigin;
    }
    Route::SameOrigin(self.classify(url.path()))
  }
}
