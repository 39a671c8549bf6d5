//! Canned fetcher for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::NetworkFailure;

use super::client::Fetch;
use super::types::{Request, Response};

/// Serves canned responses per URL and counts every call.
///
/// Unknown URLs fail with a connect error, as if the network were down.
#[derive(Clone, Default)]
pub struct StubFetcher {
  routes: Arc<Mutex<HashMap<String, Response>>>,
  calls: Arc<AtomicUsize>,
  log: Arc<Mutex<Vec<String>>>,
}

impl StubFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) -> &Self {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
    self
  }

  /// Make a URL fail from now on.
  pub fn go_offline(&self, url: &str) {
    self.routes.lock().unwrap().remove(url);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self.log.lock().unwrap().iter().filter(|u| *u == url).count()
  }
}

impl Fetch for StubFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkFailure> {
    let url = request.url.to_string();
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.log.lock().unwrap().push(url.clone());

    let response = self.routes.lock().unwrap().get(&url).cloned();
    response.ok_or(NetworkFailure::Connect {
      url,
      message: "network unreachable".to_string(),
    })
  }
}
