use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Outbound request descriptor
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }
}

/// Complete response: status, headers in wire order, body bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup (first match)
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
