//! Core types for the generation cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::Request;

/// Canonical request identity: the (method, URL) pair entries are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
  method: String,
  url: String,
}

impl CanonicalKey {
  pub fn new(method: &reqwest::Method, url: &Url) -> Self {
    // Fragments never reach the origin, so they never distinguish entries
    let mut url = url.clone();
    url.set_fragment(None);

    Self {
      method: method.as_str().to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  /// Rebuild a key read back from storage, already canonical.
  pub(crate) fn from_stored(method: String, url: String) -> Self {
    Self { method, url }
  }

  pub fn for_request(request: &Request) -> Self {
    Self::new(&request.method, &request.url)
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CanonicalKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A named, versioned cache namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationId {
  pub name: String,
  pub version: String,
}

impl GenerationId {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
    }
  }

  /// Name the generation is stored under, e.g. `app-static-v1`.
  pub fn storage_name(&self) -> String {
    format!("{}-{}", self.name, self.version)
  }
}

impl fmt::Display for GenerationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.storage_name())
  }
}

/// Result of an interception, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: ResponseSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn synthesized(data: T) -> Self {
    Self {
      data,
      source: ResponseSource::Synthesized,
      cached_at: None,
    }
  }

  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: ResponseSource::Passthrough,
      cached_at: None,
    }
  }
}

/// Indicates which branch produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live network response
  Network,
  /// Stored entry from a generation
  Cache,
  /// Offline fallback built locally
  Synthesized,
  /// Not handled by the cache at all (cross-origin, or not yet ready)
  Passthrough,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Synthesized => "synthesized",
      Self::Passthrough => "passthrough",
    };
    f.write_str(s)
  }
}
