//! Error types for the interception cache.

/// The network fetch did not produce a response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkFailure {
  /// Connection refused, DNS failure, TLS failure.
  #[error("connection to {url} failed: {message}")]
  Connect { url: String, message: String },

  /// The transport gave up waiting.
  #[error("request to {url} timed out")]
  Timeout { url: String },

  /// Anything else the transport reported (body read errors, redirects, ...).
  #[error("request to {url} failed: {message}")]
  Other { url: String, message: String },
}

impl NetworkFailure {
  pub fn url(&self) -> &str {
    match self {
      Self::Connect { url, .. } | Self::Timeout { url } | Self::Other { url, .. } => url,
    }
  }
}

/// Generation store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("storage backend error: {message}")]
  Backend { message: String },

  #[error("failed to (de)serialize cache entry: {message}")]
  Serialization { message: String },

  #[error("storage lock poisoned: {message}")]
  Lock { message: String },

  /// Storage failure while garbage collecting a generation.
  #[error("failed to delete generation {name}: {message}")]
  GenerationDelete { name: String, message: String },
}

impl StorageError {
  pub fn backend(e: impl std::fmt::Display) -> Self {
    Self::Backend {
      message: e.to_string(),
    }
  }
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    Self::backend(e)
  }
}

impl From<serde_json::Error> for StorageError {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization {
      message: e.to_string(),
    }
  }
}

/// BOOT failed; nothing from the manifest was persisted.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
  #[error("invalid manifest path {path}: {message}")]
  InvalidPath { path: String, message: String },

  #[error("manifest fetch for {path} failed: {source}")]
  Fetch {
    path: String,
    #[source]
    source: NetworkFailure,
  },

  #[error("manifest fetch for {path} returned status {status}")]
  Status { path: String, status: u16 },

  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// ACTIVATE failed; the previous lifecycle state is kept and the next activation retries.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
  #[error("activation requires an installed static generation (state: {state})")]
  NotInstalled { state: String },

  #[error(transparent)]
  Storage(#[from] StorageError),
}

pub type StorageResult<T> = Result<T, StorageError>;
