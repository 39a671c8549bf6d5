//! Versioned cache generations and their install/activate lifecycle.

use futures::future::try_join_all;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ActivationError, InstallError, StorageResult};
use crate::http::{Fetch, Request, Response};

use super::storage::{CachedEntry, GenerationStore};
use super::traits::{CanonicalKey, GenerationId};

/// Lifecycle of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  /// Started; static generation not installed yet
  Boot,
  /// Static generation fully installed; not serving
  Installed,
  /// Garbage collection of stale generations in progress
  Activating,
  /// Serving intercepted requests
  Ready,
}

impl fmt::Display for Lifecycle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Boot => "boot",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Ready => "ready",
    };
    f.write_str(s)
  }
}

/// What BOOT did.
#[derive(Debug, Clone)]
pub struct InstallReport {
  pub generation: String,
  /// Manifest entries written
  pub installed: usize,
  /// The generation already existed, nothing was fetched
  pub reused: bool,
}

/// What ACTIVATE did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
  /// Stale generations deleted, now ready
  Activated { deleted: Vec<String> },
  /// Another activation was already running
  Skipped,
}

/// Owns the static and runtime generations.
///
/// The static generation is filled once from the deployment manifest; the runtime
/// generation is created by the first successful API fetch. Generations whose names are
/// not current are deleted on activation.
pub struct CacheGenerationManager<S: GenerationStore> {
  storage: Arc<S>,
  static_gen: GenerationId,
  runtime_gen: GenerationId,
  state: watch::Sender<Lifecycle>,
  /// Set once the first activation succeeds; later activations keep serving
  serving: AtomicBool,
  activation: Mutex<()>,
}

impl<S: GenerationStore> CacheGenerationManager<S> {
  pub fn new(storage: Arc<S>, static_gen: GenerationId, runtime_gen: GenerationId) -> Self {
    let (state, _) = watch::channel(Lifecycle::Boot);
    Self {
      storage,
      static_gen,
      runtime_gen,
      state,
      serving: AtomicBool::new(false),
      activation: Mutex::new(()),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn static_generation(&self) -> &GenerationId {
    &self.static_gen
  }

  pub fn runtime_generation(&self) -> &GenerationId {
    &self.runtime_gen
  }

  pub fn state(&self) -> Lifecycle {
    *self.state.borrow()
  }

  #[cfg(test)]
  pub fn is_ready(&self) -> bool {
    self.state() == Lifecycle::Ready
  }

  /// Whether requests should go through the strategies. Stays true while a repeat
  /// activation is collecting garbage.
  pub fn is_serving(&self) -> bool {
    self.serving.load(Ordering::Acquire)
  }

  /// Watch lifecycle transitions.
  pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
    self.state.subscribe()
  }

  /// Wait until no activation is running and return the state it left behind.
  pub async fn settled(&self) -> Lifecycle {
    let mut rx = self.subscribe();
    let settled = match rx.wait_for(|state| *state != Lifecycle::Activating).await {
      Ok(state) => *state,
      Err(_) => self.state(),
    };
    settled
  }

  /// Boot -> Installed; an installed or serving cache keeps its state.
  fn mark_installed(&self) {
    self.state.send_if_modified(|state| {
      if *state == Lifecycle::Boot {
        *state = Lifecycle::Installed;
        true
      } else {
        false
      }
    });
  }

  /// BOOT: fetch every manifest path and store them as the static generation.
  ///
  /// All-or-nothing: a failed or non-2xx fetch aborts before anything is written, and the
  /// write itself is a single transaction.
  pub async fn install<F: Fetch>(
    &self,
    fetcher: &F,
    origin: &Url,
    manifest: &[String],
  ) -> Result<InstallReport, InstallError> {
    let name = self.static_gen.storage_name();

    if self.storage.has_generation(&name)? {
      debug!(generation = %name, "Static generation already installed");
      self.mark_installed();
      return Ok(InstallReport {
        generation: name,
        installed: 0,
        reused: true,
      });
    }

    let requests = manifest
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map(|url| (path.as_str(), Request::get(url)))
          .map_err(|e| InstallError::InvalidPath {
            path: path.clone(),
            message: e.to_string(),
          })
      })
      .collect::<Result<Vec<_>, _>>()?;

    info!(generation = %name, paths = requests.len(), "Installing static generation");

    let entries = try_join_all(requests.iter().map(|(path, request)| async move {
      let response = fetcher
        .fetch(request)
        .await
        .map_err(|source| InstallError::Fetch {
          path: path.to_string(),
          source,
        })?;

      if !response.is_success() {
        return Err(InstallError::Status {
          path: path.to_string(),
          status: response.status,
        });
      }

      Ok((CanonicalKey::for_request(request), response))
    }))
    .await?;

    self.storage.put_all(&self.static_gen, &entries)?;
    self.mark_installed();

    info!(generation = %name, installed = entries.len(), "Static generation installed");

    Ok(InstallReport {
      generation: name,
      installed: entries.len(),
      reused: false,
    })
  }

  /// ACTIVATE: delete every generation that is not current, then start serving.
  ///
  /// Not re-entrant: a call made while another is running returns `Skipped`. On a delete
  /// failure the previous state is restored so the next activation retries. A cache that
  /// is already serving keeps serving while a repeat activation runs.
  pub async fn activate(&self) -> Result<ActivationOutcome, ActivationError> {
    let Ok(_guard) = self.activation.try_lock() else {
      debug!("Activation already in progress");
      return Ok(ActivationOutcome::Skipped);
    };

    let previous = self.state();
    if previous == Lifecycle::Boot {
      return Err(ActivationError::NotInstalled {
        state: previous.to_string(),
      });
    }

    self.state.send_replace(Lifecycle::Activating);

    match self.delete_stale_generations() {
      Ok(deleted) => {
        self.state.send_replace(Lifecycle::Ready);
        self.serving.store(true, Ordering::Release);
        info!(deleted = deleted.len(), "Cache activated");
        Ok(ActivationOutcome::Activated { deleted })
      }
      Err(e) => {
        warn!(error = %e, "Activation failed, will retry on next activation");
        self.state.send_replace(previous);
        Err(e.into())
      }
    }
  }

  fn delete_stale_generations(&self) -> StorageResult<Vec<String>> {
    let keep = [
      self.static_gen.storage_name(),
      self.runtime_gen.storage_name(),
    ];

    let mut deleted = Vec::new();
    for generation in self.storage.generations()? {
      if keep.contains(&generation.name) {
        continue;
      }
      self.storage.delete_generation(&generation.name)?;
      info!(generation = %generation.name, entries = generation.entries, "Deleted stale generation");
      deleted.push(generation.name);
    }

    Ok(deleted)
  }

  /// Look a key up in the static generation, then the runtime one.
  pub fn lookup(&self, key: &CanonicalKey) -> StorageResult<Option<CachedEntry>> {
    if let Some(entry) = self.storage.get(&self.static_gen.storage_name(), key)? {
      return Ok(Some(entry));
    }
    self.lookup_runtime(key)
  }

  pub fn lookup_runtime(&self, key: &CanonicalKey) -> StorageResult<Option<CachedEntry>> {
    self.storage.get(&self.runtime_gen.storage_name(), key)
  }

  pub fn put_static(&self, key: &CanonicalKey, response: &Response) -> StorageResult<()> {
    self.storage.put(&self.static_gen, key, response)
  }

  pub fn put_runtime(&self, key: &CanonicalKey, response: &Response) -> StorageResult<()> {
    self.storage.put(&self.runtime_gen, key, response)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{GenerationInfo, SqliteStorage};
  use crate::error::StorageError;
  use crate::http::testing::StubFetcher;
  use reqwest::Method;
  use std::sync::atomic::AtomicUsize;

  /// SQLite store whose next `n` generation deletes fail.
  struct FailingDeletes {
    inner: SqliteStorage,
    failures: AtomicUsize,
  }

  impl FailingDeletes {
    fn new() -> Self {
      Self {
        inner: SqliteStorage::open_in_memory().unwrap(),
        failures: AtomicUsize::new(0),
      }
    }

    fn fail_next(&self, n: usize) {
      self.failures.store(n, Ordering::SeqCst);
    }
  }

  impl GenerationStore for FailingDeletes {
    fn has_generation(&self, name: &str) -> StorageResult<bool> {
      self.inner.has_generation(name)
    }

    fn generations(&self) -> StorageResult<Vec<GenerationInfo>> {
      self.inner.generations()
    }

    fn get(&self, generation: &str, key: &CanonicalKey) -> StorageResult<Option<CachedEntry>> {
      self.inner.get(generation, key)
    }

    fn put(
      &self,
      generation: &GenerationId,
      key: &CanonicalKey,
      response: &Response,
    ) -> StorageResult<()> {
      self.inner.put(generation, key, response)
    }

    fn put_all(
      &self,
      generation: &GenerationId,
      entries: &[(CanonicalKey, Response)],
    ) -> StorageResult<()> {
      self.inner.put_all(generation, entries)
    }

    fn keys(&self, generation: &str) -> StorageResult<Vec<CanonicalKey>> {
      self.inner.keys(generation)
    }

    fn delete_generation(&self, name: &str) -> StorageResult<bool> {
      let failing = self
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
      if failing {
        return Err(StorageError::GenerationDelete {
          name: name.to_string(),
          message: "disk I/O error".to_string(),
        });
      }
      self.inner.delete_generation(name)
    }
  }

  const ORIGIN: &str = "https://app.test";

  fn origin() -> Url {
    Url::parse(ORIGIN).unwrap()
  }

  fn manifest() -> Vec<String> {
    vec!["/".into(), "/manifest.json".into(), "/icon-192.png".into()]
  }

  fn serving_manifest() -> StubFetcher {
    let fetcher = StubFetcher::new();
    fetcher
      .respond("https://app.test/", Response::new(200, "<html>"))
      .respond("https://app.test/manifest.json", Response::new(200, "{}"))
      .respond("https://app.test/icon-192.png", Response::new(200, vec![0x89, 0x50]));
    fetcher
  }

  fn manager(storage: Arc<SqliteStorage>, version: &str) -> CacheGenerationManager<SqliteStorage> {
    CacheGenerationManager::new(
      storage,
      GenerationId::new("app-static", version),
      GenerationId::new("app-runtime", version),
    )
  }

  fn key(path: &str) -> CanonicalKey {
    CanonicalKey::new(&Method::GET, &origin().join(path).unwrap())
  }

  fn manifest_keys() -> Vec<CanonicalKey> {
    let mut keys: Vec<_> = manifest().iter().map(|p| key(p)).collect();
    keys.sort_by(|a, b| a.url().cmp(b.url()));
    keys
  }

  #[tokio::test]
  async fn test_install_stores_manifest() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage.clone(), "v1");
    let fetcher = serving_manifest();

    let report = manager
      .install(&fetcher, &origin(), &manifest())
      .await
      .unwrap();

    assert_eq!(report.installed, 3);
    assert!(!report.reused);
    assert_eq!(manager.state(), Lifecycle::Installed);
    assert_eq!(storage.keys("app-static-v1").unwrap(), manifest_keys());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage.clone(), "v1");
    let fetcher = serving_manifest();
    fetcher.go_offline("https://app.test/icon-192.png");

    let result = manager.install(&fetcher, &origin(), &manifest()).await;

    assert!(matches!(result, Err(InstallError::Fetch { ref path, .. }) if path == "/icon-192.png"));
    assert_eq!(manager.state(), Lifecycle::Boot);
    assert!(!storage.has_generation("app-static-v1").unwrap());
  }

  #[tokio::test]
  async fn test_install_rejects_error_status() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage.clone(), "v1");
    let fetcher = serving_manifest();
    fetcher.respond("https://app.test/manifest.json", Response::new(404, "missing"));

    let result = manager.install(&fetcher, &origin(), &manifest()).await;

    assert!(matches!(result, Err(InstallError::Status { status: 404, .. })));
    assert!(!storage.has_generation("app-static-v1").unwrap());
  }

  #[tokio::test]
  async fn test_install_reuses_existing_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = serving_manifest();
    manager(storage.clone(), "v1")
      .install(&fetcher, &origin(), &manifest())
      .await
      .unwrap();
    let calls = fetcher.calls();

    let second = manager(storage, "v1");
    let report = second.install(&fetcher, &origin(), &manifest()).await.unwrap();

    assert!(report.reused);
    assert_eq!(fetcher.calls(), calls);
    assert_eq!(second.state(), Lifecycle::Installed);
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage, "v1");

    let result = manager.activate().await;
    assert!(matches!(result, Err(ActivationError::NotInstalled { .. })));
    assert!(!manager.is_ready());
  }

  #[tokio::test]
  async fn test_rollover_deletes_previous_generations() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = serving_manifest();

    let old = manager(storage.clone(), "v1");
    old.install(&fetcher, &origin(), &manifest()).await.unwrap();
    old.activate().await.unwrap();
    old.put_runtime(&key("/api/me"), &Response::new(200, "me")).unwrap();
    old.put_static(&key("/app.js"), &Response::new(200, "js")).unwrap();

    let new = manager(storage.clone(), "v2");
    new.install(&fetcher, &origin(), &manifest()).await.unwrap();
    let outcome = new.activate().await.unwrap();

    assert_eq!(
      outcome,
      ActivationOutcome::Activated {
        deleted: vec!["app-runtime-v1".to_string(), "app-static-v1".to_string()],
      }
    );
    assert!(new.is_ready());

    let names: Vec<String> = storage
      .generations()
      .unwrap()
      .into_iter()
      .map(|g| g.name)
      .collect();
    assert_eq!(names, vec!["app-static-v2".to_string()]);
    assert_eq!(storage.keys("app-static-v2").unwrap(), manifest_keys());

    // Entries written before the rollover are gone
    assert!(new.lookup(&key("/api/me")).unwrap().is_none());
    assert!(new.lookup(&key("/app.js")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_activate_keeps_current_runtime_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage, "v1");
    manager
      .install(&serving_manifest(), &origin(), &manifest())
      .await
      .unwrap();
    manager.activate().await.unwrap();
    manager.put_runtime(&key("/api/me"), &Response::new(200, "me")).unwrap();

    let outcome = manager.activate().await.unwrap();

    assert_eq!(outcome, ActivationOutcome::Activated { deleted: vec![] });
    assert!(manager.lookup_runtime(&key("/api/me")).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_concurrent_activation_is_skipped() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage, "v1");
    manager
      .install(&serving_manifest(), &origin(), &manifest())
      .await
      .unwrap();

    let guard = manager.activation.lock().await;
    assert_eq!(manager.activate().await.unwrap(), ActivationOutcome::Skipped);
    drop(guard);

    assert!(matches!(
      manager.activate().await.unwrap(),
      ActivationOutcome::Activated { .. }
    ));
  }

  #[tokio::test]
  async fn test_lookup_prefers_static_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage, "v1");
    manager.put_runtime(&key("/logo.svg"), &Response::new(200, "runtime")).unwrap();
    manager.put_static(&key("/logo.svg"), &Response::new(200, "static")).unwrap();

    let entry = manager.lookup(&key("/logo.svg")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"static");
  }

  #[tokio::test]
  async fn test_reinstall_does_not_leave_ready() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage, "v1");
    let fetcher = serving_manifest();
    manager.install(&fetcher, &origin(), &manifest()).await.unwrap();
    manager.activate().await.unwrap();

    let report = manager.install(&fetcher, &origin(), &manifest()).await.unwrap();

    assert!(report.reused);
    assert_eq!(manager.state(), Lifecycle::Ready);
    assert!(manager.is_serving());
  }

  #[tokio::test]
  async fn test_failed_delete_restores_state_and_retries() {
    let storage = Arc::new(FailingDeletes::new());
    let fetcher = serving_manifest();
    let old = CacheGenerationManager::new(
      storage.clone(),
      GenerationId::new("app-static", "v1"),
      GenerationId::new("app-runtime", "v1"),
    );
    old.install(&fetcher, &origin(), &manifest()).await.unwrap();

    let new = CacheGenerationManager::new(
      storage.clone(),
      GenerationId::new("app-static", "v2"),
      GenerationId::new("app-runtime", "v2"),
    );
    new.install(&fetcher, &origin(), &manifest()).await.unwrap();
    storage.fail_next(1);

    let result = new.activate().await;
    assert!(matches!(
      result,
      Err(ActivationError::Storage(StorageError::GenerationDelete { ref name, .. }))
        if name == "app-static-v1"
    ));
    assert_eq!(new.state(), Lifecycle::Installed);
    assert!(!new.is_serving());
    assert!(storage.has_generation("app-static-v1").unwrap());

    let outcome = new.activate().await.unwrap();
    assert_eq!(
      outcome,
      ActivationOutcome::Activated {
        deleted: vec!["app-static-v1".to_string()],
      }
    );
    assert!(new.is_ready());
    assert!(!storage.has_generation("app-static-v1").unwrap());
  }

  #[tokio::test]
  async fn test_failed_repeat_activation_keeps_serving() {
    let storage = Arc::new(FailingDeletes::new());
    let manager = CacheGenerationManager::new(
      storage.clone(),
      GenerationId::new("app-static", "v1"),
      GenerationId::new("app-runtime", "v1"),
    );
    manager
      .install(&serving_manifest(), &origin(), &manifest())
      .await
      .unwrap();
    manager.activate().await.unwrap();

    storage
      .put(&GenerationId::new("legacy", "v0"), &key("/"), &Response::new(200, "old"))
      .unwrap();
    storage.fail_next(1);

    assert!(manager.activate().await.is_err());
    assert_eq!(manager.state(), Lifecycle::Ready);
    assert!(manager.is_serving());
  }

  #[tokio::test]
  async fn test_settled_reports_state_after_activation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = manager(storage, "v1");
    assert_eq!(manager.settled().await, Lifecycle::Boot);

    manager
      .install(&serving_manifest(), &origin(), &manifest())
      .await
      .unwrap();
    let mut changes = manager.subscribe();
    manager.activate().await.unwrap();

    assert!(changes.has_changed().unwrap());
    assert_eq!(*changes.borrow_and_update(), Lifecycle::Ready);
    assert_eq!(manager.settled().await, Lifecycle::Ready);
  }
}
