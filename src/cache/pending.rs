//! Tracking for cache writes that outlive the request that triggered them.

use std::future::poll_fn;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::warn;

/// Set of detached cache writes still in flight.
///
/// Strategies hand their write-after-return work to this set instead of spawning it
/// loose, so shutdown can wait for it with [`PendingWrites::flush`] or drop it with
/// [`PendingWrites::abandon`].
#[derive(Default)]
pub struct PendingWrites {
  tasks: Mutex<JoinSet<()>>,
  abandoned: Notify,
}

impl PendingWrites {
  pub fn new() -> Self {
    Self::default()
  }

  fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
    // A panicked writer cannot leave the set itself inconsistent
    self.tasks.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Run a blocking storage write in the background.
  pub fn spawn_blocking<F>(&self, write: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let mut tasks = self.tasks();
    // Reap finished writes so the set only holds live ones
    while tasks.try_join_next().is_some() {}
    tasks.spawn_blocking(write);
  }

  /// Number of writes not yet reaped.
  pub fn len(&self) -> usize {
    self.tasks().len()
  }

  /// Wait for every in-flight write, including ones spawned while waiting.
  /// Returns how many writes were awaited.
  ///
  /// Writes stay in the shared set until they finish, so `len` and `abandon` still see
  /// them. An abandon ends the flush.
  pub async fn flush(&self) -> usize {
    let mut completed = 0;
    loop {
      let abandoned = self.abandoned.notified();
      // The lock is held only for a single poll, never across an await
      let next = poll_fn(|cx| self.tasks().poll_join_next(cx));

      let result = tokio::select! {
        result = next => result,
        _ = abandoned => return completed,
      };

      match result {
        None => return completed,
        Some(Err(e)) => warn!(error = %e, "Detached cache write did not complete"),
        Some(Ok(())) => {}
      }
      completed += 1;
    }
  }

  /// Abort writes that have not started; no retry. Returns how many were dropped.
  pub fn abandon(&self) -> usize {
    let batch = std::mem::take(&mut *self.tasks());
    let dropped = batch.len();
    // Dropping a JoinSet aborts everything in it
    drop(batch);
    self.abandoned.notify_waiters();
    dropped
  }
}
