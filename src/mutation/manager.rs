use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::slice::Slice;
use super::snapshot::{SnapshotArena, SnapshotHandle, TxnId};
use crate::error::{FetchError, MutationError};

/// Transaction-scoped indicator updates.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent {
  Pending { txn: TxnId, label: String },
  Succeeded { txn: TxnId, label: String },
  Failed { txn: TxnId, label: String, error: MutationError },
  RolledBack { txn: TxnId, label: String },
}

impl MutationEvent {
  pub fn txn(&self) -> TxnId {
    match self {
      MutationEvent::Pending { txn, .. }
      | MutationEvent::Succeeded { txn, .. }
      | MutationEvent::Failed { txn, .. }
      | MutationEvent::RolledBack { txn, .. } => *txn,
    }
  }
}

struct Inner {
  snapshots: Mutex<SnapshotArena>,
  events: broadcast::Sender<MutationEvent>,
}

/// Applies local state changes ahead of server confirmation and restores
/// the prior state when the server says no.
#[derive(Clone)]
pub struct OptimisticManager {
  inner: Arc<Inner>,
}

impl Default for OptimisticManager {
  fn default() -> Self {
    Self::new()
  }
}

impl OptimisticManager {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(256);
    Self {
      inner: Arc::new(Inner {
        snapshots: Mutex::new(SnapshotArena::new()),
        events,
      }),
    }
  }

  pub fn events(&self) -> broadcast::Receiver<MutationEvent> {
    self.inner.events.subscribe()
  }

  /// Number of transactions still holding a snapshot.
  pub fn pending(&self) -> usize {
    self.inner.snapshots.lock().len()
  }

  /// Drop all stored snapshots. Any open transaction will fail to roll
  /// back.
  pub fn clear(&self) {
    self.inner.snapshots.lock().clear();
  }

  /// Open a transaction: new id, snapshot of the slice, pending event.
  pub fn begin<T>(&self, slice: &Slice<T>, label: &str) -> Transaction<T>
  where
    T: Clone + Send + Sync + 'static,
  {
    let txn = TxnId::new();
    let handle = self
      .inner
      .snapshots
      .lock()
      .insert(txn, slice.name(), slice.get());
    tracing::debug!(%txn, slice = slice.name(), label, "optimistic transaction started");
    self.emit(MutationEvent::Pending {
      txn,
      label: label.to_string(),
    });

    Transaction {
      manager: self.clone(),
      slice: slice.clone(),
      label: label.to_string(),
      txn,
      handle: Some(handle),
    }
  }

  /// Run the full protocol: snapshot, apply locally, call the network,
  /// then commit or roll back.
  pub async fn mutate<T, R, A, N, Fut>(
    &self,
    slice: &Slice<T>,
    label: &str,
    apply: A,
    network: N,
  ) -> Result<R, MutationError>
  where
    T: Clone + Send + Sync + 'static,
    A: FnOnce(&mut T),
    N: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, MutationError>>,
  {
    let mut txn = self.begin(slice, label);
    txn.apply(apply);
    match network().await {
      Ok(value) => {
        txn.commit()?;
        Ok(value)
      }
      Err(e) => {
        txn.rollback(e.clone())?;
        Err(e)
      }
    }
  }

  /// [`mutate`](Self::mutate), then replace the slice with authoritative
  /// server state so derived fields the local guess got wrong are fixed.
  /// A failed reconcile leaves the optimistic state in place.
  pub async fn mutate_and_reconcile<T, R, A, N, Fut, C, CFut>(
    &self,
    slice: &Slice<T>,
    label: &str,
    apply: A,
    network: N,
    reconcile: C,
  ) -> Result<R, MutationError>
  where
    T: Clone + Send + Sync + 'static,
    A: FnOnce(&mut T),
    N: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, MutationError>>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = Result<T, FetchError>>,
  {
    let value = self.mutate(slice, label, apply, network).await?;
    match reconcile().await {
      Ok(authoritative) => {
        slice.replace(authoritative);
      }
      Err(e) => tracing::warn!(slice = slice.name(), "reconcile after {} failed: {}", label, e),
    }
    Ok(value)
  }

  fn emit(&self, event: MutationEvent) {
    let _ = self.inner.events.send(event);
  }
}

/// One optimistic mutation in progress.
///
/// Finishes exactly once: through [`commit`](Self::commit),
/// [`rollback`](Self::rollback), or by rolling back on drop.
#[must_use = "dropping a transaction rolls it back"]
pub struct Transaction<T: Clone + Send + Sync + 'static> {
  manager: OptimisticManager,
  slice: Slice<T>,
  label: String,
  txn: TxnId,
  handle: Option<SnapshotHandle<T>>,
}

impl<T: Clone + Send + Sync + 'static> Transaction<T> {
  pub fn id(&self) -> TxnId {
    self.txn
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  /// Write the optimistic change to the slice.
  pub fn apply(&mut self, f: impl FnOnce(&mut T)) {
    self.slice.update(f);
  }

  /// Server accepted: discard the snapshot.
  pub fn commit(mut self) -> Result<(), MutationError> {
    let Some(handle) = self.handle.take() else {
      return Err(MutationError::SnapshotMissing(self.txn.to_string()));
    };
    self.manager.inner.snapshots.lock().discard(handle)?;
    tracing::debug!(txn = %self.txn, label = %self.label, "optimistic transaction committed");
    self.manager.emit(MutationEvent::Succeeded {
      txn: self.txn,
      label: self.label.clone(),
    });
    Ok(())
  }

  /// Server rejected: restore the snapshot and discard it.
  pub fn rollback(mut self, error: MutationError) -> Result<(), MutationError> {
    self.restore(error)
  }

  fn restore(&mut self, error: MutationError) -> Result<(), MutationError> {
    tracing::info!(txn = %self.txn, label = %self.label, "rolling back: {}", error);
    self.manager.emit(MutationEvent::Failed {
      txn: self.txn,
      label: self.label.clone(),
      error,
    });

    let prior = match self.handle.take() {
      Some(handle) => self.manager.inner.snapshots.lock().take(handle),
      None => Err(MutationError::SnapshotMissing(self.txn.to_string())),
    };
    match prior {
      Ok(prior) => {
        self.slice.replace(prior);
        self.manager.emit(MutationEvent::RolledBack {
          txn: self.txn,
          label: self.label.clone(),
        });
        Ok(())
      }
      Err(e) => {
        tracing::error!(
          txn = %self.txn,
          slice = self.slice.name(),
          "rollback impossible, state left as is: {}",
          e
        );
        Err(e)
      }
    }
  }
}

impl<T: Clone + Send + Sync + 'static> Drop for Transaction<T> {
  fn drop(&mut self) {
    if self.handle.is_some() {
      let _ = self.restore(MutationError::rejected("transaction dropped before completing"));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_event_sequence_on_failure() {
    let manager = OptimisticManager::new();
    let slice = Slice::new("rows", vec![1, 2, 3]);
    let mut events = manager.events();

    let result: Result<(), _> = manager
      .mutate(
        &slice,
        "delete 2",
        |rows| rows.retain(|r| *r != 2),
        || async { Err(MutationError::rejected("conflict")) },
      )
      .await;
    assert_eq!(result, Err(MutationError::rejected("conflict")));
    assert_eq!(slice.get(), vec![1, 2, 3]);

    assert!(matches!(events.recv().await, Ok(MutationEvent::Pending { .. })));
    assert!(matches!(events.recv().await, Ok(MutationEvent::Failed { .. })));
    assert!(matches!(events.recv().await, Ok(MutationEvent::RolledBack { .. })));
    assert_eq!(manager.pending(), 0);
  }

  #[test]
  fn test_commit_keeps_optimistic_state() {
    let manager = OptimisticManager::new();
    let slice = Slice::new("rows", vec![1, 2, 3]);
    let mut txn = manager.begin(&slice, "delete 3");
    txn.apply(|rows| {
      rows.pop();
    });
    assert_eq!(manager.pending(), 1);
    txn.commit().unwrap();
    assert_eq!(slice.get(), vec![1, 2]);
    assert_eq!(manager.pending(), 0);
  }

  #[test]
  fn test_drop_rolls_back() {
    let manager = OptimisticManager::new();
    let slice = Slice::new("rows", vec![1, 2, 3]);
    {
      let mut txn = manager.begin(&slice, "clear");
      txn.apply(|rows| rows.clear());
      assert!(slice.get().is_empty());
    }
    assert_eq!(slice.get(), vec![1, 2, 3]);
    assert_eq!(manager.pending(), 0);
  }

  #[test]
  fn test_missing_snapshot_fails_loudly() {
    let manager = OptimisticManager::new();
    let slice = Slice::new("rows", vec![1]);
    let mut txn = manager.begin(&slice, "push");
    txn.apply(|rows| rows.push(2));
    manager.clear();

    let result = txn.rollback(MutationError::rejected("offline"));
    assert!(matches!(result, Err(MutationError::SnapshotMissing(_))));
    // no snapshot, nothing restored
    assert_eq!(slice.get(), vec![1, 2]);
  }

  #[test]
  fn test_concurrent_transactions_restore_their_own_snapshot() {
    let manager = OptimisticManager::new();
    let a = Slice::new("a", 1u32);
    let b = Slice::new("b", 10u32);

    let mut ta = manager.begin(&a, "a");
    let mut tb = manager.begin(&b, "b");
    ta.apply(|v| *v = 2);
    tb.apply(|v| *v = 20);

    tb.rollback(MutationError::rejected("no")).unwrap();
    ta.commit().unwrap();
    assert_eq!(a.get(), 2);
    assert_eq!(b.get(), 10);
    assert_ne!(manager.begin(&a, "x").id(), manager.begin(&a, "y").id());
  }
}
