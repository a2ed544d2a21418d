use std::any::Any;
use std::marker::PhantomData;
use uuid::Uuid;

use crate::error::MutationError;

/// Opaque transaction id. Freshly generated per transaction, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(Uuid);

impl TxnId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for TxnId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Display for TxnId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

struct Snapshot {
  txn: TxnId,
  slice: String,
  prior: Box<dyn Any + Send + Sync>,
}

struct Slot {
  generation: u32,
  snapshot: Option<Snapshot>,
}

/// Move-only reference to one stored snapshot.
///
/// Not `Clone`: taking or discarding the snapshot consumes the handle,
/// so a snapshot is read at most once.
#[must_use = "a snapshot handle must be taken or discarded"]
pub struct SnapshotHandle<T> {
  index: usize,
  generation: u32,
  txn: TxnId,
  _marker: PhantomData<fn() -> T>,
}

impl<T> SnapshotHandle<T> {
  pub fn txn(&self) -> TxnId {
    self.txn
  }
}

impl<T> std::fmt::Debug for SnapshotHandle<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SnapshotHandle")
      .field("index", &self.index)
      .field("generation", &self.generation)
      .field("txn", &self.txn)
      .finish()
  }
}

/// Prior-state storage for in-flight transactions.
///
/// Slots are reused through a free list; bumping the generation on every
/// removal keeps a stale handle from reaching a newer snapshot.
#[derive(Default)]
pub struct SnapshotArena {
  slots: Vec<Slot>,
  free: Vec<usize>,
  len: usize,
}

impl SnapshotArena {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert<T: Send + Sync + 'static>(
    &mut self,
    txn: TxnId,
    slice: &str,
    prior: T,
  ) -> SnapshotHandle<T> {
    let snapshot = Snapshot {
      txn,
      slice: slice.to_string(),
      prior: Box::new(prior),
    };
    let index = match self.free.pop() {
      Some(index) => {
        self.slots[index].snapshot = Some(snapshot);
        index
      }
      None => {
        self.slots.push(Slot {
          generation: 0,
          snapshot: Some(snapshot),
        });
        self.slots.len() - 1
      }
    };
    self.len += 1;

    SnapshotHandle {
      index,
      generation: self.slots[index].generation,
      txn,
      _marker: PhantomData,
    }
  }

  /// Remove the snapshot and hand back the prior state.
  pub fn take<T: 'static>(&mut self, handle: SnapshotHandle<T>) -> Result<T, MutationError> {
    let snapshot = self.remove(handle.index, handle.generation, handle.txn)?;
    snapshot
      .prior
      .downcast::<T>()
      .map(|prior| *prior)
      .map_err(|_| MutationError::SnapshotType(handle.txn.to_string()))
  }

  /// Remove the snapshot without reading it.
  pub fn discard<T>(&mut self, handle: SnapshotHandle<T>) -> Result<(), MutationError> {
    self
      .remove(handle.index, handle.generation, handle.txn)
      .map(|_| ())
  }

  /// Slice names of the snapshots currently held, by transaction.
  pub fn pending(&self) -> Vec<(TxnId, String)> {
    self
      .slots
      .iter()
      .filter_map(|slot| slot.snapshot.as_ref())
      .map(|s| (s.txn, s.slice.clone()))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Drop every snapshot. Outstanding handles become dangling and their
  /// rollback reports a missing snapshot.
  pub fn clear(&mut self) {
    for (index, slot) in self.slots.iter_mut().enumerate() {
      if slot.snapshot.take().is_some() {
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
      }
    }
    self.len = 0;
  }

  fn remove(&mut self, index: usize, generation: u32, txn: TxnId) -> Result<Snapshot, MutationError> {
    let missing = || MutationError::SnapshotMissing(txn.to_string());
    let slot = self.slots.get_mut(index).ok_or_else(missing)?;
    if slot.generation != generation {
      return Err(missing());
    }
    let snapshot = slot.snapshot.take().ok_or_else(missing)?;
    slot.generation = slot.generation.wrapping_add(1);
    self.free.push(index);
    self.len -= 1;
    Ok(snapshot)
  }
}
