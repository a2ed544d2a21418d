use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// A named piece of shared application state that optimistic mutations
/// write to. Clones share the same state.
pub struct Slice<T> {
  name: Arc<str>,
  state: Arc<RwLock<T>>,
  version: Arc<watch::Sender<u64>>,
}

impl<T> Clone for Slice<T> {
  fn clone(&self) -> Self {
    Self {
      name: self.name.clone(),
      state: self.state.clone(),
      version: self.version.clone(),
    }
  }
}

impl<T> Slice<T> {
  pub fn new(name: &str, initial: T) -> Self {
    let (version, _) = watch::channel(0);
    Self {
      name: Arc::from(name),
      state: Arc::new(RwLock::new(initial)),
      version: Arc::new(version),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
    f(&self.state.read())
  }

  /// Mutate in place and bump the version. Returns the new version.
  pub fn update(&self, f: impl FnOnce(&mut T)) -> u64 {
    f(&mut self.state.write());
    self.bump()
  }

  /// Swap in a whole new value, returning the old one.
  pub fn replace(&self, value: T) -> T {
    let old = std::mem::replace(&mut *self.state.write(), value);
    self.bump();
    old
  }

  pub fn version(&self) -> u64 {
    *self.version.borrow()
  }

  /// Receiver that observes a new version after every write.
  pub fn watch(&self) -> watch::Receiver<u64> {
    self.version.subscribe()
  }

  fn bump(&self) -> u64 {
    let mut next = 0;
    self.version.send_modify(|v| {
      *v += 1;
      next = *v;
    });
    next
  }
}

impl<T: Clone> Slice<T> {
  pub fn get(&self) -> T {
    self.state.read().clone()
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Slice<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Slice")
      .field("name", &self.name)
      .field("state", &*self.state.read())
      .finish()
  }
}
