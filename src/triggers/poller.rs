use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::fetcher::{Fetcher, ProducerRef};

/// Fixed-interval producer runs for one key.
///
/// The first run happens as soon as polling starts. Stopping aborts the
/// loop and supersedes any poll still in flight, so a late poll result
/// can never land after the key changed hands.
pub struct Poller {
  fetcher: Arc<Fetcher>,
  key: String,
  producer: ProducerRef,
  interval: Duration,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
  pub fn new(
    fetcher: Arc<Fetcher>,
    key: impl Into<String>,
    producer: ProducerRef,
    interval: Duration,
  ) -> Self {
    Self {
      fetcher,
      key: key.into(),
      producer,
      interval,
      task: Mutex::new(None),
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  pub fn is_running(&self) -> bool {
    self
      .task
      .lock()
      .as_ref()
      .map(|t| !t.is_finished())
      .unwrap_or(false)
  }

  /// Start polling. Returns false if already running.
  pub fn start(&self) -> bool {
    let mut task = self.task.lock();
    if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
      return false;
    }

    let fetcher = self.fetcher.clone();
    let key = self.key.clone();
    let producer = self.producer.clone();
    let period = self.interval;
    tracing::info!(key = %key, ?period, "polling started");

    *task = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if let Err(e) = fetcher.refresh(&key, &producer).await {
          tracing::debug!(key = %key, "poll failed: {}", e);
        }
      }
    }));
    true
  }

  /// Stop polling. Returns false if it wasn't running.
  pub fn stop(&self) -> bool {
    let Some(task) = self.task.lock().take() else {
      return false;
    };
    task.abort();
    self.fetcher.supersede(&self.key);
    tracing::info!(key = %self.key, "polling stopped");
    true
  }
}

impl Drop for Poller {
  fn drop(&mut self) {
    if let Some(task) = self.task.get_mut().take() {
      task.abort();
    }
  }
}
