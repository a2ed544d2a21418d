#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swrcache::channel::{ClientEvent, PushConnection, PushEvent, PushTransport};
use swrcache::{producer, ChannelError, FetchError, ProducerRef};
use tokio::sync::mpsc;

/// Remote end of a mock connection.
pub struct Remote {
  pub events: mpsc::UnboundedSender<Result<PushEvent, ChannelError>>,
  pub commands: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Remote {
  pub fn push(&self, event: PushEvent) {
    self.events.send(Ok(event)).unwrap();
  }
}

/// Hands out queued connections; fails when the queue is empty.
#[derive(Default)]
pub struct MockTransport {
  queue: Mutex<VecDeque<PushConnection>>,
  attempts: AtomicUsize,
}

impl MockTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Let the next connect attempt succeed.
  pub fn accept_next(&self) -> Remote {
    let (connection, events, commands) = PushConnection::pair();
    self.queue.lock().push_back(connection);
    Remote { events, commands }
  }

  pub fn attempts(&self) -> usize {
    self.attempts.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl PushTransport for MockTransport {
  async fn connect(&self) -> Result<PushConnection, ChannelError> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    self
      .queue
      .lock()
      .pop_front()
      .ok_or_else(|| ChannelError::Connect("connection refused".into()))
  }
}

/// Producer that counts its runs and resolves after `delay`.
pub fn counting(delay: Duration, value: Value) -> (Arc<AtomicUsize>, ProducerRef) {
  let calls = Arc::new(AtomicUsize::new(0));
  let calls2 = calls.clone();
  let p = producer(move || {
    let calls = calls2.clone();
    let value = value.clone();
    async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(delay).await;
      Ok::<_, FetchError>(value)
    }
  });
  (calls, p)
}

pub fn calls(counter: &AtomicUsize) -> usize {
  counter.load(Ordering::SeqCst)
}

pub async fn settle() {
  tokio::time::sleep(Duration::from_millis(10)).await;
}
