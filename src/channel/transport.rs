use async_trait::async_trait;
use tokio::sync::mpsc;

use super::events::{ClientEvent, PushEvent};
use crate::error::ChannelError;

/// One live duplex connection. The channel is considered dropped once
/// `events` yields `None`.
pub struct PushConnection {
  /// Decoded server events; malformed frames arrive as `Err`
  pub events: mpsc::UnboundedReceiver<Result<PushEvent, ChannelError>>,
  pub commands: mpsc::UnboundedSender<ClientEvent>,
}

impl PushConnection {
  /// Build a connection from raw halves. The returned pair is the remote
  /// side: push events in, read client commands out.
  pub fn pair() -> (
    Self,
    mpsc::UnboundedSender<Result<PushEvent, ChannelError>>,
    mpsc::UnboundedReceiver<ClientEvent>,
  ) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    (
      Self {
        events: event_rx,
        commands: command_tx,
      },
      event_tx,
      command_rx,
    )
  }
}

/// Opens push connections. Called again after every drop.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
  async fn connect(&self) -> Result<PushConnection, ChannelError>;
}
