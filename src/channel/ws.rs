//! WebSocket transport

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::events::{ClientEvent, PushEvent};
use super::transport::{PushConnection, PushTransport};
use crate::error::ChannelError;

pub struct WsTransport {
  url: String,
}

impl WsTransport {
  pub fn new(url: &str) -> Self {
    let url = if url.starts_with("ws://") || url.starts_with("wss://") {
      url.into()
    } else {
      format!("ws://{}", url)
    };
    Self { url }
  }

  pub fn url(&self) -> &str {
    &self.url
  }
}

#[async_trait]
impl PushTransport for WsTransport {
  async fn connect(&self) -> Result<PushConnection, ChannelError> {
    let (ws, _) = tokio_tungstenite::connect_async(&self.url)
      .await
      .map_err(|e| ChannelError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<ClientEvent>();

    tokio::spawn(async move {
      while let Some(cmd) = command_rx.recv().await {
        let serialized = match serde_json::to_string(&cmd) {
          Ok(s) => s,
          Err(e) => {
            tracing::error!("Failed to serialize client event: {}", e);
            continue;
          }
        };
        if sink.send(Message::Text(serialized.into())).await.is_err() {
          break;
        }
      }
      let _ = sink.close().await;
    });

    tokio::spawn(async move {
      while let Some(frame) = stream.next().await {
        let text = match frame {
          Ok(Message::Text(text)) => text,
          Ok(Message::Close(_)) => break,
          Ok(_) => continue,
          Err(e) => {
            tracing::debug!("WebSocket read failed: {}", e);
            break;
          }
        };
        let event = serde_json::from_str::<PushEvent>(&text)
          .map_err(|e| ChannelError::Protocol(e.to_string()));
        if event_tx.send(event).is_err() {
          break;
        }
      }
    });

    tracing::info!("WebSocket connected to {}", self.url);
    Ok(PushConnection {
      events: event_rx,
      commands: command_tx,
    })
  }
}
