//! Real-time push channel feeding the cache
//!
//! A [`PushTransport`] yields a stream of typed [`PushEvent`]s; the
//! [`PushChannel`] applies them to the well-known metrics and sessions
//! keys and falls back to interval polling while it is disconnected.

pub mod events;
mod push;
mod transport;
#[cfg(feature = "ws")]
mod ws;

pub use events::{ClientEvent, MetricsSnapshot, Notification, PushEvent};
pub use push::{ChannelLease, ConnectionState, PushChannel, PushChannelBuilder};
pub use transport::{PushConnection, PushTransport};
#[cfg(feature = "ws")]
pub use ws::WsTransport;
