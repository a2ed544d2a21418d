//! Consumer-facing handles that tie a component's lifetime to its keys

mod metrics;
mod swr;

pub use metrics::MetricsSocket;
pub use swr::{SwrHandle, SwrState};
