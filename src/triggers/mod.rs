//! Event sources that mark keys stale and re-run their producers

mod poller;
mod registry;

pub use poller::Poller;
pub use registry::{LifecycleEvent, Registration, Triggers};
