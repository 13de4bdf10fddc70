//! Client side of the protocol: submit messages, then poll until every one
//! of them has been answered.

pub mod polling;
pub mod tracker;
pub mod transport;

pub use polling::PollingClient;
pub use tracker::CorrelationTracker;
pub use transport::{ChatTransport, HttpTransport, LocalTransport};
