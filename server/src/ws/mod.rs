pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod phase;
pub mod protocol;
pub mod registry;
pub mod send;

use tokio::sync::mpsc;

pub use registry::{Connection, ConnectionRegistry, RegisterError};

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;
