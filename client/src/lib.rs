//! Client side of Tempest chat: the Conversation Sync Engine.
//!
//! [`engine::SyncEngine`] is a pure state machine. [`session::spawn_session`]
//! drives it against real transports ([`transport::RestApi`],
//! [`transport::WsConnector`]) and exposes a read-only snapshot plus a
//! subscription to the UI.

pub mod backoff;
pub mod engine;
pub mod error;
pub mod session;
pub mod timeline;
pub mod transport;

pub use backoff::Backoff;
pub use engine::{Effect, Event, RequestTag, SendError, SyncEngine, SyncStatus};
pub use error::ClientError;
pub use session::{spawn_session, SyncConfig, SyncHandle, SyncSnapshot};
pub use timeline::MessageTimeline;
pub use transport::{ChannelConnector, ChannelHandle, HistorySource, RestApi, WsConnector};
