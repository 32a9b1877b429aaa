//! Types shared between the chat gateway server and the sync client.
//!
//! `model` holds the persisted entities, `protocol` the JSON frames that
//! travel over a conversation channel.

pub mod model;
pub mod protocol;

pub use model::{Conversation, Membership, Message, MessageKey, Participant, Role};
pub use protocol::{ClientFrame, ErrorKind, SendMessage, ServerFrame};
