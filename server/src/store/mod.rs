//! Durable storage of conversations and messages.
//!
//! The gateway never owns storage: it asks a [`MessageStore`] for
//! membership, hands it valid sends, and reacts to the result. The trait is
//! synchronous and is always called from `tokio::task::spawn_blocking`.

pub mod sqlite;

use thiserror::Error;
use uuid::Uuid;

use tempest_chat_shared::{Conversation, Membership, Message};

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("conversation {0} does not exist")]
    UnknownConversation(Uuid),
    #[error("user {0} does not exist")]
    UnknownUser(Uuid),
    #[error("user {participant_id} is not a member of conversation {conversation_id}")]
    NotParticipant {
        conversation_id: Uuid,
        participant_id: Uuid,
    },
    #[error("a conversation needs two distinct participants")]
    SameParticipant,
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Storage collaborator for the messaging gateway and its REST endpoints.
pub trait MessageStore: Send + Sync + 'static {
    /// Member pair of a conversation, `None` if it does not exist.
    fn membership(&self, conversation_id: Uuid) -> Result<Option<Membership>, StoreError>;

    /// Persist a message. `sender_id` must be a member. The stored
    /// timestamp is strictly later than any earlier message of the
    /// conversation.
    fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: &str,
    ) -> Result<Message, StoreError>;

    /// Full history, ascending by (created_at, id).
    fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;

    /// Conversations where `user_id` is a member, most recently active first.
    fn conversations_for(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError>;

    /// Create a conversation, or return the existing one for the same
    /// (landlord, guest, reservation). The flag is true when it was created.
    fn create_conversation(
        &self,
        landlord_id: Uuid,
        guest_id: Uuid,
        reservation_id: Option<Uuid>,
    ) -> Result<(Conversation, bool), StoreError>;
}

/// Run a store call on the blocking pool.
pub async fn blocking<S, T, F>(store: std::sync::Arc<S>, f: F) -> Result<T, StoreError>
where
    S: MessageStore + ?Sized,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}
