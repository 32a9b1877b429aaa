//! Connection registry: which participant is attached to which
//! conversation's live channel.
//!
//! Mutations for one conversation run under that conversation's DashMap
//! entry lock, so a displaced reconnect and a fresh connect can never both
//! believe they own the slot. Lock order is always conversation map, then
//! participant map.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use tempest_chat_shared::protocol::CLOSE_SUPERSEDED;
use tempest_chat_shared::Membership;

use super::ConnectionSender;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("participant {participant_id} is not a member of conversation {conversation_id}")]
    Unauthorized {
        conversation_id: Uuid,
        participant_id: Uuid,
    },
}

/// One participant's live attachment to one conversation.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub participant_id: Uuid,
    pub sender: ConnectionSender,
}

#[derive(Default)]
struct Inner {
    by_conversation: DashMap<Uuid, Vec<Connection>>,
    by_participant: DashMap<Uuid, HashSet<Uuid>>,
}

/// Shared handle; clones see the same registry.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `participant_id` to the conversation described by `membership`.
    ///
    /// A previous connection of the same participant to the same
    /// conversation is evicted and told to close with 4009.
    pub fn register(
        &self,
        membership: &Membership,
        participant_id: Uuid,
        sender: ConnectionSender,
    ) -> Result<Connection, RegisterError> {
        let conversation_id = membership.conversation_id;
        if !membership.includes(participant_id) {
            return Err(RegisterError::Unauthorized {
                conversation_id,
                participant_id,
            });
        }

        let connection = Connection {
            id: Uuid::new_v4(),
            conversation_id,
            participant_id,
            sender,
        };

        let mut slot = self.inner.by_conversation.entry(conversation_id).or_default();
        let displaced: Vec<Connection> = {
            let (kept, displaced) = std::mem::take(&mut *slot)
                .into_iter()
                .partition(|c| c.participant_id != participant_id);
            *slot = kept;
            displaced
        };
        slot.push(connection.clone());
        self.inner
            .by_participant
            .entry(participant_id)
            .or_default()
            .insert(conversation_id);
        let live = slot.len();
        drop(slot);

        for old in displaced {
            tracing::info!(
                conversation_id = %conversation_id,
                participant_id = %participant_id,
                connection_id = %old.id,
                "Evicting superseded connection"
            );
            let _ = old.sender.send(Message::Close(Some(CloseFrame {
                code: CLOSE_SUPERSEDED,
                reason: "Superseded by a newer connection".into(),
            })));
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            participant_id = %participant_id,
            connection_id = %connection.id,
            connections = live,
            "Connection registered"
        );
        Ok(connection)
    }

    /// Remove a connection. Removing one that is already gone is a no-op.
    /// Returns whether anything was removed.
    pub fn unregister(&self, connection: &Connection) -> bool {
        let conversation_id = connection.conversation_id;
        let (removed, now_empty) = match self.inner.by_conversation.get_mut(&conversation_id) {
            Some(mut slot) => {
                let before = slot.len();
                slot.retain(|c| c.id != connection.id);
                let removed = slot.len() != before;
                if removed
                    && !slot
                        .iter()
                        .any(|c| c.participant_id == connection.participant_id)
                {
                    self.forget_participant(connection.participant_id, conversation_id);
                }
                (removed, slot.is_empty())
            }
            None => (false, false),
        };

        if now_empty {
            self.inner
                .by_conversation
                .remove_if(&conversation_id, |_, slot| slot.is_empty());
        }

        if removed {
            tracing::debug!(
                conversation_id = %conversation_id,
                participant_id = %connection.participant_id,
                connection_id = %connection.id,
                "Connection unregistered"
            );
        }
        removed
    }

    fn forget_participant(&self, participant_id: Uuid, conversation_id: Uuid) {
        let now_empty = match self.inner.by_participant.get_mut(&participant_id) {
            Some(mut set) => {
                set.remove(&conversation_id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.inner
                .by_participant
                .remove_if(&participant_id, |_, set| set.is_empty());
        }
    }

    /// Current live set for a conversation.
    pub fn connections_for(&self, conversation_id: Uuid) -> Vec<Connection> {
        self.inner
            .by_conversation
            .get(&conversation_id)
            .map(|slot| slot.value().clone())
            .unwrap_or_default()
    }

    /// Every connection held by a participant, across conversations.
    pub fn connections_of(&self, participant_id: Uuid) -> Vec<Connection> {
        let conversations: Vec<Uuid> = self
            .inner
            .by_participant
            .get(&participant_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        conversations
            .into_iter()
            .flat_map(|conversation_id| self.connections_for(conversation_id))
            .filter(|c| c.participant_id == participant_id)
            .collect()
    }

    pub fn is_registered(&self, connection: &Connection) -> bool {
        self.inner
            .by_conversation
            .get(&connection.conversation_id)
            .is_some_and(|slot| slot.iter().any(|c| c.id == connection.id))
    }
}
