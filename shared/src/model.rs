use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user as seen from inside a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub username: String,
}

/// Which side of the conversation a participant is on.
/// The labels come from the booking domain and carry no access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The initiator (host of the reserved property).
    Landlord,
    /// The counterpart (guest of the reservation).
    Guest,
}

/// Two-party conversation, optionally tied to a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub landlord: Participant,
    pub guest: Participant,
    pub reservation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Newest message, shown as the preview in conversation lists.
    pub last_message: Option<Message>,
}

impl Conversation {
    pub fn membership(&self) -> Membership {
        Membership {
            conversation_id: self.id,
            landlord_id: self.landlord.id,
            guest_id: self.guest.id,
        }
    }
}

/// The immutable member pair of a conversation.
///
/// Fetched once per connection by the gateway and kept for the lifetime of
/// that connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub conversation_id: Uuid,
    pub landlord_id: Uuid,
    pub guest_id: Uuid,
}

impl Membership {
    pub fn role_of(&self, participant_id: Uuid) -> Option<Role> {
        if participant_id == self.landlord_id {
            Some(Role::Landlord)
        } else if participant_id == self.guest_id {
            Some(Role::Guest)
        } else {
            None
        }
    }

    pub fn includes(&self, participant_id: Uuid) -> bool {
        self.role_of(participant_id).is_some()
    }
}

/// An immutable chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: Participant,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Total order over messages: creation time, then id.
///
/// Field order matters, the derived `Ord` compares `created_at` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}
