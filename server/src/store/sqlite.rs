use chrono::{SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use tempest_chat_shared::{Conversation, Membership, Message, Participant};

use super::{MessageStore, StoreError};
use crate::db::models::{encode_timestamp, timestamp_at, uuid_at, User};
use crate::db::{self, DbPool};

/// [`MessageStore`] backed by the shared SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

const CONVERSATION_COLUMNS: &str = "c.id, c.reservation_id, c.created_at,
        c.landlord_id, ul.username, c.guest_id, ug.username,
        m.id, m.sender_id, um.username, m.text, m.created_at";

// `m` is the newest message of the conversation, if any
const CONVERSATION_FROM: &str = "conversations c
     JOIN users ul ON ul.id = c.landlord_id
     JOIN users ug ON ug.id = c.guest_id
     LEFT JOIN messages m ON m.id = (
         SELECT id FROM messages
         WHERE conversation_id = c.id
         ORDER BY created_at DESC, id DESC
         LIMIT 1
     )
     LEFT JOIN users um ON um.id = m.sender_id";

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Open (or create) the database under `data_dir`.
    pub fn open(data_dir: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self::new(db::init_db(data_dir)?))
    }

    pub fn in_memory() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self::new(db::init_in_memory()?))
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Insert a user. Account management lives elsewhere; this is used to
    /// seed identities.
    pub fn create_user(&self, username: &str, email: &str) -> Result<User, StoreError> {
        let conn = self.conn()?;
        let user = User {
            id: Uuid::now_v7(),
            username: username.to_string(),
            email: email.to_lowercase(),
            created_at: Utc::now().trunc_subsecs(6),
        };
        conn.execute(
            "INSERT INTO users (id, username, email, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                user.id.to_string(),
                user.username,
                user.email,
                encode_timestamp(&user.created_at)
            ],
        )?;
        Ok(user)
    }
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let reservation_id = match row.get::<_, Option<String>>(1)? {
        Some(raw) => Some(crate::db::models::decode_uuid(1, &raw)?),
        None => None,
    };
    let id = uuid_at(row, 0)?;
    let last_message = match row.get::<_, Option<String>>(7)? {
        Some(raw) => Some(Message {
            id: crate::db::models::decode_uuid(7, &raw)?,
            conversation_id: id,
            sender: Participant {
                id: uuid_at(row, 8)?,
                username: row.get(9)?,
            },
            text: row.get(10)?,
            created_at: timestamp_at(row, 11)?,
        }),
        None => None,
    };
    Ok(Conversation {
        id,
        reservation_id,
        created_at: timestamp_at(row, 2)?,
        landlord: Participant {
            id: uuid_at(row, 3)?,
            username: row.get(4)?,
        },
        guest: Participant {
            id: uuid_at(row, 5)?,
            username: row.get(6)?,
        },
        last_message,
    })
}

fn load_conversation(conn: &Connection, id: Uuid) -> Result<Conversation, StoreError> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM {CONVERSATION_FROM} WHERE c.id = ?1");
    conn.query_row(&sql, params![id.to_string()], conversation_from_row)
        .optional()?
        .ok_or(StoreError::UnknownConversation(id))
}

fn membership_in(conn: &Connection, conversation_id: Uuid) -> Result<Option<Membership>, StoreError> {
    let row = conn
        .query_row(
            "SELECT landlord_id, guest_id FROM conversations WHERE id = ?1",
            params![conversation_id.to_string()],
            |row| Ok((uuid_at(row, 0)?, uuid_at(row, 1)?)),
        )
        .optional()?;

    Ok(row.map(|(landlord_id, guest_id)| Membership {
        conversation_id,
        landlord_id,
        guest_id,
    }))
}

fn participant_in(conn: &Connection, user_id: Uuid) -> Result<Option<Participant>, StoreError> {
    let username: Option<String> = conn
        .query_row(
            "SELECT username FROM users WHERE id = ?1",
            params![user_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(username.map(|username| Participant {
        id: user_id,
        username,
    }))
}

impl MessageStore for SqliteStore {
    fn membership(&self, conversation_id: Uuid) -> Result<Option<Membership>, StoreError> {
        let conn = self.conn()?;
        membership_in(&conn, conversation_id)
    }

    fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: &str,
    ) -> Result<Message, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let membership =
            membership_in(&tx, conversation_id)?.ok_or(StoreError::UnknownConversation(conversation_id))?;
        if !membership.includes(sender_id) {
            return Err(StoreError::NotParticipant {
                conversation_id,
                participant_id: sender_id,
            });
        }

        let sender = participant_in(&tx, sender_id)?.ok_or(StoreError::UnknownUser(sender_id))?;

        // Keep persistence order and timestamp order identical
        let previous: Option<String> = tx.query_row(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
            params![conversation_id.to_string()],
            |row| row.get(0),
        )?;
        let mut created_at = Utc::now().trunc_subsecs(6);
        if let Some(raw) = previous {
            let previous = crate::db::models::decode_timestamp(0, &raw)?;
            if created_at <= previous {
                created_at = previous + chrono::Duration::microseconds(1);
            }
        }

        let message = Message {
            id: Uuid::now_v7(),
            conversation_id,
            sender,
            text: text.to_string(),
            created_at,
        };

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id.to_string(),
                conversation_id.to_string(),
                sender_id.to_string(),
                message.text,
                encode_timestamp(&message.created_at),
            ],
        )?;
        tx.commit()?;

        Ok(message)
    }

    fn messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.sender_id, u.username, m.text, m.created_at
             FROM messages m
             JOIN users u ON u.id = m.sender_id
             WHERE m.conversation_id = ?1
             ORDER BY m.created_at ASC, m.id ASC",
        )?;

        let messages = stmt
            .query_map(params![conversation_id.to_string()], |row| {
                Ok(Message {
                    id: uuid_at(row, 0)?,
                    conversation_id,
                    sender: Participant {
                        id: uuid_at(row, 1)?,
                        username: row.get(2)?,
                    },
                    text: row.get(3)?,
                    created_at: timestamp_at(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    fn conversations_for(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM {CONVERSATION_FROM}
             WHERE c.landlord_id = ?1 OR c.guest_id = ?1
             ORDER BY COALESCE(m.created_at, c.created_at) DESC, c.id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let conversations = stmt
            .query_map(params![user_id.to_string()], conversation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    fn create_conversation(
        &self,
        landlord_id: Uuid,
        guest_id: Uuid,
        reservation_id: Option<Uuid>,
    ) -> Result<(Conversation, bool), StoreError> {
        if landlord_id == guest_id {
            return Err(StoreError::SameParticipant);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        for user_id in [landlord_id, guest_id] {
            if participant_in(&tx, user_id)?.is_none() {
                return Err(StoreError::UnknownUser(user_id));
            }
        }

        let reservation = reservation_id.map(|id| id.to_string());
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM conversations
                 WHERE landlord_id = ?1 AND guest_id = ?2
                   AND COALESCE(reservation_id, '') = COALESCE(?3, '')",
                params![landlord_id.to_string(), guest_id.to_string(), reservation],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(raw) = existing {
            let id = crate::db::models::decode_uuid(0, &raw)?;
            let conversation = load_conversation(&tx, id)?;
            return Ok((conversation, false));
        }

        let id = Uuid::now_v7();
        tx.execute(
            "INSERT INTO conversations (id, reservation_id, landlord_id, guest_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                reservation,
                landlord_id.to_string(),
                guest_id.to_string(),
                encode_timestamp(&Utc::now().trunc_subsecs(6)),
            ],
        )?;
        let conversation = load_conversation(&tx, id)?;
        tx.commit()?;

        Ok((conversation, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_pair() -> (SqliteStore, User, User, Conversation) {
        let store = SqliteStore::in_memory().unwrap();
        let host = store.create_user("host", "host@example.com").unwrap();
        let guest = store.create_user("guest", "guest@example.com").unwrap();
        let (conversation, created) = store
            .create_conversation(host.id, guest.id, Some(Uuid::new_v4()))
            .unwrap();
        assert!(created);
        (store, host, guest, conversation)
    }

    #[test]
    fn history_is_ordered_and_timestamps_strictly_increase() {
        let (store, host, guest, conversation) = store_with_pair();

        for i in 0..20 {
            let sender = if i % 2 == 0 { host.id } else { guest.id };
            store
                .append_message(conversation.id, sender, &format!("m{i}"))
                .unwrap();
        }

        let history = store.messages(conversation.id).unwrap();
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].text, "m0");
        assert_eq!(history[19].text, "m19");
        assert!(history.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[test]
    fn non_member_cannot_append() {
        let (store, _host, _guest, conversation) = store_with_pair();
        let stranger = store.create_user("stranger", "x@example.com").unwrap();

        let err = store
            .append_message(conversation.id, stranger.id, "hi")
            .unwrap_err();
        assert!(matches!(err, StoreError::NotParticipant { .. }));
        assert!(store.messages(conversation.id).unwrap().is_empty());
    }

    #[test]
    fn blank_text_is_rejected_by_schema() {
        let (store, host, _guest, conversation) = store_with_pair();
        let err = store.append_message(conversation.id, host.id, "   ").unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[test]
    fn membership_and_messages_are_immutable() {
        let (store, host, guest, conversation) = store_with_pair();
        store.append_message(conversation.id, host.id, "hello").unwrap();

        let conn = store.conn().unwrap();
        let swap = conn.execute(
            "UPDATE conversations SET guest_id = ?1 WHERE id = ?2",
            params![host.id.to_string(), conversation.id.to_string()],
        );
        assert!(swap.is_err());

        let edit = conn.execute("UPDATE messages SET text = 'edited'", []);
        assert!(edit.is_err());
        drop(conn);

        let membership = store.membership(conversation.id).unwrap().unwrap();
        assert_eq!(membership.guest_id, guest.id);
    }

    #[test]
    fn create_conversation_is_idempotent_per_reservation() {
        let store = SqliteStore::in_memory().unwrap();
        let host = store.create_user("host", "host@example.com").unwrap();
        let guest = store.create_user("guest", "guest@example.com").unwrap();
        let reservation = Some(Uuid::new_v4());

        let (first, created) = store.create_conversation(host.id, guest.id, reservation).unwrap();
        assert!(created);
        let (again, created) = store.create_conversation(host.id, guest.id, reservation).unwrap();
        assert!(!created);
        assert_eq!(first.id, again.id);

        let (other, created) = store.create_conversation(host.id, guest.id, None).unwrap();
        assert!(created);
        assert_ne!(other.id, first.id);

        assert!(matches!(
            store.create_conversation(host.id, host.id, None),
            Err(StoreError::SameParticipant)
        ));
        assert!(matches!(
            store.create_conversation(host.id, Uuid::new_v4(), None),
            Err(StoreError::UnknownUser(_))
        ));
    }

    #[test]
    fn conversation_list_prefers_recent_activity() {
        let store = SqliteStore::in_memory().unwrap();
        let host = store.create_user("host", "host@example.com").unwrap();
        let g1 = store.create_user("g1", "g1@example.com").unwrap();
        let g2 = store.create_user("g2", "g2@example.com").unwrap();

        let (older, _) = store.create_conversation(host.id, g1.id, None).unwrap();
        let (newer, _) = store.create_conversation(host.id, g2.id, None).unwrap();

        // Without messages the newest conversation comes first
        let listed: Vec<Uuid> = store
            .conversations_for(host.id)
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(listed, vec![newer.id, older.id]);

        store.append_message(older.id, g1.id, "ping").unwrap();
        let latest = store.append_message(older.id, host.id, "pong").unwrap();
        let listed = store.conversations_for(host.id).unwrap();
        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[0].last_message.as_ref(), Some(&latest));
        assert!(listed[1].last_message.is_none());

        assert_eq!(store.conversations_for(g2.id).unwrap().len(), 1);
    }
}
