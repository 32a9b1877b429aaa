//! Ordered, de-duplicated message list of the open conversation.

use std::collections::HashSet;

use uuid::Uuid;

use tempest_chat_shared::{Message, MessageKey};

/// Messages of one conversation, sorted by (created_at, id) with unique ids.
///
/// A fetch result replaces the list wholesale. The cursor (newest key ever
/// seen) never moves backwards, even if a replacement is shorter.
#[derive(Debug, Clone, Default)]
pub struct MessageTimeline {
    conversation_id: Option<Uuid>,
    messages: Vec<Message>,
    cursor: Option<MessageKey>,
}

impl MessageTimeline {
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            ..Self::default()
        }
    }

    /// Replace the list with a fetch result. Messages of other
    /// conversations are dropped; duplicates keep their first occurrence.
    pub fn replace(&mut self, mut fetched: Vec<Message>) {
        if let Some(conversation_id) = self.conversation_id {
            fetched.retain(|m| m.conversation_id == conversation_id);
        }
        fetched.sort_by_key(Message::key);

        let mut seen = HashSet::with_capacity(fetched.len());
        fetched.retain(|m| seen.insert(m.id));

        if let Some(newest) = fetched.last().map(Message::key) {
            self.cursor = Some(self.cursor.map_or(newest, |c| c.max(newest)));
        }
        self.messages = fetched;
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Newest key ever applied to this timeline.
    pub fn cursor(&self) -> Option<MessageKey> {
        self.cursor
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use tempest_chat_shared::Participant;

    fn msg(conversation_id: Uuid, id: u128, secs: i64, text: &str) -> Message {
        Message {
            id: Uuid::from_u128(id),
            conversation_id,
            sender: Participant {
                id: Uuid::from_u128(99),
                username: "a".into(),
            },
            text: text.into(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + Duration::seconds(secs),
        }
    }

    fn texts(t: &MessageTimeline) -> Vec<&str> {
        t.messages().iter().map(|m| m.text.as_str()).collect()
    }

    #[test]
    fn overlapping_fetches_never_duplicate() {
        let c = Uuid::new_v4();
        let mut t = MessageTimeline::new(c);
        let first = vec![msg(c, 1, 1, "hello"), msg(c, 2, 2, "there")];
        let second = vec![
            msg(c, 3, 3, "again"),
            msg(c, 1, 1, "hello"),
            msg(c, 2, 2, "there"),
            msg(c, 2, 2, "there"),
        ];

        t.replace(first);
        t.replace(second.clone());
        t.replace(second);

        assert_eq!(texts(&t), ["hello", "there", "again"]);
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let c = Uuid::new_v4();
        let mut t = MessageTimeline::new(c);
        t.replace(vec![msg(c, 9, 5, "b"), msg(c, 4, 5, "a")]);
        assert_eq!(texts(&t), ["a", "b"]);
    }

    #[test]
    fn foreign_messages_are_dropped() {
        let c = Uuid::new_v4();
        let mut t = MessageTimeline::new(c);
        t.replace(vec![msg(c, 1, 1, "mine"), msg(Uuid::new_v4(), 2, 2, "theirs")]);
        assert_eq!(texts(&t), ["mine"]);
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let c = Uuid::new_v4();
        let mut t = MessageTimeline::new(c);
        t.replace(vec![msg(c, 1, 1, "a"), msg(c, 2, 10, "b")]);
        let high = t.cursor().unwrap();

        t.replace(vec![msg(c, 1, 1, "a")]);
        assert_eq!(t.cursor(), Some(high));
        assert!(!t.contains(Uuid::from_u128(2)));
    }
}
