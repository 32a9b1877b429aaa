use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: Conversations and messages

CREATE TABLE users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE conversations (
    id TEXT PRIMARY KEY,
    reservation_id TEXT,
    landlord_id TEXT NOT NULL,
    guest_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    CHECK (landlord_id <> guest_id),
    FOREIGN KEY (landlord_id) REFERENCES users(id),
    FOREIGN KEY (guest_id) REFERENCES users(id)
);

CREATE UNIQUE INDEX idx_conversations_members
    ON conversations(landlord_id, guest_id, COALESCE(reservation_id, ''));
CREATE INDEX idx_conversations_guest ON conversations(guest_id);

-- Membership never changes once the conversation exists
CREATE TRIGGER conversations_membership_immutable
BEFORE UPDATE OF landlord_id, guest_id ON conversations
BEGIN
    SELECT RAISE(ABORT, 'conversation membership is immutable');
END;

CREATE TABLE messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    text TEXT NOT NULL CHECK (length(trim(text)) > 0),
    created_at TEXT NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
    FOREIGN KEY (sender_id) REFERENCES users(id)
);

CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at, id);

CREATE TRIGGER messages_immutable
BEFORE UPDATE ON messages
BEGIN
    SELECT RAISE(ABORT, 'messages are immutable');
END;
",
    )])
}
