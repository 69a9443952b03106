//! Database row types — these map directly to SQLite rows.
//! Distinct from parley-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub is_online: bool,
    pub last_seen_at: String,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub author_username: String,
    pub content: String,
    pub thread_id: Option<String>,
    pub is_edited: bool,
    pub created_at: String,
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
}

pub struct ReadReceiptRow {
    pub message_id: String,
    pub user_id: String,
    pub read_at: String,
}
