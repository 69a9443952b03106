use std::collections::HashMap;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;
use uuid::Uuid;

use crate::Database;
use crate::models::{ConversationRow, MessageRow, ReactionRow, ReadReceiptRow, UserRow};
use parley_types::models::{Message, Reaction, ReadEntry};

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_username_by_id(&self, id: &str) -> Result<String> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|_| anyhow!("User not found: {}", id))
        })
    }

    /// Best-effort presence flag. Callers log failures; a presence write
    /// must never take a connection down.
    pub fn set_participant_online(&self, user_id: &str, online: bool, last_seen_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_online = ?2, last_seen_at = ?3 WHERE id = ?1",
                rusqlite::params![user_id, online as i64, last_seen_at.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    // -- Conversations --

    pub fn create_conversation(&self, id: &str, name: &str, participant_ids: &[String]) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, name) VALUES (?1, ?2)",
                (id, name),
            )?;
            for uid in participant_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO participants (conversation_id, user_id) VALUES (?1, ?2)",
                    (id, uid),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn rename_conversation(&self, id: &str, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE conversations SET name = ?2 WHERE id = ?1",
                (id, name),
            )?;
            Ok(n > 0)
        })
    }

    pub fn add_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO participants (conversation_id, user_id) VALUES (?1, ?2)",
                (conversation_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, created_at FROM conversations WHERE id = ?1")?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    /// All conversations the identity participates in. A connection joins
    /// every one of these topics for its whole lifetime, not only the
    /// currently open view.
    pub fn find_conversations_for_identity(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name, c.created_at
                 FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.created_at",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id),
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    pub fn conversation_participants(&self, conversation_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT user_id FROM participants WHERE conversation_id = ?1")?;
            let rows = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    /// Insert a message. `created_at` is assigned here, at persistence
    /// time — it is the feed ordering key everywhere downstream.
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        author_id: &str,
        content: &str,
        thread_id: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, author_id, content, thread_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, conversation_id, author_id, content, thread_id, created_at.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Fetch a single message with its reactions and read receipts.
    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let rows = query_message_rows(conn, "m.id = ?1", &[&id], None)?;
            Ok(assemble_messages(conn, rows)?.pop())
        })
    }

    /// Main-feed page for a conversation: thread replies excluded, newest
    /// first, cursor-paginated by `created_at`.
    pub fn find_messages_by_conversation(
        &self,
        conversation_id: &str,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let rows = match before {
                Some(cursor) => {
                    let cursor = cursor.to_rfc3339();
                    query_message_rows(
                        conn,
                        "m.conversation_id = ?1 AND m.thread_id IS NULL AND m.created_at < ?2",
                        &[&conversation_id, &cursor],
                        Some(limit),
                    )?
                }
                None => query_message_rows(
                    conn,
                    "m.conversation_id = ?1 AND m.thread_id IS NULL",
                    &[&conversation_id],
                    Some(limit),
                )?,
            };
            assemble_messages(conn, rows)
        })
    }

    /// All replies for a thread parent, oldest first.
    pub fn find_thread_replies(&self, parent_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut rows = query_message_rows(conn, "m.thread_id = ?1", &[&parent_id], None)?;
            rows.reverse();
            assemble_messages(conn, rows)
        })
    }

    /// The authoritative reply count — preferred over any client-supplied
    /// increment.
    pub fn count_thread_replies(&self, parent_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE thread_id = ?1",
                [parent_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Returns false when the message does not exist or the editor is not
    /// its author.
    pub fn edit_message(&self, id: &str, author_id: &str, content: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = ?3, is_edited = 1 WHERE id = ?1 AND author_id = ?2",
                (id, author_id, content),
            )?;
            Ok(n > 0)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if exists, inserts if not.
    /// Returns true when the reaction was added.
    pub fn toggle_reaction(&self, id: &str, message_id: &str, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    rusqlite::params![message_id, user_id, emoji],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                conn.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                Ok(false)
            } else {
                conn.execute(
                    "INSERT INTO reactions (id, message_id, user_id, emoji) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, message_id, user_id, emoji],
                )?;
                Ok(true)
            }
        })
    }

    pub fn reactions_for_message(&self, message_id: &str) -> Result<Vec<Reaction>> {
        self.with_conn(|conn| {
            let rows = query_reactions(conn, std::slice::from_ref(&message_id.to_string()))?;
            Ok(rows
                .into_iter()
                .map(|r| Reaction {
                    user_id: parse_uuid(&r.user_id, "reaction user_id"),
                    emoji: r.emoji,
                })
                .collect())
        })
    }

    // -- Read receipts --

    /// Idempotent: marking the same message read twice by the same user
    /// leaves exactly one receipt. Returns true when a new receipt was
    /// recorded.
    pub fn mark_read(&self, message_id: &str, user_id: &str, read_at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![message_id, user_id, read_at.to_rfc3339()],
            )?;
            Ok(n > 0)
        })
    }

    // -- Pins --

    /// Returns true when the message was newly pinned.
    pub fn pin_message(&self, conversation_id: &str, message_id: &str, pinned_at: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO pins (conversation_id, message_id, pinned_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![conversation_id, message_id, pinned_at.to_rfc3339()],
            )?;
            Ok(n > 0)
        })
    }

    /// Unpinning an absent id is a no-op, not an error.
    pub fn unpin_message(&self, conversation_id: &str, message_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM pins WHERE conversation_id = ?1 AND message_id = ?2",
                (conversation_id, message_id),
            )?;
            Ok(n > 0)
        })
    }

    /// Pinned message ids in pin order.
    pub fn pinned_messages(&self, conversation_id: &str) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id FROM pins WHERE conversation_id = ?1 ORDER BY pinned_at, rowid",
            )?;
            let ids = stmt
                .query_map([conversation_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids.iter().map(|s| parse_uuid(s, "pinned message_id")).collect())
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, password, is_online, last_seen_at, created_at FROM users WHERE {column} = ?1"
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                is_online: row.get::<_, i64>(3)? != 0,
                last_seen_at: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Shared SELECT for message rows. JOIN users to fetch author_username in
/// a single query (eliminates N+1). Newest first; ties broken by rowid so
/// insertion order is stable.
fn query_message_rows(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn rusqlite::types::ToSql],
    limit: Option<u32>,
) -> Result<Vec<MessageRow>> {
    let limit_clause = match limit {
        Some(n) => format!(" LIMIT {n}"),
        None => String::new(),
    };
    let sql = format!(
        "SELECT m.id, m.conversation_id, m.author_id, u.username, m.content, m.thread_id, m.is_edited, m.created_at
         FROM messages m
         LEFT JOIN users u ON m.author_id = u.id
         WHERE {where_clause}
         ORDER BY m.created_at DESC, m.rowid DESC{limit_clause}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                author_id: row.get(2)?,
                author_username: row
                    .get::<_, Option<String>>(3)?
                    .unwrap_or_else(|| "unknown".to_string()),
                content: row.get(4)?,
                thread_id: row.get(5)?,
                is_edited: row.get::<_, i64>(6)? != 0,
                created_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Batch-fetch reactions for a set of message IDs.
fn query_reactions(conn: &Connection, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
    if message_ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT id, message_id, user_id, emoji FROM reactions WHERE message_id IN ({}) ORDER BY created_at, rowid",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(ReactionRow {
                id: row.get(0)?,
                message_id: row.get(1)?,
                user_id: row.get(2)?,
                emoji: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Batch-fetch read receipts for a set of message IDs.
fn query_read_receipts(conn: &Connection, message_ids: &[String]) -> Result<Vec<ReadReceiptRow>> {
    if message_ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT message_id, user_id, read_at FROM read_receipts WHERE message_id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(ReadReceiptRow {
                message_id: row.get(0)?,
                user_id: row.get(1)?,
                read_at: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Attach reactions and read receipts to message rows and convert to the
/// API model.
fn assemble_messages(conn: &Connection, rows: Vec<MessageRow>) -> Result<Vec<Message>> {
    let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let reaction_rows = query_reactions(conn, &message_ids)?;
    let receipt_rows = query_read_receipts(conn, &message_ids)?;

    let mut reaction_map: HashMap<String, Vec<Reaction>> = HashMap::new();
    for r in reaction_rows {
        reaction_map.entry(r.message_id).or_default().push(Reaction {
            user_id: parse_uuid(&r.user_id, "reaction user_id"),
            emoji: r.emoji,
        });
    }

    let mut receipt_map: HashMap<String, Vec<ReadEntry>> = HashMap::new();
    for r in receipt_rows {
        let read_at = parse_timestamp(&r.read_at, &r.message_id);
        receipt_map.entry(r.message_id).or_default().push(ReadEntry {
            user_id: parse_uuid(&r.user_id, "receipt user_id"),
            read_at,
        });
    }

    Ok(rows
        .into_iter()
        .map(|row| Message {
            id: parse_uuid(&row.id, "message id"),
            conversation_id: parse_uuid(&row.conversation_id, "conversation_id"),
            author_id: parse_uuid(&row.author_id, "author_id"),
            author_username: row.author_username,
            content: row.content,
            thread_id: row.thread_id.as_deref().map(|t| parse_uuid(t, "thread_id")),
            is_edited: row.is_edited,
            created_at: parse_timestamp(&row.created_at, &row.id),
            reactions: reaction_map.remove(&row.id).unwrap_or_default(),
            read_by: receipt_map.remove(&row.id).unwrap_or_default(),
        })
        .collect())
}

fn parse_uuid(s: &str, ctx: &str) -> Uuid {
    s.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", ctx, s, e);
        Uuid::default()
    })
}

pub fn parse_timestamp(s: &str, ctx: &str) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') stores "YYYY-MM-DD HH:MM:SS" without
            // a timezone. Parse as naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on '{}': {}", s, ctx, e);
            DateTime::default()
        })
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fixture() -> (Database, String, String) {
        let db = Database::open_in_memory().unwrap();
        let uid = Uuid::new_v4().to_string();
        db.create_user(&uid, "ana", "hash").unwrap();
        let cid = "00000000-0000-0000-0000-000000000001".to_string();
        db.add_participant(&cid, &uid).unwrap();
        (db, uid, cid)
    }

    #[test]
    fn mark_read_is_idempotent() {
        let (db, uid, cid) = fixture();
        let mid = Uuid::new_v4().to_string();
        db.insert_message(&mid, &cid, &uid, "hello", None, Utc::now()).unwrap();

        assert!(db.mark_read(&mid, &uid, Utc::now()).unwrap());
        assert!(!db.mark_read(&mid, &uid, Utc::now()).unwrap());

        let msg = db.get_message(&mid).unwrap().unwrap();
        assert_eq!(msg.read_by.len(), 1);
    }

    #[test]
    fn main_feed_excludes_thread_replies() {
        let (db, uid, cid) = fixture();
        let parent = Uuid::new_v4().to_string();
        let reply = Uuid::new_v4().to_string();
        let t0 = Utc::now();
        db.insert_message(&parent, &cid, &uid, "root", None, t0).unwrap();
        db.insert_message(&reply, &cid, &uid, "reply", Some(&parent), t0 + Duration::seconds(1))
            .unwrap();

        let feed = db.find_messages_by_conversation(&cid, None, 50).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].id.to_string(), parent);

        let replies = db.find_thread_replies(&parent).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(db.count_thread_replies(&parent).unwrap(), 1);
    }

    #[test]
    fn pagination_cursor_pages_backwards() {
        let (db, uid, cid) = fixture();
        let base = Utc::now();
        for i in 0..5 {
            let mid = Uuid::new_v4().to_string();
            db.insert_message(&mid, &cid, &uid, &format!("m{i}"), None, base + Duration::seconds(i))
                .unwrap();
        }

        let first = db.find_messages_by_conversation(&cid, None, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].content, "m4");

        let older = db
            .find_messages_by_conversation(&cid, Some(first[1].created_at), 10)
            .unwrap();
        assert_eq!(older.len(), 3);
        assert_eq!(older[0].content, "m2");
    }

    #[test]
    fn toggle_reaction_round_trip() {
        let (db, uid, cid) = fixture();
        let mid = Uuid::new_v4().to_string();
        db.insert_message(&mid, &cid, &uid, "hi", None, Utc::now()).unwrap();

        assert!(db.toggle_reaction(&Uuid::new_v4().to_string(), &mid, &uid, "👍").unwrap());
        assert_eq!(db.reactions_for_message(&mid).unwrap().len(), 1);
        assert!(!db.toggle_reaction(&Uuid::new_v4().to_string(), &mid, &uid, "👍").unwrap());
        assert!(db.reactions_for_message(&mid).unwrap().is_empty());
    }

    #[test]
    fn unpin_of_absent_id_is_noop() {
        let (db, uid, cid) = fixture();
        let mid = Uuid::new_v4().to_string();
        db.insert_message(&mid, &cid, &uid, "pin me", None, Utc::now()).unwrap();

        assert!(db.pin_message(&cid, &mid, Utc::now()).unwrap());
        assert!(!db.pin_message(&cid, &mid, Utc::now()).unwrap());
        assert_eq!(db.pinned_messages(&cid).unwrap().len(), 1);

        assert!(db.unpin_message(&cid, &mid).unwrap());
        assert!(!db.unpin_message(&cid, &mid).unwrap());
        assert!(db.pinned_messages(&cid).unwrap().is_empty());
    }

    #[test]
    fn conversations_for_identity_reflect_membership() {
        let (db, uid, cid) = fixture();
        let other = Uuid::new_v4().to_string();
        db.create_conversation(&other, "private", &[]).unwrap();

        let convs = db.find_conversations_for_identity(&uid).unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].id, cid);
        assert!(db.is_participant(&cid, &uid).unwrap());
        assert!(!db.is_participant(&other, &uid).unwrap());
    }
}
