use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::warn;
use uuid::Uuid;

use crate::Database;
use crate::queries::{OptionalExt, parse_timestamp};
use parley_types::models::{Poll, PollOption};

impl Database {
    pub fn create_poll(
        &self,
        id: &str,
        conversation_id: &str,
        author_id: &str,
        question: &str,
        options: &[(String, String)],
        allow_multiple: bool,
        expires_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO polls (id, conversation_id, author_id, question, allow_multiple, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id,
                    conversation_id,
                    author_id,
                    question,
                    allow_multiple as i64,
                    expires_at.map(|e| e.to_rfc3339()),
                    created_at.to_rfc3339(),
                ],
            )?;
            for (idx, (option_id, label)) in options.iter().enumerate() {
                tx.execute(
                    "INSERT INTO poll_options (id, poll_id, idx, label) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![option_id, id, idx as i64, label],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Fetch a poll. Expiry is evaluated lazily here: a poll past its
    /// `expires_at` is flipped inactive before being returned — there is
    /// no background sweep.
    pub fn get_poll(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Poll>> {
        self.with_conn(|conn| {
            expire_if_due(conn, id, now)?;
            query_poll(conn, id)
        })
    }

    pub fn polls_for_conversation(&self, conversation_id: &str, now: DateTime<Utc>) -> Result<Vec<Poll>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM polls WHERE conversation_id = ?1 ORDER BY created_at, rowid")?;
            let ids = stmt
                .query_map([conversation_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut polls = Vec::with_capacity(ids.len());
            for id in ids {
                expire_if_due(conn, &id, now)?;
                if let Some(poll) = query_poll(conn, &id)? {
                    polls.push(poll);
                }
            }
            Ok(polls)
        })
    }

    /// Cast a vote and return the updated poll.
    ///
    /// With `allow_multiple = false`, the voter is first removed from
    /// every option of the poll, then added to the chosen one — so one
    /// identity never holds more than one vote across the poll. With
    /// `allow_multiple = true`, membership in the chosen option is
    /// toggled.
    pub fn cast_vote(&self, poll_id: &str, option_id: &str, user_id: &str, now: DateTime<Utc>) -> Result<Poll> {
        self.with_conn_mut(|conn| {
            expire_if_due(conn, poll_id, now)?;

            let (allow_multiple, is_active): (bool, bool) = conn
                .query_row(
                    "SELECT allow_multiple, is_active FROM polls WHERE id = ?1",
                    [poll_id],
                    |row| Ok((row.get::<_, i64>(0)? != 0, row.get::<_, i64>(1)? != 0)),
                )
                .optional()?
                .ok_or_else(|| anyhow!("Poll not found: {}", poll_id))?;

            if !is_active {
                bail!("Poll {} is closed", poll_id);
            }

            let belongs: i64 = conn.query_row(
                "SELECT COUNT(*) FROM poll_options WHERE id = ?1 AND poll_id = ?2",
                (option_id, poll_id),
                |row| row.get(0),
            )?;
            if belongs == 0 {
                bail!("Option {} does not belong to poll {}", option_id, poll_id);
            }

            let tx = conn.transaction()?;
            if allow_multiple {
                let removed = tx.execute(
                    "DELETE FROM poll_votes WHERE option_id = ?1 AND user_id = ?2",
                    (option_id, user_id),
                )?;
                if removed == 0 {
                    tx.execute(
                        "INSERT INTO poll_votes (option_id, user_id) VALUES (?1, ?2)",
                        (option_id, user_id),
                    )?;
                }
            } else {
                tx.execute(
                    "DELETE FROM poll_votes WHERE user_id = ?1
                     AND option_id IN (SELECT id FROM poll_options WHERE poll_id = ?2)",
                    (user_id, poll_id),
                )?;
                tx.execute(
                    "INSERT INTO poll_votes (option_id, user_id) VALUES (?1, ?2)",
                    (option_id, user_id),
                )?;
            }
            tx.commit()?;

            query_poll(conn, poll_id)?.ok_or_else(|| anyhow!("Poll disappeared: {}", poll_id))
        })
    }

    pub fn delete_poll(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM poll_votes WHERE option_id IN (SELECT id FROM poll_options WHERE poll_id = ?1)",
                [id],
            )?;
            tx.execute("DELETE FROM poll_options WHERE poll_id = ?1", [id])?;
            let n = tx.execute("DELETE FROM polls WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(n > 0)
        })
    }
}

fn expire_if_due(conn: &Connection, poll_id: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE polls SET is_active = 0
         WHERE id = ?1 AND is_active = 1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        rusqlite::params![poll_id, now.to_rfc3339()],
    )?;
    Ok(())
}

fn query_poll(conn: &Connection, id: &str) -> Result<Option<Poll>> {
    let header = conn
        .query_row(
            "SELECT id, conversation_id, author_id, question, allow_multiple, expires_at, is_active, created_at
             FROM polls WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)? != 0,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)? != 0,
                    row.get::<_, String>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((id, conversation_id, author_id, question, allow_multiple, expires_at, is_active, created_at)) = header
    else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT o.id, o.label, v.user_id
         FROM poll_options o
         LEFT JOIN poll_votes v ON v.option_id = o.id
         WHERE o.poll_id = ?1
         ORDER BY o.idx, o.rowid",
    )?;
    let rows = stmt
        .query_map([&id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut options: Vec<PollOption> = Vec::new();
    for (option_id, label, voter) in rows {
        let option_uuid = parse_uuid(&option_id);
        if options.last().map(|o: &PollOption| o.id) != Some(option_uuid) {
            options.push(PollOption {
                id: option_uuid,
                label,
                voters: Vec::new(),
            });
        }
        if let (Some(voter), Some(last)) = (voter, options.last_mut()) {
            last.voters.push(parse_uuid(&voter));
        }
    }

    Ok(Some(Poll {
        id: parse_uuid(&id),
        conversation_id: parse_uuid(&conversation_id),
        author_id: parse_uuid(&author_id),
        question,
        options,
        allow_multiple,
        expires_at: expires_at.as_deref().map(|e| parse_timestamp(e, &id)),
        is_active,
        created_at: parse_timestamp(&created_at, &id),
    }))
}

fn parse_uuid(s: &str) -> Uuid {
    s.parse().unwrap_or_else(|e| {
        warn!("Corrupt poll uuid '{}': {}", s, e);
        Uuid::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn poll_fixture(allow_multiple: bool) -> (Database, String, Vec<String>, String, String) {
        let db = Database::open_in_memory().unwrap();
        let uid = Uuid::new_v4().to_string();
        db.create_user(&uid, "ana", "hash").unwrap();
        let cid = "00000000-0000-0000-0000-000000000001".to_string();

        let poll_id = Uuid::new_v4().to_string();
        let options: Vec<(String, String)> = ["red", "green", "blue"]
            .iter()
            .map(|l| (Uuid::new_v4().to_string(), l.to_string()))
            .collect();
        db.create_poll(&poll_id, &cid, &uid, "favourite?", &options, allow_multiple, None, Utc::now())
            .unwrap();

        let option_ids = options.into_iter().map(|(id, _)| id).collect();
        (db, poll_id, option_ids, uid, cid)
    }

    #[test]
    fn exclusive_vote_clears_previous_options() {
        let (db, poll_id, opts, uid, _cid) = poll_fixture(false);

        db.cast_vote(&poll_id, &opts[0], &uid, Utc::now()).unwrap();
        let poll = db.cast_vote(&poll_id, &opts[1], &uid, Utc::now()).unwrap();

        let total: usize = poll.options.iter().map(|o| o.voters.len()).sum();
        assert_eq!(total, 1);
        assert!(poll.options[1].voters.contains(&uid.parse().unwrap()));
        assert!(poll.options[0].voters.is_empty());
    }

    #[test]
    fn multiple_choice_vote_toggles() {
        let (db, poll_id, opts, uid, _cid) = poll_fixture(true);

        db.cast_vote(&poll_id, &opts[0], &uid, Utc::now()).unwrap();
        let poll = db.cast_vote(&poll_id, &opts[1], &uid, Utc::now()).unwrap();
        let total: usize = poll.options.iter().map(|o| o.voters.len()).sum();
        assert_eq!(total, 2);

        // Second vote on the same option removes it
        let poll = db.cast_vote(&poll_id, &opts[0], &uid, Utc::now()).unwrap();
        assert!(poll.options[0].voters.is_empty());
        assert_eq!(poll.options[1].voters.len(), 1);
    }

    #[test]
    fn expiry_is_lazy_and_blocks_votes() {
        let db = Database::open_in_memory().unwrap();
        let uid = Uuid::new_v4().to_string();
        db.create_user(&uid, "ana", "hash").unwrap();
        let cid = "00000000-0000-0000-0000-000000000001".to_string();

        let poll_id = Uuid::new_v4().to_string();
        let opt = (Uuid::new_v4().to_string(), "only".to_string());
        let created = Utc::now();
        db.create_poll(
            &poll_id,
            &cid,
            &uid,
            "late?",
            std::slice::from_ref(&opt),
            false,
            Some(created + Duration::seconds(30)),
            created,
        )
        .unwrap();

        // Before expiry the poll is open
        let poll = db.get_poll(&poll_id, created).unwrap().unwrap();
        assert!(poll.is_active);

        // First access after the deadline flips it inactive
        let poll = db.get_poll(&poll_id, created + Duration::seconds(60)).unwrap().unwrap();
        assert!(!poll.is_active);

        assert!(db.cast_vote(&poll_id, &opt.0, &uid, created + Duration::seconds(60)).is_err());
    }

    #[test]
    fn delete_poll_removes_votes() {
        let (db, poll_id, opts, uid, _cid) = poll_fixture(false);
        db.cast_vote(&poll_id, &opts[0], &uid, Utc::now()).unwrap();

        assert!(db.delete_poll(&poll_id).unwrap());
        assert!(db.get_poll(&poll_id, Utc::now()).unwrap().is_none());
        assert!(!db.delete_poll(&poll_id).unwrap());
    }
}
