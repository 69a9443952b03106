use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::SyncError;
use parley_types::models::Poll;

/// Active-poll snapshots for one conversation view, fed by fetch and by
/// vote-created/updated/deleted events.
#[derive(Debug, Default)]
pub struct PollBoard {
    polls: HashMap<Uuid, Poll>,
}

impl PollBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite with a server snapshot. Server state is
    /// authoritative; there is no merge.
    pub fn upsert(&mut self, poll: Poll) {
        self.polls.insert(poll.id, poll);
    }

    pub fn remove(&mut self, id: Uuid) {
        self.polls.remove(&id);
    }

    pub fn get(&self, id: Uuid) -> Option<&Poll> {
        self.polls.get(&id)
    }

    /// Polls still open at `now`. Expiry is evaluated here, lazily; an
    /// expired poll is flipped inactive on access, not by a sweep.
    pub fn active(&mut self, now: DateTime<Utc>) -> Vec<&Poll> {
        for poll in self.polls.values_mut() {
            if poll.is_active && !poll.is_open(now) {
                poll.is_active = false;
            }
        }
        self.polls.values().filter(|p| p.is_active).collect()
    }

    /// Apply a vote locally (optimistic tally, same semantics as the
    /// server): with `allow_multiple = false` the voter is cleared from
    /// every option before being added; with `true`, membership in the
    /// chosen option toggles.
    pub fn cast_vote(
        &mut self,
        poll_id: Uuid,
        option_id: Uuid,
        voter: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let poll = self
            .polls
            .get_mut(&poll_id)
            .ok_or(SyncError::UnknownPoll(poll_id))?;

        if poll.is_active && !poll.is_open(now) {
            poll.is_active = false;
        }
        if !poll.is_active {
            return Err(SyncError::PollClosed(poll_id));
        }
        if !poll.options.iter().any(|o| o.id == option_id) {
            return Err(SyncError::UnknownOption {
                poll: poll_id,
                option: option_id,
            });
        }

        if poll.allow_multiple {
            let option = poll
                .options
                .iter_mut()
                .find(|o| o.id == option_id)
                .expect("option checked above");
            if let Some(pos) = option.voters.iter().position(|v| *v == voter) {
                option.voters.remove(pos);
            } else {
                option.voters.push(voter);
            }
        } else {
            for option in &mut poll.options {
                option.voters.retain(|v| *v != voter);
            }
            let option = poll
                .options
                .iter_mut()
                .find(|o| o.id == option_id)
                .expect("option checked above");
            option.voters.push(voter);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parley_types::models::PollOption;

    fn poll(allow_multiple: bool, expires_at: Option<DateTime<Utc>>) -> Poll {
        Poll {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            question: "lunch?".into(),
            options: (0..3)
                .map(|i| PollOption {
                    id: Uuid::new_v4(),
                    label: format!("option {i}"),
                    voters: vec![],
                })
                .collect(),
            allow_multiple,
            expires_at,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn exclusive_vote_holds_at_most_one_membership() {
        let mut board = PollBoard::new();
        let p = poll(false, None);
        let (pid, o0, o1) = (p.id, p.options[0].id, p.options[1].id);
        board.upsert(p);
        let voter = Uuid::new_v4();
        let now = Utc::now();

        board.cast_vote(pid, o0, voter, now).unwrap();
        board.cast_vote(pid, o1, voter, now).unwrap();

        let p = board.get(pid).unwrap();
        let total: usize = p.options.iter().map(|o| o.voters.len()).sum();
        assert_eq!(total, 1);
        assert_eq!(p.options[1].voters, vec![voter]);
    }

    #[test]
    fn multiple_choice_toggles_membership() {
        let mut board = PollBoard::new();
        let p = poll(true, None);
        let (pid, o0, o1) = (p.id, p.options[0].id, p.options[1].id);
        board.upsert(p);
        let voter = Uuid::new_v4();
        let now = Utc::now();

        board.cast_vote(pid, o0, voter, now).unwrap();
        board.cast_vote(pid, o1, voter, now).unwrap();
        board.cast_vote(pid, o0, voter, now).unwrap();

        let p = board.get(pid).unwrap();
        assert!(p.options[0].voters.is_empty());
        assert_eq!(p.options[1].voters, vec![voter]);
    }

    #[test]
    fn expired_poll_is_flipped_inactive_on_access() {
        let mut board = PollBoard::new();
        let created = Utc::now();
        let p = poll(false, Some(created + Duration::seconds(30)));
        let (pid, o0) = (p.id, p.options[0].id);
        board.upsert(p);

        assert_eq!(board.active(created).len(), 1);
        assert!(board.active(created + Duration::seconds(60)).is_empty());

        let err = board
            .cast_vote(pid, o0, Uuid::new_v4(), created + Duration::seconds(60))
            .unwrap_err();
        assert!(matches!(err, SyncError::PollClosed(_)));
    }

    #[test]
    fn vote_on_unknown_poll_or_option_errors() {
        let mut board = PollBoard::new();
        let p = poll(false, None);
        let pid = p.id;
        board.upsert(p);

        assert!(matches!(
            board.cast_vote(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Utc::now()),
            Err(SyncError::UnknownPoll(_))
        ));
        assert!(matches!(
            board.cast_vote(pid, Uuid::new_v4(), Uuid::new_v4(), Utc::now()),
            Err(SyncError::UnknownOption { .. })
        ));
    }
}
