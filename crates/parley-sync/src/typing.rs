use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Quiet period after which a typist with no refresh is considered
/// stopped. The originator also sends an explicit stop; this is the
/// receiver-side fallback for a sender that went away mid-keystroke.
pub const TYPING_QUIET_PERIOD: Duration = Duration::seconds(3);

/// Who is typing in one conversation view.
///
/// The receiver holds no timers: staleness is evaluated lazily against the
/// clock value the caller passes in, so typing state costs nothing when
/// nobody looks at it.
#[derive(Debug, Default)]
pub struct TypingView {
    typists: HashMap<Uuid, Typist>,
}

#[derive(Debug)]
struct Typist {
    username: String,
    last_refresh: DateTime<Utc>,
}

impl TypingView {
    pub fn new() -> Self {
        Self::default()
    }

    /// A typing-start event arrived (or was refreshed).
    pub fn refresh(&mut self, user_id: Uuid, username: &str, now: DateTime<Utc>) {
        self.typists.insert(
            user_id,
            Typist {
                username: username.to_string(),
                last_refresh: now,
            },
        );
    }

    /// An explicit typing-stop from the originator.
    pub fn stop(&mut self, user_id: Uuid) {
        self.typists.remove(&user_id);
    }

    /// Users still typing at `now`, pruning anything past the quiet period.
    pub fn active(&mut self, now: DateTime<Utc>) -> Vec<(Uuid, String)> {
        self.typists
            .retain(|_, t| now - t.last_refresh < TYPING_QUIET_PERIOD);
        let mut active: Vec<(Uuid, String)> = self
            .typists
            .iter()
            .map(|(id, t)| (*id, t.username.clone()))
            .collect();
        active.sort_by(|a, b| a.1.cmp(&b.1));
        active
    }
}
