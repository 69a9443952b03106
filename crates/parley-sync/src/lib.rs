//! Client-side reconciliation: merges server-pushed gateway events with
//! locally-optimistic state, once per connected view.
//!
//! The engine in [`engine`] is a plain state machine with no I/O and no
//! timers. [`runner::ViewRunner`] drives it: it owns the engine, is fed
//! immutable events by the connection task, and talks to the external
//! store through the [`runner::ViewStore`] contract, rolling optimistic
//! state back when a confirmation fails.

pub mod engine;
pub mod pins;
pub mod polls;
pub mod runner;
pub mod threads;
pub mod typing;

use uuid::Uuid;

/// Failure reported by the external store collaborator.
#[derive(Debug, Clone, thiserror::Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Errors surfaced by view reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The optimistic send failed. `draft` carries the user's text back so
    /// the UI can restore it — content is never silently dropped.
    #[error("send failed (draft restored): {source}")]
    SendFailed { draft: String, source: StoreError },

    #[error("poll {0} is closed")]
    PollClosed(Uuid),

    #[error("unknown poll {0}")]
    UnknownPoll(Uuid),

    #[error("option {option} does not belong to poll {poll}")]
    UnknownOption { poll: Uuid, option: Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),
}
