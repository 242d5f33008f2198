//! Error taxonomy for the core runtime.
//!
//! Domain denials (rate limits, blocked operations, bad credentials) are
//! not errors here; they come back as decision values so callers can show
//! them to the user. `CoreError` is reserved for genuine failures.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The user index came up empty on first load. Starting without any
    /// verifiable credentials would silently deny every login, so this
    /// one surfaces as a fatal startup error.
    #[error("no active users available: {0}")]
    NoUsersLoaded(String),

    /// A remote table call failed.
    #[error("remote table '{table}' {action} failed: {message}")]
    Upstream {
        table: String,
        action: &'static str,
        message: String,
    },

    /// The rate-limit snapshot could not be read or written.
    #[error("rate limit state {action} failed at {path}: {message}")]
    Persistence {
        path: String,
        action: &'static str,
        message: String,
    },
}
