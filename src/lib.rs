//! Core runtime for the FTS Sales Manager desktop app: operation
//! tracking with admission control and timeouts, login rate limiting
//! with persistent lockouts, and credential verification against a
//! remote user table.
//!
//! The crate is UI-free. The shell supplies a [`table::RecordStore`]
//! for the remote base and a [`session::ConfigSink`] for presentation
//! state, then drives everything through [`session::AppContext`].

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod operation;
pub mod password;
pub mod periodic;
pub mod rate_limit;
pub mod registry;
pub mod session;
pub mod table;

pub use auth::{UserManager, UserProfile};
pub use config::{AuthSettings, CoreConfig, OperationSettings, RateLimitSettings};
pub use error::{CoreError, CoreResult};
pub use operation::{Operation, OperationState, OperationType};
pub use periodic::PeriodicTask;
pub use rate_limit::{RateDecision, RateLimiter};
pub use registry::{
    ActiveOperationSummary, AdmissionDecision, OperationRegistry, StatusSummary,
};
pub use session::{AppContext, ConfigSink, LoginOutcome};
pub use table::{
    CachedRecordStore, FieldMap, MemoryCache, MemoryStore, RecordCache, RecordStore, TableRecord,
};
