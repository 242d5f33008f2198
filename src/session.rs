//! Application context and the login/logout command flow.
//!
//! [`AppContext`] owns the three core services and threads login calls
//! through them in order: global rate limit, operation admission, then
//! credential verification. UI state lands in a caller-supplied
//! [`ConfigSink`], so the core never touches presentation config itself.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::{UserManager, UserProfile};
use crate::config::CoreConfig;
use crate::error::CoreResult;
use crate::operation::OperationType;
use crate::rate_limit::RateLimiter;
use crate::registry::{OperationRegistry, StatusSummary};
use crate::table::RecordStore;

/// Write half of the configuration layer. Implementations decide where
/// values land (settings file, UI store, test map).
pub trait ConfigSink: Send + Sync {
    fn set(&self, key: &str, value: Value);
}

pub const CONFIG_ACTIVE_VIEW: &str = "active_view";
pub const CONFIG_ACTIVE_ROLE: &str = "active_role";

/// Tagged login result for the UI: success carries the profile, denied
/// carries a user-presentable message, error means the app itself is in
/// no shape to authenticate.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoginOutcome {
    Success { profile: UserProfile },
    Denied { message: String },
    Error { message: String },
}

pub struct AppContext {
    registry: Arc<OperationRegistry>,
    rate_limiter: Arc<RateLimiter>,
    users: Arc<UserManager>,
}

impl AppContext {
    /// Build the full context: load the user index (fatal if empty),
    /// then start the timeout monitor and the rate-limit sweeper.
    pub fn initialize(
        config: CoreConfig,
        store: Arc<dyn RecordStore>,
        rate_limit_state_path: Option<PathBuf>,
    ) -> CoreResult<Self> {
        let context = Self::from_parts(
            Arc::new(OperationRegistry::new(config.operations.clone())),
            Arc::new(RateLimiter::new(config.rate_limit, rate_limit_state_path)),
            Arc::new(UserManager::new(config.auth.clone(), store)),
        );
        context.users.load_users()?;
        context.registry.start_timeout_monitor();
        context.rate_limiter.start_cleanup_task();
        info!("application context initialized");
        Ok(context)
    }

    /// Assemble a context from already-built services. Callers take on
    /// loading the user index and starting background tasks themselves.
    pub fn from_parts(
        registry: Arc<OperationRegistry>,
        rate_limiter: Arc<RateLimiter>,
        users: Arc<UserManager>,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            users,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn users(&self) -> &Arc<UserManager> {
        &self.users
    }

    pub fn status_summary(&self) -> StatusSummary {
        self.registry.get_status_summary()
    }

    /// Run the full login sequence for one attempt from `client_ip`.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
        sink: &dyn ConfigSink,
    ) -> LoginOutcome {
        let identifier = format!("{}:{}", username.to_lowercase(), client_ip);

        let decision = self.rate_limiter.check_rate_limit(&identifier);
        if !decision.allowed {
            warn!(identifier = %identifier, "login denied by rate limiter");
            return LoginOutcome::Denied {
                message: decision.message,
            };
        }

        let op_id = match self.registry.try_start_operation(
            OperationType::UserAuthentication,
            &format!("Login for {username}"),
            None,
        ) {
            Ok(id) => id,
            Err(denial) => {
                return LoginOutcome::Denied {
                    message: denial
                        .reason
                        .unwrap_or_else(|| "authentication already in progress".into()),
                };
            }
        };
        self.registry
            .set_operation_metadata(&op_id, "client_ip", json!(client_ip));

        if self.users.user_count() == 0 {
            self.registry.fail_operation(&op_id, "user directory not loaded");
            return LoginOutcome::Error {
                message: "user directory not loaded".into(),
            };
        }

        self.rate_limiter.record_attempt(&identifier);
        match self.users.authenticate(username, password) {
            Some(profile) => {
                self.rate_limiter.clear_attempts(&identifier);
                self.registry.set_current_user(&profile.username);
                sink.set(CONFIG_ACTIVE_VIEW, json!(profile.view));
                sink.set(CONFIG_ACTIVE_ROLE, json!(profile.role));
                self.registry
                    .complete_operation(&op_id, Some(json!({ "username": profile.username })));
                LoginOutcome::Success { profile }
            }
            None => {
                self.registry
                    .fail_operation(&op_id, "invalid credentials or locked account");
                LoginOutcome::Denied {
                    message: "Invalid username or password.".into(),
                }
            }
        }
    }

    /// End the session: cancel whatever is still running, clear the
    /// current user, and reset session view state through the sink.
    pub fn logout(&self, sink: &dyn ConfigSink) {
        let cancelled = self.registry.force_cancel_all_operations();
        self.registry.clear_current_user();
        sink.set(CONFIG_ACTIVE_VIEW, Value::Null);
        sink.set(CONFIG_ACTIVE_ROLE, Value::Null);
        info!(cancelled, "session logged out");
    }

    /// Stop background workers. Safe to call more than once.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        self.rate_limiter.shutdown();
        info!("application context shut down");
    }
}
