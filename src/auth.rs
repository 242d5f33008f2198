//! User credential verification over the remote Users table.
//!
//! The manager keeps an in-memory index of active users (keyed by
//! lowercased username) and verifies logins against PBKDF2 hash blobs.
//! Records still carrying plaintext passwords verify by direct comparison
//! and are upgraded to hashes on the first successful login. A local
//! failed-attempt map locks individual accounts independently of the
//! global rate limiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::clock;
use crate::config::AuthSettings;
use crate::error::{CoreError, CoreResult};
use crate::password;
use crate::periodic::lock_or_recover;
use crate::table::{FieldMap, RecordStore, TableRecord};

const FIELD_USERNAME: &str = "Username";
const FIELD_PASSWORD: &str = "Password";
const FIELD_VIEW: &str = "View";
const FIELD_ROLE: &str = "Role";
const FIELD_COLLABORATOR: &str = "Collaborator";
const FIELD_ACTIVE: &str = "Active";
const FIELD_LAST_LOGIN: &str = "Last Login";
const FIELD_LOGIN_COUNT: &str = "Login Count";

/// What the UI gets back after a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub username: String,
    pub view: String,
    pub role: String,
    pub collaborator: Option<String>,
    pub record_id: String,
}

#[derive(Debug, Clone)]
struct UserEntry {
    username: String,
    /// PBKDF2 hash blob, or legacy plaintext until first login.
    secret: String,
    view: String,
    role: String,
    collaborator: Option<String>,
    record_id: String,
    login_count: u64,
}

#[derive(Default)]
struct AuthState {
    /// Lowercased username to entry.
    users: HashMap<String, UserEntry>,
    /// Username as typed to failed-attempt timestamps.
    failures: HashMap<String, Vec<f64>>,
}

pub struct UserManager {
    settings: AuthSettings,
    store: Arc<dyn RecordStore>,
    state: Mutex<AuthState>,
}

impl UserManager {
    pub fn new(settings: AuthSettings, store: Arc<dyn RecordStore>) -> Self {
        Self {
            settings,
            store,
            state: Mutex::new(AuthState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AuthState> {
        lock_or_recover(&self.state)
    }

    /// Initial index load. An empty index is an error here: the app
    /// cannot run with nobody able to log in.
    pub fn load_users(&self) -> CoreResult<usize> {
        let records = self.store.fetch_all(&self.settings.users_table, false)?;
        let index = build_index(&records);
        if index.is_empty() {
            return Err(CoreError::NoUsersLoaded(format!(
                "table '{}' has no active users with credentials",
                self.settings.users_table
            )));
        }
        let count = index.len();
        self.lock_state().users = index;
        info!(users = count, "user index loaded");
        Ok(count)
    }

    /// Re-fetch and rebuild the index, bypassing any cache. On failure
    /// (or an implausible empty result) the previous index stays live.
    /// Returns the size of whatever index is live afterwards.
    pub fn reload_users(&self) -> usize {
        match self.store.fetch_all(&self.settings.users_table, true) {
            Ok(records) => {
                let index = build_index(&records);
                let mut state = self.lock_state();
                if index.is_empty() {
                    warn!("reload produced an empty user index, keeping previous");
                    return state.users.len();
                }
                let count = index.len();
                state.users = index;
                info!(users = count, "user index reloaded");
                count
            }
            Err(err) => {
                error!(error = %err, "user reload failed, keeping previous index");
                self.lock_state().users.len()
            }
        }
    }

    pub fn user_count(&self) -> usize {
        self.lock_state().users.len()
    }

    /// Case-insensitive profile lookup, no credential check.
    pub fn get_profile(&self, username: &str) -> Option<UserProfile> {
        let state = self.lock_state();
        state.users.get(&username.to_lowercase()).map(profile_from)
    }

    /// Verify a login. Returns the profile on success, `None` on any
    /// failure: unknown user, wrong password, or a locked account.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<UserProfile> {
        self.authenticate_at(username, password, clock::epoch_seconds())
    }

    pub fn authenticate_at(&self, username: &str, password: &str, now: f64) -> Option<UserProfile> {
        let key = username.to_lowercase();

        let entry = {
            let mut state = self.lock_state();
            if Self::locked(&mut state, username, now, &self.settings) {
                warn!(username = %username, "login refused: account locked");
                return None;
            }
            state.users.get(&key).cloned()
        };

        let Some(entry) = entry else {
            self.note_failure(username, now);
            warn!(username = %username, "login refused: unknown or inactive user");
            return None;
        };

        // Key derivation is deliberately slow; keep it outside the lock.
        let (ok, was_plaintext) = match password::verify_password(password, &entry.secret) {
            Some(valid) => (valid, false),
            None => (entry.secret == password, true),
        };

        if !ok {
            self.note_failure(username, now);
            warn!(username = %username, "login refused: bad credentials");
            return None;
        }

        if was_plaintext {
            self.upgrade_credential(&key, &entry, password);
        }

        let login_count = {
            let mut state = self.lock_state();
            state.failures.remove(username);
            match state.users.get_mut(&key) {
                Some(live) => {
                    live.login_count += 1;
                    live.login_count
                }
                None => entry.login_count + 1,
            }
        };
        self.spawn_login_bookkeeping(&entry.record_id, login_count);

        info!(username = %entry.username, "user authenticated");
        Some(profile_from(&entry))
    }

    pub fn is_account_locked(&self, username: &str) -> bool {
        self.is_account_locked_at(username, clock::epoch_seconds())
    }

    pub fn is_account_locked_at(&self, username: &str, now: f64) -> bool {
        let mut state = self.lock_state();
        Self::locked(&mut state, username, now, &self.settings)
    }

    pub fn record_failed_attempt(&self, username: &str) {
        self.record_failed_attempt_at(username, clock::epoch_seconds());
    }

    pub fn record_failed_attempt_at(&self, username: &str, now: f64) {
        self.note_failure(username, now);
    }

    pub fn clear_failed_attempts(&self, username: &str) {
        let mut state = self.lock_state();
        if state.failures.remove(username).is_some() {
            info!(username = %username, "failed-attempt history cleared");
        }
    }

    /// Change a password after re-verifying the old one.
    pub fn change_password(&self, username: &str, old_password: &str, new_password: &str) -> bool {
        if self.authenticate(username, old_password).is_none() {
            warn!(username = %username, "password change rejected: reauthentication failed");
            return false;
        }
        if !password::validate_password_strength(new_password) {
            warn!(username = %username, "password change rejected: weak password");
            return false;
        }
        self.write_credential(username, new_password, "change")
    }

    /// Administrative reset: no old password, but the caller must present
    /// the configured admin token. Clears any local lockout so the user
    /// can log straight back in.
    pub fn reset_password(&self, username: &str, new_password: &str, admin_token: &str) -> bool {
        let expected = match self.settings.admin_token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => {
                warn!("password reset refused: no admin token configured");
                return false;
            }
        };
        if admin_token != expected {
            warn!(username = %username, "password reset refused: bad admin token");
            return false;
        }
        if !password::validate_password_strength(new_password) {
            warn!(username = %username, "password reset rejected: weak password");
            return false;
        }
        let updated = self.write_credential(username, new_password, "reset");
        if updated {
            self.clear_failed_attempts(username);
        }
        updated
    }

    /// Create a user with a hashed credential, then reload the index so
    /// the account is usable immediately. Returns the new record id.
    pub fn create_user(&self, username: &str, password: &str, role: &str) -> Option<String> {
        let username = username.trim();
        if username.is_empty() {
            warn!("user creation rejected: empty username");
            return None;
        }
        if !password::validate_password_strength(password) {
            warn!(username = %username, "user creation rejected: weak password");
            return None;
        }
        if self.lock_state().users.contains_key(&username.to_lowercase()) {
            warn!(username = %username, "user creation rejected: username taken");
            return None;
        }

        let mut fields = FieldMap::new();
        fields.insert(FIELD_USERNAME.to_string(), Value::String(username.to_string()));
        fields.insert(
            FIELD_PASSWORD.to_string(),
            Value::String(password::hash_password(password)),
        );
        fields.insert(FIELD_ROLE.to_string(), Value::String(role.to_string()));
        fields.insert(FIELD_ACTIVE.to_string(), Value::Bool(true));

        match self.store.create_record(&self.settings.users_table, &fields) {
            Ok(record_id) => {
                self.reload_users();
                info!(username = %username, record_id = %record_id, "user created");
                Some(record_id)
            }
            Err(err) => {
                error!(username = %username, error = %err, "user creation failed");
                None
            }
        }
    }

    /// Prune this user's failure window and report whether the remainder
    /// crosses the lockout threshold.
    fn locked(state: &mut AuthState, username: &str, now: f64, settings: &AuthSettings) -> bool {
        let window_start = now - settings.lockout_window_secs as f64;
        let mut emptied = false;
        if let Some(stamps) = state.failures.get_mut(username) {
            stamps.retain(|&t| t > window_start);
            if stamps.len() >= settings.max_attempts as usize {
                return true;
            }
            emptied = stamps.is_empty();
        }
        if emptied {
            state.failures.remove(username);
        }
        false
    }

    fn note_failure(&self, username: &str, now: f64) {
        let mut state = self.lock_state();
        let window_start = now - self.settings.lockout_window_secs as f64;
        let stamps = state.failures.entry(username.to_string()).or_default();
        stamps.retain(|&t| t > window_start);
        stamps.push(now);
        if stamps.len() >= self.settings.max_attempts as usize {
            warn!(
                username = %username,
                failures = stamps.len(),
                "account reached local lockout threshold"
            );
        }
    }

    /// Replace a legacy plaintext credential with a hash, remote first so
    /// a failed write leaves the old secret usable.
    fn upgrade_credential(&self, key: &str, entry: &UserEntry, password: &str) {
        let upgraded = password::hash_password(password);
        let mut fields = FieldMap::new();
        fields.insert(FIELD_PASSWORD.to_string(), Value::String(upgraded.clone()));
        match self
            .store
            .update_record(&self.settings.users_table, &entry.record_id, &fields)
        {
            Ok(()) => {
                let mut state = self.lock_state();
                if let Some(live) = state.users.get_mut(key) {
                    live.secret = upgraded;
                }
                info!(username = %entry.username, "legacy credential upgraded to hash");
            }
            Err(err) => {
                error!(
                    username = %entry.username,
                    error = %err,
                    "credential upgrade write failed, keeping legacy secret"
                );
            }
        }
    }

    fn write_credential(&self, username: &str, new_password: &str, note: &'static str) -> bool {
        let key = username.to_lowercase();
        let record_id = {
            let state = self.lock_state();
            let Some(entry) = state.users.get(&key) else {
                warn!(username = %username, "credential write refused: unknown user");
                return false;
            };
            entry.record_id.clone()
        };

        let hash = password::hash_password(new_password);
        let mut fields = FieldMap::new();
        fields.insert(FIELD_PASSWORD.to_string(), Value::String(hash.clone()));
        match self
            .store
            .update_record(&self.settings.users_table, &record_id, &fields)
        {
            Ok(()) => {
                let mut state = self.lock_state();
                if let Some(live) = state.users.get_mut(&key) {
                    live.secret = hash;
                }
                info!(username = %username, path = note, "credential updated");
                true
            }
            Err(err) => {
                error!(username = %username, error = %err, "credential write failed");
                false
            }
        }
    }

    /// Update last-login bookkeeping on the remote record off-thread; a
    /// login never waits on it.
    fn spawn_login_bookkeeping(&self, record_id: &str, login_count: u64) {
        let store = Arc::clone(&self.store);
        let table = self.settings.users_table.clone();
        let record_id = record_id.to_string();
        let stamp = clock::iso8601_now();
        let spawned = thread::Builder::new()
            .name("login-bookkeeping".into())
            .spawn(move || {
                let mut fields = FieldMap::new();
                fields.insert(FIELD_LAST_LOGIN.to_string(), Value::String(stamp));
                fields.insert(FIELD_LOGIN_COUNT.to_string(), Value::from(login_count));
                if let Err(err) = store.update_record(&table, &record_id, &fields) {
                    warn!(record_id = %record_id, error = %err, "last-login update failed");
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "login bookkeeping thread failed to start");
        }
    }
}

fn profile_from(entry: &UserEntry) -> UserProfile {
    UserProfile {
        username: entry.username.clone(),
        view: entry.view.clone(),
        role: entry.role.clone(),
        collaborator: entry.collaborator.clone(),
        record_id: entry.record_id.clone(),
    }
}

/// Index remote records, keeping only active users with a non-empty
/// credential. First record wins on duplicate usernames.
fn build_index(records: &[TableRecord]) -> HashMap<String, UserEntry> {
    let mut index = HashMap::new();
    for record in records {
        let fields = &record.fields;
        let Some(username) = string_field(fields, FIELD_USERNAME) else {
            continue;
        };
        let Some(secret) = string_field(fields, FIELD_PASSWORD) else {
            debug!(username = %username, "skipping user without a credential");
            continue;
        };
        if !bool_field(fields, FIELD_ACTIVE) {
            debug!(username = %username, "skipping inactive user");
            continue;
        }
        let key = username.to_lowercase();
        if index.contains_key(&key) {
            warn!(username = %username, "duplicate username in table, keeping first");
            continue;
        }
        index.insert(
            key,
            UserEntry {
                username,
                secret,
                view: string_field(fields, FIELD_VIEW).unwrap_or_default(),
                role: string_field(fields, FIELD_ROLE).unwrap_or_default(),
                collaborator: string_field(fields, FIELD_COLLABORATOR),
                record_id: record.id.clone(),
                login_count: fields.get(FIELD_LOGIN_COUNT).and_then(Value::as_u64).unwrap_or(0),
            },
        );
    }
    index
}

fn string_field(fields: &FieldMap, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn bool_field(fields: &FieldMap, name: &str) -> bool {
    fields.get(name).and_then(Value::as_bool).unwrap_or(false)
}
