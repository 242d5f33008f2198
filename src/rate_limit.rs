//! Login attempt rate limiting with lockouts and an on-disk snapshot.
//!
//! Attempts are tracked per identifier (e.g. `"username:ip"`) in a
//! sliding window. Hitting the attempt ceiling institutes a timed
//! lockout. State is snapshotted to JSON on every change and swept
//! periodically; persistence failures degrade to in-memory limiting
//! rather than blocking logins.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::RateLimitSettings;
use crate::error::{CoreError, CoreResult};
use crate::periodic::{lock_or_recover, PeriodicTask};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of a rate-limit check. The message is user-presentable either
/// way: attempts remaining when allowed, lockout duration when denied.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub message: String,
}

impl RateDecision {
    fn allowed(message: String) -> Self {
        Self {
            allowed: true,
            message,
        }
    }

    fn denied(message: String) -> Self {
        Self {
            allowed: false,
            message,
        }
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    attempts: HashMap<String, Vec<f64>>,
    lockouts: HashMap<String, f64>,
}

/// On-disk shape. `config` rides along so an operator reading the file
/// can tell which limits produced it.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct LimiterSnapshot {
    attempts: HashMap<String, Vec<f64>>,
    lockouts: HashMap<String, f64>,
    timestamp: String,
    config: RateLimitSettings,
}

struct LimiterInner {
    settings: RateLimitSettings,
    state_path: Option<PathBuf>,
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        lock_or_recover(&self.state)
    }

    /// Drop this identifier's out-of-window attempts and expired lockout.
    fn purge_identifier(&self, state: &mut LimiterState, identifier: &str, now: f64) {
        let window_start = now - self.settings.window_seconds as f64;
        let mut emptied = false;
        if let Some(stamps) = state.attempts.get_mut(identifier) {
            stamps.retain(|&t| t > window_start);
            emptied = stamps.is_empty();
        }
        if emptied {
            state.attempts.remove(identifier);
        }
        let expired = state
            .lockouts
            .get(identifier)
            .map(|&expiry| expiry <= now)
            .unwrap_or(false);
        if expired {
            state.lockouts.remove(identifier);
            info!(identifier = %identifier, "lockout expired");
        }
    }

    /// Full sweep across all identifiers. Returns how many entries went
    /// away (emptied attempt histories plus expired lockouts).
    fn sweep(&self, state: &mut LimiterState, now: f64) -> usize {
        let window_start = now - self.settings.window_seconds as f64;
        let mut removed = 0;
        state.attempts.retain(|_, stamps| {
            stamps.retain(|&t| t > window_start);
            if stamps.is_empty() {
                removed += 1;
                false
            } else {
                true
            }
        });
        let lockouts_before = state.lockouts.len();
        state.lockouts.retain(|_, expiry| *expiry > now);
        removed += lockouts_before - state.lockouts.len();
        removed
    }

    fn cleanup_at(&self, now: f64) -> usize {
        let mut state = self.lock_state();
        let removed = self.sweep(&mut state, now);
        if removed > 0 {
            debug!(removed, "rate limit state swept");
            self.persist(&state);
        }
        removed
    }

    /// Write the snapshot, logging and swallowing failures so limiting
    /// keeps working in memory when the disk does not cooperate.
    fn persist(&self, state: &LimiterState) {
        let Some(path) = &self.state_path else {
            return;
        };
        if let Err(err) = write_snapshot(path, &self.settings, state) {
            warn!(error = %err, "failed to persist rate limit state");
        }
    }
}

pub struct RateLimiter {
    inner: Arc<LimiterInner>,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl RateLimiter {
    /// Build a limiter, restoring any snapshot found at `state_path`.
    /// With `None` the limiter runs purely in memory.
    pub fn new(settings: RateLimitSettings, state_path: Option<PathBuf>) -> Self {
        let mut state = LimiterState::default();
        if let Some(path) = &state_path {
            if let Some(snapshot) = load_snapshot(path) {
                if snapshot.config != settings {
                    debug!(
                        path = %path.display(),
                        "snapshot was written under different limits, keeping live settings"
                    );
                }
                info!(
                    identifiers = snapshot.attempts.len(),
                    lockouts = snapshot.lockouts.len(),
                    "restored rate limit state"
                );
                state.attempts = snapshot.attempts;
                state.lockouts = snapshot.lockouts;
            }
        }
        Self {
            inner: Arc::new(LimiterInner {
                settings,
                state_path,
                state: Mutex::new(state),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Decide whether another attempt is allowed right now. Crossing the
    /// attempt ceiling institutes a lockout as a side effect; the caller
    /// still records the attempt itself via [`record_attempt`].
    ///
    /// [`record_attempt`]: Self::record_attempt
    pub fn check_rate_limit(&self, identifier: &str) -> RateDecision {
        self.check_rate_limit_at(identifier, clock::epoch_seconds())
    }

    pub fn check_rate_limit_at(&self, identifier: &str, now: f64) -> RateDecision {
        let mut state = self.inner.lock_state();
        self.inner.purge_identifier(&mut state, identifier, now);

        if let Some(expiry) = state.lockouts.get(identifier).copied() {
            let remaining = expiry - now;
            warn!(
                identifier = %identifier,
                remaining_secs = remaining,
                "attempt while locked out"
            );
            return RateDecision::denied(format!(
                "Too many attempts. Try again in {}.",
                clock::format_remaining(remaining)
            ));
        }

        let count = state.attempts.get(identifier).map(Vec::len).unwrap_or(0);
        let max = self.inner.settings.max_attempts as usize;
        if count >= max {
            let lockout_secs = self.inner.settings.lockout_seconds as f64;
            state
                .lockouts
                .insert(identifier.to_string(), now + lockout_secs);
            warn!(identifier = %identifier, attempts = count, "lockout instituted");
            self.inner.persist(&state);
            return RateDecision::denied(format!(
                "Too many attempts. Locked out for {}.",
                clock::format_remaining(lockout_secs)
            ));
        }

        RateDecision::allowed(format!("{} attempts remaining", max - count))
    }

    /// Record that an attempt was made. Callers invoke this once per
    /// login try, whatever the outcome.
    pub fn record_attempt(&self, identifier: &str) {
        self.record_attempt_at(identifier, clock::epoch_seconds());
    }

    pub fn record_attempt_at(&self, identifier: &str, now: f64) {
        let mut state = self.inner.lock_state();
        self.inner.purge_identifier(&mut state, identifier, now);
        let stamps = state.attempts.entry(identifier.to_string()).or_default();
        stamps.push(now);
        debug!(identifier = %identifier, count = stamps.len(), "attempt recorded");
        self.inner.persist(&state);
    }

    /// Wipe an identifier's history and lockout, e.g. after a successful
    /// login.
    pub fn clear_attempts(&self, identifier: &str) {
        let mut state = self.inner.lock_state();
        let had_attempts = state.attempts.remove(identifier).is_some();
        let had_lockout = state.lockouts.remove(identifier).is_some();
        if had_attempts || had_lockout {
            debug!(identifier = %identifier, "attempt history cleared");
            self.inner.persist(&state);
        }
    }

    pub fn is_locked_out(&self, identifier: &str) -> bool {
        self.is_locked_out_at(identifier, clock::epoch_seconds())
    }

    pub fn is_locked_out_at(&self, identifier: &str, now: f64) -> bool {
        let mut state = self.inner.lock_state();
        self.inner.purge_identifier(&mut state, identifier, now);
        state.lockouts.contains_key(identifier)
    }

    /// Attempts currently inside the window for this identifier.
    pub fn get_attempts_count(&self, identifier: &str) -> usize {
        self.get_attempts_count_at(identifier, clock::epoch_seconds())
    }

    pub fn get_attempts_count_at(&self, identifier: &str, now: f64) -> usize {
        let mut state = self.inner.lock_state();
        self.inner.purge_identifier(&mut state, identifier, now);
        state.attempts.get(identifier).map(Vec::len).unwrap_or(0)
    }

    /// Purge stale attempts and expired lockouts across all identifiers,
    /// persisting if anything changed. The background sweeper runs this
    /// once a minute.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup_at(clock::epoch_seconds())
    }

    pub fn cleanup_at(&self, now: f64) -> usize {
        self.inner.cleanup_at(now)
    }

    /// Launch the background sweeper. Does nothing if already running.
    pub fn start_cleanup_task(&self) {
        let mut slot = lock_or_recover(&self.sweeper);
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        match PeriodicTask::spawn("rate-limit-sweeper", CLEANUP_INTERVAL, move || {
            inner.cleanup_at(clock::epoch_seconds());
        }) {
            Ok(task) => *slot = Some(task),
            Err(err) => {
                warn!(error = %err, "rate limit sweeper thread failed to start");
            }
        }
    }

    /// Stop the background sweeper and wait for it to exit.
    pub fn shutdown(&self) {
        if let Some(mut task) = lock_or_recover(&self.sweeper).take() {
            task.stop();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn persist_err(path: &Path, action: &'static str, err: impl fmt::Display) -> CoreError {
    CoreError::Persistence {
        path: path.display().to_string(),
        action,
        message: err.to_string(),
    }
}

/// Write the snapshot to a sibling temp file, then rename it into place
/// so readers never observe a half-written file.
fn write_snapshot(
    path: &Path,
    settings: &RateLimitSettings,
    state: &LimiterState,
) -> CoreResult<()> {
    let snapshot = LimiterSnapshot {
        attempts: state.attempts.clone(),
        lockouts: state.lockouts.clone(),
        timestamp: clock::iso8601_now(),
        config: *settings,
    };
    let body = serde_json::to_string_pretty(&snapshot)
        .map_err(|err| persist_err(path, "serialize", err))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| persist_err(path, "create dir", err))?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body).map_err(|err| persist_err(&tmp, "write", err))?;
    fs::rename(&tmp, path).map_err(|err| persist_err(path, "rename", err))?;
    Ok(())
}

/// Read a snapshot back, treating a missing or unreadable file as a
/// clean start.
fn load_snapshot(path: &Path) -> Option<LimiterSnapshot> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return None,
    };
    match serde_json::from_str(&content) {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "rate limit snapshot unreadable, starting clean"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitSettings::default(), None)
    }

    #[test]
    fn allows_with_remaining_budget() {
        let limiter = limiter();
        let now = 10_000.0;
        let decision = limiter.check_rate_limit_at("ana:10.0.0.8", now);
        assert!(decision.allowed);
        assert_eq!(decision.message, "5 attempts remaining");

        limiter.record_attempt_at("ana:10.0.0.8", now);
        limiter.record_attempt_at("ana:10.0.0.8", now + 1.0);
        let decision = limiter.check_rate_limit_at("ana:10.0.0.8", now + 2.0);
        assert!(decision.allowed);
        assert_eq!(decision.message, "3 attempts remaining");
    }

    #[test]
    fn ceiling_institutes_lockout() {
        let limiter = limiter();
        let now = 10_000.0;
        for i in 0..5 {
            limiter.record_attempt_at("ana:10.0.0.8", now + i as f64);
        }

        let decision = limiter.check_rate_limit_at("ana:10.0.0.8", now + 5.0);
        assert!(!decision.allowed);
        assert_eq!(decision.message, "Too many attempts. Locked out for 15m 0s.");
        assert!(limiter.is_locked_out_at("ana:10.0.0.8", now + 6.0));

        // A later check reports the shrinking remainder.
        let decision = limiter.check_rate_limit_at("ana:10.0.0.8", now + 305.0);
        assert!(!decision.allowed);
        assert!(decision.message.starts_with("Too many attempts. Try again in 10m"));
    }

    #[test]
    fn lockout_expires_and_budget_recovers() {
        let limiter = limiter();
        let now = 10_000.0;
        for _ in 0..5 {
            limiter.record_attempt_at("omar:10.0.0.9", now);
        }
        assert!(!limiter.check_rate_limit_at("omar:10.0.0.9", now).allowed);

        // Past the lockout (and the window), everything is forgotten.
        let later = now + 901.0;
        assert!(!limiter.is_locked_out_at("omar:10.0.0.9", later));
        let decision = limiter.check_rate_limit_at("omar:10.0.0.9", later);
        assert!(decision.allowed);
        assert_eq!(decision.message, "5 attempts remaining");
    }

    #[test]
    fn window_slides_out_old_attempts() {
        let limiter = limiter();
        let now = 10_000.0;
        limiter.record_attempt_at("ana:10.0.0.8", now);
        limiter.record_attempt_at("ana:10.0.0.8", now + 100.0);
        assert_eq!(limiter.get_attempts_count_at("ana:10.0.0.8", now + 150.0), 2);
        // First attempt falls out of the 300s window.
        assert_eq!(limiter.get_attempts_count_at("ana:10.0.0.8", now + 301.0), 1);
        assert_eq!(limiter.get_attempts_count_at("ana:10.0.0.8", now + 500.0), 0);
    }

    #[test]
    fn clear_attempts_restores_full_budget() {
        let limiter = limiter();
        let now = 10_000.0;
        for _ in 0..5 {
            limiter.record_attempt_at("ana:10.0.0.8", now);
        }
        assert!(!limiter.check_rate_limit_at("ana:10.0.0.8", now).allowed);

        limiter.clear_attempts("ana:10.0.0.8");
        assert!(!limiter.is_locked_out_at("ana:10.0.0.8", now));
        let decision = limiter.check_rate_limit_at("ana:10.0.0.8", now);
        assert!(decision.allowed);
        assert_eq!(decision.message, "5 attempts remaining");
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = limiter();
        let now = 10_000.0;
        for _ in 0..5 {
            limiter.record_attempt_at("ana:10.0.0.8", now);
        }
        assert!(!limiter.check_rate_limit_at("ana:10.0.0.8", now).allowed);
        assert!(limiter.check_rate_limit_at("ana:10.0.0.99", now).allowed);
    }

    #[test]
    fn cleanup_purges_stale_entries() {
        let limiter = limiter();
        let now = 10_000.0;
        limiter.record_attempt_at("ana:10.0.0.8", now);
        for _ in 0..5 {
            limiter.record_attempt_at("omar:10.0.0.9", now);
        }
        limiter.check_rate_limit_at("omar:10.0.0.9", now);

        // Nothing stale yet.
        assert_eq!(limiter.cleanup_at(now + 10.0), 0);
        // Attempts aged out of the window and the lockout expired.
        assert_eq!(limiter.cleanup_at(now + 1000.0), 3);
        assert_eq!(limiter.get_attempts_count_at("omar:10.0.0.9", now + 1000.0), 0);
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("rate_limits.json");
        let now = 10_000.0;
        {
            let limiter = RateLimiter::new(RateLimitSettings::default(), Some(path.clone()));
            limiter.record_attempt_at("ana:10.0.0.8", now);
            limiter.record_attempt_at("ana:10.0.0.8", now + 1.0);
            for _ in 0..5 {
                limiter.record_attempt_at("omar:10.0.0.9", now);
            }
            limiter.check_rate_limit_at("omar:10.0.0.9", now + 2.0);
        }

        let restored = RateLimiter::new(RateLimitSettings::default(), Some(path.clone()));
        assert_eq!(restored.get_attempts_count_at("ana:10.0.0.8", now + 3.0), 2);
        assert!(restored.is_locked_out_at("omar:10.0.0.9", now + 3.0));
        // The writer leaves no temp file behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn snapshot_has_documented_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate_limits.json");
        let limiter = RateLimiter::new(RateLimitSettings::default(), Some(path.clone()));
        limiter.record_attempt_at("ana:10.0.0.8", 10_000.0);

        let raw = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["attempts"]["ana:10.0.0.8"][0], 10_000.0);
        assert!(value["lockouts"].is_object());
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(value["config"]["max_attempts"], 5);
        assert_eq!(value["config"]["window_seconds"], 300);
        assert_eq!(value["config"]["lockout_seconds"], 900);
    }

    #[test]
    fn corrupt_snapshot_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rate_limits.json");
        fs::write(&path, "{\"attempts\": [broken").unwrap();

        let limiter = RateLimiter::new(RateLimitSettings::default(), Some(path));
        assert_eq!(limiter.get_attempts_count("ana:10.0.0.8"), 0);
        assert!(limiter.check_rate_limit("ana:10.0.0.8").allowed);
    }

    #[test]
    fn missing_path_runs_in_memory() {
        let limiter = limiter();
        limiter.record_attempt("ana:10.0.0.8");
        assert_eq!(limiter.get_attempts_count("ana:10.0.0.8"), 1);
        assert_eq!(limiter.cleanup(), 0);
    }
}
