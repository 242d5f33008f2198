//! Live-operation registry: admission, lifecycle, timeout sweeps, and
//! pruning of finished work.
//!
//! All state sits behind one mutex and every public call locks, checks,
//! and mutates in a single critical section. Admission and insertion
//! share that section in [`OperationRegistry::try_start_operation`], so
//! two racing callers can never both start a mutually blocking operation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock;
use crate::config::OperationSettings;
use crate::operation::{Operation, OperationState, OperationType};
use crate::periodic::{lock_or_recover, PeriodicTask};

/// Outcome of an admission check. `reason` is user-presentable, e.g.
/// "data_loading already running".
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl AdmissionDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperationSummary {
    pub id: String,
    pub description: String,
    pub progress: u8,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub is_busy: bool,
    pub total_operations: usize,
    pub active_operations: usize,
    pub active_by_type: HashMap<String, Vec<ActiveOperationSummary>>,
    pub current_user: Option<String>,
    pub session_duration_seconds: f64,
    pub last_activity: f64,
}

struct RegistryState {
    operations: HashMap<String, Operation>,
    counter: u64,
    busy: bool,
    current_user: Option<String>,
    session_start: f64,
    last_activity: f64,
}

impl RegistryState {
    fn new(now: f64) -> Self {
        Self {
            operations: HashMap::new(),
            counter: 0,
            busy: false,
            current_user: None,
            session_start: now,
            last_activity: now,
        }
    }

    /// Recompute the busy flag and stamp activity. Runs after every
    /// mutating call so `busy` always equals "at least one active op".
    fn refresh(&mut self, now: f64) {
        self.busy = self.operations.values().any(Operation::is_active);
        self.last_activity = now;
    }

    /// The first active operation whose type blocks `op_type`, if any.
    fn blocking_reason(&self, op_type: OperationType) -> Option<String> {
        let blockers = op_type.blocked_by();
        self.operations
            .values()
            .find(|op| op.is_active() && blockers.contains(&op.op_type))
            .map(|op| format!("{} already running", op.op_type))
    }

    fn insert_operation(
        &mut self,
        op_type: OperationType,
        description: &str,
        timeout: Option<Duration>,
        now: f64,
    ) -> String {
        self.counter += 1;
        let id = format!("{}_{}_{}", op_type.as_str(), clock::epoch_millis(), self.counter);
        let timeout = timeout.unwrap_or_else(|| op_type.default_timeout());
        let op = Operation::new(id.clone(), op_type, description.to_string(), timeout, now);
        info!(
            operation_id = %id,
            op_type = %op_type,
            timeout_secs = op.timeout_secs,
            "operation started"
        );
        self.operations.insert(id.clone(), op);
        self.refresh(now);
        id
    }

    /// Drop finished operations that ended before `cutoff`.
    fn prune(&mut self, cutoff: f64) {
        let before = self.operations.len();
        self.operations
            .retain(|_, op| op.is_active() || op.ended_at.map(|t| t >= cutoff).unwrap_or(true));
        let removed = before - self.operations.len();
        if removed > 0 {
            debug!(removed, "pruned finished operations");
        }
    }
}

struct RegistryInner {
    settings: OperationSettings,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        lock_or_recover(&self.state)
    }

    fn check_timeouts_at(&self, now: f64) -> usize {
        let mut state = self.lock_state();
        let mut expired = 0;
        for op in state.operations.values_mut() {
            if op.has_timed_out_at(now) {
                let elapsed = op.elapsed_at(now);
                op.transition(OperationState::TimedOut, now);
                op.error = Some(format!("timed out after {elapsed:.0}s"));
                warn!(
                    operation_id = %op.id,
                    op_type = %op.op_type,
                    elapsed_secs = elapsed,
                    "operation timed out"
                );
                expired += 1;
            }
        }
        if expired > 0 {
            state.refresh(now);
        }
        expired
    }
}

pub struct OperationRegistry {
    inner: Arc<RegistryInner>,
    monitor: Mutex<Option<PeriodicTask>>,
}

impl OperationRegistry {
    pub fn new(settings: OperationSettings) -> Self {
        let now = clock::epoch_seconds();
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                state: Mutex::new(RegistryState::new(now)),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Register and start an operation unconditionally. Callers that must
    /// respect the blocking table use [`try_start_operation`] instead.
    ///
    /// [`try_start_operation`]: Self::try_start_operation
    pub fn start_operation(
        &self,
        op_type: OperationType,
        description: &str,
        timeout: Option<Duration>,
    ) -> String {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        state.insert_operation(op_type, description, timeout, now)
    }

    /// Advisory admission check. The answer can go stale the moment the
    /// lock is released; use [`try_start_operation`] when the result
    /// decides whether to start.
    ///
    /// [`try_start_operation`]: Self::try_start_operation
    pub fn can_start_operation(&self, op_type: OperationType) -> AdmissionDecision {
        let state = self.inner.lock_state();
        match state.blocking_reason(op_type) {
            Some(reason) => AdmissionDecision::denied(reason),
            None => AdmissionDecision::allowed(),
        }
    }

    /// Check admission and start in one critical section. Two racing
    /// callers of a mutually blocking type get exactly one success.
    pub fn try_start_operation(
        &self,
        op_type: OperationType,
        description: &str,
        timeout: Option<Duration>,
    ) -> Result<String, AdmissionDecision> {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        if let Some(reason) = state.blocking_reason(op_type) {
            debug!(op_type = %op_type, reason = %reason, "operation admission denied");
            return Err(AdmissionDecision::denied(reason));
        }
        Ok(state.insert_operation(op_type, description, timeout, now))
    }

    /// Mark an operation completed, set progress to 100, and attach the
    /// optional result payload. Returns false for unknown ids and for
    /// operations already in a terminal state.
    pub fn complete_operation(&self, id: &str, result: Option<Value>) -> bool {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        let Some(op) = state.operations.get_mut(id) else {
            debug!(operation_id = id, "complete requested for unknown operation");
            return false;
        };
        if !op.transition(OperationState::Completed, now) {
            warn!(operation_id = id, state = ?op.state, "refusing transition out of terminal state");
            return false;
        }
        op.progress = 100;
        op.result = result;
        info!(operation_id = id, "operation completed");
        state.refresh(now);
        let cutoff = now - self.inner.settings.retention_secs as f64;
        state.prune(cutoff);
        true
    }

    /// Mark an operation failed with an error message.
    pub fn fail_operation(&self, id: &str, message: &str) -> bool {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        let Some(op) = state.operations.get_mut(id) else {
            debug!(operation_id = id, "fail requested for unknown operation");
            return false;
        };
        if !op.transition(OperationState::Failed, now) {
            warn!(operation_id = id, state = ?op.state, "refusing transition out of terminal state");
            return false;
        }
        op.error = Some(message.to_string());
        warn!(operation_id = id, error = message, "operation failed");
        state.refresh(now);
        true
    }

    /// Cancel a single active operation.
    pub fn cancel_operation(&self, id: &str) -> bool {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        let Some(op) = state.operations.get_mut(id) else {
            debug!(operation_id = id, "cancel requested for unknown operation");
            return false;
        };
        if !op.transition(OperationState::Cancelled, now) {
            warn!(operation_id = id, state = ?op.state, "refusing transition out of terminal state");
            return false;
        }
        info!(operation_id = id, "operation cancelled");
        state.refresh(now);
        true
    }

    /// Update progress on an active operation, clamped to 100.
    pub fn update_operation_progress(&self, id: &str, value: u8) -> bool {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        let Some(op) = state.operations.get_mut(id) else {
            return false;
        };
        if !op.is_active() {
            return false;
        }
        op.progress = value.min(100);
        state.refresh(now);
        true
    }

    /// Attach a metadata entry to an active operation.
    pub fn set_operation_metadata(&self, id: &str, key: &str, value: Value) -> bool {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        let Some(op) = state.operations.get_mut(id) else {
            return false;
        };
        if !op.is_active() {
            return false;
        }
        op.metadata.insert(key.to_string(), value);
        state.refresh(now);
        true
    }

    pub fn get_operation(&self, id: &str) -> Option<Operation> {
        self.inner.lock_state().operations.get(id).cloned()
    }

    pub fn get_active_operations(&self, filter: Option<OperationType>) -> Vec<Operation> {
        let state = self.inner.lock_state();
        state
            .operations
            .values()
            .filter(|op| op.is_active() && filter.map(|t| op.op_type == t).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Whether anything is running. With `types` given, whether anything
    /// of one of those types is running.
    pub fn is_busy(&self, types: Option<&[OperationType]>) -> bool {
        let state = self.inner.lock_state();
        match types {
            None => state.busy,
            Some(types) => state
                .operations
                .values()
                .any(|op| op.is_active() && types.contains(&op.op_type)),
        }
    }

    /// Cancel every active operation of one type. Returns how many were
    /// cancelled.
    pub fn cancel_operations_by_type(&self, op_type: OperationType) -> usize {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        let mut cancelled = 0;
        for op in state.operations.values_mut() {
            if op.op_type == op_type && op.transition(OperationState::Cancelled, now) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(op_type = %op_type, cancelled, "cancelled operations by type");
            state.refresh(now);
        }
        cancelled
    }

    /// Cancel everything still active, e.g. on logout or shutdown.
    pub fn force_cancel_all_operations(&self) -> usize {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        let mut cancelled = 0;
        for op in state.operations.values_mut() {
            if op.transition(OperationState::Cancelled, now) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(cancelled, "force-cancelled all active operations");
            state.refresh(now);
        }
        cancelled
    }

    /// Sweep active operations past their timeout budget into `TimedOut`.
    /// The background monitor runs this on its poll interval; callers can
    /// also invoke it directly. Returns how many expired.
    pub fn check_timeouts(&self) -> usize {
        self.inner.check_timeouts_at(clock::epoch_seconds())
    }

    /// Timeout sweep against a caller-supplied clock reading.
    pub fn check_timeouts_at(&self, now: f64) -> usize {
        self.inner.check_timeouts_at(now)
    }

    pub fn get_status_summary(&self) -> StatusSummary {
        let now = clock::epoch_seconds();
        let state = self.inner.lock_state();
        let mut active_by_type: HashMap<String, Vec<ActiveOperationSummary>> = HashMap::new();
        let mut active_operations = 0;
        for op in state.operations.values() {
            if !op.is_active() {
                continue;
            }
            active_operations += 1;
            active_by_type
                .entry(op.op_type.as_str().to_string())
                .or_default()
                .push(ActiveOperationSummary {
                    id: op.id.clone(),
                    description: op.description.clone(),
                    progress: op.progress,
                    elapsed_seconds: op.elapsed_at(now),
                });
        }
        StatusSummary {
            is_busy: state.busy,
            total_operations: state.operations.len(),
            active_operations,
            active_by_type,
            current_user: state.current_user.clone(),
            session_duration_seconds: (now - state.session_start).max(0.0),
            last_activity: state.last_activity,
        }
    }

    pub fn set_current_user(&self, username: &str) {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        state.current_user = Some(username.to_string());
        state.last_activity = now;
        info!(user = username, "session user set");
    }

    pub fn clear_current_user(&self) {
        let now = clock::epoch_seconds();
        let mut state = self.inner.lock_state();
        if let Some(user) = state.current_user.take() {
            info!(user = %user, "session user cleared");
        }
        state.last_activity = now;
    }

    pub fn current_user(&self) -> Option<String> {
        self.inner.lock_state().current_user.clone()
    }

    /// Launch the background timeout monitor. Does nothing if it is
    /// already running.
    pub fn start_timeout_monitor(&self) {
        let mut slot = lock_or_recover(&self.monitor);
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.settings.poll_interval();
        match PeriodicTask::spawn("operation-timeouts", interval, move || {
            inner.check_timeouts_at(clock::epoch_seconds());
        }) {
            Ok(task) => *slot = Some(task),
            Err(err) => {
                warn!(error = %err, "timeout monitor thread failed to start");
            }
        }
    }

    /// Stop the timeout monitor and wait for it to exit.
    pub fn shutdown(&self) {
        if let Some(mut task) = lock_or_recover(&self.monitor).take() {
            task.stop();
        }
    }
}

impl Drop for OperationRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> OperationRegistry {
        OperationRegistry::new(OperationSettings::default())
    }

    #[test]
    fn start_assigns_unique_ids() {
        let registry = registry();
        let a = registry.start_operation(OperationType::DropdownLoading, "views", None);
        let b = registry.start_operation(OperationType::DropdownLoading, "roles", None);
        assert_ne!(a, b);
        assert!(a.starts_with("dropdown_loading_"));
    }

    #[test]
    fn blocking_type_denies_second_start() {
        let registry = registry();
        let first = registry.try_start_operation(OperationType::DataLoading, "load", None);
        assert!(first.is_ok());

        let second = registry.try_start_operation(OperationType::DataLoading, "load again", None);
        let denial = second.err().unwrap();
        assert!(!denial.allowed);
        assert_eq!(denial.reason.as_deref(), Some("data_loading already running"));
    }

    #[test]
    fn data_loading_blocks_saving_but_not_dropdowns() {
        let registry = registry();
        registry.start_operation(OperationType::DataLoading, "load", None);

        assert!(!registry.can_start_operation(OperationType::RecordSaving).allowed);
        assert!(!registry.can_start_operation(OperationType::ExportData).allowed);
        assert!(registry.can_start_operation(OperationType::DropdownLoading).allowed);
        assert!(registry.can_start_operation(OperationType::UserAuthentication).allowed);
    }

    #[test]
    fn admission_clears_after_completion() {
        let registry = registry();
        let id = registry.start_operation(OperationType::DataLoading, "load", None);
        assert!(!registry.can_start_operation(OperationType::DataLoading).allowed);

        assert!(registry.complete_operation(&id, None));
        assert!(registry.can_start_operation(OperationType::DataLoading).allowed);
    }

    #[test]
    fn complete_sets_progress_and_result() {
        let registry = registry();
        let id = registry.start_operation(OperationType::RecordSaving, "save", None);
        assert!(registry.complete_operation(&id, Some(serde_json::json!({"saved": 3}))));

        let op = registry.get_operation(&id).unwrap();
        assert_eq!(op.state, OperationState::Completed);
        assert_eq!(op.progress, 100);
        assert_eq!(op.result.unwrap()["saved"], 3);
        assert!(op.ended_at.is_some());
    }

    #[test]
    fn terminal_operations_reject_further_transitions() {
        let registry = registry();
        let id = registry.start_operation(OperationType::RecordSaving, "save", None);
        assert!(registry.fail_operation(&id, "upstream 503"));

        assert!(!registry.complete_operation(&id, None));
        assert!(!registry.cancel_operation(&id));
        assert!(!registry.fail_operation(&id, "again"));

        let op = registry.get_operation(&id).unwrap();
        assert_eq!(op.state, OperationState::Failed);
        assert_eq!(op.error.as_deref(), Some("upstream 503"));
    }

    #[test]
    fn unknown_ids_return_false() {
        let registry = registry();
        assert!(!registry.complete_operation("nope", None));
        assert!(!registry.fail_operation("nope", "x"));
        assert!(!registry.cancel_operation("nope"));
        assert!(!registry.update_operation_progress("nope", 10));
    }

    #[test]
    fn progress_clamps_to_one_hundred() {
        let registry = registry();
        let id = registry.start_operation(OperationType::ExportData, "export", None);
        assert!(registry.update_operation_progress(&id, 250));
        assert_eq!(registry.get_operation(&id).unwrap().progress, 100);

        registry.complete_operation(&id, None);
        assert!(!registry.update_operation_progress(&id, 10));
    }

    #[test]
    fn busy_tracks_active_operations() {
        let registry = registry();
        assert!(!registry.is_busy(None));

        let id = registry.start_operation(OperationType::DataLoading, "load", None);
        assert!(registry.is_busy(None));
        assert!(registry.is_busy(Some(&[OperationType::DataLoading])));
        assert!(!registry.is_busy(Some(&[OperationType::ExportData])));

        registry.complete_operation(&id, None);
        assert!(!registry.is_busy(None));
    }

    #[test]
    fn timeout_sweep_expires_overdue_operations() {
        let registry = registry();
        let id = registry.start_operation(
            OperationType::DataLoading,
            "slow load",
            Some(Duration::from_secs(10)),
        );
        let started_at = registry.get_operation(&id).unwrap().started_at;

        assert_eq!(registry.check_timeouts_at(started_at + 9.0), 0);
        assert_eq!(registry.check_timeouts_at(started_at + 11.0), 1);

        let op = registry.get_operation(&id).unwrap();
        assert_eq!(op.state, OperationState::TimedOut);
        assert_eq!(op.ended_at, Some(started_at + 11.0));
        assert!(op.error.unwrap().contains("timed out"));
        assert!(!registry.is_busy(None));

        // Already expired; a later sweep must not touch it again.
        assert_eq!(registry.check_timeouts_at(started_at + 20.0), 0);
        let op = registry.get_operation(&id).unwrap();
        assert_eq!(op.ended_at, Some(started_at + 11.0));
    }

    #[test]
    fn completion_prunes_old_finished_operations() {
        let registry = OperationRegistry::new(OperationSettings {
            poll_interval_secs: 5,
            retention_secs: 0,
        });
        let old = registry.start_operation(OperationType::RecordSaving, "save a", None);
        registry.complete_operation(&old, None);

        // Retention zero: the next completion prunes everything finished.
        let next = registry.start_operation(OperationType::RecordSaving, "save b", None);
        registry.complete_operation(&next, None);
        assert!(registry.get_operation(&old).is_none());
    }

    #[test]
    fn cancel_by_type_leaves_other_types_alone() {
        let registry = registry();
        registry.start_operation(OperationType::DropdownLoading, "views", None);
        registry.start_operation(OperationType::DropdownLoading, "roles", None);
        let keep = registry.start_operation(OperationType::DataLoading, "load", None);

        assert_eq!(registry.cancel_operations_by_type(OperationType::DropdownLoading), 2);
        assert!(registry.get_operation(&keep).unwrap().is_active());
        assert_eq!(registry.cancel_operations_by_type(OperationType::DropdownLoading), 0);
    }

    #[test]
    fn force_cancel_clears_everything() {
        let registry = registry();
        registry.start_operation(OperationType::DataLoading, "load", None);
        registry.start_operation(OperationType::DropdownLoading, "views", None);

        assert_eq!(registry.force_cancel_all_operations(), 2);
        assert!(!registry.is_busy(None));
        assert_eq!(registry.force_cancel_all_operations(), 0);
    }

    #[test]
    fn status_summary_groups_active_by_type() {
        let registry = registry();
        registry.set_current_user("ana");
        let id = registry.start_operation(OperationType::DataLoading, "load records", None);
        registry.update_operation_progress(&id, 40);
        let done = registry.start_operation(OperationType::DropdownLoading, "views", None);
        registry.complete_operation(&done, None);

        let summary = registry.get_status_summary();
        assert!(summary.is_busy);
        assert_eq!(summary.total_operations, 2);
        assert_eq!(summary.active_operations, 1);
        assert_eq!(summary.current_user.as_deref(), Some("ana"));
        assert!(summary.session_duration_seconds >= 0.0);

        let loading = &summary.active_by_type["data_loading"];
        assert_eq!(loading.len(), 1);
        assert_eq!(loading[0].description, "load records");
        assert_eq!(loading[0].progress, 40);
        assert!(!summary.active_by_type.contains_key("dropdown_loading"));
    }

    #[test]
    fn current_user_set_and_clear() {
        let registry = registry();
        assert!(registry.current_user().is_none());
        registry.set_current_user("omar");
        assert_eq!(registry.current_user().as_deref(), Some("omar"));
        registry.clear_current_user();
        assert!(registry.current_user().is_none());
    }

    #[test]
    fn metadata_attaches_to_active_operations_only() {
        let registry = registry();
        let id = registry.start_operation(OperationType::UserAuthentication, "login", None);
        assert!(registry.set_operation_metadata(&id, "client_ip", serde_json::json!("10.0.0.8")));
        assert_eq!(
            registry.get_operation(&id).unwrap().metadata["client_ip"],
            "10.0.0.8"
        );

        registry.complete_operation(&id, None);
        assert!(!registry.set_operation_metadata(&id, "client_ip", serde_json::json!("x")));
    }

    #[test]
    fn monitor_start_is_idempotent_and_shutdown_joins() {
        let registry = registry();
        registry.start_timeout_monitor();
        registry.start_timeout_monitor();
        registry.shutdown();
        registry.shutdown();
    }
}
