//! Tracked units of long-running work.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    DataLoading,
    DropdownLoading,
    RecordSaving,
    RecordDeleting,
    UserAuthentication,
    ExportData,
    UiUpdate,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataLoading => "data_loading",
            Self::DropdownLoading => "dropdown_loading",
            Self::RecordSaving => "record_saving",
            Self::RecordDeleting => "record_deleting",
            Self::UserAuthentication => "user_authentication",
            Self::ExportData => "export_data",
            Self::UiUpdate => "ui_update",
        }
    }

    /// Default timeout budget for operations of this type.
    pub fn default_timeout(self) -> Duration {
        let secs = match self {
            Self::DataLoading => 60,
            Self::DropdownLoading => 30,
            Self::RecordSaving => 45,
            Self::RecordDeleting => 30,
            Self::UserAuthentication => 30,
            Self::ExportData => 120,
            Self::UiUpdate => 15,
        };
        Duration::from_secs(secs)
    }

    /// Active types that keep a new operation of this type from starting.
    /// Dropdown refreshes and UI updates run alongside anything.
    pub fn blocked_by(self) -> &'static [OperationType] {
        match self {
            Self::DataLoading => &[Self::DataLoading, Self::ExportData],
            Self::DropdownLoading => &[],
            Self::RecordSaving => &[Self::RecordSaving, Self::DataLoading],
            Self::RecordDeleting => &[Self::RecordDeleting, Self::DataLoading],
            Self::UserAuthentication => &[Self::UserAuthentication],
            Self::ExportData => &[Self::ExportData, Self::DataLoading, Self::RecordSaving],
            Self::UiUpdate => &[],
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl OperationState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// One tracked operation. The registry owns the master copy; lookups hand
/// out clones.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: String,
    pub op_type: OperationType,
    pub description: String,
    pub state: OperationState,
    /// Epoch seconds at start.
    pub started_at: f64,
    /// Epoch seconds at the transition into a terminal state.
    pub ended_at: Option<f64>,
    /// Timeout budget in seconds.
    pub timeout_secs: f64,
    /// Completion percentage, 0 to 100.
    pub progress: u8,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub metadata: Map<String, Value>,
}

impl Operation {
    pub(crate) fn new(
        id: String,
        op_type: OperationType,
        description: String,
        timeout: Duration,
        now: f64,
    ) -> Self {
        Self {
            id,
            op_type,
            description,
            state: OperationState::InProgress,
            started_at: now,
            ended_at: None,
            timeout_secs: timeout.as_secs_f64(),
            progress: 0,
            error: None,
            result: None,
            metadata: Map::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Seconds between start and end, or between start and `now` while
    /// still running.
    pub fn elapsed_at(&self, now: f64) -> f64 {
        (self.ended_at.unwrap_or(now) - self.started_at).max(0.0)
    }

    pub fn has_timed_out_at(&self, now: f64) -> bool {
        self.is_active() && now - self.started_at > self.timeout_secs
    }

    /// Move into `next`. Refused once the operation is terminal, which
    /// also keeps `ended_at` from ever being rewritten.
    pub(crate) fn transition(&mut self, next: OperationState, now: f64) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        true
    }
}
