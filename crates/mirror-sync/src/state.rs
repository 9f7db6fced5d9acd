use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobReport;

/// Final classification of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Skipped,
    PartialFailure,
    Failure,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::PartialFailure => "partial_failure",
            Self::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "skipped" => Some(Self::Skipped),
            "partial_failure" => Some(Self::PartialFailure),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::PartialFailure | Self::Failure)
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Coarse error classification recorded alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PrecheckUnreachable,
    TransferAuth,
    TransferNetwork,
    TransferTool,
    TransferTimeout,
    Destination,
    ConfigInvalid,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrecheckUnreachable => "precheck_unreachable",
            Self::TransferAuth => "transfer_auth",
            Self::TransferNetwork => "transfer_network",
            Self::TransferTool => "transfer_tool",
            Self::TransferTimeout => "transfer_timeout",
            Self::Destination => "destination",
            Self::ConfigInvalid => "config_invalid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "precheck_unreachable" => Some(Self::PrecheckUnreachable),
            "transfer_auth" => Some(Self::TransferAuth),
            "transfer_network" => Some(Self::TransferNetwork),
            "transfer_tool" => Some(Self::TransferTool),
            "transfer_timeout" => Some(Self::TransferTimeout),
            "destination" => Some(Self::Destination),
            "config_invalid" => Some(Self::ConfigInvalid),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters from the most recent job that actually ran a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub bytes_transferred: u64,
    pub files_changed: u64,
    pub duration_ms: u64,
}

/// Persisted per-site sync history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<SyncOutcome>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub consecutive_failures: u32,
    /// Precheck marker seen at the last successful sync.
    pub last_marker: Option<String>,
    pub last_transfer: Option<TransferSummary>,
}

impl SyncState {
    /// Fold a completed job into this state.
    pub fn apply(&mut self, report: &JobReport) {
        self.last_attempt_at = Some(report.finished_at);
        self.last_outcome = Some(report.outcome);

        if report.outcome == SyncOutcome::Skipped {
            return;
        }

        self.last_transfer = Some(TransferSummary {
            bytes_transferred: report.transfer.bytes_transferred,
            files_changed: report.transfer.files_changed,
            duration_ms: u64::try_from(report.transfer.duration.as_millis()).unwrap_or(u64::MAX),
        });

        match report.outcome {
            SyncOutcome::Success => {
                self.last_success_at = Some(report.finished_at);
                self.consecutive_failures = 0;
                self.last_error = None;
                self.last_error_kind = None;
                self.last_marker = report.marker.clone();
            }
            SyncOutcome::PartialFailure | SyncOutcome::Failure => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = report.error.as_ref().map(|e| e.message.clone());
                self.last_error_kind = report.error.as_ref().map(|e| e.kind);
            }
            SyncOutcome::Skipped => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use crate::job::JobError;
    use crate::site::SiteId;
    use crate::transfer::TransferOutcome;

    use super::*;

    fn report(outcome: SyncOutcome) -> JobReport {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 4, 0, 0).unwrap();
        JobReport {
            site_id: SiteId::new("debian"),
            outcome,
            started_at: at,
            finished_at: at,
            transfer: TransferOutcome {
                bytes_transferred: 2048,
                files_changed: 7,
                exit_status: 0,
                stderr_tail: String::new(),
                duration: Duration::from_millis(1500),
            },
            stages: Vec::new(),
            error: outcome.is_failure().then(|| JobError {
                kind: ErrorKind::TransferNetwork,
                message: "connection reset".into(),
            }),
            marker: Some("marker-2".into()),
        }
    }

    #[test]
    fn success_resets_failures_and_records_marker() {
        let mut state = SyncState {
            consecutive_failures: 3,
            last_error: Some("old".into()),
            last_error_kind: Some(ErrorKind::TransferTool),
            last_marker: Some("marker-1".into()),
            ..SyncState::default()
        };

        state.apply(&report(SyncOutcome::Success));

        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_error, None);
        assert_eq!(state.last_error_kind, None);
        assert_eq!(state.last_marker.as_deref(), Some("marker-2"));
        assert!(state.last_success_at.is_some());
        assert_eq!(state.last_transfer.as_ref().unwrap().duration_ms, 1500);
    }

    #[test]
    fn failure_increments_and_keeps_marker() {
        let mut state = SyncState {
            consecutive_failures: 1,
            last_marker: Some("marker-1".into()),
            ..SyncState::default()
        };

        state.apply(&report(SyncOutcome::Failure));

        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_error.as_deref(), Some("connection reset"));
        assert_eq!(state.last_error_kind, Some(ErrorKind::TransferNetwork));
        assert_eq!(state.last_marker.as_deref(), Some("marker-1"));
        assert_eq!(state.last_success_at, None);
        assert_eq!(state.last_outcome, Some(SyncOutcome::Failure));
    }

    #[test]
    fn partial_failure_counts_as_failure() {
        let mut state = SyncState::default();
        state.apply(&report(SyncOutcome::PartialFailure));
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.last_outcome, Some(SyncOutcome::PartialFailure));
    }

    #[test]
    fn skip_leaves_failures_and_marker_untouched() {
        let mut state = SyncState {
            consecutive_failures: 2,
            last_marker: Some("marker-1".into()),
            ..SyncState::default()
        };

        state.apply(&report(SyncOutcome::Skipped));

        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_marker.as_deref(), Some("marker-1"));
        assert_eq!(state.last_outcome, Some(SyncOutcome::Skipped));
        assert!(state.last_attempt_at.is_some());
        assert_eq!(state.last_transfer, None);
    }

    #[test]
    fn serialized_names_match_stored_names() {
        let state = SyncState {
            last_outcome: Some(SyncOutcome::PartialFailure),
            last_error_kind: Some(ErrorKind::TransferTimeout),
            ..SyncState::default()
        };
        let json = serde_json::to_value(&state).unwrap();

        assert_eq!(json["last_outcome"], "partial_failure");
        assert_eq!(json["last_error_kind"], ErrorKind::TransferTimeout.as_str());
        assert_eq!(ErrorKind::parse("nope"), None);
    }
}
