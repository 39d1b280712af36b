//! Run results.

use rkyv::Archive;
use serde::{Deserialize, Serialize};

/// Outcome of one run.
///
/// The two success flags are independent: the host can do its job while
/// the script fails, and the host can fail before the script ever starts.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Serialize,
    Deserialize,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct RunResult {
    /// The host loaded and ran the module without itself failing.
    pub is_run_attempt_successful: bool,
    /// The user's code returned normally.
    pub is_script_completed_successfully: bool,
    /// The run ended because it was cancelled.
    pub is_run_cancelled: bool,
    /// Wall time of the script itself, in milliseconds.
    pub duration_ms: f64,
    pub error: Option<String>,
}

impl RunResult {
    pub fn success(duration_ms: f64) -> Self {
        Self {
            is_run_attempt_successful: true,
            is_script_completed_successfully: true,
            is_run_cancelled: false,
            duration_ms,
            error: None,
        }
    }

    /// The user's code failed; the host is fine.
    pub fn script_completion_failure(duration_ms: f64, error: impl Into<String>) -> Self {
        Self {
            is_run_attempt_successful: true,
            is_script_completed_successfully: false,
            is_run_cancelled: false,
            duration_ms,
            error: Some(error.into()),
        }
    }

    /// The host failed. Duration is always zero.
    pub fn run_attempt_failure(error: impl Into<String>) -> Self {
        Self {
            is_run_attempt_successful: false,
            is_script_completed_successfully: false,
            is_run_cancelled: false,
            duration_ms: 0.0,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(duration_ms: f64) -> Self {
        Self {
            is_run_attempt_successful: true,
            is_script_completed_successfully: false,
            is_run_cancelled: true,
            duration_ms,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.is_run_attempt_successful && self.is_script_completed_successfully
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_independent() {
        let script_failed = RunResult::script_completion_failure(12.5, "boom");
        assert!(script_failed.is_run_attempt_successful);
        assert!(!script_failed.is_script_completed_successfully);
        assert_eq!(script_failed.duration_ms, 12.5);

        let host_failed = RunResult::run_attempt_failure("crashed");
        assert!(!host_failed.is_run_attempt_successful);
        assert_eq!(host_failed.duration_ms, 0.0);
        assert_eq!(host_failed.error.as_deref(), Some("crashed"));

        assert!(RunResult::success(1.0).is_success());
        assert!(!RunResult::cancelled(1.0).is_success());
    }
}
