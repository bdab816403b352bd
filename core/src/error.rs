use reqwest::StatusCode;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FragmentErr>;

#[derive(Error, Debug)]
pub enum FragmentErr {
    /// Provisioning a fresh sandbox failed. Fatal to the run; there is no
    /// environment to attach to, so nothing is retried at this layer.
    #[error("sandbox provisioning failed: {0}")]
    Provision(String),

    /// Re-attaching to an existing sandbox failed, typically because it
    /// expired. Deliberately distinct from [`FragmentErr::Provision`] so
    /// callers can tell "never existed" from "expired".
    #[error("sandbox {id} unreachable or expired: {reason}")]
    Resolution { id: String, reason: String },

    /// The SSE stream disconnected or errored out after the HTTP handshake
    /// succeeded but before the terminal event. The agent loop treats this as
    /// transient and retries the turn.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    /// Unexpected HTTP status code from the model or sandbox service.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry limit exceeded while talking to the model endpoint.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    /// A durable step's underlying operation kept failing after the bounded
    /// retry budget was spent. Aborts the whole workflow instance.
    #[error("step `{label}` failed after {attempts} attempts: {message}")]
    StepFailure {
        label: String,
        attempts: u64,
        message: String,
    },

    /// A memoized step result could not be decoded back into the caller's
    /// type. Indicates a label collision or a corrupted journal.
    #[error("step `{label}` has an incompatible recorded result: {source}")]
    StepDecode {
        label: String,
        #[source]
        source: serde_json::Error,
    },

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_error_names_the_sandbox() {
        let err = FragmentErr::Resolution {
            id: "sb_123".to_string(),
            reason: "410 Gone".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "sandbox sb_123 unreachable or expired: 410 Gone"
        );
    }

    #[test]
    fn step_failure_reports_label_and_attempts() {
        let err = FragmentErr::StepFailure {
            label: "run-command#2".to_string(),
            attempts: 3,
            message: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "step `run-command#2` failed after 3 attempts: connection refused"
        );
    }
}
