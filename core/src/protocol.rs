//! Types shared with the layers around the runner: the inbound trigger, the
//! outbound artifact, and the observability event stream.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Inbound trigger payload: the user's free-text task description, persisted
/// by the RPC layer before the workflow fires. Read-only for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub value: String,
}

/// Final aggregated result of one run. Created once, at completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FragmentArtifact {
    /// Public preview URL of the sandbox.
    pub url: String,
    pub title: String,
    /// Snapshot of the run-state file map at termination.
    pub files: BTreeMap<String, String>,
    /// The verbatim sentinel text, absent when the iteration cap was reached
    /// before the agent signalled completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Events emitted while a run is in flight so tool dispatches and model
/// turns are individually observable by whoever holds the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Identifier of the run this event belongs to.
    pub id: String,
    pub msg: EventMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    TaskStarted,

    /// Final assistant text of a model turn.
    AgentMessage { message: String },

    ExecCommandBegin {
        call_id: String,
        command: String,
    },

    ExecCommandEnd {
        call_id: String,
        stdout: String,
        stderr: String,
        exit_code: i32,
    },

    FileWriteBegin {
        call_id: String,
        paths: Vec<String>,
    },

    FileWriteEnd {
        call_id: String,
        success: bool,
    },

    /// Ambient diagnostics that are not part of the transcript.
    BackgroundEvent { message: String },

    Error { message: String },

    TaskComplete,
}
