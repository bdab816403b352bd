//! Root of the `fragment-core` library. The entry point is
//! [`FragmentRunner::run`], which provisions a sandbox, drives the model
//! conversation, and returns the finished [`FragmentArtifact`].
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod agent;
mod client;
mod client_common;
pub mod error;
mod flags;
mod models;
pub mod protocol;
mod sandbox;
mod steps;
mod tools;
mod util;
mod validator;

pub use agent::FragmentRunner;
pub use agent::MAX_ITERATIONS;
pub use agent::RunState;
pub use agent::TASK_SUMMARY_SENTINEL;
pub use client::ModelClient;
pub use client::ModelEndpoint;
pub use client_common::Prompt;
pub use client_common::ResponseEvent;
pub use client_common::ResponseStream;
pub use error::FragmentErr;
pub use error::Result;
pub use models::ResponseItem;
pub use protocol::Event;
pub use protocol::EventMsg;
pub use protocol::FragmentArtifact;
pub use protocol::RunRequest;
pub use sandbox::SandboxClient;
pub use sandbox::SandboxEndpoint;
pub use sandbox::SandboxHandle;
pub use steps::InMemoryStepStore;
pub use steps::JsonlStepStore;
pub use steps::StepExecutor;
pub use steps::StepStore;
pub use tools::FileEntry;
pub use validator::validate_batch;
pub use validator::validate_file;
