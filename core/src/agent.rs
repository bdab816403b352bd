//! The run loop: drives a bounded model conversation against one sandbox,
//! dispatching tool calls in transcript order and stopping when the agent
//! emits its completion sentinel or the iteration budget runs out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_channel::Sender;
use futures::StreamExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::ModelClient;
use crate::client::ModelEndpoint;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::error::FragmentErr;
use crate::error::Result;
use crate::flags::MODEL_DEFAULT;
use crate::flags::MODEL_STREAM_MAX_RETRIES;
use crate::flags::SANDBOX_TEMPLATE;
use crate::flags::STEP_JOURNAL_DIR;
use crate::models::ResponseItem;
use crate::models::user_message;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::FragmentArtifact;
use crate::protocol::RunRequest;
use crate::sandbox::SandboxClient;
use crate::sandbox::SandboxEndpoint;
use crate::steps::InMemoryStepStore;
use crate::steps::JsonlStepStore;
use crate::steps::StepExecutor;
use crate::steps::StepStore;
use crate::tools::ToolRouter;
use crate::util::backoff;

/// Hard cap on model turns per run. Runaway conversations terminate here
/// rather than burning tokens forever.
pub const MAX_ITERATIONS: usize = 15;

/// Marker the system prompt instructs the agent to emit exactly once, after
/// all work is done. Its presence in assistant text ends the loop.
pub const TASK_SUMMARY_SENTINEL: &str = "<task_summary>";

/// Port the sandbox template's dev server listens on.
const DEV_SERVER_PORT: u16 = 3000;

/// Title attached to every finished artifact.
const ARTIFACT_TITLE: &str = "Fragment";

/// Mutable state shared between the loop and the tool router for the
/// lifetime of one run.
#[derive(Default, Debug)]
pub struct RunState {
    /// Every file written so far, later batches overwriting earlier ones
    /// path by path.
    pub files: BTreeMap<String, String>,
    /// Captured sentinel text. Write-once.
    pub summary: Option<String>,
    pub(crate) next_call_seq: u64,
}

impl RunState {
    /// First writer wins; later assistant messages cannot amend a summary
    /// that already ended the run.
    pub(crate) fn set_summary(&mut self, summary: String) {
        if self.summary.is_none() {
            self.summary = Some(summary);
        }
    }
}

pub struct FragmentRunner {
    client: ModelClient,
    sandbox: SandboxClient,
    steps: StepExecutor,
    tx_event: Sender<Event>,
    run_id: String,
    lenient_write_args: bool,
}

impl FragmentRunner {
    pub fn new(
        client: ModelClient,
        sandbox: SandboxClient,
        steps: StepExecutor,
        tx_event: Sender<Event>,
        run_id: impl ToString,
    ) -> Self {
        Self {
            client,
            sandbox,
            steps,
            tx_event,
            run_id: run_id.to_string(),
            lenient_write_args: true,
        }
    }

    /// Builds a runner entirely from the process environment, with a fresh
    /// run id. The step journal is durable when `STEP_JOURNAL_DIR` is set
    /// and volatile otherwise.
    pub fn from_env(tx_event: Sender<Event>) -> Result<Self> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let store: Arc<dyn StepStore> = match *STEP_JOURNAL_DIR {
            Some(dir) => Arc::new(JsonlStepStore::open(dir, &run_id)?),
            None => Arc::new(InMemoryStepStore::default()),
        };
        Ok(Self::new(
            ModelClient::new(&*MODEL_DEFAULT, ModelEndpoint::from_env()),
            SandboxClient::new(SandboxEndpoint::from_env()),
            StepExecutor::new(store),
            tx_event,
            run_id,
        ))
    }

    /// Disables the best-effort `write_files` argument recovery; malformed
    /// arguments then come straight back to the model as an error.
    pub fn with_strict_write_args(mut self) -> Self {
        self.lenient_write_args = false;
        self
    }

    /// Executes one full run and produces the artifact. Errors here are
    /// infrastructure failures; everything the model can recover from was
    /// already fed back into the conversation as tool output.
    pub async fn run(&self, request: RunRequest) -> Result<FragmentArtifact> {
        match self.run_inner(request).await {
            Ok(artifact) => {
                self.emit(EventMsg::TaskComplete).await;
                Ok(artifact)
            }
            Err(e) => {
                self.emit(EventMsg::Error {
                    message: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn run_inner(&self, request: RunRequest) -> Result<FragmentArtifact> {
        self.emit(EventMsg::TaskStarted).await;

        let sandbox = self.sandbox.clone();
        let sandbox_id: String = self
            .steps
            .run("create-sandbox", || {
                let sandbox = sandbox.clone();
                async move { sandbox.create(&SANDBOX_TEMPLATE).await }
            })
            .await?;
        info!(sandbox_id, "sandbox ready");

        let state = Arc::new(Mutex::new(RunState::default()));
        let router = ToolRouter::new(
            self.sandbox.clone(),
            sandbox_id.clone(),
            self.steps.clone(),
            Arc::clone(&state),
            self.tx_event.clone(),
            self.run_id.clone(),
            self.lenient_write_args,
        );

        let mut transcript: Vec<ResponseItem> = vec![user_message(request.value)];

        for iteration in 0..MAX_ITERATIONS {
            if self.summary_recorded(&state) {
                break;
            }

            let prompt = Prompt {
                input: transcript.clone(),
                user_instructions: None,
            };
            let output = self.run_turn(&prompt).await?;
            info!(iteration, items = output.len(), "model turn complete");

            for item in output {
                match item {
                    ResponseItem::Message { .. } => {
                        if let Some(text) = item.assistant_text() {
                            self.emit(EventMsg::AgentMessage {
                                message: text.clone(),
                            })
                            .await;
                            if text.contains(TASK_SUMMARY_SENTINEL) {
                                #[expect(clippy::unwrap_used)]
                                let mut state = state.lock().unwrap();
                                state.set_summary(text);
                            }
                        }
                        transcript.push(item);
                    }
                    ResponseItem::FunctionCall {
                        ref name,
                        ref arguments,
                        ref call_id,
                    } => {
                        let response = router
                            .dispatch(name, arguments, call_id.clone())
                            .await?;
                        transcript.push(item.clone());
                        transcript.push(ResponseItem::from(response));
                    }
                    other => transcript.push(other),
                }
            }
        }

        let sandbox = self.sandbox.clone();
        let resolve_id = sandbox_id.clone();
        let host: String = self
            .steps
            .run("resolve-sandbox-url", || {
                let sandbox = sandbox.clone();
                let sandbox_id = resolve_id.clone();
                async move {
                    let handle = sandbox.resolve(&sandbox_id).await?;
                    debug!(sandbox_id = handle.id(), "resolved for preview url");
                    Ok(handle.public_host(DEV_SERVER_PORT))
                }
            })
            .await?;

        #[expect(clippy::unwrap_used)]
        let (files, summary) = {
            let state = state.lock().unwrap();
            (state.files.clone(), state.summary.clone())
        };

        Ok(FragmentArtifact {
            url: format!("https://{host}"),
            title: ARTIFACT_TITLE.to_string(),
            files,
            summary,
        })
    }

    /// One model turn, retrying the whole turn when the stream drops after
    /// the handshake. The transcript is resent in full, so a retried turn is
    /// indistinguishable from a slow first attempt.
    async fn run_turn(&self, prompt: &Prompt) -> Result<Vec<ResponseItem>> {
        let mut retries: u64 = 0;
        loop {
            match self.try_run_turn(prompt).await {
                Ok(output) => return Ok(output),
                Err(e @ (FragmentErr::Stream(_) | FragmentErr::Reqwest(_)))
                    if retries < *MODEL_STREAM_MAX_RETRIES =>
                {
                    retries += 1;
                    let delay = backoff(retries);
                    warn!(
                        "stream error: {e}; retrying turn {retries}/{} in {delay:?}",
                        *MODEL_STREAM_MAX_RETRIES
                    );
                    self.emit(EventMsg::BackgroundEvent {
                        message: format!(
                            "stream error: {e}; retrying {retries}/{}",
                            *MODEL_STREAM_MAX_RETRIES
                        ),
                    })
                    .await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_run_turn(&self, prompt: &Prompt) -> Result<Vec<ResponseItem>> {
        let mut stream = self.client.stream(prompt).await?;
        let mut output = Vec::new();
        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::OutputItemDone(item) => output.push(item),
                ResponseEvent::Completed { .. } => return Ok(output),
            }
        }
        Err(FragmentErr::Stream(
            "stream closed before response.completed".to_string(),
        ))
    }

    fn summary_recorded(&self, state: &Arc<Mutex<RunState>>) -> bool {
        #[expect(clippy::unwrap_used)]
        let state = state.lock().unwrap();
        state.summary.is_some()
    }

    async fn emit(&self, msg: EventMsg) {
        let event = Event {
            id: self.run_id.clone(),
            msg,
        };
        let _ = self.tx_event.send(event).await;
    }
}
