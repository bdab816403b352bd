use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::prelude::*;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::client_common::ResponseStream;
use crate::client_common::ResponsesApiRequest;
use crate::error::FragmentErr;
use crate::error::Result;
use crate::flags::MODEL_API_BASE;
use crate::flags::MODEL_API_KEY;
use crate::flags::MODEL_REQUEST_MAX_RETRIES;
use crate::flags::MODEL_STREAM_IDLE_TIMEOUT_MS;
use crate::models::ResponseItem;
use crate::util::backoff;

/// When serialized as JSON, this produces a valid function tool definition
/// for the model endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum ToolSpec {
    #[serde(rename = "function")]
    Function(FunctionTool),
}

#[derive(Debug, Clone, Serialize)]
struct FunctionTool {
    name: &'static str,
    description: &'static str,
    strict: bool,
    parameters: JsonSchema,
}

/// Generic JSON‑Schema subset needed for our tool definitions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum JsonSchema {
    String,
    Array {
        items: Box<JsonSchema>,
    },
    Object {
        properties: BTreeMap<String, JsonSchema>,
        required: &'static [&'static str],
        #[serde(rename = "additionalProperties")]
        additional_properties: bool,
    },
}

fn file_entry_schema() -> JsonSchema {
    let mut properties = BTreeMap::new();
    properties.insert("path".to_string(), JsonSchema::String);
    properties.insert("content".to_string(), JsonSchema::String);
    JsonSchema::Object {
        properties,
        required: &["path", "content"],
        additional_properties: false,
    }
}

/// The three coding-agent tools, in the shape the endpoint expects.
static AGENT_TOOLS: LazyLock<Vec<ToolSpec>> = LazyLock::new(|| {
    let mut run_command = BTreeMap::new();
    run_command.insert("command".to_string(), JsonSchema::String);

    let mut write_files = BTreeMap::new();
    write_files.insert(
        "files".to_string(),
        JsonSchema::Array {
            items: Box::new(file_entry_schema()),
        },
    );

    let mut read_files = BTreeMap::new();
    read_files.insert(
        "paths".to_string(),
        JsonSchema::Array {
            items: Box::new(JsonSchema::String),
        },
    );

    vec![
        ToolSpec::Function(FunctionTool {
            name: "run_command",
            description: "Runs a shell command inside the sandbox and returns its output.",
            strict: false,
            parameters: JsonSchema::Object {
                properties: run_command,
                required: &["command"],
                additional_properties: false,
            },
        }),
        ToolSpec::Function(FunctionTool {
            name: "write_files",
            description: "Creates or updates files in the sandbox file system.",
            strict: false,
            parameters: JsonSchema::Object {
                properties: write_files,
                required: &["files"],
                additional_properties: false,
            },
        }),
        ToolSpec::Function(FunctionTool {
            name: "read_files",
            description: "Reads files from the sandbox file system.",
            strict: false,
            parameters: JsonSchema::Object {
                properties: read_files,
                required: &["paths"],
                additional_properties: false,
            },
        }),
    ]
});

/// Connection parameters for the model endpoint. `from_env` reads the
/// process environment; tests construct this directly so they never touch
/// env vars.
#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_max_retries: u64,
    pub stream_idle_timeout: Duration,
}

impl ModelEndpoint {
    pub fn from_env() -> Self {
        Self {
            base_url: MODEL_API_BASE.to_string(),
            api_key: MODEL_API_KEY.map(str::to_string),
            request_max_retries: *MODEL_REQUEST_MAX_RETRIES,
            stream_idle_timeout: *MODEL_STREAM_IDLE_TIMEOUT_MS,
        }
    }
}

#[derive(Clone)]
pub struct ModelClient {
    model: String,
    client: reqwest::Client,
    endpoint: ModelEndpoint,
}

impl ModelClient {
    pub fn new(model: impl ToString, endpoint: ModelEndpoint) -> Self {
        Self {
            model: model.to_string(),
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Opens one streamed model turn. Retries the HTTP handshake on 429/5xx
    /// with backoff (honoring Retry-After); any other failure status is
    /// surfaced with its body so callers see the endpoint's actual message.
    pub async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream> {
        let tools_json = AGENT_TOOLS
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let full_instructions = prompt.get_full_instructions();
        let payload = ResponsesApiRequest {
            model: &self.model,
            instructions: &full_instructions,
            input: &prompt.input,
            tools: &tools_json,
            tool_choice: "auto",
            parallel_tool_calls: false,
            stream: true,
        };

        let url = format!("{}/responses", self.endpoint.base_url.trim_end_matches('/'));
        debug!(url, "POST");
        trace!("request payload: {}", serde_json::to_string(&payload)?);

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut req = self
                .client
                .post(&url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&payload);
            if let Some(api_key) = &self.endpoint.api_key {
                req = req.bearer_auth(api_key);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let (tx_event, rx_event) = mpsc::channel::<Result<ResponseEvent>>(16);

                    let stream = resp.bytes_stream().map_err(FragmentErr::Reqwest);
                    tokio::spawn(process_sse(
                        stream,
                        tx_event,
                        self.endpoint.stream_idle_timeout,
                    ));

                    return Ok(ResponseStream { rx_event });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = (resp.text().await).unwrap_or_default();
                        return Err(FragmentErr::UnexpectedStatus(status, body));
                    }

                    if attempt > self.endpoint.request_max_retries {
                        return Err(FragmentErr::RetryLimit(status));
                    }

                    let retry_after_secs = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    let delay = retry_after_secs
                        .map(|s| Duration::from_millis(s * 1_000))
                        .unwrap_or_else(|| backoff(attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > self.endpoint.request_max_retries {
                        return Err(e.into());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct SseEvent {
    #[serde(rename = "type")]
    kind: String,
    response: Option<Value>,
    item: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResponseCompleted {
    id: String,
}

async fn process_sse<S>(
    stream: S,
    tx_event: mpsc::Sender<Result<ResponseEvent>>,
    idle_timeout: Duration,
) where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();

    // The response id delivered by the terminal "completed" message.
    let mut response_id = None;

    loop {
        let sse = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(sse))) => sse,
            Ok(Some(Err(e))) => {
                debug!("SSE Error: {e:#}");
                let _ = tx_event.send(Err(FragmentErr::Stream(e.to_string()))).await;
                return;
            }
            Ok(None) => {
                match response_id {
                    Some(response_id) => {
                        let event = ResponseEvent::Completed { response_id };
                        let _ = tx_event.send(Ok(event)).await;
                    }
                    None => {
                        let _ = tx_event
                            .send(Err(FragmentErr::Stream(
                                "stream closed before response.completed".into(),
                            )))
                            .await;
                    }
                }
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(FragmentErr::Stream(
                        "idle timeout waiting for SSE".into(),
                    )))
                    .await;
                return;
            }
        };

        let event: SseEvent = match serde_json::from_str(&sse.data) {
            Ok(event) => event,
            Err(e) => {
                debug!("Failed to parse SSE event: {e}, data: {}", &sse.data);
                continue;
            }
        };

        trace!(?event, "SSE event");
        match event.kind.as_str() {
            // Forward each finalised output item as it arrives so tool calls
            // execute live instead of waiting for the terminal envelope.
            "response.output_item.done" => {
                let Some(item_val) = event.item else { continue };
                let Ok(item) = serde_json::from_value::<ResponseItem>(item_val) else {
                    debug!("failed to parse ResponseItem from output_item.done");
                    continue;
                };

                let event = ResponseEvent::OutputItemDone(item);
                if tx_event.send(Ok(event)).await.is_err() {
                    return;
                }
            }
            "response.completed" => {
                if let Some(resp_val) = event.response {
                    match serde_json::from_value::<ResponseCompleted>(resp_val) {
                        Ok(r) => {
                            response_id = Some(r.id);
                        }
                        Err(e) => {
                            debug!("failed to parse ResponseCompleted: {e}");
                            continue;
                        }
                    };
                };
            }
            other => debug!(other, "sse event"),
        }
    }
}
