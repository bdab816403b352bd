//! Bridges model function calls to the sandbox. Each sandbox-touching body
//! runs inside a durable step with a per-call sequence number in the label,
//! so repeated agent turns memoize independently and replays never repeat a
//! completed side effect.

use std::sync::Arc;
use std::sync::Mutex;

use async_channel::Sender;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::agent::RunState;
use crate::error::Result;
use crate::models::FunctionCallOutputPayload;
use crate::models::ResponseInputItem;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::sandbox::SandboxClient;
use crate::steps::StepExecutor;
use crate::validator::validate_batch;

/// One normalized file to write or one file read back from the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

/// The shapes `write_files` arguments arrive in. Models are supposed to send
/// an array of `{path, content}` objects but routinely produce the other
/// three, so normalization is an explicit, testable step.
#[derive(Debug)]
enum WriteFilesInput {
    Array(Vec<Value>),
    SingleObject(Value),
    JsonString(String),
    RawString(String),
}

fn classify_files_value(files: Value) -> WriteFilesInput {
    match files {
        Value::Array(entries) => WriteFilesInput::Array(entries),
        Value::Object(_) => WriteFilesInput::SingleObject(files),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Array(entries)) => WriteFilesInput::Array(entries),
            Ok(Value::Object(obj)) => WriteFilesInput::SingleObject(Value::Object(obj)),
            _ => WriteFilesInput::JsonString(s),
        },
        other => WriteFilesInput::RawString(other.to_string()),
    }
}

/// Keeps an entry only when it has a non-empty string `path` and a string
/// `content`. Empty-string content is valid and kept; a missing or null
/// content is not.
fn filter_entries(entries: Vec<Value>) -> Vec<FileEntry> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let path = entry.get("path")?.as_str()?.to_string();
            if path.is_empty() {
                return None;
            }
            let content = entry.get("content")?.as_str()?.to_string();
            Some(FileEntry { path, content })
        })
        .collect()
}

/// Best-effort extraction of a single `{path, content}` pair from a string
/// that is not valid JSON, undoing the common escape sequences. Only used
/// when the router runs in lenient mode.
fn extract_single_entry(raw: &str) -> Option<FileEntry> {
    let path = extract_string_field(raw, "path")?;
    let content = extract_string_field(raw, "content")?;
    if path.is_empty() {
        return None;
    }
    Some(FileEntry { path, content })
}

fn extract_string_field(raw: &str, field: &str) -> Option<String> {
    let needle = format!("\"{field}\"");
    let after_key = &raw[raw.find(&needle)? + needle.len()..];
    let after_colon = after_key.trim_start().strip_prefix(':')?.trim_start();
    let body = after_colon.strip_prefix('"')?;

    let mut out = String::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            },
            other => out.push(other),
        }
    }
    None
}

/// Resolves whatever shape the model sent into an ordered list of file
/// entries, or a descriptive message the model can react to.
pub(crate) fn normalize_write_files_args(
    arguments: &str,
    lenient: bool,
) -> std::result::Result<Vec<FileEntry>, String> {
    let parsed: Value = serde_json::from_str(arguments)
        .map_err(|e| format!("failed to parse function arguments: {e}"))?;

    let files = match parsed {
        // A bare array instead of the documented object wrapper.
        Value::Array(_) => parsed,
        Value::Object(ref obj) => match obj.get("files") {
            Some(files) => files.clone(),
            None => return Err("missing `files` in function arguments".to_string()),
        },
        _ => return Err("function arguments must be an object with `files`".to_string()),
    };

    let entries = match classify_files_value(files) {
        WriteFilesInput::Array(entries) => filter_entries(entries),
        WriteFilesInput::SingleObject(obj) => filter_entries(vec![obj]),
        WriteFilesInput::JsonString(s) | WriteFilesInput::RawString(s) => {
            if !lenient {
                return Err(
                    "`files` is not a JSON array of {path, content} objects".to_string()
                );
            }
            match extract_single_entry(&s) {
                Some(entry) => vec![entry],
                None => {
                    return Err(format!(
                        "could not extract a {{path, content}} pair from: {s}"
                    ));
                }
            }
        }
    };

    if entries.is_empty() {
        return Err("no valid files provided".to_string());
    }
    Ok(entries)
}

#[derive(Deserialize, Debug)]
struct RunCommandArgs {
    command: String,
}

#[derive(Deserialize, Debug)]
struct ReadFilesArgs {
    paths: Vec<String>,
}

/// Memoized result of one `run_command` step.
#[derive(Serialize, Deserialize)]
struct CommandResult {
    content: String,
    success: bool,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

pub struct ToolRouter {
    sandbox: SandboxClient,
    sandbox_id: String,
    steps: StepExecutor,
    state: Arc<Mutex<RunState>>,
    tx_event: Sender<Event>,
    run_id: String,
    /// Enables the best-effort raw-string extraction fallback for
    /// `write_files`. Strict callers turn this off.
    lenient_write_args: bool,
}

impl ToolRouter {
    pub fn new(
        sandbox: SandboxClient,
        sandbox_id: String,
        steps: StepExecutor,
        state: Arc<Mutex<RunState>>,
        tx_event: Sender<Event>,
        run_id: String,
        lenient_write_args: bool,
    ) -> Self {
        Self {
            sandbox,
            sandbox_id,
            steps,
            state,
            tx_event,
            run_id,
            lenient_write_args,
        }
    }

    /// Dispatches one model tool call. Anything the model can usefully react
    /// to (bad arguments, failed commands, rejected files) comes back as tool
    /// output; infrastructure failures (expired sandbox, exhausted step
    /// retries) propagate and abort the run.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: &str,
        call_id: String,
    ) -> Result<ResponseInputItem> {
        match name {
            "run_command" => self.run_command(arguments, call_id).await,
            "write_files" => self.write_files(arguments, call_id).await,
            "read_files" => self.read_files(arguments, call_id).await,
            _ => Ok(tool_output(
                call_id,
                format!("unsupported call: {name}"),
                None,
            )),
        }
    }

    async fn run_command(&self, arguments: &str, call_id: String) -> Result<ResponseInputItem> {
        let args = match serde_json::from_str::<RunCommandArgs>(arguments) {
            Ok(args) => args,
            Err(e) => {
                // Let the model re-sample.
                return Ok(tool_output(
                    call_id,
                    format!("failed to parse function arguments: {e}"),
                    None,
                ));
            }
        };

        let seq = self.next_call_seq();
        self.emit(EventMsg::ExecCommandBegin {
            call_id: call_id.clone(),
            command: args.command.clone(),
        })
        .await;

        let sandbox = self.sandbox.clone();
        let sandbox_id = self.sandbox_id.clone();
        let command = args.command.clone();
        let result: CommandResult = self
            .steps
            .run(&format!("run-command#{seq}"), || {
                let sandbox = sandbox.clone();
                let sandbox_id = sandbox_id.clone();
                let command = command.clone();
                async move {
                    let handle = sandbox.resolve(&sandbox_id).await?;
                    let mut stdout = String::new();
                    let mut stderr = String::new();
                    let outcome = handle
                        .exec(
                            &command,
                            |chunk| stdout.push_str(chunk),
                            |chunk| stderr.push_str(chunk),
                        )
                        .await;
                    // Failures are data for the model, not raised errors: a
                    // raised error would end the loop instead of letting the
                    // agent read the diagnostics and correct course.
                    Ok(match outcome {
                        Ok(0) => CommandResult {
                            content: stdout.clone(),
                            success: true,
                            exit_code: 0,
                            stdout,
                            stderr,
                        },
                        Ok(code) => CommandResult {
                            content: format!(
                                "command failed with exit code {code}\nstdout: {stdout}\nstderr: {stderr}"
                            ),
                            success: false,
                            exit_code: code,
                            stdout,
                            stderr,
                        },
                        Err(e) => CommandResult {
                            content: format!(
                                "command failed: {e}\nstdout: {stdout}\nstderr: {stderr}"
                            ),
                            success: false,
                            exit_code: -1,
                            stdout,
                            stderr,
                        },
                    })
                }
            })
            .await?;

        self.emit(EventMsg::ExecCommandEnd {
            call_id: call_id.clone(),
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            exit_code: result.exit_code,
        })
        .await;

        Ok(tool_output(call_id, result.content, Some(result.success)))
    }

    async fn write_files(&self, arguments: &str, call_id: String) -> Result<ResponseInputItem> {
        let files = match normalize_write_files_args(arguments, self.lenient_write_args) {
            Ok(files) => files,
            Err(msg) => return Ok(tool_output(call_id, msg, Some(false))),
        };

        // Validation gates the whole batch before anything is written, so a
        // rejected batch leaves both the sandbox and the run state untouched.
        if let Err(msg) =
            validate_batch(files.iter().map(|f| (f.path.as_str(), f.content.as_str())))
        {
            return Ok(tool_output(call_id, msg, Some(false)));
        }

        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        let seq = self.next_call_seq();
        self.emit(EventMsg::FileWriteBegin {
            call_id: call_id.clone(),
            paths: paths.clone(),
        })
        .await;

        let sandbox = self.sandbox.clone();
        let sandbox_id = self.sandbox_id.clone();
        let step_files = files.clone();
        let written: Vec<String> = self
            .steps
            .run(&format!("write-files#{seq}"), || {
                let sandbox = sandbox.clone();
                let sandbox_id = sandbox_id.clone();
                let files = step_files.clone();
                async move {
                    let handle = sandbox.resolve(&sandbox_id).await?;
                    for file in &files {
                        if let Some((parent, _)) = file.path.rsplit_once('/') {
                            handle.mkdir(parent).await?;
                        }
                        handle.write_file(&file.path, &file.content).await?;
                    }
                    Ok(files.into_iter().map(|f| f.path).collect())
                }
            })
            .await?;

        // Merge into the *current* run state rather than a snapshot taken
        // before the step, so nothing written earlier in the turn is lost.
        {
            #[expect(clippy::unwrap_used)]
            let mut state = self.state.lock().unwrap();
            for file in &files {
                state.files.insert(file.path.clone(), file.content.clone());
            }
        }

        self.emit(EventMsg::FileWriteEnd {
            call_id: call_id.clone(),
            success: true,
        })
        .await;

        Ok(tool_output(
            call_id,
            format!("Created or updated files: {}", written.join(", ")),
            Some(true),
        ))
    }

    async fn read_files(&self, arguments: &str, call_id: String) -> Result<ResponseInputItem> {
        let args = match serde_json::from_str::<ReadFilesArgs>(arguments) {
            Ok(args) => args,
            Err(e) => {
                return Ok(tool_output(
                    call_id,
                    format!("failed to parse function arguments: {e}"),
                    None,
                ));
            }
        };

        let seq = self.next_call_seq();
        let sandbox = self.sandbox.clone();
        let sandbox_id = self.sandbox_id.clone();
        let paths = args.paths.clone();
        let entries: Vec<FileEntry> = self
            .steps
            .run(&format!("read-files#{seq}"), || {
                let sandbox = sandbox.clone();
                let sandbox_id = sandbox_id.clone();
                let paths = paths.clone();
                async move {
                    let handle = sandbox.resolve(&sandbox_id).await?;
                    let mut entries = Vec::with_capacity(paths.len());
                    for path in &paths {
                        match handle.read_file(path).await {
                            Ok(content) => entries.push(FileEntry {
                                path: path.clone(),
                                content,
                            }),
                            Err(e) => {
                                // A clearly-empty result beats partial data
                                // silently missing entries.
                                warn!(path, "read_files failed: {e}");
                                return Ok(Vec::new());
                            }
                        }
                    }
                    Ok(entries)
                }
            })
            .await?;

        Ok(tool_output(
            call_id,
            serde_json::to_string(&entries)?,
            Some(true),
        ))
    }

    fn next_call_seq(&self) -> u64 {
        #[expect(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        state.next_call_seq += 1;
        state.next_call_seq
    }

    async fn emit(&self, msg: EventMsg) {
        let event = Event {
            id: self.run_id.clone(),
            msg,
        };
        let _ = self.tx_event.send(event).await;
    }
}

fn tool_output(call_id: String, content: String, success: Option<bool>) -> ResponseInputItem {
    ResponseInputItem::FunctionCallOutput {
        call_id,
        output: FunctionCallOutputPayload { content, success },
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(path: &str, content: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn normalizes_documented_array_shape_in_order() {
        let args = r#"{"files":[{"path":"app/b.tsx","content":"b"},{"path":"app/a.tsx","content":"a"}]}"#;
        let files = normalize_write_files_args(args, false).unwrap();
        assert_eq!(files, vec![entry("app/b.tsx", "b"), entry("app/a.tsx", "a")]);
    }

    #[test]
    fn normalizes_bare_array_arguments() {
        let args = r#"[{"path":"app/a.tsx","content":"a"}]"#;
        let files = normalize_write_files_args(args, false).unwrap();
        assert_eq!(files, vec![entry("app/a.tsx", "a")]);
    }

    #[test]
    fn normalizes_single_object() {
        let args = r#"{"files":{"path":"app/a.tsx","content":"a"}}"#;
        let files = normalize_write_files_args(args, false).unwrap();
        assert_eq!(files, vec![entry("app/a.tsx", "a")]);
    }

    #[test]
    fn normalizes_json_encoded_string() {
        let args = r#"{"files":"[{\"path\":\"app/a.tsx\",\"content\":\"a\"}]"}"#;
        let files = normalize_write_files_args(args, false).unwrap();
        assert_eq!(files, vec![entry("app/a.tsx", "a")]);
    }

    #[test]
    fn lenient_mode_extracts_pair_from_raw_string() {
        let args = r#"{"files":"\"path\": \"app/a.tsx\", \"content\": \"line1\\nline2\""}"#;
        // Not valid JSON once unwrapped; needs the pattern fallback.
        let raw = serde_json::from_str::<Value>(args).unwrap()["files"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(serde_json::from_str::<Value>(&raw).is_err());

        let files = normalize_write_files_args(args, true).unwrap();
        assert_eq!(files, vec![entry("app/a.tsx", "line1\nline2")]);
    }

    #[test]
    fn strict_mode_rejects_raw_string() {
        let args = r#"{"files":"\"path\": \"app/a.tsx\", \"content\": \"x\""}"#;
        let err = normalize_write_files_args(args, false).unwrap_err();
        assert!(err.contains("not a JSON array"));
    }

    #[test]
    fn drops_entries_without_path_or_content_but_keeps_empty_content() {
        let args = r#"{"files":[
            {"path":"app/keep.tsx","content":""},
            {"path":"","content":"dropped"},
            {"content":"no path"},
            {"path":"app/null.tsx","content":null},
            {"path":"app/missing.tsx"}
        ]}"#;
        let files = normalize_write_files_args(args, false).unwrap();
        assert_eq!(files, vec![entry("app/keep.tsx", "")]);
    }

    #[test]
    fn empty_batch_is_an_error_message() {
        let err = normalize_write_files_args(r#"{"files":[]}"#, false).unwrap_err();
        assert_eq!(err, "no valid files provided");
    }

    #[test]
    fn unparseable_arguments_are_reported_not_raised() {
        let err = normalize_write_files_args("not json", true).unwrap_err();
        assert!(err.starts_with("failed to parse function arguments"));
    }
}
