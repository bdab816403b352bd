#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fragment_core::FragmentRunner;
use fragment_core::JsonlStepStore;
use fragment_core::ModelClient;
use fragment_core::ModelEndpoint;
use fragment_core::RunRequest;
use fragment_core::SandboxClient;
use fragment_core::SandboxEndpoint;
use fragment_core::StepExecutor;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::Request;
use wiremock::Respond;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

struct SeqResponder {
    calls: AtomicUsize,
    bodies: Vec<String>,
}

impl Respond for SeqResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self.bodies[n % self.bodies.len()].clone();
        ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
    }
}

fn sse(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|e| format!("data: {e}\n\n"))
        .collect::<String>()
}

const PAGE_TSX: &str = "export default function Page() {\n  return (\n    <div className=\"p-4\">replayed</div>\n  );\n}\n";

/// Two workflow instances sharing one journal: the second run re-drives the
/// model conversation but every sandbox side effect replays from the memo,
/// and the artifact comes out identical.
#[tokio::test]
async fn journaled_steps_replay_without_repeating_side_effects() {
    let server = MockServer::start().await;

    // Exactly one sandbox creation, one mkdir, and one file write across
    // both runs.
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(serde_json::json!({ "sandbox_id": "sb_replay" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sandboxes/sb_replay/dirs"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/sandboxes/sb_replay/files"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    // Resolved twice on the first run (file write, URL) and never again.
    Mock::given(method("GET"))
        .and(path("/sandboxes/sb_replay"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let turns = vec![
        sse(&[
            serde_json::json!({
                "type": "response.output_item.done",
                "item": {
                    "type": "function_call",
                    "name": "write_files",
                    "arguments": serde_json::json!({
                        "files": [{ "path": "app/page.tsx", "content": PAGE_TSX }]
                    })
                    .to_string(),
                    "call_id": "call_w",
                }
            }),
            serde_json::json!({
                "type": "response.completed",
                "response": { "id": "resp_1" }
            }),
        ]),
        sse(&[
            serde_json::json!({
                "type": "response.output_item.done",
                "item": {
                    "type": "message",
                    "role": "assistant",
                    "content": [{
                        "type": "output_text",
                        "text": "<task_summary>\nWrote app/page.tsx.\n</task_summary>"
                    }],
                }
            }),
            serde_json::json!({
                "type": "response.completed",
                "response": { "id": "resp_2" }
            }),
        ]),
    ];
    // Both runs replay the same two-turn conversation.
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(SeqResponder {
            calls: AtomicUsize::new(0),
            bodies: turns,
        })
        .expect(4)
        .mount(&server)
        .await;

    let journal_dir = tempfile::tempdir().unwrap();
    let run = |instance_dir: std::path::PathBuf| {
        let server_uri = server.uri();
        async move {
            let client = ModelClient::new(
                "gpt-4.1",
                ModelEndpoint {
                    base_url: server_uri.clone(),
                    api_key: None,
                    request_max_retries: 0,
                    stream_idle_timeout: Duration::from_secs(5),
                },
            );
            let sandbox = SandboxClient::new(SandboxEndpoint {
                base_url: server_uri,
                api_key: None,
                domain: "e2b.test".to_string(),
            });
            let store = JsonlStepStore::open(&instance_dir, "run-replay").unwrap();
            let steps = StepExecutor::new(Arc::new(store));
            let (tx_event, _rx_event) = async_channel::unbounded();
            let runner = FragmentRunner::new(client, sandbox, steps, tx_event, "run-replay");
            runner
                .run(RunRequest {
                    value: "build a page".to_string(),
                })
                .await
                .unwrap()
        }
    };

    let first = run(journal_dir.path().to_path_buf()).await;
    let second = run(journal_dir.path().to_path_buf()).await;

    assert_eq!(first, second);
    assert_eq!(second.url, "https://3000-sb_replay.e2b.test");
    assert_eq!(second.files["app/page.tsx"], PAGE_TSX);
    assert!(second.summary.is_some());
}
