#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use fragment_core::FragmentRunner;
use fragment_core::InMemoryStepStore;
use fragment_core::ModelClient;
use fragment_core::ModelEndpoint;
use fragment_core::RunRequest;
use fragment_core::SandboxClient;
use fragment_core::SandboxEndpoint;
use fragment_core::StepExecutor;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_string_contains;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::query_param;

fn sse(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|e| format!("data: {e}\n\n"))
        .collect::<String>()
}

fn read_files_turn(paths: &[&str]) -> String {
    sse(&[
        serde_json::json!({
            "type": "response.output_item.done",
            "item": {
                "type": "function_call",
                "name": "read_files",
                "arguments": serde_json::json!({ "paths": paths }).to_string(),
                "call_id": "call_read",
            }
        }),
        serde_json::json!({
            "type": "response.completed",
            "response": { "id": "resp_read" }
        }),
    ])
}

fn summary_turn() -> String {
    sse(&[
        serde_json::json!({
            "type": "response.output_item.done",
            "item": {
                "type": "message",
                "role": "assistant",
                "content": [{
                    "type": "output_text",
                    "text": "<task_summary>\nInspected the files.\n</task_summary>"
                }],
            }
        }),
        serde_json::json!({
            "type": "response.completed",
            "response": { "id": "resp_done" }
        }),
    ])
}

async fn mount_sandbox(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/sandboxes"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(serde_json::json!({ "sandbox_id": "sb_read" })),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/sb_read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(server)
        .await;
}

fn runner_for(
    server: &MockServer,
    tx_event: async_channel::Sender<fragment_core::Event>,
) -> FragmentRunner {
    let client = ModelClient::new(
        "gpt-4.1",
        ModelEndpoint {
            base_url: server.uri(),
            api_key: None,
            request_max_retries: 0,
            stream_idle_timeout: Duration::from_secs(5),
        },
    );
    let sandbox = SandboxClient::new(SandboxEndpoint {
        base_url: server.uri(),
        api_key: None,
        domain: "e2b.test".to_string(),
    });
    let steps = StepExecutor::new(Arc::new(InMemoryStepStore::default()));
    FragmentRunner::new(client, sandbox, steps, tx_event, "run-read")
}

/// One unreadable path empties the whole result: the model sees `[]`, not a
/// partial listing with entries silently missing.
#[tokio::test]
async fn any_failed_read_yields_an_empty_result_set() {
    let server = MockServer::start().await;
    mount_sandbox(&server).await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/sb_read/files"))
        .and(query_param("path", "app/a.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("alpha"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/sb_read/files"))
        .and(query_param("path", "missing.ts"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_string_contains(r#""output":"[]""#))
        .respond_with(ResponseTemplate::new(200).set_body_raw(summary_turn(), "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            read_files_turn(&["app/a.ts", "missing.ts"]),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let (tx_event, _rx_event) = async_channel::unbounded();
    let runner = runner_for(&server, tx_event);
    let artifact = runner
        .run(RunRequest {
            value: "what is in those files".to_string(),
        })
        .await
        .unwrap();
    assert!(artifact.summary.is_some());
}

/// All-success reads come back as entries in the order the paths were
/// requested.
#[tokio::test]
async fn successful_reads_preserve_input_order() {
    let server = MockServer::start().await;
    mount_sandbox(&server).await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/sb_read/files"))
        .and(query_param("path", "app/a.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("alpha"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sandboxes/sb_read/files"))
        .and(query_param("path", "lib/b.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("beta"))
        .mount(&server)
        .await;

    // The tool output is a JSON string; inside the request body its quotes
    // arrive escaped, so this substring pins the exact entry order.
    let ordered = r#""output":"[{\"path\":\"app/a.ts\",\"content\":\"alpha\"},{\"path\":\"lib/b.ts\",\"content\":\"beta\"}]""#;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .and(body_string_contains(ordered))
        .respond_with(ResponseTemplate::new(200).set_body_raw(summary_turn(), "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            read_files_turn(&["app/a.ts", "lib/b.ts"]),
            "text/event-stream",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let (tx_event, _rx_event) = async_channel::unbounded();
    let runner = runner_for(&server, tx_event);
    let artifact = runner
        .run(RunRequest {
            value: "show me both files".to_string(),
        })
        .await
        .unwrap();
    assert!(artifact.summary.is_some());
}
