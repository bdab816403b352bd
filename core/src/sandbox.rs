//! HTTP client for the remote sandbox service: one disposable execution
//! environment per run, addressed by an opaque id, with a command shell and
//! a small file-system surface.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::prelude::*;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::timeout;
use tracing::debug;

use crate::error::FragmentErr;
use crate::error::Result;
use crate::flags::SANDBOX_API_BASE;
use crate::flags::SANDBOX_API_KEY;
use crate::flags::SANDBOX_DOMAIN;

const EXEC_IDLE_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Connection parameters for the sandbox service. Tests construct this
/// directly; production callers use `from_env`.
#[derive(Debug, Clone)]
pub struct SandboxEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Domain public hostnames are derived under.
    pub domain: String,
}

impl SandboxEndpoint {
    pub fn from_env() -> Self {
        Self {
            base_url: SANDBOX_API_BASE.to_string(),
            api_key: SANDBOX_API_KEY.map(str::to_string),
            domain: SANDBOX_DOMAIN.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct SandboxClient {
    client: reqwest::Client,
    endpoint: SandboxEndpoint,
}

#[derive(Debug, Deserialize)]
struct CreateSandboxResponse {
    sandbox_id: String,
}

impl SandboxClient {
    pub fn new(endpoint: SandboxEndpoint) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Provisions a fresh isolated environment from `template`. Any failure
    /// here is a provisioning error: the run has no environment at all.
    pub async fn create(&self, template: &str) -> Result<String> {
        let url = format!("{}/sandboxes", self.base_url());
        let body = serde_json::json!({ "template": template });
        let resp = self
            .request(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| FragmentErr::Provision(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = (resp.text().await).unwrap_or_default();
            return Err(FragmentErr::Provision(format!("{status}: {body}")));
        }

        let created: CreateSandboxResponse = resp
            .json()
            .await
            .map_err(|e| FragmentErr::Provision(e.to_string()))?;
        debug!(sandbox_id = created.sandbox_id, "sandbox provisioned");
        Ok(created.sandbox_id)
    }

    /// Re-attaches to an existing environment. Must succeed for the lifetime
    /// of the run; a sandbox that has expired (404/410) surfaces as a
    /// resolution error, distinct from provisioning failure.
    pub async fn resolve(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        let url = format!("{}/sandboxes/{sandbox_id}", self.base_url());
        let resp = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| FragmentErr::Resolution {
                id: sandbox_id.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = (resp.text().await).unwrap_or_default();
            return Err(FragmentErr::Resolution {
                id: sandbox_id.to_string(),
                reason: format!("{status}: {body}"),
            });
        }

        Ok(SandboxHandle {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            id: sandbox_id.to_string(),
        })
    }

    fn base_url(&self) -> &str {
        self.endpoint.base_url.trim_end_matches('/')
    }

    fn request(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

/// Live handle to one sandbox. Cheap to clone; all state lives remotely.
#[derive(Clone)]
pub struct SandboxHandle {
    client: reqwest::Client,
    endpoint: SandboxEndpoint,
    id: String,
}

/// One event on the exec SSE stream.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ExecStreamEvent {
    Stdout { chunk: String },
    Stderr { chunk: String },
    Exit { exit_code: i32 },
}

impl SandboxHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Derived public hostname for `port`; no network call involved.
    pub fn public_host(&self, port: u16) -> String {
        format!("{port}-{}.{}", self.id, self.endpoint.domain)
    }

    /// Runs `command` in the sandbox shell. Stdout and stderr chunks are
    /// forwarded to the callbacks as they arrive; the returned value is the
    /// command's exit code. The callbacks own the accumulation buffers.
    pub async fn exec(
        &self,
        command: &str,
        mut on_stdout: impl FnMut(&str),
        mut on_stderr: impl FnMut(&str),
    ) -> Result<i32> {
        let url = format!("{}/exec", self.sandbox_url());
        let body = serde_json::json!({ "command": command });
        let resp = self
            .request(self.client.post(&url).json(&body))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = (resp.text().await).unwrap_or_default();
            return Err(FragmentErr::UnexpectedStatus(status, body));
        }

        let mut stream = resp.bytes_stream().eventsource();
        loop {
            let sse = match timeout(EXEC_IDLE_TIMEOUT, stream.next()).await {
                Ok(Some(Ok(sse))) => sse,
                Ok(Some(Err(e))) => return Err(FragmentErr::Stream(e.to_string())),
                Ok(None) => {
                    return Err(FragmentErr::Stream(
                        "exec stream closed before exit event".into(),
                    ));
                }
                Err(_) => {
                    return Err(FragmentErr::Stream("idle timeout waiting for exec".into()));
                }
            };

            let event: ExecStreamEvent = match serde_json::from_str(&sse.data) {
                Ok(event) => event,
                Err(e) => {
                    debug!("failed to parse exec event: {e}, data: {}", &sse.data);
                    continue;
                }
            };
            match event {
                ExecStreamEvent::Stdout { chunk } => on_stdout(&chunk),
                ExecStreamEvent::Stderr { chunk } => on_stderr(&chunk),
                ExecStreamEvent::Exit { exit_code } => return Ok(exit_code),
            }
        }
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let url = format!("{}/files", self.sandbox_url());
        let resp = self
            .request(self.client.put(&url).query(&[("path", path)]))
            .body(content.to_string())
            .send()
            .await?;
        self.expect_success(resp).await
    }

    /// Idempotent: a directory that already exists (409) is success.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let url = format!("{}/dirs", self.sandbox_url());
        let body = serde_json::json!({ "path": path });
        let resp = self
            .request(self.client.post(&url).json(&body))
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        self.expect_success(resp).await
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let url = format!("{}/files", self.sandbox_url());
        let resp = self
            .request(self.client.get(&url).query(&[("path", path)]))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = (resp.text().await).unwrap_or_default();
            return Err(FragmentErr::UnexpectedStatus(status, body));
        }
        Ok(resp.text().await?)
    }

    fn sandbox_url(&self) -> String {
        format!(
            "{}/sandboxes/{}",
            self.endpoint.base_url.trim_end_matches('/'),
            self.id
        )
    }

    fn request(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn expect_success(&self, resp: reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = (resp.text().await).unwrap_or_default();
            Err(FragmentErr::UnexpectedStatus(status, body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> SandboxHandle {
        SandboxHandle {
            client: reqwest::Client::new(),
            endpoint: SandboxEndpoint {
                base_url: "http://localhost:0".to_string(),
                api_key: None,
                domain: "e2b.dev".to_string(),
            },
            id: id.to_string(),
        }
    }

    #[test]
    fn public_host_embeds_port_id_and_domain() {
        assert_eq!(handle("sb_42").public_host(3000), "3000-sb_42.e2b.dev");
    }
}
