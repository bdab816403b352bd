use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    pub MODEL_DEFAULT: &str = "gpt-4.1";
    pub MODEL_API_BASE: &str = "https://api.openai.com/v1";

    /// Bearer token for the model endpoint.
    pub MODEL_API_KEY: Option<&str> = None;
    pub MODEL_REQUEST_MAX_RETRIES: u64 = 4;
    pub MODEL_STREAM_MAX_RETRIES: u64 = 5;

    /// Treat a completely silent SSE stream as disconnected after this long.
    pub MODEL_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    pub SANDBOX_API_BASE: &str = "https://api.e2b.dev";

    /// Bearer token for the sandbox service.
    pub SANDBOX_API_KEY: Option<&str> = None;

    /// Template every fresh sandbox is provisioned from.
    pub SANDBOX_TEMPLATE: &str = "fragment-nextjs";

    /// Domain public sandbox hostnames are derived under
    /// (`{port}-{sandbox_id}.{domain}`).
    pub SANDBOX_DOMAIN: &str = "e2b.dev";

    /// Directory for per-instance durable step journals.
    pub STEP_JOURNAL_DIR: Option<&str> = None;
}
