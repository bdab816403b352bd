//! Durable step execution: each named unit of work runs at most once per
//! workflow instance, with the result memoized so replays after a crash or
//! resume return the recorded value instead of re-running side effects.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::BufRead;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::error::FragmentErr;
use crate::error::Result;
use crate::util::backoff;

const DEFAULT_MAX_ATTEMPTS: u64 = 3;

/// Memo store backing a [`StepExecutor`]. Keyed by step label; one store per
/// workflow instance, so distinct instances share no state.
pub trait StepStore: Send + Sync {
    fn get(&self, label: &str) -> Option<Value>;
    fn put(&self, label: &str, value: &Value) -> std::io::Result<()>;
}

/// Volatile store for tests and callers that do not need crash durability.
#[derive(Default)]
pub struct InMemoryStepStore {
    memo: Mutex<HashMap<String, Value>>,
}

impl StepStore for InMemoryStepStore {
    fn get(&self, label: &str) -> Option<Value> {
        #[expect(clippy::unwrap_used)]
        let memo = self.memo.lock().unwrap();
        memo.get(label).cloned()
    }

    fn put(&self, label: &str, value: &Value) -> std::io::Result<()> {
        #[expect(clippy::unwrap_used)]
        let mut memo = self.memo.lock().unwrap();
        match memo.entry(label.to_string()) {
            Entry::Occupied(_) => {
                warn!(label, "step label recorded twice, keeping first result");
            }
            Entry::Vacant(slot) => {
                slot.insert(value.clone());
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct JournalLine {
    label: String,
    result: Value,
}

/// Append-only JSONL journal, one file per workflow instance
/// (`steps-{instance}.jsonl`). The whole journal is loaded on open, so a
/// process restart replays completed steps from the memo instead of
/// re-executing them.
pub struct JsonlStepStore {
    memo: Mutex<HashMap<String, Value>>,
    file: Mutex<std::fs::File>,
}

impl JsonlStepStore {
    pub fn open(dir: impl AsRef<Path>, instance: &str) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path: PathBuf = dir.join(format!("steps-{instance}.jsonl"));

        let mut memo = HashMap::new();
        if path.exists() {
            let reader = std::io::BufReader::new(std::fs::File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalLine>(&line) {
                    // First record wins: that is the result the original
                    // execution observed.
                    Ok(entry) => {
                        memo.entry(entry.label).or_insert(entry.result);
                    }
                    Err(e) => warn!("skipping malformed journal line: {e}"),
                }
            }
        }
        debug!(?path, steps = memo.len(), "opened step journal");

        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)?;
        Ok(Self {
            memo: Mutex::new(memo),
            file: Mutex::new(file),
        })
    }
}

impl StepStore for JsonlStepStore {
    fn get(&self, label: &str) -> Option<Value> {
        #[expect(clippy::unwrap_used)]
        let memo = self.memo.lock().unwrap();
        memo.get(label).cloned()
    }

    fn put(&self, label: &str, value: &Value) -> std::io::Result<()> {
        {
            #[expect(clippy::unwrap_used)]
            let mut memo = self.memo.lock().unwrap();
            match memo.entry(label.to_string()) {
                Entry::Occupied(_) => {
                    warn!(label, "step label recorded twice, keeping first result");
                    return Ok(());
                }
                Entry::Vacant(slot) => {
                    slot.insert(value.clone());
                }
            }
        }
        let line = serde_json::to_string(&JournalLine {
            label: label.to_string(),
            result: value.clone(),
        })?;
        #[expect(clippy::unwrap_used)]
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }
}

/// Executes named operations with at-most-once-effect semantics. Injected
/// into every component that needs durability so none of them depend on an
/// ambient workflow context.
#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn StepStore>,
    max_attempts: u64,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn StepStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Runs `f` under `label`. If the label already has a recorded result the
    /// memo is returned and `f` is never invoked; otherwise `f` runs with a
    /// bounded backoff retry, and its result is recorded durably before being
    /// returned. Labels must be unique within one workflow instance.
    pub async fn run<T, F, Fut>(&self, label: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(recorded) = self.store.get(label) {
            debug!(label, "step replayed from memo");
            return serde_json::from_value(recorded).map_err(|source| FragmentErr::StepDecode {
                label: label.to_string(),
                source,
            });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(result) => {
                    let value = serde_json::to_value(&result)?;
                    self.store.put(label, &value)?;
                    return Ok(result);
                }
                // Provisioning and resolution failures are fatal by contract;
                // retrying cannot revive a sandbox that never came up or has
                // already expired.
                Err(e @ (FragmentErr::Provision(_) | FragmentErr::Resolution { .. })) => {
                    return Err(e);
                }
                Err(e) if attempt < self.max_attempts => {
                    let delay = backoff(attempt);
                    warn!(label, attempt, "step attempt failed: {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(FragmentErr::StepFailure {
                        label: label.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}
