use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Lifecycle of one tracked workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Running,
    Success,
    Error,
}

/// One progress record per tracked entity (VM name or source IP).
///
/// `log_tail` is the cheap-to-poll latest line; `log_entries` is the full
/// ordered history, populated only by workflows that need a causal trace
/// (IP reassignment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub key: String,
    pub state: WorkflowState,
    pub progress: u8,
    pub log_tail: String,
    #[serde(default)]
    pub log_entries: Vec<String>,
}

impl WorkflowStatus {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: WorkflowState::Pending,
            progress: 0,
            log_tail: String::new(),
            log_entries: Vec::new(),
        }
    }
}

/// Partial update merged into an existing record. Fields left as `None`
/// keep their previous value; `append_entries` only ever grows the history.
#[derive(Debug, Default, Clone)]
pub struct StatusUpdate {
    pub state: Option<WorkflowState>,
    pub progress: Option<u8>,
    pub log_tail: Option<String>,
    pub append_entries: Vec<String>,
}

impl StatusUpdate {
    pub fn running(progress: u8, tail: impl Into<String>) -> Self {
        Self {
            state: Some(WorkflowState::Running),
            progress: Some(progress),
            log_tail: Some(tail.into()),
            append_entries: Vec::new(),
        }
    }

    /// Tail-only heartbeat: refreshes the visible line without touching
    /// the progress a previous checkpoint established.
    pub fn note(tail: impl Into<String>) -> Self {
        Self {
            state: Some(WorkflowState::Running),
            progress: None,
            log_tail: Some(tail.into()),
            append_entries: Vec::new(),
        }
    }

    pub fn success(tail: impl Into<String>) -> Self {
        Self {
            state: Some(WorkflowState::Success),
            progress: Some(100),
            log_tail: Some(tail.into()),
            append_entries: Vec::new(),
        }
    }

    pub fn error(tail: impl Into<String>) -> Self {
        Self {
            state: Some(WorkflowState::Error),
            progress: None,
            log_tail: Some(tail.into()),
            append_entries: Vec::new(),
        }
    }
}

/// Thread-safe keyed record of workflow progress.
///
/// Records are created lazily on first write and live for the process
/// lifetime; there is deliberately no deletion API. A single global mutex
/// is enough here: updates are tiny merges and readers only clone.
#[derive(Default)]
pub struct StatusStore {
    records: Mutex<HashMap<String, WorkflowStatus>>,
}

impl StatusStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the record for `key`, if any workflow has written to it.
    pub fn get(&self, key: &str) -> Option<WorkflowStatus> {
        self.records.lock().unwrap().get(key).cloned()
    }

    /// Merge `update` into the record for `key`, creating it if absent.
    /// The merge happens under the lock, so a concurrent `get` sees either
    /// the whole update or none of it.
    pub fn update(&self, key: &str, update: StatusUpdate) {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(key.to_string())
            .or_insert_with(|| WorkflowStatus::new(key));

        if let Some(state) = update.state {
            record.state = state;
        }
        if let Some(progress) = update.progress {
            record.progress = progress;
        }
        if let Some(tail) = update.log_tail {
            record.log_tail = tail;
        }
        record.log_entries.extend(update.append_entries);
    }

    /// Reset the record for `key` to a fresh `pending` state. Used when a
    /// new workflow launch reuses a key; last write wins by design.
    pub fn reset(&self, key: &str) {
        let mut records = self.records.lock().unwrap();
        records.insert(key.to_string(), WorkflowStatus::new(key));
    }
}

/// Handle a workflow holds to report progress under its own key.
///
/// Every line passes through the redaction list before it is stored, so
/// passwords embedded in remote commands never reach a poller.
#[derive(Clone)]
pub struct StatusWriter {
    store: Arc<StatusStore>,
    key: String,
    redactions: Vec<String>,
}

impl StatusWriter {
    pub fn new(store: Arc<StatusStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            redactions: Vec::new(),
        }
    }

    pub fn with_redactions(mut self, secrets: Vec<String>) -> Self {
        self.redactions = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn clean(&self, line: &str) -> String {
        let mut cleaned = line.to_string();
        for secret in &self.redactions {
            cleaned = cleaned.replace(secret, "******");
        }
        cleaned
    }

    pub fn running(&self, progress: u8, line: &str) {
        self.store
            .update(&self.key, StatusUpdate::running(progress, self.clean(line)));
    }

    /// Update the tail without changing progress.
    pub fn note(&self, line: &str) {
        self.store
            .update(&self.key, StatusUpdate::note(self.clean(line)));
    }

    pub fn succeed(&self, line: &str) {
        self.store
            .update(&self.key, StatusUpdate::success(self.clean(line)));
    }

    pub fn fail(&self, line: &str) {
        self.store
            .update(&self.key, StatusUpdate::error(self.clean(line)));
    }

    /// Append a timestamped line to the full history and mirror it in the
    /// tail. Used by workflows that expose their whole causal trace.
    pub fn append(&self, line: &str) {
        let cleaned = self.clean(line);
        let stamped = format!("{} {}", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), cleaned);
        self.store.update(
            &self.key,
            StatusUpdate {
                state: None,
                progress: None,
                log_tail: Some(cleaned),
                append_entries: vec![stamped],
            },
        );
    }
}

/// Free-form log buffers for the live-sync workflows, keyed by
/// `sourceIP-targetIP-osFamily`. Looser than `StatusStore` on purpose:
/// live sync is continuous, not terminal, so there is no state machine to
/// track, just an operator-readable transcript per pair.
#[derive(Default)]
pub struct SyncLogStore {
    buffers: Mutex<HashMap<String, String>>,
}

impl SyncLogStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn replace(&self, key: &str, contents: impl Into<String>) {
        self.buffers
            .lock()
            .unwrap()
            .insert(key.to_string(), contents.into());
    }

    pub fn append(&self, key: &str, chunk: &str) {
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .entry(key.to_string())
            .or_default()
            .push_str(chunk);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.buffers.lock().unwrap().get(key).cloned()
    }
}

pub fn sync_log_key(source_ip: &str, target_ip: &str, os_family: crate::OsFamily) -> String {
    format!("{}-{}-{}", source_ip, target_ip, os_family.as_str())
}
