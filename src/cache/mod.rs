//! Result cache
//!
//! Request outcomes are stored by request id so a retried request can be
//! answered without another bus round trip. The same backend keeps a short
//! per-client history of task ids and a translation cache keyed by content.

pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use memory::MemoryTaskCache;
pub use self::redis::RedisTaskCache;

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of a `task:<id>` record in seconds
    #[serde(default = "default_task_ttl_secs")]
    pub task_ttl_secs: u64,
    /// Lifetime of a cached translation in seconds
    #[serde(default = "default_translation_ttl_secs")]
    pub translation_ttl_secs: u64,
    /// Answer requests whose content was already translated from cache
    #[serde(default = "default_translation_reuse")]
    pub translation_reuse: bool,
    /// Number of task ids kept per client
    #[serde(default = "default_user_task_limit")]
    pub user_task_limit: usize,
    /// Lifetime of a client's task list in seconds
    #[serde(default = "default_user_task_ttl_secs")]
    pub user_task_ttl_secs: u64,
    /// Maximum entries per in-process cache
    #[serde(default = "default_local_capacity")]
    pub local_capacity: u64,
}

fn default_task_ttl_secs() -> u64 {
    86_400 // 24 hours
}

fn default_translation_ttl_secs() -> u64 {
    604_800 // 7 days
}

fn default_translation_reuse() -> bool {
    true
}

fn default_user_task_limit() -> usize {
    50
}

fn default_user_task_ttl_secs() -> u64 {
    2_592_000 // 30 days
}

fn default_local_capacity() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            task_ttl_secs: default_task_ttl_secs(),
            translation_ttl_secs: default_translation_ttl_secs(),
            translation_reuse: default_translation_reuse(),
            user_task_limit: default_user_task_limit(),
            user_task_ttl_secs: default_user_task_ttl_secs(),
            local_capacity: default_local_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn translation_ttl(&self) -> Duration {
        Duration::from_secs(self.translation_ttl_secs)
    }

    pub fn user_task_ttl(&self) -> Duration {
        Duration::from_secs(self.user_task_ttl_secs)
    }
}

/// Lifecycle of a request record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Done,
    Failed,
}

impl TaskStatus {
    /// Records only move forward: nothing returns to pending and done is final
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, _) => true,
            (TaskStatus::Failed, TaskStatus::Failed | TaskStatus::Done) => true,
            (TaskStatus::Done, TaskStatus::Done) => true,
            _ => false,
        }
    }

    /// Stored form of the status
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Stored outcome of one request.
///
/// Field names on the wire are shared with the worker processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    #[serde(rename = "taskId")]
    pub request_id: String,
    #[serde(rename = "userId")]
    pub client_id: String,
    #[serde(rename = "sourceText", default)]
    pub source_text: String,
    #[serde(rename = "resultText", default)]
    pub result_text: String,
    pub status: TaskStatus,
    #[serde(rename = "createdAt", default)]
    pub created_at: i64,
    #[serde(default)]
    pub lang_from: String,
    #[serde(default)]
    pub lang_to: String,
}

impl RequestRecord {
    /// A freshly published request
    pub fn pending(
        request_id: impl Into<String>,
        client_id: impl Into<String>,
        source_text: impl Into<String>,
        lang_from: impl Into<String>,
        lang_to: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            client_id: client_id.into(),
            source_text: source_text.into(),
            result_text: String::new(),
            status: TaskStatus::Pending,
            created_at: unix_now(),
            lang_from: lang_from.into(),
            lang_to: lang_to.into(),
        }
    }

    /// Mark as completed with the worker's result
    pub fn complete(mut self, result_text: impl Into<String>) -> Self {
        self.result_text = result_text.into();
        self.status = TaskStatus::Done;
        self
    }

    /// Mark as failed
    pub fn fail(mut self) -> Self {
        self.status = TaskStatus::Failed;
        self
    }

    pub fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Key of a request record
pub fn task_key(request_id: &str) -> String {
    format!("task:{}", request_id)
}

/// Key of a client's recent task list
pub fn user_tasks_key(client_id: &str) -> String {
    format!("user:{}:tasks", client_id)
}

/// Key of a cached translation
pub fn translation_key(hash: &str) -> String {
    format!("translate:cache:{}", hash)
}

/// Content hash identifying one translation job
pub fn content_hash(lang_from: &str, lang_to: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lang_from.as_bytes());
    hasher.update([0x1f]);
    hasher.update(lang_to.as_bytes());
    hasher.update([0x1f]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Storage for request outcomes
#[async_trait]
pub trait TaskCache: Send + Sync {
    /// Look up a record; expired records are absent
    async fn get_task(&self, request_id: &str) -> Result<Option<RequestRecord>>;

    /// Store a record unconditionally
    async fn save_task(&self, record: &RequestRecord) -> Result<()>;

    /// Prepend a task id to the client's history, keeping the newest entries
    async fn add_user_task(&self, client_id: &str, request_id: &str) -> Result<()>;

    /// Newest-first task ids for a client
    async fn user_tasks(&self, client_id: &str, count: usize) -> Result<Vec<String>>;

    async fn cached_translation(&self, hash: &str) -> Result<Option<String>>;

    async fn save_translation(&self, hash: &str, text: &str) -> Result<()>;

    /// Store `record` unless the current record's status forbids the move.
    /// The status check and the write are one atomic step on the backend.
    /// Returns whether the record was written.
    async fn advance_task(&self, record: &RequestRecord) -> Result<bool>;
}
