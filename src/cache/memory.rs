use super::{CacheConfig, RequestRecord, TaskCache};
use crate::error::Result;
use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use std::future::ready;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

type TaskList = Arc<Mutex<VecDeque<String>>>;

/// In-process result cache used when no shared store is configured
pub struct MemoryTaskCache {
    tasks: Cache<String, RequestRecord>,
    user_tasks: Cache<String, TaskList>,
    translations: Cache<String, String>,
    user_task_limit: usize,
}

impl MemoryTaskCache {
    pub fn new(config: &CacheConfig) -> Self {
        let tasks = Cache::builder()
            .max_capacity(config.local_capacity)
            .time_to_live(config.task_ttl())
            .build();
        let user_tasks = Cache::builder()
            .max_capacity(config.local_capacity)
            .time_to_live(config.user_task_ttl())
            .build();
        let translations = Cache::builder()
            .max_capacity(config.local_capacity)
            .time_to_live(config.translation_ttl())
            .build();

        info!(
            capacity = config.local_capacity,
            task_ttl_secs = config.task_ttl_secs,
            "Initialized in-process task cache"
        );

        Self {
            tasks,
            user_tasks,
            translations,
            user_task_limit: config.user_task_limit,
        }
    }
}

#[async_trait]
impl TaskCache for MemoryTaskCache {
    async fn get_task(&self, request_id: &str) -> Result<Option<RequestRecord>> {
        Ok(self.tasks.get(request_id).await)
    }

    async fn save_task(&self, record: &RequestRecord) -> Result<()> {
        self.tasks
            .insert(record.request_id.clone(), record.clone())
            .await;
        debug!(request_id = %record.request_id, status = ?record.status, "Saved task record");
        Ok(())
    }

    async fn advance_task(&self, record: &RequestRecord) -> Result<bool> {
        let next = record.clone();
        // compute runs under the entry's lock, so no writer slips in between
        let outcome = self
            .tasks
            .entry(record.request_id.clone())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if !entry.value().status.can_transition_to(next.status) => Op::Nop,
                    _ => Op::Put(next),
                };
                ready(op)
            })
            .await;

        let written = matches!(outcome, CompResult::Inserted(_) | CompResult::ReplacedWith(_));
        if written {
            debug!(request_id = %record.request_id, status = ?record.status, "Advanced task record");
        }
        Ok(written)
    }

    async fn add_user_task(&self, client_id: &str, request_id: &str) -> Result<()> {
        let list = self
            .user_tasks
            .get_with(client_id.to_string(), async {
                Arc::new(Mutex::new(VecDeque::new()))
            })
            .await;
        {
            let mut ids = list.lock().unwrap_or_else(PoisonError::into_inner);
            ids.push_front(request_id.to_string());
            ids.truncate(self.user_task_limit);
        }
        // re-insert so the list's lifetime restarts on every write
        self.user_tasks.insert(client_id.to_string(), list).await;
        Ok(())
    }

    async fn user_tasks(&self, client_id: &str, count: usize) -> Result<Vec<String>> {
        Ok(match self.user_tasks.get(client_id).await {
            Some(list) => list
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .take(count)
                .cloned()
                .collect(),
            None => Vec::new(),
        })
    }

    async fn cached_translation(&self, hash: &str) -> Result<Option<String>> {
        Ok(self.translations.get(hash).await)
    }

    async fn save_translation(&self, hash: &str, text: &str) -> Result<()> {
        self.translations
            .insert(hash.to_string(), text.to_string())
            .await;
        Ok(())
    }
}
