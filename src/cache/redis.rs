use super::{task_key, translation_key, user_tasks_key, CacheConfig, RequestRecord, TaskCache};
use crate::error::Result;
use crate::store::RedisStore;
use async_trait::async_trait;
use redis::Script;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lua script for a forward-only record write
///
/// Reads the stored record's status and writes the new record only when the
/// move is allowed: nothing returns to pending and done is final. A stored
/// value that does not decode counts as absent.
///
/// KEYS[1] = the task key
/// ARGV[1] = the new record (JSON)
/// ARGV[2] = the new record's status
/// ARGV[3] = record TTL (seconds)
///
/// Returns: 1 when written, 0 when the stored status forbids the move
pub const ADVANCE_TASK_SCRIPT: &str = r#"
local key = KEYS[1]
local next_status = ARGV[2]

local stored = redis.call('GET', key)
if stored then
    local ok, record = pcall(cjson.decode, stored)
    if ok and type(record) == 'table' then
        local status = record['status']
        if status == 'done' and next_status ~= 'done' then
            return 0
        end
        if status == 'failed' and next_status == 'pending' then
            return 0
        end
    end
end

redis.call('SET', key, ARGV[1], 'EX', tonumber(ARGV[3]))
return 1
"#;

/// Result cache in the shared store
pub struct RedisTaskCache {
    store: RedisStore,
    config: CacheConfig,
    advance_script: Arc<Script>,
}

impl RedisTaskCache {
    pub fn new(store: RedisStore, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            advance_script: Arc::new(Script::new(ADVANCE_TASK_SCRIPT)),
        }
    }
}

#[async_trait]
impl TaskCache for RedisTaskCache {
    async fn get_task(&self, request_id: &str) -> Result<Option<RequestRecord>> {
        let mut conn = self.store.connection();
        let mut cmd = redis::cmd("GET");
        cmd.arg(task_key(request_id));
        let raw: Option<String> = self
            .store
            .with_deadline("GET", cmd.query_async(&mut conn))
            .await?;

        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    // an unreadable record is treated as unseen
                    warn!(request_id, error = %e, "Discarding undecodable task record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn save_task(&self, record: &RequestRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.store.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(task_key(&record.request_id))
            .arg(json)
            .arg("EX")
            .arg(self.config.task_ttl_secs.max(1));
        self.store
            .with_deadline("SET", cmd.query_async::<_, ()>(&mut conn))
            .await?;
        debug!(request_id = %record.request_id, status = ?record.status, "Saved task record");
        Ok(())
    }

    async fn advance_task(&self, record: &RequestRecord) -> Result<bool> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.store.connection();
        let mut invocation = self.advance_script.key(task_key(&record.request_id));
        invocation
            .arg(json)
            .arg(record.status.as_str())
            .arg(self.config.task_ttl_secs.max(1));
        let written: i64 = self
            .store
            .with_deadline("EVALSHA", invocation.invoke_async(&mut conn))
            .await?;

        if written == 1 {
            debug!(request_id = %record.request_id, status = ?record.status, "Advanced task record");
        }
        Ok(written == 1)
    }

    async fn add_user_task(&self, client_id: &str, request_id: &str) -> Result<()> {
        let key = user_tasks_key(client_id);
        let keep = self.config.user_task_limit.max(1) as isize;
        let mut conn = self.store.connection();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(request_id)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(keep - 1)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.user_task_ttl_secs.max(1))
            .ignore();
        self.store
            .with_deadline("LPUSH", pipe.query_async::<_, ()>(&mut conn))
            .await
    }

    async fn user_tasks(&self, client_id: &str, count: usize) -> Result<Vec<String>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.store.connection();
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(user_tasks_key(client_id))
            .arg(0)
            .arg(count as isize - 1);
        self.store
            .with_deadline("LRANGE", cmd.query_async(&mut conn))
            .await
    }

    async fn cached_translation(&self, hash: &str) -> Result<Option<String>> {
        let mut conn = self.store.connection();
        let mut cmd = redis::cmd("GET");
        cmd.arg(translation_key(hash));
        self.store
            .with_deadline("GET", cmd.query_async(&mut conn))
            .await
    }

    async fn save_translation(&self, hash: &str, text: &str) -> Result<()> {
        let mut conn = self.store.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(translation_key(hash))
            .arg(text)
            .arg("EX")
            .arg(self.config.translation_ttl_secs.max(1));
        self.store
            .with_deadline("SET", cmd.query_async::<_, ()>(&mut conn))
            .await
    }
}
