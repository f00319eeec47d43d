//! Redis-backed shared store.
//!
//! One [`RedisStore`] is created per process and cloned into the rate limiter
//! and the result cache. Every call carries the configured deadline so no
//! caller waits on a degraded store for longer than `op_timeout_ms`.

use crate::config::{RedisConfig, StoreMode};
use crate::error::{GatewayError, Result};
use crate::rate_limit::lua_scripts::{WINDOW_COUNTER_SCRIPT, WINDOW_LIMIT_SCRIPT};
use crate::rate_limit::store::CounterStore;
use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::sentinel::{Sentinel, SentinelNodeConnectionInfo};
use redis::{
    Cmd, ConnectionAddr, ConnectionInfo, Pipeline, RedisConnectionInfo, RedisFuture, Script,
    Value,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Connection to either a single primary or a cluster
#[derive(Clone)]
pub enum StoreConnection {
    /// Standalone node, or the primary resolved through sentinel
    Single(ConnectionManager),
    /// Cluster with slot routing
    Cluster(ClusterConnection),
}

impl ConnectionLike for StoreConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            StoreConnection::Single(conn) => conn.req_packed_command(cmd),
            StoreConnection::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            StoreConnection::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            StoreConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            StoreConnection::Single(conn) => conn.get_db(),
            StoreConnection::Cluster(conn) => conn.get_db(),
        }
    }
}

/// Shared store client
#[derive(Clone)]
pub struct RedisStore {
    connection: StoreConnection,
    op_timeout: Duration,
    counter_script: Arc<Script>,
    limit_script: Arc<Script>,
}

fn redis_info(db: i64, password: &Option<String>) -> RedisConnectionInfo {
    RedisConnectionInfo {
        db,
        password: password.clone(),
        ..Default::default()
    }
}

fn node_url(node: &str) -> String {
    if node.starts_with("redis://") || node.starts_with("rediss://") {
        node.to_string()
    } else {
        format!("redis://{}", node)
    }
}

impl RedisStore {
    /// Connect using the configured topology and verify the store answers
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let connection = match config.mode {
            StoreMode::Single => {
                let single = &config.single;
                info!(host = %single.host, port = single.port, db = single.db, "Connecting to Redis");
                let client = redis::Client::open(ConnectionInfo {
                    addr: ConnectionAddr::Tcp(single.host.clone(), single.port),
                    redis: redis_info(single.db, &single.password),
                })?;
                StoreConnection::Single(ConnectionManager::new(client).await?)
            }
            StoreMode::Sentinel => {
                let sentinel_config = &config.sentinel;
                info!(
                    master = %sentinel_config.master_name,
                    nodes = ?sentinel_config.nodes,
                    "Resolving Redis primary through sentinel"
                );
                let mut sentinel = Sentinel::build(
                    sentinel_config
                        .nodes
                        .iter()
                        .map(|node| node_url(node))
                        .collect::<Vec<_>>(),
                )?;
                let node_info = SentinelNodeConnectionInfo {
                    tls_mode: None,
                    redis_connection_info: Some(redis_info(
                        sentinel_config.db,
                        &sentinel_config.password,
                    )),
                };
                let client = sentinel
                    .async_master_for(&sentinel_config.master_name, Some(&node_info))
                    .await?;
                StoreConnection::Single(ConnectionManager::new(client).await?)
            }
            StoreMode::Cluster => {
                let cluster = &config.cluster;
                info!(nodes = ?cluster.nodes, "Connecting to Redis cluster");
                let mut builder =
                    ClusterClientBuilder::new(cluster.nodes.iter().map(|node| node_url(node)));
                if let Some(password) = &cluster.password {
                    builder = builder.password(password.clone());
                }
                let client = builder.build()?;
                StoreConnection::Cluster(client.get_async_connection().await?)
            }
        };

        let store = Self::from_connection(connection, config.op_timeout());
        store.ping().await?;
        info!(mode = ?config.mode, "Redis connection established");
        Ok(store)
    }

    /// Wrap an established connection
    pub fn from_connection(connection: StoreConnection, op_timeout: Duration) -> Self {
        Self {
            connection,
            op_timeout,
            counter_script: Arc::new(Script::new(WINDOW_COUNTER_SCRIPT)),
            limit_script: Arc::new(Script::new(WINDOW_LIMIT_SCRIPT)),
        }
    }

    /// A cheap handle on the shared connection
    pub(crate) fn connection(&self) -> StoreConnection {
        self.connection.clone()
    }

    /// Run one store call under the configured deadline
    pub(crate) async fn with_deadline<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(GatewayError::from),
            Err(_) => Err(GatewayError::Timeout(format!(
                "redis {} exceeded {:?}",
                op, self.op_timeout
            ))),
        }
    }

    /// Test Redis connection
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let reply: String = self
            .with_deadline("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        debug!(reply = %reply, "Redis ping");
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    // PEXPIRE rejects 0
    (duration.as_millis() as u64).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_window(&self, key: &str, window: Duration) -> Result<i64> {
        let mut conn = self.connection();
        let mut invocation = self.counter_script.key(key);
        invocation.arg(millis(window));
        self.with_deadline("INCR", invocation.invoke_async::<_, i64>(&mut conn))
            .await
    }

    async fn incr_within_limit(&self, key: &str, limit: u32, window: Duration) -> Result<bool> {
        let mut conn = self.connection();
        let mut invocation = self.limit_script.key(key);
        invocation.arg(limit).arg(millis(window));
        let allowed: i64 = self
            .with_deadline("EVALSHA", invocation.invoke_async(&mut conn))
            .await?;
        Ok(allowed == 1)
    }

    async fn try_lock(&self, key: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(1).arg("NX").arg("PX").arg(millis(lease));
        let reply: Option<String> = self
            .with_deadline("SET NX", cmd.query_async(&mut conn))
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.with_deadline("DEL", cmd.query_async::<_, ()>(&mut conn))
            .await
    }

    async fn get_count(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        let value: Option<i64> = self
            .with_deadline("GET", cmd.query_async(&mut conn))
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn incr_and_refresh(&self, key: &str, window: Duration) -> Result<i64> {
        let mut conn = self.connection();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(window))
            .ignore();
        let (count,): (i64,) = self
            .with_deadline("INCR+PEXPIRE", pipe.query_async(&mut conn))
            .await?;
        Ok(count)
    }
}
