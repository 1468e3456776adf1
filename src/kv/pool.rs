use crate::errors::{GatewayError, Result};
use crate::metrics;
use crate::retry::{RetryConfig, RetryStrategy};
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transaction::KvTransaction;

#[derive(Debug, Clone)]
pub struct KvPoolConfig {
    pub url: String,
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub command_timeout: Duration,
    pub idle_timeout: Duration,
    pub health_interval: Duration,
    pub ping_timeout: Duration,
}

impl KvPoolConfig {
    pub fn from_config(cfg: &crate::config::KvConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            min_connections: cfg.min_connections,
            max_connections: cfg.max_connections,
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            connect_attempts: cfg.connect_attempts,
            command_timeout: Duration::from_secs(cfg.command_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
            health_interval: Duration::from_secs(cfg.health_interval_secs),
            ping_timeout: Duration::from_millis(cfg.ping_timeout_ms),
        }
    }
}

pub struct PooledConn {
    conn: MultiplexedConnection,
    last_used: Instant,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub waiters: usize,
}

struct PoolState {
    /// LIFO: the hottest connection is reused first.
    free: Vec<PooledConn>,
    /// FIFO: the oldest caller is served first.
    waiters: VecDeque<oneshot::Sender<PooledConn>>,
    total: usize,
    shutting_down: bool,
}

/// Dynamic `[min, max]` pool of multiplexed Redis connections with a
/// typed command surface. Acquisition pops LIFO with a bounded liveness
/// check; full pools queue callers FIFO behind an acquire timeout.
pub struct RedisPool {
    client: redis::Client,
    cfg: KvPoolConfig,
    state: Mutex<PoolState>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisPool {
    pub async fn connect(cfg: KvPoolConfig) -> Result<Arc<Self>> {
        let client = redis::Client::open(cfg.url.as_str())?;
        let pool = Arc::new(Self {
            client,
            cfg,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                waiters: VecDeque::new(),
                total: 0,
                shutting_down: false,
            }),
            health_task: Mutex::new(None),
        });

        for _ in 0..pool.cfg.min_connections {
            let pc = pool.open_connection().await?;
            let mut state = pool.state.lock().await;
            state.free.push(pc);
            state.total += 1;
        }

        info!(
            "KV pool connected: {} connections (max {})",
            pool.cfg.min_connections, pool.cfg.max_connections
        );

        let weak = Arc::downgrade(&pool);
        let interval = pool.cfg.health_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.health_tick().await;
            }
        });
        *pool.health_task.lock().await = Some(handle);

        Ok(pool)
    }

    /// Run one command on an acquired connection, bounded by the command
    /// timeout, releasing the connection afterwards. Connection-class
    /// failures destroy the connection instead of returning it.
    pub async fn execute<T: redis::FromRedisValue + Send + 'static>(
        &self,
        cmd: redis::Cmd,
    ) -> Result<T> {
        let mut pc = self.acquire().await?;
        let outcome = tokio::time::timeout(self.cfg.command_timeout, async {
            let value: T = cmd.query_async(&mut pc.conn).await?;
            Ok::<T, redis::RedisError>(value)
        })
        .await;

        match outcome {
            Ok(Ok(value)) => {
                self.release(pc).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                if is_connection_fatal(&e) {
                    warn!("KV command failed on a dead connection: {}", e);
                    self.destroy(pc).await;
                } else {
                    self.release(pc).await;
                }
                Err(GatewayError::Kv(e))
            }
            Err(_) => {
                self.destroy(pc).await;
                Err(GatewayError::DependencyUnavailable(
                    "KV command timed out".to_string(),
                ))
            }
        }
    }

    /// Replay a recorded transaction atomically on one connection. The
    /// connection is released even when the replay fails.
    pub async fn commit(&self, tx: KvTransaction) -> Result<()> {
        if tx.is_empty() {
            return Ok(());
        }
        let pipe = tx.into_pipeline();
        let mut pc = self.acquire().await?;
        let outcome = tokio::time::timeout(self.cfg.command_timeout, async {
            let value: redis::Value = pipe.query_async(&mut pc.conn).await?;
            Ok::<redis::Value, redis::RedisError>(value)
        })
        .await;

        match outcome {
            Ok(Ok(_)) => {
                self.release(pc).await;
                Ok(())
            }
            Ok(Err(e)) => {
                if is_connection_fatal(&e) {
                    self.destroy(pc).await;
                } else {
                    self.release(pc).await;
                }
                Err(GatewayError::Kv(e))
            }
            Err(_) => {
                self.destroy(pc).await;
                Err(GatewayError::DependencyUnavailable(
                    "KV transaction timed out".to_string(),
                ))
            }
        }
    }

    pub async fn acquire(&self) -> Result<PooledConn> {
        loop {
            let popped = {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return Err(GatewayError::ShuttingDown);
                }
                state.free.pop()
            };

            if let Some(mut pc) = popped {
                if self
                    .ping_conn(&mut pc.conn, self.cfg.ping_timeout)
                    .await
                    .is_ok()
                {
                    return Ok(pc);
                }
                warn!("Discarding unresponsive KV connection");
                let mut state = self.state.lock().await;
                state.total = state.total.saturating_sub(1);
                continue;
            }

            let should_create = {
                let mut state = self.state.lock().await;
                if state.total < self.cfg.max_connections {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };
            if should_create {
                match self.open_connection().await {
                    Ok(pc) => return Ok(pc),
                    Err(e) => {
                        let mut state = self.state.lock().await;
                        state.total = state.total.saturating_sub(1);
                        return Err(e);
                    }
                }
            }

            // Pool is at max: queue behind whoever releases next.
            let (tx, rx) = oneshot::channel();
            {
                let mut state = self.state.lock().await;
                state.waiters.push_back(tx);
            }
            return match tokio::time::timeout(self.cfg.acquire_timeout, rx).await {
                Ok(Ok(pc)) => Ok(pc),
                Ok(Err(_)) => Err(GatewayError::ShuttingDown),
                Err(_) => Err(GatewayError::PoolTimeout),
            };
        }
    }

    pub async fn release(&self, mut pc: PooledConn) {
        pc.last_used = Instant::now();
        let mut state = self.state.lock().await;
        if state.shutting_down {
            state.total = state.total.saturating_sub(1);
            return;
        }
        // Timed-out waiters have dropped their receiver; skip past them.
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(pc) {
                Ok(()) => return,
                Err(returned) => pc = returned,
            }
        }
        state.free.push(pc);
    }

    /// Drop a dead connection and restore the floor with one fast attempt.
    async fn destroy(&self, pc: PooledConn) {
        drop(pc);
        let below_floor = {
            let mut state = self.state.lock().await;
            state.total = state.total.saturating_sub(1);
            !state.shutting_down && state.total < self.cfg.min_connections
        };
        if below_floor {
            match self.open_connection_once().await {
                Ok(replacement) => {
                    {
                        let mut state = self.state.lock().await;
                        state.total += 1;
                    }
                    self.release(replacement).await;
                }
                Err(e) => warn!("KV pool replacement connect failed: {}", e),
            }
        }
    }

    async fn open_connection_once(&self) -> Result<PooledConn> {
        match tokio::time::timeout(
            self.cfg.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(PooledConn {
                conn,
                last_used: Instant::now(),
            }),
            Ok(Err(e)) => Err(GatewayError::Kv(e)),
            Err(_) => Err(GatewayError::DependencyUnavailable(
                "KV connect timed out".to_string(),
            )),
        }
    }

    async fn open_connection(&self) -> Result<PooledConn> {
        let strategy = RetryStrategy::new(RetryConfig {
            max_retries: self.cfg.connect_attempts.saturating_sub(1),
            ..RetryConfig::default()
        });
        strategy
            .execute_with_retry(
                || self.open_connection_once(),
                is_retryable_connect,
                "kv-connect",
            )
            .await
    }

    async fn ping_conn(
        &self,
        conn: &mut MultiplexedConnection,
        bound: Duration,
    ) -> Result<Duration> {
        let started = Instant::now();
        let outcome = tokio::time::timeout(bound, async {
            let pong: String = redis::cmd("PING").query_async(conn).await?;
            Ok::<String, redis::RedisError>(pong)
        })
        .await;
        match outcome {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(GatewayError::Kv(e)),
            Err(_) => Err(GatewayError::DependencyUnavailable(
                "KV ping timed out".to_string(),
            )),
        }
    }

    /// Round-trip latency against an acquired connection.
    pub async fn ping(&self) -> Result<Duration> {
        let mut pc = self.acquire().await?;
        let result = self.ping_conn(&mut pc.conn, self.cfg.ping_timeout).await;
        match result {
            Ok(latency) => {
                self.release(pc).await;
                Ok(latency)
            }
            Err(e) => {
                self.destroy(pc).await;
                Err(e)
            }
        }
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        PoolStatus {
            total: state.total,
            idle: state.free.len(),
            waiters: state.waiters.len(),
        }
    }

    async fn health_tick(&self) {
        let status = self.status().await;
        debug!(
            total = status.total,
            idle = status.idle,
            waiters = status.waiters,
            "KV pool status"
        );
        metrics::KV_POOL_TOTAL.set(status.total as i64);
        metrics::KV_POOL_IDLE.set(status.idle as i64);

        if status.total == 0 {
            warn!("KV pool has no live connections");
        }

        // Ping one idle connection and report slowness.
        let popped = { self.state.lock().await.free.pop() };
        if let Some(mut pc) = popped {
            match self.ping_conn(&mut pc.conn, self.cfg.ping_timeout).await {
                Ok(latency) => {
                    if latency > Duration::from_millis(100) {
                        warn!("KV ping slow: {:?}", latency);
                    }
                    self.release(pc).await;
                }
                Err(e) => {
                    warn!("KV health ping failed: {}", e);
                    self.destroy(pc).await;
                }
            }
        }

        // Evict connections idle past the deadline while respecting the
        // floor. Oldest connections sit at the bottom of the LIFO stack.
        loop {
            let evicted = {
                let mut state = self.state.lock().await;
                let evictable = state.total > self.cfg.min_connections
                    && state
                        .free
                        .first()
                        .map(|pc| pc.last_used.elapsed() > self.cfg.idle_timeout)
                        .unwrap_or(false);
                if evictable {
                    state.total -= 1;
                    Some(state.free.remove(0))
                } else {
                    None
                }
            };
            match evicted {
                Some(pc) => drop(pc),
                None => break,
            }
        }

        // Top up at most one connection per tick so an outage recovery
        // does not stampede the server.
        let below_floor = {
            let state = self.state.lock().await;
            !state.shutting_down && state.total < self.cfg.min_connections
        };
        if below_floor {
            match self.open_connection_once().await {
                Ok(pc) => {
                    {
                        let mut state = self.state.lock().await;
                        state.total += 1;
                    }
                    self.release(pc).await;
                }
                Err(e) => warn!("KV pool top-up failed: {}", e),
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
        }
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        let drained = state.free.len();
        state.total = state.total.saturating_sub(drained);
        state.free.clear();
        // Pending waiters see their sender dropped and fail with a
        // shutdown error.
        state.waiters.clear();
        info!("KV pool shut down ({} idle connections closed)", drained);
    }
}

fn is_connection_fatal(e: &redis::RedisError) -> bool {
    e.is_connection_dropped()
        || e.is_io_error()
        || e.is_connection_refusal()
        || e.kind() == redis::ErrorKind::ReadOnly
}

fn is_retryable_connect(e: &GatewayError) -> bool {
    match e {
        GatewayError::Kv(err) => {
            err.is_connection_refusal() || err.is_io_error() || err.is_timeout()
        }
        GatewayError::DependencyUnavailable(_) => true,
        _ => false,
    }
}
