use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

/// How often an empty queue is re-checked during a long poll.
const POLL_STEP: Duration = Duration::from_millis(250);

/// Atomically returns expired leases to the queue, then pops and leases one body.
///
/// KEYS: pending list, lease hash, deadline zset.
/// ARGV: now (ms), lease deadline (ms), token.
const LEASE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, token in ipairs(expired) do
  local body = redis.call('HGET', KEYS[2], token)
  if body then
    redis.call('RPUSH', KEYS[1], body)
  end
  redis.call('HDEL', KEYS[2], token)
  redis.call('ZREM', KEYS[3], token)
end
local body = redis.call('RPOP', KEYS[1])
if not body then
  return false
end
redis.call('HSET', KEYS[2], ARGV[3], body)
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
return body
"#;

/// Opaque receipt for a leased message, consumed by [`MessageQueue::delete`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckToken(String);

impl AckToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A leased message. Invisible to other consumers until deleted or the lease expires.
#[derive(Debug)]
pub struct QueueMessage {
    pub body: String,
    pub ack_token: AckToken,
}

/// At-least-once queue with visibility-timeout leases.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Wait up to `wait` for one message.
    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError>;

    /// Acknowledge a message so it is never redelivered.
    async fn delete(&self, token: AckToken) -> Result<(), QueueError>;

    /// Check backend connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed job queue with lease-based redelivery.
pub struct RedisQueue {
    client: redis::Client,
    pending_key: String,
    leases_key: String,
    deadlines_key: String,
    visibility_timeout: Duration,
    lease_script: redis::Script,
}

impl RedisQueue {
    pub fn new(
        redis_url: &str,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            pending_key: queue_name.to_string(),
            leases_key: format!("{queue_name}:leases"),
            deadlines_key: format!("{queue_name}:deadlines"),
            visibility_timeout,
            lease_script: redis::Script::new(LEASE_SCRIPT),
        })
    }

    /// Push a raw message body, as a producer would.
    pub async fn enqueue(&self, body: &str) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        conn.lpush::<_, _, ()>(&self.pending_key, body)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Number of messages waiting to be received.
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(&self.pending_key).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    /// Number of messages currently leased to some consumer.
    pub async fn in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let leased: u64 = conn.zcard(&self.deadlines_key).await.map_err(QueueError::Redis)?;
        Ok(leased)
    }

    async fn try_lease(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let deadline_ms = now_ms + self.visibility_timeout.as_millis() as i64;
        let token = Uuid::new_v4().to_string();

        let body: Option<String> = self
            .lease_script
            .key(&self.pending_key)
            .key(&self.leases_key)
            .key(&self.deadlines_key)
            .arg(now_ms)
            .arg(deadline_ms)
            .arg(&token)
            .invoke_async(conn)
            .await
            .map_err(QueueError::Redis)?;

        Ok(body.map(|body| QueueMessage {
            body,
            ack_token: AckToken::new(token),
        }))
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn receive(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let deadline = Instant::now() + wait;

        loop {
            if let Some(message) = self.try_lease(&mut conn).await? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_STEP.min(deadline - now)).await;
        }
    }

    async fn delete(&self, token: AckToken) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        redis::pipe()
            .atomic()
            .hdel(&self.leases_key, token.as_str())
            .ignore()
            .zrem(&self.deadlines_key, token.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let reply = redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        check_ping_reply(&reply)
    }
}

fn check_ping_reply(reply: &str) -> Result<(), QueueError> {
    if reply == "PONG" {
        Ok(())
    } else {
        Err(QueueError::Unavailable(format!("unexpected PING reply {reply:?}")))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}
