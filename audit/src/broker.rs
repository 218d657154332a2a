use std::collections::BTreeMap;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use tokio_util::sync::CancellationToken;

/// One delivered stream entry. `deliveries` is the broker's delivery counter
/// where known: 1 for a fresh read, 0 for a claim (the caller derives the
/// real count from the pending listing it claimed from).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: BTreeMap<String, String>,
    pub deliveries: u64,
}

/// A delivered-but-unacknowledged entry, eligible for idle claim.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub deliveries: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("stream broker error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("stream broker error: {0}")]
    Backend(String),
}

/// Log-stream contract: publish, consumer-group read, pending inspection,
/// idle claim, and acknowledgement. At-least-once throughout.
pub trait StreamBroker {
    async fn publish(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<String, BrokerError>;

    /// Create the consumer group if it doesn't exist. The group starts at
    /// new messages only.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Read up to `count` new messages, blocking up to `block`. Returns an
    /// empty slice on timeout or cancellation.
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError>;

    /// Steal messages idle for at least `min_idle` onto `consumer`,
    /// incrementing their delivery counter.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError>;
}

/// Redis Streams implementation over a shared multiplexed connection.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn))
    }

    pub async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn decode_entry(entry: StreamId, deliveries: u64) -> StreamMessage {
    let fields = entry
        .map
        .into_iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(&value)
                .ok()
                .map(|value| (key, value))
        })
        .collect();
    StreamMessage {
        id: entry.id,
        fields,
        deliveries,
    }
}

impl StreamBroker for RedisBroker {
    async fn publish(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<String, BrokerError> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd_map(stream, "*", fields).await?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<String> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let streams = [stream];
        let ids = [">"];
        let reply: StreamReadReply = tokio::select! {
            _ = cancel.cancelled() => return Ok(Vec::new()),
            reply = conn.xread_options::<_, _, StreamReadReply>(&streams, &ids, &options) => reply?,
        };

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| decode_entry(entry, 1))
            .collect())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", limit).await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| PendingEntry {
                id: entry.id,
                consumer: entry.consumer,
                idle: Duration::from_millis(entry.last_delivered_ms as u64),
                deliveries: entry.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle.as_millis() as usize, ids)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|entry| decode_entry(entry, 0))
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }
}
