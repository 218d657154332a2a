use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use opendx_core::audit::stream_fields;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerError, StreamBroker, StreamMessage};
use crate::config::Config;
use crate::sink::{AuditLogRow, AuditSink};

/// Long-running worker owning one consumer identity in the audit group.
///
/// Each iteration first reclaims messages another consumer left pending for
/// longer than `pending_timeout`, then reads new messages one at a time.
/// A message that fails processing is simply not acked while its delivery
/// count is under budget — the idle claim is what yields the retry. At
/// budget it is dead-lettered and the original acked; if the dead-letter
/// publish itself fails the original stays pending, trading stuck-in-main
/// for never-silently-lost.
pub struct Consumer<B, S> {
    broker: B,
    sink: S,
    config: Config,
}

impl<B, S> Consumer<B, S>
where
    B: StreamBroker,
    S: AuditSink,
{
    pub fn new(broker: B, sink: S, config: Config) -> Self {
        Self {
            broker,
            sink,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumer = %self.config.consumer_name,
            "audit consumer started"
        );

        while !cancel.is_cancelled() {
            if let Err(err) = self.iteration(&cancel).await {
                tracing::warn!(error = %err, "consumer iteration failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }

        tracing::info!(consumer = %self.config.consumer_name, "audit consumer stopped");
    }

    async fn iteration(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        self.recover_stale(cancel).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }

        let messages = self
            .broker
            .read(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer_name,
                1,
                self.config.block_timeout,
                cancel,
            )
            .await?;

        for message in messages {
            self.process(message).await;
        }
        Ok(())
    }

    /// Claim and process messages whose idle time exceeds the pending
    /// timeout. Delivery counts come from the pending listing; the claim
    /// itself counts as one more delivery.
    async fn recover_stale(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        let pending = self
            .broker
            .pending(&self.config.stream, &self.config.group, 100)
            .await?;

        let stale: Vec<_> = pending
            .iter()
            .filter(|entry| entry.idle > self.config.pending_timeout)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        for entry in &stale {
            tracing::debug!(
                message_id = %entry.id,
                last_consumer = %entry.consumer,
                idle_ms = entry.idle.as_millis() as u64,
                deliveries = entry.deliveries,
                "reclaiming stale pending message"
            );
        }

        let ids: Vec<String> = stale.iter().map(|entry| entry.id.clone()).collect();
        let deliveries: HashMap<&str, u64> = stale
            .iter()
            .map(|entry| (entry.id.as_str(), entry.deliveries))
            .collect();

        let claimed = self
            .broker
            .claim(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer_name,
                self.config.pending_timeout,
                &ids,
            )
            .await?;

        for mut message in claimed {
            if cancel.is_cancelled() {
                return Ok(());
            }
            message.deliveries = deliveries.get(message.id.as_str()).copied().unwrap_or(0) + 1;
            self.process(message).await;
        }
        Ok(())
    }

    async fn process(&self, message: StreamMessage) {
        metrics::counter!("audit_messages_consumed_total").increment(1);

        let result = match AuditLogRow::from_stream(&message.fields) {
            Ok(row) => self.sink.record(&row).await.map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };

        match result {
            Ok(()) => self.ack(&message.id).await,
            Err(error) => self.fail(message, error).await,
        }
    }

    async fn ack(&self, id: &str) {
        match self
            .broker
            .ack(&self.config.stream, &self.config.group, id)
            .await
        {
            Ok(()) => {
                metrics::counter!("audit_messages_acked_total").increment(1);
            }
            Err(err) => {
                // At-least-once: the row is persisted and the message will be
                // redelivered, parsed again, and re-acked.
                tracing::warn!(message_id = %id, error = %err, "ack failed");
            }
        }
    }

    async fn fail(&self, message: StreamMessage, error: String) {
        if message.deliveries < self.config.max_retry {
            metrics::counter!("audit_messages_retried_total").increment(1);
            tracing::warn!(
                message_id = %message.id,
                deliveries = message.deliveries,
                error = %error,
                "processing failed, leaving message pending for redelivery"
            );
            return;
        }

        let mut fields = message.fields.clone();
        fields.insert(stream_fields::ERROR.into(), error.clone());
        fields.insert(stream_fields::ORIGINAL_ID.into(), message.id.clone());
        fields.insert(stream_fields::FAILED_AT.into(), Utc::now().to_rfc3339());
        fields.insert(
            stream_fields::RETRY_COUNT.into(),
            message.deliveries.to_string(),
        );

        match self.broker.publish(&self.config.dlq_stream, &fields).await {
            Ok(dlq_id) => {
                metrics::counter!("audit_messages_dead_lettered_total").increment(1);
                tracing::error!(
                    message_id = %message.id,
                    dlq_id = %dlq_id,
                    error = %error,
                    "retry budget exhausted, message dead-lettered"
                );
                self.ack(&message.id).await;
            }
            Err(publish_err) => {
                tracing::error!(
                    message_id = %message.id,
                    error = %publish_err,
                    "DLQ publish failed, leaving original pending"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PendingEntry;
    use crate::sink::SinkError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[derive(Default)]
    struct MemPending {
        consumer: String,
        idle: Duration,
        deliveries: u64,
    }

    #[derive(Default)]
    struct MemBrokerState {
        streams: HashMap<String, Vec<(String, BTreeMap<String, String>)>>,
        cursors: HashMap<(String, String), usize>,
        pending: HashMap<(String, String), HashMap<String, MemPending>>,
        next_id: u64,
        fail_publish_to: Option<String>,
    }

    #[derive(Clone, Default)]
    struct MemBroker {
        state: Arc<Mutex<MemBrokerState>>,
    }

    impl MemBroker {
        fn set_idle(&self, stream: &str, group: &str, id: &str, idle: Duration) {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state
                .pending
                .get_mut(&(stream.to_string(), group.to_string()))
                .and_then(|entries| entries.get_mut(id))
            {
                entry.idle = idle;
            }
        }

        fn fail_publish_to(&self, stream: &str) {
            self.state.lock().unwrap().fail_publish_to = Some(stream.to_string());
        }

        fn allow_publish(&self) {
            self.state.lock().unwrap().fail_publish_to = None;
        }

        fn stream_entries(&self, stream: &str) -> Vec<(String, BTreeMap<String, String>)> {
            self.state
                .lock()
                .unwrap()
                .streams
                .get(stream)
                .cloned()
                .unwrap_or_default()
        }

        fn pending_entries(&self, stream: &str, group: &str) -> Vec<PendingEntry> {
            let state = self.state.lock().unwrap();
            state
                .pending
                .get(&(stream.to_string(), group.to_string()))
                .map(|entries| {
                    entries
                        .iter()
                        .map(|(id, p)| PendingEntry {
                            id: id.clone(),
                            consumer: p.consumer.clone(),
                            idle: p.idle,
                            deliveries: p.deliveries,
                        })
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    impl StreamBroker for MemBroker {
        async fn publish(
            &self,
            stream: &str,
            fields: &BTreeMap<String, String>,
        ) -> Result<String, BrokerError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_publish_to.as_deref() == Some(stream) {
                return Err(BrokerError::Backend("publish refused".into()));
            }
            state.next_id += 1;
            let id = format!("{}-0", state.next_id);
            state
                .streams
                .entry(stream.to_string())
                .or_default()
                .push((id.clone(), fields.clone()));
            Ok(id)
        }

        async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
            let mut state = self.state.lock().unwrap();
            let start = state.streams.get(stream).map(|s| s.len()).unwrap_or(0);
            state
                .cursors
                .entry((stream.to_string(), group.to_string()))
                .or_insert(start);
            state
                .pending
                .entry((stream.to_string(), group.to_string()))
                .or_default();
            Ok(())
        }

        async fn read(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            _block: Duration,
            _cancel: &CancellationToken,
        ) -> Result<Vec<StreamMessage>, BrokerError> {
            let mut state = self.state.lock().unwrap();
            let key = (stream.to_string(), group.to_string());
            let cursor = *state.cursors.get(&key).unwrap_or(&0);
            let entries: Vec<(String, BTreeMap<String, String>)> = state
                .streams
                .get(stream)
                .map(|s| s.iter().skip(cursor).take(count).cloned().collect())
                .unwrap_or_default();

            *state.cursors.entry(key.clone()).or_insert(0) = cursor + entries.len();
            let pending = state.pending.entry(key).or_default();
            for (id, _) in &entries {
                pending.insert(
                    id.clone(),
                    MemPending {
                        consumer: consumer.to_string(),
                        idle: Duration::ZERO,
                        deliveries: 1,
                    },
                );
            }

            Ok(entries
                .into_iter()
                .map(|(id, fields)| StreamMessage {
                    id,
                    fields,
                    deliveries: 1,
                })
                .collect())
        }

        async fn pending(
            &self,
            stream: &str,
            group: &str,
            _limit: usize,
        ) -> Result<Vec<PendingEntry>, BrokerError> {
            Ok(self.pending_entries(stream, group))
        }

        async fn claim(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle: Duration,
            ids: &[String],
        ) -> Result<Vec<StreamMessage>, BrokerError> {
            let mut state = self.state.lock().unwrap();
            let key = (stream.to_string(), group.to_string());
            let mut claimed = Vec::new();
            for id in ids {
                let Some(entry) = state.pending.get_mut(&key).and_then(|p| p.get_mut(id)) else {
                    continue;
                };
                if entry.idle < min_idle {
                    continue;
                }
                entry.consumer = consumer.to_string();
                entry.deliveries += 1;
                entry.idle = Duration::ZERO;
                if let Some(fields) = state
                    .streams
                    .get(stream)
                    .and_then(|s| s.iter().find(|(entry_id, _)| entry_id == id))
                    .map(|(_, fields)| fields.clone())
                {
                    // Delivery count is unknown at claim time, as with XCLAIM.
                    claimed.push(StreamMessage {
                        id: id.clone(),
                        fields,
                        deliveries: 0,
                    });
                }
            }
            Ok(claimed)
        }

        async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BrokerError> {
            let mut state = self.state.lock().unwrap();
            let key = (stream.to_string(), group.to_string());
            if let Some(pending) = state.pending.get_mut(&key) {
                pending.remove(id);
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MemSink {
        rows: Arc<Mutex<Vec<AuditLogRow>>>,
        fail: Arc<AtomicBool>,
    }

    impl MemSink {
        fn rows(&self) -> Vec<AuditLogRow> {
            self.rows.lock().unwrap().clone()
        }

        fn set_failing(&self, failing: bool) {
            self.fail.store(failing, Ordering::SeqCst);
        }
    }

    impl AuditSink for MemSink {
        async fn record(&self, row: &AuditLogRow) -> Result<(), SinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError::new("sink down"));
            }
            self.rows.lock().unwrap().push(row.clone());
            Ok(())
        }
    }

    fn test_config(consumer_name: &str) -> Config {
        Config {
            stream: "audit-events".into(),
            group: "audit-consumers".into(),
            dlq_stream: "audit-events_dlq".into(),
            consumer_name: consumer_name.into(),
            max_retry: 5,
            block_timeout: Duration::ZERO,
            pending_timeout: Duration::from_secs(60),
        }
    }

    fn valid_payload() -> BTreeMap<String, String> {
        [
            ("event_id", Uuid::new_v4().to_string()),
            ("status", "success".to_string()),
            ("consumer_id", "app-1".to_string()),
            ("provider_id", "schema-1".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    fn invalid_payload() -> BTreeMap<String, String> {
        // Missing the required status field.
        [("event_id", Uuid::new_v4().to_string())]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    async fn setup(consumer_name: &str) -> (MemBroker, MemSink, Consumer<MemBroker, MemSink>) {
        let broker = MemBroker::default();
        let sink = MemSink::default();
        let config = test_config(consumer_name);
        broker
            .ensure_group(&config.stream, &config.group)
            .await
            .unwrap();
        let consumer = Consumer::new(broker.clone(), sink.clone(), config);
        (broker, sink, consumer)
    }

    #[tokio::test]
    async fn valid_message_is_persisted_and_acked() {
        let (broker, sink, consumer) = setup("worker-a").await;
        broker
            .publish("audit-events", &valid_payload())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        consumer.iteration(&cancel).await.unwrap();

        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].application_id.as_deref(), Some("app-1"));
        assert!(broker.pending_entries("audit-events", "audit-consumers").is_empty());
    }

    #[tokio::test]
    async fn failed_message_below_budget_stays_pending() {
        let (broker, sink, consumer) = setup("worker-a").await;
        broker
            .publish("audit-events", &invalid_payload())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        consumer.iteration(&cancel).await.unwrap();

        assert!(sink.rows().is_empty());
        let pending = broker.pending_entries("audit-events", "audit-consumers");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].deliveries, 1);
        assert!(broker.stream_entries("audit-events_dlq").is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_and_ack_the_original() {
        let (broker, sink, consumer) = setup("worker-a").await;
        let original_id = broker
            .publish("audit-events", &invalid_payload())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        // First delivery via read, then four redeliveries via idle claim:
        // the fifth delivery hits the budget and dead-letters.
        consumer.iteration(&cancel).await.unwrap();
        for _ in 0..4 {
            broker.set_idle(
                "audit-events",
                "audit-consumers",
                &original_id,
                Duration::from_secs(61),
            );
            consumer.iteration(&cancel).await.unwrap();
        }

        assert!(sink.rows().is_empty());
        assert!(
            broker.pending_entries("audit-events", "audit-consumers").is_empty(),
            "original must be acked after dead-lettering"
        );

        let dlq = broker.stream_entries("audit-events_dlq");
        assert_eq!(dlq.len(), 1);
        let (_, fields) = &dlq[0];
        assert_eq!(fields[stream_fields::ORIGINAL_ID], original_id);
        assert!(!fields[stream_fields::ERROR].is_empty());
        assert_eq!(fields[stream_fields::RETRY_COUNT], "5");
        assert!(fields.contains_key(stream_fields::FAILED_AT));
    }

    #[tokio::test]
    async fn failed_dlq_publish_leaves_the_original_pending() {
        let (broker, _sink, consumer) = setup("worker-a").await;
        let original_id = broker
            .publish("audit-events", &invalid_payload())
            .await
            .unwrap();
        broker.fail_publish_to("audit-events_dlq");

        let cancel = CancellationToken::new();
        consumer.iteration(&cancel).await.unwrap();
        for _ in 0..4 {
            broker.set_idle(
                "audit-events",
                "audit-consumers",
                &original_id,
                Duration::from_secs(61),
            );
            consumer.iteration(&cancel).await.unwrap();
        }

        // Stuck-in-main beats silent loss: not acked, not dead-lettered.
        let pending = broker.pending_entries("audit-events", "audit-consumers");
        assert_eq!(pending.len(), 1);
        assert!(broker.stream_entries("audit-events_dlq").is_empty());

        // Once the DLQ is reachable again the next claim dead-letters it.
        broker.allow_publish();
        broker.set_idle(
            "audit-events",
            "audit-consumers",
            &original_id,
            Duration::from_secs(61),
        );
        consumer.iteration(&cancel).await.unwrap();
        assert_eq!(broker.stream_entries("audit-events_dlq").len(), 1);
        assert!(broker.pending_entries("audit-events", "audit-consumers").is_empty());
    }

    #[tokio::test]
    async fn idle_message_is_claimed_by_another_consumer() {
        let (broker, sink, consumer_a) = setup("worker-a").await;
        let consumer_b = Consumer::new(broker.clone(), sink.clone(), test_config("worker-b"));

        let id = broker
            .publish("audit-events", &invalid_payload())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        consumer_a.iteration(&cancel).await.unwrap();
        let pending = broker.pending_entries("audit-events", "audit-consumers");
        assert_eq!(pending[0].consumer, "worker-a");
        assert_eq!(pending[0].deliveries, 1);

        broker.set_idle("audit-events", "audit-consumers", &id, Duration::from_secs(61));
        consumer_b.iteration(&cancel).await.unwrap();

        let pending = broker.pending_entries("audit-events", "audit-consumers");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "worker-b");
        assert_eq!(pending[0].deliveries, 2, "claim counts as a delivery");
    }

    #[tokio::test]
    async fn message_survives_a_sink_outage() {
        let (broker, sink, consumer) = setup("worker-a").await;
        let id = broker
            .publish("audit-events", &valid_payload())
            .await
            .unwrap();

        sink.set_failing(true);
        let cancel = CancellationToken::new();
        consumer.iteration(&cancel).await.unwrap();
        assert!(sink.rows().is_empty());
        assert_eq!(
            broker.pending_entries("audit-events", "audit-consumers").len(),
            1
        );

        sink.set_failing(false);
        broker.set_idle("audit-events", "audit-consumers", &id, Duration::from_secs(61));
        consumer.iteration(&cancel).await.unwrap();

        assert_eq!(sink.rows().len(), 1);
        assert!(broker.pending_entries("audit-events", "audit-consumers").is_empty());
    }

    #[tokio::test]
    async fn run_exits_on_cancellation() {
        let (_broker, _sink, consumer) = setup("worker-a").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), consumer.run(cancel))
            .await
            .expect("cancelled run must return promptly");
    }
}
