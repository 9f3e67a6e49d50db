//! In-memory broker: a partitioned log with manual-commit consumer groups.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use outbox_core::broker::{
    BrokerError, EventProducer, InboundMessage, MessageSource, message_headers,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// A message stored in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Topic.
    pub topic: String,
    /// Partition the key hashed to.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Partition key.
    pub key: Option<String>,
    /// Parsed body (`Null` if the body is not JSON).
    pub payload: serde_json::Value,
    /// Transport headers.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    key: Option<String>,
    body: Option<Vec<u8>>,
    headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
enum FailureMode {
    Times(usize),
    Always,
}

#[derive(Debug)]
struct BrokerState {
    partitions: i32,
    logs: HashMap<String, Vec<Vec<StoredMessage>>>,
    publish_failures: HashMap<String, FailureMode>,
    publish_attempts: HashMap<String, usize>,
    commit_failures: usize,
    committed: HashMap<(String, String, i32), i64>,
    commit_log: Vec<(String, i32, i64)>,
    subscribed: bool,
    latency: Duration,
}

impl BrokerState {
    fn partition_for(&self, key: Option<&str>) -> i32 {
        let Some(key) = key else {
            return 0;
        };
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let bucket = hasher.finish() % u64::from(self.partitions.unsigned_abs().max(1));
        i32::try_from(bucket).unwrap_or(0)
    }

    fn append(&mut self, topic: &str, message: StoredMessage) -> (i32, i64) {
        let partition = self.partition_for(message.key.as_deref());
        let partitions = self.partitions.max(1) as usize;
        let log = self
            .logs
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
        let slot = &mut log[partition as usize];
        slot.push(message);
        (partition, slot.len() as i64 - 1)
    }

    fn should_fail(&mut self, topic: &str) -> bool {
        match self.publish_failures.get_mut(topic) {
            Some(FailureMode::Always) => true,
            Some(FailureMode::Times(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                true
            },
            _ => false,
        }
    }
}

/// Partitioned in-memory broker.
///
/// Implements [`EventProducer`] and hands out a single [`InMemorySource`]
/// subscription at a time. Keys hash to a fixed number of partitions, so
/// messages sharing a key keep their publish order.
///
/// # Example
///
/// ```
/// use outbox_testing::InMemoryBroker;
/// use outbox_core::broker::EventProducer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.fail_publishes("order.created", 1);
///
/// let payload = serde_json::json!({ "eventId": "e-1" });
/// assert!(broker.publish("order.created", &payload, Some("order-1")).await.is_err());
/// broker.publish("order.created", &payload, Some("order-1")).await?;
/// assert_eq!(broker.messages("order.created").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_partitions(3)
    }
}

impl InMemoryBroker {
    /// Broker with 3 partitions per topic.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker with `partitions` partitions per topic.
    #[must_use]
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                partitions: partitions.max(1),
                logs: HashMap::new(),
                publish_failures: HashMap::new(),
                publish_attempts: HashMap::new(),
                commit_failures: 0,
                committed: HashMap::new(),
                commit_log: Vec::new(),
                subscribed: false,
                latency: Duration::ZERO,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Delay every publish, so concurrent publishers interleave.
    pub fn set_publish_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Fail the next `times` publishes to `topic`.
    pub fn fail_publishes(&self, topic: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .publish_failures
            .insert(topic.to_string(), FailureMode::Times(times));
    }

    /// Fail every publish to `topic` until [`restore`](Self::restore) is called.
    pub fn fail_all_publishes(&self, topic: &str) {
        self.state
            .lock()
            .unwrap()
            .publish_failures
            .insert(topic.to_string(), FailureMode::Always);
    }

    /// Stop failing publishes to `topic`.
    pub fn restore(&self, topic: &str) {
        self.state.lock().unwrap().publish_failures.remove(topic);
    }

    /// Fail the next `times` offset commits.
    pub fn fail_commits(&self, times: usize) {
        self.state.lock().unwrap().commit_failures = times;
    }

    /// Publish attempts to `topic`, failed ones included.
    #[must_use]
    pub fn publish_attempts(&self, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .publish_attempts
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Append a message with an arbitrary (possibly invalid) body.
    pub fn inject_raw(&self, topic: &str, key: Option<&str>, body: Option<Vec<u8>>) -> (i32, i64) {
        let position = self.state.lock().unwrap().append(
            topic,
            StoredMessage {
                key: key.map(str::to_string),
                body,
                headers: Vec::new(),
            },
        );
        self.notify.notify_waiters();
        position
    }

    /// Every message of `topic`, partition by partition, in offset order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<PublishedMessage> {
        let state = self.state.lock().unwrap();
        let Some(log) = state.logs.get(topic) else {
            return Vec::new();
        };
        log.iter()
            .enumerate()
            .flat_map(|(partition, messages)| {
                messages.iter().enumerate().map(move |(offset, stored)| PublishedMessage {
                    topic: topic.to_string(),
                    partition: partition as i32,
                    offset: offset as i64,
                    key: stored.key.clone(),
                    payload: stored
                        .body
                        .as_deref()
                        .and_then(|body| serde_json::from_slice(body).ok())
                        .unwrap_or(serde_json::Value::Null),
                    headers: stored.headers.clone(),
                })
            })
            .collect()
    }

    /// Messages of `topic` published with `key`, in publish order.
    #[must_use]
    pub fn messages_for_key(&self, topic: &str, key: &str) -> Vec<PublishedMessage> {
        self.messages(topic)
            .into_iter()
            .filter(|m| m.key.as_deref() == Some(key))
            .collect()
    }

    /// Topics that received at least one message.
    #[must_use]
    pub fn topics(&self) -> HashSet<String> {
        self.state.lock().unwrap().logs.keys().cloned().collect()
    }

    /// Committed offset (next offset to read) of a group on a partition.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Every successful commit as `(topic, partition, committed offset)`.
    #[must_use]
    pub fn commit_log(&self) -> Vec<(String, i32, i64)> {
        self.state.lock().unwrap().commit_log.clone()
    }

    /// Open the only subscription of this broker.
    ///
    /// The source starts at the group's committed offsets (or the beginning of
    /// each partition) and ends once it caught up, unless
    /// [`InMemorySource::follow`] is used.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if a subscription is already open.
    pub fn subscribe(&self, topic: &str, group: &str) -> Result<InMemorySource, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.subscribed {
            return Err(BrokerError::SubscriptionFailed {
                topic: topic.to_string(),
                reason: "only one consumer per process is supported".to_string(),
            });
        }
        state.subscribed = true;

        let positions = (0..state.partitions)
            .map(|partition| {
                state
                    .committed
                    .get(&(group.to_string(), topic.to_string(), partition))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();

        Ok(InMemorySource {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            positions,
            follow: false,
            closed: false,
        })
    }
}

impl EventProducer for InMemoryBroker {
    fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        key: Option<&str>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let topic = topic.to_string();
        let key = key.map(str::to_string);
        let body = serde_json::to_vec(payload);
        let headers = message_headers(payload)
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        Box::pin(async move {
            let latency = self.state.lock().unwrap().latency;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let body = body.map_err(|e| BrokerError::SerializationFailed(e.to_string()))?;
            {
                let mut state = self.state.lock().unwrap();
                *state.publish_attempts.entry(topic.clone()).or_default() += 1;
                if state.should_fail(&topic) {
                    return Err(BrokerError::PublishFailed {
                        topic,
                        reason: "broker unreachable".to_string(),
                    });
                }
                state.append(
                    &topic,
                    StoredMessage {
                        key,
                        body: Some(body),
                        headers,
                    },
                );
            }
            self.notify.notify_waiters();
            Ok(())
        })
    }
}

/// The single subscription of an [`InMemoryBroker`].
///
/// Dropping or closing it releases the subscription; a new one resumes from the
/// committed offsets, which is how tests observe redelivery.
#[derive(Debug)]
pub struct InMemorySource {
    broker: InMemoryBroker,
    topic: String,
    group: String,
    positions: Vec<i64>,
    follow: bool,
    closed: bool,
}

impl InMemorySource {
    /// Wait for new messages instead of ending once caught up.
    #[must_use]
    pub const fn follow(mut self) -> Self {
        self.follow = true;
        self
    }

    fn poll_next(&mut self) -> Option<InboundMessage> {
        let state = self.broker.state.lock().unwrap();
        let log = state.logs.get(&self.topic)?;
        for (partition, messages) in log.iter().enumerate() {
            let position = self.positions[partition];
            if let Some(stored) = messages.get(position as usize) {
                self.positions[partition] = position + 1;
                return Some(InboundMessage {
                    topic: self.topic.clone(),
                    partition: partition as i32,
                    offset: position,
                    key: stored.key.clone(),
                    payload: stored.body.clone(),
                });
            }
        }
        None
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.broker.state.lock().unwrap().subscribed = false;
        }
    }
}

impl Drop for InMemorySource {
    fn drop(&mut self) {
        self.release();
    }
}

impl MessageSource for InMemorySource {
    fn next_message(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<InboundMessage, BrokerError>>> + Send + '_>>
    {
        Box::pin(async move {
            let notify = Arc::clone(&self.broker.notify);
            loop {
                let notified = notify.notified();
                if self.closed {
                    return None;
                }
                if let Some(message) = self.poll_next() {
                    return Some(Ok(message));
                }
                if !self.follow {
                    return None;
                }
                notified.await;
            }
        })
    }

    fn commit<'a>(
        &'a mut self,
        message: &'a InboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.broker.state.lock().unwrap();
            if state.commit_failures > 0 {
                state.commit_failures -= 1;
                return Err(BrokerError::CommitFailed {
                    topic: message.topic.clone(),
                    partition: message.partition,
                    offset: message.offset,
                    reason: "coordinator not available".to_string(),
                });
            }
            let next = message.next_offset();
            state.committed.insert(
                (self.group.clone(), message.topic.clone(), message.partition),
                next,
            );
            state
                .commit_log
                .push((message.topic.clone(), message.partition, next));
            Ok(())
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        Box::pin(async move {
            self.release();
            Ok(())
        })
    }
}
