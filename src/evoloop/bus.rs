//! In-process message bus.
//!
//! A small pub/sub broker over per-agent input/output topics. Topics
//! auto-create on first use and are backed by bounded broadcast channels, so
//! ordering holds per topic and a slow consumer skips (and logs) rather
//! than blocking publishers. Consumers are [`MessageHandler`]
//! implementations registered under a consumer id; each subscribed topic is
//! drained by its own task, which keeps handling in arrival order within a
//! topic.
//!
//! Delivery is at-least-once in spirit: a message can reach several
//! consumers of the same topic, and handlers are expected to be idempotent
//! or to deduplicate by message id.
//!
//! # Request/reply
//!
//! [`MessageBus::request_reply`] stamps a correlation id on the request,
//! watches the reply topic for a message echoing that id, and gives up
//! after the timeout — it returns `None` rather than hanging.
//!
//! # Example
//!
//! ```rust,no_run
//! use evoloop::bus::{BusMessage, MessageBus};
//! use std::time::Duration;
//!
//! # async {
//! let bus = MessageBus::new();
//! let request = BusMessage::new("ping").with_agent("orchestrator");
//! let reply = bus
//!     .request_reply("echo-in", "echo-out", request, Duration::from_secs(5))
//!     .await;
//! println!("reply: {:?}", reply);
//! # };
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Per-topic channel capacity. A consumer further behind than this starts
/// losing messages (logged as lag).
const TOPIC_CAPACITY: usize = 1024;

/// The unit of agent I/O traffic on the bus.
///
/// Unlike the durable [`EventEnvelope`](crate::envelope::EventEnvelope),
/// bus messages are free-form: `kind` is an open string (`audit_request`,
/// `ping`, ...) and `payload` carries whatever the conversation needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Unique message id, used for consumer-side deduplication.
    pub id: Uuid,

    /// Message type string; the runtime routes on this.
    pub kind: String,

    /// Emitting agent, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Correlation id echoed between a request and its reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// When the message was created.
    pub timestamp: DateTime<Utc>,

    /// Message body.
    pub payload: serde_json::Value,
}

impl BusMessage {
    /// Create a message of the given kind with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            agent: None,
            correlation_id: None,
            timestamp: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    /// Set the payload (builder pattern).
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the emitting agent (builder pattern).
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// Set the correlation id (builder pattern).
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// The response kind derived from this message: `<kind>_response`.
    pub fn reply_kind(&self) -> String {
        format!("{}_response", self.kind)
    }

    /// Build a reply to this message: response kind, echoed correlation id,
    /// fresh id and timestamp.
    pub fn reply(&self, agent: impl Into<String>, payload: serde_json::Value) -> BusMessage {
        BusMessage {
            id: Uuid::new_v4(),
            kind: self.reply_kind(),
            agent: Some(agent.into()),
            correlation_id: self.correlation_id.clone(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Callback interface for consumers. Implementations must be cheap to
/// clone behind an `Arc` and safe to call from multiple topic tasks.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called once per delivered message, in per-topic arrival order.
    async fn handle(&self, message: BusMessage);
}

/// Bus health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BusHealth {
    pub status: String,
    pub topics: usize,
    pub consumers: usize,
}

impl BusHealth {
    /// Whether the bus is accepting publishes.
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

struct Consumer {
    topics: Vec<String>,
    handler: Arc<dyn MessageHandler>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
}

struct BusInner {
    topics: HashMap<String, broadcast::Sender<BusMessage>>,
    consumers: HashMap<String, Consumer>,
    stopped: bool,
}

/// The in-process broker. Cheap to share via `Arc`; all methods take
/// `&self`.
pub struct MessageBus {
    inner: RwLock<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BusInner {
                topics: HashMap::new(),
                consumers: HashMap::new(),
                stopped: false,
            }),
        }
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, BusInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn topic_sender(inner: &mut BusInner, topic: &str) -> broadcast::Sender<BusMessage> {
        inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Publish a message to a topic, creating the topic on first use.
    ///
    /// Returns `false` only when the bus has been stopped. Publishing to a
    /// topic nobody consumes succeeds (the message is simply dropped).
    pub fn publish_event(&self, topic: &str, message: BusMessage) -> bool {
        let sender = {
            let mut inner = self.write_inner();
            if inner.stopped {
                return false;
            }
            Self::topic_sender(&mut inner, topic)
        };
        if sender.send(message).is_err() {
            log::trace!("no consumers on topic {}", topic);
        }
        true
    }

    /// Create a topic eagerly. Topics auto-create on first publish or
    /// subscribe anyway; this exists for administrative pre-provisioning.
    pub fn ensure_topic(&self, topic: &str) {
        let mut inner = self.write_inner();
        if !inner.stopped {
            Self::topic_sender(&mut inner, topic);
        }
    }

    /// Register a consumer over a set of topics. The consumer does not
    /// receive anything until [`start_consuming`](Self::start_consuming).
    pub fn create_consumer(
        &self,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        consumer_id: impl Into<String>,
    ) -> Result<String, BusError> {
        let consumer_id = consumer_id.into();
        let mut inner = self.write_inner();
        if inner.stopped {
            return Err(BusError::Stopped);
        }
        if inner.consumers.contains_key(&consumer_id) {
            return Err(BusError::DuplicateConsumer(consumer_id));
        }
        inner.consumers.insert(
            consumer_id.clone(),
            Consumer {
                topics,
                handler,
                tasks: Vec::new(),
                running: false,
            },
        );
        Ok(consumer_id)
    }

    /// Start delivering messages to a registered consumer. One task per
    /// subscribed topic; subscription happens here, so messages published
    /// before this call are not replayed.
    pub fn start_consuming(&self, consumer_id: &str) -> Result<(), BusError> {
        let mut inner = self.write_inner();
        if inner.stopped {
            return Err(BusError::Stopped);
        }
        let topics = match inner.consumers.get(consumer_id) {
            Some(consumer) if consumer.running => return Ok(()),
            Some(consumer) => consumer.topics.clone(),
            None => return Err(BusError::UnknownConsumer(consumer_id.to_string())),
        };

        let mut tasks = Vec::with_capacity(topics.len());
        for topic in topics {
            let mut receiver = Self::topic_sender(&mut inner, &topic).subscribe();
            let handler = Arc::clone(&inner.consumers[consumer_id].handler);
            let consumer_label = consumer_id.to_string();
            tasks.push(tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => handler.handle(message).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!(
                                "consumer {} lagged on {}: {} messages skipped",
                                consumer_label,
                                topic,
                                skipped
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        let consumer = inner.consumers.get_mut(consumer_id).expect("checked above");
        consumer.tasks = tasks;
        consumer.running = true;
        Ok(())
    }

    /// Stop delivering to a consumer, cancelling its topic tasks. The
    /// registration survives and can be started again.
    pub fn stop_consuming(&self, consumer_id: &str) -> Result<(), BusError> {
        let mut inner = self.write_inner();
        let consumer = inner
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| BusError::UnknownConsumer(consumer_id.to_string()))?;
        for task in consumer.tasks.drain(..) {
            task.abort();
        }
        consumer.running = false;
        Ok(())
    }

    /// Publish `message` to `request_topic` and wait for the matching reply
    /// on `reply_topic`.
    ///
    /// A correlation id is stamped on the request if absent; the first
    /// message on the reply topic echoing that id wins. Expiry of the
    /// timeout yields `None`, never a hang.
    pub async fn request_reply(
        &self,
        request_topic: &str,
        reply_topic: &str,
        mut message: BusMessage,
        timeout: Duration,
    ) -> Option<BusMessage> {
        let correlation_id = match &message.correlation_id {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                message.correlation_id = Some(id.clone());
                id
            }
        };

        // Subscribe before publishing so the reply cannot race past us.
        let mut receiver = {
            let mut inner = self.write_inner();
            if inner.stopped {
                return None;
            }
            Self::topic_sender(&mut inner, reply_topic).subscribe()
        };

        if !self.publish_event(request_topic, message) {
            return None;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, receiver.recv()).await {
                Ok(Ok(reply)) => {
                    if reply.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                        return Some(reply);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    log::warn!(
                        "request_reply lagged on {}: {} messages skipped",
                        reply_topic,
                        skipped
                    );
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => return None,
            }
        }
    }

    /// Current bus health.
    pub fn health_check(&self) -> BusHealth {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        BusHealth {
            status: if inner.stopped { "stopped" } else { "healthy" }.to_string(),
            topics: inner.topics.len(),
            consumers: inner.consumers.len(),
        }
    }

    /// Stop the bus: cancel every consumer task and refuse further
    /// publishes and registrations.
    pub fn stop(&self) {
        let mut inner = self.write_inner();
        inner.stopped = true;
        for consumer in inner.consumers.values_mut() {
            for task in consumer.tasks.drain(..) {
                task.abort();
            }
            consumer.running = false;
        }
        inner.topics.clear();
    }
}

/// Broker-level failures surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A consumer with this id already exists.
    DuplicateConsumer(String),
    /// No consumer registered under this id.
    UnknownConsumer(String),
    /// The bus has been stopped.
    Stopped,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::DuplicateConsumer(id) => write!(f, "consumer {:?} already exists", id),
            BusError::UnknownConsumer(id) => write!(f, "unknown consumer {:?}", id),
            BusError::Stopped => write!(f, "bus is stopped"),
        }
    }
}

impl Error for BusError {}
