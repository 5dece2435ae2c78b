// Destination model: queues, topics, durable and temporary flavours.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tern_wire::{ChannelId, ExchangeType};

/// Exchange queue destinations route through by default.
pub const DEFAULT_QUEUE_EXCHANGE: &str = "amq.direct";

/// Exchange topic destinations route through by default.
pub const DEFAULT_TOPIC_EXCHANGE: &str = "amq.topic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

#[derive(Debug)]
struct TemporaryState {
    owner_channel: ChannelId,
    deleted: AtomicBool,
}

#[derive(Debug)]
struct DestinationInner {
    name: String,
    kind: DestinationKind,
    exchange: String,
    exchange_type: ExchangeType,
    routing_key: String,
    // Generated names are refreshed on every declare so fail-over rebuilds
    // them; configured names are never touched.
    queue_name: StdMutex<Option<String>>,
    name_required: bool,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    temporary: Option<TemporaryState>,
}

/// A place messages are produced to or consumed from.
///
/// ```
/// use tern_session::Destination;
///
/// let queue = Destination::queue("orders");
/// assert_eq!(queue.routing_key(), "orders");
/// assert_eq!(queue.queue_name().as_deref(), Some("orders"));
/// ```
#[derive(Debug, Clone)]
pub struct Destination {
    inner: Arc<DestinationInner>,
}

impl Destination {
    /// A named queue on the default queue exchange. The client names the
    /// queue, so the name survives fail-over.
    pub fn queue(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(DestinationInner {
                kind: DestinationKind::Queue,
                exchange: DEFAULT_QUEUE_EXCHANGE.to_string(),
                exchange_type: ExchangeType::Direct,
                routing_key: name.clone(),
                queue_name: StdMutex::new(Some(name.clone())),
                name_required: false,
                durable: false,
                exclusive: false,
                auto_delete: false,
                temporary: None,
                name,
            }),
        }
    }

    /// A topic on the default topic exchange. Each subscriber gets its own
    /// generated, exclusive, auto-deleted queue.
    pub fn topic(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(DestinationInner {
                kind: DestinationKind::Topic,
                exchange: DEFAULT_TOPIC_EXCHANGE.to_string(),
                exchange_type: ExchangeType::Topic,
                routing_key: name.clone(),
                queue_name: StdMutex::new(None),
                name_required: true,
                durable: false,
                exclusive: true,
                auto_delete: true,
                temporary: None,
                name,
            }),
        }
    }

    /// The durable rendering of a topic for a named subscription: a durable,
    /// client-named queue that outlives the subscriber.
    pub fn durable_topic(topic: &Destination, client_id: &str, subscription_name: &str) -> Self {
        let queue_name = durable_subscription_queue_name(client_id, subscription_name);
        Self {
            inner: Arc::new(DestinationInner {
                name: topic.name().to_string(),
                kind: DestinationKind::Topic,
                exchange: topic.exchange().to_string(),
                exchange_type: topic.exchange_type(),
                routing_key: topic.routing_key().to_string(),
                queue_name: StdMutex::new(Some(queue_name)),
                name_required: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                temporary: None,
            }),
        }
    }

    /// A temporary queue owned by the creating session; the name is generated
    /// at declare time and regenerated after fail-over.
    pub fn temporary_queue(owner_channel: ChannelId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(DestinationInner {
                kind: DestinationKind::Queue,
                exchange: DEFAULT_QUEUE_EXCHANGE.to_string(),
                exchange_type: ExchangeType::Direct,
                routing_key: name.clone(),
                queue_name: StdMutex::new(None),
                name_required: true,
                durable: false,
                exclusive: true,
                auto_delete: true,
                temporary: Some(TemporaryState {
                    owner_channel,
                    deleted: AtomicBool::new(false),
                }),
                name,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.inner.kind
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.inner.exchange_type
    }

    pub fn routing_key(&self) -> &str {
        &self.inner.routing_key
    }

    pub fn queue_name(&self) -> Option<String> {
        self.inner.queue_name.lock().expect("queue name lock").clone()
    }

    /// Whether the queue name is generated by the client rather than
    /// configured. Generated names are refreshed on every declare.
    pub fn is_name_required(&self) -> bool {
        self.inner.name_required
    }

    pub(crate) fn set_queue_name(&self, name: String) {
        *self.inner.queue_name.lock().expect("queue name lock") = Some(name);
    }

    pub fn is_durable(&self) -> bool {
        self.inner.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.inner.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.inner.auto_delete
    }

    pub fn is_temporary(&self) -> bool {
        self.inner.temporary.is_some()
    }

    pub fn owner_channel(&self) -> Option<ChannelId> {
        self.inner.temporary.as_ref().map(|t| t.owner_channel)
    }

    pub fn is_deleted(&self) -> bool {
        self.inner
            .temporary
            .as_ref()
            .is_some_and(|t| t.deleted.load(Ordering::Acquire))
    }

    pub fn mark_deleted(&self) {
        if let Some(temporary) = self.inner.temporary.as_ref() {
            temporary.deleted.store(true, Ordering::Release);
        }
    }
}

/// Queue name backing a durable subscription, stable across client restarts.
pub fn durable_subscription_queue_name(client_id: &str, subscription_name: &str) -> String {
    format!("{client_id}:{subscription_name}")
}

impl PartialEq for Destination {
    fn eq(&self, other: &Self) -> bool {
        self.inner.kind == other.inner.kind
            && self.inner.exchange == other.inner.exchange
            && self.inner.routing_key == other.inner.routing_key
            && self.inner.name == other.inner.name
    }
}

impl Eq for Destination {}

impl std::hash::Hash for Destination {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.kind.hash(state);
        self.inner.exchange.hash(state);
        self.inner.routing_key.hash(state);
        self.inner.name.hash(state);
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.inner.exchange, self.inner.routing_key)
    }
}
