// Typed frame model for the tern broker protocol (AMQP 0-8/0-9 style).
//
// The byte-level codec lives with the transport; this crate pins the typed
// contract between the session runtime and the protocol handler: method
// frames, their reply classes, content headers and bodies.
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

pub type ChannelId = u16;

/// Reply code sent on a clean channel close.
pub const REPLY_SUCCESS: u16 = 200;
/// Reply code on a bounced mandatory publish with no matching queue.
pub const REPLY_NO_ROUTE: u16 = 312;
/// Reply code on a bounced immediate publish with no ready consumer.
pub const REPLY_NO_CONSUMERS: u16 = 313;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("expected {expected:?} reply, got {got:?}")]
    UnexpectedMethod { expected: MethodKind, got: MethodKind },
    #[error("content frame on channel {0} without a pending method")]
    StrayContent(ChannelId),
    #[error("content body overruns declared size ({declared} declared, {seen} seen)")]
    BodyOverrun { declared: u64, seen: u64 },
}

/// Value stored in a method argument table.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// Argument table carried by declare/bind/consume methods.
///
/// ```
/// use tern_wire::{FieldTable, FieldValue};
///
/// let mut table = FieldTable::new();
/// table.insert("x-selector", FieldValue::Str("colour = 'red'".into()));
/// assert!(table.get("x-selector").is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldTable(BTreeMap<String, FieldValue>);

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Merge another table into this one, later keys winning.
    pub fn extend(&mut self, other: &FieldTable) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }
}

/// Exchange routing discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method frames the session runtime issues or awaits.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ExchangeDeclare {
        exchange: String,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        nowait: bool,
    },
    ExchangeDeclareOk,
    ExchangeBound {
        exchange: String,
        queue: String,
        routing_key: Option<String>,
    },
    ExchangeBoundOk {
        reply_code: u16,
        reply_text: String,
    },
    QueueDeclare {
        queue: String,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        nowait: bool,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
        nowait: bool,
    },
    QueueBindOk,
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
        nowait: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },
    BasicConsume {
        queue: String,
        consumer_tag: u64,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        nowait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: u64,
    },
    BasicCancel {
        consumer_tag: u64,
        nowait: bool,
    },
    BasicCancelOk {
        consumer_tag: u64,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,
    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
    },
    ChannelCloseOk,
}

/// Discriminant of a [`Method`], used to name an expected reply class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    ExchangeDeclare,
    ExchangeDeclareOk,
    ExchangeBound,
    ExchangeBoundOk,
    QueueDeclare,
    QueueDeclareOk,
    QueueBind,
    QueueBindOk,
    QueueDelete,
    QueueDeleteOk,
    BasicConsume,
    BasicConsumeOk,
    BasicCancel,
    BasicCancelOk,
    BasicPublish,
    BasicAck,
    BasicReject,
    BasicRecover,
    BasicRecoverOk,
    TxSelect,
    TxSelectOk,
    TxCommit,
    TxCommitOk,
    TxRollback,
    TxRollbackOk,
    ChannelFlow,
    ChannelFlowOk,
    ChannelClose,
    ChannelCloseOk,
}

impl Method {
    pub fn kind(&self) -> MethodKind {
        match self {
            Method::ExchangeDeclare { .. } => MethodKind::ExchangeDeclare,
            Method::ExchangeDeclareOk => MethodKind::ExchangeDeclareOk,
            Method::ExchangeBound { .. } => MethodKind::ExchangeBound,
            Method::ExchangeBoundOk { .. } => MethodKind::ExchangeBoundOk,
            Method::QueueDeclare { .. } => MethodKind::QueueDeclare,
            Method::QueueDeclareOk { .. } => MethodKind::QueueDeclareOk,
            Method::QueueBind { .. } => MethodKind::QueueBind,
            Method::QueueBindOk => MethodKind::QueueBindOk,
            Method::QueueDelete { .. } => MethodKind::QueueDelete,
            Method::QueueDeleteOk { .. } => MethodKind::QueueDeleteOk,
            Method::BasicConsume { .. } => MethodKind::BasicConsume,
            Method::BasicConsumeOk { .. } => MethodKind::BasicConsumeOk,
            Method::BasicCancel { .. } => MethodKind::BasicCancel,
            Method::BasicCancelOk { .. } => MethodKind::BasicCancelOk,
            Method::BasicPublish { .. } => MethodKind::BasicPublish,
            Method::BasicAck { .. } => MethodKind::BasicAck,
            Method::BasicReject { .. } => MethodKind::BasicReject,
            Method::BasicRecover { .. } => MethodKind::BasicRecover,
            Method::BasicRecoverOk => MethodKind::BasicRecoverOk,
            Method::TxSelect => MethodKind::TxSelect,
            Method::TxSelectOk => MethodKind::TxSelectOk,
            Method::TxCommit => MethodKind::TxCommit,
            Method::TxCommitOk => MethodKind::TxCommitOk,
            Method::TxRollback => MethodKind::TxRollback,
            Method::TxRollbackOk => MethodKind::TxRollbackOk,
            Method::ChannelFlow { .. } => MethodKind::ChannelFlow,
            Method::ChannelFlowOk { .. } => MethodKind::ChannelFlowOk,
            Method::ChannelClose { .. } => MethodKind::ChannelClose,
            Method::ChannelCloseOk => MethodKind::ChannelCloseOk,
        }
    }

    /// Reply class a request method awaits, if it is a round-trip at all.
    pub fn reply_kind(&self) -> Option<MethodKind> {
        match self.kind() {
            MethodKind::ExchangeDeclare => Some(MethodKind::ExchangeDeclareOk),
            MethodKind::ExchangeBound => Some(MethodKind::ExchangeBoundOk),
            MethodKind::QueueDeclare => Some(MethodKind::QueueDeclareOk),
            MethodKind::QueueBind => Some(MethodKind::QueueBindOk),
            MethodKind::QueueDelete => Some(MethodKind::QueueDeleteOk),
            MethodKind::BasicConsume => Some(MethodKind::BasicConsumeOk),
            MethodKind::BasicCancel => Some(MethodKind::BasicCancelOk),
            MethodKind::BasicRecover => Some(MethodKind::BasicRecoverOk),
            MethodKind::TxSelect => Some(MethodKind::TxSelectOk),
            MethodKind::TxCommit => Some(MethodKind::TxCommitOk),
            MethodKind::TxRollback => Some(MethodKind::TxRollbackOk),
            MethodKind::ChannelFlow => Some(MethodKind::ChannelFlowOk),
            MethodKind::ChannelClose => Some(MethodKind::ChannelCloseOk),
            _ => None,
        }
    }

    /// Narrow a reply to the expected class.
    pub fn expect_kind(self, expected: MethodKind) -> Result<Method> {
        if self.kind() == expected {
            Ok(self)
        } else {
            Err(Error::UnexpectedMethod {
                expected,
                got: self.kind(),
            })
        }
    }
}

/// Application-assigned message properties carried in the content header.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub headers: FieldTable,
}

/// Content header frame preceding the body frames of a publish or delivery.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentHeader {
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub fn for_payload(payload: &Bytes, properties: BasicProperties) -> Self {
        Self {
            body_size: payload.len() as u64,
            properties,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Method(Method),
    ContentHeader(ContentHeader),
    ContentBody(Bytes),
}

/// One frame on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: ChannelId,
    pub body: FrameBody,
}

impl Frame {
    pub fn method(channel: ChannelId, method: Method) -> Self {
        Self {
            channel,
            body: FrameBody::Method(method),
        }
    }

    pub fn content_header(channel: ChannelId, header: ContentHeader) -> Self {
        Self {
            channel,
            body: FrameBody::ContentHeader(header),
        }
    }

    pub fn content_body(channel: ChannelId, body: Bytes) -> Self {
        Self {
            channel,
            body: FrameBody::ContentBody(body),
        }
    }

    /// The method carried by this frame, if it is a method frame.
    pub fn as_method(&self) -> Option<&Method> {
        match &self.body {
            FrameBody::Method(method) => Some(method),
            _ => None,
        }
    }
}
