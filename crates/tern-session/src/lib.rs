// Client-side session runtime for the tern broker protocol.
//
// A session multiplexes one logical channel of work over a shared
// connection: it declares exchanges and queues, binds routing keys, creates
// producers and consumers, dispatches inbound deliveries, issues
// acknowledgements, supports local transactions and recovery, and survives
// connection fail-over by re-declaring, re-binding and re-subscribing.
//
// The transport, codec and broker stay on the far side of the
// [`ProtocolHandler`] trait.

mod bounce;
mod config;
mod connection;
mod consumer;
mod delivery;
mod destination;
mod dispatcher;
mod error;
mod failover;
mod producer;
mod protocol;
mod queue;
mod registry;
mod session;
mod subscriptions;

pub use config::{
    DEFAULT_IMMEDIATE, DEFAULT_MANDATORY, DEFAULT_PREFETCH_HIGH_MARK, DEFAULT_PREFETCH_LOW_MARK,
    SessionSettings,
};
pub use connection::{ConnectionHandle, ErrorCallback};
pub use consumer::{Browser, Consumer, ConsumerOptions, ListenerFuture, MessageListener};
pub use delivery::{
    Bounce, ConsumerTag, Delivery, DeliveredMessage, InboundMessage, ReturnedMessage,
};
pub use destination::{
    DEFAULT_QUEUE_EXCHANGE, DEFAULT_TOPIC_EXCHANGE, Destination, DestinationKind,
    durable_subscription_queue_name,
};
pub use error::{AsyncError, Result, SessionError};
pub use producer::{Producer, ProducerId, ProducerOptions};
pub use protocol::ProtocolHandler;
pub use session::{AckMode, Session};
