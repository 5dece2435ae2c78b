// Session core: public operations, flow suspension, transactional
// bookkeeping, resubscription on fail-over.
//
// One session multiplexes one logical channel of work over a shared
// connection. Lock order, outermost first: message delivery lock, connection
// fail-over mutex, suspension lock, dispatcher internal lock.
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tern_wire::{
    BasicProperties, ChannelId, ContentHeader, ExchangeType, FieldTable, FieldValue, Frame, Method,
    MethodKind, REPLY_SUCCESS,
};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use crate::bounce;
use crate::config::SessionSettings;
use crate::connection::ConnectionHandle;
use crate::consumer::{Browser, Consumer, ConsumerOptions, MessageListener};
use crate::delivery::{ConsumerTag, Delivery, InboundMessage};
use crate::destination::{Destination, DestinationKind, durable_subscription_queue_name};
use crate::dispatcher::{self, Dispatcher};
use crate::error::{AsyncError, Result, SessionError};
use crate::failover::{noop_protected, retry_protected};
use crate::producer::{Producer, ProducerId, ProducerOptions};
use crate::protocol::ProtocolHandler;
use crate::queue::{InboundQueue, ThresholdListener};
use crate::registry::{ConsumerRegistry, ProducerRegistry};
use crate::subscriptions::SubscriptionCatalog;

/// How deliveries are acknowledged on this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledged by the framework after each successful delivery.
    Auto,
    /// Acknowledged explicitly by the application.
    Client,
    /// Lazily acknowledged; duplicates are possible after a crash.
    DupsOk,
    /// Never acknowledged; the broker forgets on push.
    NoAck,
    /// Acknowledgements accumulate until commit.
    Transacted,
}

pub(crate) struct SessionShared {
    channel_id: ChannelId,
    connection: ConnectionHandle,
    handler: Arc<dyn ProtocolHandler>,
    settings: SessionSettings,
    transacted: bool,
    ack_mode: AckMode,
    prefetch_high: usize,
    prefetch_low: usize,
    queue: Arc<InboundQueue<Delivery>>,
    highest_delivery_tag: AtomicI64,
    dispatcher: StdMutex<Option<Dispatcher>>,
    consumers: ConsumerRegistry,
    producers: ProducerRegistry,
    subscriptions: SubscriptionCatalog,
    next_consumer_tag: AtomicU64,
    next_producer_id: AtomicU64,
    in_recovery: AtomicBool,
    suspended: AtomicBool,
    started_at_least_once: AtomicBool,
    first_dispatcher: AtomicBool,
    has_listeners: AtomicBool,
    closed: AtomicBool,
    suspension_lock: TokioMutex<()>,
    message_delivery_lock: TokioMutex<()>,
    message_listener: StdMutex<Option<MessageListener>>,
    self_ref: Weak<SessionShared>,
}

/// A logical channel of work over a shared connection. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

// Schedules channel.flow round-trips from watermark crossings onto the
// connection work task, preserving suspend/resume ordering.
struct WatermarkSuspender {
    connection: ConnectionHandle,
    session: Weak<SessionShared>,
}

impl WatermarkSuspender {
    fn schedule(&self, suspend: bool) {
        let session = self.session.clone();
        self.connection.enqueue_work(async move {
            let Some(session) = session.upgrade() else {
                return;
            };
            if session.is_closed() {
                return;
            }
            if let Err(err) = session.suspend_channel(suspend).await {
                warn!(%err, suspend, "unable to toggle channel flow");
            }
        });
    }
}

impl ThresholdListener for WatermarkSuspender {
    fn above_threshold(&self, current: usize) {
        debug!(current, "inbound queue above high mark; scheduling channel suspension");
        self.schedule(true);
    }

    fn under_threshold(&self, current: usize) {
        debug!(current, "inbound queue below low mark; scheduling channel resumption");
        self.schedule(false);
    }
}

impl Session {
    /// Open a session on the given channel. Transactional sessions force the
    /// transacted acknowledgement mode and issue `tx.select` immediately.
    pub async fn open(
        connection: &ConnectionHandle,
        handler: Arc<dyn ProtocolHandler>,
        channel_id: ChannelId,
        transacted: bool,
        ack_mode: AckMode,
        settings: SessionSettings,
    ) -> Result<Session> {
        let ack_mode = if transacted {
            AckMode::Transacted
        } else {
            ack_mode
        };
        let prefetch_high = settings.prefetch_high;
        let prefetch_low = settings.prefetch_low;
        let shared = Arc::new_cyclic(|weak: &Weak<SessionShared>| {
            // Only the no-acknowledge mode drives suspension from the queue
            // watermarks; every other mode leans on broker-side prefetch.
            let queue = if matches!(ack_mode, AckMode::NoAck) {
                Arc::new(InboundQueue::with_listener(
                    prefetch_high,
                    prefetch_low,
                    Box::new(WatermarkSuspender {
                        connection: connection.clone(),
                        session: weak.clone(),
                    }),
                ))
            } else {
                Arc::new(InboundQueue::bounded(prefetch_high))
            };
            SessionShared {
                channel_id,
                connection: connection.clone(),
                handler,
                settings,
                transacted,
                ack_mode,
                prefetch_high,
                prefetch_low,
                queue,
                highest_delivery_tag: AtomicI64::new(-1),
                dispatcher: StdMutex::new(None),
                consumers: ConsumerRegistry::default(),
                producers: ProducerRegistry::default(),
                subscriptions: SubscriptionCatalog::default(),
                next_consumer_tag: AtomicU64::new(1),
                next_producer_id: AtomicU64::new(0),
                in_recovery: AtomicBool::new(false),
                suspended: AtomicBool::new(false),
                started_at_least_once: AtomicBool::new(false),
                first_dispatcher: AtomicBool::new(true),
                has_listeners: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                suspension_lock: TokioMutex::new(()),
                message_delivery_lock: TokioMutex::new(()),
                message_listener: StdMutex::new(None),
                self_ref: weak.clone(),
            }
        });
        let (major, minor) = shared.handler.protocol_version();
        debug!(channel = channel_id, major, minor, transacted, "session opened");
        if transacted {
            shared.sync_method(Method::TxSelect, None).await?;
        }
        connection.register_session(channel_id, Arc::downgrade(&shared));
        Ok(Session { shared })
    }

    pub fn channel_id(&self) -> ChannelId {
        self.shared.channel_id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.shared.ack_mode
    }

    pub fn is_transacted(&self) -> bool {
        self.shared.transacted
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.is_suspended()
    }

    pub fn prefetch_high(&self) -> usize {
        self.shared.prefetch_high
    }

    pub fn prefetch_low(&self) -> usize {
        self.shared.prefetch_low
    }

    /// Whether at least one live consumer is attached to the destination.
    pub fn has_consumer(&self, destination: &Destination) -> bool {
        self.shared.consumers.has_consumer(destination)
    }

    pub fn consumer_count(&self) -> usize {
        self.shared.consumers.len()
    }

    pub fn producer_count(&self) -> usize {
        self.shared.producers.len()
    }

    /// Entry point for the network task: enqueue one decoded inbound
    /// envelope. Never blocks.
    pub fn message_received(&self, message: InboundMessage) {
        self.shared.message_received(message);
    }

    /// Server-initiated consumer cancellation.
    pub async fn confirm_consumer_cancelled(&self, tag: ConsumerTag) {
        self.shared.confirm_consumer_cancelled(tag).await;
    }

    /// Declare an exchange. The nowait flavour is abandoned on fail-over
    /// (resubscription redoes it); the waiting flavour retries.
    pub async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        nowait: bool,
    ) -> Result<()> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        if nowait {
            noop_protected(&shared.connection, "exchange.declare", || async move {
                shared.declare_exchange_inner(name, kind, false, true).await
            })
            .await
            .map(|_| ())
        } else {
            retry_protected(&shared.connection, "exchange.declare", || async move {
                shared.check_not_closed()?;
                shared.declare_exchange_inner(name, kind, false, false).await
            })
            .await
        }
    }

    /// Declare the destination's queue, returning its (possibly generated)
    /// name. Retries on fail-over.
    pub async fn declare_queue(&self, destination: &Destination) -> Result<String> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        retry_protected(&shared.connection, "queue.declare", || async move {
            shared.check_not_closed()?;
            shared.declare_queue_inner(destination).await
        })
        .await
    }

    /// Bind the named queue to the exchange under the routing key. Retries
    /// on fail-over.
    pub async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        arguments: FieldTable,
        exchange: &str,
    ) -> Result<()> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        retry_protected(&shared.connection, "queue.bind", || {
            let arguments = arguments.clone();
            async move {
                shared.check_not_closed()?;
                shared
                    .bind_queue_inner(queue, routing_key, arguments, exchange)
                    .await
            }
        })
        .await
    }

    /// Delete the named queue. Retries on fail-over.
    pub async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.shared.check_not_closed()?;
        self.shared.delete_queue_impl(queue).await
    }

    /// Whether the queue is bound to the exchange, optionally under a
    /// specific routing key. Retries on fail-over.
    pub async fn is_queue_bound(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: Option<&str>,
    ) -> Result<bool> {
        self.shared.check_not_closed()?;
        self.shared
            .is_queue_bound_impl(exchange, queue, routing_key)
            .await
    }

    /// Declare the destination's exchange and queue and bind them, as one
    /// fail-over protected unit.
    pub async fn declare_and_bind(&self, destination: &Destination) -> Result<()> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        retry_protected(&shared.connection, "declare-and-bind", || async move {
            shared.check_not_closed()?;
            shared
                .declare_exchange_inner(
                    destination.exchange(),
                    destination.exchange_type(),
                    false,
                    false,
                )
                .await?;
            let queue_name = shared.declare_queue_inner(destination).await?;
            shared
                .bind_queue_inner(
                    &queue_name,
                    destination.routing_key(),
                    FieldTable::new(),
                    destination.exchange(),
                )
                .await
        })
        .await
    }

    pub async fn create_consumer(&self, destination: &Destination) -> Result<Consumer> {
        self.create_consumer_with(destination, ConsumerOptions::default())
            .await
    }

    pub async fn create_consumer_with(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        self.shared.create_consumer_impl(destination, options).await
    }

    pub async fn create_producer(&self, destination: &Destination) -> Result<Producer> {
        self.create_producer_with(destination, ProducerOptions::default())
            .await
    }

    pub async fn create_producer_with(
        &self,
        destination: &Destination,
        options: ProducerOptions,
    ) -> Result<Producer> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        retry_protected(&shared.connection, "producer.create", || {
            let options = options.clone();
            async move {
                shared.check_not_closed()?;
                let id = ProducerId(shared.next_producer_id.fetch_add(1, Ordering::Relaxed) + 1);
                let producer =
                    Producer::new(&shared.arc(), id, destination.clone(), options.clone());
                producer.redeclare(shared)?;
                shared.producers.insert(producer.clone());
                Ok(producer)
            }
        })
        .await
    }

    pub async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        name: &str,
    ) -> Result<Consumer> {
        self.shared
            .create_durable_subscriber_impl(topic, name, None, false)
            .await
    }

    pub async fn create_durable_subscriber_with(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<Consumer> {
        self.shared
            .create_durable_subscriber_impl(topic, name, selector, no_local)
            .await
    }

    /// A read-only browser over a queue. Not available under strict
    /// compliance.
    pub async fn create_browser(
        &self,
        queue: &Destination,
        selector: Option<&str>,
    ) -> Result<Browser> {
        let shared = &self.shared;
        if shared.settings.strict {
            return Err(SessionError::Unsupported("queue browsers"));
        }
        shared.check_not_closed()?;
        if queue.kind() != DestinationKind::Queue {
            return Err(SessionError::InvalidDestination(
                "browsers require a queue destination".into(),
            ));
        }
        let options = ConsumerOptions {
            selector: selector.map(str::to_string),
            no_consume: true,
            auto_close: true,
            ..ConsumerOptions::default()
        };
        let consumer = shared.create_consumer_impl(queue, options).await?;
        Ok(Browser::new(consumer))
    }

    /// Remove a durable subscription by name, deleting its backing queue.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.shared.unsubscribe_impl(name).await
    }

    /// Write a single ack frame; no round-trip.
    pub fn acknowledge_message(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.shared.acknowledge_frame(delivery_tag, multiple)
    }

    /// Acknowledge outstanding deliveries on every consumer.
    pub fn acknowledge_all(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(SessionError::Closed);
        }
        for consumer in shared.consumers.snapshot_ordered() {
            consumer.acknowledge_outstanding(&shared.arc())?;
        }
        Ok(())
    }

    /// Commit the transaction: flush each consumer's deferred ack, then
    /// `tx.commit`. A fail-over interruption surfaces as status-uncertain
    /// and is never retried.
    pub async fn commit(&self) -> Result<()> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        shared.check_transacted()?;
        let this = shared.arc();
        for consumer in shared.consumers.snapshot_ordered() {
            consumer.flush_last_delivered_ack(&this)?;
        }
        shared
            .sync_method(Method::TxCommit, None)
            .await
            .map_err(|err| err.name_failover_op("tx.commit"))?;
        Ok(())
    }

    /// Roll the transaction back: suspend, elide in-flight deliveries via
    /// the rollback mark, requeue unacknowledged deliveries, `tx.rollback`,
    /// resume. Status-uncertain on fail-over, never retried.
    pub async fn rollback(&self) -> Result<()> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        shared.check_transacted()?;
        let _suspension = shared.suspension_lock.lock().await;
        let was_suspended = shared.is_suspended();
        if !was_suspended {
            shared
                .suspend_channel_locked(true)
                .await
                .map_err(|err| err.name_failover_op("tx.rollback"))?;
        }
        if let Some(dispatcher) = shared.current_dispatcher() {
            dispatcher.rollback(&shared.arc()).await;
        }
        shared
            .sync_method(Method::TxRollback, None)
            .await
            .map_err(|err| err.name_failover_op("tx.rollback"))?;
        if !was_suspended {
            shared
                .suspend_channel_locked(false)
                .await
                .map_err(|err| err.name_failover_op("tx.rollback"))?;
        }
        Ok(())
    }

    /// Redeliver every delivered-but-unacknowledged message. Not valid on a
    /// transacted session. Inside a listener callback this suppresses the
    /// auto-ack of the in-flight message.
    pub async fn recover(&self) -> Result<()> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        shared.check_not_transacted()?;
        // Cleared again just before the next delivery callback.
        shared.in_recovery.store(true, Ordering::Release);
        let was_suspended = shared.is_suspended();
        if !was_suspended {
            shared
                .suspend_channel(true)
                .await
                .map_err(|err| err.name_failover_op("basic.recover"))?;
        }
        for consumer in shared.consumers.snapshot_ordered() {
            consumer.clear_unacked();
        }
        if let Some(dispatcher) = shared.current_dispatcher() {
            dispatcher.rollback(&shared.arc()).await;
        }
        if shared.settings.strict {
            // basic.recover-ok is not available under strict compliance.
            shared.write_method(Method::BasicRecover { requeue: false })?;
            warn!("session recover cannot be confirmed under strict compliance; messages may arrive out of order");
        } else {
            shared
                .sync_method(Method::BasicRecover { requeue: false }, None)
                .await
                .map_err(|err| err.name_failover_op("basic.recover"))?;
        }
        if !was_suspended {
            shared
                .suspend_channel(false)
                .await
                .map_err(|err| err.name_failover_op("basic.recover"))?;
        }
        Ok(())
    }

    /// Install a session-wide listener on every current and future consumer.
    /// Fails while the session is started.
    pub fn set_message_listener(&self, listener: MessageListener) -> Result<()> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        if let Some(dispatcher) = shared.current_dispatcher()
            && !dispatcher.is_stopped()
        {
            return Err(SessionError::IllegalState(
                "cannot install a session listener while the session is started",
            ));
        }
        *shared
            .message_listener
            .lock()
            .expect("message listener lock") = Some(listener.clone());
        shared.note_listener_attached();
        for consumer in shared.consumers.snapshot_ordered() {
            consumer.install_listener(listener.clone());
        }
        Ok(())
    }

    /// Close the session: producers first, consumers second, then a
    /// channel.close round-trip bounded by the timeout. Idempotent; a
    /// fail-over interruption is ignored because the channel is already
    /// marked closed and will not be re-opened.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        self.shared.close(timeout).await
    }

    /// Server-initiated close: mark closed, propagate to consumers, report
    /// through the connection error callback.
    pub async fn closed_by_server(&self, reason: &str) {
        self.shared.closed_by_server(reason).await;
    }

    /// Start message delivery (connection start).
    pub async fn start(&self) -> Result<()> {
        self.shared.start().await
    }

    /// Stop message delivery (connection stop).
    pub async fn stop(&self) -> Result<()> {
        self.shared.stop().await
    }

    /// A temporary queue owned by this session.
    pub fn create_temporary_queue(&self) -> Destination {
        Destination::temporary_queue(self.shared.channel_id, self.shared.handler.generate_queue_name())
    }

    /// Delete a temporary queue created on this session.
    pub async fn delete_temporary_queue(&self, destination: &Destination) -> Result<()> {
        let shared = &self.shared;
        shared.check_not_closed()?;
        if destination.owner_channel() != Some(shared.channel_id) {
            return Err(SessionError::InvalidDestination(
                "temporary destination belongs to another session".into(),
            ));
        }
        if let Some(queue_name) = destination.queue_name() {
            shared.delete_queue_impl(&queue_name).await?;
        }
        destination.mark_deleted();
        Ok(())
    }
}

impl SessionShared {
    fn arc(&self) -> Arc<SessionShared> {
        self.self_ref.upgrade().expect("session self reference")
    }

    pub(crate) fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub(crate) fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub(crate) fn is_transacted(&self) -> bool {
        self.transacted
    }

    pub(crate) fn prefetch_high(&self) -> usize {
        self.prefetch_high
    }

    pub(crate) fn prefetch_low(&self) -> usize {
        self.prefetch_low
    }

    pub(crate) fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    pub(crate) fn queue(&self) -> &InboundQueue<Delivery> {
        &self.queue
    }

    pub(crate) fn message_delivery_lock(&self) -> &TokioMutex<()> {
        &self.message_delivery_lock
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn is_in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_recovery(&self, in_recovery: bool) {
        self.in_recovery.store(in_recovery, Ordering::Release);
    }

    pub(crate) fn highest_delivery_tag(&self) -> i64 {
        self.highest_delivery_tag.load(Ordering::Acquire)
    }

    pub(crate) fn note_listener_attached(&self) {
        self.has_listeners.store(true, Ordering::Release);
    }

    pub(crate) fn check_not_closed(&self) -> Result<()> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_transacted(&self) -> Result<()> {
        if self.transacted {
            Ok(())
        } else {
            Err(SessionError::NotTransacted)
        }
    }

    fn check_not_transacted(&self) -> Result<()> {
        if self.transacted {
            Err(SessionError::IsTransacted)
        } else {
            Ok(())
        }
    }

    fn frame(&self, method: Method) -> Frame {
        Frame::method(self.channel_id, method)
    }

    fn write_method(&self, method: Method) -> Result<()> {
        self.handler.write_frame(self.frame(method))
    }

    async fn sync_method(&self, method: Method, timeout: Option<Duration>) -> Result<Method> {
        let expected = method
            .reply_kind()
            .ok_or_else(|| SessionError::Protocol(format!("{:?} is not a round-trip", method.kind())))?;
        self.handler
            .sync_write(self.frame(method), expected, timeout)
            .await
    }

    pub(crate) fn message_received(&self, message: InboundMessage) {
        match message {
            InboundMessage::Bounce(bounce) => {
                debug!(channel = self.channel_id, "bounce received");
                let connection = self.connection.clone();
                let reporter = connection.clone();
                connection.enqueue_work(async move {
                    reporter.report_error(bounce::translate(bounce));
                });
            }
            InboundMessage::Delivery(delivery) => {
                self.highest_delivery_tag
                    .fetch_max(delivery.delivery_tag as i64, Ordering::AcqRel);
                self.queue.push(delivery);
            }
        }
    }

    /// Reject one delivery. Only meaningful in the modes where the broker
    /// still holds unacknowledged state for this channel.
    pub(crate) fn reject_message(&self, delivery_tag: u64, requeue: bool) {
        if !matches!(self.ack_mode, AckMode::Client | AckMode::Transacted) {
            return;
        }
        debug!(delivery_tag, requeue, "rejecting delivery");
        if let Err(err) = self.write_method(Method::BasicReject {
            delivery_tag,
            requeue,
        }) {
            warn!(%err, delivery_tag, "failed to write reject frame");
        }
    }

    pub(crate) fn acknowledge_frame(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        debug!(
            delivery_tag,
            multiple,
            channel = self.channel_id,
            "sending ack"
        );
        self.write_method(Method::BasicAck {
            delivery_tag,
            multiple,
        })
    }

    pub(crate) fn publish_frames(
        &self,
        destination: &Destination,
        payload: Bytes,
        properties: BasicProperties,
        mandatory: bool,
        immediate: bool,
    ) -> Result<()> {
        self.check_not_closed()?;
        self.write_method(Method::BasicPublish {
            exchange: destination.exchange().to_string(),
            routing_key: destination.routing_key().to_string(),
            mandatory,
            immediate,
        })?;
        let header = ContentHeader::for_payload(&payload, properties);
        self.handler
            .write_frame(Frame::content_header(self.channel_id, header))?;
        self.handler
            .write_frame(Frame::content_body(self.channel_id, payload))
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        self.handler.flush().await
    }

    pub(crate) fn declare_exchange_nowait(&self, destination: &Destination) -> Result<()> {
        self.write_method(Method::ExchangeDeclare {
            exchange: destination.exchange().to_string(),
            kind: destination.exchange_type(),
            durable: false,
            auto_delete: false,
            nowait: true,
        })
    }

    async fn declare_exchange_inner(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
        nowait: bool,
    ) -> Result<()> {
        let declare = Method::ExchangeDeclare {
            exchange: name.to_string(),
            kind,
            durable,
            auto_delete: false,
            nowait,
        };
        if nowait {
            self.write_method(declare)
        } else {
            self.sync_method(declare, None).await.map(|_| ())
        }
    }

    /// Declare the destination's queue, generating a fresh name for
    /// destinations that want one. Generated names are refreshed on every
    /// declare so fail-over rebuilds them.
    async fn declare_queue_inner(&self, destination: &Destination) -> Result<String> {
        let queue_name = if destination.is_name_required() {
            let name = self.handler.generate_queue_name();
            destination.set_queue_name(name.clone());
            name
        } else {
            destination.queue_name().ok_or_else(|| {
                SessionError::InvalidDestination("destination has no queue name".into())
            })?
        };
        self.sync_method(
            Method::QueueDeclare {
                queue: queue_name.clone(),
                durable: destination.is_durable(),
                exclusive: destination.is_exclusive(),
                auto_delete: destination.is_auto_delete(),
                nowait: false,
            },
            None,
        )
        .await?;
        Ok(queue_name)
    }

    async fn bind_queue_inner(
        &self,
        queue: &str,
        routing_key: &str,
        arguments: FieldTable,
        exchange: &str,
    ) -> Result<()> {
        self.sync_method(
            Method::QueueBind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                arguments,
                nowait: false,
            },
            None,
        )
        .await
        .map(|_| ())
    }

    pub(crate) async fn delete_queue_impl(&self, queue: &str) -> Result<()> {
        retry_protected(&self.connection, "queue.delete", || async move {
            self.check_not_closed()?;
            self.sync_method(
                Method::QueueDelete {
                    queue: queue.to_string(),
                    if_unused: false,
                    if_empty: false,
                    nowait: false,
                },
                None,
            )
            .await
            .map(|_| ())
        })
        .await
    }

    pub(crate) async fn is_queue_bound_impl(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: Option<&str>,
    ) -> Result<bool> {
        let reply = retry_protected(&self.connection, "exchange.bound", || async move {
            self.check_not_closed()?;
            self.sync_method(
                Method::ExchangeBound {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                    routing_key: routing_key.map(str::to_string),
                },
                None,
            )
            .await
        })
        .await?;
        match reply {
            Method::ExchangeBoundOk { reply_code, .. } => Ok(reply_code == 0),
            other => Err(SessionError::Protocol(format!(
                "unexpected exchange.bound reply: {:?}",
                other.kind()
            ))),
        }
    }

    /// Validate, construct, register, declare, bind, subscribe; the whole
    /// unit retries after a fail-over.
    pub(crate) async fn create_consumer_impl(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        self.check_not_closed()?;
        if destination.is_temporary() {
            if destination.owner_channel() != Some(self.channel_id) {
                return Err(SessionError::InvalidDestination(
                    "cannot consume from a temporary destination created on another session".into(),
                ));
            }
            if destination.is_deleted() {
                return Err(SessionError::InvalidDestination(
                    "cannot consume from a deleted destination".into(),
                ));
            }
        }
        let selector = match options.selector.as_deref() {
            Some(selector) if !selector.is_empty() && self.settings.strict => {
                if self.settings.strict_fatal {
                    return Err(SessionError::Unsupported("message selectors"));
                }
                warn!(selector, "dropping selector under strict compliance");
                None
            }
            other => other.map(str::to_string),
        };
        retry_protected(&self.connection, "basic.consume", || {
            let options = options.clone();
            let selector = selector.clone();
            async move {
                self.check_not_closed()?;
                let tag = ConsumerTag(self.next_consumer_tag.fetch_add(1, Ordering::Relaxed));
                let consumer =
                    Consumer::new(&self.arc(), tag, destination.clone(), options, selector);
                if let Some(listener) = self
                    .message_listener
                    .lock()
                    .expect("message listener lock")
                    .clone()
                {
                    consumer.install_listener(listener);
                }
                self.register_consumer_inner(&consumer, false).await?;
                self.consumers.add_destination(destination);
                Ok(consumer)
            }
        })
        .await
    }

    /// Declare, bind and subscribe one consumer. Caller holds the fail-over
    /// mutex; resubscription also enters here directly.
    async fn register_consumer_inner(&self, consumer: &Consumer, nowait: bool) -> Result<()> {
        let destination = consumer.destination().clone();
        self.declare_exchange_inner(
            destination.exchange(),
            destination.exchange_type(),
            destination.is_durable(),
            false,
        )
        .await?;
        let queue_name = self.declare_queue_inner(&destination).await?;
        let mut bind_arguments = FieldTable::new();
        if let Some(raw) = consumer.raw_selector() {
            bind_arguments.extend(raw);
        }
        self.bind_queue_inner(
            &queue_name,
            destination.routing_key(),
            bind_arguments,
            destination.exchange(),
        )
        .await?;
        if !self.settings.effective_immediate_prefetch() {
            // Keep the broker from pushing the prefetch window into a client
            // that is not ready to consume; the first receive or listener
            // assignment resumes the channel.
            if self.current_dispatcher().is_none() && !self.is_suspended() {
                match self.suspend_channel(true).await {
                    Ok(()) => info!("prefetch delayed until the first receive or listener"),
                    Err(err) => info!(%err, "suspending channel before subscribe failed"),
                }
            }
        } else {
            info!("immediately prefetching existing messages to new consumer");
        }
        self.consume_from_queue(consumer, &queue_name, nowait).await
    }

    /// Register in the map before the subscribe frame goes out; roll the
    /// registration back if the subscribe fails.
    async fn consume_from_queue(
        &self,
        consumer: &Consumer,
        queue_name: &str,
        nowait: bool,
    ) -> Result<()> {
        let tag = consumer.tag();
        let mut arguments = FieldTable::new();
        if let Some(selector) = consumer.selector()
            && !selector.is_empty()
        {
            arguments.insert("x-selector", FieldValue::Str(selector.to_string()));
        }
        if consumer.is_auto_close() {
            arguments.insert("x-auto-close", FieldValue::Bool(true));
        }
        if consumer.is_no_consume() {
            arguments.insert("x-no-consume", FieldValue::Bool(true));
        }
        self.consumers.insert(consumer.clone());
        let consume = Method::BasicConsume {
            queue: queue_name.to_string(),
            consumer_tag: tag.0,
            no_local: consumer.is_no_local(),
            no_ack: matches!(consumer.ack_mode(), AckMode::NoAck),
            exclusive: consumer.is_exclusive(),
            nowait,
            arguments,
        };
        let outcome = if nowait {
            self.write_method(consume)
        } else {
            self.sync_method(consume, None).await.map(|_| ())
        };
        if let Err(err) = outcome {
            self.consumers.remove(tag);
            return Err(err);
        }
        Ok(())
    }

    async fn create_durable_subscriber_impl(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<&str>,
        no_local: bool,
    ) -> Result<Consumer> {
        self.check_not_closed()?;
        if topic.kind() != DestinationKind::Topic {
            return Err(SessionError::InvalidDestination(
                "durable subscriptions require a topic destination".into(),
            ));
        }
        if topic.is_temporary() {
            return Err(SessionError::InvalidDestination(
                "cannot create a durable subscription on a temporary topic".into(),
            ));
        }
        let durable = Destination::durable_topic(topic, self.connection.client_id(), name);
        let queue_name = durable_subscription_queue_name(self.connection.client_id(), name);
        if let Some(entry) = self.subscriptions.lookup(name) {
            if entry.topic == *topic {
                return Err(SessionError::AlreadySubscribed {
                    name: name.to_string(),
                    topic: topic.name().to_string(),
                });
            }
            // Same name, different topic: replace the old subscription.
            self.unsubscribe_impl(name).await?;
        } else if self.settings.strict {
            if self.settings.strict_fatal {
                return Err(SessionError::Unsupported("durable subscriptions"));
            }
            warn!(
                subscription = name,
                "cannot determine whether the subscription exists; deleting its queue regardless"
            );
            self.delete_queue_impl(&queue_name).await?;
        } else if self
            .is_queue_bound_impl(durable.exchange(), &queue_name, None)
            .await?
            && !self
                .is_queue_bound_impl(durable.exchange(), &queue_name, Some(topic.routing_key()))
                .await?
        {
            // Bound, but not for this topic: the old subscription is trash.
            self.delete_queue_impl(&queue_name).await?;
        }
        let options = ConsumerOptions {
            selector: selector.map(str::to_string),
            no_local,
            ..ConsumerOptions::default()
        };
        let consumer = self.create_consumer_impl(&durable, options).await?;
        self.subscriptions
            .insert(name, consumer.tag(), topic.clone());
        Ok(consumer)
    }

    async fn unsubscribe_impl(&self, name: &str) -> Result<()> {
        self.check_not_closed()?;
        let queue_name = durable_subscription_queue_name(self.connection.client_id(), name);
        if self.subscriptions.lookup(name).is_some() {
            self.delete_queue_impl(&queue_name).await?;
            self.subscriptions.remove_by_name(name);
            return Ok(());
        }
        if self.settings.strict {
            if self.settings.strict_fatal {
                return Err(SessionError::Unsupported("durable subscriptions"));
            }
            warn!(
                subscription = name,
                "cannot determine whether the subscription exists; deleting its queue regardless"
            );
            return self.delete_queue_impl(&queue_name).await;
        }
        if self
            .is_queue_bound_impl(crate::destination::DEFAULT_TOPIC_EXCHANGE, &queue_name, None)
            .await?
        {
            self.delete_queue_impl(&queue_name).await
        } else {
            Err(SessionError::UnknownSubscription(name.to_string()))
        }
    }

    pub(crate) fn current_dispatcher(&self) -> Option<Dispatcher> {
        self.dispatcher
            .lock()
            .expect("dispatcher slot lock")
            .clone()
    }

    fn ensure_dispatcher(&self, initially_stopped: bool) -> Dispatcher {
        let mut slot = self.dispatcher.lock().expect("dispatcher slot lock");
        match slot.as_ref() {
            Some(dispatcher) => {
                dispatcher.set_connection_stopped(initially_stopped);
                dispatcher.clone()
            }
            None => {
                let dispatcher =
                    Dispatcher::spawn(&self.arc(), Arc::clone(&self.queue), initially_stopped);
                *slot = Some(dispatcher.clone());
                dispatcher
            }
        }
    }

    /// First receive or listener assignment: resume the channel if prefetch
    /// was delayed, and make sure the dispatcher is running.
    pub(crate) async fn on_first_receive(&self) {
        if dispatcher::in_dispatch() {
            return;
        }
        if !self.settings.effective_immediate_prefetch()
            && self.is_suspended()
            && self.started_at_least_once.load(Ordering::Acquire)
            && self.first_dispatcher.swap(false, Ordering::AcqRel)
            && let Err(err) = self.suspend_channel(false).await
        {
            info!(%err, "unsuspending channel failed");
        }
        self.ensure_dispatcher(!self.connection.is_started());
    }

    pub(crate) async fn start(&self) -> Result<()> {
        if self.started_at_least_once.swap(true, Ordering::AcqRel) {
            self.suspend_channel(false).await?;
        }
        if self.has_listeners.load(Ordering::Acquire) {
            self.on_first_receive().await;
        }
        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        self.suspend_channel(true).await?;
        if let Some(dispatcher) = self.current_dispatcher() {
            dispatcher.set_connection_stopped(true);
        }
        Ok(())
    }

    /// Toggle channel.flow. Guarded by the suspension lock so two toggles
    /// never overlap.
    pub(crate) async fn suspend_channel(&self, suspend: bool) -> Result<()> {
        let _guard = self.suspension_lock.lock().await;
        self.suspend_channel_locked(suspend).await
    }

    async fn suspend_channel_locked(&self, suspend: bool) -> Result<()> {
        debug!(suspend, channel = self.channel_id, "setting channel flow");
        self.suspended.store(suspend, Ordering::Release);
        self.sync_method(Method::ChannelFlow { active: !suspend }, None)
            .await
            .map_err(|err| err.name_failover_op("channel.flow"))?;
        Ok(())
    }

    /// Route one delivery to its consumer. Runs on the dispatcher task with
    /// the message delivery lock held.
    pub(crate) async fn dispatch_delivery(&self, delivery: Delivery, closing: bool) {
        let tag = delivery.consumer_tag;
        match self.consumers.get(tag) {
            Some(consumer) if !consumer.is_closed() => {
                consumer.notify_delivery(&self.arc(), delivery).await;
            }
            absent => {
                info!(
                    consumer_tag = %tag,
                    delivery_tag = delivery.delivery_tag,
                    closed_consumer = absent.is_some(),
                    "no live consumer for delivery; rejecting with requeue"
                );
                if !closing {
                    self.reject_message(delivery.delivery_tag, true);
                }
            }
        }
    }

    pub(crate) fn deregister_consumer(&self, consumer: &Consumer) {
        if self.consumers.remove(consumer.tag()).is_some() {
            self.subscriptions.remove_by_tag(consumer.tag());
            self.consumers.remove_destination(consumer.destination());
        }
    }

    pub(crate) fn deregister_producer(&self, id: ProducerId) {
        self.producers.remove(id);
    }

    /// Client-initiated consumer close: cancel on the broker, requeue
    /// anything still pending, deregister.
    pub(crate) async fn close_consumer(&self, consumer: &Consumer) -> Result<()> {
        if consumer.is_closed() {
            self.deregister_consumer(consumer);
            return Ok(());
        }
        let tag = consumer.tag();
        noop_protected(&self.connection, "basic.cancel", || async move {
            self.check_not_closed()?;
            self.sync_method(
                Method::BasicCancel {
                    consumer_tag: tag.0,
                    nowait: false,
                },
                None,
            )
            .await
        })
        .await?;
        if let Some(dispatcher) = self.current_dispatcher() {
            dispatcher.reject_pending(&self.arc(), consumer).await;
        } else {
            consumer.mark_closed();
        }
        self.deregister_consumer(consumer);
        Ok(())
    }

    /// Server-initiated cancellation. Buffered deliveries for the tag are
    /// flushed to the consumer before any auto-close decision, so none are
    /// lost to the cancel racing the in-flight messages.
    pub(crate) async fn confirm_consumer_cancelled(&self, tag: ConsumerTag) {
        let Some(consumer) = self.consumers.get(tag) else {
            warn!(consumer_tag = %tag, "cannot confirm cancellation; consumer not found");
            return;
        };
        if consumer.is_auto_close() {
            let pending = self.queue.drain_matching(|d| d.consumer_tag == tag);
            for delivery in pending {
                consumer.enqueue_buffered(delivery.into());
            }
            consumer.close_when_drained();
            self.deregister_consumer(&consumer);
        } else if !consumer.is_no_consume() {
            let dispatcher = match self.current_dispatcher() {
                Some(dispatcher) => dispatcher,
                None => self.ensure_dispatcher(true),
            };
            dispatcher.reject_pending(&self.arc(), &consumer).await;
            self.deregister_consumer(&consumer);
        } else {
            consumer.mark_closed();
            self.deregister_consumer(&consumer);
        }
    }

    /// Re-register every producer and consumer in original creation order.
    /// The caller (the fail-over driver) holds the fail-over mutex.
    pub(crate) async fn resubscribe(&self) -> Result<()> {
        let producers = self.producers.snapshot_ordered();
        info!(
            channel = self.channel_id,
            producers = producers.len(),
            "resubscribing producers"
        );
        for producer in producers {
            producer.redeclare(self)?;
        }
        let consumers = self.consumers.drain_for_resubscribe();
        info!(
            channel = self.channel_id,
            consumers = consumers.len(),
            "resubscribing consumers"
        );
        for consumer in consumers {
            self.register_consumer_inner(&consumer, true).await?;
        }
        Ok(())
    }

    async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        let _delivery = self.message_delivery_lock.lock().await;
        let _failover = self.connection.failover_mutex().lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(channel = self.channel_id, "closing session");
        let outcome = {
            self.close_producers_and_consumers(None).await;
            self.handler.close_session(self.channel_id);
            match self
                .handler
                .sync_write(
                    self.frame(Method::ChannelClose {
                        reply_code: REPLY_SUCCESS,
                        reply_text: "session closing channel".to_string(),
                    }),
                    MethodKind::ChannelCloseOk,
                    timeout,
                )
                .await
            {
                Ok(_) => Ok(()),
                Err(err) if err.is_failover() => {
                    debug!("fail-over during channel close ignored; channel already marked closed");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };
        self.connection.deregister_session(self.channel_id);
        outcome
    }

    async fn closed_by_server(&self, reason: &str) {
        let _delivery = self.message_delivery_lock.lock().await;
        let _failover = self.connection.failover_mutex().lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(channel = self.channel_id, reason, "session closed by broker");
        self.connection.deregister_session(self.channel_id);
        self.close_producers_and_consumers(Some(reason)).await;
        self.connection.report_error(AsyncError::SessionClosed {
            channel: self.channel_id,
            reason: reason.to_string(),
        });
    }

    /// Producers first: their close involves no broker traffic. Consumers
    /// second, propagating the error if one caused this close.
    async fn close_producers_and_consumers(&self, error: Option<&str>) {
        if let Some(dispatcher) = self.dispatcher.lock().expect("dispatcher slot lock").take() {
            dispatcher.close();
        }
        debug!(
            pending = self.queue.len(),
            subscriptions = self.subscriptions.len(),
            "closing inbound queue"
        );
        self.queue.close();
        for producer in self.producers.clear() {
            producer.mark_closed();
        }
        for consumer in self.consumers.drain_all() {
            self.subscriptions.remove_by_tag(consumer.tag());
            match error {
                Some(reason) => consumer.notify_error(reason),
                None => {
                    if let Err(err) = self
                        .sync_method(
                            Method::BasicCancel {
                                consumer_tag: consumer.tag().0,
                                nowait: false,
                            },
                            None,
                        )
                        .await
                    {
                        debug!(%err, consumer_tag = %consumer.tag(),
                            "cancel during session close failed; channel close will cancel the consumer");
                    }
                    consumer.mark_closed();
                }
            }
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(dispatcher) = self.dispatcher.lock().expect("dispatcher slot lock").take() {
            dispatcher.close();
        }
    }
}
