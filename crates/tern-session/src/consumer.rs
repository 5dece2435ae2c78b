// Message consumer: prefetch state, unacknowledged-delivery log, listener or
// synchronous-receive delivery, per-consumer rollback.
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tern_wire::FieldTable;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::delivery::{ConsumerTag, DeliveredMessage, Delivery};
use crate::destination::Destination;
use crate::error::{Result, SessionError};
use crate::session::{AckMode, SessionShared};

pub type ListenerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Asynchronous message callback. Runs on the dispatcher task under the
/// session's message delivery lock, so it is serialized with close, commit,
/// rollback and recover.
pub type MessageListener = Arc<dyn Fn(DeliveredMessage) -> ListenerFuture + Send + Sync>;

/// Per-consumer knobs; defaults inherit the session's prefetch marks.
#[derive(Clone, Default)]
pub struct ConsumerOptions {
    pub prefetch_high: Option<usize>,
    pub prefetch_low: Option<usize>,
    pub no_local: bool,
    pub exclusive: bool,
    pub selector: Option<String>,
    pub raw_selector: Option<FieldTable>,
    pub no_consume: bool,
    pub auto_close: bool,
}

struct ReceiveState {
    queued: VecDeque<DeliveredMessage>,
    closed: bool,
    // Server-side cancellation of an auto-close consumer: hand out what is
    // buffered, then report closed.
    drain_then_close: bool,
    error: Option<String>,
}

pub(crate) struct ConsumerInner {
    tag: ConsumerTag,
    destination: Destination,
    selector: Option<String>,
    raw_selector: Option<FieldTable>,
    no_local: bool,
    exclusive: bool,
    ack_mode: AckMode,
    prefetch_high: usize,
    prefetch_low: usize,
    no_consume: bool,
    auto_close: bool,
    session: Weak<SessionShared>,
    state: StdMutex<ReceiveState>,
    notify: Notify,
    listener: StdMutex<Option<MessageListener>>,
    unacked: StdMutex<Vec<u64>>,
    last_delivered: AtomicI64,
    // Transacted sessions defer the last-delivered ack until commit.
    ack_pending: AtomicBool,
    closed: AtomicBool,
}

/// A subscription to one destination on a session.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.inner.tag)
            .finish()
    }
}

impl Consumer {
    pub(crate) fn new(
        session: &Arc<SessionShared>,
        tag: ConsumerTag,
        destination: Destination,
        options: ConsumerOptions,
        selector: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                tag,
                destination,
                selector,
                raw_selector: options.raw_selector,
                no_local: options.no_local,
                exclusive: options.exclusive,
                ack_mode: session.ack_mode(),
                prefetch_high: options.prefetch_high.unwrap_or(session.prefetch_high()),
                prefetch_low: options.prefetch_low.unwrap_or(session.prefetch_low()),
                no_consume: options.no_consume,
                auto_close: options.auto_close,
                session: Arc::downgrade(session),
                state: StdMutex::new(ReceiveState {
                    queued: VecDeque::new(),
                    closed: false,
                    drain_then_close: false,
                    error: None,
                }),
                notify: Notify::new(),
                listener: StdMutex::new(None),
                unacked: StdMutex::new(Vec::new()),
                last_delivered: AtomicI64::new(-1),
                ack_pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn tag(&self) -> ConsumerTag {
        self.inner.tag
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    pub fn selector(&self) -> Option<&str> {
        self.inner.selector.as_deref()
    }

    pub(crate) fn raw_selector(&self) -> Option<&FieldTable> {
        self.inner.raw_selector.as_ref()
    }

    pub fn ack_mode(&self) -> AckMode {
        self.inner.ack_mode
    }

    pub fn prefetch_high(&self) -> usize {
        self.inner.prefetch_high
    }

    pub fn prefetch_low(&self) -> usize {
        self.inner.prefetch_low
    }

    pub fn is_no_local(&self) -> bool {
        self.inner.no_local
    }

    pub fn is_exclusive(&self) -> bool {
        self.inner.exclusive
    }

    pub fn is_no_consume(&self) -> bool {
        self.inner.no_consume
    }

    pub fn is_auto_close(&self) -> bool {
        self.inner.auto_close
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn session(&self) -> Result<Arc<SessionShared>> {
        self.inner.session.upgrade().ok_or(SessionError::Closed)
    }

    /// Install an asynchronous listener and drain anything already buffered
    /// to it.
    pub async fn set_listener(&self, listener: MessageListener) -> Result<()> {
        let session = self.session()?;
        session.check_not_closed()?;
        *self.inner.listener.lock().expect("listener lock") = Some(listener.clone());
        session.note_listener_attached();
        loop {
            let message = {
                let mut state = self.inner.state.lock().expect("receive state lock");
                state.queued.pop_front()
            };
            let Some(message) = message else { break };
            let tag = message.delivery_tag;
            self.record_delivered(tag);
            session.set_in_recovery(false);
            (listener)(message).await;
            self.post_deliver(&session, tag);
        }
        session.on_first_receive().await;
        Ok(())
    }

    pub(crate) fn install_listener(&self, listener: MessageListener) {
        *self.inner.listener.lock().expect("listener lock") = Some(listener);
    }

    /// Wait for the next message.
    pub async fn receive(&self) -> Result<Option<DeliveredMessage>> {
        self.receive_inner(None).await
    }

    /// Wait for the next message up to the deadline; `None` on expiry.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<DeliveredMessage>> {
        self.receive_inner(Some(timeout)).await
    }

    /// Hand back a buffered message without waiting.
    pub async fn receive_no_wait(&self) -> Result<Option<DeliveredMessage>> {
        let session = self.session()?;
        session.on_first_receive().await;
        match self.pop_buffered()? {
            Buffered::Message(message) => {
                let tag = message.delivery_tag;
                self.record_delivered(tag);
                session.set_in_recovery(false);
                self.post_deliver(&session, tag);
                Ok(Some(message))
            }
            Buffered::Empty | Buffered::Closed => Ok(None),
        }
    }

    async fn receive_inner(&self, timeout: Option<Duration>) -> Result<Option<DeliveredMessage>> {
        let session = self.session()?;
        session.on_first_receive().await;
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.inner.notify.notified();
            match self.pop_buffered()? {
                Buffered::Message(message) => {
                    let tag = message.delivery_tag;
                    self.record_delivered(tag);
                    session.set_in_recovery(false);
                    self.post_deliver(&session, tag);
                    return Ok(Some(message));
                }
                Buffered::Closed => return Ok(None),
                Buffered::Empty => match deadline {
                    Some(deadline) => {
                        if tokio::time::timeout_at(deadline, notified).await.is_err() {
                            return Ok(None);
                        }
                    }
                    None => notified.await,
                },
            }
        }
    }

    fn pop_buffered(&self) -> Result<Buffered> {
        let mut state = self.inner.state.lock().expect("receive state lock");
        if let Some(error) = &state.error {
            return Err(SessionError::Transport(error.clone()));
        }
        if let Some(message) = state.queued.pop_front() {
            return Ok(Buffered::Message(message));
        }
        if state.closed {
            return Ok(Buffered::Closed);
        }
        if state.drain_then_close {
            state.closed = true;
            self.inner.closed.store(true, Ordering::Release);
            return Ok(Buffered::Closed);
        }
        Ok(Buffered::Empty)
    }

    /// Acknowledge every delivery handed out so far.
    pub async fn acknowledge(&self) -> Result<()> {
        let session = self.session()?;
        session.check_not_closed()?;
        self.acknowledge_outstanding(&session)
    }

    /// Cancel the subscription on the broker and stop delivery.
    pub async fn close(&self) -> Result<()> {
        let session = self.session()?;
        session.close_consumer(self).await
    }

    /// Dispatcher entry point: hand one delivery to the application, under
    /// the session's message delivery lock.
    pub(crate) async fn notify_delivery(&self, session: &Arc<SessionShared>, delivery: Delivery) {
        if self.is_closed() {
            debug!(consumer_tag = %self.tag(), delivery_tag = delivery.delivery_tag,
                "delivery for closed consumer rejected with requeue");
            session.reject_message(delivery.delivery_tag, true);
            return;
        }
        let message = DeliveredMessage::from(delivery);
        let listener = self.inner.listener.lock().expect("listener lock").clone();
        match listener {
            Some(listener) => {
                let tag = message.delivery_tag;
                self.record_delivered(tag);
                // Cleared before the callback so a recover() issued inside it
                // is observable afterwards and suppresses the auto-ack.
                session.set_in_recovery(false);
                (listener)(message).await;
                self.post_deliver(session, tag);
            }
            None => {
                self.enqueue_buffered(message);
            }
        }
    }

    pub(crate) fn enqueue_buffered(&self, message: DeliveredMessage) {
        self.inner
            .state
            .lock()
            .expect("receive state lock")
            .queued
            .push_back(message);
        self.inner.notify.notify_one();
    }

    fn record_delivered(&self, delivery_tag: u64) {
        if self.inner.no_consume || matches!(self.inner.ack_mode, AckMode::NoAck) {
            return;
        }
        self.inner
            .unacked
            .lock()
            .expect("unacked lock")
            .push(delivery_tag);
        self.inner
            .last_delivered
            .fetch_max(delivery_tag as i64, Ordering::AcqRel);
    }

    fn post_deliver(&self, session: &Arc<SessionShared>, delivery_tag: u64) {
        if self.inner.no_consume {
            return;
        }
        match self.inner.ack_mode {
            AckMode::Auto => {
                if !session.is_in_recovery() {
                    self.send_ack(session, delivery_tag, false);
                }
            }
            AckMode::DupsOk => {
                if !session.is_in_recovery() {
                    self.send_ack(session, delivery_tag, true);
                }
            }
            AckMode::Transacted => {
                self.inner.ack_pending.store(true, Ordering::Release);
            }
            AckMode::Client | AckMode::NoAck => {}
        }
    }

    fn send_ack(&self, session: &Arc<SessionShared>, delivery_tag: u64, multiple: bool) {
        if let Err(err) = session.acknowledge_frame(delivery_tag, multiple) {
            warn!(%err, delivery_tag, "failed to write acknowledgement frame");
            return;
        }
        let mut unacked = self.inner.unacked.lock().expect("unacked lock");
        if multiple {
            unacked.retain(|tag| *tag > delivery_tag);
        } else {
            unacked.retain(|tag| *tag != delivery_tag);
        }
    }

    /// Acknowledge up to the last delivered message, clearing the log.
    pub(crate) fn acknowledge_outstanding(&self, session: &Arc<SessionShared>) -> Result<()> {
        let last = self.inner.last_delivered.load(Ordering::Acquire);
        let has_unacked = !self.inner.unacked.lock().expect("unacked lock").is_empty();
        if last >= 0 && has_unacked {
            session.acknowledge_frame(last as u64, true)?;
            self.inner.unacked.lock().expect("unacked lock").clear();
        }
        Ok(())
    }

    /// Commit support: flush the deferred last-delivered ack, if any.
    pub(crate) fn flush_last_delivered_ack(&self, session: &Arc<SessionShared>) -> Result<()> {
        if self.inner.ack_pending.swap(false, Ordering::AcqRel) {
            let last = self.inner.last_delivered.load(Ordering::Acquire);
            if last >= 0 {
                session.acknowledge_frame(last as u64, true)?;
                self.inner.unacked.lock().expect("unacked lock").clear();
            }
        }
        Ok(())
    }

    /// Local rollback: requeue both the buffered and the unacknowledged
    /// deliveries on the broker.
    pub(crate) fn rollback(&self, session: &SessionShared) {
        let buffered: Vec<DeliveredMessage> = {
            let mut state = self.inner.state.lock().expect("receive state lock");
            state.queued.drain(..).collect()
        };
        for message in buffered {
            session.reject_message(message.delivery_tag, true);
        }
        let unacked: Vec<u64> = {
            let mut unacked = self.inner.unacked.lock().expect("unacked lock");
            unacked.drain(..).collect()
        };
        for tag in unacked {
            session.reject_message(tag, true);
        }
        self.inner.last_delivered.store(-1, Ordering::Release);
        self.inner.ack_pending.store(false, Ordering::Release);
    }

    /// Recover support: forget the unacknowledged log without requeueing;
    /// the broker redelivers its unacked window itself.
    pub(crate) fn clear_unacked(&self) {
        self.inner.unacked.lock().expect("unacked lock").clear();
        self.inner.last_delivered.store(-1, Ordering::Release);
        self.inner.ack_pending.store(false, Ordering::Release);
    }

    /// Drop buffered messages without broker traffic.
    pub(crate) fn clear_receive_queue(&self) {
        self.inner
            .state
            .lock()
            .expect("receive state lock")
            .queued
            .clear();
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.state.lock().expect("receive state lock").closed = true;
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    /// Hand out what is buffered, then report closed.
    pub(crate) fn close_when_drained(&self) {
        let mut state = self.inner.state.lock().expect("receive state lock");
        if state.queued.is_empty() {
            state.closed = true;
            self.inner.closed.store(true, Ordering::Release);
        } else {
            state.drain_then_close = true;
        }
        drop(state);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub(crate) fn notify_error(&self, reason: &str) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner
            .state
            .lock()
            .expect("receive state lock")
            .error = Some(reason.to_string());
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }
}

enum Buffered {
    Message(DeliveredMessage),
    Empty,
    Closed,
}

/// Read-only cursor over a queue: a no-consume consumer the broker does not
/// count against the queue.
#[derive(Debug)]
pub struct Browser {
    consumer: Consumer,
}

impl Browser {
    pub(crate) fn new(consumer: Consumer) -> Self {
        Self { consumer }
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Next browsed message, if one is already buffered or arrives within
    /// the timeout.
    pub async fn next_message(&self, timeout: Duration) -> Result<Option<DeliveredMessage>> {
        self.consumer.receive_timeout(timeout).await
    }

    pub async fn close(&self) -> Result<()> {
        self.consumer.close().await
    }
}
