// Shared test harness: a scripted in-memory protocol handler and helpers.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tern_session::{
    AckMode, AsyncError, ConnectionHandle, Consumer, Delivery, ErrorCallback, InboundMessage,
    ProtocolHandler, Result, Session, SessionError, SessionSettings,
};
use tern_wire::{ChannelId, ContentHeader, Frame, FrameBody, Method, MethodKind};

/// Protocol handler double: records every frame, synthesizes ok replies, and
/// plays back scripted failures and responses.
pub struct MockProtocol {
    frames: StdMutex<Vec<Frame>>,
    failures: StdMutex<HashMap<MethodKind, VecDeque<SessionError>>>,
    responses: StdMutex<HashMap<MethodKind, VecDeque<Method>>>,
    closed_sessions: StdMutex<Vec<ChannelId>>,
    queue_names: AtomicU64,
}

impl MockProtocol {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: StdMutex::new(Vec::new()),
            failures: StdMutex::new(HashMap::new()),
            responses: StdMutex::new(HashMap::new()),
            closed_sessions: StdMutex::new(Vec::new()),
            queue_names: AtomicU64::new(0),
        })
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().expect("frames lock").clone()
    }

    /// Every method frame written so far, in order.
    pub fn methods(&self) -> Vec<Method> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame.body {
                FrameBody::Method(method) => Some(method),
                _ => None,
            })
            .collect()
    }

    pub fn method_kinds(&self) -> Vec<MethodKind> {
        self.methods().iter().map(Method::kind).collect()
    }

    pub fn count_kind(&self, kind: MethodKind) -> usize {
        self.method_kinds().iter().filter(|k| **k == kind).count()
    }

    pub fn clear_frames(&self) {
        self.frames.lock().expect("frames lock").clear();
    }

    pub fn closed_sessions(&self) -> Vec<ChannelId> {
        self.closed_sessions
            .lock()
            .expect("closed sessions lock")
            .clone()
    }

    /// The next sync_write of this request kind fails with the given error.
    pub fn fail_next(&self, kind: MethodKind, error: SessionError) {
        self.failures
            .lock()
            .expect("failures lock")
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    /// The next sync_write of this request kind gets the scripted reply.
    pub fn respond_next(&self, kind: MethodKind, reply: Method) {
        self.responses
            .lock()
            .expect("responses lock")
            .entry(kind)
            .or_default()
            .push_back(reply);
    }

    fn default_reply(request: &Method) -> Method {
        match request {
            Method::ExchangeDeclare { .. } => Method::ExchangeDeclareOk,
            Method::ExchangeBound { .. } => Method::ExchangeBoundOk {
                reply_code: 0,
                reply_text: String::new(),
            },
            Method::QueueDeclare { queue, .. } => Method::QueueDeclareOk {
                queue: queue.clone(),
                message_count: 0,
                consumer_count: 0,
            },
            Method::QueueBind { .. } => Method::QueueBindOk,
            Method::QueueDelete { .. } => Method::QueueDeleteOk { message_count: 0 },
            Method::BasicConsume { consumer_tag, .. } => Method::BasicConsumeOk {
                consumer_tag: *consumer_tag,
            },
            Method::BasicCancel { consumer_tag, .. } => Method::BasicCancelOk {
                consumer_tag: *consumer_tag,
            },
            Method::BasicRecover { .. } => Method::BasicRecoverOk,
            Method::TxSelect => Method::TxSelectOk,
            Method::TxCommit => Method::TxCommitOk,
            Method::TxRollback => Method::TxRollbackOk,
            Method::ChannelFlow { active } => Method::ChannelFlowOk { active: *active },
            Method::ChannelClose { .. } => Method::ChannelCloseOk,
            other => other.clone(),
        }
    }
}

#[async_trait]
impl ProtocolHandler for MockProtocol {
    fn write_frame(&self, frame: Frame) -> Result<()> {
        self.frames.lock().expect("frames lock").push(frame);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn sync_write(
        &self,
        frame: Frame,
        expected: MethodKind,
        _timeout: Option<Duration>,
    ) -> Result<Method> {
        let request = match frame.as_method() {
            Some(method) => method.clone(),
            None => {
                return Err(SessionError::Protocol(
                    "sync_write without a method frame".into(),
                ));
            }
        };
        self.frames.lock().expect("frames lock").push(frame);
        let kind = request.kind();
        if let Some(error) = self
            .failures
            .lock()
            .expect("failures lock")
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        let scripted = self
            .responses
            .lock()
            .expect("responses lock")
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);
        let reply = scripted.unwrap_or_else(|| Self::default_reply(&request));
        Ok(reply.expect_kind(expected)?)
    }

    fn close_session(&self, channel: ChannelId) {
        self.closed_sessions
            .lock()
            .expect("closed sessions lock")
            .push(channel);
    }

    fn generate_queue_name(&self) -> String {
        format!("tmp_{}", self.queue_names.fetch_add(1, Ordering::Relaxed))
    }

    fn protocol_version(&self) -> (u8, u8) {
        (0, 9)
    }
}

/// Captures errors delivered through the connection error callback.
#[derive(Clone, Default)]
pub struct ErrorSink {
    errors: Arc<StdMutex<Vec<AsyncError>>>,
}

impl ErrorSink {
    pub fn callback(&self) -> ErrorCallback {
        let errors = Arc::clone(&self.errors);
        Arc::new(move |error| {
            errors.lock().expect("error sink lock").push(error);
        })
    }

    pub fn take(&self) -> Vec<AsyncError> {
        std::mem::take(&mut *self.errors.lock().expect("error sink lock"))
    }

    pub fn len(&self) -> usize {
        self.errors.lock().expect("error sink lock").len()
    }
}

pub struct TestHarness {
    pub connection: ConnectionHandle,
    pub session: Session,
    pub mock: Arc<MockProtocol>,
    pub errors: ErrorSink,
}

pub async fn open_session(transacted: bool, ack_mode: AckMode) -> TestHarness {
    open_session_with(transacted, ack_mode, SessionSettings::default()).await
}

pub async fn open_session_with(
    transacted: bool,
    ack_mode: AckMode,
    settings: SessionSettings,
) -> TestHarness {
    let mock = MockProtocol::new();
    let errors = ErrorSink::default();
    let connection = ConnectionHandle::new("client-1", errors.callback());
    let session = Session::open(&connection, mock.clone(), 1, transacted, ack_mode, settings)
        .await
        .expect("open session");
    TestHarness {
        connection,
        session,
        mock,
        errors,
    }
}

pub fn deliver(session: &Session, consumer: &Consumer, delivery_tag: u64, payload: &'static [u8]) {
    deliver_redelivered(session, consumer, delivery_tag, payload, false);
}

pub fn deliver_redelivered(
    session: &Session,
    consumer: &Consumer,
    delivery_tag: u64,
    payload: &'static [u8],
    redelivered: bool,
) {
    let payload = Bytes::from_static(payload);
    let destination = consumer.destination();
    session.message_received(InboundMessage::Delivery(Delivery {
        consumer_tag: consumer.tag(),
        delivery_tag,
        redelivered,
        exchange: destination.exchange().to_string(),
        routing_key: destination.routing_key().to_string(),
        header: ContentHeader::for_payload(&payload, Default::default()),
        bodies: vec![payload],
    }));
}

/// Poll until the condition holds; panics after ~2 seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}
