// Message producer: content frames with mandatory/immediate flags.
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tern_wire::BasicProperties;

use crate::destination::Destination;
use crate::error::{Result, SessionError};
use crate::session::SessionShared;

/// Session-local producer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProducerId(pub u64);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-producer knobs. Mandatory defaults on so the broker bounces rather
/// than drops unroutable publishes.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub mandatory: bool,
    pub immediate: bool,
    pub wait_until_sent: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            mandatory: crate::config::DEFAULT_MANDATORY,
            immediate: crate::config::DEFAULT_IMMEDIATE,
            wait_until_sent: false,
        }
    }
}

struct ProducerInner {
    id: ProducerId,
    destination: Destination,
    mandatory: bool,
    immediate: bool,
    wait_until_sent: bool,
    transacted: bool,
    session: Weak<SessionShared>,
    closed: AtomicBool,
}

/// A sender bound to one destination on a session.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    pub(crate) fn new(
        session: &Arc<SessionShared>,
        id: ProducerId,
        destination: Destination,
        options: ProducerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                id,
                destination,
                mandatory: options.mandatory,
                immediate: options.immediate,
                wait_until_sent: options.wait_until_sent,
                transacted: session.is_transacted(),
                session: Arc::downgrade(session),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ProducerId {
        self.inner.id
    }

    pub fn destination(&self) -> &Destination {
        &self.inner.destination
    }

    pub fn is_mandatory(&self) -> bool {
        self.inner.mandatory
    }

    pub fn is_immediate(&self) -> bool {
        self.inner.immediate
    }

    pub fn is_transacted(&self) -> bool {
        self.inner.transacted
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.send_with_properties(payload, BasicProperties::default())
            .await
    }

    /// Publish one message: a publish method frame, a content header, and
    /// the body.
    pub async fn send_with_properties(
        &self,
        payload: Bytes,
        properties: BasicProperties,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let session = self.session()?;
        session.check_not_closed()?;
        session.publish_frames(
            &self.inner.destination,
            payload,
            properties,
            self.inner.mandatory,
            self.inner.immediate,
        )?;
        if self.inner.wait_until_sent {
            session.flush().await?;
        }
        Ok(())
    }

    /// Producer close involves no broker traffic.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel)
            && let Some(session) = self.inner.session.upgrade()
        {
            session.deregister_producer(self.inner.id);
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Declare the destination exchange, fire-and-forget. Issued at creation
    /// and again during resubscription after fail-over.
    pub(crate) fn redeclare(&self, session: &SessionShared) -> Result<()> {
        session.declare_exchange_nowait(&self.inner.destination)
    }

    fn session(&self) -> Result<Arc<SessionShared>> {
        self.inner.session.upgrade().ok_or(SessionError::Closed)
    }
}
