// Connection-scope collaborators shared by every session on a connection:
// the fail-over mutex and epoch, the ordered work queue, and the error
// callback sink.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tern_wire::ChannelId;
use tokio::sync::{Mutex as TokioMutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{AsyncError, Result};
use crate::session::SessionShared;

/// Connection-level sink for asynchronous errors: bounces, server-initiated
/// closes, transport failures fail-over cannot mask.
pub type ErrorCallback = Arc<dyn Fn(AsyncError) + Send + Sync>;

type WorkItem = Pin<Box<dyn Future<Output = ()> + Send>>;

struct ConnectionInner {
    client_id: String,
    // Held during every protocol round-trip and during fail-over itself, so
    // a running round-trip either completes before fail-over or is cleanly
    // rewound.
    failover_mutex: TokioMutex<()>,
    // Bumped once resubscription after a fail-over has completed; retrying
    // guards wait on this.
    epoch_tx: watch::Sender<u64>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    on_error: ErrorCallback,
    started: AtomicBool,
    sessions: StdMutex<Vec<(ChannelId, Weak<SessionShared>)>>,
}

/// Handle to the connection scope a session lives in. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    /// Create the connection scope and spawn its work task. Suspension
    /// toggles and bounce handling run on that single task, in order.
    pub fn new(client_id: impl Into<String>, on_error: ErrorCallback) -> Self {
        let (work_tx, mut work_rx) = mpsc::unbounded_channel::<WorkItem>();
        tokio::spawn(async move {
            while let Some(item) = work_rx.recv().await {
                item.await;
            }
            debug!("connection work task drained");
        });
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(ConnectionInner {
                client_id: client_id.into(),
                failover_mutex: TokioMutex::new(()),
                epoch_tx,
                work_tx,
                on_error,
                started: AtomicBool::new(false),
                sessions: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Start message delivery on every session of this connection.
    pub async fn start(&self) -> Result<()> {
        self.inner.started.store(true, Ordering::Release);
        for session in self.live_sessions() {
            session.start().await?;
        }
        Ok(())
    }

    /// Stop message delivery on every session of this connection.
    pub async fn stop(&self) -> Result<()> {
        self.inner.started.store(false, Ordering::Release);
        for session in self.live_sessions() {
            session.stop().await?;
        }
        Ok(())
    }

    /// Rebuild every session after the transport reconnected: re-declare,
    /// re-bind and re-subscribe in original creation order, then release any
    /// guard waiting for the new epoch.
    ///
    /// The fail-over mutex is held for the whole rebuild.
    pub async fn failover_rebuild(&self) -> Result<()> {
        let _guard = self.inner.failover_mutex.lock().await;
        let sessions = self.live_sessions();
        info!(sessions = sessions.len(), "resubscribing after fail-over");
        for session in sessions {
            if session.is_closed() {
                continue;
            }
            session.resubscribe().await?;
        }
        self.inner.epoch_tx.send_modify(|epoch| *epoch += 1);
        Ok(())
    }

    pub(crate) fn failover_mutex(&self) -> &TokioMutex<()> {
        &self.inner.failover_mutex
    }

    pub(crate) fn epoch_receiver(&self) -> watch::Receiver<u64> {
        self.inner.epoch_tx.subscribe()
    }

    pub(crate) fn enqueue_work(&self, work: impl Future<Output = ()> + Send + 'static) {
        if self.inner.work_tx.send(Box::pin(work)).is_err() {
            warn!("connection work task is gone; dropping work item");
        }
    }

    pub(crate) fn report_error(&self, error: AsyncError) {
        (self.inner.on_error)(error);
    }

    pub(crate) fn register_session(&self, channel: ChannelId, session: Weak<SessionShared>) {
        self.inner
            .sessions
            .lock()
            .expect("session list lock")
            .push((channel, session));
    }

    pub(crate) fn deregister_session(&self, channel: ChannelId) {
        self.inner
            .sessions
            .lock()
            .expect("session list lock")
            .retain(|(id, _)| *id != channel);
    }

    fn live_sessions(&self) -> Vec<Arc<SessionShared>> {
        self.inner
            .sessions
            .lock()
            .expect("session list lock")
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop_callback() -> ErrorCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn work_items_run_in_submission_order() {
        let connection = ConnectionHandle::new("client", noop_callback());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..4 {
            let seen = Arc::clone(&seen);
            connection.enqueue_work(async move {
                seen.lock().expect("seen lock").push(i);
            });
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().expect("seen lock"), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn epoch_bump_releases_waiters() {
        let connection = ConnectionHandle::new("client", noop_callback());
        let mut rx = connection.epoch_receiver();
        let waiter = tokio::spawn(async move { rx.changed().await.is_ok() });
        tokio::task::yield_now().await;
        connection.failover_rebuild().await.expect("rebuild");
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn error_callback_receives_reported_errors() {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = Arc::clone(&count);
        let connection = ConnectionHandle::new(
            "client",
            Arc::new(move |_| {
                cb_count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        connection.report_error(AsyncError::SessionClosed {
            channel: 1,
            reason: "broker shutdown".into(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
