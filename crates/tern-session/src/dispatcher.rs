// Single-task cooperative loop draining the inbound queue and routing each
// delivery to its consumer.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{Mutex as TokioMutex, watch};
use tracing::{debug, info};

use crate::consumer::Consumer;
use crate::delivery::Delivery;
use crate::queue::InboundQueue;
use crate::session::SessionShared;

tokio::task_local! {
    static IN_DISPATCH: bool;
}

/// Whether the current task is the dispatcher mid-dispatch. Rollback driven
/// from inside a listener callback must not re-acquire the dispatcher lock
/// its own task already holds.
pub(crate) fn in_dispatch() -> bool {
    IN_DISPATCH.try_with(|flag| *flag).unwrap_or(false)
}

struct DispatcherShared {
    // Serializes dispatch of one delivery with stop/start and rollback-mark
    // updates.
    lock: TokioMutex<()>,
    stopped: watch::Sender<bool>,
    closed: AtomicBool,
    rollback_mark: AtomicI64,
}

#[derive(Clone)]
pub(crate) struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

impl Dispatcher {
    /// Spawn the dispatcher task. It starts stopped when the owning
    /// connection has not been started yet.
    pub(crate) fn spawn(
        session: &Arc<SessionShared>,
        queue: Arc<InboundQueue<Delivery>>,
        initially_stopped: bool,
    ) -> Self {
        let (stopped, _) = watch::channel(initially_stopped);
        let shared = Arc::new(DispatcherShared {
            lock: TokioMutex::new(()),
            stopped,
            closed: AtomicBool::new(false),
            rollback_mark: AtomicI64::new(-1),
        });
        let task_shared = Arc::clone(&shared);
        let weak = Arc::downgrade(session);
        let channel = session.channel_id();
        tokio::spawn(async move {
            info!(channel, "dispatcher started");
            run(weak, queue, task_shared).await;
            info!(channel, "dispatcher terminating");
        });
        Self { shared }
    }

    /// Flip the stopped state, waking the loop, and report the prior state.
    pub(crate) fn set_connection_stopped(&self, stopped: bool) -> bool {
        let previous = self.shared.stopped.send_replace(stopped);
        debug!(stopped, previous, "dispatcher stop state changed");
        previous
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.shared.stopped.borrow()
    }

    /// Terminal: wake the loop so it can observe the closed flag.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.stopped.send_replace(false);
    }

    /// Stop, mark every delivery up to the highest seen tag for
    /// reject-requeue, roll each consumer back locally, then restore the
    /// prior stop state.
    pub(crate) async fn rollback(&self, session: &Arc<SessionShared>) {
        if in_dispatch() {
            self.rollback_locked(session);
        } else {
            let _guard = self.shared.lock.lock().await;
            self.rollback_locked(session);
        }
    }

    fn rollback_locked(&self, session: &Arc<SessionShared>) {
        let was_stopped = self.set_connection_stopped(true);
        let mark = session.highest_delivery_tag();
        self.shared.rollback_mark.store(mark, Ordering::SeqCst);
        debug!(mark, "pre-dispatch queue marked for rollback");
        for consumer in session.consumers().snapshot_ordered() {
            if consumer.is_no_consume() {
                consumer.clear_receive_queue();
            } else {
                consumer.rollback(session);
            }
        }
        self.set_connection_stopped(was_stopped);
    }

    /// The rollback pattern scoped to one consumer: stop, requeue its
    /// buffered and pending deliveries, mark it closed, restore.
    pub(crate) async fn reject_pending(&self, session: &Arc<SessionShared>, consumer: &Consumer) {
        if in_dispatch() {
            self.reject_pending_locked(session, consumer);
        } else {
            let _guard = self.shared.lock.lock().await;
            self.reject_pending_locked(session, consumer);
        }
    }

    fn reject_pending_locked(&self, session: &Arc<SessionShared>, consumer: &Consumer) {
        let was_stopped = self.set_connection_stopped(true);
        // Pre-receive queue first, then the pre-dispatch queue.
        consumer.rollback(session);
        let tag = consumer.tag();
        let pending = session
            .queue()
            .drain_matching(|delivery| delivery.consumer_tag == tag);
        if !pending.is_empty() {
            info!(consumer_tag = %tag, count = pending.len(), "requeueing pending deliveries for cancelled consumer");
        }
        for delivery in pending {
            session.reject_message(delivery.delivery_tag, true);
        }
        consumer.mark_closed();
        self.set_connection_stopped(was_stopped);
    }
}

async fn run(
    session: std::sync::Weak<SessionShared>,
    queue: Arc<InboundQueue<Delivery>>,
    shared: Arc<DispatcherShared>,
) {
    let mut stopped_rx = shared.stopped.subscribe();
    loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        // A session may start stopped; wait to be started.
        if *stopped_rx.borrow_and_update() {
            if stopped_rx.changed().await.is_err() {
                break;
            }
            continue;
        }
        let Some(delivery) = queue.pop().await else {
            break;
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        deliver_one(&session, &shared, &mut stopped_rx, delivery).await;
    }
}

async fn deliver_one(
    session: &Arc<SessionShared>,
    shared: &Arc<DispatcherShared>,
    stopped_rx: &mut watch::Receiver<bool>,
    delivery: Delivery,
) {
    let mut delivery = Some(delivery);
    loop {
        if shared.closed.load(Ordering::Acquire) {
            // Session is closing; drop rather than reject.
            return;
        }
        if *stopped_rx.borrow_and_update() {
            if stopped_rx.changed().await.is_err() {
                return;
            }
            continue;
        }
        let guard = shared.lock.lock().await;
        if *stopped_rx.borrow() {
            drop(guard);
            continue;
        }
        let Some(delivery) = delivery.take() else {
            return;
        };
        IN_DISPATCH
            .scope(true, async {
                if (delivery.delivery_tag as i64) <= shared.rollback_mark.load(Ordering::SeqCst) {
                    metrics::counter!("tern_session_rolled_back_total").increment(1);
                    session.reject_message(delivery.delivery_tag, true);
                } else {
                    let _delivery_guard = session.message_delivery_lock().lock().await;
                    let closing = shared.closed.load(Ordering::Acquire);
                    session.dispatch_delivery(delivery, closing).await;
                }
            })
            .await;
        return;
    }
}
