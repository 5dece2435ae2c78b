// Bounded inbound FIFO with flow-control watermarks.
//
// Many network enqueues, exactly one Dispatcher dequeue. The watermark
// listener is invoked outside the internal lock so it may schedule
// suspension round-trips without deadlocking against the hot path.
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use tokio::sync::Notify;

/// Callback invoked when the queue depth crosses a watermark.
pub(crate) trait ThresholdListener: Send + Sync {
    fn above_threshold(&self, current: usize);
    fn under_threshold(&self, current: usize);
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub(crate) struct InboundQueue<T> {
    state: StdMutex<QueueState<T>>,
    notify: Notify,
    high: usize,
    low: usize,
    listener: Option<Box<dyn ThresholdListener>>,
}

impl<T> InboundQueue<T> {
    /// A queue with a high mark but no listener; backpressure comes from the
    /// broker-side prefetch window instead.
    pub(crate) fn bounded(high: usize) -> Self {
        Self {
            state: StdMutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            high,
            low: 0,
            listener: None,
        }
    }

    /// A queue that drives the listener on watermark crossings. Used by the
    /// no-acknowledge mode, where the broker has no prefetch window to lean
    /// on.
    pub(crate) fn with_listener(
        high: usize,
        low: usize,
        listener: Box<dyn ThresholdListener>,
    ) -> Self {
        Self {
            state: StdMutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            high,
            low,
            listener: Some(listener),
        }
    }

    /// Enqueue from the network task. Never blocks. The enqueue that crosses
    /// the high mark is retained, so the queue momentarily holds high+1
    /// items.
    pub(crate) fn push(&self, item: T) {
        let new_len = {
            let mut state = self.state.lock().expect("inbound queue lock");
            if state.closed {
                return;
            }
            state.items.push_back(item);
            state.items.len()
        };
        metrics::counter!("tern_session_inbound_enqueued_total").increment(1);
        metrics::gauge!("tern_session_inbound_depth").set(new_len as f64);
        self.notify.notify_one();
        if let Some(listener) = &self.listener
            && new_len == self.high + 1
        {
            listener.above_threshold(new_len);
        }
    }

    /// Dequeue for the single Dispatcher task. Returns `None` once the queue
    /// is closed and drained.
    pub(crate) async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            match self.try_pop() {
                Popped::Item(item) => return Some(item),
                Popped::Closed => return None,
                Popped::Empty => notified.await,
            }
        }
    }

    fn try_pop(&self) -> Popped<T> {
        let (item, new_len) = {
            let mut state = self.state.lock().expect("inbound queue lock");
            match state.items.pop_front() {
                Some(item) => {
                    let len = state.items.len();
                    (item, len)
                }
                None if state.closed => return Popped::Closed,
                None => return Popped::Empty,
            }
        };
        metrics::counter!("tern_session_inbound_dequeued_total").increment(1);
        metrics::gauge!("tern_session_inbound_depth").set(new_len as f64);
        if let Some(listener) = &self.listener
            && new_len == self.low
        {
            listener.under_threshold(new_len);
        }
        Popped::Item(item)
    }

    /// Remove every queued item matching the predicate, preserving the FIFO
    /// order of both the removed and the remaining items.
    pub(crate) fn drain_matching(&self, mut matches: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut state = self.state.lock().expect("inbound queue lock");
        let mut kept = VecDeque::with_capacity(state.items.len());
        let mut removed = Vec::new();
        for item in state.items.drain(..) {
            if matches(&item) {
                removed.push(item);
            } else {
                kept.push_back(item);
            }
        }
        state.items = kept;
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().expect("inbound queue lock").items.len()
    }

    /// Stop accepting items and wake the dispatcher so it can observe the
    /// closed state once the backlog drains.
    pub(crate) fn close(&self) {
        self.state.lock().expect("inbound queue lock").closed = true;
        self.notify.notify_one();
    }
}

enum Popped<T> {
    Item(T),
    Empty,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingListener {
        above: AtomicUsize,
        under: AtomicUsize,
    }

    impl ThresholdListener for Arc<RecordingListener> {
        fn above_threshold(&self, _current: usize) {
            self.above.fetch_add(1, Ordering::SeqCst);
        }

        fn under_threshold(&self, _current: usize) {
            self.under.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = InboundQueue::bounded(10);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn pop_waits_for_a_push() {
        let queue = Arc::new(InboundQueue::bounded(10));
        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(42);
        assert_eq!(popper.await.expect("join"), Some(42));
    }

    #[tokio::test]
    async fn above_threshold_fires_on_the_crossing_enqueue_only() {
        let listener = Arc::new(RecordingListener::default());
        let queue = InboundQueue::with_listener(2, 1, Box::new(Arc::clone(&listener)));
        queue.push(1);
        queue.push(2);
        assert_eq!(listener.above.load(Ordering::SeqCst), 0);
        queue.push(3); // crosses high=2; the crossing enqueue is retained
        assert_eq!(listener.above.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 3);
        queue.push(4); // beyond the crossing, no further callouts
        assert_eq!(listener.above.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn under_threshold_fires_when_depth_drops_to_low() {
        let listener = Arc::new(RecordingListener::default());
        let queue = InboundQueue::with_listener(3, 1, Box::new(Arc::clone(&listener)));
        for i in 0..4 {
            queue.push(i);
        }
        assert_eq!(queue.pop().await, Some(0)); // 3 left
        assert_eq!(queue.pop().await, Some(1)); // 2 left
        assert_eq!(listener.under.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pop().await, Some(2)); // 1 left, at low
        assert_eq!(listener.under.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_matching_keeps_remaining_order() {
        let queue = InboundQueue::bounded(10);
        for i in 0..6 {
            queue.push(i);
        }
        let removed = queue.drain_matching(|i| i % 2 == 0);
        assert_eq!(removed, vec![0, 2, 4]);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(3));
        assert_eq!(queue.pop().await, Some(5));
    }

    #[tokio::test]
    async fn close_wakes_and_drains() {
        let queue = Arc::new(InboundQueue::<u32>::bounded(10));
        queue.push(1);
        queue.close();
        queue.push(2); // dropped after close
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
    }
}
