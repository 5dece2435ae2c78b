// Consumer and producer registries.
//
// Lookup by tag/id is the hot path (one per dispatched delivery), so it goes
// through a concurrent map; a separate order list preserves creation order
// for resubscription after fail-over.
use dashmap::DashMap;
use std::sync::Mutex as StdMutex;

use crate::consumer::Consumer;
use crate::delivery::ConsumerTag;
use crate::destination::Destination;
use crate::producer::{Producer, ProducerId};

#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    by_tag: DashMap<ConsumerTag, Consumer>,
    order: StdMutex<Vec<ConsumerTag>>,
    destination_counts: DashMap<Destination, usize>,
}

impl ConsumerRegistry {
    /// Register before the subscribe frame goes out, so deliveries racing the
    /// consume-ok still find their consumer.
    pub(crate) fn insert(&self, consumer: Consumer) {
        let tag = consumer.tag();
        self.by_tag.insert(tag, consumer);
        self.order.lock().expect("consumer order lock").push(tag);
    }

    /// Idempotent removal; the second remove of a tag is a no-op.
    pub(crate) fn remove(&self, tag: ConsumerTag) -> Option<Consumer> {
        let removed = self.by_tag.remove(&tag).map(|(_, consumer)| consumer);
        if removed.is_some() {
            self.order
                .lock()
                .expect("consumer order lock")
                .retain(|t| *t != tag);
        }
        removed
    }

    pub(crate) fn get(&self, tag: ConsumerTag) -> Option<Consumer> {
        self.by_tag.get(&tag).map(|entry| entry.value().clone())
    }

    pub(crate) fn snapshot_ordered(&self) -> Vec<Consumer> {
        let order = self.order.lock().expect("consumer order lock").clone();
        order
            .into_iter()
            .filter_map(|tag| self.get(tag))
            .collect()
    }

    /// Empty the registry, handing back consumers in creation order so
    /// resubscription can re-register each one. Destination counts are left
    /// alone: the consumers themselves survive the fail-over.
    pub(crate) fn drain_for_resubscribe(&self) -> Vec<Consumer> {
        let order = std::mem::take(&mut *self.order.lock().expect("consumer order lock"));
        order
            .into_iter()
            .filter_map(|tag| self.by_tag.remove(&tag).map(|(_, consumer)| consumer))
            .collect()
    }

    pub(crate) fn add_destination(&self, destination: &Destination) {
        *self
            .destination_counts
            .entry(destination.clone())
            .or_insert(0) += 1;
    }

    pub(crate) fn remove_destination(&self, destination: &Destination) {
        if let Some(mut entry) = self.destination_counts.get_mut(destination) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                drop(entry);
                self.destination_counts
                    .remove_if(destination, |_, count| *count == 0);
            }
        }
    }

    /// Empty the registry for session close, dropping destination counts
    /// with it.
    pub(crate) fn drain_all(&self) -> Vec<Consumer> {
        let consumers = self.drain_for_resubscribe();
        self.destination_counts.clear();
        consumers
    }

    pub(crate) fn has_consumer(&self, destination: &Destination) -> bool {
        self.destination_counts
            .get(destination)
            .is_some_and(|count| *count > 0)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_tag.len()
    }
}

#[derive(Default)]
pub(crate) struct ProducerRegistry {
    by_id: DashMap<ProducerId, Producer>,
    order: StdMutex<Vec<ProducerId>>,
}

impl ProducerRegistry {
    pub(crate) fn insert(&self, producer: Producer) {
        let id = producer.id();
        self.by_id.insert(id, producer);
        self.order.lock().expect("producer order lock").push(id);
    }

    pub(crate) fn remove(&self, id: ProducerId) -> Option<Producer> {
        let removed = self.by_id.remove(&id).map(|(_, producer)| producer);
        if removed.is_some() {
            self.order
                .lock()
                .expect("producer order lock")
                .retain(|p| *p != id);
        }
        removed
    }

    pub(crate) fn snapshot_ordered(&self) -> Vec<Producer> {
        let order = self.order.lock().expect("producer order lock").clone();
        order
            .into_iter()
            .filter_map(|id| self.by_id.get(&id).map(|entry| entry.value().clone()))
            .collect()
    }

    pub(crate) fn clear(&self) -> Vec<Producer> {
        let order = std::mem::take(&mut *self.order.lock().expect("producer order lock"));
        order
            .into_iter()
            .filter_map(|id| self.by_id.remove(&id).map(|(_, producer)| producer))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}
