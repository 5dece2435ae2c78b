// Durable-subscription catalog.
//
// Name -> consumer and consumer -> name are one bidirectional relation under
// a single lock, so concurrent unsubscribe cannot observe the two directions
// out of step.
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use crate::delivery::ConsumerTag;
use crate::destination::Destination;

#[derive(Debug, Clone)]
pub(crate) struct SubscriptionEntry {
    pub(crate) consumer_tag: ConsumerTag,
    pub(crate) topic: Destination,
}

#[derive(Default)]
struct CatalogState {
    by_name: HashMap<String, SubscriptionEntry>,
    by_tag: HashMap<ConsumerTag, String>,
}

#[derive(Default)]
pub(crate) struct SubscriptionCatalog {
    state: StdMutex<CatalogState>,
}

impl SubscriptionCatalog {
    pub(crate) fn insert(&self, name: &str, consumer_tag: ConsumerTag, topic: Destination) {
        let mut state = self.state.lock().expect("subscription catalog lock");
        if let Some(previous) = state.by_name.insert(
            name.to_string(),
            SubscriptionEntry {
                consumer_tag,
                topic,
            },
        ) {
            state.by_tag.remove(&previous.consumer_tag);
        }
        state.by_tag.insert(consumer_tag, name.to_string());
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<SubscriptionEntry> {
        self.state
            .lock()
            .expect("subscription catalog lock")
            .by_name
            .get(name)
            .cloned()
    }

    pub(crate) fn remove_by_name(&self, name: &str) -> Option<SubscriptionEntry> {
        let mut state = self.state.lock().expect("subscription catalog lock");
        let entry = state.by_name.remove(name)?;
        state.by_tag.remove(&entry.consumer_tag);
        Some(entry)
    }

    pub(crate) fn remove_by_tag(&self, tag: ConsumerTag) -> Option<String> {
        let mut state = self.state.lock().expect("subscription catalog lock");
        let name = state.by_tag.remove(&tag)?;
        state.by_name.remove(&name);
        Some(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.state
            .lock()
            .expect("subscription catalog lock")
            .by_name
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup_round_trip() {
        let catalog = SubscriptionCatalog::default();
        let topic = Destination::topic("market.ticks");
        catalog.insert("ticks", ConsumerTag(3), topic.clone());
        let entry = catalog.lookup("ticks").expect("entry");
        assert_eq!(entry.consumer_tag, ConsumerTag(3));
        assert_eq!(entry.topic, topic);
    }

    #[test]
    fn removal_by_either_side_clears_both() {
        let catalog = SubscriptionCatalog::default();
        catalog.insert("a", ConsumerTag(1), Destination::topic("t1"));
        catalog.insert("b", ConsumerTag(2), Destination::topic("t2"));

        assert_eq!(catalog.remove_by_tag(ConsumerTag(1)).as_deref(), Some("a"));
        assert!(catalog.lookup("a").is_none());
        assert!(catalog.remove_by_tag(ConsumerTag(1)).is_none());

        assert!(catalog.remove_by_name("b").is_some());
        assert!(catalog.remove_by_tag(ConsumerTag(2)).is_none());
        assert_eq!(catalog.len(), 0);
    }

    #[test]
    fn reinserting_a_name_replaces_the_old_consumer_mapping() {
        let catalog = SubscriptionCatalog::default();
        catalog.insert("ticks", ConsumerTag(1), Destination::topic("t"));
        catalog.insert("ticks", ConsumerTag(9), Destination::topic("t"));
        assert_eq!(catalog.len(), 1);
        assert!(catalog.remove_by_tag(ConsumerTag(1)).is_none());
        assert_eq!(
            catalog.remove_by_tag(ConsumerTag(9)).as_deref(),
            Some("ticks")
        );
    }
}
