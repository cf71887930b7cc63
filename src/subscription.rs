//! Per-agent subscription storage.
//!
//! Storage is the single source of truth for subscription existence. It is
//! keyed by `(mbox_id, msg_type, state)` and drives the corresponding mbox
//! subscribe/unsubscribe calls on the first insert and last removal of a
//! `(mbox, type)` pair. Four interchangeable implementations exist with
//! identical semantics; the adaptive one migrates between a vector and a
//! hash map as the subscription count crosses a threshold.

use crate::agent::{AgentContext, State, StateId};
use crate::mbox::{MboxId, MboxRef};
use crate::message::Envelope;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Thread-safety hint of an event handler.
///
/// A `Safe` handler may run concurrently with other safe handlers of the
/// same agent on the adv-thread-pool dispatcher; an `Exclusive` handler
/// always owns the agent alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadSafety {
    Exclusive,
    Safe,
}

type ExclusiveFn = Box<dyn Fn(&mut dyn Any, &AgentContext, &Envelope) + Send + Sync>;
type SharedFn = Box<dyn Fn(&dyn Any, &AgentContext, &Envelope) + Send + Sync>;

pub(crate) enum HandlerAction {
    /// Ordinary handler: exclusive access to the agent.
    Exclusive(ExclusiveFn),
    /// Thread-safe handler: shared access to the agent.
    Shared(SharedFn),
    /// Switch state and search for the handler again in the new state.
    TransferTo(State),
    /// Switch state; the event itself is consumed.
    JustSwitchTo(State),
}

pub(crate) struct EventHandler {
    pub(crate) action: HandlerAction,
}

impl EventHandler {
    pub(crate) fn thread_safety(&self) -> ThreadSafety {
        match self.action {
            HandlerAction::Shared(_) => ThreadSafety::Safe,
            _ => ThreadSafety::Exclusive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SubscrKey {
    pub mbox_id: MboxId,
    pub type_id: TypeId,
    pub state: StateId,
}

#[derive(Clone)]
pub(crate) struct SubscriptionRecord {
    pub key: SubscrKey,
    pub mbox: MboxRef,
    pub type_name: &'static str,
    pub handler: Arc<EventHandler>,
}

pub(crate) trait SubscriptionStorage: Send {
    /// Inserts a record; the caller guarantees the key is not present.
    fn insert(&mut self, record: SubscriptionRecord);

    fn remove(&mut self, key: &SubscrKey) -> Option<SubscriptionRecord>;

    /// Removes the subscriptions of every state for `(mbox, type)`.
    fn remove_all_states(&mut self, mbox_id: MboxId, type_id: TypeId) -> Vec<SubscriptionRecord>;

    fn find(&self, key: &SubscrKey) -> Option<&SubscriptionRecord>;

    fn has(&self, key: &SubscrKey) -> bool {
        self.find(key).is_some()
    }

    /// Number of states subscribed for `(mbox, type)`.
    fn count_for_type(&self, mbox_id: MboxId, type_id: TypeId) -> usize;

    fn len(&self) -> usize;

    /// Removes and returns everything.
    fn drain(&mut self) -> Vec<SubscriptionRecord>;

    /// Bulk import, the counterpart of [`SubscriptionStorage::drain`].
    fn setup_content(&mut self, records: Vec<SubscriptionRecord>) {
        for record in records {
            self.insert(record);
        }
    }
}

/// Selects the subscription-storage implementation for an agent.
#[derive(Debug, Clone, Copy)]
pub enum StorageFactory {
    /// Linear scan over a vector; best for a handful of subscriptions.
    Vector { initial_capacity: usize },
    /// Ordered tree map.
    Map,
    /// Unordered hash map.
    Hash,
    /// Starts as a vector, becomes a hash map above `threshold`
    /// subscriptions and shrinks back below half of it.
    Adaptive { threshold: usize },
}

impl Default for StorageFactory {
    fn default() -> Self {
        Self::Adaptive { threshold: 8 }
    }
}

impl StorageFactory {
    pub(crate) fn create(&self) -> Box<dyn SubscriptionStorage> {
        match *self {
            Self::Vector { initial_capacity } => Box::new(VectorStorage {
                records: Vec::with_capacity(initial_capacity),
            }),
            Self::Map => Box::new(MapStorage {
                records: BTreeMap::new(),
            }),
            Self::Hash => Box::new(HashStorage {
                records: HashMap::new(),
            }),
            Self::Adaptive { threshold } => Box::new(AdaptiveStorage {
                threshold: threshold.max(1),
                inner: AdaptiveInner::Vector(VectorStorage {
                    records: Vec::new(),
                }),
            }),
        }
    }
}

struct VectorStorage {
    records: Vec<SubscriptionRecord>,
}

impl SubscriptionStorage for VectorStorage {
    fn insert(&mut self, record: SubscriptionRecord) {
        self.records.push(record);
    }

    fn remove(&mut self, key: &SubscrKey) -> Option<SubscriptionRecord> {
        let idx = self.records.iter().position(|r| r.key == *key)?;
        Some(self.records.swap_remove(idx))
    }

    fn remove_all_states(&mut self, mbox_id: MboxId, type_id: TypeId) -> Vec<SubscriptionRecord> {
        let mut removed = Vec::new();
        let mut idx = 0;
        while idx < self.records.len() {
            let r = &self.records[idx];
            if r.key.mbox_id == mbox_id && r.key.type_id == type_id {
                removed.push(self.records.swap_remove(idx));
            } else {
                idx += 1;
            }
        }
        removed
    }

    fn find(&self, key: &SubscrKey) -> Option<&SubscriptionRecord> {
        self.records.iter().find(|r| r.key == *key)
    }

    fn count_for_type(&self, mbox_id: MboxId, type_id: TypeId) -> usize {
        self.records
            .iter()
            .filter(|r| r.key.mbox_id == mbox_id && r.key.type_id == type_id)
            .count()
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn drain(&mut self) -> Vec<SubscriptionRecord> {
        std::mem::take(&mut self.records)
    }
}

struct MapStorage {
    records: BTreeMap<SubscrKey, SubscriptionRecord>,
}

impl SubscriptionStorage for MapStorage {
    fn insert(&mut self, record: SubscriptionRecord) {
        self.records.insert(record.key, record);
    }

    fn remove(&mut self, key: &SubscrKey) -> Option<SubscriptionRecord> {
        self.records.remove(key)
    }

    fn remove_all_states(&mut self, mbox_id: MboxId, type_id: TypeId) -> Vec<SubscriptionRecord> {
        let keys: Vec<SubscrKey> = self
            .records
            .keys()
            .filter(|k| k.mbox_id == mbox_id && k.type_id == type_id)
            .copied()
            .collect();
        keys.iter()
            .filter_map(|k| self.records.remove(k))
            .collect()
    }

    fn find(&self, key: &SubscrKey) -> Option<&SubscriptionRecord> {
        self.records.get(key)
    }

    fn count_for_type(&self, mbox_id: MboxId, type_id: TypeId) -> usize {
        self.records
            .keys()
            .filter(|k| k.mbox_id == mbox_id && k.type_id == type_id)
            .count()
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn drain(&mut self) -> Vec<SubscriptionRecord> {
        let records = std::mem::take(&mut self.records);
        records.into_values().collect()
    }
}

struct HashStorage {
    records: HashMap<SubscrKey, SubscriptionRecord>,
}

impl SubscriptionStorage for HashStorage {
    fn insert(&mut self, record: SubscriptionRecord) {
        self.records.insert(record.key, record);
    }

    fn remove(&mut self, key: &SubscrKey) -> Option<SubscriptionRecord> {
        self.records.remove(key)
    }

    fn remove_all_states(&mut self, mbox_id: MboxId, type_id: TypeId) -> Vec<SubscriptionRecord> {
        let keys: Vec<SubscrKey> = self
            .records
            .keys()
            .filter(|k| k.mbox_id == mbox_id && k.type_id == type_id)
            .copied()
            .collect();
        keys.iter()
            .filter_map(|k| self.records.remove(k))
            .collect()
    }

    fn find(&self, key: &SubscrKey) -> Option<&SubscriptionRecord> {
        self.records.get(key)
    }

    fn count_for_type(&self, mbox_id: MboxId, type_id: TypeId) -> usize {
        self.records
            .keys()
            .filter(|k| k.mbox_id == mbox_id && k.type_id == type_id)
            .count()
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn drain(&mut self) -> Vec<SubscriptionRecord> {
        let records = std::mem::take(&mut self.records);
        records.into_values().collect()
    }
}

enum AdaptiveInner {
    Vector(VectorStorage),
    Hash(HashStorage),
}

struct AdaptiveStorage {
    threshold: usize,
    inner: AdaptiveInner,
}

impl AdaptiveStorage {
    fn active(&self) -> &dyn SubscriptionStorage {
        match &self.inner {
            AdaptiveInner::Vector(s) => s,
            AdaptiveInner::Hash(s) => s,
        }
    }

    fn active_mut(&mut self) -> &mut dyn SubscriptionStorage {
        match &mut self.inner {
            AdaptiveInner::Vector(s) => s,
            AdaptiveInner::Hash(s) => s,
        }
    }

    fn rebalance(&mut self) {
        let len = self.active().len();
        match &mut self.inner {
            AdaptiveInner::Vector(s) if len > self.threshold => {
                let mut hash = HashStorage {
                    records: HashMap::with_capacity(len),
                };
                for record in s.drain() {
                    hash.insert(record);
                }
                self.inner = AdaptiveInner::Hash(hash);
            }
            AdaptiveInner::Hash(s) if len <= self.threshold / 2 => {
                let mut vector = VectorStorage {
                    records: Vec::with_capacity(len),
                };
                for record in s.drain() {
                    vector.insert(record);
                }
                self.inner = AdaptiveInner::Vector(vector);
            }
            _ => {}
        }
    }
}

impl SubscriptionStorage for AdaptiveStorage {
    fn insert(&mut self, record: SubscriptionRecord) {
        self.active_mut().insert(record);
        self.rebalance();
    }

    fn remove(&mut self, key: &SubscrKey) -> Option<SubscriptionRecord> {
        let removed = self.active_mut().remove(key);
        self.rebalance();
        removed
    }

    fn remove_all_states(&mut self, mbox_id: MboxId, type_id: TypeId) -> Vec<SubscriptionRecord> {
        let removed = self.active_mut().remove_all_states(mbox_id, type_id);
        self.rebalance();
        removed
    }

    fn find(&self, key: &SubscrKey) -> Option<&SubscriptionRecord> {
        self.active().find(key)
    }

    fn count_for_type(&self, mbox_id: MboxId, type_id: TypeId) -> usize {
        self.active().count_for_type(mbox_id, type_id)
    }

    fn len(&self) -> usize {
        self.active().len()
    }

    fn drain(&mut self) -> Vec<SubscriptionRecord> {
        self.active_mut().drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::WeakEnv;
    use crate::mbox::MpmcMbox;
    use crate::trace::MboxTracing;

    struct Msg;

    fn record(mbox_id: MboxId, state: StateId) -> SubscriptionRecord {
        let mbox: MboxRef = Arc::new(MpmcMbox::new(
            mbox_id,
            None,
            WeakEnv::dangling(),
            MboxTracing::disabled(),
        ));
        SubscriptionRecord {
            key: SubscrKey {
                mbox_id,
                type_id: TypeId::of::<Msg>(),
                state,
            },
            mbox,
            type_name: std::any::type_name::<Msg>(),
            handler: Arc::new(EventHandler {
                action: HandlerAction::JustSwitchTo(State::default_state()),
            }),
        }
    }

    fn factories() -> Vec<StorageFactory> {
        vec![
            StorageFactory::Vector {
                initial_capacity: 4,
            },
            StorageFactory::Map,
            StorageFactory::Hash,
            StorageFactory::Adaptive { threshold: 2 },
        ]
    }

    #[test]
    fn insert_find_remove_across_implementations() {
        for factory in factories() {
            let mut storage = factory.create();
            let rec = record(1, 0);
            let key = rec.key;
            storage.insert(rec);
            storage.insert(record(1, 3));
            storage.insert(record(2, 0));

            assert_eq!(storage.len(), 3);
            assert!(storage.has(&key));
            assert_eq!(storage.count_for_type(1, TypeId::of::<Msg>()), 2);

            assert!(storage.remove(&key).is_some());
            assert!(!storage.has(&key));
            assert!(storage.remove(&key).is_none());
            assert_eq!(storage.count_for_type(1, TypeId::of::<Msg>()), 1);
        }
    }

    #[test]
    fn remove_all_states_clears_the_pair() {
        for factory in factories() {
            let mut storage = factory.create();
            storage.insert(record(1, 0));
            storage.insert(record(1, 5));
            storage.insert(record(2, 0));

            let removed = storage.remove_all_states(1, TypeId::of::<Msg>());
            assert_eq!(removed.len(), 2);
            assert_eq!(storage.len(), 1);
            assert_eq!(storage.count_for_type(1, TypeId::of::<Msg>()), 0);
        }
    }

    #[test]
    fn adaptive_storage_migrates_and_back() {
        let mut storage = StorageFactory::Adaptive { threshold: 2 }.create();
        for state in 0..4 {
            storage.insert(record(1, state));
        }
        assert_eq!(storage.len(), 4);

        for state in 0..3 {
            let key = SubscrKey {
                mbox_id: 1,
                type_id: TypeId::of::<Msg>(),
                state,
            };
            assert!(storage.remove(&key).is_some());
        }
        assert_eq!(storage.len(), 1);
        assert!(storage.has(&SubscrKey {
            mbox_id: 1,
            type_id: TypeId::of::<Msg>(),
            state: 3,
        }));
    }
}
