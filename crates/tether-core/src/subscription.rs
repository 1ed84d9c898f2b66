//! Subscription bookkeeping shared by both peers.
//!
//! The server keeps one table mapping `(instance, event)` to the client
//! handler ids subscribed there; the client keeps one mapping the same keys to
//! its local handlers. Both need the same properties: insertion order is
//! delivery order, re-adding is a no-op and removing an absent key is a no-op.

use crate::config::ProtocolConfig;
use crate::protocol::HandlerId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// Identifies one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub instance_id: Uuid,
    pub event_name: String,
    pub handler_id: HandlerId,
}

impl SubscriptionKey {
    pub fn new(instance_id: Uuid, event_name: impl Into<String>, handler_id: HandlerId) -> Self {
        Self {
            instance_id,
            event_name: event_name.into(),
            handler_id,
        }
    }

    /// Derive the key for a client-side handler.
    ///
    /// The handler id is a hash of the instance, interface, event and a
    /// caller-chosen handler identity, so subscribing the same handler twice
    /// yields the same id. It is never the liveness sentinel.
    pub fn for_handler(instance_id: Uuid, interface: &str, event: &str, identity: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(instance_id.as_bytes());
        for part in [interface, event, identity] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        let mut handler_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if handler_id == ProtocolConfig::LIVENESS_HANDLER_ID {
            handler_id = 1;
        }
        Self::new(instance_id, event, handler_id)
    }
}

type Slot<V> = Vec<(HandlerId, V)>;

/// Thread-safe `(instance, event) -> [(handler id, value)]` table.
pub struct SubscriptionTable<V> {
    entries: RwLock<HashMap<(Uuid, String), Slot<V>>>,
}

impl<V: Clone> Default for SubscriptionTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> SubscriptionTable<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Add a subscription. Returns `false` if the key was already present.
    pub fn add(&self, key: &SubscriptionKey, value: V) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let slot = entries
            .entry((key.instance_id, key.event_name.clone()))
            .or_default();
        if slot.iter().any(|(id, _)| *id == key.handler_id) {
            return false;
        }
        slot.push((key.handler_id, value));
        true
    }

    /// Remove a subscription. Returns `false` if it was absent.
    pub fn remove(&self, key: &SubscriptionKey) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let slot_key = (key.instance_id, key.event_name.clone());
        let Some(slot) = entries.get_mut(&slot_key) else {
            return false;
        };
        let before = slot.len();
        slot.retain(|(id, _)| *id != key.handler_id);
        let removed = slot.len() != before;
        if slot.is_empty() {
            entries.remove(&slot_key);
        }
        removed
    }

    /// Handlers subscribed to an event, in subscription order.
    pub fn handlers(&self, instance_id: Uuid, event: &str) -> Vec<(HandlerId, V)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&(instance_id, event.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Find a handler of an instance by id, with the event it is bound to.
    pub fn find(&self, instance_id: Uuid, handler_id: HandlerId) -> Option<(String, V)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|((instance, _), _)| *instance == instance_id)
            .find_map(|((_, event), slot)| {
                slot.iter()
                    .find(|(id, _)| *id == handler_id)
                    .map(|(_, value)| (event.clone(), value.clone()))
            })
    }

    pub fn count_for_instance(&self, instance_id: Uuid) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|((instance, _), _)| *instance == instance_id)
            .map(|(_, slot)| slot.len())
            .sum()
    }

    /// Instances with at least one subscription.
    pub fn instances(&self) -> Vec<Uuid> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut instances: Vec<Uuid> = entries.keys().map(|(instance, _)| *instance).collect();
        instances.sort();
        instances.dedup();
        instances
    }

    /// Drop every subscription of an instance, returning how many were removed.
    pub fn remove_instance(&self, instance_id: Uuid) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        entries.retain(|(instance, _), slot| {
            if *instance == instance_id {
                removed += slot.len();
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
