//! Live service instances, keyed by the client's instance id.
//!
//! Instances are created on the first call that names them and evicted after
//! sitting idle for the configured period. Every lookup refreshes the idle
//! timer, and the liveness driver refreshes it for instances that still have a
//! connected event socket.

use super::thunk::EventRaiser;
use crate::config::ServerConfig;
use crate::error::DispatchError;
use mini_moka::sync::Cache;
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// A service object plus its event surface.
pub struct ServiceInstance {
    pub id: Uuid,
    /// Full name of the interface the instance was created for.
    pub interface: String,
    pub service: Arc<dyn Any + Send + Sync>,
    pub events: EventRaiser,
}

pub struct InstanceRegistry {
    instances: Cache<Uuid, Arc<ServiceInstance>>,
    create_lock: Mutex<()>,
}

impl InstanceRegistry {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            instances: Cache::builder()
                .max_capacity(config.max_instances)
                .time_to_idle(config.instance_idle_timeout)
                .build(),
            create_lock: Mutex::new(()),
        }
    }

    /// Look an instance up, creating it on first use.
    ///
    /// An instance id is bound to one interface for its lifetime.
    pub fn get_or_create<F>(
        &self,
        instance_id: Uuid,
        interface: &str,
        create: F,
    ) -> Result<Arc<ServiceInstance>, DispatchError>
    where
        F: FnOnce() -> ServiceInstance,
    {
        let instance = match self.instances.get(&instance_id) {
            Some(instance) => instance,
            None => {
                let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
                match self.instances.get(&instance_id) {
                    Some(instance) => instance,
                    None => {
                        let instance = Arc::new(create());
                        debug!("created {} instance {}", instance.interface, instance_id);
                        self.instances.insert(instance_id, instance.clone());
                        instance
                    }
                }
            }
        };
        if instance.interface != interface {
            return Err(DispatchError::Protocol(format!(
                "{}, instance {} is bound to {}.",
                DispatchError::MISSING_METADATA,
                instance_id,
                instance.interface
            )));
        }
        Ok(instance)
    }

    pub fn get(&self, instance_id: Uuid) -> Option<Arc<ServiceInstance>> {
        self.instances.get(&instance_id)
    }

    /// Whether an instance is live, without refreshing its idle timer.
    pub fn contains(&self, instance_id: Uuid) -> bool {
        self.instances.contains_key(&instance_id)
    }

    /// Refresh an instance's idle timer.
    pub fn touch(&self, instance_id: Uuid) -> bool {
        self.instances.get(&instance_id).is_some()
    }

    pub fn remove(&self, instance_id: Uuid) {
        self.instances.invalidate(&instance_id);
    }

    pub fn clear(&self) {
        self.instances.invalidate_all();
    }
}
