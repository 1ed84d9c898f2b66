//! Event hub: server-side subscriptions and per-instance channels.

use super::channel::{EventChannel, EventMessage};
use super::pump::{EventPump, PumpExit};
use crate::codec::WireCodec;
use crate::config::ProtocolConfig;
use crate::contract::EventDescriptor;
use crate::error::{Result, TetherError};
use crate::protocol::HandlerId;
use crate::socket::FrameSocket;
use crate::subscription::{SubscriptionKey, SubscriptionTable};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct EventHub {
    subscriptions: SubscriptionTable<()>,
    channels: RwLock<HashMap<Uuid, Arc<EventChannel>>>,
    codec: Arc<dyn WireCodec>,
    event_timeout: Duration,
}

impl EventHub {
    pub fn new(codec: Arc<dyn WireCodec>, event_timeout: Duration) -> Self {
        Self {
            subscriptions: SubscriptionTable::new(),
            channels: RwLock::new(HashMap::new()),
            codec,
            event_timeout,
        }
    }

    /// Register a client handler. Returns `false` if it was already registered.
    pub fn subscribe(&self, instance_id: Uuid, event: &str, handler_id: HandlerId) -> bool {
        let added = self
            .subscriptions
            .add(&SubscriptionKey::new(instance_id, event, handler_id), ());
        if added {
            self.channel_for(instance_id);
            debug!("instance {}: handler {} subscribed to {}", instance_id, handler_id, event);
        }
        added
    }

    /// Remove a client handler. Returns `false` if it was not registered.
    ///
    /// The close signal goes out only when the instance's last subscription
    /// is removed, after the events already queued. Removing one handler
    /// while others remain leaves the socket open so they keep receiving.
    pub fn unsubscribe(&self, instance_id: Uuid, event: &str, handler_id: HandlerId) -> bool {
        let removed = self
            .subscriptions
            .remove(&SubscriptionKey::new(instance_id, event, handler_id));
        if removed && self.subscriptions.count_for_instance(instance_id) == 0 {
            if let Some(channel) = self.channel(instance_id) {
                if channel.is_attached() {
                    debug!("instance {}: last handler removed, closing event socket", instance_id);
                    channel.close();
                } else {
                    // Nothing would consume a queued close.
                    self.detach(&channel);
                }
            }
        }
        removed
    }

    pub fn subscription_count(&self, instance_id: Uuid) -> usize {
        self.subscriptions.count_for_instance(instance_id)
    }

    pub fn subscriber_count(&self, instance_id: Uuid, event: &str) -> usize {
        self.subscriptions.handlers(instance_id, event).len()
    }

    /// Whether a pump is currently serving the instance.
    pub fn is_connected(&self, instance_id: Uuid) -> bool {
        self.channel(instance_id)
            .map(|channel| channel.is_attached())
            .unwrap_or(false)
    }

    /// Invoke every handler subscribed to an event, in subscription order.
    ///
    /// Returns the last handler's value, `None` when nobody is subscribed.
    /// The first failure stops the fan-out and is returned.
    pub async fn raise(
        &self,
        instance_id: Uuid,
        event: &EventDescriptor,
        mut args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let handlers = self.subscriptions.handlers(instance_id, &event.name);
        if handlers.is_empty() {
            debug!("instance {}: {} raised with no subscribers", instance_id, event.name);
            return Ok(None);
        }
        if event.has_sender {
            args.insert(0, Value::String(ProtocolConfig::SENDER_PLACEHOLDER.to_string()));
        }
        let types = event.wire_types();

        let mut last = None;
        for (handler_id, ()) in handlers {
            let (message, done) =
                EventMessage::new(handler_id, &event.name, types.clone(), args.clone(), event.returns);
            if self.channel_for(instance_id).enqueue(message).is_err() {
                return Err(TetherError::connection_broken(instance_id, "event channel closed"));
            }
            let value = match tokio::time::timeout(self.event_timeout, done).await {
                Err(_) => return Err(TetherError::Timeout(self.event_timeout)),
                Ok(Err(_)) => {
                    return Err(TetherError::connection_broken(instance_id, "event dropped"))
                }
                Ok(Ok(result)) => result?,
            };
            last = Some(value);
        }
        Ok(last)
    }

    /// Serve an instance's event socket until it closes.
    pub async fn attach<S: FrameSocket>(&self, instance_id: Uuid, socket: S) -> PumpExit {
        let (channel, queue) = {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            let existing = channels.get(&instance_id).cloned();
            let channel = match existing {
                Some(channel) if !channel.is_attached() => channel,
                previous => {
                    if let Some(previous) = previous {
                        warn!("instance {}: new event socket replaces the current one", instance_id);
                        previous.close();
                    }
                    let channel = Arc::new(EventChannel::new(instance_id));
                    channels.insert(instance_id, channel.clone());
                    channel
                }
            };
            let queue = channel.take_receiver();
            (channel, queue)
        };
        let Some(queue) = queue else {
            return PumpExit::Aborted("event channel already attached".into());
        };

        info!("ws client connected, rpc service instance id is {}", instance_id);
        let pump = EventPump::new(
            instance_id,
            socket,
            queue,
            self.codec.clone(),
            self.event_timeout,
        );
        let exit = pump.run().await;
        self.detach(&channel);
        exit
    }

    /// Probe every attached channel. Returns the instances probed.
    pub fn probe_connected(&self) -> Vec<Uuid> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels
            .values()
            .filter(|channel| channel.is_attached())
            .filter(|channel| channel.probe())
            .map(|channel| channel.instance_id())
            .collect()
    }

    /// Instances holding at least one subscription.
    ///
    /// A socket that connected ahead of its first subscribe is not listed.
    pub fn subscribed_instances(&self) -> Vec<Uuid> {
        self.subscriptions.instances()
    }

    /// Forget an instance: drop its subscriptions and close its socket.
    pub fn retire_instance(&self, instance_id: Uuid) {
        let dropped = self.subscriptions.remove_instance(instance_id);
        let channel = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&instance_id);
        if let Some(channel) = channel {
            channel.close();
        }
        debug!("instance {} retired, {} subscription(s) dropped", instance_id, dropped);
    }

    /// Close every channel.
    pub fn shutdown(&self) {
        let channels: Vec<_> = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            channel.close();
        }
    }

    fn channel(&self, instance_id: Uuid) -> Option<Arc<EventChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&instance_id)
            .cloned()
    }

    fn channel_for(&self, instance_id: Uuid) -> Arc<EventChannel> {
        if let Some(channel) = self.channel(instance_id) {
            return channel;
        }
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(instance_id)
            .or_insert_with(|| Arc::new(EventChannel::new(instance_id)))
            .clone()
    }

    fn detach(&self, channel: &Arc<EventChannel>) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if channels
            .get(&channel.instance_id())
            .is_some_and(|current| Arc::ptr_eq(current, channel))
        {
            channels.remove(&channel.instance_id());
        }
    }
}
