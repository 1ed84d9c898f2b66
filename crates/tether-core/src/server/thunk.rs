//! Per-instance event surface handed to service objects.
//!
//! A service never talks to sockets. It gets an [`EventRaiser`] when it is
//! created and calls [`EventRaiser::raise`]; the raiser fans the call out to
//! every client handler subscribed on that instance and resolves to what the
//! handlers returned.

use super::hub::EventHub;
use crate::codec;
use crate::contract::ServiceContract;
use crate::error::{Result, TetherError};
use crate::protocol::HandlerId;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Passed to a service factory when an instance is created.
#[derive(Clone)]
pub struct InstanceContext {
    pub instance_id: Uuid,
    pub events: EventRaiser,
}

/// Raises the events of one service instance.
#[derive(Clone)]
pub struct EventRaiser {
    instance_id: Uuid,
    contract: Arc<ServiceContract>,
    hub: Arc<EventHub>,
}

impl EventRaiser {
    pub(crate) fn new(instance_id: Uuid, contract: Arc<ServiceContract>, hub: Arc<EventHub>) -> Self {
        Self {
            instance_id,
            contract,
            hub,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Number of client handlers subscribed to an event.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.hub.subscriber_count(self.instance_id, event)
    }

    /// Invoke every subscribed handler in order.
    ///
    /// Resolves to the last handler's value, or `None` when nothing is
    /// subscribed. A handler failure, a timeout or a dropped socket ends the
    /// fan-out with that error.
    pub async fn raise(&self, event: &str, args: Vec<Value>) -> Result<Option<Value>> {
        let descriptor = self
            .contract
            .event(event)
            .ok_or_else(|| TetherError::UnknownMember {
                interface: self.contract.full_name(),
                member: event.to_string(),
            })?;
        self.hub.raise(self.instance_id, descriptor, args).await
    }

    /// [`raise`](Self::raise) with the result decoded as `R`.
    pub async fn raise_as<R: DeserializeOwned>(&self, event: &str, args: Vec<Value>) -> Result<Option<R>> {
        self.raise(event, args)
            .await?
            .map(|value| {
                codec::from_value(value).map_err(|e| TetherError::ResponseDecode {
                    message: format!("event {} returned an unexpected value", event),
                    source: Some(e),
                })
            })
            .transpose()
    }

    pub(crate) fn subscribe(&self, event: &str, handler_id: HandlerId) -> bool {
        self.hub.subscribe(self.instance_id, event, handler_id)
    }

    pub(crate) fn unsubscribe(&self, event: &str, handler_id: HandlerId) -> bool {
        self.hub.unsubscribe(self.instance_id, event, handler_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::contract::ReturnShape;
    use std::time::Duration;

    fn raiser() -> EventRaiser {
        let contract = ServiceContract::builder("Samples", "ICalculator")
            .event("Changed", (10, 11), &[("value", "string")], false, ReturnShape::Value)
            .build()
            .unwrap();
        let hub = Arc::new(EventHub::new(Arc::new(JsonCodec), Duration::from_secs(1)));
        EventRaiser::new(Uuid::new_v4(), Arc::new(contract), hub)
    }

    #[tokio::test]
    async fn test_unknown_event() {
        let err = raiser().raise("Missing", vec![]).await.unwrap_err();
        assert!(matches!(err, TetherError::UnknownMember { ref member, .. } if member == "Missing"));
    }

    #[tokio::test]
    async fn test_no_subscribers_resolves_none() {
        let raiser = raiser();
        assert_eq!(raiser.subscriber_count("Changed"), 0);
        let result: Option<bool> = raiser.raise_as("Changed", vec!["x".into()]).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_redirects_to_hub() {
        let raiser = raiser();
        assert!(raiser.subscribe("Changed", 12));
        assert!(!raiser.subscribe("Changed", 12));
        assert_eq!(raiser.subscriber_count("Changed"), 1);
        assert!(raiser.unsubscribe("Changed", 12));
    }
}
