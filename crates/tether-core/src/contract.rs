//! Shared interface contracts.
//!
//! A [`ServiceContract`] is the metadata both peers agree on: which methods an
//! interface has, the [`MethodKey`] each one is addressed by, their parameter
//! names and return shapes, and which events the interface can raise. Event
//! subscription and removal are ordinary methods of kind
//! [`MethodKind::EventAdd`] / [`MethodKind::EventRemove`].

use crate::protocol::MethodKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parameter name of the handler id carried by event ops.
pub const HANDLER_ID_PARAM: &str = "handlerId";

/// Shape of a method's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReturnShape {
    /// No value; the call completes once the response is read.
    Void,
    /// A value decoded from the response body.
    Value,
    /// A value produced on a background task.
    Async,
    /// Background task with no value.
    AsyncVoid,
}

impl ReturnShape {
    pub fn has_value(self) -> bool {
        matches!(self, ReturnShape::Value | ReturnShape::Async)
    }

    pub fn is_async(self) -> bool {
        matches!(self, ReturnShape::Async | ReturnShape::AsyncVoid)
    }
}

/// What a method key resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "event")]
pub enum MethodKind {
    Call,
    EventAdd(String),
    EventRemove(String),
}

/// Access requirement checked against the caller's identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Access {
    #[default]
    Anonymous,
    Authenticated,
    Roles(Vec<String>),
}

/// A named, typed parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub key: MethodKey,
    pub name: String,
    pub params: Vec<Param>,
    pub returns: ReturnShape,
    #[serde(flatten)]
    pub kind: MethodKind,
    /// Overrides the contract's default access when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
}

impl MethodDescriptor {
    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn is_event_op(&self) -> bool {
        !matches!(self.kind, MethodKind::Call)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDescriptor {
    pub name: String,
    pub add_key: MethodKey,
    pub remove_key: MethodKey,
    /// Handler parameters, excluding the sender slot.
    pub params: Vec<Param>,
    /// Handlers receive the raising instance as a leading sender argument.
    pub has_sender: bool,
    pub returns: ReturnShape,
}

impl EventDescriptor {
    /// Wire type names of a raised payload, sender slot included.
    pub fn wire_types(&self) -> Vec<String> {
        let sender = self.has_sender.then(|| "sender".to_string());
        sender
            .into_iter()
            .chain(self.params.iter().map(|p| p.ty.clone()))
            .collect()
    }
}

/// Interface metadata shared by client and server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContract {
    pub namespace: String,
    pub type_name: String,
    pub version: u32,
    pub default_access: Access,
    pub methods: Vec<MethodDescriptor>,
    pub events: Vec<EventDescriptor>,
}

impl ServiceContract {
    pub fn builder(namespace: impl Into<String>, type_name: impl Into<String>) -> ContractBuilder {
        ContractBuilder {
            contract: ServiceContract {
                namespace: namespace.into(),
                type_name: type_name.into(),
                version: 1,
                default_access: Access::Anonymous,
                methods: Vec::new(),
                events: Vec::new(),
            },
        }
    }

    /// `namespace.TypeName`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.namespace, self.type_name)
    }

    pub fn method(&self, key: MethodKey) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.key == key)
    }

    pub fn method_by_name(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDescriptor> {
        self.events.iter().find(|e| e.name == name)
    }

    /// Effective access requirement of a method.
    pub fn access_for(&self, method: &MethodDescriptor) -> Access {
        method
            .access
            .clone()
            .unwrap_or_else(|| self.default_access.clone())
    }
}

/// Error building a contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("duplicate method key {key} on {interface}")]
    DuplicateKey { interface: String, key: MethodKey },

    #[error("duplicate event {event} on {interface}")]
    DuplicateEvent { interface: String, event: String },

    #[error("method {method} on {interface} has no invoker bound")]
    UnboundMethod { interface: String, method: String },

    #[error("service {0} is already bound")]
    DuplicateService(String),
}

pub struct ContractBuilder {
    contract: ServiceContract,
}

impl ContractBuilder {
    pub fn version(mut self, version: u32) -> Self {
        self.contract.version = version;
        self
    }

    pub fn default_access(mut self, access: Access) -> Self {
        self.contract.default_access = access;
        self
    }

    /// Declare a callable method.
    pub fn method(mut self, key: MethodKey, name: &str, params: &[(&str, &str)], returns: ReturnShape) -> Self {
        self.contract.methods.push(MethodDescriptor {
            key,
            name: name.to_string(),
            params: params.iter().map(|(n, t)| Param::new(*n, *t)).collect(),
            returns,
            kind: MethodKind::Call,
            access: None,
        });
        self
    }

    /// Override the access requirement of the most recently declared method.
    pub fn access(mut self, access: Access) -> Self {
        if let Some(last) = self.contract.methods.last_mut() {
            last.access = Some(access);
        }
        self
    }

    /// Declare an event with its add/remove accessor keys.
    pub fn event(
        mut self,
        name: &str,
        keys: (MethodKey, MethodKey),
        params: &[(&str, &str)],
        has_sender: bool,
        returns: ReturnShape,
    ) -> Self {
        let (add_key, remove_key) = keys;
        for (key, prefix, kind) in [
            (add_key, "add_", MethodKind::EventAdd(name.to_string())),
            (remove_key, "remove_", MethodKind::EventRemove(name.to_string())),
        ] {
            self.contract.methods.push(MethodDescriptor {
                key,
                name: format!("{}{}", prefix, name),
                params: vec![Param::new(HANDLER_ID_PARAM, "u32")],
                returns: ReturnShape::Void,
                kind,
                access: None,
            });
        }
        self.contract.events.push(EventDescriptor {
            name: name.to_string(),
            add_key,
            remove_key,
            params: params.iter().map(|(n, t)| Param::new(*n, *t)).collect(),
            has_sender,
            returns,
        });
        self
    }

    /// Validate key and event uniqueness.
    pub fn build(self) -> Result<ServiceContract, ContractError> {
        let interface = self.contract.full_name();
        let mut seen = HashMap::new();
        for method in &self.contract.methods {
            if seen.insert(method.key, ()).is_some() {
                return Err(ContractError::DuplicateKey {
                    interface,
                    key: method.key,
                });
            }
        }
        let mut events = HashMap::new();
        for event in &self.contract.events {
            if events.insert(event.name.as_str(), ()).is_some() {
                return Err(ContractError::DuplicateEvent {
                    interface,
                    event: event.name.clone(),
                });
            }
        }
        Ok(self.contract)
    }
}

/// Metadata of one bound service, as served by `GET /metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    pub contract: ServiceContract,
    /// Rust type implementing the interface.
    pub implementation: String,
}

/// Catalog metadata, as served by `GET /metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogMetadata {
    pub version: u32,
    pub services: Vec<ServiceMetadata>,
}

impl CatalogMetadata {
    pub fn service(&self, namespace: &str, type_name: &str) -> Option<&ServiceMetadata> {
        self.services
            .iter()
            .find(|s| s.contract.namespace == namespace && s.contract.type_name == type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServiceContract {
        ServiceContract::builder("Samples", "ICalculator")
            .method(1, "Add", &[("a", "i32"), ("b", "i32")], ReturnShape::Value)
            .method(2, "Reset", &[], ReturnShape::Void)
            .access(Access::Authenticated)
            .event("Changed", (10, 11), &[("value", "string")], true, ReturnShape::Value)
            .build()
            .unwrap()
    }

    #[test]
    fn test_event_accessors_are_methods() {
        let contract = sample();
        let add = contract.method(10).unwrap();
        assert_eq!(add.name, "add_Changed");
        assert_eq!(add.kind, MethodKind::EventAdd("Changed".into()));
        assert_eq!(add.param_names(), vec![HANDLER_ID_PARAM]);
        assert!(contract.method(11).unwrap().is_event_op());
    }

    #[test]
    fn test_access_override() {
        let contract = sample();
        assert_eq!(contract.access_for(contract.method(1).unwrap()), Access::Anonymous);
        assert_eq!(
            contract.access_for(contract.method(2).unwrap()),
            Access::Authenticated
        );
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let err = ServiceContract::builder("Samples", "IBroken")
            .method(1, "A", &[], ReturnShape::Void)
            .method(1, "B", &[], ReturnShape::Void)
            .build()
            .unwrap_err();
        assert!(matches!(err, ContractError::DuplicateKey { key: 1, .. }));
    }

    #[test]
    fn test_wire_types_include_sender() {
        let contract = sample();
        assert_eq!(
            contract.event("Changed").unwrap().wire_types(),
            vec!["sender".to_string(), "string".to_string()]
        );
    }

    #[test]
    fn test_metadata_roundtrips_through_json() {
        let metadata = CatalogMetadata {
            version: 3,
            services: vec![ServiceMetadata {
                contract: sample(),
                implementation: "samples::Calculator".into(),
            }],
        };
        let json = serde_json::to_string(&metadata).unwrap();
        let parsed: CatalogMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, metadata);
        assert!(parsed.service("Samples", "ICalculator").is_some());
    }
}
