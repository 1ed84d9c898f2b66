//! Server side of Tether.
//!
//! # Architecture
//!
//! - **Dispatcher**: resolves each POST against the [`ServiceCatalog`] and
//!   runs the bound invoker on the right service instance
//! - **Registry**: lazily created, idle-evicted service instances
//! - **Hub**: subscription table plus one [`channel`] and [`pump`] per
//!   connected instance, driving event calls over the instance's WebSocket
//! - **HTTP**: the axum router tying it together

pub mod auth;
pub mod channel;
pub mod dispatcher;
pub mod exceptions;
pub mod http;
pub mod hub;
pub mod providers;
pub mod pump;
pub mod registry;
pub mod thunk;

pub use auth::{AnonymousAuthorizer, AuthError, Authorizer, Identity, StaticTokenAuthorizer};
pub use dispatcher::{
    CallContext, InboundRequest, OutboundResponse, ServerDispatcher, ServiceBinding,
    ServiceBindingBuilder, ServiceCatalog,
};
pub use exceptions::{DefaultExceptionHandler, ExceptionHandler};
pub use http::{router, serve, RunningServer};
pub use hub::EventHub;
pub use providers::Providers;
pub use registry::{InstanceRegistry, ServiceInstance};
pub use thunk::{EventRaiser, InstanceContext};
