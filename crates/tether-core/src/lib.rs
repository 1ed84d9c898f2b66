//! Tether Core - RPC over HTTP with server-to-client event callbacks.
//!
//! A client calls methods of a remote service through a [`ServiceProxy`]; each
//! call is one HTTP POST. The server can call back into handlers the client
//! subscribed to: event invocations are queued per service instance and pumped
//! over a WebSocket, so server code awaits them like ordinary async calls.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::{ClientConfig, RpcClient};
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let client = RpcClient::new(ClientConfig::new("http://127.0.0.1:8080/")?)?;
//!     let calculator = client.proxy(calculator_contract(), None);
//!
//!     let sum: i32 = calculator.call(1, vec![2.into(), 3.into()]).await?;
//!     println!("2 + 3 = {}", sum);
//!
//!     calculator
//!         .subscribe("Changed", "print", |call| async move {
//!             let (value,): (String,) = call.args()?;
//!             println!("changed to {}", value);
//!             Ok(serde_json::Value::Bool(true))
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod contract;
pub mod error;
pub mod protocol;
pub mod server;
pub mod socket;
pub mod subscription;

// Re-export commonly used types
pub use client::{CallHandle, EventInvocation, EventSender, RpcClient, ServiceProxy};
pub use codec::{CodecError, HeadCodec, JsonCodec, WireCodec};
pub use config::{ClientConfig, ProtocolConfig, ServerConfig};
pub use contract::{
    Access, CatalogMetadata, ContractError, EventDescriptor, MethodDescriptor, MethodKind,
    ReturnShape, ServiceContract,
};
pub use error::{DispatchError, ErrorOrigin, Result, RpcError, TetherError};
pub use protocol::{HandlerId, MethodKey, RpcHead, RpcRequest};
pub use server::{
    serve, CallContext, EventRaiser, Identity, InstanceContext, Providers, RunningServer,
    ServerDispatcher, ServiceBinding, ServiceCatalog,
};
pub use subscription::{SubscriptionKey, SubscriptionTable};
