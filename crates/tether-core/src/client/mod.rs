//! Client side: call dispatch over HTTP and the event listener socket.

pub mod dispatcher;
pub mod listener;
pub mod socket;
pub mod transport;

pub use dispatcher::{CallHandle, RpcClient, ServiceProxy};
pub use listener::{EventHandlerFn, EventInvocation, EventSender};
pub use socket::TungsteniteSocket;
pub use transport::{decode_text, InvocationTransport, RpcResponse};
