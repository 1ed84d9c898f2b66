//! Exception hooks for business failures.

use crate::error::RpcError;
use crate::protocol::RpcHead;
use tracing::warn;

/// Turns a failure raised by service code into the wire error.
///
/// Runs exactly once per failed call. If the hook itself fails (or panics),
/// the dispatcher replaces its output with a generic error.
pub trait ExceptionHandler: Send + Sync + 'static {
    fn handle(&self, head: &RpcHead, err: &anyhow::Error) -> anyhow::Result<RpcError>;
}

/// Logs the failure and forwards its message and cause chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExceptionHandler;

impl ExceptionHandler for DefaultExceptionHandler {
    fn handle(&self, head: &RpcHead, err: &anyhow::Error) -> anyhow::Result<RpcError> {
        warn!(
            "{}.{} failed on instance {}: {:#}",
            head.interface_name(),
            head.method_name,
            head.instance_id,
            err
        );
        Ok(RpcError::from_error(err))
    }
}
