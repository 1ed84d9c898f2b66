//! Pluggable server collaborators.

use super::auth::{AnonymousAuthorizer, Authorizer};
use super::exceptions::{DefaultExceptionHandler, ExceptionHandler};
use crate::codec::{HeadCodec, JsonCodec, WireCodec};
use std::sync::Arc;

/// Typed registry of the collaborators a server is built with.
///
/// Every slot has a default, so `Providers::default()` is a working JSON
/// server that admits anonymous callers.
#[derive(Clone)]
pub struct Providers {
    /// Request arguments and return values.
    pub codec: Arc<dyn WireCodec>,
    /// Event payloads on the WebSocket.
    pub event_codec: Arc<dyn WireCodec>,
    pub head_codec: Arc<dyn HeadCodec>,
    pub authorizer: Arc<dyn Authorizer>,
    pub exception_handler: Arc<dyn ExceptionHandler>,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            event_codec: Arc::new(JsonCodec),
            head_codec: Arc::new(JsonCodec),
            authorizer: Arc::new(AnonymousAuthorizer),
            exception_handler: Arc::new(DefaultExceptionHandler),
        }
    }
}

impl Providers {
    pub fn with_codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_event_codec(mut self, codec: Arc<dyn WireCodec>) -> Self {
        self.event_codec = codec;
        self
    }

    pub fn with_head_codec(mut self, codec: Arc<dyn HeadCodec>) -> Self {
        self.head_codec = codec;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }
}
