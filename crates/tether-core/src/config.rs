//! Centralized configuration for Tether.
//!
//! Protocol constants that both peers must agree on live in [`ProtocolConfig`].
//! Per-process tunables live in [`ServerConfig`] and [`ClientConfig`].

use crate::{Result, TetherError};
use std::time::Duration;
use url::Url;

/// Wire-level constants shared by client and server.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Header carrying the serialized [`RpcHead`](crate::protocol::RpcHead).
    pub const META_HEADER: &'static str = "meta";
    /// Optional response header carrying a sequence id.
    pub const SEQUENCE_HEADER: &'static str = "ez_seqid";
    /// Optional response header carrying an event code.
    pub const EVENT_CODE_HEADER: &'static str = "ez_code";
    /// WebSocket sub-protocol identifier.
    pub const WS_SUBPROTOCOL: &'static str = "rpc";
    /// Query parameter naming the instance on the event socket URL.
    pub const WS_INSTANCE_PARAM: &'static str = "instanceId";
    pub const WS_PATH: &'static str = "/ws";
    pub const METADATA_PATH: &'static str = "/metadata";
    pub const HEALTH_PATH: &'static str = "/health";
    /// Request bodies above this size are rejected before decoding.
    pub const MAX_REQUEST_BYTES: u64 = 10 * 1024 * 1024;
    /// Handler id reserved for the liveness sentinel.
    pub const LIVENESS_HANDLER_ID: u32 = 0;
    /// Placeholder written on the wire in place of a sender argument.
    pub const SENDER_PLACEHOLDER: &'static str = "<service_instance>";
    pub const SERVER_NAME: &'static str = concat!("RpcServer-tether/", env!("CARGO_PKG_VERSION"));
    pub const USER_AGENT: &'static str = concat!("RpcClient-tether/", env!("CARGO_PKG_VERSION"));
}

/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How often the liveness driver probes every connected instance.
    pub liveness_interval: Duration,
    /// Per-message timeout for a server-to-client event round trip.
    pub event_timeout: Duration,
    /// Service instances untouched for this long are evicted.
    pub instance_idle_timeout: Duration,
    /// Upper bound on live service instances.
    pub max_instances: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(5),
            event_timeout: Duration::from_secs(30),
            instance_idle_timeout: Duration::from_secs(30 * 60),
            max_instances: 100_000,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    pub fn with_instance_idle_timeout(mut self, timeout: Duration) -> Self {
        self.instance_idle_timeout = timeout;
        self
    }

    pub fn with_max_instances(mut self, max: u64) -> Self {
        self.max_instances = max;
        self
    }
}

/// Client tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service URL unary calls are posted to.
    pub service_url: Url,
    /// Event socket URL; derived from `service_url` when unset.
    pub websocket_url: Option<Url>,
    /// Response read timeout for unary calls.
    pub rpc_timeout: Duration,
    /// Ping interval on the event socket.
    pub keep_alive_interval: Duration,
    /// Optional HTTP proxy for unary calls.
    pub proxy: Option<String>,
    /// Skip server certificate validation.
    pub accept_invalid_certs: bool,
}

impl ClientConfig {
    /// Create a config for a service URL such as `http://127.0.0.1:8080/`.
    pub fn new(service_url: &str) -> Result<Self> {
        let service_url = Url::parse(service_url).map_err(|e| {
            TetherError::Other(format!("invalid service url {}: {}", service_url, e))
        })?;
        Ok(Self {
            service_url,
            websocket_url: None,
            rpc_timeout: Duration::from_secs(120),
            keep_alive_interval: Duration::from_secs(15),
            proxy: None,
            accept_invalid_certs: false,
        })
    }

    pub fn with_websocket_url(mut self, url: Url) -> Self {
        self.websocket_url = Some(url);
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Event socket URL for an instance.
    ///
    /// Derived from the service URL by swapping `http`/`https` for `ws`/`wss`
    /// and using the `/ws` path unless an explicit socket URL was configured.
    pub fn event_socket_url(&self, instance_id: uuid::Uuid) -> Result<Url> {
        let mut url = match &self.websocket_url {
            Some(url) => url.clone(),
            None => {
                let mut url = self.service_url.clone();
                let scheme = match url.scheme() {
                    "https" => "wss",
                    _ => "ws",
                };
                url.set_scheme(scheme).map_err(|_| {
                    TetherError::Other(format!("cannot derive websocket url from {}", self.service_url))
                })?;
                url.set_path(ProtocolConfig::WS_PATH);
                url.set_query(None);
                url
            }
        };
        url.query_pairs_mut()
            .append_pair(ProtocolConfig::WS_INSTANCE_PARAM, &instance_id.to_string());
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_limit_is_ten_mib() {
        assert_eq!(ProtocolConfig::MAX_REQUEST_BYTES, 10_485_760);
    }

    #[test]
    fn test_event_socket_url_derivation() {
        let config = ClientConfig::new("http://127.0.0.1:8080/").unwrap();
        let id = uuid::Uuid::nil();
        let url = config.event_socket_url(id).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8080/ws?instanceId=00000000-0000-0000-0000-000000000000"
        );

        let secure = ClientConfig::new("https://example.com/api").unwrap();
        assert_eq!(secure.event_socket_url(id).unwrap().scheme(), "wss");
    }

    #[test]
    fn test_explicit_socket_url_wins() {
        let config = ClientConfig::new("http://127.0.0.1:8080/")
            .unwrap()
            .with_websocket_url(Url::parse("ws://events.local/hub").unwrap());
        let url = config.event_socket_url(uuid::Uuid::nil()).unwrap();
        assert!(url.as_str().starts_with("ws://events.local/hub?instanceId="));
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        let server = ServerConfig::default();
        assert_eq!(server.liveness_interval, Duration::from_secs(5));
        assert!(server.event_timeout > Duration::ZERO);
        let client = ClientConfig::new("http://localhost/").unwrap();
        assert_eq!(client.keep_alive_interval, Duration::from_secs(15));
    }
}
