//! Client call dispatcher.
//!
//! [`RpcClient`] holds the shared HTTP transport and codecs and hands out
//! [`ServiceProxy`] values. Each proxy is one remote service instance: it
//! owns a fresh instance id, its local event handlers and, once something is
//! subscribed, the event socket for that instance.

use super::listener::{EventInvocation, EventListener, ListenerHandle, LocalHandler};
use super::socket::TungsteniteSocket;
use super::transport::InvocationTransport;
use crate::codec::{self, HeadCodec, JsonCodec, WireCodec};
use crate::config::{ClientConfig, ProtocolConfig};
use crate::contract::{CatalogMetadata, MethodDescriptor, ServiceContract, HANDLER_ID_PARAM};
use crate::error::{Result, TetherError};
use crate::protocol::{HandlerId, MethodKey, RpcHead, RpcRequest};
use crate::subscription::{SubscriptionKey, SubscriptionTable};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Factory for service proxies sharing one transport.
pub struct RpcClient {
    config: ClientConfig,
    transport: Arc<InvocationTransport>,
    codec: Arc<dyn WireCodec>,
    event_codec: Arc<dyn WireCodec>,
}

impl RpcClient {
    /// Create a client with the JSON codecs.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_codecs(config, Arc::new(JsonCodec), Arc::new(JsonCodec), Arc::new(JsonCodec))
    }

    pub fn with_codecs(
        config: ClientConfig,
        codec: Arc<dyn WireCodec>,
        event_codec: Arc<dyn WireCodec>,
        head_codec: Arc<dyn HeadCodec>,
    ) -> Result<Self> {
        let transport = InvocationTransport::new(&config, codec.clone(), head_codec)?;
        Ok(Self {
            config,
            transport: Arc::new(transport),
            codec,
            event_codec,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Create a proxy for a fresh remote instance.
    pub fn proxy(&self, contract: ServiceContract, token: Option<String>) -> ServiceProxy {
        let instance_id = Uuid::new_v4();
        debug!("new proxy {} for {}", instance_id, contract.full_name());
        ServiceProxy {
            inner: Arc::new(ProxyInner {
                instance_id,
                contract: Arc::new(contract),
                token,
                config: self.config.clone(),
                transport: self.transport.clone(),
                codec: self.codec.clone(),
                event_codec: self.event_codec.clone(),
                handlers: Arc::new(SubscriptionTable::new()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Fetch the server's service table.
    pub async fn metadata(&self) -> Result<CatalogMetadata> {
        self.transport
            .get_json(ProtocolConfig::METADATA_PATH.trim_start_matches('/'))
            .await
    }

    /// Check that every method of a local contract exists on the server under
    /// the same key and name.
    pub async fn verify_contract(&self, contract: &ServiceContract) -> Result<()> {
        let metadata = self.metadata().await?;
        let remote = metadata
            .service(&contract.namespace, &contract.type_name)
            .ok_or_else(|| {
                TetherError::Other(format!("server does not expose {}", contract.full_name()))
            })?;
        for method in &contract.methods {
            match remote.contract.method(method.key) {
                Some(found) if found.name == method.name => {}
                Some(found) => {
                    return Err(TetherError::Other(format!(
                        "contract mismatch on {}: key {} is {} locally but {} on the server",
                        contract.full_name(),
                        method.key,
                        method.name,
                        found.name
                    )))
                }
                None => {
                    return Err(TetherError::UnknownMember {
                        interface: contract.full_name(),
                        member: method.name.clone(),
                    })
                }
            }
        }
        Ok(())
    }
}

/// Handle to one remote service instance.
///
/// Cloning shares the instance. The event socket closes when the last clone
/// is dropped or [`ServiceProxy::close`] is called.
#[derive(Clone)]
pub struct ServiceProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    instance_id: Uuid,
    contract: Arc<ServiceContract>,
    token: Option<String>,
    config: ClientConfig,
    transport: Arc<InvocationTransport>,
    codec: Arc<dyn WireCodec>,
    event_codec: Arc<dyn WireCodec>,
    handlers: Arc<SubscriptionTable<LocalHandler>>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl ServiceProxy {
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn contract(&self) -> &ServiceContract {
        &self.inner.contract
    }

    /// Invoke a method by key.
    ///
    /// Void methods yield `Null`. Async-shaped methods run the exchange on a
    /// spawned task and await it.
    pub async fn invoke(&self, key: MethodKey, args: Vec<Value>) -> Result<Value> {
        let method = self.method(key)?.clone();
        if method.returns.is_async() {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.exchange(&method, args).await }).await?
        } else {
            self.inner.exchange(&method, args).await
        }
    }

    pub async fn call_void(&self, key: MethodKey, args: Vec<Value>) -> Result<()> {
        self.invoke(key, args).await.map(|_| ())
    }

    /// Invoke a method and decode its result.
    pub async fn call<R: DeserializeOwned>(&self, key: MethodKey, args: Vec<Value>) -> Result<R> {
        let value = self.invoke(key, args).await?;
        decode_result(value)
    }

    /// Start a call on a background task.
    pub fn call_async<R>(&self, key: MethodKey, args: Vec<Value>) -> CallHandle<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let proxy = self.clone();
        CallHandle {
            task: tokio::spawn(async move { proxy.call::<R>(key, args).await }),
        }
    }

    /// Register a local handler for an event.
    ///
    /// The handler id is derived from the instance, the event and
    /// `identity`, so subscribing the same identity twice is a no-op. The
    /// first subscription opens the event socket.
    pub async fn subscribe<F, Fut, R>(&self, event: &str, identity: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(EventInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Serialize + 'static,
    {
        let inner = &self.inner;
        let descriptor = inner.event(event)?.clone();
        let key = SubscriptionKey::for_handler(
            inner.instance_id,
            &inner.contract.full_name(),
            event,
            identity,
        );

        inner.ensure_listener().await?;
        let local = LocalHandler {
            event: Arc::new(descriptor.clone()),
            handler: Arc::new(move |invocation: EventInvocation| {
                handler(invocation)
                    .map(|result| {
                        result.and_then(|value| serde_json::to_value(value).map_err(anyhow::Error::from))
                    })
                    .boxed()
            }),
        };
        if !inner.handlers.add(&key, local) {
            return Ok(key.handler_id);
        }
        if let Err(e) = inner.event_op(descriptor.add_key, key.handler_id).await {
            inner.handlers.remove(&key);
            if inner.handlers.count_for_instance(inner.instance_id) == 0 {
                self.close().await;
            }
            return Err(e);
        }
        info!(
            "subscribed handler {} to {}.{} on {}",
            key.handler_id,
            inner.contract.full_name(),
            event,
            inner.instance_id
        );
        Ok(key.handler_id)
    }

    /// Remove a local handler. Returns false when it was not subscribed.
    ///
    /// Removing the last handler closes the event socket.
    pub async fn unsubscribe(&self, event: &str, identity: &str) -> Result<bool> {
        let inner = &self.inner;
        let descriptor = inner.event(event)?;
        let key = SubscriptionKey::for_handler(
            inner.instance_id,
            &inner.contract.full_name(),
            event,
            identity,
        );
        if !inner.handlers.remove(&key) {
            return Ok(false);
        }
        let result = inner.event_op(descriptor.remove_key, key.handler_id).await;
        if inner.handlers.count_for_instance(inner.instance_id) == 0 {
            self.close().await;
        }
        result.map(|_| true)
    }

    /// Number of local handlers across all events.
    pub fn subscription_count(&self) -> usize {
        self.inner.handlers.count_for_instance(self.inner.instance_id)
    }

    pub async fn is_listening(&self) -> bool {
        self.inner
            .listener
            .lock()
            .await
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }

    /// Close the event socket. Local handlers stay registered.
    pub async fn close(&self) {
        let listener = self.inner.listener.lock().await.take();
        if let Some(listener) = listener {
            listener.close().await;
        }
    }

    fn method(&self, key: MethodKey) -> Result<&MethodDescriptor> {
        let method = self
            .inner
            .contract
            .method(key)
            .ok_or_else(|| TetherError::UnknownMember {
                interface: self.inner.contract.full_name(),
                member: key.to_string(),
            })?;
        if method.is_event_op() {
            return Err(TetherError::Other(format!(
                "{} is an event accessor, use subscribe or unsubscribe",
                method.name
            )));
        }
        Ok(method)
    }
}

impl ProxyInner {
    fn event(&self, name: &str) -> Result<&crate::contract::EventDescriptor> {
        self.contract.event(name).ok_or_else(|| TetherError::UnknownMember {
            interface: self.contract.full_name(),
            member: name.to_string(),
        })
    }

    fn head(&self, method: &MethodDescriptor, event_op: bool) -> RpcHead {
        RpcHead {
            namespace: self.contract.namespace.clone(),
            type_name: self.contract.type_name.clone(),
            method_name: method.name.clone(),
            method_key: method.key,
            instance_id: self.instance_id,
            token: self.token.clone(),
            event_op,
            timeout_ms: self.config.rpc_timeout.as_millis() as u64,
        }
    }

    async fn exchange(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Value> {
        let request = RpcRequest::new(self.head(method, false), args);
        let body = codec::encode_arguments(
            self.codec.as_ref(),
            &method.param_names(),
            &request.arguments,
        )?;
        debug!("request {} -> {}", request.id, request.head.method_name);
        let response = self.transport.send(&request.head, body).await?;
        if !method.returns.has_value() || response.is_empty() {
            return Ok(Value::Null);
        }
        let bytes = response.into_bytes().await?;
        self.codec
            .decode(&bytes)
            .map_err(|e| TetherError::ResponseDecode {
                message: e.to_string(),
                source: Some(e),
            })
    }

    async fn event_op(&self, key: MethodKey, handler_id: HandlerId) -> Result<()> {
        let method = self.contract.method(key).ok_or_else(|| TetherError::UnknownMember {
            interface: self.contract.full_name(),
            member: key.to_string(),
        })?;
        let body = codec::encode_arguments(
            self.codec.as_ref(),
            &[HANDLER_ID_PARAM],
            &[Value::from(handler_id)],
        )?;
        self.transport.send(&self.head(method, true), body).await?;
        Ok(())
    }

    /// Open the event socket unless a live listener already owns it.
    async fn ensure_listener(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|l| !l.is_finished()) {
            return Ok(());
        }
        let url = self.config.event_socket_url(self.instance_id)?;
        let socket = TungsteniteSocket::connect(&url).await?;
        *listener = Some(
            EventListener::new(
                self.instance_id,
                self.contract.full_name(),
                socket,
                self.handlers.clone(),
                self.event_codec.clone(),
                self.config.keep_alive_interval,
            )
            .spawn(),
        );
        Ok(())
    }
}

fn decode_result<R: DeserializeOwned>(value: Value) -> Result<R> {
    codec::from_value(value).map_err(|e| TetherError::ResponseDecode {
        message: e.to_string(),
        source: Some(e),
    })
}

/// A call running on a background task. Await it for the result.
pub struct CallHandle<R> {
    task: JoinHandle<Result<R>>,
}

impl<R> CallHandle<R> {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop waiting. The request may still reach the server.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<R> Future for CallHandle<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}
