//! Server dispatch pipeline.
//!
//! Each POST runs through the same stages, and the first stage that fails
//! short-circuits into a [`DispatchError`]:
//!
//! ```text
//! size guard -> head -> interface -> method -> instance -> authorize
//!            -> arguments -> invoke -> encode
//! ```
//!
//! Services are bound through an explicit table of invoker closures keyed by
//! [`MethodKey`]; nothing is looked up by reflection or by name.

use super::auth::{Authorizer, Identity};
use super::exceptions::ExceptionHandler;
use super::hub::EventHub;
use super::providers::Providers;
use super::registry::{InstanceRegistry, ServiceInstance};
use super::thunk::{EventRaiser, InstanceContext};
use crate::codec::{self, CodecError};
use crate::config::{ProtocolConfig, ServerConfig};
use crate::contract::{
    CatalogMetadata, ContractError, MethodDescriptor, MethodKind, ServiceContract, ServiceMetadata,
};
use crate::error::{DispatchError, RpcError};
use crate::protocol::{HandlerId, MethodKey, RpcHead};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

type ServiceObject = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(InstanceContext) -> ServiceObject + Send + Sync>;
type Invoker =
    Arc<dyn Fn(ServiceObject, CallContext, Vec<Value>) -> BoxFuture<'static, Result<Value, InvokeError>> + Send + Sync>;

/// Request-scoped state handed to every invoker.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub head: RpcHead,
    pub identity: Identity,
    pub instance_id: Uuid,
}

enum InvokeError {
    Arguments(CodecError),
    Service(anyhow::Error),
}

/// One interface bound to its implementation.
pub struct ServiceBinding {
    contract: Arc<ServiceContract>,
    implementation: &'static str,
    factory: Factory,
    invokers: HashMap<MethodKey, Invoker>,
    authorizer: Option<Arc<dyn Authorizer>>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
}

impl ServiceBinding {
    /// Start binding a service type to a contract.
    ///
    /// `factory` builds a fresh service object for each new instance id.
    pub fn builder<S, F>(contract: ServiceContract, factory: F) -> ServiceBindingBuilder<S>
    where
        S: Send + Sync + 'static,
        F: Fn(InstanceContext) -> S + Send + Sync + 'static,
    {
        ServiceBindingBuilder {
            contract,
            factory: Arc::new(move |ctx: InstanceContext| Arc::new(factory(ctx)) as ServiceObject),
            invokers: HashMap::new(),
            authorizer: None,
            exception_handler: None,
            _service: std::marker::PhantomData,
        }
    }

    pub fn contract(&self) -> &ServiceContract {
        &self.contract
    }

    pub fn metadata(&self) -> ServiceMetadata {
        ServiceMetadata {
            contract: (*self.contract).clone(),
            implementation: self.implementation.to_string(),
        }
    }
}

pub struct ServiceBindingBuilder<S> {
    contract: ServiceContract,
    factory: Factory,
    invokers: HashMap<MethodKey, Invoker>,
    authorizer: Option<Arc<dyn Authorizer>>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    _service: std::marker::PhantomData<fn() -> S>,
}

impl<S: Send + Sync + 'static> ServiceBindingBuilder<S> {
    /// Bind a method key to a handler.
    ///
    /// Arguments arrive as a tuple in parameter order (`()` for none, `(T,)`
    /// for one). The return value is ignored for void shapes.
    pub fn method<A, R, F, Fut>(mut self, key: MethodKey, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |service: ServiceObject, ctx: CallContext, args: Vec<Value>| {
            let handler = handler.clone();
            async move {
                let service = service.downcast::<S>().map_err(|_| {
                    InvokeError::Service(anyhow::anyhow!("service object has an unexpected type"))
                })?;
                let args: A = codec::from_arguments(args).map_err(InvokeError::Arguments)?;
                let value = handler(service, ctx, args).await.map_err(InvokeError::Service)?;
                serde_json::to_value(value).map_err(|e| InvokeError::Service(e.into()))
            }
            .boxed()
        });
        self.invokers.insert(key, invoker);
        self
    }

    /// Authorizer used instead of the server-wide one.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Exception hook used instead of the server-wide one.
    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Check that every callable method has a handler.
    pub fn build(self) -> Result<ServiceBinding, ContractError> {
        for method in &self.contract.methods {
            if matches!(method.kind, MethodKind::Call) && !self.invokers.contains_key(&method.key) {
                return Err(ContractError::UnboundMethod {
                    interface: self.contract.full_name(),
                    method: method.name.clone(),
                });
            }
        }
        Ok(ServiceBinding {
            contract: Arc::new(self.contract),
            implementation: std::any::type_name::<S>(),
            factory: self.factory,
            invokers: self.invokers,
            authorizer: self.authorizer,
            exception_handler: self.exception_handler,
        })
    }
}

/// Immutable table of bound services, built once at startup.
pub struct ServiceCatalog {
    version: u32,
    bindings: HashMap<(String, String), Arc<ServiceBinding>>,
}

impl ServiceCatalog {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            bindings: HashMap::new(),
        }
    }

    pub fn with_service(mut self, binding: ServiceBinding) -> Result<Self, ContractError> {
        let key = (
            binding.contract.namespace.clone(),
            binding.contract.type_name.clone(),
        );
        if self.bindings.contains_key(&key) {
            return Err(ContractError::DuplicateService(binding.contract.full_name()));
        }
        self.bindings.insert(key, Arc::new(binding));
        Ok(self)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn binding(&self, namespace: &str, type_name: &str) -> Option<&Arc<ServiceBinding>> {
        self.bindings
            .get(&(namespace.to_string(), type_name.to_string()))
    }

    pub fn metadata(&self) -> CatalogMetadata {
        let mut services: Vec<_> = self.bindings.values().map(|b| b.metadata()).collect();
        services.sort_by_key(|s| s.contract.full_name());
        CatalogMetadata {
            version: self.version,
            services,
        }
    }
}

/// A POST as seen by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// Raw `meta` header.
    pub meta: Option<String>,
    /// Declared `Content-Length`, if any.
    pub content_length: Option<u64>,
    pub body: bytes::Bytes,
}

/// Status and encoded body to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl OutboundResponse {
    fn no_content() -> Self {
        Self {
            status: 204,
            body: Vec::new(),
        }
    }
}

enum Outcome {
    Empty,
    Value(Vec<u8>),
}

/// Resolves and runs unary calls; owns the registry and the event hub.
pub struct ServerDispatcher {
    catalog: Arc<ServiceCatalog>,
    providers: Providers,
    config: ServerConfig,
    registry: Arc<InstanceRegistry>,
    hub: Arc<EventHub>,
}

impl ServerDispatcher {
    pub fn new(catalog: ServiceCatalog, providers: Providers, config: ServerConfig) -> Arc<Self> {
        let hub = Arc::new(EventHub::new(providers.event_codec.clone(), config.event_timeout));
        Arc::new(Self {
            catalog: Arc::new(catalog),
            registry: Arc::new(InstanceRegistry::new(&config)),
            hub,
            providers,
            config,
        })
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metadata(&self) -> CatalogMetadata {
        self.catalog.metadata()
    }

    /// Run one request through the pipeline.
    pub async fn dispatch(&self, request: InboundRequest) -> OutboundResponse {
        match self.run(request).await {
            Ok(Outcome::Empty) => OutboundResponse::no_content(),
            Ok(Outcome::Value(body)) => OutboundResponse { status: 200, body },
            Err(err) => self.reject(err),
        }
    }

    /// Encode a rejection as a response.
    pub fn reject(&self, err: DispatchError) -> OutboundResponse {
        let status = err.status_code();
        let wire = err.to_rpc_error();
        let body = serde_json::to_value(&wire)
            .map_err(|e| CodecError::Encode(e.to_string()))
            .and_then(|value| self.providers.codec.encode(&value))
            .unwrap_or_else(|e| {
                error!("failed to encode rpc error: {}", e);
                Vec::new()
            });
        OutboundResponse { status, body }
    }

    async fn run(&self, request: InboundRequest) -> Result<Outcome, DispatchError> {
        // Size guard
        let limit = ProtocolConfig::MAX_REQUEST_BYTES;
        if request.content_length.is_some_and(|len| len > limit) || request.body.len() as u64 > limit {
            return Err(DispatchError::PayloadTooLarge);
        }

        // Head
        let raw = request
            .meta
            .as_deref()
            .ok_or_else(|| DispatchError::Protocol(DispatchError::MISSING_METADATA.into()))?;
        let head = self.providers.head_codec.decode_head(raw).map_err(|e| {
            debug!("undecodable rpc head: {}", e);
            DispatchError::Protocol(DispatchError::MISSING_METADATA.into())
        })?;

        // Interface and method
        let binding = self
            .catalog
            .binding(&head.namespace, &head.type_name)
            .ok_or_else(|| DispatchError::Protocol(DispatchError::UNKNOWN_INTERFACE.into()))?;
        let method = binding
            .contract
            .method(head.method_key)
            .filter(|m| m.is_event_op() == head.event_op)
            .ok_or_else(|| DispatchError::Protocol(DispatchError::UNKNOWN_METHOD.into()))?;

        // Instance
        let instance = self.instance(binding, head.instance_id)?;

        // Authorization
        let identity = self.authorize(binding, method, head.token.as_deref())?;

        // Arguments
        let names = method.param_names();
        let args = codec::decode_arguments(self.providers.codec.as_ref(), &request.body, &names)
            .map_err(|e| DispatchError::Protocol(format!("invalid rpc request arguments, {}", e)))?;

        if head.event_op {
            self.event_op(&instance, method, args)?;
            return Ok(Outcome::Empty);
        }

        let invoker = binding
            .invokers
            .get(&head.method_key)
            .ok_or_else(|| DispatchError::Protocol(DispatchError::UNKNOWN_METHOD.into()))?;
        let ctx = CallContext {
            head: head.clone(),
            identity,
            instance_id: instance.id,
        };
        let call = AssertUnwindSafe(invoker(instance.service.clone(), ctx, args)).catch_unwind();
        let deadline = Duration::from_millis(head.timeout_ms);
        let result = if deadline.is_zero() {
            call.await
        } else {
            match tokio::time::timeout(deadline, call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("{}.{} timed out after {:?}", head.interface_name(), head.method_name, deadline);
                    return Err(DispatchError::Business(RpcError::new(format!(
                        "rpc invocation timed out after {} ms",
                        head.timeout_ms
                    ))));
                }
            }
        };

        let value = match result {
            Ok(Ok(value)) => value,
            Ok(Err(InvokeError::Arguments(e))) => {
                return Err(DispatchError::Protocol(format!("invalid rpc request arguments, {}", e)))
            }
            Ok(Err(InvokeError::Service(err))) => return Err(self.handle_exception(binding, &head, err)),
            Err(panic) => {
                let err = anyhow::anyhow!("rpc method panicked: {}", panic_message(panic.as_ref()));
                return Err(self.handle_exception(binding, &head, err));
            }
        };

        if !method.returns.has_value() {
            return Ok(Outcome::Empty);
        }
        let body = self.providers.codec.encode(&value).map_err(|e| {
            DispatchError::Business(RpcError::new(format!("failed to encode rpc result, {}", e)))
        })?;
        Ok(Outcome::Value(body))
    }

    fn instance(&self, binding: &Arc<ServiceBinding>, instance_id: Uuid) -> Result<Arc<ServiceInstance>, DispatchError> {
        let interface = binding.contract.full_name();
        self.registry.get_or_create(instance_id, &interface, || {
            let events = EventRaiser::new(instance_id, binding.contract.clone(), self.hub.clone());
            let service = (binding.factory)(InstanceContext {
                instance_id,
                events: events.clone(),
            });
            ServiceInstance {
                id: instance_id,
                interface: interface.clone(),
                service,
                events,
            }
        })
    }

    fn authorize(
        &self,
        binding: &ServiceBinding,
        method: &MethodDescriptor,
        token: Option<&str>,
    ) -> Result<Identity, DispatchError> {
        let authorizer = binding
            .authorizer
            .as_ref()
            .unwrap_or(&self.providers.authorizer);
        let identity = authorizer.authorize(token).map_err(|e| {
            debug!("authorization refused: {}", e);
            DispatchError::Unauthorized
        })?;
        if !binding.contract.access_for(method).permits(&identity) {
            debug!("{} denied for {:?}", method.name, identity.name);
            return Err(DispatchError::Unauthorized);
        }
        Ok(identity)
    }

    fn event_op(
        &self,
        instance: &ServiceInstance,
        method: &MethodDescriptor,
        args: Vec<Value>,
    ) -> Result<(), DispatchError> {
        let (handler_id,): (HandlerId,) = codec::from_arguments(args)
            .map_err(|e| DispatchError::Protocol(format!("invalid rpc request arguments, {}", e)))?;
        if handler_id == ProtocolConfig::LIVENESS_HANDLER_ID {
            return Err(DispatchError::Protocol(format!(
                "invalid rpc request arguments, handler id {} is reserved",
                handler_id
            )));
        }
        match &method.kind {
            MethodKind::EventAdd(event) => {
                instance.events.subscribe(event, handler_id);
            }
            MethodKind::EventRemove(event) => {
                instance.events.unsubscribe(event, handler_id);
            }
            MethodKind::Call => {
                return Err(DispatchError::Protocol(DispatchError::UNKNOWN_METHOD.into()))
            }
        }
        Ok(())
    }

    /// Run the exception hook once; a failing hook yields a generic error.
    fn handle_exception(&self, binding: &ServiceBinding, head: &RpcHead, err: anyhow::Error) -> DispatchError {
        let hook = binding
            .exception_handler
            .as_ref()
            .unwrap_or(&self.providers.exception_handler);
        match std::panic::catch_unwind(AssertUnwindSafe(|| hook.handle(head, &err))) {
            Ok(Ok(wire)) => DispatchError::Business(wire),
            Ok(Err(hook_err)) => {
                error!("exception handler failed: {:#}", hook_err);
                DispatchError::Business(RpcError::new("rpc service error, exception handler failed."))
            }
            Err(_) => {
                error!("exception handler panicked");
                DispatchError::Business(RpcError::new("rpc service error, exception handler failed."))
            }
        }
    }

    /// Spawn the liveness driver.
    ///
    /// Every tick it probes each connected socket, keeps the instances behind
    /// them from idling out, and retires hub state of evicted instances.
    pub fn spawn_liveness(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::downgrade(self);
        let interval = self.config.liveness_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                dispatcher.liveness_tick();
            }
        })
    }

    /// One liveness pass.
    pub fn liveness_tick(&self) {
        for instance_id in self.hub.probe_connected() {
            self.registry.touch(instance_id);
        }
        for instance_id in self.hub.subscribed_instances() {
            if !self.registry.contains(instance_id) {
                debug!("instance {} evicted, retiring its event state", instance_id);
                self.hub.retire_instance(instance_id);
            }
        }
    }

    /// Close every event socket and drop all instances.
    pub fn shutdown(&self) {
        self.hub.shutdown();
        self.registry.clear();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_arguments, HeadCodec, JsonCodec, WireCodec};
    use crate::contract::{Access, ReturnShape};
    use crate::server::auth::StaticTokenAuthorizer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        hits: Arc<AtomicUsize>,
    }

    fn contract() -> ServiceContract {
        ServiceContract::builder("Samples", "ICounter")
            .method(1, "Add", &[("a", "i32"), ("b", "i32")], ReturnShape::Value)
            .method(2, "Bump", &[], ReturnShape::Void)
            .method(3, "Secret", &[], ReturnShape::Value)
            .access(Access::Authenticated)
            .method(4, "Fail", &[], ReturnShape::Void)
            .method(5, "Panic", &[], ReturnShape::Void)
            .method(6, "Echo", &[("data", "string")], ReturnShape::Value)
            .event("Changed", (10, 11), &[("value", "string")], false, ReturnShape::Value)
            .build()
            .unwrap()
    }

    fn dispatcher(hits: Arc<AtomicUsize>) -> Arc<ServerDispatcher> {
        let binding = ServiceBinding::builder(contract(), move |_ctx| Counter { hits: hits.clone() })
            .method(1, |_svc: Arc<Counter>, _ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
            .method(2, |svc: Arc<Counter>, _ctx, (): ()| async move {
                svc.hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .method(3, |svc: Arc<Counter>, ctx: CallContext, (): ()| async move {
                svc.hits.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.identity.name)
            })
            .method(4, |_svc: Arc<Counter>, _ctx, (): ()| async move {
                Err::<(), _>(anyhow::anyhow!("disk full").context("save failed"))
            })
            .method(5, |_svc: Arc<Counter>, _ctx, (): ()| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            })
            .method(6, |_svc: Arc<Counter>, _ctx, (data,): (String,)| async move { Ok(data.len()) })
            .build()
            .unwrap();
        let catalog = ServiceCatalog::new(1).with_service(binding).unwrap();
        let providers = Providers::default().with_authorizer(Arc::new(
            StaticTokenAuthorizer::new().with_token("good", Identity::user("ada", &[])),
        ));
        ServerDispatcher::new(catalog, providers, ServerConfig::default())
    }

    fn head(key: MethodKey, instance: Uuid) -> RpcHead {
        RpcHead {
            namespace: "Samples".into(),
            type_name: "ICounter".into(),
            method_name: format!("m{}", key),
            method_key: key,
            instance_id: instance,
            token: None,
            event_op: false,
            timeout_ms: 5_000,
        }
    }

    fn request(head: &RpcHead, names: &[&str], args: &[Value]) -> InboundRequest {
        let body = encode_arguments(&JsonCodec, names, args).unwrap();
        InboundRequest {
            meta: Some(JsonCodec.encode_head(head).unwrap()),
            content_length: Some(body.len() as u64),
            body: body.into(),
        }
    }

    fn error_of(response: &OutboundResponse) -> RpcError {
        codec::from_value(JsonCodec.decode(&response.body).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_value_call() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let response = d
            .dispatch(request(&head(1, Uuid::new_v4()), &["a", "b"], &[json!(2), json!(3)]))
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(JsonCodec.decode(&response.body).unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_void_call_is_no_content() {
        let hits = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(hits.clone());
        let response = d.dispatch(request(&head(2, Uuid::new_v4()), &[], &[])).await;
        assert_eq!(response, OutboundResponse { status: 204, body: vec![] });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_and_bad_metadata() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let response = d.dispatch(InboundRequest::default()).await;
        assert_eq!(response.status, 500);
        assert_eq!(error_of(&response).message, DispatchError::MISSING_METADATA);

        let garbled = InboundRequest {
            meta: Some("{not json".into()),
            ..Default::default()
        };
        assert_eq!(error_of(&d.dispatch(garbled).await).message, DispatchError::MISSING_METADATA);
    }

    #[tokio::test]
    async fn test_unknown_interface_and_method() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let mut unknown_interface = head(1, Uuid::new_v4());
        unknown_interface.type_name = "IMissing".into();
        let response = d.dispatch(request(&unknown_interface, &[], &[])).await;
        assert_eq!(error_of(&response).message, DispatchError::UNKNOWN_INTERFACE);

        let response = d.dispatch(request(&head(99, Uuid::new_v4()), &[], &[])).await;
        assert_eq!(response.status, 500);
        let err = error_of(&response);
        assert_eq!(err.message, DispatchError::UNKNOWN_METHOD);
        assert!(err.stack_trace.is_none());
    }

    #[tokio::test]
    async fn test_denied_token_never_runs_business_code() {
        let hits = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(hits.clone());

        let mut bad = head(3, Uuid::new_v4());
        bad.token = Some("forged".into());
        let response = d.dispatch(request(&bad, &[], &[])).await;
        assert_eq!(response.status, 401);
        let err = error_of(&response);
        assert_eq!(err.message, "access denied.");
        assert!(err.stack_trace.is_none());

        // Anonymous caller on an authenticated method.
        let response = d.dispatch(request(&head(3, Uuid::new_v4()), &[], &[])).await;
        assert_eq!(response.status, 401);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let mut good = head(3, Uuid::new_v4());
        good.token = Some("good".into());
        let response = d.dispatch(request(&good, &[], &[])).await;
        assert_eq!(response.status, 200);
        assert_eq!(JsonCodec.decode(&response.body).unwrap(), json!("ada"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_business_failure_goes_through_hook() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let response = d.dispatch(request(&head(4, Uuid::new_v4()), &[], &[])).await;
        assert_eq!(response.status, 500);
        let err = error_of(&response);
        assert_eq!(err.message, "save failed");
        assert_eq!(err.stack_trace.as_deref(), Some("caused by: disk full"));
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let response = d.dispatch(request(&head(5, Uuid::new_v4()), &[], &[])).await;
        assert_eq!(response.status, 500);
        assert!(error_of(&response).message.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_failing_exception_hook_is_replaced() {
        struct Broken;
        impl ExceptionHandler for Broken {
            fn handle(&self, _head: &RpcHead, _err: &anyhow::Error) -> anyhow::Result<RpcError> {
                anyhow::bail!("hook failed")
            }
        }
        let hits = Arc::new(AtomicUsize::new(0));
        let binding = ServiceBinding::builder(contract(), move |_ctx| Counter { hits: hits.clone() })
            .method(1, |_svc: Arc<Counter>, _ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
            .method(2, |_svc: Arc<Counter>, _ctx, (): ()| async move { Ok(()) })
            .method(3, |_svc: Arc<Counter>, _ctx, (): ()| async move { Ok(0) })
            .method(4, |_svc: Arc<Counter>, _ctx, (): ()| async move {
                Err::<(), _>(anyhow::anyhow!("original"))
            })
            .method(5, |_svc: Arc<Counter>, _ctx, (): ()| async move { Ok(()) })
            .method(6, |_svc: Arc<Counter>, _ctx, (s,): (String,)| async move { Ok(s) })
            .exception_handler(Arc::new(Broken))
            .build()
            .unwrap();
        let d = ServerDispatcher::new(
            ServiceCatalog::new(1).with_service(binding).unwrap(),
            Providers::default(),
            ServerConfig::default(),
        );
        let response = d.dispatch(request(&head(4, Uuid::new_v4()), &[], &[])).await;
        let err = error_of(&response);
        assert_eq!(err.message, "rpc service error, exception handler failed.");
    }

    #[tokio::test]
    async fn test_request_size_boundary() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let limit = ProtocolConfig::MAX_REQUEST_BYTES as usize;
        // `{"data":"…"}` wraps the payload in 11 bytes.
        let payload = "x".repeat(limit - 11);
        let exact = request(&head(6, Uuid::new_v4()), &["data"], &[json!(payload)]);
        assert_eq!(exact.body.len(), limit);
        let response = d.dispatch(exact).await;
        assert_eq!(response.status, 200);
        assert_eq!(JsonCodec.decode(&response.body).unwrap(), json!(limit - 11));

        let payload = "x".repeat(limit - 10);
        let over = request(&head(6, Uuid::new_v4()), &["data"], &[json!(payload)]);
        assert_eq!(over.body.len(), limit + 1);
        let response = d.dispatch(over).await;
        assert_eq!(response.status, 500);
        assert_eq!(error_of(&response).message, "request data is limited in 10Mb");

        let declared = InboundRequest {
            content_length: Some(limit as u64 + 1),
            ..Default::default()
        };
        assert_eq!(error_of(&d.dispatch(declared).await).message, "request data is limited in 10Mb");
    }

    #[tokio::test]
    async fn test_event_ops_route_to_hub() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let instance = Uuid::new_v4();
        let mut add = head(10, instance);
        add.event_op = true;
        for _ in 0..2 {
            let response = d.dispatch(request(&add, &["handlerId"], &[json!(77)])).await;
            assert_eq!(response.status, 204);
        }
        assert_eq!(d.hub().subscription_count(instance), 1);

        let mut remove = head(11, instance);
        remove.event_op = true;
        let response = d.dispatch(request(&remove, &["handlerId"], &[json!(77)])).await;
        assert_eq!(response.status, 204);
        assert_eq!(d.hub().subscription_count(instance), 0);

        // The liveness sentinel can't be subscribed.
        let response = d.dispatch(request(&add, &["handlerId"], &[json!(0)])).await;
        assert_eq!(response.status, 500);

        // An event op must be flagged as one.
        let unflagged = head(10, instance);
        let response = d.dispatch(request(&unflagged, &["handlerId"], &[json!(5)])).await;
        assert_eq!(error_of(&response).message, DispatchError::UNKNOWN_METHOD);
    }

    #[tokio::test]
    async fn test_bad_arguments_are_protocol_errors() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let response = d
            .dispatch(request(&head(1, Uuid::new_v4()), &["a", "b"], &[json!("two"), json!(3)]))
            .await;
        assert_eq!(response.status, 500);
        let err = error_of(&response);
        assert!(err.message.starts_with("invalid rpc request arguments"));
        assert!(err.stack_trace.is_none());
    }

    #[tokio::test]
    async fn test_unbound_method_rejected_at_build() {
        let result = ServiceBinding::builder(contract(), |_ctx| Counter {
            hits: Arc::new(AtomicUsize::new(0)),
        })
        .method(1, |_svc: Arc<Counter>, _ctx, (a, b): (i32, i32)| async move { Ok(a + b) })
        .build();
        assert!(matches!(result, Err(ContractError::UnboundMethod { .. })));
    }

    #[tokio::test]
    async fn test_liveness_retires_evicted_instances() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let instance = Uuid::new_v4();
        let mut add = head(10, instance);
        add.event_op = true;
        d.dispatch(request(&add, &["handlerId"], &[json!(8)])).await;
        assert_eq!(d.hub().subscription_count(instance), 1);

        d.liveness_tick();
        assert_eq!(d.hub().subscription_count(instance), 1);

        d.registry().remove(instance);
        d.liveness_tick();
        assert_eq!(d.hub().subscription_count(instance), 0);
    }

    #[test]
    fn test_metadata_lists_services() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let metadata = d.metadata();
        assert_eq!(metadata.version, 1);
        let service = metadata.service("Samples", "ICounter").unwrap();
        assert!(service.implementation.ends_with("Counter"));
        assert_eq!(service.contract.methods.len(), 8);
    }
}
