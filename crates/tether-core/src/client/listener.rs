//! Client-side event listener.
//!
//! One task per proxy instance owns the event socket. It reads pushed
//! invocations, runs the matching local handler on its own task and writes
//! the reply back under the same handler id. Replies can therefore complete
//! out of order; the server correlates them by id.

use crate::codec::{self, CodecError, WireCodec};
use crate::contract::EventDescriptor;
use crate::error::RpcError;
use crate::protocol::{decode_frame, encode_event_frame, EventPayload, EventReply, HandlerId};
use crate::socket::FrameSocket;
use crate::subscription::SubscriptionTable;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stands in for the remote sender argument of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSender {
    pub instance_id: Uuid,
    pub interface: String,
}

/// One pushed invocation handed to a local handler.
#[derive(Debug, Clone)]
pub struct EventInvocation {
    pub event: String,
    pub handler_id: HandlerId,
    /// Present when the event declares a sender parameter.
    pub sender: Option<EventSender>,
    /// Declared parameter types, sender excluded.
    pub types: Vec<String>,
    /// Arguments in declaration order, sender excluded.
    pub args: Vec<Value>,
}

impl EventInvocation {
    /// Convert the arguments into a typed tuple.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        codec::from_arguments(self.args.clone())
    }
}

pub type EventHandlerFn =
    Arc<dyn Fn(EventInvocation) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct LocalHandler {
    pub event: Arc<EventDescriptor>,
    pub handler: EventHandlerFn,
}

/// Owns the listener task; dropping it closes the socket.
pub(crate) struct ListenerHandle {
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the socket and wait for the task to exit.
    pub async fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

pub(crate) struct EventListener<S: FrameSocket> {
    instance_id: Uuid,
    interface: String,
    socket: S,
    handlers: Arc<SubscriptionTable<LocalHandler>>,
    codec: Arc<dyn WireCodec>,
    keep_alive: Duration,
}

impl<S: FrameSocket> EventListener<S> {
    pub fn new(
        instance_id: Uuid,
        interface: String,
        socket: S,
        handlers: Arc<SubscriptionTable<LocalHandler>>,
        codec: Arc<dyn WireCodec>,
        keep_alive: Duration,
    ) -> Self {
        Self {
            instance_id,
            interface,
            socket,
            handlers,
            codec,
            keep_alive,
        }
    }

    pub fn spawn(self) -> ListenerHandle {
        let (close_tx, close_rx) = oneshot::channel();
        ListenerHandle {
            close_tx: Some(close_tx),
            task: tokio::spawn(self.run(close_rx)),
        }
    }

    async fn run(mut self, mut close_rx: oneshot::Receiver<()>) {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let start = tokio::time::Instant::now() + self.keep_alive;
        let mut keep_alive = tokio::time::interval_at(start, self.keep_alive);

        let reason = loop {
            tokio::select! {
                _ = &mut close_rx => {
                    let _ = self.socket.close().await;
                    break "closed locally".to_string();
                }
                Some(frame) = reply_rx.recv() => {
                    if let Err(e) = self.socket.send_frame(frame).await {
                        break format!("reply send failed: {}", e);
                    }
                }
                _ = keep_alive.tick() => {
                    if let Err(e) = self.socket.ping().await {
                        break format!("keep-alive failed: {}", e);
                    }
                }
                frame = self.socket.next_frame() => match frame {
                    Some(Ok(frame)) => self.dispatch(&frame, &reply_tx),
                    Some(Err(e)) => break format!("socket error: {}", e),
                    None => break "closed by server".to_string(),
                },
            }
        };
        info!("event listener for instance {} stopped: {}", self.instance_id, reason);
    }

    fn dispatch(&self, frame: &[u8], reply_tx: &mpsc::UnboundedSender<Vec<u8>>) {
        let (handler_id, payload) = match decode_frame(frame) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("dropping malformed event frame: {}", e);
                return;
            }
        };
        let payload = self
            .codec
            .decode(payload)
            .and_then(codec::from_value::<EventPayload>);
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                self.reply(
                    handler_id,
                    EventReply::error(RpcError::new(format!("invalid event payload: {}", e))),
                    reply_tx,
                );
                return;
            }
        };
        let Some((event, local)) = self.handlers.find(self.instance_id, handler_id) else {
            warn!("no local handler {} on instance {}", handler_id, self.instance_id);
            self.reply(
                handler_id,
                EventReply::error(RpcError::new(format!(
                    "no event handler {} on instance {}",
                    handler_id, self.instance_id
                ))),
                reply_tx,
            );
            return;
        };

        let invocation = self.invocation(event, handler_id, &local.event, payload);
        debug!("event {} -> handler {}", invocation.event, handler_id);
        let codec = self.codec.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe((local.handler)(invocation))
                .catch_unwind()
                .await;
            let reply = match outcome {
                Ok(Ok(value)) => EventReply::value(value),
                Ok(Err(e)) => EventReply::error(RpcError::from_error(&e)),
                Err(_) => EventReply::error(RpcError::new("event handler panicked")),
            };
            match encode_event_frame(codec.as_ref(), handler_id, &reply) {
                Ok(frame) => {
                    let _ = reply_tx.send(frame);
                }
                Err(e) => warn!("failed to encode reply for handler {}: {}", handler_id, e),
            }
        });
    }

    fn invocation(
        &self,
        event: String,
        handler_id: HandlerId,
        descriptor: &EventDescriptor,
        payload: EventPayload,
    ) -> EventInvocation {
        let EventPayload {
            mut types,
            mut args,
        } = payload;
        let sender = if descriptor.has_sender && !args.is_empty() {
            args.remove(0);
            if !types.is_empty() {
                types.remove(0);
            }
            Some(EventSender {
                instance_id: self.instance_id,
                interface: self.interface.clone(),
            })
        } else {
            None
        };
        EventInvocation {
            event,
            handler_id,
            sender,
            types,
            args,
        }
    }

    fn reply(&self, handler_id: HandlerId, reply: EventReply, reply_tx: &mpsc::UnboundedSender<Vec<u8>>) {
        match encode_event_frame(self.codec.as_ref(), handler_id, &reply) {
            Ok(frame) => {
                let _ = reply_tx.send(frame);
            }
            Err(e) => warn!("failed to encode reply for handler {}: {}", handler_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::contract::{ReturnShape, ServiceContract};
    use crate::protocol::decode_event_frame;
    use crate::socket::memory::{pair, MemorySocket};
    use crate::subscription::SubscriptionKey;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn contract() -> ServiceContract {
        ServiceContract::builder("demo", "Calculator")
            .event("Changed", (10, 11), &[("name", "string")], true, ReturnShape::Value)
            .event("Tick", (12, 13), &[("n", "int")], false, ReturnShape::Void)
            .build()
            .unwrap()
    }

    fn setup(
        keep_alive: Duration,
    ) -> (Uuid, Arc<SubscriptionTable<LocalHandler>>, ListenerHandle, MemorySocket) {
        let instance = Uuid::new_v4();
        let table = Arc::new(SubscriptionTable::new());
        let (client_end, server_end) = pair();
        let listener = EventListener::new(
            instance,
            "demo.Calculator".into(),
            client_end,
            table.clone(),
            Arc::new(JsonCodec),
            keep_alive,
        );
        (instance, table, listener.spawn(), server_end)
    }

    fn local<F>(event: &str, f: F) -> LocalHandler
    where
        F: Fn(EventInvocation) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let descriptor = contract().event(event).cloned().unwrap();
        let f = Arc::new(f);
        LocalHandler {
            event: Arc::new(descriptor),
            handler: Arc::new(move |inv: EventInvocation| {
                let f = f.clone();
                async move { f(inv) }.boxed()
            }),
        }
    }

    async fn push(server: &mut MemorySocket, id: HandlerId, payload: EventPayload) -> EventReply {
        let frame = encode_event_frame(&JsonCodec, id, &payload).unwrap();
        server.send_frame(frame).await.unwrap();
        let reply = server.next_frame().await.unwrap().unwrap();
        let (reply_id, reply) = decode_event_frame::<EventReply>(&JsonCodec, &reply).unwrap();
        assert_eq!(reply_id, id);
        reply
    }

    #[tokio::test]
    async fn test_handler_receives_sender_and_args() {
        let (instance, table, _handle, mut server) = setup(Duration::from_secs(60));
        let key = SubscriptionKey::new(instance, "Changed", 7);
        table.add(
            &key,
            local("Changed", move |inv| {
                let sender = inv.sender.clone().unwrap();
                assert_eq!(sender.interface, "demo.Calculator");
                let (name,): (String,) = inv.args()?;
                Ok(json!(name == "x"))
            }),
        );

        let reply = push(
            &mut server,
            7,
            EventPayload {
                types: vec!["sender".into(), "string".into()],
                args: vec![Value::Null, json!("x")],
            },
        )
        .await;
        assert_eq!(reply.into_result().unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_unknown_handler_replies_error() {
        let (_instance, _table, _handle, mut server) = setup(Duration::from_secs(60));
        let reply = push(
            &mut server,
            99,
            EventPayload {
                types: vec!["int".into()],
                args: vec![json!(1)],
            },
        )
        .await;
        assert!(reply.into_result().unwrap_err().message.contains("no event handler 99"));
    }

    #[tokio::test]
    async fn test_handler_error_is_returned() {
        let (instance, table, _handle, mut server) = setup(Duration::from_secs(60));
        table.add(
            &SubscriptionKey::new(instance, "Tick", 3),
            local("Tick", |_| Err(anyhow::anyhow!("tick rejected"))),
        );
        let reply = push(
            &mut server,
            3,
            EventPayload {
                types: vec!["int".into()],
                args: vec![json!(1)],
            },
        )
        .await;
        assert_eq!(reply.into_result().unwrap_err().message, "tick rejected");
    }

    #[tokio::test]
    async fn test_handler_panic_is_returned() {
        let (instance, table, _handle, mut server) = setup(Duration::from_secs(60));
        table.add(
            &SubscriptionKey::new(instance, "Tick", 4),
            local("Tick", |_| panic!("boom")),
        );
        let reply = push(
            &mut server,
            4,
            EventPayload {
                types: vec!["int".into()],
                args: vec![json!(1)],
            },
        )
        .await;
        assert!(reply.into_result().unwrap_err().message.contains("panicked"));
    }

    #[tokio::test]
    async fn test_keep_alive_pings() {
        let (_instance, _table, _handle, mut server) = setup(Duration::from_millis(20));
        let pings = server.pings();
        let reader = tokio::spawn(async move {
            let _ = server.next_frame().await;
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(pings.load(Ordering::SeqCst) >= 2);
        reader.abort();
    }

    #[tokio::test]
    async fn test_close_stops_task_and_socket() {
        let (_instance, _table, handle, mut server) = setup(Duration::from_secs(60));
        handle.close().await;
        assert!(server.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_server_close_ends_listener() {
        let (_instance, _table, handle, mut server) = setup(Duration::from_secs(60));
        server.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
