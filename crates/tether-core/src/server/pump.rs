//! Event pump: drains one instance's channel onto its WebSocket.
//!
//! Deliveries are handled strictly one at a time. An event is written as a
//! frame and the pump waits for the client's reply before taking the next
//! item, so each instance sees its events in FIFO order. While idle the pump
//! also watches the socket, so a client disconnect is noticed right away
//! rather than on the next send.

use super::channel::{self, Delivery, EventMessage};
use crate::codec::WireCodec;
use crate::error::TetherError;
use crate::protocol::{decode_event_frame, encode_event_frame, EventReply, HandlerId};
use crate::socket::FrameSocket;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The server asked for the socket to be closed.
    Closed,
    /// The client went away.
    Disconnected(String),
    /// The socket was torn down after a failure on the server side.
    Aborted(String),
}

impl PumpExit {
    pub fn reason(&self) -> &str {
        match self {
            PumpExit::Closed => "closed by server",
            PumpExit::Disconnected(reason) | PumpExit::Aborted(reason) => reason,
        }
    }
}

pub struct EventPump<S: FrameSocket> {
    instance_id: Uuid,
    socket: S,
    queue: mpsc::UnboundedReceiver<Delivery>,
    codec: Arc<dyn WireCodec>,
    reply_timeout: Duration,
    in_flight: HashMap<HandlerId, EventMessage>,
}

impl<S: FrameSocket> EventPump<S> {
    pub fn new(
        instance_id: Uuid,
        socket: S,
        queue: mpsc::UnboundedReceiver<Delivery>,
        codec: Arc<dyn WireCodec>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            instance_id,
            socket,
            queue,
            codec,
            reply_timeout,
            in_flight: HashMap::new(),
        }
    }

    /// Run until the socket or the channel closes.
    ///
    /// Every message still queued or awaiting a reply when the loop ends is
    /// failed with a connection-broken error.
    pub async fn run(mut self) -> PumpExit {
        info!("event pump started for instance {}", self.instance_id);
        let exit = loop {
            tokio::select! {
                delivery = self.queue.recv() => match delivery {
                    None | Some(Delivery::Close) => break PumpExit::Closed,
                    Some(Delivery::Probe) => {
                        if let Err(e) = self.socket.ping().await {
                            break PumpExit::Disconnected(format!("liveness probe failed: {}", e));
                        }
                    }
                    Some(Delivery::Event(message)) => {
                        if let Err(exit) = self.deliver(message).await {
                            break exit;
                        }
                    }
                },
                frame = self.socket.next_frame() => match frame {
                    None => break PumpExit::Disconnected("closed by client".into()),
                    Some(Err(e)) => break PumpExit::Disconnected(e.to_string()),
                    Some(Ok(frame)) => {
                        warn!(
                            "instance {}: dropping unsolicited {} byte frame",
                            self.instance_id,
                            frame.len()
                        );
                    }
                },
            }
        };
        self.shutdown(&exit).await;
        exit
    }

    async fn deliver(&mut self, message: EventMessage) -> Result<(), PumpExit> {
        if message.is_abandoned() {
            debug!(
                "instance {}: skipping abandoned {} invocation",
                self.instance_id, message.event_name
            );
            return Ok(());
        }

        let handler_id = message.handler_id;
        let frame = match encode_event_frame(self.codec.as_ref(), handler_id, &message.payload()) {
            Ok(frame) => frame,
            Err(e) => {
                message.fail(TetherError::Codec(e));
                return Ok(());
            }
        };

        debug!(
            "instance {}: invoking {} on handler {}",
            self.instance_id, message.event_name, handler_id
        );
        if let Err(e) = self.socket.send_frame(frame).await {
            message.fail(TetherError::connection_broken(self.instance_id, e.to_string()));
            return Err(PumpExit::Disconnected(e.to_string()));
        }
        self.in_flight.insert(handler_id, message);

        let deadline = tokio::time::sleep(self.reply_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    if let Some(message) = self.in_flight.remove(&handler_id) {
                        message.fail(TetherError::Timeout(self.reply_timeout));
                    }
                    return Err(PumpExit::Aborted(format!(
                        "no reply from handler {} within {:?}",
                        handler_id, self.reply_timeout
                    )));
                }
                frame = self.socket.next_frame() => {
                    let frame = match frame {
                        None => return Err(PumpExit::Disconnected("closed by client".into())),
                        Some(Err(e)) => return Err(PumpExit::Disconnected(e.to_string())),
                        Some(Ok(frame)) => frame,
                    };
                    match decode_event_frame::<EventReply>(self.codec.as_ref(), &frame) {
                        Ok((id, reply)) => match self.in_flight.remove(&id) {
                            Some(message) => {
                                message.complete(reply.into_result().map_err(TetherError::EventHandler));
                                return Ok(());
                            }
                            None => warn!(
                                "instance {}: reply for unknown handler {} dropped",
                                self.instance_id, id
                            ),
                        },
                        Err(e) => {
                            if let Some(message) = self.in_flight.remove(&handler_id) {
                                message.fail(TetherError::ResponseDecode {
                                    message: "invalid event reply".into(),
                                    source: Some(e),
                                });
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self, exit: &PumpExit) {
        let reason = exit.reason().to_string();
        for (_, message) in self.in_flight.drain() {
            message.fail(TetherError::connection_broken(self.instance_id, reason.clone()));
        }
        let failed = channel::drain(&mut self.queue, self.instance_id, &reason);
        if !matches!(exit, PumpExit::Disconnected(_)) {
            let _ = self.socket.close().await;
        }
        info!(
            "disconnect ws connection on instance {} ({}), {} queued event(s) failed",
            self.instance_id, reason, failed
        );
    }
}
