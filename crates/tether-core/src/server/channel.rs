//! Per-instance event queue.
//!
//! Every item a pump handles goes through one unbounded FIFO: event
//! invocations, liveness probes and the close signal. The receiver half is
//! handed to at most one pump at a time.

use crate::contract::ReturnShape;
use crate::error::TetherError;
use crate::protocol::{EventPayload, HandlerId};
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Outcome of one delivered event invocation.
pub type Completion = oneshot::Sender<Result<Value, TetherError>>;

/// One server-to-client event invocation awaiting its reply.
#[derive(Debug)]
pub struct EventMessage {
    pub handler_id: HandlerId,
    pub event_name: String,
    pub argument_types: Vec<String>,
    pub arguments: Vec<Value>,
    pub returns: ReturnShape,
    completion: Completion,
}

impl EventMessage {
    pub fn new(
        handler_id: HandlerId,
        event_name: impl Into<String>,
        argument_types: Vec<String>,
        arguments: Vec<Value>,
        returns: ReturnShape,
    ) -> (Self, oneshot::Receiver<Result<Value, TetherError>>) {
        let (completion, rx) = oneshot::channel();
        let message = Self {
            handler_id,
            event_name: event_name.into(),
            argument_types,
            arguments,
            returns,
            completion,
        };
        (message, rx)
    }

    /// Wire payload of this invocation.
    pub fn payload(&self) -> EventPayload {
        EventPayload {
            types: self.argument_types.clone(),
            args: self.arguments.clone(),
        }
    }

    /// The raiser stopped waiting (timed out or was dropped).
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    pub fn complete(self, result: Result<Value, TetherError>) {
        let _ = self.completion.send(result);
    }

    pub fn fail(self, err: TetherError) {
        self.complete(Err(err));
    }
}

/// Channel item.
#[derive(Debug)]
pub enum Delivery {
    Event(EventMessage),
    /// Liveness probe; becomes a socket ping, never a data frame.
    Probe,
    /// Close the socket and stop the pump.
    Close,
}

/// FIFO of deliveries for one service instance.
#[derive(Debug)]
pub struct EventChannel {
    instance_id: Uuid,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl EventChannel {
    pub fn new(instance_id: Uuid) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            instance_id,
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Queue an event. Hands the message back if the channel is shut down.
    pub fn enqueue(&self, message: EventMessage) -> Result<(), EventMessage> {
        self.sender
            .send(Delivery::Event(message))
            .map_err(|err| match err.0 {
                Delivery::Event(message) => message,
                _ => unreachable!("only events are handed back"),
            })
    }

    pub fn probe(&self) -> bool {
        self.sender.send(Delivery::Probe).is_ok()
    }

    pub fn close(&self) -> bool {
        self.sender.send(Delivery::Close).is_ok()
    }

    /// Take the receiving half for a pump.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether a pump currently owns the receiving half.
    pub fn is_attached(&self) -> bool {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Fail everything still queued on a receiver that is being retired.
pub fn drain(queue: &mut mpsc::UnboundedReceiver<Delivery>, instance_id: Uuid, reason: &str) -> usize {
    queue.close();
    let mut failed = 0;
    while let Ok(delivery) = queue.try_recv() {
        if let Delivery::Event(message) = delivery {
            message.fail(TetherError::connection_broken(instance_id, reason));
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: HandlerId) -> (EventMessage, oneshot::Receiver<Result<Value, TetherError>>) {
        EventMessage::new(id, "Changed", vec!["string".into()], vec![json!("x")], ReturnShape::Value)
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let channel = EventChannel::new(Uuid::new_v4());
        let mut rx = channel.take_receiver().unwrap();
        for id in 1..=3 {
            channel.enqueue(message(id).0).unwrap();
        }
        channel.probe();
        let mut seen = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                Delivery::Event(m) => seen.push(m.handler_id),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(matches!(rx.recv().await.unwrap(), Delivery::Probe));
    }

    #[tokio::test]
    async fn test_receiver_taken_once() {
        let channel = EventChannel::new(Uuid::new_v4());
        assert!(!channel.is_attached());
        assert!(channel.take_receiver().is_some());
        assert!(channel.is_attached());
        assert!(channel.take_receiver().is_none());
    }

    #[tokio::test]
    async fn test_drain_fails_pending_with_connection_broken() {
        let instance = Uuid::new_v4();
        let channel = EventChannel::new(instance);
        let mut queue = channel.take_receiver().unwrap();
        let (msg, done) = message(4);
        channel.enqueue(msg).unwrap();

        assert_eq!(drain(&mut queue, instance, "closed by client"), 1);
        let err = done.await.unwrap().unwrap_err();
        assert!(matches!(err, TetherError::ConnectionBroken { instance_id, .. } if instance_id == instance));

        // Retired channels hand messages back.
        assert!(channel.enqueue(message(5).0).is_err());
    }

    #[test]
    fn test_abandoned_message() {
        let (msg, done) = message(1);
        assert!(!msg.is_abandoned());
        drop(done);
        assert!(msg.is_abandoned());
    }
}
