//! Message-bus contract: at-least-once deliveries with explicit ack/nack.
//!
//! The bus itself is an external collaborator. Pull and push sources alike
//! adapt to one downstream contract: a stream of `(topic, body bytes, ack
//! handle)`. The in-memory implementation here backs tests and single-node
//! deployments; it redelivers on nack and on dropped (undecided) handles,
//! which is exactly the at-least-once behavior processors must tolerate.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

/// Backend half of an [`AckHandle`].
///
/// Implementations decide what ack/nack mean for their bus; dropping one
/// without a verdict must behave like a nack (redelivery-safe default).
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>);
    async fn nack(self: Box<Self>);
}

/// Settles one delivery, exactly once.
pub struct AckHandle {
    inner: Option<Box<dyn Acker>>,
}

impl AckHandle {
    pub fn new(acker: Box<dyn Acker>) -> Self {
        Self { inner: Some(acker) }
    }

    /// The delivery was fully processed; the bus must not redeliver it.
    pub async fn ack(mut self) {
        if let Some(acker) = self.inner.take() {
            acker.ack().await;
        }
    }

    /// Processing failed transiently; the bus should redeliver.
    pub async fn nack(mut self) {
        if let Some(acker) = self.inner.take() {
            acker.nack().await;
        }
    }
}

/// One message handed to the pipeline.
pub struct Delivery {
    pub topic: String,
    pub body: Bytes,
    pub acker: AckHandle,
}

/// A subscription on the bus, pulled by one producer task.
#[async_trait]
pub trait BusSubscription: Send + 'static {
    /// Next delivery; `None` when the subscription closes.
    async fn next(&mut self) -> Option<Delivery>;
}

#[derive(Debug, Clone)]
struct BusMessage {
    topic: String,
    body: Bytes,
    attempt: u32,
}

/// Publisher handle of the in-memory bus.
#[derive(Clone)]
pub struct InMemoryBus {
    tx: mpsc::UnboundedSender<BusMessage>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<BusMessage>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Open a subscription. All subscriptions compete for the same queue,
    /// so each message is delivered to exactly one of them (queue-group
    /// semantics); open as many as there are producer tasks.
    pub fn subscribe(&self) -> InMemorySubscription {
        InMemorySubscription {
            rx: self.rx.clone(),
            redeliver: self.tx.clone(),
        }
    }

    /// Publish a message. Lost messages (closed subscription) are dropped
    /// silently, as a real bus would buffer them for nobody.
    pub fn publish(&self, topic: impl Into<String>, body: impl Into<Bytes>) {
        let _ = self.tx.send(BusMessage {
            topic: topic.into(),
            body: body.into(),
            attempt: 1,
        });
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One competing consumer on the in-memory bus.
pub struct InMemorySubscription {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<BusMessage>>>,
    redeliver: mpsc::UnboundedSender<BusMessage>,
}

#[async_trait]
impl BusSubscription for InMemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let message = {
            let mut rx = self.rx.lock().await;
            rx.recv().await?
        };
        if message.attempt > 1 {
            tracing::debug!(
                "Redelivering message on {} (attempt {})",
                message.topic,
                message.attempt
            );
        }

        let topic = message.topic.clone();
        let body = message.body.clone();
        let acker = InMemoryAcker {
            redeliver: self.redeliver.clone(),
            message: Some(message),
        };

        Some(Delivery {
            topic,
            body,
            acker: AckHandle::new(Box::new(acker)),
        })
    }
}

struct InMemoryAcker {
    redeliver: mpsc::UnboundedSender<BusMessage>,
    message: Option<BusMessage>,
}

impl InMemoryAcker {
    fn requeue(&mut self) {
        if let Some(mut message) = self.message.take() {
            message.attempt += 1;
            let _ = self.redeliver.send(message);
        }
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(mut self: Box<Self>) {
        self.message.take();
    }

    async fn nack(mut self: Box<Self>) {
        self.requeue();
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        // An abandoned delivery counts as a nack.
        self.requeue();
    }
}
