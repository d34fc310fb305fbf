//! Processing queue: many connection readers in, one consumer out.
//!
//! ```text
//! reader A ──┐
//! reader B ──┼──► unbounded FIFO ──► consumer (owns SessionState)
//! reader C ──┘
//! ```
//!
//! Arrival order at the queue is the order transitions are applied. The
//! consumer lives on a blocking thread (interpreter calls block), wakes when
//! something arrives and then drains everything already queued before going
//! back to sleep.

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};

use codebank_core::UserId;

use crate::broadcast::ClientHandle;
use crate::protocol::Message;

/// Work items for the consumer.
#[derive(Debug)]
pub enum Event {
    /// An authenticated connection wants a user id.
    Join {
        name: String,
        addr: SocketAddr,
        handle: ClientHandle,
        reply: oneshot::Sender<UserId>,
    },
    /// A decoded message from an active connection.
    Message { user: UserId, conn_id: u64, message: Message },
    /// A connection's reader stopped.
    Disconnect { user: UserId, conn_id: u64 },
    /// Broadcast SHUTDOWN, drop everyone, then acknowledge.
    Shutdown { done: oneshot::Sender<()> },
}

/// Producer side. Cheap to clone, one per connection.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl QueueSender {
    /// Enqueue an event. Returns `false` once the consumer has stopped.
    pub fn push(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side. Exactly one exists.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl QueueReceiver {
    /// Block until at least one event arrives, then take everything already
    /// queued. Returns an empty batch once every sender is gone.
    ///
    /// Runs on the consumer's own thread; panics if called from inside the
    /// async runtime.
    pub fn recv_batch(&mut self) -> Vec<Event> {
        let Some(first) = self.rx.blocking_recv() else {
            return Vec::new();
        };
        let mut batch = vec![first];
        while let Ok(event) = self.rx.try_recv() {
            batch.push(event);
        }
        batch
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the queue pair.
pub fn processing_queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender { tx }, QueueReceiver { rx })
}
