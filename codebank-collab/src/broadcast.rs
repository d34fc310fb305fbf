//! Fan-out from the consumer to per-connection writers.
//!
//! Each connected client owns an outbound channel drained by exactly one
//! writer task. The registry encodes a message once and hands the shared
//! bytes to every recipient, so broadcasting never blocks on a socket.
//!
//! ```text
//! consumer ──route()──► ClientRegistry ──► outbound(A) ──► writer A ──► socket A
//!                                      ├─► outbound(B) ──► writer B ──► socket B
//!                                      └─► outbound(C) ──► writer C ──► socket C
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use codebank_core::UserId;

use crate::handlers::{Outbound, Target};
use crate::protocol::{Message, ProtocolError};

/// Encoded frame shared by every recipient.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_clients: usize,
}

/// Lock-free counters, readable from outside the consumer.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    active_clients: AtomicU64,
}

impl AtomicBroadcastStats {
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_clients: self.active_clients.load(Ordering::Relaxed) as usize,
        }
    }
}

/// Sending half of one connection's writer.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: u64,
    pub addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl ClientHandle {
    pub fn new(conn_id: u64, addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { conn_id, addr, outbound }, rx)
    }

    /// Queue a frame for this client's writer. `false` if the writer is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// Active clients keyed by user id.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<UserId, ClientHandle>,
    stats: Arc<AtomicBroadcastStats>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of the counters.
    pub fn stats_handle(&self) -> Arc<AtomicBroadcastStats> {
        self.stats.clone()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }

    fn sync_active(&self) {
        self.stats
            .active_clients
            .store(self.clients.len() as u64, Ordering::Relaxed);
    }

    /// Register a client. Returns the handle it replaced, if any.
    pub fn insert(&mut self, user: UserId, handle: ClientHandle) -> Option<ClientHandle> {
        let old = self.clients.insert(user, handle);
        self.sync_active();
        old
    }

    /// Remove a client, but only if `conn_id` is still the registered
    /// connection. A stale disconnect for a resumed user is ignored.
    pub fn remove(&mut self, user: UserId, conn_id: u64) -> Option<ClientHandle> {
        if self.conn_id(user)? != conn_id {
            return None;
        }
        let removed = self.clients.remove(&user);
        self.sync_active();
        removed
    }

    /// Drop every handle; writers drain what they have and close.
    pub fn clear(&mut self) {
        self.clients.clear();
        self.sync_active();
    }

    pub fn conn_id(&self, user: UserId) -> Option<u64> {
        self.clients.get(&user).map(|c| c.conn_id)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.clients.contains_key(&user)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn deliver<'a>(&self, frame: &Frame, recipients: impl Iterator<Item = &'a ClientHandle>) -> usize {
        let mut delivered = 0;
        for client in recipients {
            if client.send(frame.clone()) {
                delivered += 1;
            } else {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn send_to(&self, user: UserId, message: &Message) -> Result<usize, ProtocolError> {
        let frame = Arc::new(message.encode_frame()?);
        Ok(self.deliver(&frame, self.clients.get(&user).into_iter()))
    }

    pub fn send_to_all(&self, message: &Message) -> Result<usize, ProtocolError> {
        let frame = Arc::new(message.encode_frame()?);
        Ok(self.deliver(&frame, self.clients.values()))
    }

    pub fn send_to_all_except(&self, user: UserId, message: &Message) -> Result<usize, ProtocolError> {
        let frame = Arc::new(message.encode_frame()?);
        Ok(self.deliver(
            &frame,
            self.clients.iter().filter(|(id, _)| **id != user).map(|(_, c)| c),
        ))
    }

    /// Deliver a handler's output. Returns the number of recipients reached.
    pub fn route(&self, outbound: &Outbound) -> usize {
        let result = match &outbound.target {
            Target::All => self.send_to_all(&outbound.message),
            Target::User(user) => self.send_to(*user, &outbound.message),
            Target::AllExcept(user) => self.send_to_all_except(*user, &outbound.message),
            Target::Users(users) => outbound.message.encode_frame().map(|bytes| {
                let frame = Arc::new(bytes);
                self.deliver(&frame, users.iter().filter_map(|u| self.clients.get(u)))
            }),
        };
        match result {
            Ok(n) => n,
            Err(e) => {
                log::error!("Failed to encode {:?}: {e}", outbound.message.kind());
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn registry(n: UserId) -> (ClientRegistry, Vec<mpsc::UnboundedReceiver<Frame>>) {
        let mut reg = ClientRegistry::new();
        let mut rxs = Vec::new();
        for user in 1..=n {
            let (handle, rx) = ClientHandle::new(user as u64, addr());
            reg.insert(user, handle);
            rxs.push(rx);
        }
        (reg, rxs)
    }

    #[tokio::test]
    async fn test_send_to_all_shares_one_frame() {
        let (reg, mut rxs) = registry(3);
        let count = reg.send_to_all(&Message::Remove { user: 9 }).unwrap();
        assert_eq!(count, 3);

        let a = rxs[0].recv().await.unwrap();
        let b = rxs[1].recv().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(Message::decode_payload(&a[4..]).unwrap(), Message::Remove { user: 9 });
    }

    #[tokio::test]
    async fn test_route_targets() {
        let (reg, mut rxs) = registry(3);

        assert_eq!(reg.route(&Outbound::to(2, Message::SetId { user: 2 })), 1);
        assert!(rxs[1].try_recv().is_ok());
        assert!(rxs[0].try_recv().is_err());

        let except = Outbound { target: Target::AllExcept(1), message: Message::Clear { user: 1 } };
        assert_eq!(reg.route(&except), 2);
        assert!(rxs[0].try_recv().is_err());

        let some = Outbound {
            target: Target::Users(vec![1, 3, 42]),
            message: Message::MonitorEval { user: 2, text: "x".into() },
        };
        assert_eq!(reg.route(&some), 2);
    }

    #[tokio::test]
    async fn test_dropped_writer_counts() {
        let (reg, mut rxs) = registry(2);
        drop(rxs.remove(0));
        assert_eq!(reg.send_to_all(&Message::Shutdown).unwrap(), 1);
        let stats = reg.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_clients, 2);
    }

    #[test]
    fn test_stale_remove_ignored() {
        let (mut reg, _rxs) = registry(1);
        let (fresh, _rx) = ClientHandle::new(77, addr());
        reg.insert(1, fresh);
        assert!(reg.remove(1, 1).is_none());
        assert!(reg.contains(1));
        assert!(reg.remove(1, 77).is_some());
        assert!(reg.is_empty());
        assert_eq!(reg.stats().active_clients, 0);
    }
}
