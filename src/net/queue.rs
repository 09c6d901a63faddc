//! Inbound work queue between I/O tasks and the session loop
//!
//! Uses crossbeam-channel for lock-free MPSC hand-off. Socket tasks only
//! push raw events; the session drains everything at the start of each
//! tick and is the only code that touches replication state.

use std::net::SocketAddr;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::game::entity::PeerId;
use crate::net::protocol::Channel;

/// Unit of work produced by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected {
        peer: PeerId,
        addr: SocketAddr,
    },
    Packet {
        peer: PeerId,
        channel: Channel,
        payload: Vec<u8>,
    },
    Disconnected {
        peer: PeerId,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Inbound queue full ({0} pending)")]
    Full(usize),
    #[error("Inbound queue closed")]
    Closed,
}

/// Receiving side, owned by the session loop
///
/// Lifecycle events are never dropped; packet events beyond `capacity`
/// are refused so a flooding peer cannot grow memory without bound.
pub struct InboundQueue {
    sender: Sender<InboundEvent>,
    receiver: Receiver<InboundEvent>,
    capacity: usize,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Create a sender handle for an I/O task
    pub fn sender(&self) -> InboundSender {
        InboundSender {
            sender: self.sender.clone(),
            capacity: self.capacity,
        }
    }

    /// Drain all pending events for this tick, in arrival order
    pub fn drain(&self) -> Vec<InboundEvent> {
        self.receiver.try_iter().collect()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Sending side, cloned into every I/O task
#[derive(Clone)]
pub struct InboundSender {
    sender: Sender<InboundEvent>,
    capacity: usize,
}

impl InboundSender {
    /// Queue a received packet unless the queue is at capacity
    pub fn packet(&self, peer: PeerId, channel: Channel, payload: Vec<u8>) -> Result<(), QueueError> {
        let pending = self.sender.len();
        if pending >= self.capacity {
            return Err(QueueError::Full(pending));
        }
        self.sender
            .send(InboundEvent::Packet {
                peer,
                channel,
                payload,
            })
            .map_err(|_| QueueError::Closed)
    }

    pub fn connected(&self, peer: PeerId, addr: SocketAddr) -> Result<(), QueueError> {
        self.sender
            .send(InboundEvent::Connected { peer, addr })
            .map_err(|_| QueueError::Closed)
    }

    pub fn disconnected(&self, peer: PeerId, reason: impl Into<String>) -> Result<(), QueueError> {
        self.sender
            .send(InboundEvent::Disconnected {
                peer,
                reason: reason.into(),
            })
            .map_err(|_| QueueError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    #[test]
    fn test_events_drain_in_order() {
        let queue = InboundQueue::new(16);
        let sender = queue.sender();
        sender.connected(1, addr()).unwrap();
        sender.packet(1, Channel::Reliable, vec![1, 0, 0, 0]).unwrap();
        sender.disconnected(1, "closed").unwrap();

        let events = queue.drain();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], InboundEvent::Connected { peer: 1, .. }));
        assert!(matches!(events[1], InboundEvent::Packet { peer: 1, .. }));
        assert!(matches!(events[2], InboundEvent::Disconnected { peer: 1, .. }));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_packets_refused_at_capacity() {
        let queue = InboundQueue::new(2);
        let sender = queue.sender();
        sender.packet(1, Channel::Unreliable, vec![]).unwrap();
        sender.packet(1, Channel::Unreliable, vec![]).unwrap();
        assert_eq!(
            sender.packet(1, Channel::Unreliable, vec![]),
            Err(QueueError::Full(2))
        );
        // lifecycle events still go through
        sender.disconnected(1, "overflow").unwrap();
        assert_eq!(queue.pending_count(), 3);
    }

    #[test]
    fn test_concurrent_senders() {
        let queue = InboundQueue::new(10_000);
        let handles: Vec<_> = (0..4)
            .map(|peer| {
                let sender = queue.sender();
                thread::spawn(move || {
                    for _ in 0..100 {
                        sender.packet(peer, Channel::Reliable, vec![0; 4]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.drain().len(), 400);
    }

    #[test]
    fn test_closed_queue() {
        let queue = InboundQueue::new(4);
        let sender = queue.sender();
        drop(queue);
        assert_eq!(sender.connected(1, addr()), Err(QueueError::Closed));
    }
}
