use std::net::SocketAddr;

use hashbrown::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use crate::game::entity::PeerId;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream open, datagram endpoint not yet known
    Connected,
    /// Datagram endpoint registered
    Associated,
}

/// Per-peer transport bookkeeping
#[derive(Debug)]
pub struct Connection {
    pub id: PeerId,
    pub remote_addr: SocketAddr,
    /// Source address of the peer's datagrams, learned from its first one
    pub datagram_addr: Option<SocketAddr>,
    pub state: ConnectionState,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Payloads for the stream writer task, which frames them
    writer: UnboundedSender<Vec<u8>>,
    /// Stream reader task, stopped when the connection is dropped
    reader: Option<AbortHandle>,
}

impl Connection {
    pub fn new(id: PeerId, remote_addr: SocketAddr, writer: UnboundedSender<Vec<u8>>) -> Self {
        Self {
            id,
            remote_addr,
            datagram_addr: None,
            state: ConnectionState::Connected,
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            writer,
            reader: None,
        }
    }

    /// Queue a payload on the reliable stream
    ///
    /// Returns false once the writer task has gone away.
    pub fn send_reliable(&mut self, payload: Vec<u8>) -> bool {
        let len = payload.len();
        if self.writer.send(payload).is_err() {
            return false;
        }
        self.record_sent(len);
        true
    }

    pub fn set_reader(&mut self, reader: AbortHandle) {
        self.reader = Some(reader);
    }

    /// Learn the datagram endpoint; only accepted from the stream's own host
    pub fn associate(&mut self, addr: SocketAddr) -> bool {
        if addr.ip() != self.remote_addr.ip() {
            return false;
        }
        self.datagram_addr = Some(addr);
        self.state = ConnectionState::Associated;
        true
    }

    /// Record bytes sent
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record bytes received
    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Live connections keyed by peer ID
pub struct ConnectionManager {
    connections: HashMap<PeerId, Connection>,
    by_datagram_addr: HashMap<SocketAddr, PeerId>,
    max_clients: usize,
}

impl ConnectionManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            connections: HashMap::new(),
            by_datagram_addr: HashMap::new(),
            max_clients,
        }
    }

    /// Lowest free peer ID in `1..=max_clients`
    pub fn allocate_id(&self) -> Option<PeerId> {
        (1..=self.max_clients as PeerId).find(|id| !self.connections.contains_key(id))
    }

    /// Register a new stream connection under a fresh peer ID
    pub fn create(
        &mut self,
        remote_addr: SocketAddr,
        writer: UnboundedSender<Vec<u8>>,
    ) -> Option<PeerId> {
        let id = self.allocate_id()?;
        self.connections
            .insert(id, Connection::new(id, remote_addr, writer));
        Some(id)
    }

    /// Get a connection by ID
    pub fn get(&self, id: PeerId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Get a mutable connection by ID
    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Peer that owns a datagram source address
    pub fn peer_for_datagram(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.by_datagram_addr.get(addr).copied()
    }

    /// Associate a datagram source with `peer`
    pub fn associate_datagram(&mut self, peer: PeerId, addr: SocketAddr) -> bool {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return false;
        };
        if let Some(previous) = conn.datagram_addr {
            if previous == addr {
                return true;
            }
        }
        let previous = conn.datagram_addr;
        if !conn.associate(addr) {
            return false;
        }
        if let Some(previous) = previous {
            self.by_datagram_addr.remove(&previous);
        }
        self.by_datagram_addr.insert(addr, peer);
        true
    }

    /// Remove a connection; dropping it closes the writer task
    pub fn remove(&mut self, id: PeerId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        if let Some(addr) = conn.datagram_addr {
            self.by_datagram_addr.remove(&addr);
        }
        Some(conn)
    }

    /// Get connection count
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Get all connection IDs
    pub fn ids(&self) -> Vec<PeerId> {
        self.connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn writer() -> UnboundedSender<Vec<u8>> {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn test_ids_start_at_one_and_reuse_lowest() {
        let mut manager = ConnectionManager::new(4);
        let a = manager.create(test_addr(1000), writer()).unwrap();
        let b = manager.create(test_addr(1001), writer()).unwrap();
        let c = manager.create(test_addr(1002), writer()).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        manager.remove(b);
        assert_eq!(manager.create(test_addr(1003), writer()), Some(2));
    }

    #[test]
    fn test_full_server_rejects() {
        let mut manager = ConnectionManager::new(1);
        assert!(manager.create(test_addr(1000), writer()).is_some());
        assert!(manager.create(test_addr(1001), writer()).is_none());
    }

    #[test]
    fn test_datagram_association() {
        let mut manager = ConnectionManager::new(4);
        let id = manager.create(test_addr(1000), writer()).unwrap();
        assert!(manager.associate_datagram(id, test_addr(5555)));
        assert_eq!(manager.peer_for_datagram(&test_addr(5555)), Some(id));
        assert_eq!(manager.get(id).unwrap().state, ConnectionState::Associated);

        // spoofed host is refused
        let other = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 5555);
        assert!(!manager.associate_datagram(id, other));

        manager.remove(id);
        assert_eq!(manager.peer_for_datagram(&test_addr(5555)), None);
    }

    #[test]
    fn test_send_reliable_tracks_stats() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new(1, test_addr(1000), tx);
        assert!(conn.send_reliable(vec![1, 2, 3]));
        assert_eq!(conn.bytes_sent, 3);
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
        drop(rx);
        assert!(!conn.send_reliable(vec![4]));
    }

    #[test]
    fn test_record_received() {
        let mut conn = Connection::new(1, test_addr(1000), writer());
        conn.record_received(100);
        assert_eq!(conn.bytes_received, 100);
        assert_eq!(conn.packets_received, 1);
    }

    #[test]
    fn test_state_follows_association() {
        let mut conn = Connection::new(1, test_addr(1000), writer());
        assert_eq!(conn.state, ConnectionState::Connected);
        assert!(!conn.associate(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 1000)));
        assert_eq!(conn.state, ConnectionState::Connected);
        assert!(conn.associate(test_addr(4000)));
        assert_eq!(conn.state, ConnectionState::Associated);
        assert_eq!(conn.datagram_addr, Some(test_addr(4000)));
    }
}
