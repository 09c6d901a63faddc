//! TCP + UDP transport
//!
//! Every peer holds one TCP stream for reliable, ordered traffic and shares
//! the server's UDP socket for unreliable datagrams. Socket tasks only frame
//! and unframe bytes: received payloads go to the [`InboundSender`], and the
//! session loop hands its drained outbox to `flush` once per tick.
//!
//! A peer's datagram endpoint is learned from the first datagram carrying
//! its ID, as long as it comes from the same host as the stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ServerConfig};
use crate::game::constants::net::HEADER_SIZE;
use crate::game::constants::peer::{INVALID_ID, SERVER_ID};
use crate::game::entity::PeerId;
use crate::metrics::Metrics;
use crate::net::connection::ConnectionManager;
use crate::net::framing::{decode_datagram, encode_datagram, write_frame, StreamAccumulator};
use crate::net::outbox::{Outbound, Target};
use crate::net::protocol::Channel;
use crate::net::queue::{InboundSender, QueueError};

/// Whether a payload fits in one datagram of at most `max_size` bytes
#[inline]
fn fits_datagram(payload: &[u8], max_size: usize) -> bool {
    payload.len() + 2 * HEADER_SIZE <= max_size
}

/// Read length-prefixed frames until the stream ends; returns the reason
///
/// Every frame is queued as a reliable packet from `peer`. A full queue
/// ends the stream: dropping a reliable packet would desync the peer.
pub(crate) async fn read_frames<R: AsyncRead + Unpin>(
    mut reader: R,
    peer: PeerId,
    buffer_size: usize,
    max_frame: usize,
    inbound: &InboundSender,
    metrics: Option<&Metrics>,
) -> String {
    let mut accumulator = StreamAccumulator::new(max_frame);
    let mut buffer = vec![0u8; buffer_size];
    'read: loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break "connection closed".to_string(),
            Ok(n) => n,
            Err(e) => break format!("read error: {e}"),
        };
        if let Some(m) = metrics {
            m.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        }
        let frames = match accumulator.push(&buffer[..n]) {
            Ok(frames) => frames,
            Err(e) => break format!("framing error: {e}"),
        };
        for frame in frames {
            match inbound.packet(peer, Channel::Reliable, frame) {
                Ok(()) => {}
                Err(QueueError::Full(pending)) => {
                    if let Some(m) = metrics {
                        Metrics::incr(&m.queue_overflows);
                    }
                    break 'read format!("inbound queue overflow ({pending} pending)");
                }
                Err(QueueError::Closed) => break 'read "session closed".to_string(),
            }
        }
    }
}

/// Frame and write payloads until the sending side is dropped
pub(crate) async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut payloads: UnboundedReceiver<Vec<u8>>,
    peer: PeerId,
    max_frame: usize,
) {
    while let Some(payload) = payloads.recv().await {
        if let Err(e) = write_frame(&mut writer, &payload, max_frame).await {
            debug!(peer, error = %e, "Stream write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct Shared {
    connections: RwLock<ConnectionManager>,
    udp: UdpSocket,
    inbound: InboundSender,
    data_buffer_size: usize,
    max_frame_size: usize,
    metrics: Option<Arc<Metrics>>,
}

impl Shared {
    fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_deref()
    }

    fn update_connection_gauge(&self, count: usize) {
        if let Some(m) = self.metrics() {
            m.connections_active.store(count as u64, Ordering::Relaxed);
        }
    }

    /// Remove `peer` and report it once; later calls are no-ops
    fn drop_peer(&self, peer: PeerId, reason: &str) {
        let (removed, count) = {
            let mut connections = self.connections.write();
            let removed = connections.remove(peer);
            (removed, connections.count())
        };
        let Some(conn) = removed else {
            return;
        };
        self.update_connection_gauge(count);
        info!(
            peer,
            addr = %conn.remote_addr,
            reason,
            sent = conn.bytes_sent,
            received = conn.bytes_received,
            packets_sent = conn.packets_sent,
            packets_received = conn.packets_received,
            "Client disconnected"
        );
        let _ = self.inbound.disconnected(peer, reason);
        // dropping `conn` closes the writer and stops the reader
    }
}

/// Server side: accepts streams and owns the datagram socket
pub struct ServerTransport {
    shared: Arc<Shared>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerTransport {
    /// Bind both sockets and start accepting
    pub async fn bind(
        config: &ServerConfig,
        inbound: InboundSender,
        metrics: Option<Arc<Metrics>>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.tcp_addr()).await?;
        let udp = UdpSocket::bind(config.udp_addr()).await?;
        let tcp_addr = listener.local_addr()?;
        let udp_addr = udp.local_addr()?;

        let shared = Arc::new(Shared {
            connections: RwLock::new(ConnectionManager::new(config.max_clients)),
            udp,
            inbound,
            data_buffer_size: config.data_buffer_size,
            max_frame_size: config.max_frame_size,
            metrics,
        });

        let tasks = vec![
            tokio::spawn(accept_loop(listener, Arc::clone(&shared))),
            tokio::spawn(datagram_loop(Arc::clone(&shared))),
        ];

        info!(%tcp_addr, %udp_addr, max_clients = config.max_clients, "Transport listening");
        Ok(Self {
            shared,
            tcp_addr,
            udp_addr,
            tasks,
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.read().count()
    }

    /// Datagram endpoint learned for `peer`, if any
    pub fn datagram_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.shared
            .connections
            .read()
            .get(peer)
            .and_then(|conn| conn.datagram_addr)
    }

    /// Send one tick's worth of outbound packets
    ///
    /// Unreliable packets that do not fit in a datagram, or whose peer has no
    /// datagram endpoint yet, go over the stream instead.
    pub async fn flush(&self, outbound: Vec<Outbound>) {
        if outbound.is_empty() {
            return;
        }
        let mut datagrams: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut dead: SmallVec<[PeerId; 4]> = SmallVec::new();
        let mut fallbacks = 0u64;
        let mut bytes = 0u64;
        {
            let mut connections = self.shared.connections.write();
            for out in outbound {
                for peer in resolve(&out.target, &connections) {
                    let Some(conn) = connections.get_mut(peer) else {
                        continue;
                    };
                    if out.channel == Channel::Unreliable {
                        if let Some(addr) = conn.datagram_addr {
                            if let Ok(datagram) =
                                encode_datagram(SERVER_ID, &out.payload, self.shared.data_buffer_size)
                            {
                                conn.record_sent(datagram.len());
                                bytes += datagram.len() as u64;
                                datagrams.push((addr, datagram));
                                continue;
                            }
                        }
                        fallbacks += 1;
                    }
                    bytes += (out.payload.len() + HEADER_SIZE) as u64;
                    if !conn.send_reliable(out.payload.clone()) && !dead.contains(&peer) {
                        dead.push(peer);
                    }
                }
            }
        }

        for (addr, datagram) in datagrams {
            if let Err(e) = self.shared.udp.send_to(&datagram, addr).await {
                debug!(%addr, error = %e, "Datagram send failed");
            }
        }
        if let Some(m) = self.shared.metrics() {
            m.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
            m.datagram_fallbacks.fetch_add(fallbacks, Ordering::Relaxed);
        }
        for peer in dead {
            self.shared.drop_peer(peer, "stream writer closed");
        }
    }

    /// Close a peer's connection; the session sees a `Disconnected` event
    pub fn disconnect(&self, peer: PeerId, reason: &str) {
        self.shared.drop_peer(peer, reason);
    }

    /// Stop accepting and drop every connection
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        let ids = self.shared.connections.read().ids();
        for peer in ids {
            self.shared.drop_peer(peer, "server shutting down");
        }
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Live peers addressed by `target`
fn resolve(target: &Target, connections: &ConnectionManager) -> SmallVec<[PeerId; 8]> {
    match target {
        Target::Peer(peer) => SmallVec::from_slice(&[*peer]),
        Target::All => connections.ids().into_iter().collect(),
        Target::AllExcept(except) => connections
            .ids()
            .into_iter()
            .filter(|peer| peer != except)
            .collect(),
        Target::Peers(peers) => peers.clone(),
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (peer, count) = {
            let mut connections = shared.connections.write();
            (connections.create(addr, tx), connections.count())
        };
        let Some(peer) = peer else {
            warn!(%addr, "Server full, refusing connection");
            continue;
        };
        shared.update_connection_gauge(count);
        info!(peer, %addr, "Client connected");

        if shared.inbound.connected(peer, addr).is_err() {
            warn!("Session closed, no longer accepting");
            break;
        }

        let (reader, writer) = stream.into_split();
        tokio::spawn(write_frames(writer, rx, peer, shared.max_frame_size));

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            let reason = read_frames(
                reader,
                peer,
                reader_shared.data_buffer_size,
                reader_shared.max_frame_size,
                &reader_shared.inbound,
                reader_shared.metrics(),
            )
            .await;
            reader_shared.drop_peer(peer, &reason);
        });

        match shared.connections.write().get_mut(peer) {
            Some(conn) => conn.set_reader(reader_task.abort_handle()),
            None => reader_task.abort(),
        }
    }
}

async fn datagram_loop(shared: Arc<Shared>) {
    let mut buffer = vec![0u8; shared.data_buffer_size];
    loop {
        let (n, addr) = match shared.udp.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port-unreachable from a departed client surfaces here
                debug!(error = %e, "Datagram receive failed");
                continue;
            }
        };
        let (sender, payload) = match decode_datagram(&buffer[..n]) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(%addr, error = %e, "Malformed datagram");
                if let Some(m) = shared.metrics() {
                    Metrics::incr(&m.decode_errors);
                }
                continue;
            }
        };

        let known = shared.connections.read().peer_for_datagram(&addr);
        match known {
            Some(peer) if peer == sender => {}
            Some(peer) => {
                debug!(%addr, peer, claimed = sender, "Datagram sender mismatch");
                continue;
            }
            None => {
                if !shared.connections.write().associate_datagram(sender, addr) {
                    debug!(%addr, claimed = sender, "Datagram from unknown endpoint");
                    continue;
                }
                debug!(peer = sender, %addr, "Datagram endpoint registered");
            }
        }

        if let Some(conn) = shared.connections.write().get_mut(sender) {
            conn.record_received(n);
        }
        if let Some(m) = shared.metrics() {
            m.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        }
        if payload.is_empty() {
            continue;
        }
        if let Err(QueueError::Full(_)) = shared.inbound.packet(sender, Channel::Unreliable, payload.to_vec()) {
            if let Some(m) = shared.metrics() {
                Metrics::incr(&m.queue_overflows);
            }
        }
    }
}

/// Client side: one stream to the server plus a datagram socket
pub struct ClientTransport {
    writer: UnboundedSender<Vec<u8>>,
    udp: Arc<UdpSocket>,
    server_udp: SocketAddr,
    data_buffer_size: usize,
    /// Peer ID our datagram endpoint was last announced under
    registered_as: AtomicI32,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientTransport {
    /// Connect the stream and bind a datagram socket on the same local host
    ///
    /// Inbound packets are reported with [`SERVER_ID`] as the sender.
    pub async fn connect(config: &ClientConfig, inbound: InboundSender) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(config.server_tcp).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?);
        info!(server = %config.server_tcp, local = %local, "Connected to server");

        inbound.connected(SERVER_ID, config.server_tcp)?;

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer_size = config.data_buffer_size;
        let max_frame = config.max_frame_size;

        let stream_inbound = inbound.clone();
        let read_task = tokio::spawn(async move {
            let reason = read_frames(reader, SERVER_ID, buffer_size, max_frame, &stream_inbound, None).await;
            info!(%reason, "Server connection ended");
            let _ = stream_inbound.disconnected(SERVER_ID, reason);
        });
        let write_task = tokio::spawn(write_frames(writer, rx, SERVER_ID, max_frame));
        let datagram_task = tokio::spawn(client_datagram_loop(
            Arc::clone(&udp),
            config.server_udp,
            buffer_size,
            inbound,
        ));

        Ok(Self {
            writer: tx,
            udp,
            server_udp: config.server_udp,
            data_buffer_size: buffer_size,
            registered_as: AtomicI32::new(INVALID_ID),
            tasks: vec![read_task, write_task, datagram_task],
        })
    }

    pub fn local_datagram_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Announce our datagram endpoint once the server has assigned `peer`
    pub async fn register_datagram(&self, peer: PeerId) -> anyhow::Result<()> {
        self.udp.send_to(&peer.to_le_bytes(), self.server_udp).await?;
        self.registered_as.store(peer, Ordering::Relaxed);
        debug!(peer, server = %self.server_udp, "Datagram registration sent");
        Ok(())
    }

    pub fn registered_as(&self) -> PeerId {
        self.registered_as.load(Ordering::Relaxed)
    }

    /// Send one tick's worth of outbound packets as `peer`
    ///
    /// Errors once the stream writer has gone away.
    pub async fn flush(&self, peer: PeerId, outbound: Vec<Outbound>) -> anyhow::Result<()> {
        for out in outbound {
            if out.channel == Channel::Unreliable
                && peer >= 0
                && fits_datagram(&out.payload, self.data_buffer_size)
            {
                let datagram = encode_datagram(peer, &out.payload, self.data_buffer_size)?;
                if let Err(e) = self.udp.send_to(&datagram, self.server_udp).await {
                    debug!(error = %e, "Datagram send failed");
                }
                continue;
            }
            self.writer
                .send(out.payload)
                .map_err(|_| anyhow::anyhow!("connection to server closed"))?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        !self.writer.is_closed()
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn client_datagram_loop(
    udp: Arc<UdpSocket>,
    server: SocketAddr,
    buffer_size: usize,
    inbound: InboundSender,
) {
    let mut buffer = vec![0u8; buffer_size];
    loop {
        let (n, addr) = match udp.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "Datagram receive failed");
                continue;
            }
        };
        if addr.ip() != server.ip() {
            debug!(%addr, "Ignoring datagram from unknown host");
            continue;
        }
        match decode_datagram(&buffer[..n]) {
            Ok((SERVER_ID, payload)) if !payload.is_empty() => {
                if let Err(QueueError::Closed) = inbound.packet(SERVER_ID, Channel::Unreliable, payload.to_vec()) {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => debug!(%addr, error = %e, "Malformed datagram"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::encode_frame;
    use crate::net::queue::{InboundEvent, InboundQueue};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_frames_reassembles_split_reads() {
        let queue = InboundQueue::new(16);
        let frame = encode_frame(&[9, 0, 0, 0, 1, 2]);
        let reader = Builder::new().read(&frame[..3]).read(&frame[3..]).build();

        let reason = read_frames(reader, 4, 64, 1024, &queue.sender(), None).await;
        assert_eq!(reason, "connection closed");

        let events = queue.drain();
        assert_eq!(
            events,
            vec![InboundEvent::Packet {
                peer: 4,
                channel: Channel::Reliable,
                payload: vec![9, 0, 0, 0, 1, 2],
            }]
        );
    }

    #[tokio::test]
    async fn test_read_frames_stops_on_bad_length() {
        let queue = InboundQueue::new(16);
        let reader = Builder::new().read(&(-5i32).to_le_bytes()).build();
        let reason = read_frames(reader, 1, 64, 1024, &queue.sender(), None).await;
        assert!(reason.starts_with("framing error"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_read_frames_disconnects_on_overflow() {
        let queue = InboundQueue::new(1);
        let metrics = Metrics::new();
        let mut bytes = encode_frame(&[1, 0, 0, 0]);
        bytes.extend(encode_frame(&[2, 0, 0, 0]));
        let reader = Builder::new().read(&bytes).build();

        let reason = read_frames(reader, 1, 64, 1024, &queue.sender(), Some(&metrics)).await;
        assert!(reason.contains("overflow"));
        assert_eq!(metrics.queue_overflows.load(Ordering::Relaxed), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_write_frames_prefixes_each_payload() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(vec![1, 0, 0, 0]).unwrap();
        tx.send(vec![2, 0, 0, 0, 7]).unwrap();
        drop(tx);

        let writer = Builder::new()
            .write(&[4, 0, 0, 0])
            .write(&[1, 0, 0, 0])
            .write(&[5, 0, 0, 0])
            .write(&[2, 0, 0, 0, 7])
            .build();
        write_frames(writer, rx, 1, 1024).await;
    }

    #[test]
    fn test_fits_datagram() {
        assert!(fits_datagram(&[0; 8], 16));
        assert!(!fits_datagram(&[0; 9], 16));
    }

    #[test]
    fn test_resolve_targets() {
        let mut connections = ConnectionManager::new(4);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        for _ in 0..3 {
            connections.create(addr, mpsc::unbounded_channel().0);
        }
        let mut all = resolve(&Target::All, &connections).into_vec();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3]);

        let mut others = resolve(&Target::AllExcept(2), &connections).into_vec();
        others.sort_unstable();
        assert_eq!(others, vec![1, 3]);
        assert_eq!(resolve(&Target::Peer(3), &connections).as_slice(), &[3]);
    }
}
