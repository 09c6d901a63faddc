//! Prometheus-compatible metrics endpoint
//!
//! Exposes replication server metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Metrics registry for the replication server
#[derive(Debug)]
pub struct Metrics {
    // Peers
    pub connections_active: AtomicU64,
    pub players_active: AtomicU64,
    pub joins_pending: AtomicU64,

    // Registry sizes
    pub tracked_items: AtomicU64,
    pub tracked_sosigs: AtomicU64,
    pub tracked_auto_meaters: AtomicU64,
    pub tracked_encryptions: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    // Traffic
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub datagram_fallbacks: AtomicU64,

    // Rejections
    pub decode_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub stale_updates: AtomicU64,
    pub queue_overflows: AtomicU64,

    start_time: Instant,

    // Rolling tick times for percentile calculation
    tick_history: RwLock<VecDeque<u64>>,
}

/// Point-in-time copy used for the JSON endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub players: u64,
    pub joins_pending: u64,
    pub tracked: TrackedSnapshot,
    pub tick_time_us: u64,
    pub tick_time_p95_us: u64,
    pub tick_time_p99_us: u64,
    pub tick_time_max_us: u64,
    pub tick_count: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub datagram_fallbacks: u64,
    pub decode_errors: u64,
    pub protocol_errors: u64,
    pub stale_updates: u64,
    pub queue_overflows: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedSnapshot {
    pub items: u64,
    pub sosigs: u64,
    pub auto_meaters: u64,
    pub encryptions: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            players_active: AtomicU64::new(0),
            joins_pending: AtomicU64::new(0),
            tracked_items: AtomicU64::new(0),
            tracked_sosigs: AtomicU64::new(0),
            tracked_auto_meaters: AtomicU64::new(0),
            tracked_encryptions: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagram_fallbacks: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            stale_updates: AtomicU64::new(0),
            queue_overflows: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(1000)),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > 1000 {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections: load(&self.connections_active),
            players: load(&self.players_active),
            joins_pending: load(&self.joins_pending),
            tracked: TrackedSnapshot {
                items: load(&self.tracked_items),
                sosigs: load(&self.tracked_sosigs),
                auto_meaters: load(&self.tracked_auto_meaters),
                encryptions: load(&self.tracked_encryptions),
            },
            tick_time_us: load(&self.tick_time_us),
            tick_time_p95_us: load(&self.tick_time_p95_us),
            tick_time_p99_us: load(&self.tick_time_p99_us),
            tick_time_max_us: load(&self.tick_time_max_us),
            tick_count: load(&self.tick_count),
            packets_sent: load(&self.packets_sent),
            packets_received: load(&self.packets_received),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            datagram_fallbacks: load(&self.datagram_fallbacks),
            decode_errors: load(&self.decode_errors),
            protocol_errors: load(&self.protocol_errors),
            stale_updates: load(&self.stale_updates),
            queue_overflows: load(&self.queue_overflows),
            uptime_seconds: self.uptime_seconds(),
        }
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);
        let s = self.snapshot();

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("tracked_sync_connections_active", "Open peer connections", "gauge", s.connections);
        metric!("tracked_sync_players_active", "Welcomed players", "gauge", s.players);
        metric!("tracked_sync_joins_pending", "Peers waiting for a domain snapshot", "gauge", s.joins_pending);

        output.push_str("# HELP tracked_sync_entities Live tracked entities per kind\n# TYPE tracked_sync_entities gauge\n");
        for (kind, value) in [
            ("item", s.tracked.items),
            ("sosig", s.tracked.sosigs),
            ("auto_meater", s.tracked.auto_meaters),
            ("encryption", s.tracked.encryptions),
        ] {
            output.push_str(&format!("tracked_sync_entities{{kind=\"{}\"}} {}\n", kind, value));
        }

        metric!("tracked_sync_tick_time_microseconds", "Current tick time in microseconds", "gauge", s.tick_time_us);
        metric!("tracked_sync_tick_time_p95_microseconds", "95th percentile tick time", "gauge", s.tick_time_p95_us);
        metric!("tracked_sync_tick_time_p99_microseconds", "99th percentile tick time", "gauge", s.tick_time_p99_us);
        metric!("tracked_sync_tick_time_max_microseconds", "Maximum tick time", "gauge", s.tick_time_max_us);
        metric!("tracked_sync_tick_count", "Total ticks processed", "counter", s.tick_count);

        metric!("tracked_sync_packets_sent_total", "Packets sent", "counter", s.packets_sent);
        metric!("tracked_sync_packets_received_total", "Packets received", "counter", s.packets_received);
        metric!("tracked_sync_bytes_sent_total", "Bytes sent", "counter", s.bytes_sent);
        metric!("tracked_sync_bytes_received_total", "Bytes received", "counter", s.bytes_received);
        metric!("tracked_sync_datagram_fallbacks_total", "Unreliable packets sent reliably because they exceeded the datagram size", "counter", s.datagram_fallbacks);

        metric!("tracked_sync_decode_errors_total", "Malformed or unknown packets dropped", "counter", s.decode_errors);
        metric!("tracked_sync_protocol_errors_total", "Well-formed packets rejected by a handler", "counter", s.protocol_errors);
        metric!("tracked_sync_stale_updates_total", "Updates ignored for an out-of-date order", "counter", s.stale_updates);
        metric!("tracked_sync_queue_overflows_total", "Inbound packets refused at queue capacity", "counter", s.queue_overflows);
        metric!("tracked_sync_uptime_seconds", "Server uptime in seconds", "counter", s.uptime_seconds);

        output
    }

    /// JSON rendering of [`Metrics::snapshot`]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = route(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn route(metrics: &Metrics, request: &str) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics/json") {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
