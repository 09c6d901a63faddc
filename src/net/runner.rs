//! Session loops tying a session to its transport
//!
//! Each step drains the inbound queue, lets the session simulate one tick
//! and flushes the outbox. Only the loop task touches session state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::game::simulation::Simulation;
use crate::metrics::Metrics;
use crate::net::client_session::ClientSession;
use crate::net::queue::InboundQueue;
use crate::net::server_session::ServerSession;
use crate::net::transport::{ClientTransport, ServerTransport};

fn tick_period(tick_rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1)))
}

/// One server tick; returns the number of inbound events handled
pub async fn server_step<S: Simulation>(
    session: &mut ServerSession<S>,
    queue: &InboundQueue,
    transport: &ServerTransport,
) -> usize {
    let events = queue.drain();
    let handled = events.len();
    for event in events {
        session.handle_event(event);
    }
    session.tick();
    transport.flush(session.take_outbound()).await;
    handled
}

/// Run the server session at `tick_rate` until the task is dropped
pub async fn run_server<S: Simulation>(
    mut session: ServerSession<S>,
    transport: ServerTransport,
    queue: InboundQueue,
    tick_rate: u32,
    metrics: Option<Arc<Metrics>>,
) {
    let mut ticker = interval(tick_period(tick_rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(tick_rate, "Session loop started");

    loop {
        ticker.tick().await;
        let start = Instant::now();
        server_step(&mut session, &queue, &transport).await;
        if let Some(m) = &metrics {
            m.record_tick_time(start.elapsed());
        }
    }
}

/// One client tick
///
/// Announces the datagram endpoint once the server has assigned an ID.
/// Errors when the connection to the server is gone.
pub async fn client_step<S: Simulation>(
    session: &mut ClientSession<S>,
    queue: &InboundQueue,
    transport: &ClientTransport,
) -> anyhow::Result<()> {
    for event in queue.drain() {
        session.handle_event(event);
    }
    if session.is_welcomed() && transport.registered_as() != session.peer_id() {
        transport.register_datagram(session.peer_id()).await?;
    }
    session.tick();
    transport
        .flush(session.peer_id(), session.take_outbound())
        .await
}

/// Run a client session at `tick_rate` until the connection ends
pub async fn run_client<S: Simulation>(
    session: &mut ClientSession<S>,
    transport: &ClientTransport,
    queue: &InboundQueue,
    tick_rate: u32,
) -> anyhow::Result<()> {
    let mut ticker = interval(tick_period(tick_rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        client_step(session, queue, transport).await?;
        if !transport.is_connected() {
            debug!("Client loop stopping, stream closed");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_period() {
        assert_eq!(tick_period(20), Duration::from_millis(50));
        // a zero rate is clamped instead of dividing by zero
        assert_eq!(tick_period(0), Duration::from_secs(1));
    }
}
