//! Server side of a replication session
//!
//! The server is peer 0. It allocates tracked IDs, arbitrates control
//! requests, keeps the authoritative registries and fans packets out to the
//! clients. All state lives on the session loop; socket tasks only feed the
//! inbound queue and drain the outbox.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::game::constants::peer::SERVER_ID;
use crate::game::entity::{KindData, PeerId, TrackedEntity, TrackedId};
use crate::game::kinds::{AutoMeaterData, EncryptionData, ItemData, SosigData};
use crate::game::registry::EntityKey;
use crate::game::scene::{Domain, JoinTracker, SceneTable};
use crate::game::simulation::Simulation;
use crate::game::world::{ProtocolError, World};
use crate::metrics::Metrics;
use crate::net::codec::Packet;
use crate::net::dispatch::{DispatchError, DispatchTable};
use crate::net::messages;
use crate::net::outbox::{Outbound, Outbox, Target};
use crate::net::protocol::Direction;
use crate::net::queue::InboundEvent;
use crate::net::server_handle::server_table;

pub struct ServerSession<S: Simulation> {
    pub(crate) world: World,
    pub(crate) sim: S,
    pub(crate) joins: JoinTracker,
    pub(crate) outbox: Outbox,
    handlers: Arc<DispatchTable<ServerSession<S>>>,
    greeting: String,
    metrics: Option<Arc<Metrics>>,
}

impl<S: Simulation> ServerSession<S> {
    pub fn new(scenes: SceneTable, greeting: impl Into<String>, sim: S) -> Self {
        Self {
            world: World::new(SERVER_ID, scenes),
            sim,
            joins: JoinTracker::new(),
            outbox: Outbox::new(Direction::ToClient),
            handlers: Arc::new(server_table()),
            greeting: greeting.into(),
            metrics: None,
        }
    }

    pub fn from_config(config: &ServerConfig, sim: S) -> Self {
        Self::new(config.scene_table(), config.welcome_message.clone(), sim)
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn sim(&self) -> &S {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    pub fn joins(&self) -> &JoinTracker {
        &self.joins
    }

    pub(crate) fn count(&self, counter: impl Fn(&Metrics) -> &AtomicU64) {
        if let Some(metrics) = &self.metrics {
            Metrics::incr(counter(metrics));
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Connected { peer, addr } => {
                info!(peer, %addr, "Peer connected");
                self.on_connect(peer);
            }
            InboundEvent::Packet { peer, payload, .. } => {
                let _ = self.handle_packet(peer, payload);
            }
            InboundEvent::Disconnected { peer, reason } => {
                info!(peer, %reason, "Peer disconnected");
                self.on_disconnect(peer);
            }
        }
    }

    /// Dispatch one packet from `peer`; errors are logged and the packet dropped
    pub fn handle_packet(&mut self, peer: PeerId, payload: Vec<u8>) -> Result<i32, DispatchError> {
        self.count(|m| &m.packets_received);
        let handlers = Arc::clone(&self.handlers);
        let mut packet = Packet::from_bytes(payload);
        let result = handlers.dispatch(self, peer, &mut packet);
        match &result {
            Ok(id) => trace!(peer, id, "Handled packet"),
            Err(e) if e.is_decode() => {
                self.count(|m| &m.decode_errors);
                warn!(peer, error = %e, "Dropping malformed packet");
            }
            Err(e) => {
                self.count(|m| &m.protocol_errors);
                warn!(peer, error = %e, "Rejected packet");
            }
        }
        result
    }

    /// New stream accepted: greet the peer with its ID and the custom scenes
    pub fn on_connect(&mut self, peer: PeerId) {
        let welcome = messages::welcome(peer, &self.greeting, &self.world.scenes);
        self.outbox.push(Target::Peer(peer), welcome);
    }

    /// Peer gone: hand its entities to the server and clean up joins
    pub fn on_disconnect(&mut self, peer: PeerId) {
        if self.world.players.remove(&peer).is_some() {
            self.sim.player_left(peer);
            self.outbox.push(Target::AllExcept(peer), messages::player_left(peer));
        }

        let reassigned = self.reclaim::<ItemData>(peer)
            + self.reclaim::<SosigData>(peer)
            + self.reclaim::<AutoMeaterData>(peer)
            + self.reclaim::<EncryptionData>(peer);
        if reassigned > 0 {
            info!(peer, reassigned, "Reassigned entities of departed peer to server");
        }

        for joiner in self.joins.peer_left(peer) {
            self.send_relevant_objects(joiner);
        }
    }

    fn reclaim<D: KindData>(&mut self, peer: PeerId) -> usize {
        let ids = self.world.controlled_by::<D>(peer);
        for &id in &ids {
            if let Err(e) = self.world.give_control::<D, S>(&mut self.sim, id, SERVER_ID) {
                warn!(peer, tracked_id = id, error = %e, "Failed to reclaim entity");
                continue;
            }
            self.outbox.push(
                Target::AllExcept(peer),
                messages::kind_give_control::<D>(id, SERVER_ID),
            );
        }
        ids.len()
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Capture server-controlled state and queue updates to each domain
    pub fn tick(&mut self) {
        self.tick_kind::<ItemData>();
        self.tick_kind::<SosigData>();
        self.tick_kind::<AutoMeaterData>();
        self.tick_kind::<EncryptionData>();
        self.update_gauges();
    }

    fn tick_kind<D: KindData>(&mut self) {
        let keys: Vec<EntityKey> = self.world.registry::<D>().local_keys().to_vec();
        let mut changed = Vec::new();
        for key in keys {
            let Some(entity) = self.world.registry_mut::<D>().entity_mut(key) else {
                continue;
            };
            let Some(handle) = entity.handle else {
                continue;
            };
            if entity.tracked_id < 0 {
                continue;
            }
            if self.sim.capture_state(handle, entity) {
                entity.advance_order();
                changed.push(entity.tracked_id);
            }
        }
        self.send_updates::<D>(SERVER_ID, &changed);
    }

    /// Queue delta batches for `ids` to every peer in each entity's domain but `from`
    pub(crate) fn send_updates<D: KindData>(&mut self, from: PeerId, ids: &[TrackedId]) {
        let mut groups: Vec<(Domain, Vec<TrackedId>)> = Vec::new();
        for &id in ids {
            let Some(entity) = self.world.registry::<D>().get(id) else {
                continue;
            };
            match groups.iter_mut().find(|(domain, _)| *domain == entity.domain) {
                Some((_, group)) => group.push(id),
                None => groups.push((entity.domain.clone(), vec![id])),
            }
        }

        for (domain, group) in groups {
            let peers = self.world.peers_in(&domain, from);
            if peers.is_empty() {
                continue;
            }
            let registry = self.world.registry::<D>();
            let packets = messages::kind_updates(group.iter().filter_map(|id| registry.get(*id)));
            for packet in packets {
                self.outbox.push_to(&peers, packet);
            }
        }
    }

    fn update_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let store = |gauge: &AtomicU64, value: usize| gauge.store(value as u64, Ordering::Relaxed);
        store(&metrics.players_active, self.world.players.len());
        store(&metrics.joins_pending, self.joins.joining_count());
        store(&metrics.tracked_items, self.world.items.len());
        store(&metrics.tracked_sosigs, self.world.sosigs.len());
        store(&metrics.tracked_auto_meaters, self.world.auto_meaters.len());
        store(&metrics.tracked_encryptions, self.world.encryptions.len());
    }

    /// Everything queued since the last call, in order
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        let outbound = self.outbox.drain();
        if let Some(metrics) = &self.metrics {
            metrics
                .packets_sent
                .fetch_add(outbound.len() as u64, Ordering::Relaxed);
        }
        outbound
    }

    // ------------------------------------------------------------------
    // Joins
    // ------------------------------------------------------------------

    /// Start the join sequence for `joiner` into its current domain
    pub(crate) fn begin_join(&mut self, joiner: PeerId) {
        let Some(domain) = self.world.players.get(&joiner).map(|p| p.domain.clone()) else {
            return;
        };
        // unsynchronized scenes only wait for the joiner's own load
        let providers: Vec<PeerId> = if self.world.scenes.is_synchronized(&domain.scene) {
            self.world
                .peers_in(&domain, joiner)
                .into_iter()
                .filter(|p| !self.joins.is_loading(*p))
                .collect()
        } else {
            Vec::new()
        };
        self.joins.begin(joiner, &providers);
        for &provider in &providers {
            self.outbox.push(Target::Peer(provider), messages::request_up_to_date(joiner));
        }
        debug!(peer = joiner, %domain, providers = providers.len(), "Join started");
    }

    /// Send the joiner every entity of its domain, then the ready signal
    pub(crate) fn send_relevant_objects(&mut self, joiner: PeerId) {
        let Some(domain) = self.world.players.get(&joiner).map(|p| p.domain.clone()) else {
            return;
        };
        self.send_snapshot::<ItemData>(joiner, &domain);
        self.send_snapshot::<SosigData>(joiner, &domain);
        self.send_snapshot::<AutoMeaterData>(joiner, &domain);
        self.send_snapshot::<EncryptionData>(joiner, &domain);
        self.outbox.push(Target::Peer(joiner), messages::relevant_objects_sent());
        info!(peer = joiner, %domain, "Relevant objects sent");
    }

    fn send_snapshot<D: KindData>(&mut self, joiner: PeerId, domain: &Domain) {
        let packets = messages::kind_up_to_date(
            self.world
                .registry::<D>()
                .iter()
                .map(|(_, entity)| entity)
                .filter(|entity| entity.tracked_id >= 0 && entity.domain == *domain),
            None,
        );
        for packet in packets {
            self.outbox.push(Target::Peer(joiner), packet);
        }
    }

    // ------------------------------------------------------------------
    // Server-local API
    // ------------------------------------------------------------------

    /// Enter a domain as a listen-server host, materializing its entities
    pub fn enter_domain(&mut self, domain: Option<Domain>) {
        self.world.enter_domain(&mut self.sim, domain);
    }

    /// Spawn a server-owned entity and announce it to every peer
    pub fn spawn<D: KindData>(&mut self, mut entity: TrackedEntity<D>) -> Result<TrackedId, ProtocolError> {
        let id = self.world.registry_mut::<D>().allocate();
        entity.tracked_id = id;
        entity.controller = SERVER_ID;
        self.world.upsert::<D, S>(&mut self.sim, entity)?;
        let record = self.world.get::<D>(id)?;
        let packet = messages::kind_spawn(record, -1);
        self.outbox.push(Target::All, packet);
        debug!(kind = %D::KIND, tracked_id = id, "Spawned server entity");
        Ok(id)
    }

    pub fn destroy<D: KindData>(&mut self, tracked_id: TrackedId, remove: bool) -> Result<(), ProtocolError> {
        self.world.destroy::<D, S>(&mut self.sim, tracked_id, remove)?;
        self.outbox.push(Target::All, messages::kind_destroy::<D>(tracked_id, remove));
        Ok(())
    }

    /// Reassign an entity to `controller` and broadcast the change
    pub fn give_control<D: KindData>(&mut self, tracked_id: TrackedId, controller: PeerId) -> Result<(), ProtocolError> {
        if controller != SERVER_ID && !self.world.players.contains_key(&controller) {
            return Err(ProtocolError::UnknownPeer(controller));
        }
        self.world.give_control::<D, S>(&mut self.sim, tracked_id, controller)?;
        self.outbox.push(Target::All, messages::kind_give_control::<D>(tracked_id, controller));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::simulation::HeadlessSimulation;
    use crate::net::protocol::{kind_packet_id, KindOp, ServerPacket};
    use crate::game::entity::EntityKind;

    fn session() -> ServerSession<HeadlessSimulation> {
        ServerSession::new(
            SceneTable::with_builtin(["MainMenu", "Village"]),
            "hello",
            HeadlessSimulation::new(),
        )
    }

    fn first_id(outbound: &Outbound) -> i32 {
        Packet::from_bytes(outbound.payload.clone()).read_i32().unwrap()
    }

    #[test]
    fn test_connect_sends_welcome() {
        let mut server = session();
        server.on_connect(3);
        let out = server.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Target::Peer(3));
        assert_eq!(first_id(&out[0]), ServerPacket::Welcome.id());
    }

    #[test]
    fn test_spawn_allocates_and_broadcasts() {
        let mut server = session();
        let item = ItemData {
            item_id: "Crate".into(),
            state: Vec::new(),
        };
        let a = server.spawn(TrackedEntity::new(item.clone(), Domain::new("Village", 0))).unwrap();
        let b = server.spawn(TrackedEntity::new(item, Domain::new("Village", 0))).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(server.world().items.local_len(), 2);

        let out = server.take_outbound();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| o.target == Target::All));
        assert_eq!(first_id(&out[0]), kind_packet_id(EntityKind::Item, KindOp::Full));
    }

    #[test]
    fn test_give_control_to_unknown_peer_rejected() {
        let mut server = session();
        let id = server
            .spawn(TrackedEntity::new(SosigData::default(), Domain::new("Village", 0)))
            .unwrap();
        assert_eq!(
            server.give_control::<SosigData>(id, 9),
            Err(ProtocolError::UnknownPeer(9))
        );
    }

    #[test]
    fn test_unknown_packet_counted_as_decode_error() {
        let metrics = Arc::new(Metrics::new());
        let mut server = session().with_metrics(metrics.clone());
        let result = server.handle_packet(1, Packet::with_id(999).into_bytes());
        assert!(matches!(result, Err(DispatchError::UnknownPacket { id: 999, .. })));
        assert_eq!(metrics.decode_errors.load(Ordering::Relaxed), 1);
        assert_eq!(server.world().entity_count(), 0);
    }

    #[test]
    fn test_destroy_recycles_id() {
        let mut server = session();
        let domain = Domain::new("Village", 0);
        let id = server
            .spawn(TrackedEntity::new(EncryptionData::default(), domain.clone()))
            .unwrap();
        server.destroy::<EncryptionData>(id, true).unwrap();
        let again = server
            .spawn(TrackedEntity::new(EncryptionData::default(), domain))
            .unwrap();
        assert_eq!(again, id);
    }
}
