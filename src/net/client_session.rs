//! Client side of a replication session
//!
//! A client mirrors the server's registries, simulates the entities it
//! controls and reports local events (spawns, control changes, damage,
//! scene moves) through the methods below. Spawns stay pending until the
//! server echoes the request token back with a tracked ID.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::game::constants::packet::WHOLE_ENTITY;
use crate::game::constants::peer::{INVALID_ID, SERVER_ID};
use crate::game::damage::Damage;
use crate::game::entity::{EntityKind, KindData, PeerId, TrackedEntity, TrackedId};
use crate::game::kinds::{AutoMeaterData, EncryptionData, ItemData, SosigData};
use crate::game::player::{BodyPart, PlayerTransform};
use crate::game::registry::EntityKey;
use crate::game::scene::{Domain, SceneTable};
use crate::game::simulation::{DamageTarget, LocalHandle, Simulation};
use crate::game::world::{ProtocolError, World};
use crate::net::client_handle::client_table;
use crate::net::codec::Packet;
use crate::net::dispatch::{DispatchError, DispatchTable};
use crate::net::messages;
use crate::net::outbox::{Outbound, Outbox, Target};
use crate::net::protocol::Direction;
use crate::net::queue::InboundEvent;

/// Session-level happenings surfaced to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotice {
    Welcomed { peer: PeerId, greeting: String },
    PlayerJoined(PeerId),
    PlayerLeft(PeerId),
    /// A pending local spawn received its tracked ID
    Spawned {
        kind: EntityKind,
        key: EntityKey,
        tracked_id: TrackedId,
    },
    /// Every entity of the current domain has been received
    Ready,
    Disconnected(String),
}

pub struct ClientSession<S: Simulation> {
    pub(crate) world: World,
    pub(crate) sim: S,
    pub(crate) outbox: Outbox,
    pub(crate) username: String,
    pub(crate) welcomed: bool,
    pub(crate) loading: bool,
    pub(crate) ready: bool,
    next_request: i32,
    pub(crate) pending: FxHashMap<(EntityKind, i32), EntityKey>,
    pub(crate) notices: Vec<ClientNotice>,
    handlers: Arc<DispatchTable<ClientSession<S>>>,
}

impl<S: Simulation> ClientSession<S> {
    /// A client that starts out in `domain` with its scene already loaded
    pub fn new(username: impl Into<String>, domain: Domain, scenes: SceneTable, sim: S) -> Self {
        let mut session = Self {
            world: World::new(INVALID_ID, scenes),
            sim,
            outbox: Outbox::new(Direction::ToServer),
            username: username.into(),
            welcomed: false,
            loading: false,
            ready: false,
            next_request: 0,
            pending: FxHashMap::default(),
            notices: Vec::new(),
            handlers: Arc::new(client_table()),
        };
        session.world.enter_domain(&mut session.sim, Some(domain));
        session
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

    /// Peer ID assigned by the server, or -1 before `Welcome`
    pub fn peer_id(&self) -> PeerId {
        self.world.local_peer()
    }

    pub fn is_welcomed(&self) -> bool {
        self.welcomed
    }

    /// True once the server has sent every entity of the current domain
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending_spawns(&self) -> usize {
        self.pending.len()
    }

    pub fn take_notices(&mut self) -> Vec<ClientNotice> {
        std::mem::take(&mut self.notices)
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        self.outbox.drain()
    }

    fn send(&mut self, packet: Packet) {
        self.outbox.push(Target::Peer(SERVER_ID), packet);
    }

    fn require_welcome(&self) -> Result<PeerId, ProtocolError> {
        if self.welcomed {
            Ok(self.world.local_peer())
        } else {
            Err(ProtocolError::NotWelcomed)
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Connected { addr, .. } => debug!(%addr, "Connected to server"),
            InboundEvent::Packet { payload, .. } => {
                let _ = self.handle_packet(payload);
            }
            InboundEvent::Disconnected { reason, .. } => {
                info!(%reason, "Disconnected from server");
                self.welcomed = false;
                self.ready = false;
                self.notices.push(ClientNotice::Disconnected(reason));
            }
        }
    }

    /// Dispatch one packet from the server; errors are logged and the packet dropped
    pub fn handle_packet(&mut self, payload: Vec<u8>) -> Result<i32, DispatchError> {
        let handlers = Arc::clone(&self.handlers);
        let mut packet = Packet::from_bytes(payload);
        let result = handlers.dispatch(self, SERVER_ID, &mut packet);
        match &result {
            Ok(id) => trace!(id, "Handled packet"),
            Err(e) if e.is_decode() => warn!(error = %e, "Dropping malformed packet"),
            Err(e) => warn!(error = %e, "Rejected packet"),
        }
        result
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Capture locally simulated state and queue deltas to the server
    pub fn tick(&mut self) {
        if !self.welcomed {
            return;
        }
        self.tick_kind::<ItemData>();
        self.tick_kind::<SosigData>();
        self.tick_kind::<AutoMeaterData>();
        self.tick_kind::<EncryptionData>();
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
            // pending spawns have nothing to address updates to yet
            if entity.tracked_id < 0 {
                continue;
            }
            if self.sim.capture_state(handle, entity) {
                entity.advance_order();
                changed.push(key);
            }
        }
        if changed.is_empty() {
            return;
        }
        let registry = self.world.registry::<D>();
        let packets = messages::kind_updates(changed.iter().filter_map(|key| registry.entity(*key)));
        for packet in packets {
            self.send(packet);
        }
    }

    // ------------------------------------------------------------------
    // Local API
    // ------------------------------------------------------------------

    /// Register an entity the host just created; returns its registry key
    ///
    /// The entity is simulated locally right away and receives its tracked
    /// ID when the server's echo arrives.
    pub fn spawn_local<D: KindData>(
        &mut self,
        mut entity: TrackedEntity<D>,
        handle: LocalHandle,
    ) -> Result<EntityKey, ProtocolError> {
        let peer = self.require_welcome()?;
        if let Some(domain) = self.world.domain() {
            entity.domain = domain.clone();
        }
        entity.handle = Some(handle);
        entity.last_order = None;
        let key = self.world.registry_mut::<D>().insert_pending(entity, peer);

        let token = self.next_request;
        self.next_request = self.next_request.wrapping_add(1).max(0);
        self.pending.insert((D::KIND, token), key);

        let packet = self
            .world
            .registry::<D>()
            .entity(key)
            .map(|entity| messages::kind_spawn(entity, token));
        if let Some(packet) = packet {
            self.send(packet);
        }
        debug!(kind = %D::KIND, token, "Spawn requested");
        Ok(key)
    }

    /// Take control of an entity, optimistically migrating it right away
    ///
    /// The server either confirms or answers with the actual controller,
    /// which undoes the migration.
    pub fn request_control<D: KindData>(&mut self, tracked_id: TrackedId) -> Result<(), ProtocolError> {
        let peer = self.require_welcome()?;
        let observed = self.world.get::<D>(tracked_id)?.controller;
        if observed == peer {
            return Ok(());
        }
        self.world.give_control::<D, S>(&mut self.sim, tracked_id, peer)?;
        self.send(messages::kind_request_control::<D>(tracked_id, observed));
        Ok(())
    }

    /// Hand a locally controlled entity to `controller` (0 for the server)
    pub fn give_control<D: KindData>(&mut self, tracked_id: TrackedId, controller: PeerId) -> Result<(), ProtocolError> {
        let peer = self.require_welcome()?;
        let current = self.world.get::<D>(tracked_id)?.controller;
        if current != peer {
            return Err(ProtocolError::NotController {
                kind: D::KIND,
                tracked_id,
                peer,
                controller: current,
            });
        }
        self.world.give_control::<D, S>(&mut self.sim, tracked_id, controller)?;
        self.send(messages::kind_give_control::<D>(tracked_id, controller));
        Ok(())
    }

    /// Destroy an entity everywhere; `remove` also frees its tracked ID
    pub fn destroy_local<D: KindData>(&mut self, tracked_id: TrackedId, remove: bool) -> Result<(), ProtocolError> {
        self.require_welcome()?;
        self.world.destroy::<D, S>(&mut self.sim, tracked_id, remove)?;
        self.send(messages::kind_destroy::<D>(tracked_id, remove));
        Ok(())
    }

    /// Drop a pending spawn that was never acknowledged
    pub fn cancel_spawn<D: KindData>(&mut self, key: EntityKey) -> Option<TrackedEntity<D>> {
        self.pending.retain(|(kind, _), pending| !(*kind == D::KIND && *pending == key));
        let entity = self.world.registry_mut::<D>().remove_pending(key)?;
        if let Some(handle) = entity.handle {
            self.sim.destroy(handle);
        }
        Some(entity)
    }

    pub fn set_parent(&mut self, tracked_id: TrackedId, parent: TrackedId) -> Result<(), ProtocolError> {
        self.require_welcome()?;
        self.world.set_parent(&mut self.sim, tracked_id, parent)?;
        self.send(messages::item_parent(tracked_id, parent));
        Ok(())
    }

    /// Move to another scene; call [`ClientSession::done_loading`] once it is loaded
    pub fn change_scene(&mut self, scene: impl Into<String>) -> Result<(), ProtocolError> {
        let instance = self.world.domain().map(|d| d.instance).unwrap_or(0);
        let domain = Domain::new(scene, instance);
        if !self.world.scenes.is_synchronized(&domain.scene) {
            return Err(ProtocolError::UnsyncedScene(domain.scene));
        }
        self.leave_domain(domain.clone())?;
        self.send(messages::player_scene(&domain));
        Ok(())
    }

    /// Move to another instance of the current scene
    pub fn change_instance(&mut self, instance: i32) -> Result<(), ProtocolError> {
        let scene = self
            .world
            .domain()
            .map(|d| d.scene.clone())
            .unwrap_or_default();
        self.leave_domain(Domain::new(scene, instance))?;
        self.send(messages::player_instance(instance));
        Ok(())
    }

    /// Give owned entities back to the server and switch materialization
    fn leave_domain(&mut self, domain: Domain) -> Result<(), ProtocolError> {
        let peer = self.require_welcome()?;
        self.release_kind::<ItemData>(peer);
        self.release_kind::<SosigData>(peer);
        self.release_kind::<AutoMeaterData>(peer);
        self.release_kind::<EncryptionData>(peer);
        info!(from = ?self.world.domain(), to = %domain, "Changing domain");
        self.world.enter_domain(&mut self.sim, Some(domain));
        self.loading = true;
        self.ready = false;
        Ok(())
    }

    fn release_kind<D: KindData>(&mut self, peer: PeerId) {
        for tracked_id in self.world.controlled_by::<D>(peer) {
            if self.world.give_control::<D, S>(&mut self.sim, tracked_id, SERVER_ID).is_ok() {
                self.send(messages::kind_give_control::<D>(tracked_id, SERVER_ID));
            }
        }
    }

    /// The host finished loading the current scene
    pub fn done_loading(&mut self) {
        self.loading = false;
        if self.welcomed {
            self.send(messages::done_loading_scene());
        }
    }

    /// Start synchronizing a scene that is not built in
    pub fn add_sync_scene(&mut self, scene: &str) -> Result<(), ProtocolError> {
        let peer = self.require_welcome()?;
        if self.world.scenes.register(scene, peer) {
            self.send(messages::add_sync_scene(scene));
        }
        Ok(())
    }

    pub fn send_player_state(&mut self, transform: &PlayerTransform) {
        if self.welcomed {
            self.send(messages::player_state(transform));
        }
    }

    /// Report a hit on an entity: applied here if we simulate it, else sent on
    pub fn damage_entity<D: KindData>(
        &mut self,
        tracked_id: TrackedId,
        sub_index: Option<u8>,
        damage: &Damage,
    ) -> Result<(), ProtocolError> {
        let peer = self.require_welcome()?;
        let entity = self.world.get::<D>(tracked_id)?;
        let sub_index = sub_index.unwrap_or(WHOLE_ENTITY);
        if entity.controller == peer {
            let target = DamageTarget::Entity {
                kind: D::KIND,
                tracked_id,
                handle: entity.handle,
                sub_index,
            };
            self.sim.apply_damage(target, damage);
        } else {
            self.send(messages::kind_damage::<D>(tracked_id, sub_index, damage));
        }
        Ok(())
    }

    /// Report a hit on another player (0 for a server-hosted player)
    pub fn damage_player(&mut self, target: PeerId, part: BodyPart, damage: &Damage) -> Result<(), ProtocolError> {
        self.require_welcome()?;
        self.send(messages::player_damage(target, part, damage));
        Ok(())
    }

    /// Broadcast a kind event that already happened in the local simulation
    pub fn send_event<D: KindData>(&mut self, tracked_id: TrackedId, event: D::Event) -> Result<(), ProtocolError> {
        self.require_welcome()?;
        let entity = self
            .world
            .registry_mut::<D>()
            .get_mut(tracked_id)
            .ok_or(ProtocolError::UnknownEntity {
                kind: D::KIND,
                tracked_id,
            })?;
        if !entity.data.accepts_event(&event) {
            return Err(ProtocolError::InvalidEvent {
                kind: D::KIND,
                tracked_id,
            });
        }
        entity.data.apply_event(&event);
        self.send(messages::kind_event::<D>(tracked_id, &event));
        Ok(())
    }

    /// Answer a snapshot request with every entity this client controls
    pub(crate) fn send_up_to_date(&mut self, for_peer: PeerId) {
        self.send_snapshot::<ItemData>(for_peer);
        self.send_snapshot::<SosigData>(for_peer);
        self.send_snapshot::<AutoMeaterData>(for_peer);
        self.send_snapshot::<EncryptionData>(for_peer);
        self.send(messages::done_sending_up_to_date(for_peer));
    }

    fn send_snapshot<D: KindData>(&mut self, for_peer: PeerId) {
        let registry = self.world.registry::<D>();
        let packets = messages::kind_up_to_date(
            registry
                .local_keys()
                .iter()
                .filter_map(|key| registry.entity(*key))
                .filter(|entity| entity.tracked_id >= 0),
            Some(for_peer),
        );
        for packet in packets {
            self.send(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::simulation::HeadlessSimulation;

    fn client() -> ClientSession<HeadlessSimulation> {
        ClientSession::new(
            "alice",
            Domain::new("Village", 0),
            SceneTable::with_builtin(["MainMenu", "Village"]),
            HeadlessSimulation::new(),
        )
    }

    fn welcomed(peer: PeerId) -> ClientSession<HeadlessSimulation> {
        let mut c = client();
        let welcome = messages::welcome(peer, "hi", &SceneTable::default());
        c.handle_packet(welcome.into_bytes()).unwrap();
        c.take_outbound();
        c
    }

    #[test]
    fn test_local_api_requires_welcome() {
        let mut c = client();
        let item = TrackedEntity::new(ItemData::default(), Domain::new("Village", 0));
        assert_eq!(
            c.spawn_local(item, LocalHandle(1)).unwrap_err(),
            ProtocolError::NotWelcomed
        );
        assert!(c.take_outbound().is_empty());
    }

    #[test]
    fn test_spawn_local_is_pending() {
        let mut c = welcomed(2);
        let item = TrackedEntity::new(ItemData::default(), Domain::new("Arena", 0));
        let key = c.spawn_local(item, LocalHandle(9)).unwrap();
        assert_eq!(c.pending_spawns(), 1);

        let entity = c.world().items.entity(key).unwrap();
        assert_eq!(entity.tracked_id, INVALID_ID);
        assert_eq!(entity.controller, 2);
        assert_eq!(entity.local_index, 0);
        // spawns land in the spawner's domain
        assert_eq!(entity.domain, Domain::new("Village", 0));

        let out = c.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Target::Peer(SERVER_ID));
    }

    #[test]
    fn test_cancel_spawn() {
        let mut c = welcomed(2);
        let item = TrackedEntity::new(ItemData::default(), Domain::new("Village", 0));
        let key = c.spawn_local(item, LocalHandle(9)).unwrap();
        assert!(c.cancel_spawn::<ItemData>(key).is_some());
        assert_eq!(c.pending_spawns(), 0);
        assert_eq!(c.world().items.local_len(), 0);
    }

    #[test]
    fn test_change_scene_to_unsynced_rejected() {
        let mut c = welcomed(2);
        assert_eq!(
            c.change_scene("Castle"),
            Err(ProtocolError::UnsyncedScene("Castle".into()))
        );
        assert_eq!(c.world().domain(), Some(&Domain::new("Village", 0)));
    }

    #[test]
    fn test_done_loading_notifies_server() {
        let mut c = welcomed(2);
        c.change_instance(3).unwrap();
        assert!(!c.is_ready());
        c.done_loading();
        let out = c.take_outbound();
        assert_eq!(out.len(), 2);
    }
}
