//! Replication state owned by one session
//!
//! A `World` bundles what a peer knows about the session: its own peer ID
//! and domain, one registry per entity kind, the player roster and the
//! synchronized-scenes table. Sessions own exactly one and pass it to
//! handlers by reference; all mutation happens on the session's thread.

use rustc_hash::FxHashMap;

use crate::game::authority::Migration;
use crate::game::entity::{EntityKind, KindData, PeerId, TrackedEntity, TrackedId};
use crate::game::kinds::{AutoMeaterData, EncryptionData, ItemData, SosigData};
use crate::game::player::Player;
use crate::game::registry::{EntityKey, KindRegistry, RegistryError};
use crate::game::scene::{Domain, SceneTable};
use crate::game::simulation::Simulation;

/// Handler-level rejections: logged and ignored, never applied
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown {kind} {tracked_id}")]
    UnknownEntity {
        kind: EntityKind,
        tracked_id: TrackedId,
    },
    #[error("Peer {peer} does not control {kind} {tracked_id} (controller {controller})")]
    NotController {
        kind: EntityKind,
        tracked_id: TrackedId,
        peer: PeerId,
        controller: PeerId,
    },
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Scene '{0}' is not synchronized")]
    UnsyncedScene(String),
    #[error("Peer ID mismatch: assigned {expected}, echoed {got}")]
    PeerMismatch { expected: PeerId, got: PeerId },
    #[error("No pending {kind} spawn for request {token}")]
    UnknownRequest { kind: EntityKind, token: i32 },
    #[error("Session has not been welcomed yet")]
    NotWelcomed,
    #[error("Event out of range for {kind} {tracked_id}")]
    InvalidEvent { kind: EntityKind, tracked_id: TrackedId },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct World {
    local_peer: PeerId,
    domain: Option<Domain>,
    pub items: KindRegistry<ItemData>,
    pub sosigs: KindRegistry<SosigData>,
    pub auto_meaters: KindRegistry<AutoMeaterData>,
    pub encryptions: KindRegistry<EncryptionData>,
    pub players: FxHashMap<PeerId, Player>,
    pub scenes: SceneTable,
}

impl World {
    pub fn new(local_peer: PeerId, scenes: SceneTable) -> Self {
        Self {
            local_peer,
            domain: None,
            items: KindRegistry::new(),
            sosigs: KindRegistry::new(),
            auto_meaters: KindRegistry::new(),
            encryptions: KindRegistry::new(),
            players: FxHashMap::default(),
            scenes,
        }
    }

    #[inline]
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Set once the server assigns an ID; only valid before any local entity exists
    pub fn set_local_peer(&mut self, peer: PeerId) {
        self.local_peer = peer;
    }

    #[inline]
    pub fn domain(&self) -> Option<&Domain> {
        self.domain.as_ref()
    }

    /// Whether entities of `domain` are materialized on this peer
    #[inline]
    pub fn is_relevant(&self, domain: &Domain) -> bool {
        self.domain.as_ref() == Some(domain)
    }

    #[inline]
    pub fn registry<D: KindData>(&self) -> &KindRegistry<D> {
        D::registry(self)
    }

    #[inline]
    pub fn registry_mut<D: KindData>(&mut self) -> &mut KindRegistry<D> {
        D::registry_mut(self)
    }

    pub fn get<D: KindData>(&self, tracked_id: TrackedId) -> Result<&TrackedEntity<D>, ProtocolError> {
        self.registry::<D>()
            .get(tracked_id)
            .ok_or(ProtocolError::UnknownEntity {
                kind: D::KIND,
                tracked_id,
            })
    }

    fn key<D: KindData>(&self, tracked_id: TrackedId) -> Result<EntityKey, ProtocolError> {
        self.registry::<D>()
            .key_of(tracked_id)
            .ok_or(ProtocolError::UnknownEntity {
                kind: D::KIND,
                tracked_id,
            })
    }

    /// Store a full record, or refresh the existing entity with the same ID
    ///
    /// Controller changes carried by the record are migrated like a
    /// `GiveControl`. The entity is materialized iff its domain is relevant.
    pub fn upsert<D: KindData, S: Simulation>(
        &mut self,
        sim: &mut S,
        mut record: TrackedEntity<D>,
    ) -> Result<EntityKey, ProtocolError> {
        let local_peer = self.local_peer;
        let controller = record.controller;
        record.handle = None;
        record.last_order = None;

        let key = match self.registry::<D>().key_of(record.tracked_id) {
            Some(key) => {
                if let Some(entity) = self.registry_mut::<D>().entity_mut(key) {
                    entity.refresh_from(record);
                }
                let migration = self
                    .registry_mut::<D>()
                    .set_controller(key, controller, local_peer)?;
                self.apply_migration::<D, S>(sim, key, migration);
                key
            }
            None => self.registry_mut::<D>().insert(record, local_peer)?,
        };
        self.sync_materialization::<D, S>(sim, key);
        Ok(key)
    }

    /// Apply a delta from `sender`; returns false if it was stale or ignored
    ///
    /// `sender = None` skips the controller check (client side, where the
    /// server has already validated the sender).
    pub fn apply_update<D: KindData, S: Simulation>(
        &mut self,
        sim: &mut S,
        update: &TrackedEntity<D>,
        sender: Option<PeerId>,
    ) -> Result<bool, ProtocolError> {
        let key = self.key::<D>(update.tracked_id)?;
        let Some(entity) = self.registry_mut::<D>().entity_mut(key) else {
            return Ok(false);
        };
        if let Some(peer) = sender {
            if entity.controller != peer {
                return Err(ProtocolError::NotController {
                    kind: D::KIND,
                    tracked_id: update.tracked_id,
                    peer,
                    controller: entity.controller,
                });
            }
        }
        // our own simulation is authoritative for entities we control
        if entity.is_local() {
            return Ok(false);
        }
        if !entity.apply_update(update) {
            return Ok(false);
        }
        if let Some(handle) = entity.handle {
            sim.apply_state(handle, &*entity);
        }
        Ok(true)
    }

    /// Reassign control and migrate local storage; idempotent
    pub fn give_control<D: KindData, S: Simulation>(
        &mut self,
        sim: &mut S,
        tracked_id: TrackedId,
        controller: PeerId,
    ) -> Result<Migration, ProtocolError> {
        let key = self.key::<D>(tracked_id)?;
        let local_peer = self.local_peer;
        let migration = self
            .registry_mut::<D>()
            .set_controller(key, controller, local_peer)?;
        self.apply_migration::<D, S>(sim, key, migration);
        Ok(migration)
    }

    fn apply_migration<D: KindData, S: Simulation>(
        &mut self,
        sim: &mut S,
        key: EntityKey,
        migration: Migration,
    ) {
        let Some(simulated) = migration.simulated() else {
            return;
        };
        if let Some(handle) = self.registry::<D>().entity(key).and_then(|e| e.handle) {
            sim.set_simulated(handle, simulated);
        }
    }

    /// Destroy an entity; `remove` also frees its tracked ID
    pub fn destroy<D: KindData, S: Simulation>(
        &mut self,
        sim: &mut S,
        tracked_id: TrackedId,
        remove: bool,
    ) -> Result<(), ProtocolError> {
        let key = self.key::<D>(tracked_id)?;
        if remove {
            if let Some(entity) = self.registry_mut::<D>().remove(tracked_id) {
                if let Some(handle) = entity.handle {
                    sim.destroy(handle);
                }
            }
        } else if let Some(entity) = self.registry_mut::<D>().entity_mut(key) {
            if let Some(handle) = entity.handle.take() {
                sim.destroy(handle);
            }
        }
        Ok(())
    }

    /// Fold a kind event into the record and forward it to the local instance
    pub fn apply_event<D: KindData, S: Simulation>(
        &mut self,
        sim: &mut S,
        tracked_id: TrackedId,
        event: &D::Event,
    ) -> Result<(), ProtocolError> {
        let key = self.key::<D>(tracked_id)?;
        if let Some(entity) = self.registry_mut::<D>().entity_mut(key) {
            if !entity.data.accepts_event(event) {
                return Err(ProtocolError::InvalidEvent {
                    kind: D::KIND,
                    tracked_id,
                });
            }
            entity.data.apply_event(event);
            if let Some(handle) = entity.handle {
                sim.apply_event(handle, &D::wrap_event(event.clone()));
            }
        }
        Ok(())
    }

    pub fn set_parent<S: Simulation>(
        &mut self,
        sim: &mut S,
        tracked_id: TrackedId,
        parent: TrackedId,
    ) -> Result<(), ProtocolError> {
        let entity = self
            .items
            .get_mut(tracked_id)
            .ok_or(ProtocolError::UnknownEntity {
                kind: EntityKind::Item,
                tracked_id,
            })?;
        entity.parent = parent;
        if let Some(handle) = entity.handle {
            sim.apply_state(handle, &*entity);
        }
        Ok(())
    }

    /// Tracked IDs of every entity of kind `D` controlled by `peer`
    pub fn controlled_by<D: KindData>(&self, peer: PeerId) -> Vec<TrackedId> {
        self.registry::<D>()
            .iter()
            .filter(|(_, e)| e.controller == peer && e.tracked_id >= 0)
            .map(|(_, e)| e.tracked_id)
            .collect()
    }

    /// Move the local peer to `domain` and (de)materialize accordingly
    pub fn enter_domain<S: Simulation>(&mut self, sim: &mut S, domain: Option<Domain>) {
        self.domain = domain;
        self.refresh_kind::<ItemData, S>(sim);
        self.refresh_kind::<SosigData, S>(sim);
        self.refresh_kind::<AutoMeaterData, S>(sim);
        self.refresh_kind::<EncryptionData, S>(sim);
    }

    fn refresh_kind<D: KindData, S: Simulation>(&mut self, sim: &mut S) {
        let keys: Vec<EntityKey> = self.registry::<D>().iter().map(|(key, _)| key).collect();
        for key in keys {
            self.sync_materialization::<D, S>(sim, key);
        }
    }

    fn sync_materialization<D: KindData, S: Simulation>(&mut self, sim: &mut S, key: EntityKey) {
        let domain = self.domain.clone();
        let Some(entity) = self.registry_mut::<D>().entity_mut(key) else {
            return;
        };
        let relevant = domain.as_ref() == Some(&entity.domain);
        match (relevant, entity.handle) {
            (true, None) => {
                entity.handle = sim.spawn(&*entity);
                if let Some(handle) = entity.handle {
                    sim.set_simulated(handle, entity.is_local());
                }
            }
            (true, Some(handle)) => sim.apply_state(handle, &*entity),
            (false, Some(handle)) => {
                entity.handle = None;
                sim.destroy(handle);
            }
            (false, None) => {}
        }
    }

    /// Authority invariant across all kinds
    pub fn check_consistency(&self) -> Result<(), String> {
        let peer = self.local_peer;
        self.items.check_consistency(peer)?;
        self.sosigs.check_consistency(peer)?;
        self.auto_meaters.check_consistency(peer)?;
        self.encryptions.check_consistency(peer)
    }

    /// Live entities across all kinds
    pub fn entity_count(&self) -> usize {
        self.items.len() + self.sosigs.len() + self.auto_meaters.len() + self.encryptions.len()
    }

    /// Peers (other than `except`) currently in `domain`
    pub fn peers_in(&self, domain: &Domain, except: PeerId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .players
            .values()
            .filter(|p| p.id != except && &p.domain == domain)
            .map(|p| p.id)
            .collect();
        peers.sort_unstable();
        peers
    }
}
