//! Per-kind entity registry
//!
//! Entities live in a generational arena and are reachable two ways:
//! - by tracked ID, through a sparse array that grows in fixed chunks and
//!   never shrinks; freed IDs are reused lowest first
//! - by local index, through a dense array of the entities this peer
//!   currently simulates
//!
//! Leaving the dense array is a swap-remove; the moved entity's stored
//! `local_index` is patched in the same call so the two views never disagree.

use std::collections::BTreeSet;

use slotmap::SlotMap;

use crate::game::authority::Migration;
use crate::game::constants::peer::INVALID_ID;
use crate::game::constants::registry::GROWTH_CHUNK;
use crate::game::entity::{KindData, PeerId, TrackedEntity, TrackedId};

slotmap::new_key_type! {
    /// Stable handle to an entity, valid across dense-array reshuffles
    pub struct EntityKey;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid tracked ID {0}")]
    InvalidId(TrackedId),
    #[error("Tracked ID {0} is already in use")]
    Occupied(TrackedId),
    #[error("Entity already has tracked ID {0}")]
    NotPending(TrackedId),
    #[error("Entity handle is stale")]
    StaleKey,
}

/// Registry for one entity kind
#[derive(Debug)]
pub struct KindRegistry<D> {
    arena: SlotMap<EntityKey, TrackedEntity<D>>,
    tracked: Vec<Option<EntityKey>>,
    free_ids: BTreeSet<TrackedId>,
    next_id: TrackedId,
    local: Vec<EntityKey>,
}

impl<D: KindData> Default for KindRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: KindData> KindRegistry<D> {
    pub fn new() -> Self {
        Self {
            arena: SlotMap::with_key(),
            tracked: vec![None; GROWTH_CHUNK],
            free_ids: BTreeSet::new(),
            next_id: 0,
            local: Vec::new(),
        }
    }

    /// Slots in the tracked array
    #[inline]
    pub fn capacity(&self) -> usize {
        self.tracked.len()
    }

    /// Entities held, including ones still waiting for a tracked ID
    #[inline]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Entities in the local dense array
    #[inline]
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Hand out a tracked ID: reuse the lowest freed one, else take the next slot
    pub fn allocate(&mut self) -> TrackedId {
        loop {
            let id = match self.free_ids.pop_first() {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    id
                }
            };
            self.ensure_capacity(id as usize);
            if self.tracked[id as usize].is_none() {
                return id;
            }
        }
    }

    fn ensure_capacity(&mut self, index: usize) {
        while self.tracked.len() <= index {
            let grown = self.tracked.len() + GROWTH_CHUNK;
            self.tracked.resize(grown, None);
        }
    }

    #[inline]
    pub fn key_of(&self, tracked_id: TrackedId) -> Option<EntityKey> {
        let index = usize::try_from(tracked_id).ok()?;
        self.tracked.get(index).copied().flatten()
    }

    pub fn get(&self, tracked_id: TrackedId) -> Option<&TrackedEntity<D>> {
        self.arena.get(self.key_of(tracked_id)?)
    }

    pub fn get_mut(&mut self, tracked_id: TrackedId) -> Option<&mut TrackedEntity<D>> {
        let key = self.key_of(tracked_id)?;
        self.arena.get_mut(key)
    }

    #[inline]
    pub fn entity(&self, key: EntityKey) -> Option<&TrackedEntity<D>> {
        self.arena.get(key)
    }

    #[inline]
    pub fn entity_mut(&mut self, key: EntityKey) -> Option<&mut TrackedEntity<D>> {
        self.arena.get_mut(key)
    }

    /// Key of the entity at `local_index` in the dense array
    pub fn local_key(&self, local_index: usize) -> Option<EntityKey> {
        self.local.get(local_index).copied()
    }

    /// Keys of locally simulated entities, in dense-array order
    pub fn local_keys(&self) -> &[EntityKey] {
        &self.local
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityKey, &TrackedEntity<D>)> {
        self.arena.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityKey, &mut TrackedEntity<D>)> {
        self.arena.iter_mut()
    }

    /// Store an entity under its tracked ID
    ///
    /// The entity enters the dense array iff `local_peer` controls it.
    pub fn insert(
        &mut self,
        mut entity: TrackedEntity<D>,
        local_peer: PeerId,
    ) -> Result<EntityKey, RegistryError> {
        let id = entity.tracked_id;
        let index = usize::try_from(id).map_err(|_| RegistryError::InvalidId(id))?;
        self.ensure_capacity(index);
        if self.tracked[index].is_some() {
            return Err(RegistryError::Occupied(id));
        }
        self.free_ids.remove(&id);
        entity.local_index = INVALID_ID;
        let is_local = entity.controller == local_peer;
        let key = self.arena.insert(entity);
        self.tracked[index] = Some(key);
        if is_local {
            self.attach_local(key);
        }
        Ok(key)
    }

    /// Store a locally spawned entity that has no tracked ID yet
    pub fn insert_pending(&mut self, mut entity: TrackedEntity<D>, local_peer: PeerId) -> EntityKey {
        entity.tracked_id = INVALID_ID;
        entity.controller = local_peer;
        entity.local_index = INVALID_ID;
        let key = self.arena.insert(entity);
        self.attach_local(key);
        key
    }

    /// Give a pending entity the tracked ID the server assigned
    pub fn assign_id(&mut self, key: EntityKey, tracked_id: TrackedId) -> Result<(), RegistryError> {
        let current = self.arena.get(key).ok_or(RegistryError::StaleKey)?.tracked_id;
        if current != INVALID_ID {
            return Err(RegistryError::NotPending(current));
        }
        let index = usize::try_from(tracked_id).map_err(|_| RegistryError::InvalidId(tracked_id))?;
        self.ensure_capacity(index);
        if self.tracked[index].is_some() {
            return Err(RegistryError::Occupied(tracked_id));
        }
        self.tracked[index] = Some(key);
        if let Some(entity) = self.arena.get_mut(key) {
            entity.tracked_id = tracked_id;
        }
        Ok(())
    }

    /// Change an entity's controller and migrate it in or out of the dense array
    pub fn set_controller(
        &mut self,
        key: EntityKey,
        controller: PeerId,
        local_peer: PeerId,
    ) -> Result<Migration, RegistryError> {
        let entity = self.arena.get_mut(key).ok_or(RegistryError::StaleKey)?;
        let previous = entity.controller;
        entity.controller = controller;
        let was_local = entity.local_index != INVALID_ID;
        let now_local = controller == local_peer;

        let migration = match (was_local, now_local) {
            (false, true) => Migration::Acquired {
                local_index: self.attach_local(key),
            },
            (true, false) => match self.detach_local(key) {
                Some(local_index) => Migration::Released { local_index },
                None => Migration::Passed,
            },
            _ if previous == controller => Migration::Unchanged,
            _ => Migration::Passed,
        };
        Ok(migration)
    }

    /// Remove an entity by tracked ID and recycle the ID
    pub fn remove(&mut self, tracked_id: TrackedId) -> Option<TrackedEntity<D>> {
        let key = self.key_of(tracked_id)?;
        self.tracked[tracked_id as usize] = None;
        self.detach_local(key);
        self.free_ids.insert(tracked_id);
        self.arena.remove(key)
    }

    /// Remove a pending (ID-less) entity
    pub fn remove_pending(&mut self, key: EntityKey) -> Option<TrackedEntity<D>> {
        if self.arena.get(key)?.tracked_id != INVALID_ID {
            return None;
        }
        self.detach_local(key);
        self.arena.remove(key)
    }

    fn attach_local(&mut self, key: EntityKey) -> usize {
        let index = self.local.len();
        self.local.push(key);
        if let Some(entity) = self.arena.get_mut(key) {
            entity.local_index = index as i32;
        }
        index
    }

    fn detach_local(&mut self, key: EntityKey) -> Option<usize> {
        let index = {
            let entity = self.arena.get_mut(key)?;
            let index = usize::try_from(entity.local_index).ok()?;
            entity.local_index = INVALID_ID;
            index
        };
        if index >= self.local.len() {
            return None;
        }
        self.local.swap_remove(index);
        if let Some(&moved) = self.local.get(index) {
            if let Some(entity) = self.arena.get_mut(moved) {
                entity.local_index = index as i32;
            }
        }
        Some(index)
    }

    /// Verify index bookkeeping against `local_peer`
    pub fn check_consistency(&self, local_peer: PeerId) -> Result<(), String> {
        for (index, key) in self.local.iter().enumerate() {
            let entity = self
                .arena
                .get(*key)
                .ok_or_else(|| format!("dense slot {} holds a stale key", index))?;
            if entity.local_index != index as i32 {
                return Err(format!(
                    "dense slot {} holds entity with local_index {}",
                    index, entity.local_index
                ));
            }
        }
        for (key, entity) in self.arena.iter() {
            let is_local = entity.local_index != INVALID_ID;
            if is_local != (entity.controller == local_peer) {
                return Err(format!(
                    "entity {} has local_index {} but controller {} (local peer {})",
                    entity.tracked_id, entity.local_index, entity.controller, local_peer
                ));
            }
            if is_local && self.local.get(entity.local_index as usize) != Some(&key) {
                return Err(format!(
                    "entity {} local_index {} points elsewhere",
                    entity.tracked_id, entity.local_index
                ));
            }
            if entity.tracked_id != INVALID_ID && self.key_of(entity.tracked_id) != Some(key) {
                return Err(format!("tracked slot {} does not point back", entity.tracked_id));
            }
        }
        for (index, slot) in self.tracked.iter().enumerate() {
            if let Some(key) = slot {
                match self.arena.get(*key) {
                    Some(entity) if entity.tracked_id == index as i32 => {}
                    _ => return Err(format!("tracked slot {} is dangling", index)),
                }
            }
        }
        Ok(())
    }
}
