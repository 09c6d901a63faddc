//! Boundary between the replication core and the host simulation
//!
//! The core never touches physics, AI or rendering directly. It calls the
//! host through [`Simulation`] to materialize, drive and freeze local
//! instances, and the host reports local events back through the session's
//! local API.

use crate::game::damage::Damage;
use crate::game::entity::{EntityKind, KindData, PeerId, TrackedEntity, TrackedId};
use crate::game::kinds::{HitZoneState, ItemEvent, SosigEvent, SubTargetEvent};
use crate::game::player::{BodyPart, PlayerTransform};

/// Opaque handle to a materialized instance in the host simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalHandle(pub u64);

/// A kind event received from another peer
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Item(ItemEvent),
    Sosig(SosigEvent),
    AutoMeater(HitZoneState),
    Encryption(SubTargetEvent),
}

/// What a damage packet hits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageTarget {
    Entity {
        kind: EntityKind,
        tracked_id: TrackedId,
        handle: Option<LocalHandle>,
        sub_index: u8,
    },
    /// The local player's body
    LocalPlayer(BodyPart),
}

/// Host simulation collaborator
///
/// Every method except `spawn` has a no-op default so hosts only implement
/// what they simulate.
pub trait Simulation {
    /// Instantiate a replicated entity; `None` if the host cannot create it
    fn spawn<D: KindData>(&mut self, entity: &TrackedEntity<D>) -> Option<LocalHandle>;

    /// Push replicated state into a local instance
    fn apply_state<D: KindData>(&mut self, _handle: LocalHandle, _entity: &TrackedEntity<D>) {}

    /// Refresh the record from the local instance; returns true if anything changed
    fn capture_state<D: KindData>(&mut self, _handle: LocalHandle, _entity: &mut TrackedEntity<D>) -> bool {
        false
    }

    fn destroy(&mut self, _handle: LocalHandle) {}

    /// Unfreeze (`true`) or freeze into kinematic replicated state (`false`)
    fn set_simulated(&mut self, _handle: LocalHandle, _simulated: bool) {}

    fn apply_event(&mut self, _handle: LocalHandle, _event: &RemoteEvent) {}

    fn apply_damage(&mut self, _target: DamageTarget, _damage: &Damage) {}

    fn player_joined(&mut self, _id: PeerId, _username: &str) {}

    fn player_left(&mut self, _id: PeerId) {}

    fn player_moved(&mut self, _id: PeerId, _transform: &PlayerTransform) {}
}

/// Simulation for a process that replicates but renders nothing
///
/// Hands out handles for entities in its domain and otherwise does nothing;
/// used by the dedicated server.
#[derive(Debug, Default)]
pub struct HeadlessSimulation {
    next_handle: u64,
    live: usize,
}

impl HeadlessSimulation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances currently materialized
    pub fn live(&self) -> usize {
        self.live
    }
}

impl Simulation for HeadlessSimulation {
    fn spawn<D: KindData>(&mut self, _entity: &TrackedEntity<D>) -> Option<LocalHandle> {
        self.next_handle += 1;
        self.live += 1;
        Some(LocalHandle(self.next_handle))
    }

    fn destroy(&mut self, _handle: LocalHandle) {
        self.live = self.live.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::kinds::ItemData;
    use crate::game::scene::Domain;

    #[test]
    fn test_headless_handles_are_unique() {
        let mut sim = HeadlessSimulation::new();
        let entity = TrackedEntity::new(ItemData::default(), Domain::new("Village", 0));
        let a = sim.spawn(&entity).unwrap();
        let b = sim.spawn(&entity).unwrap();
        assert_ne!(a, b);
        assert_eq!(sim.live(), 2);
        sim.destroy(a);
        assert_eq!(sim.live(), 1);
    }
}
