//! Tracked entity records
//!
//! Every replicated object kind shares the same header (identity, authority,
//! pose) and carries a kind-specific payload implementing [`KindData`].
//! Records have two encodings: the full form sent on creation or resync, and
//! the compact delta form sent every tick by the controller.

use std::fmt;

use crate::game::authority::Authority;
use crate::game::constants::peer::{INVALID_ID, SERVER_ID};
use crate::game::registry::KindRegistry;
use crate::game::scene::Domain;
use crate::game::simulation::{LocalHandle, RemoteEvent};
use crate::game::world::World;
use crate::net::codec::{CodecError, Packet};
use crate::util::{Quat, Vec3};

/// Peer identifier; 0 is the server
pub type PeerId = i32;

/// Network-wide entity identifier, unique per kind among live entities
pub type TrackedId = i32;

/// Replicated entity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Item = 0,
    Sosig = 1,
    AutoMeater = 2,
    Encryption = 3,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Item,
        EntityKind::Sosig,
        EntityKind::AutoMeater,
        EntityKind::Encryption,
    ];

    #[inline]
    pub fn index(self) -> i32 {
        self as i32
    }

    pub fn from_index(index: i32) -> Option<Self> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Item => "item",
            EntityKind::Sosig => "sosig",
            EntityKind::AutoMeater => "auto_meater",
            EntityKind::Encryption => "encryption",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind-specific payload of a tracked entity
///
/// The payload is split into a *state* part, written in both record forms,
/// and a *spawn* part (immutable creation metadata) written only in the full
/// form. Decoding a delta leaves the spawn part at its default.
pub trait KindData: Clone + Default + fmt::Debug + PartialEq + 'static {
    const KIND: EntityKind;

    /// Kind-specific event relayed alongside state (weapon fire, configure, ...)
    type Event: Clone + fmt::Debug + PartialEq;

    fn write_state(&self, p: &mut Packet);
    fn read_state(&mut self, p: &mut Packet) -> Result<(), CodecError>;
    fn write_spawn(&self, p: &mut Packet);
    fn read_spawn(&mut self, p: &mut Packet) -> Result<(), CodecError>;

    /// Copy the state part of `update` into `self`
    fn merge_state(&mut self, update: &Self);

    fn write_event(event: &Self::Event, p: &mut Packet);
    fn read_event(p: &mut Packet) -> Result<Self::Event, CodecError>;

    /// Whether `event` can be folded in without outgrowing the state's wire form
    fn accepts_event(&self, _event: &Self::Event) -> bool {
        true
    }

    /// Fold an event into the replicated record
    fn apply_event(&mut self, event: &Self::Event);

    fn wrap_event(event: Self::Event) -> RemoteEvent;

    fn registry(world: &World) -> &KindRegistry<Self>;
    fn registry_mut(world: &mut World) -> &mut KindRegistry<Self>;
}

/// Returns true if `incoming` is ahead of `last` within half the u8 range
///
/// `order` wraps modulo 256, so 2 is newer than 250 while 130 is older than 5.
#[inline]
pub fn order_is_newer(incoming: u8, last: u8) -> bool {
    let diff = incoming.wrapping_sub(last);
    diff != 0 && diff < 128
}

/// A replicated entity of kind `D`
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity<D> {
    pub tracked_id: TrackedId,
    /// Index into the local dense array, or -1. On the wire (full form) this
    /// field carries the spawn request token instead.
    pub local_index: i32,
    pub controller: PeerId,
    pub parent: TrackedId,
    /// Sequence number of the last delta written by the controller
    pub order: u8,
    pub position: Vec3,
    pub rotation: Quat,
    pub active: bool,
    pub domain: Domain,
    pub data: D,
    /// Materialized instance in the local simulation, if any
    pub handle: Option<LocalHandle>,
    /// Order of the last applied delta; `None` until one is applied after a full record
    pub last_order: Option<u8>,
}

impl<D: KindData> TrackedEntity<D> {
    pub fn new(data: D, domain: Domain) -> Self {
        Self {
            tracked_id: INVALID_ID,
            local_index: INVALID_ID,
            controller: SERVER_ID,
            parent: INVALID_ID,
            order: 0,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            active: true,
            domain,
            data,
            handle: None,
            last_order: None,
        }
    }

    pub fn with_pose(mut self, position: Vec3, rotation: Quat) -> Self {
        self.position = position;
        self.rotation = rotation;
        self
    }

    #[inline]
    pub fn kind(&self) -> EntityKind {
        D::KIND
    }

    #[inline]
    pub fn authority(&self) -> Authority {
        Authority::from_controller(self.controller)
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.local_index != INVALID_ID
    }

    #[inline]
    pub fn is_materialized(&self) -> bool {
        self.handle.is_some()
    }

    /// Encode the record; `full` selects the spawn form over the delta form
    pub fn write(&self, p: &mut Packet, full: bool) {
        p.write_i32(self.tracked_id);
        p.write_vec3(self.position);
        p.write_quat(self.rotation);
        p.write_bool(self.active);
        self.data.write_state(p);
        if full {
            self.data.write_spawn(p);
            p.write_i32(self.controller);
            p.write_i32(self.parent);
            p.write_i32(self.local_index);
        } else {
            p.write_u8(self.order);
        }
    }

    /// Decode a record written by [`TrackedEntity::write`] with the same `full` flag
    ///
    /// The domain is left at its default; spawn records carry it separately.
    pub fn read(p: &mut Packet, full: bool) -> Result<Self, CodecError> {
        let mut entity = Self::new(D::default(), Domain::default());
        entity.tracked_id = p.read_i32()?;
        entity.position = p.read_vec3()?;
        entity.rotation = p.read_quat()?;
        entity.active = p.read_bool()?;
        entity.data.read_state(p)?;
        if full {
            entity.data.read_spawn(p)?;
            entity.controller = p.read_i32()?;
            entity.parent = p.read_i32()?;
            entity.local_index = p.read_i32()?;
        } else {
            entity.order = p.read_u8()?;
        }
        Ok(entity)
    }

    /// Full record followed by the entity's domain
    pub fn write_spawn_record(&self, p: &mut Packet) {
        self.write(p, true);
        self.domain.write(p);
    }

    pub fn read_spawn_record(p: &mut Packet) -> Result<Self, CodecError> {
        let mut entity = Self::read(p, true)?;
        entity.domain = Domain::read(p)?;
        Ok(entity)
    }

    /// Bump the outgoing sequence number before writing a delta
    #[inline]
    pub fn advance_order(&mut self) -> u8 {
        self.order = self.order.wrapping_add(1);
        self.order
    }

    /// Check an incoming delta's order against the last applied one
    pub fn is_fresh(&self, incoming: u8) -> bool {
        match self.last_order {
            None => true,
            Some(last) => order_is_newer(incoming, last),
        }
    }

    /// Apply a decoded delta if its order is newer; returns whether it was applied
    pub fn apply_update(&mut self, update: &Self) -> bool {
        if !self.is_fresh(update.order) {
            return false;
        }
        self.position = update.position;
        self.rotation = update.rotation;
        self.active = update.active;
        self.data.merge_state(&update.data);
        self.order = update.order;
        self.last_order = Some(update.order);
        true
    }

    /// Overwrite replicated fields from a full record, keeping local bookkeeping
    pub fn refresh_from(&mut self, record: Self) {
        self.position = record.position;
        self.rotation = record.rotation;
        self.active = record.active;
        self.parent = record.parent;
        self.domain = record.domain;
        self.data = record.data;
        self.last_order = None;
    }
}
