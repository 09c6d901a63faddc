//! Payloads of the four replicated entity kinds
//!
//! - Item: opaque state blob plus the item's catalogue ID
//! - Sosig: humanoid AI; per-link state, ammo stores, config template, wearables
//! - AutoMeater: autonomous drone; hit-zone state
//! - Encryption: objective; sub-target activity bitset

use bitvec::prelude::*;

use crate::game::entity::{EntityKind, KindData};
use crate::game::registry::KindRegistry;
use crate::game::simulation::RemoteEvent;
use crate::game::world::World;
use crate::net::codec::{CodecError, Packet};
use crate::util::Vec3;

// ============================================================================
// Item
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemData {
    /// Catalogue ID used by the host to instantiate the item (spawn)
    pub item_id: String,
    /// Opaque host-defined state, replicated every update
    pub state: Vec<u8>,
}

/// One projectile of a weapon discharge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shot {
    pub origin: Vec3,
    pub direction: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
    WeaponFire { shots: Vec<Shot> },
}

impl KindData for ItemData {
    const KIND: EntityKind = EntityKind::Item;
    type Event = ItemEvent;

    fn write_state(&self, p: &mut Packet) {
        p.write_blob(&self.state);
    }

    fn read_state(&mut self, p: &mut Packet) -> Result<(), CodecError> {
        self.state = p.read_blob()?;
        Ok(())
    }

    fn write_spawn(&self, p: &mut Packet) {
        p.write_str(&self.item_id);
    }

    fn read_spawn(&mut self, p: &mut Packet) -> Result<(), CodecError> {
        self.item_id = p.read_string()?;
        Ok(())
    }

    fn merge_state(&mut self, update: &Self) {
        self.state.clone_from(&update.state);
    }

    fn write_event(event: &ItemEvent, p: &mut Packet) {
        match event {
            ItemEvent::WeaponFire { shots } => {
                let count = p.write_count_u8(shots.len());
                for shot in shots.iter().take(count) {
                    p.write_vec3(shot.origin);
                    p.write_vec3(shot.direction);
                }
            }
        }
    }

    fn read_event(p: &mut Packet) -> Result<ItemEvent, CodecError> {
        let count = p.read_u8()? as usize;
        let mut shots = Vec::with_capacity(count);
        for _ in 0..count {
            shots.push(Shot {
                origin: p.read_vec3()?,
                direction: p.read_vec3()?,
            });
        }
        Ok(ItemEvent::WeaponFire { shots })
    }

    fn apply_event(&mut self, _event: &ItemEvent) {}

    fn wrap_event(event: ItemEvent) -> RemoteEvent {
        RemoteEvent::Item(event)
    }

    fn registry(world: &World) -> &KindRegistry<Self> {
        &world.items
    }

    fn registry_mut(world: &mut World) -> &mut KindRegistry<Self> {
        &mut world.items
    }
}

// ============================================================================
// Sosig
// ============================================================================

/// Configuration template applied to a sosig at spawn or on reconfigure
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SosigConfig {
    pub applies_damage_resist_to_integrity_loss: bool,
    pub drops_weapons_on_ballistic: bool,
    pub total_mustard: f32,
    pub bleed_damage_mult: f32,
    pub bleed_rate_mult: f32,
    pub shudder_threshold: f32,
    pub confusion_threshold: f32,
    pub stun_threshold: f32,
    pub has_a_brain: bool,
    pub can_be_knocked_out: bool,
    pub view_distance: f32,
    pub hearing_distance: f32,
    pub max_fov: f32,
    pub state_sight_range_mults: Vec3,
    pub crawl_speed: f32,
    pub sneak_speed: f32,
    pub walk_speed: f32,
    pub run_speed: f32,
    pub turn_speed: f32,
    /// projectile, explosive, melee, piercing, blunt, cutting, thermal, chilling, emp
    pub damage_mults: [f32; 9],
    pub can_be_grabbed: bool,
    pub can_be_severed: bool,
    pub can_be_stabbed: bool,
    pub link_damage_mults: Vec<f32>,
    pub target_capacity: i32,
}

impl SosigConfig {
    pub fn write(&self, p: &mut Packet) {
        p.write_bool(self.applies_damage_resist_to_integrity_loss);
        p.write_bool(self.drops_weapons_on_ballistic);
        p.write_f32(self.total_mustard);
        p.write_f32(self.bleed_damage_mult);
        p.write_f32(self.bleed_rate_mult);
        p.write_f32(self.shudder_threshold);
        p.write_f32(self.confusion_threshold);
        p.write_f32(self.stun_threshold);
        p.write_bool(self.has_a_brain);
        p.write_bool(self.can_be_knocked_out);
        p.write_f32(self.view_distance);
        p.write_f32(self.hearing_distance);
        p.write_f32(self.max_fov);
        p.write_vec3(self.state_sight_range_mults);
        p.write_f32(self.crawl_speed);
        p.write_f32(self.sneak_speed);
        p.write_f32(self.walk_speed);
        p.write_f32(self.run_speed);
        p.write_f32(self.turn_speed);
        for mult in self.damage_mults {
            p.write_f32(mult);
        }
        p.write_bool(self.can_be_grabbed);
        p.write_bool(self.can_be_severed);
        p.write_bool(self.can_be_stabbed);
        let count = p.write_count_u8(self.link_damage_mults.len());
        for mult in self.link_damage_mults.iter().take(count) {
            p.write_f32(*mult);
        }
        p.write_i32(self.target_capacity);
    }

    pub fn read(p: &mut Packet) -> Result<Self, CodecError> {
        let mut config = SosigConfig {
            applies_damage_resist_to_integrity_loss: p.read_bool()?,
            drops_weapons_on_ballistic: p.read_bool()?,
            total_mustard: p.read_f32()?,
            bleed_damage_mult: p.read_f32()?,
            bleed_rate_mult: p.read_f32()?,
            shudder_threshold: p.read_f32()?,
            confusion_threshold: p.read_f32()?,
            stun_threshold: p.read_f32()?,
            has_a_brain: p.read_bool()?,
            can_be_knocked_out: p.read_bool()?,
            view_distance: p.read_f32()?,
            hearing_distance: p.read_f32()?,
            max_fov: p.read_f32()?,
            state_sight_range_mults: p.read_vec3()?,
            crawl_speed: p.read_f32()?,
            sneak_speed: p.read_f32()?,
            walk_speed: p.read_f32()?,
            run_speed: p.read_f32()?,
            turn_speed: p.read_f32()?,
            ..Default::default()
        };
        for mult in config.damage_mults.iter_mut() {
            *mult = p.read_f32()?;
        }
        config.can_be_grabbed = p.read_bool()?;
        config.can_be_severed = p.read_bool()?;
        config.can_be_stabbed = p.read_bool()?;
        let count = p.read_u8()? as usize;
        config.link_damage_mults = Vec::with_capacity(count);
        for _ in 0..count {
            config.link_damage_mults.push(p.read_f32()?);
        }
        config.target_capacity = p.read_i32()?;
        Ok(config)
    }
}

/// Per-link state: integrity, bleed, stagger, and two host-defined channels
pub type LinkState = [f32; 5];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SosigData {
    // spawn
    pub iff: u8,
    pub config: SosigConfig,
    /// Wearable IDs per link
    pub wearables: Vec<Vec<String>>,
    // state
    pub mustard: f32,
    pub ammo: Vec<i32>,
    pub links: Vec<LinkState>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SosigEvent {
    SetIff(u8),
    Configure(Box<SosigConfig>),
}

const SOSIG_EVENT_IFF: u8 = 0;
const SOSIG_EVENT_CONFIGURE: u8 = 1;

impl KindData for SosigData {
    const KIND: EntityKind = EntityKind::Sosig;
    type Event = SosigEvent;

    fn write_state(&self, p: &mut Packet) {
        p.write_f32(self.mustard);
        let count = p.write_count_u8(self.ammo.len());
        for ammo in self.ammo.iter().take(count) {
            p.write_i32(*ammo);
        }
        let count = p.write_count_u8(self.links.len());
        for link in self.links.iter().take(count) {
            for value in link {
                p.write_f32(*value);
            }
        }
    }

    fn read_state(&mut self, p: &mut Packet) -> Result<(), CodecError> {
        self.mustard = p.read_f32()?;
        let count = p.read_u8()? as usize;
        self.ammo.clear();
        for _ in 0..count {
            self.ammo.push(p.read_i32()?);
        }
        let count = p.read_u8()? as usize;
        self.links.clear();
        for _ in 0..count {
            let mut link = [0.0; 5];
            for value in link.iter_mut() {
                *value = p.read_f32()?;
            }
            self.links.push(link);
        }
        Ok(())
    }

    fn write_spawn(&self, p: &mut Packet) {
        p.write_u8(self.iff);
        self.config.write(p);
        let links = p.write_count_u8(self.wearables.len());
        for wearables in self.wearables.iter().take(links) {
            let count = p.write_count_u8(wearables.len());
            for id in wearables.iter().take(count) {
                p.write_str(id);
            }
        }
    }

    fn read_spawn(&mut self, p: &mut Packet) -> Result<(), CodecError> {
        self.iff = p.read_u8()?;
        self.config = SosigConfig::read(p)?;
        let links = p.read_u8()? as usize;
        self.wearables = Vec::with_capacity(links);
        for _ in 0..links {
            let count = p.read_u8()? as usize;
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(p.read_string()?);
            }
            self.wearables.push(ids);
        }
        Ok(())
    }

    fn merge_state(&mut self, update: &Self) {
        self.mustard = update.mustard;
        self.ammo.clone_from(&update.ammo);
        self.links.clone_from(&update.links);
    }

    fn write_event(event: &SosigEvent, p: &mut Packet) {
        match event {
            SosigEvent::SetIff(iff) => {
                p.write_u8(SOSIG_EVENT_IFF);
                p.write_u8(*iff);
            }
            SosigEvent::Configure(config) => {
                p.write_u8(SOSIG_EVENT_CONFIGURE);
                config.write(p);
            }
        }
    }

    fn read_event(p: &mut Packet) -> Result<SosigEvent, CodecError> {
        match p.read_u8()? {
            SOSIG_EVENT_IFF => Ok(SosigEvent::SetIff(p.read_u8()?)),
            SOSIG_EVENT_CONFIGURE => Ok(SosigEvent::Configure(Box::new(SosigConfig::read(p)?))),
            tag => Err(CodecError::InvalidTag {
                what: "sosig event",
                tag,
            }),
        }
    }

    fn apply_event(&mut self, event: &SosigEvent) {
        match event {
            SosigEvent::SetIff(iff) => self.iff = *iff,
            SosigEvent::Configure(config) => self.config = (**config).clone(),
        }
    }

    fn wrap_event(event: SosigEvent) -> RemoteEvent {
        RemoteEvent::Sosig(event)
    }

    fn registry(world: &World) -> &KindRegistry<Self> {
        &world.sosigs
    }

    fn registry_mut(world: &mut World) -> &mut KindRegistry<Self> {
        &mut world.sosigs
    }
}

// ============================================================================
// AutoMeater
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HitZoneState {
    pub zone: u8,
    pub armor: f32,
    pub life: f32,
    pub destroyed: bool,
}

impl HitZoneState {
    fn write(&self, p: &mut Packet) {
        p.write_u8(self.zone);
        p.write_f32(self.armor);
        p.write_f32(self.life);
        p.write_bool(self.destroyed);
    }

    fn read(p: &mut Packet) -> Result<Self, CodecError> {
        Ok(Self {
            zone: p.read_u8()?,
            armor: p.read_f32()?,
            life: p.read_f32()?,
            destroyed: p.read_bool()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoMeaterData {
    // spawn
    pub template_id: String,
    pub iff: u8,
    // state
    pub hit_zones: Vec<HitZoneState>,
}

impl KindData for AutoMeaterData {
    const KIND: EntityKind = EntityKind::AutoMeater;
    type Event = HitZoneState;

    fn write_state(&self, p: &mut Packet) {
        let count = p.write_count_u8(self.hit_zones.len());
        for zone in self.hit_zones.iter().take(count) {
            zone.write(p);
        }
    }

    fn read_state(&mut self, p: &mut Packet) -> Result<(), CodecError> {
        let count = p.read_u8()? as usize;
        self.hit_zones.clear();
        for _ in 0..count {
            self.hit_zones.push(HitZoneState::read(p)?);
        }
        Ok(())
    }

    fn write_spawn(&self, p: &mut Packet) {
        p.write_str(&self.template_id);
        p.write_u8(self.iff);
    }

    fn read_spawn(&mut self, p: &mut Packet) -> Result<(), CodecError> {
        self.template_id = p.read_string()?;
        self.iff = p.read_u8()?;
        Ok(())
    }

    fn merge_state(&mut self, update: &Self) {
        self.hit_zones.clone_from(&update.hit_zones);
    }

    fn write_event(event: &HitZoneState, p: &mut Packet) {
        event.write(p);
    }

    fn read_event(p: &mut Packet) -> Result<HitZoneState, CodecError> {
        HitZoneState::read(p)
    }

    fn accepts_event(&self, event: &HitZoneState) -> bool {
        self.hit_zones.len() < u8::MAX as usize || self.hit_zones.iter().any(|z| z.zone == event.zone)
    }

    fn apply_event(&mut self, event: &HitZoneState) {
        match self.hit_zones.iter().position(|z| z.zone == event.zone) {
            Some(i) => self.hit_zones[i] = *event,
            None if self.accepts_event(event) => self.hit_zones.push(*event),
            None => {}
        }
    }

    fn wrap_event(event: HitZoneState) -> RemoteEvent {
        RemoteEvent::AutoMeater(event)
    }

    fn registry(world: &World) -> &KindRegistry<Self> {
        &world.auto_meaters
    }

    fn registry_mut(world: &mut World) -> &mut KindRegistry<Self> {
        &mut world.auto_meaters
    }
}

// ============================================================================
// Encryption
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncryptionData {
    // spawn
    pub encryption_type: u8,
    // state
    pub sub_targets: BitVec<u8, Lsb0>,
}

/// Sub-target count limit; the state carries the bit count as an i16
pub const MAX_SUB_TARGETS: usize = i16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubTargetEvent {
    pub index: i32,
    pub active: bool,
}

impl KindData for EncryptionData {
    const KIND: EntityKind = EntityKind::Encryption;
    type Event = SubTargetEvent;

    fn write_state(&self, p: &mut Packet) {
        let count = p.write_count_i16(self.sub_targets.len());
        let bytes = count.div_ceil(8);
        p.write_raw(&self.sub_targets.as_raw_slice()[..bytes]);
    }

    fn read_state(&mut self, p: &mut Packet) -> Result<(), CodecError> {
        let count = p.read_count_i16()?;
        let bytes = p.read_raw(count.div_ceil(8))?;
        let mut bits = BitVec::<u8, Lsb0>::from_vec(bytes);
        bits.truncate(count);
        self.sub_targets = bits;
        Ok(())
    }

    fn write_spawn(&self, p: &mut Packet) {
        p.write_u8(self.encryption_type);
    }

    fn read_spawn(&mut self, p: &mut Packet) -> Result<(), CodecError> {
        self.encryption_type = p.read_u8()?;
        Ok(())
    }

    fn merge_state(&mut self, update: &Self) {
        self.sub_targets.clone_from(&update.sub_targets);
    }

    fn write_event(event: &SubTargetEvent, p: &mut Packet) {
        p.write_i32(event.index);
        p.write_bool(event.active);
    }

    fn read_event(p: &mut Packet) -> Result<SubTargetEvent, CodecError> {
        Ok(SubTargetEvent {
            index: p.read_i32()?,
            active: p.read_bool()?,
        })
    }

    fn accepts_event(&self, event: &SubTargetEvent) -> bool {
        usize::try_from(event.index).is_ok_and(|index| index < MAX_SUB_TARGETS)
    }

    fn apply_event(&mut self, event: &SubTargetEvent) {
        let Ok(index) = usize::try_from(event.index) else {
            return;
        };
        if index >= MAX_SUB_TARGETS {
            return;
        }
        if index >= self.sub_targets.len() {
            self.sub_targets.resize(index + 1, false);
        }
        self.sub_targets.set(index, event.active);
    }

    fn wrap_event(event: SubTargetEvent) -> RemoteEvent {
        RemoteEvent::Encryption(event)
    }

    fn registry(world: &World) -> &KindRegistry<Self> {
        &world.encryptions
    }

    fn registry_mut(world: &mut World) -> &mut KindRegistry<Self> {
        &mut world.encryptions
    }
}
