//! Packet builders shared by both session roles
//!
//! Every outbound message is assembled here so the byte layout of a
//! message lives next to its siblings. Handlers decode inline, except for
//! record batches, which are decoded whole before any record is applied.

use crate::game::constants::net::UPDATE_BATCH_BYTES;
use crate::game::damage::Damage;
use crate::game::entity::{KindData, PeerId, TrackedEntity, TrackedId};
use crate::game::player::{BodyPart, Player, PlayerTransform};
use crate::game::scene::{Domain, SceneTable};
use crate::net::codec::{CodecError, Packet};
use crate::net::protocol::{kind_packet_id, ClientPacket, KindOp, ServerPacket};

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

pub fn welcome(peer: PeerId, greeting: &str, scenes: &SceneTable) -> Packet {
    let mut p = Packet::with_id(ServerPacket::Welcome.id());
    p.write_i32(peer);
    p.write_str(greeting);
    let custom: Vec<(&str, PeerId)> = scenes.custom().collect();
    let count = p.write_count_i16(custom.len());
    for (scene, owner) in custom.into_iter().take(count) {
        p.write_str(scene);
        p.write_i32(owner);
    }
    p
}

pub fn spawn_player(player: &Player) -> Packet {
    let mut p = Packet::with_id(ServerPacket::SpawnPlayer.id());
    player.write_spawn(&mut p);
    p
}

pub fn relay_player_state(id: PeerId, transform: &PlayerTransform) -> Packet {
    let mut p = Packet::with_id(ServerPacket::PlayerState.id());
    p.write_i32(id);
    transform.write(&mut p);
    p
}

pub fn relay_player_scene(id: PeerId, domain: &Domain) -> Packet {
    let mut p = Packet::with_id(ServerPacket::PlayerScene.id());
    p.write_i32(id);
    domain.write(&mut p);
    p
}

pub fn relay_player_instance(id: PeerId, instance: i32) -> Packet {
    let mut p = Packet::with_id(ServerPacket::PlayerInstance.id());
    p.write_i32(id);
    p.write_i32(instance);
    p
}

pub fn relay_add_sync_scene(owner: PeerId, scene: &str) -> Packet {
    let mut p = Packet::with_id(ServerPacket::AddSyncScene.id());
    p.write_i32(owner);
    p.write_str(scene);
    p
}

pub fn request_up_to_date(for_peer: PeerId) -> Packet {
    let mut p = Packet::with_id(ServerPacket::RequestUpToDate.id());
    p.write_i32(for_peer);
    p
}

pub fn relevant_objects_sent() -> Packet {
    Packet::with_id(ServerPacket::RelevantObjectsSent.id())
}

pub fn player_left(id: PeerId) -> Packet {
    let mut p = Packet::with_id(ServerPacket::PlayerLeft.id());
    p.write_i32(id);
    p
}

pub fn forward_player_damage(part: BodyPart, damage: &Damage) -> Packet {
    let mut p = Packet::with_id(ServerPacket::PlayerDamage.id());
    p.write_u8(part as u8);
    damage.write(&mut p);
    p
}

pub fn relay_item_parent(tracked_id: TrackedId, parent: TrackedId) -> Packet {
    let mut p = Packet::with_id(ServerPacket::ItemParent.id());
    p.write_i32(tracked_id);
    p.write_i32(parent);
    p
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

pub fn welcome_received(peer: PeerId, username: &str, domain: &Domain) -> Packet {
    let mut p = Packet::with_id(ClientPacket::WelcomeReceived.id());
    p.write_i32(peer);
    p.write_str(username);
    domain.write(&mut p);
    p
}

pub fn player_state(transform: &PlayerTransform) -> Packet {
    let mut p = Packet::with_id(ClientPacket::PlayerState.id());
    transform.write(&mut p);
    p
}

pub fn player_scene(domain: &Domain) -> Packet {
    let mut p = Packet::with_id(ClientPacket::PlayerScene.id());
    domain.write(&mut p);
    p
}

pub fn player_instance(instance: i32) -> Packet {
    let mut p = Packet::with_id(ClientPacket::PlayerInstance.id());
    p.write_i32(instance);
    p
}

pub fn add_sync_scene(scene: &str) -> Packet {
    let mut p = Packet::with_id(ClientPacket::AddSyncScene.id());
    p.write_str(scene);
    p
}

pub fn done_loading_scene() -> Packet {
    Packet::with_id(ClientPacket::DoneLoadingScene.id())
}

pub fn done_sending_up_to_date(for_peer: PeerId) -> Packet {
    let mut p = Packet::with_id(ClientPacket::DoneSendingUpToDate.id());
    p.write_i32(for_peer);
    p
}

pub fn player_damage(target: PeerId, part: BodyPart, damage: &Damage) -> Packet {
    let mut p = Packet::with_id(ClientPacket::PlayerDamage.id());
    p.write_i32(target);
    p.write_u8(part as u8);
    damage.write(&mut p);
    p
}

pub fn item_parent(tracked_id: TrackedId, parent: TrackedId) -> Packet {
    let mut p = Packet::with_id(ClientPacket::ItemParent.id());
    p.write_i32(tracked_id);
    p.write_i32(parent);
    p
}

// ---------------------------------------------------------------------------
// Per-kind operations (same IDs in both directions)
// ---------------------------------------------------------------------------

/// Spawn record with `wire_local_index` in place of the local index
///
/// Clients put their request token there; the server echoes it back to the
/// spawner and sends -1 to everybody else.
pub fn kind_spawn<D: KindData>(entity: &TrackedEntity<D>, wire_local_index: i32) -> Packet {
    let mut p = Packet::with_id(kind_packet_id(D::KIND, KindOp::Full));
    let mut record = entity.clone();
    record.local_index = wire_local_index;
    record.write_spawn_record(&mut p);
    p
}

/// Delta records, split into packets of roughly [`UPDATE_BATCH_BYTES`]
pub fn kind_updates<'a, D, I>(entities: I) -> Vec<Packet>
where
    D: KindData,
    I: IntoIterator<Item = &'a TrackedEntity<D>>,
{
    batch(
        entities,
        |body, entity| entity.write(body, false),
        |count| {
            let mut p = Packet::with_id(kind_packet_id(D::KIND, KindOp::Updates));
            p.write_i16(count);
            p
        },
    )
}

/// Snapshot batches; `for_peer` is present on the provider -> server leg
pub fn kind_up_to_date<'a, D, I>(entities: I, for_peer: Option<PeerId>) -> Vec<Packet>
where
    D: KindData,
    I: IntoIterator<Item = &'a TrackedEntity<D>>,
{
    batch(
        entities,
        |body, entity| entity.write_spawn_record(body),
        |count| {
            let mut p = Packet::with_id(kind_packet_id(D::KIND, KindOp::UpToDate));
            if let Some(peer) = for_peer {
                p.write_i32(peer);
            }
            p.write_i16(count);
            p
        },
    )
}

pub fn kind_request_control<D: KindData>(tracked_id: TrackedId, observed_controller: PeerId) -> Packet {
    let mut p = Packet::with_id(kind_packet_id(D::KIND, KindOp::RequestControl));
    p.write_i32(tracked_id);
    p.write_i32(observed_controller);
    p
}

pub fn kind_give_control<D: KindData>(tracked_id: TrackedId, controller: PeerId) -> Packet {
    let mut p = Packet::with_id(kind_packet_id(D::KIND, KindOp::GiveControl));
    p.write_i32(tracked_id);
    p.write_i32(controller);
    p
}

pub fn kind_destroy<D: KindData>(tracked_id: TrackedId, remove: bool) -> Packet {
    let mut p = Packet::with_id(kind_packet_id(D::KIND, KindOp::Destroy));
    p.write_i32(tracked_id);
    p.write_bool(remove);
    p
}

pub fn kind_damage<D: KindData>(tracked_id: TrackedId, sub_index: u8, damage: &Damage) -> Packet {
    let mut p = Packet::with_id(kind_packet_id(D::KIND, KindOp::Damage));
    p.write_i32(tracked_id);
    p.write_u8(sub_index);
    damage.write(&mut p);
    p
}

pub fn kind_event<D: KindData>(tracked_id: TrackedId, event: &D::Event) -> Packet {
    let mut p = Packet::with_id(kind_packet_id(D::KIND, KindOp::Event));
    p.write_i32(tracked_id);
    D::write_event(event, &mut p);
    p
}

/// Decode every record of a batch body (the part after any header)
///
/// `snapshot` selects the spawn-record form used by UpToDate batches. A
/// truncated record fails the whole batch.
pub fn read_batch<D: KindData>(p: &mut Packet, snapshot: bool) -> Result<Vec<TrackedEntity<D>>, CodecError> {
    let count = p.read_count_i16()?;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let record = if snapshot {
            TrackedEntity::read_spawn_record(p)?
        } else {
            TrackedEntity::read(p, false)?
        };
        records.push(record);
    }
    Ok(records)
}

/// Write records into bodies of at most `UPDATE_BATCH_BYTES` (a single
/// oversized record still gets its own packet) and prefix each with `header`
fn batch<'a, D, I, W, H>(entities: I, mut write: W, header: H) -> Vec<Packet>
where
    D: KindData,
    I: IntoIterator<Item = &'a TrackedEntity<D>>,
    W: FnMut(&mut Packet, &TrackedEntity<D>),
    H: Fn(i16) -> Packet,
{
    let mut packets = Vec::new();
    let mut body = Packet::new();
    let mut count: i16 = 0;

    for entity in entities {
        write(&mut body, entity);
        count += 1;
        if body.len() >= UPDATE_BATCH_BYTES || count == i16::MAX {
            let mut p = header(count);
            p.write_raw(body.as_bytes());
            packets.push(p);
            body = Packet::new();
            count = 0;
        }
    }
    if count > 0 {
        let mut p = header(count);
        p.write_raw(body.as_bytes());
        packets.push(p);
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::EntityKind;
    use crate::game::kinds::ItemData;

    fn item(id: TrackedId, state_len: usize) -> TrackedEntity<ItemData> {
        let mut entity = TrackedEntity::new(
            ItemData {
                item_id: "M1911".into(),
                state: vec![7; state_len],
            },
            Domain::new("Village", 0),
        );
        entity.tracked_id = id;
        entity
    }

    #[test]
    fn test_updates_single_batch() {
        let entities = vec![item(0, 4), item(1, 4), item(2, 4)];
        let packets = kind_updates(entities.iter());
        assert_eq!(packets.len(), 1);

        let mut p = Packet::from_bytes(packets[0].as_bytes().to_vec());
        assert_eq!(p.read_i32().unwrap(), kind_packet_id(EntityKind::Item, KindOp::Updates));
        assert_eq!(p.read_count_i16().unwrap(), 3);
        for expected in 0..3 {
            let record = TrackedEntity::<ItemData>::read(&mut p, false).unwrap();
            assert_eq!(record.tracked_id, expected);
        }
        assert_eq!(p.remaining(), 0);
    }

    #[test]
    fn test_updates_split_by_size() {
        let entities: Vec<_> = (0..10).map(|id| item(id, 1000)).collect();
        let packets = kind_updates(entities.iter());
        assert!(packets.len() > 1);

        let mut total = 0;
        for packet in &packets {
            let mut p = Packet::from_bytes(packet.as_bytes().to_vec());
            p.read_i32().unwrap();
            let n = p.read_count_i16().unwrap();
            for _ in 0..n {
                TrackedEntity::<ItemData>::read(&mut p, false).unwrap();
            }
            assert_eq!(p.remaining(), 0);
            total += n;
        }
        assert_eq!(total, 10);
    }

    #[test]
    fn test_empty_batch_produces_nothing() {
        let entities: Vec<TrackedEntity<ItemData>> = Vec::new();
        assert!(kind_updates(entities.iter()).is_empty());
        assert!(kind_up_to_date(entities.iter(), Some(3)).is_empty());
    }

    #[test]
    fn test_up_to_date_carries_for_peer() {
        let entities = vec![item(4, 2)];
        let packets = kind_up_to_date(entities.iter(), Some(9));
        let mut p = Packet::from_bytes(packets[0].as_bytes().to_vec());
        p.read_i32().unwrap();
        assert_eq!(p.read_i32().unwrap(), 9);
        assert_eq!(p.read_count_i16().unwrap(), 1);
        let record = TrackedEntity::<ItemData>::read_spawn_record(&mut p).unwrap();
        assert_eq!(record.tracked_id, 4);
        assert_eq!(record.domain, Domain::new("Village", 0));
    }

    #[test]
    fn test_spawn_replaces_local_index() {
        let mut entity = item(2, 0);
        entity.local_index = 5;
        let mut p = Packet::from_bytes(kind_spawn(&entity, 41).into_bytes());
        p.read_i32().unwrap();
        let record = TrackedEntity::<ItemData>::read_spawn_record(&mut p).unwrap();
        assert_eq!(record.local_index, 41);
    }

    #[test]
    fn test_welcome_lists_custom_scenes() {
        let mut scenes = SceneTable::with_builtin(["MainMenu"]);
        scenes.register("ModdedMap", 3);
        let mut p = Packet::from_bytes(welcome(2, "hi", &scenes).into_bytes());
        assert_eq!(p.read_i32().unwrap(), ServerPacket::Welcome.id());
        assert_eq!(p.read_i32().unwrap(), 2);
        assert_eq!(p.read_string().unwrap(), "hi");
        assert_eq!(p.read_count_i16().unwrap(), 1);
        assert_eq!(p.read_string().unwrap(), "ModdedMap");
        assert_eq!(p.read_i32().unwrap(), 3);
    }
}
