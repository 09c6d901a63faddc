//! Handlers for server-bound packets
//!
//! Each handler reads its body from the packet (positioned after the ID),
//! validates it against the sender, updates the server world and queues
//! whatever the other peers need to hear.

use tracing::{debug, info, trace};

use crate::game::authority::{decide_request, ControlDecision};
use crate::game::constants::peer::SERVER_ID;
use crate::game::damage::Damage;
use crate::game::entity::{KindData, PeerId, TrackedEntity};
use crate::game::kinds::{AutoMeaterData, EncryptionData, ItemData, SosigData};
use crate::game::player::{BodyPart, Player, PlayerTransform};
use crate::game::scene::Domain;
use crate::game::simulation::{DamageTarget, Simulation};
use crate::game::world::ProtocolError;
use crate::net::codec::Packet;
use crate::net::dispatch::{DispatchTable, HandlerError};
use crate::net::messages;
use crate::net::outbox::Target;
use crate::net::protocol::{kind_packet_id, ClientPacket, KindOp};
use crate::net::server_session::ServerSession;

type Result = std::result::Result<(), HandlerError>;

/// Dispatch table for packets a server receives
pub fn server_table<S: Simulation>() -> DispatchTable<ServerSession<S>> {
    let mut table = DispatchTable::new("server");
    table.set(ClientPacket::WelcomeReceived.id(), welcome_received::<S>);
    table.set(ClientPacket::PlayerState.id(), player_state::<S>);
    table.set(ClientPacket::PlayerScene.id(), player_scene::<S>);
    table.set(ClientPacket::PlayerInstance.id(), player_instance::<S>);
    table.set(ClientPacket::AddSyncScene.id(), add_sync_scene::<S>);
    table.set(ClientPacket::DoneLoadingScene.id(), done_loading_scene::<S>);
    table.set(ClientPacket::DoneSendingUpToDate.id(), done_sending_up_to_date::<S>);
    table.set(ClientPacket::PlayerDamage.id(), player_damage::<S>);
    table.set(ClientPacket::ItemParent.id(), item_parent::<S>);
    register_kind::<S, ItemData>(&mut table);
    register_kind::<S, SosigData>(&mut table);
    register_kind::<S, AutoMeaterData>(&mut table);
    register_kind::<S, EncryptionData>(&mut table);
    table
}

fn register_kind<S: Simulation, D: KindData>(table: &mut DispatchTable<ServerSession<S>>) {
    table.set(kind_packet_id(D::KIND, KindOp::Full), tracked_full::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::Updates), tracked_updates::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::RequestControl), request_control::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::GiveControl), give_control::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::Destroy), destroy::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::UpToDate), up_to_date::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::Damage), damage::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::Event), event::<S, D>);
}

fn known_player<S: Simulation>(s: &ServerSession<S>, peer: PeerId) -> std::result::Result<(), ProtocolError> {
    if s.world.players.contains_key(&peer) {
        Ok(())
    } else {
        Err(ProtocolError::UnknownPeer(peer))
    }
}

// ---------------------------------------------------------------------------
// Session and players
// ---------------------------------------------------------------------------

fn welcome_received<S: Simulation>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let echoed = p.read_i32()?;
    if echoed != peer {
        return Err(ProtocolError::PeerMismatch {
            expected: peer,
            got: echoed,
        }
        .into());
    }
    let username = p.read_string()?;
    let domain = Domain::read(p)?;
    let player = Player::new(peer, username, domain);
    info!(peer, username = %player.username, domain = %player.domain, "Player joined");

    let mut existing: Vec<&Player> = s.world.players.values().collect();
    existing.sort_unstable_by_key(|other| other.id);
    let roster: Vec<Packet> = existing.into_iter().map(messages::spawn_player).collect();
    for packet in roster {
        s.outbox.push(Target::Peer(peer), packet);
    }
    s.outbox.push(Target::AllExcept(peer), messages::spawn_player(&player));

    s.sim.player_joined(peer, &player.username);
    s.world.players.insert(peer, player);
    s.begin_join(peer);
    Ok(())
}

fn player_state<S: Simulation>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let transform = PlayerTransform::read(p)?;
    let player = s
        .world
        .players
        .get_mut(&peer)
        .ok_or(ProtocolError::UnknownPeer(peer))?;
    player.transform = transform;
    let domain = player.domain.clone();
    s.sim.player_moved(peer, &s.world.players[&peer].transform);

    let peers = s.world.peers_in(&domain, peer);
    if !peers.is_empty() {
        let packet = messages::relay_player_state(peer, &s.world.players[&peer].transform);
        s.outbox.push_to(&peers, packet);
    }
    Ok(())
}

fn player_scene<S: Simulation>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let domain = Domain::read(p)?;
    if !s.world.scenes.is_synchronized(&domain.scene) {
        return Err(ProtocolError::UnsyncedScene(domain.scene).into());
    }
    let player = s
        .world
        .players
        .get_mut(&peer)
        .ok_or(ProtocolError::UnknownPeer(peer))?;
    player.domain = domain.clone();
    info!(peer, %domain, "Player changed scene");
    s.outbox.push(Target::AllExcept(peer), messages::relay_player_scene(peer, &domain));
    s.begin_join(peer);
    Ok(())
}

fn player_instance<S: Simulation>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let instance = p.read_i32()?;
    let player = s
        .world
        .players
        .get_mut(&peer)
        .ok_or(ProtocolError::UnknownPeer(peer))?;
    player.domain.instance = instance;
    info!(peer, domain = %player.domain, "Player changed instance");
    s.outbox.push(Target::AllExcept(peer), messages::relay_player_instance(peer, instance));
    s.begin_join(peer);
    Ok(())
}

fn add_sync_scene<S: Simulation>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let scene = p.read_string()?;
    if s.world.scenes.register(&scene, peer) {
        info!(peer, %scene, "Scene added to synchronization");
        s.outbox.push(Target::AllExcept(peer), messages::relay_add_sync_scene(peer, &scene));
    }
    Ok(())
}

fn done_loading_scene<S: Simulation>(s: &mut ServerSession<S>, peer: PeerId, _p: &mut Packet) -> Result {
    known_player(s, peer)?;
    if s.joins.done_loading(peer) {
        s.send_relevant_objects(peer);
    }
    Ok(())
}

fn done_sending_up_to_date<S: Simulation>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let for_peer = p.read_i32()?;
    if s.joins.snapshot_done(peer, for_peer) {
        s.send_relevant_objects(for_peer);
    }
    Ok(())
}

fn player_damage<S: Simulation>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let target = p.read_i32()?;
    let part = BodyPart::from_u8(p.read_u8()?)?;
    let damage = Damage::read(p)?;
    if target == SERVER_ID {
        s.sim.apply_damage(DamageTarget::LocalPlayer(part), &damage);
        return Ok(());
    }
    known_player(s, target)?;
    debug!(peer, target, ?part, "Forwarding player damage");
    s.outbox.push(Target::Peer(target), messages::forward_player_damage(part, &damage));
    Ok(())
}

fn item_parent<S: Simulation>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let parent = p.read_i32()?;
    s.world.set_parent(&mut s.sim, tracked_id, parent)?;
    s.outbox.push(Target::AllExcept(peer), messages::relay_item_parent(tracked_id, parent));
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-kind operations
// ---------------------------------------------------------------------------

/// Client spawn: allocate an ID, echo the record (with the request token) to
/// the spawner and announce it to everybody else
fn tracked_full<S: Simulation, D: KindData>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let mut record = TrackedEntity::<D>::read_spawn_record(p)?;
    known_player(s, peer)?;
    let token = record.local_index;
    let id = s.world.registry_mut::<D>().allocate();
    record.tracked_id = id;
    record.controller = peer;
    s.world.upsert::<D, S>(&mut s.sim, record)?;
    debug!(peer, kind = %D::KIND, tracked_id = id, token, "Allocated tracked ID");

    let entity = s.world.get::<D>(id)?;
    let echo = messages::kind_spawn(entity, token);
    let announce = messages::kind_spawn(entity, -1);
    s.outbox.push(Target::Peer(peer), echo);
    s.outbox.push(Target::AllExcept(peer), announce);
    Ok(())
}

/// Controller deltas: apply the fresh ones and relay them to the domain
fn tracked_updates<S: Simulation, D: KindData>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let updates = messages::read_batch::<D>(p, false)?;
    let mut accepted = Vec::with_capacity(updates.len());
    for update in updates {
        match s.world.apply_update::<D, S>(&mut s.sim, &update, Some(peer)) {
            Ok(true) => accepted.push(update.tracked_id),
            Ok(false) => {
                s.count(|m| &m.stale_updates);
                trace!(peer, kind = %D::KIND, tracked_id = update.tracked_id, order = update.order, "Stale update");
            }
            Err(e) => {
                s.count(|m| &m.protocol_errors);
                debug!(peer, kind = %D::KIND, error = %e, "Update rejected");
            }
        }
    }
    s.send_updates::<D>(peer, &accepted);
    Ok(())
}

/// Arbitrate a control request against the controller the requester observed
fn request_control<S: Simulation, D: KindData>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let observed = p.read_i32()?;
    let current = s.world.get::<D>(tracked_id)?.controller;
    match decide_request(current, peer, observed) {
        ControlDecision::AlreadyOwner => {
            trace!(peer, kind = %D::KIND, tracked_id, "Requester already controls entity");
        }
        ControlDecision::Granted { previous } => {
            s.world.give_control::<D, S>(&mut s.sim, tracked_id, peer)?;
            debug!(peer, kind = %D::KIND, tracked_id, previous, "Control granted");
            s.outbox.push(Target::All, messages::kind_give_control::<D>(tracked_id, peer));
        }
        ControlDecision::Denied { current } => {
            debug!(peer, kind = %D::KIND, tracked_id, current, "Control request lost a race");
            s.outbox.push(
                Target::Peer(peer),
                messages::kind_give_control::<D>(tracked_id, current),
            );
        }
    }
    Ok(())
}

/// The controller hands the entity to another peer (or back to the server)
fn give_control<S: Simulation, D: KindData>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let controller = p.read_i32()?;
    let current = s.world.get::<D>(tracked_id)?.controller;
    if current != peer {
        return Err(ProtocolError::NotController {
            kind: D::KIND,
            tracked_id,
            peer,
            controller: current,
        }
        .into());
    }
    if controller != SERVER_ID {
        known_player(s, controller)?;
    }
    s.world.give_control::<D, S>(&mut s.sim, tracked_id, controller)?;
    s.outbox.push(
        Target::AllExcept(peer),
        messages::kind_give_control::<D>(tracked_id, controller),
    );
    Ok(())
}

fn destroy<S: Simulation, D: KindData>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let remove = p.read_bool()?;
    s.world.destroy::<D, S>(&mut s.sim, tracked_id, remove)?;
    debug!(peer, kind = %D::KIND, tracked_id, remove, "Entity destroyed");
    s.outbox.push(Target::AllExcept(peer), messages::kind_destroy::<D>(tracked_id, remove));
    Ok(())
}

/// Provider snapshot for a joiner: refresh the records the provider controls
fn up_to_date<S: Simulation, D: KindData>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let for_peer = p.read_i32()?;
    for mut record in messages::read_batch::<D>(p, true)? {
        let owned = s
            .world
            .registry::<D>()
            .get(record.tracked_id)
            .map(|entity| entity.controller == peer)
            .unwrap_or(false);
        if !owned {
            debug!(peer, for_peer, kind = %D::KIND, tracked_id = record.tracked_id, "Snapshot record not controlled by provider");
            continue;
        }
        record.controller = peer;
        let tracked_id = record.tracked_id;
        if let Err(e) = s.world.upsert::<D, S>(&mut s.sim, record) {
            s.count(|m| &m.protocol_errors);
            debug!(peer, for_peer, kind = %D::KIND, tracked_id, error = %e, "Snapshot record rejected");
        }
    }
    Ok(())
}

/// Damage goes to whoever simulates the entity
fn damage<S: Simulation, D: KindData>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let sub_index = p.read_u8()?;
    let damage = Damage::read(p)?;
    let entity = s.world.get::<D>(tracked_id)?;
    let (controller, handle) = (entity.controller, entity.handle);
    if controller == SERVER_ID {
        s.sim.apply_damage(
            DamageTarget::Entity {
                kind: D::KIND,
                tracked_id,
                handle,
                sub_index,
            },
            &damage,
        );
    } else if controller != peer {
        s.outbox.push(
            Target::Peer(controller),
            messages::kind_damage::<D>(tracked_id, sub_index, &damage),
        );
    }
    Ok(())
}

fn event<S: Simulation, D: KindData>(s: &mut ServerSession<S>, peer: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let event = D::read_event(p)?;
    s.world.apply_event::<D, S>(&mut s.sim, tracked_id, &event)?;
    let domain = s.world.get::<D>(tracked_id)?.domain.clone();
    let peers = s.world.peers_in(&domain, peer);
    if !peers.is_empty() {
        s.outbox.push_to(&peers, messages::kind_event::<D>(tracked_id, &event));
    }
    Ok(())
}
