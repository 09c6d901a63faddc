//! Handlers for client-bound packets

use tracing::{debug, info, trace};

use crate::game::constants::peer::SERVER_ID;
use crate::game::damage::Damage;
use crate::game::entity::{KindData, PeerId, TrackedEntity};
use crate::game::kinds::{AutoMeaterData, EncryptionData, ItemData, SosigData};
use crate::game::player::{BodyPart, Player, PlayerTransform};
use crate::game::scene::Domain;
use crate::game::simulation::{DamageTarget, Simulation};
use crate::game::world::ProtocolError;
use crate::net::client_session::{ClientNotice, ClientSession};
use crate::net::codec::Packet;
use crate::net::dispatch::{DispatchTable, HandlerError};
use crate::net::messages;
use crate::net::outbox::Target;
use crate::net::protocol::{kind_packet_id, KindOp, ServerPacket};

type Result = std::result::Result<(), HandlerError>;

/// Dispatch table for packets a client receives
///
/// `RequestControl` is server-bound only and has no slot here.
pub fn client_table<S: Simulation>() -> DispatchTable<ClientSession<S>> {
    let mut table = DispatchTable::new("client");
    table.set(ServerPacket::Welcome.id(), welcome::<S>);
    table.set(ServerPacket::SpawnPlayer.id(), spawn_player::<S>);
    table.set(ServerPacket::PlayerState.id(), player_state::<S>);
    table.set(ServerPacket::PlayerScene.id(), player_scene::<S>);
    table.set(ServerPacket::PlayerInstance.id(), player_instance::<S>);
    table.set(ServerPacket::AddSyncScene.id(), add_sync_scene::<S>);
    table.set(ServerPacket::RequestUpToDate.id(), request_up_to_date::<S>);
    table.set(ServerPacket::RelevantObjectsSent.id(), relevant_objects_sent::<S>);
    table.set(ServerPacket::PlayerLeft.id(), player_left::<S>);
    table.set(ServerPacket::PlayerDamage.id(), player_damage::<S>);
    table.set(ServerPacket::ItemParent.id(), item_parent::<S>);
    register_kind::<S, ItemData>(&mut table);
    register_kind::<S, SosigData>(&mut table);
    register_kind::<S, AutoMeaterData>(&mut table);
    register_kind::<S, EncryptionData>(&mut table);
    table
}

fn register_kind<S: Simulation, D: KindData>(table: &mut DispatchTable<ClientSession<S>>) {
    table.set(kind_packet_id(D::KIND, KindOp::Full), tracked_full::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::Updates), tracked_updates::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::GiveControl), give_control::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::Destroy), destroy::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::UpToDate), up_to_date::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::Damage), damage::<S, D>);
    table.set(kind_packet_id(D::KIND, KindOp::Event), event::<S, D>);
}

fn to_server<S: Simulation>(s: &mut ClientSession<S>, packet: Packet) {
    s.outbox.push(Target::Peer(SERVER_ID), packet);
}

fn welcome<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let peer = p.read_i32()?;
    let greeting = p.read_string()?;
    let count = p.read_count_i16()?;
    for _ in 0..count {
        let scene = p.read_string()?;
        let owner = p.read_i32()?;
        s.world.scenes.register(&scene, owner);
    }

    s.world.set_local_peer(peer);
    s.welcomed = true;
    info!(peer, %greeting, "Welcomed by server");

    let domain = s.world.domain().cloned().unwrap_or_default();
    let reply = messages::welcome_received(peer, &s.username, &domain);
    to_server(s, reply);
    if !s.loading {
        to_server(s, messages::done_loading_scene());
    }
    s.notices.push(ClientNotice::Welcomed { peer, greeting });
    Ok(())
}

fn spawn_player<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let player = Player::read_spawn(p)?;
    if player.id == s.world.local_peer() {
        return Ok(());
    }
    debug!(peer = player.id, username = %player.username, domain = %player.domain, "Player spawned");
    s.sim.player_joined(player.id, &player.username);
    s.notices.push(ClientNotice::PlayerJoined(player.id));
    s.world.players.insert(player.id, player);
    Ok(())
}

fn player_state<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let id = p.read_i32()?;
    let transform = PlayerTransform::read(p)?;
    let player = s.world.players.get_mut(&id).ok_or(ProtocolError::UnknownPeer(id))?;
    player.transform = transform;
    if s.world.is_relevant(&s.world.players[&id].domain) {
        s.sim.player_moved(id, &s.world.players[&id].transform);
    }
    Ok(())
}

fn player_scene<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let id = p.read_i32()?;
    let domain = Domain::read(p)?;
    let player = s.world.players.get_mut(&id).ok_or(ProtocolError::UnknownPeer(id))?;
    player.domain = domain;
    Ok(())
}

fn player_instance<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let id = p.read_i32()?;
    let instance = p.read_i32()?;
    let player = s.world.players.get_mut(&id).ok_or(ProtocolError::UnknownPeer(id))?;
    player.domain.instance = instance;
    Ok(())
}

fn add_sync_scene<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let owner = p.read_i32()?;
    let scene = p.read_string()?;
    s.world.scenes.register(&scene, owner);
    Ok(())
}

fn request_up_to_date<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let for_peer = p.read_i32()?;
    debug!(for_peer, "Sending snapshot of controlled entities");
    s.send_up_to_date(for_peer);
    Ok(())
}

fn relevant_objects_sent<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, _p: &mut Packet) -> Result {
    s.ready = true;
    info!(domain = ?s.world.domain(), "Domain ready");
    s.notices.push(ClientNotice::Ready);
    Ok(())
}

fn player_left<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let id = p.read_i32()?;
    if s.world.players.remove(&id).is_some() {
        s.sim.player_left(id);
        s.notices.push(ClientNotice::PlayerLeft(id));
    }
    Ok(())
}

fn player_damage<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let part = BodyPart::from_u8(p.read_u8()?)?;
    let damage = Damage::read(p)?;
    s.sim.apply_damage(DamageTarget::LocalPlayer(part), &damage);
    Ok(())
}

fn item_parent<S: Simulation>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let parent = p.read_i32()?;
    s.world.set_parent(&mut s.sim, tracked_id, parent)?;
    Ok(())
}

/// Spawn announcement, or the echo of one of our own pending spawns
fn tracked_full<S: Simulation, D: KindData>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let record = TrackedEntity::<D>::read_spawn_record(p)?;
    let token = record.local_index;
    if record.controller == s.world.local_peer() && token >= 0 {
        let key = s
            .pending
            .remove(&(D::KIND, token))
            .ok_or(ProtocolError::UnknownRequest { kind: D::KIND, token })?;
        let tracked_id = record.tracked_id;
        s.world.registry_mut::<D>().assign_id(key, tracked_id)?;
        debug!(kind = %D::KIND, token, tracked_id, "Spawn acknowledged");
        s.notices.push(ClientNotice::Spawned {
            kind: D::KIND,
            key,
            tracked_id,
        });
        // we left the spawn's domain while waiting; the server takes it over
        if !s.world.is_relevant(&record.domain) {
            s.world.give_control::<D, S>(&mut s.sim, tracked_id, SERVER_ID)?;
            to_server(s, messages::kind_give_control::<D>(tracked_id, SERVER_ID));
            debug!(kind = %D::KIND, tracked_id, "Released spawn from a domain we left");
        }
        return Ok(());
    }
    s.world.upsert::<D, S>(&mut s.sim, record)?;
    Ok(())
}

fn tracked_updates<S: Simulation, D: KindData>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    for update in messages::read_batch::<D>(p, false)? {
        match s.world.apply_update::<D, S>(&mut s.sim, &update, None) {
            Ok(true) => {}
            Ok(false) => trace!(kind = %D::KIND, tracked_id = update.tracked_id, order = update.order, "Stale update"),
            // unreliable updates may overtake the spawn they refer to
            Err(e) => trace!(kind = %D::KIND, error = %e, "Update dropped"),
        }
    }
    Ok(())
}

fn give_control<S: Simulation, D: KindData>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let controller = p.read_i32()?;
    let migration = s.world.give_control::<D, S>(&mut s.sim, tracked_id, controller)?;
    trace!(kind = %D::KIND, tracked_id, controller, ?migration, "Control changed");
    Ok(())
}

fn destroy<S: Simulation, D: KindData>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let remove = p.read_bool()?;
    s.world.destroy::<D, S>(&mut s.sim, tracked_id, remove)?;
    Ok(())
}

fn up_to_date<S: Simulation, D: KindData>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    for record in messages::read_batch::<D>(p, true)? {
        let tracked_id = record.tracked_id;
        if let Err(e) = s.world.upsert::<D, S>(&mut s.sim, record) {
            debug!(kind = %D::KIND, tracked_id, error = %e, "Snapshot record rejected");
        }
    }
    Ok(())
}

/// Damage routed to us because we simulate the entity
fn damage<S: Simulation, D: KindData>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let sub_index = p.read_u8()?;
    let damage = Damage::read(p)?;
    let local = s.world.local_peer();
    let entity = s.world.get::<D>(tracked_id)?;
    if entity.controller != local {
        return Err(ProtocolError::NotController {
            kind: D::KIND,
            tracked_id,
            peer: local,
            controller: entity.controller,
        }
        .into());
    }
    let target = DamageTarget::Entity {
        kind: D::KIND,
        tracked_id,
        handle: entity.handle,
        sub_index,
    };
    s.sim.apply_damage(target, &damage);
    Ok(())
}

fn event<S: Simulation, D: KindData>(s: &mut ClientSession<S>, _: PeerId, p: &mut Packet) -> Result {
    let tracked_id = p.read_i32()?;
    let event = D::read_event(p)?;
    s.world.apply_event::<D, S>(&mut s.sim, tracked_id, &event)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::constants::peer::INVALID_ID;
    use crate::game::entity::EntityKind;
    use crate::game::scene::SceneTable;
    use crate::game::simulation::{HeadlessSimulation, LocalHandle};
    use crate::net::protocol::ClientPacket;

    type Client = ClientSession<HeadlessSimulation>;

    fn client() -> Client {
        ClientSession::new(
            "bob",
            Domain::new("Village", 0),
            SceneTable::with_builtin(["MainMenu", "Village"]),
            HeadlessSimulation::new(),
        )
    }

    fn welcome_packet(peer: PeerId) -> Vec<u8> {
        let mut scenes = SceneTable::with_builtin(["MainMenu"]);
        scenes.register("ModdedMap", 4);
        messages::welcome(peer, "hi", &scenes).into_bytes()
    }

    fn item(id: i32, controller: PeerId, domain: Domain) -> TrackedEntity<ItemData> {
        let mut entity = TrackedEntity::new(
            ItemData {
                item_id: "Magazine".into(),
                state: vec![1],
            },
            domain,
        );
        entity.tracked_id = id;
        entity.controller = controller;
        entity
    }

    #[test]
    fn test_welcome_sets_identity_and_replies() {
        let mut c = client();
        c.handle_packet(welcome_packet(3)).unwrap();
        assert_eq!(c.peer_id(), 3);
        assert!(c.is_welcomed());
        assert!(c.world().scenes.is_synchronized("ModdedMap"));

        let out = c.take_outbound();
        let ids: Vec<i32> = out
            .iter()
            .map(|o| Packet::from_bytes(o.payload.clone()).read_i32().unwrap())
            .collect();
        assert_eq!(
            ids,
            vec![ClientPacket::WelcomeReceived.id(), ClientPacket::DoneLoadingScene.id()]
        );
        assert_eq!(
            c.take_notices(),
            vec![ClientNotice::Welcomed {
                peer: 3,
                greeting: "hi".into()
            }]
        );
    }

    #[test]
    fn test_spawn_echo_reconciles_pending() {
        let mut c = client();
        c.handle_packet(welcome_packet(2)).unwrap();
        let key = c
            .spawn_local(item(INVALID_ID, 2, Domain::new("Village", 0)), LocalHandle(5))
            .unwrap();

        let echo = messages::kind_spawn(&item(7, 2, Domain::new("Village", 0)), 0);
        c.handle_packet(echo.into_bytes()).unwrap();

        assert_eq!(c.pending_spawns(), 0);
        assert_eq!(c.world().items.key_of(7), Some(key));
        assert_eq!(c.world().items.entity(key).unwrap().handle, Some(LocalHandle(5)));
        assert!(c.take_notices().contains(&ClientNotice::Spawned {
            kind: EntityKind::Item,
            key,
            tracked_id: 7
        }));
    }

    #[test]
    fn test_echo_after_domain_change_releases_spawn() {
        let mut c = client();
        c.handle_packet(welcome_packet(2)).unwrap();
        let key = c
            .spawn_local(item(INVALID_ID, 2, Domain::new("Village", 0)), LocalHandle(5))
            .unwrap();
        c.change_scene("MainMenu").unwrap();
        assert_eq!(c.pending_spawns(), 1);
        c.take_outbound();

        let echo = messages::kind_spawn(&item(7, 2, Domain::new("Village", 0)), 0);
        c.handle_packet(echo.into_bytes()).unwrap();

        assert_eq!(c.pending_spawns(), 0);
        let entity = c.world().items.entity(key).unwrap();
        assert_eq!(entity.tracked_id, 7);
        assert_eq!(entity.controller, SERVER_ID);
        assert!(!entity.is_materialized());
        assert_eq!(c.world().items.local_len(), 0);

        let out = c.take_outbound();
        assert_eq!(out.len(), 1);
        let mut p = Packet::from_bytes(out[0].payload.clone());
        assert_eq!(p.read_i32().unwrap(), kind_packet_id(EntityKind::Item, KindOp::GiveControl));
        assert_eq!((p.read_i32().unwrap(), p.read_i32().unwrap()), (7, SERVER_ID));
    }

    #[test]
    fn test_echo_for_unknown_token_rejected() {
        let mut c = client();
        c.handle_packet(welcome_packet(2)).unwrap();
        let echo = messages::kind_spawn(&item(7, 2, Domain::new("Village", 0)), 12);
        assert!(c.handle_packet(echo.into_bytes()).is_err());
        assert!(c.world().items.is_empty());
    }

    #[test]
    fn test_remote_spawn_materialized_by_domain() {
        let mut c = client();
        c.handle_packet(welcome_packet(2)).unwrap();

        let here = messages::kind_spawn(&item(0, 1, Domain::new("Village", 0)), -1);
        let elsewhere = messages::kind_spawn(&item(1, 1, Domain::new("Arena", 0)), -1);
        c.handle_packet(here.into_bytes()).unwrap();
        c.handle_packet(elsewhere.into_bytes()).unwrap();

        assert!(c.world().get::<ItemData>(0).unwrap().is_materialized());
        assert!(!c.world().get::<ItemData>(1).unwrap().is_materialized());
        assert_eq!(c.sim().live(), 1);
    }

    #[test]
    fn test_snapshot_request_answers_with_owned() {
        let mut c = client();
        c.handle_packet(welcome_packet(2)).unwrap();
        c.handle_packet(messages::kind_spawn(&item(0, 2, Domain::new("Village", 0)), -1).into_bytes())
            .unwrap();
        c.handle_packet(messages::kind_spawn(&item(1, SERVER_ID, Domain::new("Village", 0)), -1).into_bytes())
            .unwrap();
        c.take_outbound();

        c.handle_packet(messages::request_up_to_date(5).into_bytes()).unwrap();
        let out = c.take_outbound();
        assert_eq!(out.len(), 2);

        let mut batch = Packet::from_bytes(out[0].payload.clone());
        assert_eq!(batch.read_i32().unwrap(), kind_packet_id(EntityKind::Item, KindOp::UpToDate));
        assert_eq!(batch.read_i32().unwrap(), 5);
        assert_eq!(batch.read_count_i16().unwrap(), 1);
        let record = TrackedEntity::<ItemData>::read_spawn_record(&mut batch).unwrap();
        assert_eq!(record.tracked_id, 0);

        let mut done = Packet::from_bytes(out[1].payload.clone());
        assert_eq!(done.read_i32().unwrap(), ClientPacket::DoneSendingUpToDate.id());
        assert_eq!(done.read_i32().unwrap(), 5);
    }

    #[test]
    fn test_damage_for_uncontrolled_entity_rejected() {
        let mut c = client();
        c.handle_packet(welcome_packet(2)).unwrap();
        c.handle_packet(messages::kind_spawn(&item(0, 1, Domain::new("Village", 0)), -1).into_bytes())
            .unwrap();
        let packet = messages::kind_damage::<ItemData>(0, 0xFF, &Damage::default());
        assert!(c.handle_packet(packet.into_bytes()).is_err());
    }

    #[test]
    fn test_request_control_not_in_client_table() {
        let table = client_table::<HeadlessSimulation>();
        assert!(!table.is_registered(kind_packet_id(EntityKind::Sosig, KindOp::RequestControl)));
        assert!(table.is_registered(kind_packet_id(EntityKind::Sosig, KindOp::GiveControl)));
    }
}
