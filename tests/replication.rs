//! End-to-end replication through in-memory sessions

mod common;

use common::{item, village, Harness};

use tracked_sync::game::constants::peer::{INVALID_ID, SERVER_ID};
use tracked_sync::game::damage::Damage;
use tracked_sync::game::entity::{EntityKind, TrackedEntity};
use tracked_sync::game::kinds::ItemData;
use tracked_sync::game::scene::Domain;
use tracked_sync::game::simulation::DamageTarget;
use tracked_sync::net::client_session::ClientNotice;
use tracked_sync::net::messages;
use tracked_sync::util::Vec3;

fn assert_consistent(h: &Harness) {
    h.server.world().check_consistency().unwrap();
    for client in h.clients.values() {
        client.world().check_consistency().unwrap();
    }
}

#[test]
fn test_spawn_then_join_delivers_snapshot() {
    let mut h = Harness::new();
    // ID 0 goes to a server crate in another scene
    let crate_id = h
        .server
        .spawn(TrackedEntity::new(ItemData::default(), Domain::new("Arena", 0)))
        .unwrap();
    assert_eq!(crate_id, 0);
    h.pump();

    let a = h.connect("alice", village());
    assert!(h.client(a).is_ready());
    let handle = h.client(a).sim_mut().next_handle();
    let key = h.client(a).spawn_local(item("Magazine"), handle).unwrap();
    h.pump();

    assert_eq!(h.client(a).pending_spawns(), 0);
    assert_eq!(h.client(a).world().items.key_of(1), Some(key));
    assert_eq!(h.server.world().items.get(1).unwrap().controller, a);

    let b = h.connect("bob", Domain::new("MainMenu", 0));
    assert!(h.client(b).world().items.get(1).is_none());

    h.client(b).change_scene("Village").unwrap();
    h.pump();
    assert!(!h.client(b).is_ready());

    h.client(b).done_loading();
    h.pump();
    assert!(h.client(b).is_ready());
    assert!(h.client(b).take_notices().contains(&ClientNotice::Ready));

    let record = h.client(b).world().items.get(1).unwrap();
    assert_eq!(record.controller, a);
    assert_eq!(record.local_index, INVALID_ID);
    assert_eq!(record.data.item_id, "Magazine");
    assert!(record.is_materialized());
    assert_consistent(&h);
}

#[test]
fn test_control_request_migrates_dense_arrays() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", village());

    let first_handle = h.client(a).sim_mut().next_handle();
    let first_key = h.client(a).spawn_local(item("Knife"), first_handle).unwrap();
    let second_handle = h.client(a).sim_mut().next_handle();
    let second_key = h.client(a).spawn_local(item("Pistol"), second_handle).unwrap();
    h.pump();

    let first = h.client(a).world().items.entity(first_key).unwrap().tracked_id;
    let second = h.client(a).world().items.entity(second_key).unwrap().tracked_id;
    assert_eq!(h.client(a).world().items.get(second).unwrap().local_index, 1);

    // already the controller: nothing to ask
    h.client(a).request_control::<ItemData>(first).unwrap();
    assert!(h.client(a).take_outbound().is_empty());

    h.client(b).request_control::<ItemData>(first).unwrap();
    h.pump();

    assert_eq!(h.server.world().items.get(first).unwrap().controller, b);

    let on_a = h.client(a).world().items.get(first).unwrap();
    assert_eq!(on_a.controller, b);
    assert_eq!(on_a.local_index, INVALID_ID);
    // swap-remove moved the tail into the freed slot
    assert_eq!(h.client(a).world().items.get(second).unwrap().local_index, 0);
    assert_eq!(h.client(a).world().items.local_len(), 1);

    let on_b = h.client(b).world().items.get(first).unwrap();
    assert_eq!(on_b.controller, b);
    assert_eq!(on_b.local_index, 0);
    assert_consistent(&h);
}

#[test]
fn test_racing_requests_settle_on_first() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", village());
    let id = h.server.spawn(item("Grenade")).unwrap();
    h.pump();

    // both ask before either hears about the other
    h.client(a).request_control::<ItemData>(id).unwrap();
    h.client(b).request_control::<ItemData>(id).unwrap();
    h.pump();

    assert_eq!(h.server.world().items.get(id).unwrap().controller, a);
    assert_eq!(h.client(a).world().items.get(id).unwrap().controller, a);
    assert_eq!(h.client(b).world().items.get(id).unwrap().controller, a);
    assert_eq!(h.client(b).world().items.local_len(), 0);
    assert_consistent(&h);
}

#[test]
fn test_updates_stay_in_domain() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", village());
    let c = h.connect("carol", Domain::new("Arena", 0));

    let handle = h.client(a).sim_mut().next_handle();
    let key = h.client(a).spawn_local(item("Flare"), handle).unwrap();
    h.pump();
    let id = h.client(a).world().items.entity(key).unwrap().tracked_id;

    // carol holds the record but never materializes it
    assert!(!h.client(c).world().items.get(id).unwrap().is_materialized());

    let moved = Vec3::new(1.0, 2.0, 3.0);
    h.client(a).sim_mut().moves.insert(handle, moved);
    h.tick();

    assert_eq!(h.server.world().items.get(id).unwrap().position, moved);
    assert_eq!(h.client(b).world().items.get(id).unwrap().position, moved);
    assert_eq!(h.client(c).world().items.get(id).unwrap().position, Vec3::ZERO);
    assert_eq!(h.client(b).sim().applied_states, 1);
}

#[test]
fn test_damage_reaches_controller() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", village());

    let handle = h.client(a).sim_mut().next_handle();
    let key = h.client(a).spawn_local(item("Target"), handle).unwrap();
    h.pump();
    let id = h.client(a).world().items.entity(key).unwrap().tracked_id;

    let hit = Damage {
        blunt: 10.0,
        ..Damage::default()
    };
    h.client(b).damage_entity::<ItemData>(id, None, &hit).unwrap();
    h.pump();

    let received = &h.client(a).sim().damage;
    assert_eq!(received.len(), 1);
    assert!(matches!(
        received[0].0,
        DamageTarget::Entity {
            kind: EntityKind::Item,
            tracked_id,
            handle: Some(_),
            ..
        } if tracked_id == id
    ));
    assert!(h.client(b).sim().damage.is_empty());
}

#[test]
fn test_disconnect_hands_entities_to_server() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", village());

    let handle = h.client(a).sim_mut().next_handle();
    let key = h.client(a).spawn_local(item("Lamp"), handle).unwrap();
    h.pump();
    let id = h.client(a).world().items.entity(key).unwrap().tracked_id;
    h.client(b).take_notices();

    h.disconnect(a);

    assert_eq!(h.server.world().items.get(id).unwrap().controller, SERVER_ID);
    assert_eq!(h.client(b).world().items.get(id).unwrap().controller, SERVER_ID);
    assert!(!h.server.world().players.contains_key(&a));
    assert!(h.client(b).take_notices().contains(&ClientNotice::PlayerLeft(a)));
    assert_eq!(h.client(b).sim().left, vec![a]);
    assert_consistent(&h);
}

#[test]
fn test_scene_change_releases_control() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", village());

    let handle = h.client(a).sim_mut().next_handle();
    let key = h.client(a).spawn_local(item("Radio"), handle).unwrap();
    h.pump();
    let id = h.client(a).world().items.entity(key).unwrap().tracked_id;

    h.client(a).change_scene("Arena").unwrap();
    h.client(a).done_loading();
    h.pump();

    let on_a = h.client(a).world().items.get(id).unwrap();
    assert_eq!(on_a.controller, SERVER_ID);
    assert!(!on_a.is_materialized());
    assert_eq!(h.client(b).world().items.get(id).unwrap().controller, SERVER_ID);
    assert_eq!(
        h.server.world().players[&a].domain,
        Domain::new("Arena", 0)
    );
    assert_eq!(h.client(b).world().players[&a].domain, Domain::new("Arena", 0));
    assert!(h.client(a).is_ready());
    assert_consistent(&h);
}

#[test]
fn test_destroy_frees_id_everywhere() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", village());

    let handle = h.client(a).sim_mut().next_handle();
    let key = h.client(a).spawn_local(item("Bottle"), handle).unwrap();
    h.pump();
    let id = h.client(a).world().items.entity(key).unwrap().tracked_id;
    let live_on_b = h.client(b).sim().live;

    h.client(b).destroy_local::<ItemData>(id, true).unwrap();
    h.pump();

    assert!(h.server.world().items.get(id).is_none());
    assert!(h.client(a).world().items.get(id).is_none());
    assert!(h.client(b).world().items.get(id).is_none());
    assert_eq!(h.client(b).sim().live, live_on_b - 1);

    // the freed ID is handed out again
    let next = h.server.spawn(item("Cup")).unwrap();
    assert_eq!(next, id);
}

#[test]
fn test_players_see_each_other() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", Domain::new("Arena", 0));

    assert!(h.client(a).world().players.contains_key(&b));
    assert!(h.client(b).world().players.contains_key(&a));
    assert_eq!(h.client(b).world().players[&a].username, "alice");
    assert_eq!(h.client(a).sim().joined, vec![b]);
    assert_eq!(h.server.world().players.len(), 2);
}

#[test]
fn test_delta_before_spawn_is_dropped() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let id = h.server.spawn(item("Torch")).unwrap();

    let mut delta = h.server.world().items.get(id).unwrap().clone();
    delta.order = 1;
    delta.position = Vec3::new(4.0, 0.0, 0.0);
    let packet = messages::kind_updates(std::iter::once(&delta)).remove(0);

    // the delta overtakes the spawn still queued on the server
    h.client(a).handle_packet(packet.as_bytes().to_vec()).unwrap();
    assert!(h.client(a).world().items.get(id).is_none());
    assert_eq!(h.client(a).sim().applied_states, 0);

    h.pump();
    assert_eq!(h.client(a).world().items.get(id).unwrap().position, Vec3::ZERO);

    h.client(a).handle_packet(packet.into_bytes()).unwrap();
    assert_eq!(
        h.client(a).world().items.get(id).unwrap().position,
        Vec3::new(4.0, 0.0, 0.0)
    );
    assert_eq!(h.client(a).sim().applied_states, 1);
    assert_consistent(&h);
}

#[test]
fn test_stale_delta_for_reused_id_is_rejected() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", village());

    let handle = h.client(a).sim_mut().next_handle();
    let key = h.client(a).spawn_local(item("Bottle"), handle).unwrap();
    h.pump();
    let id = h.client(a).world().items.entity(key).unwrap().tracked_id;

    let mut stale = h.client(a).world().items.get(id).unwrap().clone();
    stale.order = stale.order.wrapping_add(1);
    stale.position = Vec3::new(9.0, 9.0, 9.0);
    let stale = messages::kind_updates(std::iter::once(&stale)).remove(0);

    h.client(a).destroy_local::<ItemData>(id, true).unwrap();
    h.pump();

    // freed: the delta addresses nothing
    h.server.handle_packet(a, stale.as_bytes().to_vec()).unwrap();
    assert!(h.server.world().items.get(id).is_none());
    assert!(h.server.take_outbound().is_empty());

    let reused = h.server.spawn(item("Cup")).unwrap();
    assert_eq!(reused, id);
    h.pump();

    // reused: alice no longer controls the ID
    h.server.handle_packet(a, stale.into_bytes()).unwrap();
    assert!(h.server.take_outbound().is_empty());
    let on_server = h.server.world().items.get(id).unwrap();
    assert_eq!(on_server.position, Vec3::ZERO);
    assert_eq!(on_server.controller, SERVER_ID);

    let on_b = h.client(b).world().items.get(id).unwrap();
    assert_eq!(on_b.data.item_id, "Cup");
    assert_eq!(on_b.position, Vec3::ZERO);
    assert_consistent(&h);
}

#[test]
fn test_denied_request_rolls_back_optimistic_migration() {
    let mut h = Harness::new();
    let a = h.connect("alice", village());
    let b = h.connect("bob", village());
    let id = h.server.spawn(item("Crowbar")).unwrap();
    h.pump();

    // alice's grant is broadcast but has not reached bob yet
    h.client(a).request_control::<ItemData>(id).unwrap();
    for out in h.client(a).take_outbound() {
        h.server.handle_packet(a, out.payload).unwrap();
    }
    let in_flight = h.server.take_outbound();

    h.client(b).request_control::<ItemData>(id).unwrap();
    assert_eq!(h.client(b).world().items.get(id).unwrap().controller, b);
    assert_eq!(h.client(b).world().items.local_len(), 1);

    for out in in_flight {
        for (peer, client) in h.clients.iter_mut() {
            if out.target.includes(*peer) {
                client.handle_packet(out.payload.clone()).unwrap();
            }
        }
    }
    h.pump();

    assert_eq!(h.server.world().items.get(id).unwrap().controller, a);
    let on_b = h.client(b).world().items.get(id).unwrap();
    assert_eq!(on_b.controller, a);
    assert_eq!(on_b.local_index, INVALID_ID);
    assert!(on_b.is_materialized());
    assert_eq!(h.client(b).world().items.local_len(), 0);
    assert_eq!(h.client(a).world().items.local_len(), 1);
    assert_consistent(&h);
}
