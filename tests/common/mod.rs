//! In-memory session harness: routes outboxes between one server and its clients

#![allow(dead_code)]

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use tracked_sync::game::damage::Damage;
use tracked_sync::game::entity::{KindData, PeerId, TrackedEntity};
use tracked_sync::game::kinds::ItemData;
use tracked_sync::game::scene::{Domain, SceneTable};
use tracked_sync::game::simulation::{DamageTarget, LocalHandle, Simulation};
use tracked_sync::net::client_session::ClientSession;
use tracked_sync::net::queue::InboundEvent;
use tracked_sync::net::server_session::ServerSession;
use tracked_sync::util::Vec3;

pub const SCENES: [&str; 3] = ["MainMenu", "Village", "Arena"];

/// Host simulation that records what the core asks of it
#[derive(Debug, Default)]
pub struct TestSim {
    next_handle: u64,
    pub live: usize,
    /// Position the next capture reports for a handle
    pub moves: FxHashMap<LocalHandle, Vec3>,
    pub applied_states: usize,
    pub damage: Vec<(DamageTarget, Damage)>,
    pub joined: Vec<PeerId>,
    pub left: Vec<PeerId>,
}

impl TestSim {
    pub fn next_handle(&mut self) -> LocalHandle {
        self.next_handle += 1;
        LocalHandle(self.next_handle)
    }
}

impl Simulation for TestSim {
    fn spawn<D: KindData>(&mut self, _entity: &TrackedEntity<D>) -> Option<LocalHandle> {
        self.live += 1;
        Some(self.next_handle())
    }

    fn apply_state<D: KindData>(&mut self, _handle: LocalHandle, _entity: &TrackedEntity<D>) {
        self.applied_states += 1;
    }

    fn capture_state<D: KindData>(&mut self, handle: LocalHandle, entity: &mut TrackedEntity<D>) -> bool {
        match self.moves.remove(&handle) {
            Some(position) => {
                entity.position = position;
                true
            }
            None => false,
        }
    }

    fn destroy(&mut self, _handle: LocalHandle) {
        self.live = self.live.saturating_sub(1);
    }

    fn apply_damage(&mut self, target: DamageTarget, damage: &Damage) {
        self.damage.push((target, damage.clone()));
    }

    fn player_joined(&mut self, id: PeerId, _username: &str) {
        self.joined.push(id);
    }

    fn player_left(&mut self, id: PeerId) {
        self.left.push(id);
    }
}

pub fn scenes() -> SceneTable {
    SceneTable::with_builtin(SCENES)
}

pub fn village() -> Domain {
    Domain::new("Village", 0)
}

pub fn item(item_id: &str) -> TrackedEntity<ItemData> {
    TrackedEntity::new(
        ItemData {
            item_id: item_id.to_string(),
            state: vec![1, 2, 3],
        },
        village(),
    )
}

/// One server and its clients, connected by direct packet hand-off
pub struct Harness {
    pub server: ServerSession<TestSim>,
    pub clients: BTreeMap<PeerId, ClientSession<TestSim>>,
    next_peer: PeerId,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            server: ServerSession::new(scenes(), "welcome", TestSim::default()),
            clients: BTreeMap::new(),
            next_peer: 1,
        }
    }

    /// Connect a client already standing in `domain` and run the handshake
    pub fn connect(&mut self, username: &str, domain: Domain) -> PeerId {
        let peer = self.next_peer;
        self.next_peer += 1;
        let client = ClientSession::new(username, domain, scenes(), TestSim::default());
        self.clients.insert(peer, client);
        self.server.handle_event(InboundEvent::Connected {
            peer,
            addr: "127.0.0.1:40000".parse().unwrap(),
        });
        self.pump();
        peer
    }

    /// Drop a client as if its stream closed
    pub fn disconnect(&mut self, peer: PeerId) {
        self.clients.remove(&peer);
        self.server.handle_event(InboundEvent::Disconnected {
            peer,
            reason: "closed".to_string(),
        });
        self.pump();
    }

    pub fn client(&mut self, peer: PeerId) -> &mut ClientSession<TestSim> {
        self.clients.get_mut(&peer).expect("unknown client")
    }

    /// Deliver packets until nobody has anything left to send
    pub fn pump(&mut self) {
        for _ in 0..64 {
            let mut moved = false;

            for out in self.server.take_outbound() {
                moved = true;
                for (peer, client) in self.clients.iter_mut() {
                    if out.target.includes(*peer) {
                        let _ = client.handle_packet(out.payload.clone());
                    }
                }
            }

            let peers: Vec<PeerId> = self.clients.keys().copied().collect();
            for peer in peers {
                let outbound = self.client(peer).take_outbound();
                for out in outbound {
                    moved = true;
                    let _ = self.server.handle_packet(peer, out.payload);
                }
            }

            if !moved {
                return;
            }
        }
        panic!("traffic did not settle");
    }

    /// Tick every session once, then deliver
    pub fn tick(&mut self) {
        self.server.tick();
        for client in self.clients.values_mut() {
            client.tick();
        }
        self.pump();
    }
}
