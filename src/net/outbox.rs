//! Outbound packet queue
//!
//! Handlers never touch sockets. They push packets here with a target; the
//! channel comes from the packet ID. The session loop drains the outbox once
//! per tick and hands it to the transport, which resolves targets against
//! live connections.

use smallvec::SmallVec;

use crate::game::entity::PeerId;
use crate::net::codec::Packet;
use crate::net::protocol::{channel_for, Channel, Direction};

/// Recipients of an outbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Peer(PeerId),
    /// Every connected peer
    All,
    /// Every connected peer except one
    AllExcept(PeerId),
    Peers(SmallVec<[PeerId; 8]>),
}

impl Target {
    /// Whether `peer` is a recipient, given the peers currently connected
    pub fn includes(&self, peer: PeerId) -> bool {
        match self {
            Target::Peer(p) => *p == peer,
            Target::All => true,
            Target::AllExcept(p) => *p != peer,
            Target::Peers(peers) => peers.contains(&peer),
        }
    }
}

/// One packet waiting to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub target: Target,
    pub channel: Channel,
    /// Unframed packet bytes, starting with the packet ID
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct Outbox {
    direction: Direction,
    queue: Vec<Outbound>,
}

impl Outbox {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            queue: Vec::new(),
        }
    }

    pub fn push(&mut self, target: Target, packet: Packet) {
        let channel = packet
            .packet_id()
            .map_or(Channel::Reliable, |id| channel_for(self.direction, id));
        self.queue.push(Outbound {
            target,
            channel,
            payload: packet.into_bytes(),
        });
    }

    /// Queue for a list of peers; nothing is queued for an empty list
    pub fn push_to(&mut self, peers: &[PeerId], packet: Packet) {
        match peers {
            [] => {}
            [peer] => self.push(Target::Peer(*peer), packet),
            _ => self.push(Target::Peers(peers.iter().copied().collect()), packet),
        }
    }

    pub fn drain(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::TrackedEntity;
    use crate::game::kinds::ItemData;
    use crate::game::player::PlayerTransform;
    use crate::game::scene::{Domain, SceneTable};
    use crate::net::messages;

    #[test]
    fn test_target_includes() {
        assert!(Target::All.includes(3));
        assert!(!Target::AllExcept(3).includes(3));
        assert!(Target::AllExcept(3).includes(4));
        assert!(Target::Peer(2).includes(2));
        assert!(Target::Peers(SmallVec::from_slice(&[1, 4])).includes(4));
        assert!(!Target::Peers(SmallVec::from_slice(&[1, 4])).includes(2));
    }

    #[test]
    fn test_push_to_collapses_targets() {
        let mut outbox = Outbox::new(Direction::ToClient);
        outbox.push_to(&[], Packet::with_id(1));
        outbox.push_to(&[2], Packet::with_id(1));
        outbox.push_to(&[2, 3], Packet::with_id(1));
        let sent = outbox.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].target, Target::Peer(2));
        assert_eq!(sent[1].target, Target::Peers(SmallVec::from_slice(&[2, 3])));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_channel_follows_packet_id() {
        let mut to_clients = Outbox::new(Direction::ToClient);
        to_clients.push(Target::All, messages::relay_player_state(1, &PlayerTransform::default()));
        to_clients.push(Target::All, messages::welcome(1, "hi", &SceneTable::default()));
        let entity = TrackedEntity::new(ItemData::default(), Domain::new("Village", 0));
        for packet in messages::kind_updates(std::iter::once(&entity)) {
            to_clients.push(Target::All, packet);
        }
        let channels: Vec<Channel> = to_clients.drain().iter().map(|o| o.channel).collect();
        assert_eq!(channels, vec![Channel::Unreliable, Channel::Reliable, Channel::Unreliable]);

        let mut to_server = Outbox::new(Direction::ToServer);
        to_server.push(Target::Peer(0), messages::player_state(&PlayerTransform::default()));
        to_server.push(Target::Peer(0), messages::player_scene(&Domain::new("Arena", 0)));
        to_server.push(Target::Peer(0), Packet::new());
        let channels: Vec<Channel> = to_server.drain().iter().map(|o| o.channel).collect();
        assert_eq!(channels, vec![Channel::Unreliable, Channel::Reliable, Channel::Reliable]);
    }
}
