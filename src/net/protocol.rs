//! Packet-ID space
//!
//! Server-bound and client-bound packets are numbered independently. IDs
//! 1..=15 are kind-independent; each entity kind owns a block of eight IDs
//! starting at 16 for its per-kind operations. IDs are positional and must
//! stay stable for the lifetime of a session: append, never renumber.

use crate::game::constants::packet::{KIND_BASE, KIND_STRIDE, TABLE_SIZE};
use crate::game::entity::EntityKind;

/// Transport channel a packet travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Length-prefixed stream, ordered per sender
    Reliable,
    /// Single datagram, no ordering
    Unreliable,
}

/// Which table a packet ID is numbered in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client-bound ([`ServerPacket`])
    ToClient,
    /// Server-bound ([`ClientPacket`])
    ToServer,
}

/// Client -> server packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ClientPacket {
    WelcomeReceived = 1,
    PlayerState = 2,
    PlayerScene = 3,
    PlayerInstance = 4,
    AddSyncScene = 5,
    DoneLoadingScene = 6,
    DoneSendingUpToDate = 7,
    PlayerDamage = 8,
    ItemParent = 9,
}

/// Server -> client packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ServerPacket {
    Welcome = 1,
    SpawnPlayer = 2,
    PlayerState = 3,
    PlayerScene = 4,
    PlayerInstance = 5,
    AddSyncScene = 6,
    RequestUpToDate = 7,
    RelevantObjectsSent = 8,
    PlayerLeft = 9,
    PlayerDamage = 10,
    ItemParent = 11,
}

/// Operations every entity kind supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KindOp {
    /// Spawn record (creation, allocation echo)
    Full = 0,
    /// Batch of delta records from the controller
    Updates = 1,
    /// Client asks to become controller (server-bound only)
    RequestControl = 2,
    /// Controller change
    GiveControl = 3,
    Destroy = 4,
    /// Snapshot batch for a joining peer
    UpToDate = 5,
    Damage = 6,
    /// Kind-specific event (weapon fire, configure, hit zone, sub-target)
    Event = 7,
}

impl KindOp {
    pub const ALL: [KindOp; 8] = [
        KindOp::Full,
        KindOp::Updates,
        KindOp::RequestControl,
        KindOp::GiveControl,
        KindOp::Destroy,
        KindOp::UpToDate,
        KindOp::Damage,
        KindOp::Event,
    ];

    /// Channel this operation is sent on
    #[inline]
    pub fn channel(self) -> Channel {
        match self {
            KindOp::Updates => Channel::Unreliable,
            _ => Channel::Reliable,
        }
    }
}

impl ClientPacket {
    #[inline]
    pub const fn id(self) -> i32 {
        self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Some(match id {
            1 => ClientPacket::WelcomeReceived,
            2 => ClientPacket::PlayerState,
            3 => ClientPacket::PlayerScene,
            4 => ClientPacket::PlayerInstance,
            5 => ClientPacket::AddSyncScene,
            6 => ClientPacket::DoneLoadingScene,
            7 => ClientPacket::DoneSendingUpToDate,
            8 => ClientPacket::PlayerDamage,
            9 => ClientPacket::ItemParent,
            _ => return None,
        })
    }

    #[inline]
    pub fn channel(self) -> Channel {
        match self {
            ClientPacket::PlayerState => Channel::Unreliable,
            _ => Channel::Reliable,
        }
    }
}

impl ServerPacket {
    #[inline]
    pub const fn id(self) -> i32 {
        self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Some(match id {
            1 => ServerPacket::Welcome,
            2 => ServerPacket::SpawnPlayer,
            3 => ServerPacket::PlayerState,
            4 => ServerPacket::PlayerScene,
            5 => ServerPacket::PlayerInstance,
            6 => ServerPacket::AddSyncScene,
            7 => ServerPacket::RequestUpToDate,
            8 => ServerPacket::RelevantObjectsSent,
            9 => ServerPacket::PlayerLeft,
            10 => ServerPacket::PlayerDamage,
            11 => ServerPacket::ItemParent,
            _ => return None,
        })
    }

    #[inline]
    pub fn channel(self) -> Channel {
        match self {
            ServerPacket::PlayerState => Channel::Unreliable,
            _ => Channel::Reliable,
        }
    }
}

/// Packet ID of a per-kind operation (same numbering in both directions)
#[inline]
pub const fn kind_packet_id(kind: EntityKind, op: KindOp) -> i32 {
    KIND_BASE + kind as i32 * KIND_STRIDE + op as i32
}

/// Inverse of [`kind_packet_id`]
pub fn split_kind_packet_id(id: i32) -> Option<(EntityKind, KindOp)> {
    if id < KIND_BASE {
        return None;
    }
    let offset = id - KIND_BASE;
    let kind = EntityKind::from_index(offset / KIND_STRIDE)?;
    let op = *KindOp::ALL.get((offset % KIND_STRIDE) as usize)?;
    Some((kind, op))
}

/// Channel a packet travels on, looked up from its ID
///
/// Unassigned IDs go reliably.
pub fn channel_for(direction: Direction, id: i32) -> Channel {
    if let Some((_, op)) = split_kind_packet_id(id) {
        return op.channel();
    }
    match direction {
        Direction::ToClient => ServerPacket::from_id(id).map_or(Channel::Reliable, ServerPacket::channel),
        Direction::ToServer => ClientPacket::from_id(id).map_or(Channel::Reliable, ClientPacket::channel),
    }
}

// Every assigned ID must fit the fixed dispatch table.
const _: () = assert!(
    (kind_packet_id(EntityKind::Encryption, KindOp::Event) as usize) < TABLE_SIZE
);
const _: () = assert!((ServerPacket::ItemParent as usize) < KIND_BASE as usize);
const _: () = assert!((ClientPacket::ItemParent as usize) < KIND_BASE as usize);
