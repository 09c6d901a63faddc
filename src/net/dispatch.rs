//! Fixed-size dispatch tables
//!
//! A table maps a packet ID (array index, not a hash lookup) to a handler
//! taking the session state, the sender and the packet positioned after its
//! ID. Slot 0 and unassigned IDs hold no handler; receiving one is a decode
//! error.

use crate::game::constants::packet::TABLE_SIZE;
use crate::game::entity::PeerId;
use crate::game::world::ProtocolError;
use crate::net::codec::{CodecError, Packet};

/// Failure inside a handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<crate::game::registry::RegistryError> for HandlerError {
    fn from(err: crate::game::registry::RegistryError) -> Self {
        HandlerError::Protocol(ProtocolError::Registry(err))
    }
}

/// Failure dispatching one packet; the packet is dropped either way
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),
    #[error("No {table} handler for packet ID {id}")]
    UnknownPacket { table: &'static str, id: i32 },
    #[error("Packet {id}: {source}")]
    Handler { id: i32, source: HandlerError },
}

impl DispatchError {
    /// Decode-class errors (malformed or unexpected packet) as opposed to
    /// protocol rejections of a well-formed packet
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            DispatchError::Decode(_)
                | DispatchError::UnknownPacket { .. }
                | DispatchError::Handler {
                    source: HandlerError::Codec(_),
                    ..
                }
        )
    }
}

pub type Handler<S> = fn(&mut S, PeerId, &mut Packet) -> Result<(), HandlerError>;

pub struct DispatchTable<S> {
    name: &'static str,
    handlers: [Option<Handler<S>>; TABLE_SIZE],
}

impl<S> DispatchTable<S> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: [None; TABLE_SIZE],
        }
    }

    /// Install `handler` at `id`
    ///
    /// IDs come from the packet enumerations, which are checked against the
    /// table size at compile time; an out-of-range ID here is ignored.
    pub fn set(&mut self, id: i32, handler: Handler<S>) {
        match usize::try_from(id).ok().and_then(|i| self.handlers.get_mut(i)) {
            Some(slot) => *slot = Some(handler),
            None => tracing::error!(table = self.name, id, "Packet ID outside dispatch table"),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_registered(&self, id: i32) -> bool {
        self.lookup(id).is_some()
    }

    fn lookup(&self, id: i32) -> Option<Handler<S>> {
        if id <= 0 {
            return None;
        }
        self.handlers.get(id as usize).copied().flatten()
    }

    /// Read the packet ID and run its handler; returns the ID handled
    pub fn dispatch(
        &self,
        state: &mut S,
        sender: PeerId,
        packet: &mut Packet,
    ) -> Result<i32, DispatchError> {
        let id = packet.read_i32()?;
        let handler = self.lookup(id).ok_or(DispatchError::UnknownPacket {
            table: self.name,
            id,
        })?;
        handler(state, sender, packet).map_err(|source| DispatchError::Handler { id, source })?;
        Ok(id)
    }
}
