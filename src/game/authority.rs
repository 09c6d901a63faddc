//! Authority states and control-request arbitration
//!
//! Exactly one peer simulates an entity at a time. The server serializes
//! competing requests: a request carries the controller the requester last
//! observed, and is granted only if that still matches. Losers are corrected
//! by a `GiveControl` naming the actual controller.

use crate::game::constants::peer::SERVER_ID;
use crate::game::entity::PeerId;

/// Who currently simulates an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    ServerOwned,
    ClientOwned(PeerId),
}

impl Authority {
    #[inline]
    pub fn from_controller(controller: PeerId) -> Self {
        if controller == SERVER_ID {
            Authority::ServerOwned
        } else {
            Authority::ClientOwned(controller)
        }
    }

    #[inline]
    pub fn controller(self) -> PeerId {
        match self {
            Authority::ServerOwned => SERVER_ID,
            Authority::ClientOwned(peer) => peer,
        }
    }
}

/// Server verdict on a `RequestControl`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDecision {
    /// Requester becomes controller; `previous` loses it
    Granted { previous: PeerId },
    /// Requester already controls the entity
    AlreadyOwner,
    /// Another transfer happened first; requester must be told the real controller
    Denied { current: PeerId },
}

/// Arbitrate a control request against the entity's current controller
pub fn decide_request(current: PeerId, requester: PeerId, observed: PeerId) -> ControlDecision {
    if current == requester {
        ControlDecision::AlreadyOwner
    } else if current == observed {
        ControlDecision::Granted { previous: current }
    } else {
        ControlDecision::Denied { current }
    }
}

/// Local-storage effect of a controller change on one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// Controller unchanged
    Unchanged,
    /// Entity joined this peer's dense array at `local_index`
    Acquired { local_index: usize },
    /// Entity left this peer's dense array from `local_index`
    Released { local_index: usize },
    /// Controller changed between two other peers
    Passed,
}

impl Migration {
    /// New simulation flag for the local instance, if it changes
    pub fn simulated(self) -> Option<bool> {
        match self {
            Migration::Acquired { .. } => Some(true),
            Migration::Released { .. } => Some(false),
            Migration::Unchanged | Migration::Passed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_from_controller() {
        assert_eq!(Authority::from_controller(0), Authority::ServerOwned);
        assert_eq!(Authority::from_controller(4), Authority::ClientOwned(4));
        assert_eq!(Authority::ClientOwned(4).controller(), 4);
        assert_eq!(Authority::ServerOwned.controller(), SERVER_ID);
    }

    #[test]
    fn test_request_by_owner_is_noop() {
        assert_eq!(decide_request(1, 1, 1), ControlDecision::AlreadyOwner);
        // stale observation does not matter when already the owner
        assert_eq!(decide_request(1, 1, 5), ControlDecision::AlreadyOwner);
    }

    #[test]
    fn test_request_granted_when_observation_current() {
        assert_eq!(
            decide_request(1, 2, 1),
            ControlDecision::Granted { previous: 1 }
        );
        assert_eq!(
            decide_request(0, 2, 0),
            ControlDecision::Granted { previous: 0 }
        );
    }

    #[test]
    fn test_concurrent_requests_first_wins() {
        // B and C both observed A as controller
        let mut current = 1;
        let first = decide_request(current, 2, 1);
        assert_eq!(first, ControlDecision::Granted { previous: 1 });
        current = 2;
        let second = decide_request(current, 3, 1);
        assert_eq!(second, ControlDecision::Denied { current: 2 });
    }

    #[test]
    fn test_migration_simulated_flag() {
        assert_eq!(Migration::Acquired { local_index: 0 }.simulated(), Some(true));
        assert_eq!(Migration::Released { local_index: 0 }.simulated(), Some(false));
        assert_eq!(Migration::Passed.simulated(), None);
        assert_eq!(Migration::Unchanged.simulated(), None);
    }
}
