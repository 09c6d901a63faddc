//! Relevance partition: scenes, instances and the join handshake
//!
//! A [`Domain`] (scene + instance) decides which peers must see an entity.
//! The [`SceneTable`] gates which scenes may be synchronized at all, and the
//! [`JoinTracker`] holds back a joining peer's "ready" signal until every peer
//! already in the destination domain has delivered a fresh snapshot.

use hashbrown::HashMap;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::game::constants::peer::SERVER_ID;
use crate::game::entity::PeerId;
use crate::net::codec::{CodecError, Packet};

/// Visibility domain: scene name plus instance number
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Domain {
    pub scene: String,
    pub instance: i32,
}

impl Domain {
    pub fn new(scene: impl Into<String>, instance: i32) -> Self {
        Self {
            scene: scene.into(),
            instance,
        }
    }

    pub fn write(&self, p: &mut Packet) {
        p.write_str(&self.scene);
        p.write_i32(self.instance);
    }

    pub fn read(p: &mut Packet) -> Result<Self, CodecError> {
        Ok(Self {
            scene: p.read_string()?,
            instance: p.read_i32()?,
        })
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.scene, self.instance)
    }
}

/// Synchronized scenes and the peer that registered each (0 for built-ins)
#[derive(Debug, Clone, Default)]
pub struct SceneTable {
    scenes: HashMap<String, PeerId>,
}

impl SceneTable {
    pub fn with_builtin<I, S>(builtin: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let scenes = builtin
            .into_iter()
            .map(|scene| (scene.into(), SERVER_ID))
            .collect();
        Self { scenes }
    }

    /// Register a scene for synchronization; returns false if already known
    pub fn register(&mut self, scene: &str, owner: PeerId) -> bool {
        if self.scenes.contains_key(scene) {
            return false;
        }
        self.scenes.insert(scene.to_owned(), owner);
        true
    }

    #[inline]
    pub fn is_synchronized(&self, scene: &str) -> bool {
        self.scenes.contains_key(scene)
    }

    pub fn owner(&self, scene: &str) -> Option<PeerId> {
        self.scenes.get(scene).copied()
    }

    /// Scenes registered by peers, excluding built-ins
    pub fn custom(&self) -> impl Iterator<Item = (&str, PeerId)> {
        self.scenes
            .iter()
            .filter(|(_, owner)| **owner != SERVER_ID)
            .map(|(scene, owner)| (scene.as_str(), *owner))
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

type PeerList = SmallVec<[PeerId; 4]>;

/// Join bookkeeping for peers entering a domain
#[derive(Debug, Default)]
pub struct JoinTracker {
    /// joining peer -> providers whose snapshot has not arrived yet
    waiting_on: FxHashMap<PeerId, PeerList>,
    /// provider -> joining peers it owes a snapshot
    owed_by: FxHashMap<PeerId, PeerList>,
    /// peers that have not reported their scene as loaded
    loading: FxHashSet<PeerId>,
}

impl JoinTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a join for `joiner`, waiting on a snapshot from each provider
    ///
    /// Any previous join of the same peer is abandoned first.
    pub fn begin(&mut self, joiner: PeerId, providers: &[PeerId]) {
        self.forget_joiner(joiner);
        self.loading.insert(joiner);
        let mut waiting = PeerList::new();
        for &provider in providers {
            if provider == joiner || waiting.contains(&provider) {
                continue;
            }
            waiting.push(provider);
            self.owed_by.entry(provider).or_default().push(joiner);
        }
        self.waiting_on.insert(joiner, waiting);
    }

    /// True while `peer` is loading its scene or still waiting for snapshots
    pub fn is_joining(&self, peer: PeerId) -> bool {
        self.loading.contains(&peer) || self.waiting_on.contains_key(&peer)
    }

    pub fn is_loading(&self, peer: PeerId) -> bool {
        self.loading.contains(&peer)
    }

    /// Peers currently loading or waiting for snapshots
    pub fn joining_count(&self) -> usize {
        let waiting_only = self
            .waiting_on
            .keys()
            .filter(|peer| !self.loading.contains(*peer))
            .count();
        self.loading.len() + waiting_only
    }

    /// Providers `joiner` is still waiting on
    pub fn pending_for(&self, joiner: PeerId) -> &[PeerId] {
        self.waiting_on
            .get(&joiner)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }

    /// `provider` finished sending its snapshot for `joiner`
    ///
    /// Returns true if `joiner` became ready.
    pub fn snapshot_done(&mut self, provider: PeerId, joiner: PeerId) -> bool {
        if let Some(owed) = self.owed_by.get_mut(&provider) {
            owed.retain(|p| *p != joiner);
            if owed.is_empty() {
                self.owed_by.remove(&provider);
            }
        }
        match self.waiting_on.get_mut(&joiner) {
            Some(waiting) => {
                waiting.retain(|p| *p != provider);
                self.try_complete(joiner)
            }
            None => false,
        }
    }

    /// `joiner` reports its scene loaded; returns true if it became ready
    pub fn done_loading(&mut self, joiner: PeerId) -> bool {
        if !self.loading.remove(&joiner) {
            return false;
        }
        self.try_complete(joiner)
    }

    /// Drop every trace of `peer`; returns joiners released by its departure
    pub fn peer_left(&mut self, peer: PeerId) -> Vec<PeerId> {
        self.forget_joiner(peer);
        let owed = self.owed_by.remove(&peer).unwrap_or_default();
        let mut ready = Vec::new();
        for joiner in owed {
            if let Some(waiting) = self.waiting_on.get_mut(&joiner) {
                waiting.retain(|p| *p != peer);
            }
            if self.try_complete(joiner) {
                ready.push(joiner);
            }
        }
        ready
    }

    fn try_complete(&mut self, joiner: PeerId) -> bool {
        if self.loading.contains(&joiner) {
            return false;
        }
        let done = self
            .waiting_on
            .get(&joiner)
            .map(|waiting| waiting.is_empty())
            .unwrap_or(false);
        if done {
            self.waiting_on.remove(&joiner);
        }
        done
    }

    fn forget_joiner(&mut self, joiner: PeerId) {
        self.loading.remove(&joiner);
        if let Some(waiting) = self.waiting_on.remove(&joiner) {
            for provider in waiting {
                if let Some(owed) = self.owed_by.get_mut(&provider) {
                    owed.retain(|p| *p != joiner);
                    if owed.is_empty() {
                        self.owed_by.remove(&provider);
                    }
                }
            }
        }
    }
}
