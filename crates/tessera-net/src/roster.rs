//! Host-side mapping between transport identities and numeric player ids.

use std::collections::{HashMap, HashSet};

use tessera_protocol::{NumericPlayerId, PeerId};

/// One roster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    /// Transport identity.
    pub peer: PeerId,
    /// Assigned numeric id.
    pub id: NumericPlayerId,
    /// Account name.
    pub name: String,
}

/// Bidirectional `PeerId` ↔ [`NumericPlayerId`] map for one session.
///
/// Ids start from [`NumericPlayerId::derive`] and step forward on collision,
/// so they are deterministic for a given join order, unique among current
/// members, and never one of the reserved values. Ids passed to
/// [`Roster::reserve`] are skipped as well.
#[derive(Debug, Default)]
pub struct Roster {
    by_peer: HashMap<PeerId, RosterEntry>,
    by_id: HashMap<NumericPlayerId, PeerId>,
    reserved: HashSet<NumericPlayerId>,
}

impl Roster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `id` out of the allocation space (used for the host's own client).
    pub fn reserve(&mut self, id: NumericPlayerId) {
        self.reserved.insert(id);
    }

    /// Add a member. Returns its id and whether it was newly added; adding an
    /// existing member returns its current id unchanged.
    pub fn insert(&mut self, peer: PeerId, name: &str) -> (NumericPlayerId, bool) {
        if let Some(entry) = self.by_peer.get(&peer) {
            return (entry.id, false);
        }

        let mut id = NumericPlayerId::derive(peer);
        while self.by_id.contains_key(&id) || self.reserved.contains(&id) {
            id = id.next_candidate();
        }

        self.by_id.insert(id, peer);
        self.by_peer.insert(
            peer,
            RosterEntry {
                peer,
                id,
                name: name.to_string(),
            },
        );
        (id, true)
    }

    /// Remove a member, returning its entry.
    pub fn remove(&mut self, peer: PeerId) -> Option<RosterEntry> {
        let entry = self.by_peer.remove(&peer)?;
        self.by_id.remove(&entry.id);
        Some(entry)
    }

    /// Remove everyone, returning the removed entries.
    pub fn drain(&mut self) -> Vec<RosterEntry> {
        self.by_id.clear();
        self.by_peer.drain().map(|(_, entry)| entry).collect()
    }

    /// Numeric id of `peer`.
    pub fn id_of(&self, peer: PeerId) -> Option<NumericPlayerId> {
        self.by_peer.get(&peer).map(|entry| entry.id)
    }

    /// Transport identity behind `id`.
    pub fn peer_of(&self, id: NumericPlayerId) -> Option<PeerId> {
        self.by_id.get(&id).copied()
    }

    /// Whether `peer` is a member.
    pub fn contains(&self, peer: PeerId) -> bool {
        self.by_peer.contains_key(&peer)
    }

    /// Every member.
    pub fn entries(&self) -> Vec<RosterEntry> {
        self.by_peer.values().cloned().collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }
}
