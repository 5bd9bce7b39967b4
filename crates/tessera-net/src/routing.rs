//! Game-traffic classification and sequencing.
//!
//! Packets arrive already decoded; [`classify_game`] picks out the three game
//! subtypes and resolves who originally sent them, so endpoints can treat
//! direct and lobby-relayed traffic alike.
//!
//! Every sender numbers its messages to one receiver 1, 2, 3, ... with no
//! gaps, whatever path each message takes. The lobby relay and a direct link
//! race each other, so a message can overtake an earlier one when the sender
//! switches paths. [`SequenceGuard`] holds such early arrivals back until the
//! missing numbers show up, drops duplicates and anything already delivered,
//! and gives up on a gap that stays open longer than its hold time.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tessera_protocol::{Packet, PacketKind, PeerId};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// How a game payload reached this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Over a direct peer link.
    Direct,
    /// Relayed by the lobby, addressed to the host's server role.
    RelayedToHost,
    /// Relayed by the lobby, addressed to a client role.
    RelayedToClient,
}

/// A game payload with its original sender resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameTraffic<'a> {
    /// The peer that produced the payload.
    pub origin: PeerId,
    /// Sender-assigned sequence number.
    pub sequence: u64,
    /// Payload bytes.
    pub payload: &'a [u8],
    /// Which path it took.
    pub path: DeliveryPath,
}

/// Extract game traffic from a packet received from `from`.
///
/// Relay subtypes are only honoured when `from` is the lobby; anyone else
/// claiming to relay is ignored.
pub fn classify_game(from: PeerId, lobby: Option<PeerId>, packet: &Packet) -> Option<GameTraffic<'_>> {
    let relayed_by_lobby = lobby == Some(from);
    match packet {
        Packet::GameMessage { sequence, payload } => Some(GameTraffic {
            origin: from,
            sequence: *sequence,
            payload,
            path: DeliveryPath::Direct,
        }),
        Packet::RelayToServer {
            peer,
            sequence,
            payload,
        } if relayed_by_lobby => Some(GameTraffic {
            origin: *peer,
            sequence: *sequence,
            payload,
            path: DeliveryPath::RelayedToHost,
        }),
        Packet::RelayToClient {
            peer,
            sequence,
            payload,
        } if relayed_by_lobby => Some(GameTraffic {
            origin: *peer,
            sequence: *sequence,
            payload,
            path: DeliveryPath::RelayedToClient,
        }),
        other => {
            if matches!(other.kind(), PacketKind::RelayToHost | PacketKind::RelayToClient) {
                tracing::warn!("Ignoring relay packet from non-lobby peer {from}");
            }
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Sequencing
// ---------------------------------------------------------------------------

/// How long a missing message may hold back later ones before the gap is
/// skipped.
pub const REORDER_HOLD: Duration = Duration::from_secs(1);

/// Held messages per sender before the oldest gap is skipped regardless of
/// the hold time.
const MAX_HELD: usize = 1 << 16;

#[derive(Debug)]
struct SenderWindow {
    next: u64,
    held: BTreeMap<u64, Vec<u8>>,
    /// When the current gap last blocked delivery without progress.
    stalled_since: Option<Instant>,
}

impl Default for SenderWindow {
    fn default() -> Self {
        Self {
            next: 1,
            held: BTreeMap::new(),
            stalled_since: None,
        }
    }
}

impl SenderWindow {
    fn drain_ready(&mut self, out: &mut Vec<Vec<u8>>) -> bool {
        let before = out.len();
        while let Some(payload) = self.held.remove(&self.next) {
            out.push(payload);
            self.next += 1;
        }
        out.len() > before
    }

    fn skip_gap(&mut self, peer: PeerId, out: &mut Vec<Vec<u8>>) {
        if let Some(&first) = self.held.keys().next() {
            tracing::warn!(
                "Giving up on messages {}..{first} from {peer}",
                self.next
            );
            self.next = first;
            self.drain_ready(out);
        }
    }

    fn restart_stall(&mut self, now: Instant) {
        self.stalled_since = if self.held.is_empty() { None } else { Some(now) };
    }
}

/// Per-sender reorder window.
#[derive(Debug)]
pub struct SequenceGuard {
    senders: HashMap<PeerId, SenderWindow>,
    hold: Duration,
}

impl Default for SequenceGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGuard {
    /// Create an empty guard with the default hold time.
    pub fn new() -> Self {
        Self::with_hold(REORDER_HOLD)
    }

    pub fn with_hold(hold: Duration) -> Self {
        Self {
            senders: HashMap::new(),
            hold,
        }
    }

    /// Take message `sequence` from `peer` and return every payload that is
    /// now deliverable, oldest first.
    ///
    /// Numbers already delivered or already held are logged and dropped. A
    /// number past a gap is held until the gap fills.
    pub fn accept(&mut self, peer: PeerId, sequence: u64, payload: Vec<u8>, now: Instant) -> Vec<Vec<u8>> {
        let window = self.senders.entry(peer).or_default();
        if sequence < window.next || window.held.contains_key(&sequence) {
            tracing::warn!(
                "Dropping stale message {sequence} from {peer} (expecting {})",
                window.next
            );
            return Vec::new();
        }

        window.held.insert(sequence, payload);
        let mut ready = Vec::new();
        let progressed = window.drain_ready(&mut ready);
        if window.held.len() > MAX_HELD {
            window.skip_gap(peer, &mut ready);
            window.restart_stall(now);
        } else if progressed || window.stalled_since.is_none() {
            window.restart_stall(now);
        }
        if !window.held.is_empty() {
            tracing::debug!(
                "Holding {} messages from {peer} until {} arrives",
                window.held.len(),
                window.next
            );
        }
        ready
    }

    /// Skip every gap that has blocked delivery for longer than the hold
    /// time and return what that releases, per sender, oldest first.
    pub fn release_overdue(&mut self, now: Instant) -> Vec<(PeerId, Vec<u8>)> {
        let mut released = Vec::new();
        for (peer, window) in &mut self.senders {
            let overdue = window
                .stalled_since
                .is_some_and(|since| now.saturating_duration_since(since) >= self.hold);
            if !overdue {
                continue;
            }
            let mut ready = Vec::new();
            window.skip_gap(*peer, &mut ready);
            window.restart_stall(now);
            released.extend(ready.into_iter().map(|payload| (*peer, payload)));
        }
        released
    }

    /// Forget a sender, e.g. when it leaves the session.
    pub fn forget(&mut self, peer: PeerId) {
        self.senders.remove(&peer);
    }

    /// Next sequence number expected from `peer`.
    pub fn next_expected(&self, peer: PeerId) -> u64 {
        self.senders.get(&peer).map_or(1, |window| window.next)
    }

    /// Messages from `peer` waiting for a gap to fill.
    pub fn held(&self, peer: PeerId) -> usize {
        self.senders.get(&peer).map_or(0, |window| window.held.len())
    }
}

/// Outgoing sequence numbers kept separately per receiver, so each receiver
/// sees 1, 2, 3, ... even when messages to it are interleaved with messages
/// to others.
#[derive(Debug, Default)]
pub struct PeerSequences {
    next: HashMap<PeerId, u64>,
}

impl PeerSequences {
    /// Next sequence number for a message to `peer`. Starts at 1.
    pub fn next_for(&mut self, peer: PeerId) -> u64 {
        let next = self.next.entry(peer).or_insert(1);
        let sequence = *next;
        *next += 1;
        sequence
    }

    pub fn forget(&mut self, peer: PeerId) {
        self.next.remove(&peer);
    }

    pub fn clear(&mut self) {
        self.next.clear();
    }
}

/// Monotonic sequence numbers for outgoing game messages. Starts at 1.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    /// Create a counter starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOBBY: PeerId = PeerId(100);
    const HOST: PeerId = PeerId(1);
    const CLIENT: PeerId = PeerId(2);

    #[test]
    fn test_direct_message_origin_is_link_peer() {
        let packet = Packet::GameMessage {
            sequence: 4,
            payload: vec![9],
        };
        let traffic = classify_game(CLIENT, Some(LOBBY), &packet).unwrap();
        assert_eq!(traffic.origin, CLIENT);
        assert_eq!(traffic.path, DeliveryPath::Direct);
        assert_eq!(traffic.payload, &[9]);
    }

    #[test]
    fn test_relay_origin_is_embedded_peer() {
        let packet = Packet::RelayToServer {
            peer: CLIENT,
            sequence: 1,
            payload: vec![1, 2],
        };
        let traffic = classify_game(LOBBY, Some(LOBBY), &packet).unwrap();
        assert_eq!(traffic.origin, CLIENT);
        assert_eq!(traffic.path, DeliveryPath::RelayedToHost);

        let packet = Packet::RelayToClient {
            peer: HOST,
            sequence: 1,
            payload: vec![],
        };
        let traffic = classify_game(LOBBY, Some(LOBBY), &packet).unwrap();
        assert_eq!(traffic.origin, HOST);
        assert_eq!(traffic.path, DeliveryPath::RelayedToClient);
    }

    #[test]
    fn test_relay_from_non_lobby_is_ignored() {
        let packet = Packet::RelayToServer {
            peer: HOST,
            sequence: 1,
            payload: vec![],
        };
        assert!(classify_game(CLIENT, Some(LOBBY), &packet).is_none());
        assert!(classify_game(CLIENT, None, &packet).is_none());
    }

    #[test]
    fn test_control_packets_are_not_game_traffic() {
        assert!(classify_game(LOBBY, Some(LOBBY), &Packet::Logout).is_none());
    }

    fn accept(guard: &mut SequenceGuard, peer: PeerId, sequence: u64, now: Instant) -> Vec<u8> {
        guard
            .accept(peer, sequence, vec![sequence as u8], now)
            .into_iter()
            .flatten()
            .collect()
    }

    #[test]
    fn test_guard_delivers_in_sequence() {
        let mut guard = SequenceGuard::new();
        let now = Instant::now();
        assert_eq!(accept(&mut guard, CLIENT, 1, now), vec![1]);
        assert_eq!(accept(&mut guard, CLIENT, 2, now), vec![2]);
        assert_eq!(guard.next_expected(CLIENT), 3);
        assert_eq!(guard.held(CLIENT), 0);
    }

    #[test]
    fn test_guard_rejects_stale_and_duplicate() {
        let mut guard = SequenceGuard::new();
        let now = Instant::now();
        accept(&mut guard, CLIENT, 1, now);
        accept(&mut guard, CLIENT, 2, now);
        assert!(accept(&mut guard, CLIENT, 2, now).is_empty());
        assert!(accept(&mut guard, CLIENT, 1, now).is_empty());

        // A held number is a duplicate too.
        assert!(accept(&mut guard, CLIENT, 4, now).is_empty());
        assert!(accept(&mut guard, CLIENT, 4, now).is_empty());
        assert_eq!(guard.held(CLIENT), 1);
        assert_eq!(accept(&mut guard, CLIENT, 3, now), vec![3, 4]);
    }

    #[test]
    fn test_overtaken_messages_are_reordered() {
        // Relayed 1 and 2 are still in flight when direct 3 and 4 land.
        let mut guard = SequenceGuard::new();
        let now = Instant::now();
        assert!(accept(&mut guard, CLIENT, 3, now).is_empty());
        assert!(accept(&mut guard, CLIENT, 4, now).is_empty());
        assert_eq!(accept(&mut guard, CLIENT, 1, now), vec![1]);
        assert_eq!(accept(&mut guard, CLIENT, 2, now), vec![2, 3, 4]);
        assert_eq!(guard.next_expected(CLIENT), 5);
    }

    #[test]
    fn test_open_gap_is_skipped_after_hold() {
        let hold = Duration::from_millis(100);
        let mut guard = SequenceGuard::with_hold(hold);
        let start = Instant::now();
        accept(&mut guard, CLIENT, 1, start);
        assert!(accept(&mut guard, CLIENT, 3, start).is_empty());
        assert!(accept(&mut guard, CLIENT, 4, start).is_empty());

        assert!(guard.release_overdue(start + hold / 2).is_empty());
        let released = guard.release_overdue(start + hold);
        assert_eq!(released, vec![(CLIENT, vec![3]), (CLIENT, vec![4])]);
        assert_eq!(guard.next_expected(CLIENT), 5);

        // The skipped number is now stale.
        assert!(accept(&mut guard, CLIENT, 2, start + hold).is_empty());
    }

    #[test]
    fn test_progress_restarts_hold() {
        let hold = Duration::from_millis(100);
        let mut guard = SequenceGuard::with_hold(hold);
        let start = Instant::now();
        assert!(accept(&mut guard, CLIENT, 2, start).is_empty());
        assert!(accept(&mut guard, CLIENT, 4, start).is_empty());
        assert_eq!(accept(&mut guard, CLIENT, 1, start + hold / 2), vec![1, 2]);

        // Waiting on 3 only since the last delivery.
        assert!(guard.release_overdue(start + hold).is_empty());
        assert_eq!(guard.release_overdue(start + hold * 3 / 2), vec![(CLIENT, vec![4])]);
    }

    #[test]
    fn test_guard_tracks_senders_independently() {
        let mut guard = SequenceGuard::new();
        let now = Instant::now();
        assert!(accept(&mut guard, CLIENT, 2, now).is_empty());
        assert_eq!(accept(&mut guard, HOST, 1, now), vec![1]);
        assert_eq!(guard.held(CLIENT), 1);
        assert_eq!(guard.held(HOST), 0);
    }

    #[test]
    fn test_forget_resets_sender() {
        let mut guard = SequenceGuard::new();
        let now = Instant::now();
        accept(&mut guard, CLIENT, 1, now);
        accept(&mut guard, CLIENT, 5, now);
        guard.forget(CLIENT);
        assert_eq!(guard.held(CLIENT), 0);
        assert_eq!(accept(&mut guard, CLIENT, 1, now), vec![1]);
    }

    #[test]
    fn test_peer_sequences_are_independent() {
        let mut sequences = PeerSequences::default();
        assert_eq!(sequences.next_for(CLIENT), 1);
        assert_eq!(sequences.next_for(CLIENT), 2);
        assert_eq!(sequences.next_for(HOST), 1);
        sequences.forget(CLIENT);
        assert_eq!(sequences.next_for(CLIENT), 1);
    }

    #[test]
    fn test_counter_is_monotonic() {
        let counter = SequenceCounter::new();
        let first = counter.next_sequence();
        let second = counter.next_sequence();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }
}
