use std::collections::BTreeMap;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, trace};

use crate::constants::HEADER_SIZE;
use crate::types::{request_signature, AddressTuple, PacketAddress, PacketCode};

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("Packet is shorter than the RADIUS header")]
    TooShort,
}

/// Key of a tracking entry. The id comes first: ids are pseudo-randomly
/// distributed, so they discriminate faster than codes.
///
/// Tables of connected clients carry no address component: every entry on a
/// connected socket belongs to the same peer, so the comparison
/// short-circuits on that equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackingKey {
    id: u8,
    code: PacketCode,
    addr: Option<AddressTuple>,
}

/// Per-request record used for duplicate suppression, conflict detection
/// and reply caching.
#[derive(Debug)]
pub struct TrackingEntry {
    pub address: PacketAddress,

    /// The 20-octet header of the newest packet for this key.
    pub signature: [u8; HEADER_SIZE],

    /// Receive time of the newest packet. A reply is only written if its
    /// request timestamp still matches; see [`TrackingTable::delete`].
    pub timestamp: Instant,

    /// Packets (original plus duplicates) currently referencing the entry.
    pub packets: u32,

    /// Cached reply, kept for `cleanup_delay` so retransmissions can be
    /// answered without another worker dispatch.
    pub reply: Option<Vec<u8>>,

    /// We decided to not respond to this request at all.
    pub reply_suppressed: bool,

    /// When the cleanup-delay timer fires for this entry.
    pub cleanup_at: Option<Instant>,

    /// Set to the receive time of the packet that is defining a dynamic
    /// client, while the definition runs.
    pub dynamic: Option<Instant>,
}

impl TrackingEntry {
    fn replied(&self) -> bool {
        self.reply.is_some() || self.reply_suppressed
    }
}

/// Classification of an inserted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    /// First packet for this (code, id, address).
    New,
    /// Byte-identical retransmission of an in-flight request.
    Same,
    /// Same key, different payload, and the old request was already
    /// answered. The entry is reused for the new request.
    Updated,
    /// Same key, different payload, old request not yet answered. The peer
    /// reused an id; the old request's reply must be discarded.
    Conflicting,
    /// Dropped without tracking (duplicate for a still-pending client).
    Unused,
}

/// The per-client table mapping (code, id, address) to tracking entries.
#[derive(Debug)]
pub struct TrackingTable {
    connected: bool,
    entries: BTreeMap<TrackingKey, TrackingEntry>,
}

impl TrackingTable {
    pub fn new(connected: bool) -> Self {
        Self {
            connected,
            entries: BTreeMap::new(),
        }
    }

    pub fn key(&self, address: &PacketAddress) -> TrackingKey {
        TrackingKey {
            id: address.id,
            code: address.code,
            addr: (!self.connected).then(|| address.tuple()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &TrackingKey) -> Option<&TrackingEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &TrackingKey) -> Option<&mut TrackingEntry> {
        self.entries.get_mut(key)
    }

    /// Classify an incoming packet and update the table.
    ///
    /// `client_pending` suppresses duplicates outright: a client that is
    /// still being defined will not be answered, so there is nothing useful
    /// to do with a retransmission.
    pub fn insert(
        &mut self,
        address: &PacketAddress,
        packet: &[u8],
        recv_time: Instant,
        client_pending: bool,
    ) -> Result<(TrackingStatus, TrackingKey), TrackingError> {
        if packet.len() < HEADER_SIZE {
            return Err(TrackingError::TooShort);
        }

        let key = self.key(address);
        let signature = request_signature(packet);

        let entry = match self.entries.get_mut(&key) {
            None => {
                trace!(id = address.id, code = %address.code, "NEW packet");
                self.entries.insert(
                    key,
                    TrackingEntry {
                        address: *address,
                        signature,
                        timestamp: recv_time,
                        packets: 1,
                        reply: None,
                        reply_suppressed: false,
                        cleanup_at: None,
                        dynamic: None,
                    },
                );
                return Ok((TrackingStatus::New, key));
            }
            Some(entry) => entry,
        };

        if entry.signature == signature {
            if client_pending {
                debug!(
                    id = address.id,
                    "Ignoring duplicate packet while client is still pending dynamic definition"
                );
                return Ok((TrackingStatus::Unused, key));
            }

            trace!(id = address.id, "SAME packet");
            entry.packets += 1;
            return Ok((TrackingStatus::Same, key));
        }

        // Different payload for a tracked key. The entry is taken over by
        // the newer packet either way; whether the old one had been
        // answered decides conflict vs. reuse.
        entry.signature = signature;
        entry.timestamp = recv_time;
        entry.packets += 1;
        entry.cleanup_at = None;

        if !entry.replied() {
            trace!(id = address.id, "CONFLICTING packet");
            return Ok((TrackingStatus::Conflicting, key));
        }

        trace!(id = address.id, "UPDATED packet");
        entry.reply = None;
        entry.reply_suppressed = false;
        Ok((TrackingStatus::Updated, key))
    }

    /// Cache a reply for retransmission during the cleanup delay. A reply
    /// shorter than a RADIUS header means "do not respond".
    pub fn attach_reply(&mut self, key: &TrackingKey, reply: &[u8]) {
        if let Some(entry) = self.entries.get_mut(key) {
            if reply.len() < HEADER_SIZE {
                entry.reply = None;
                entry.reply_suppressed = true;
            } else {
                entry.reply = Some(reply.to_vec());
                entry.reply_suppressed = false;
            }
        }
    }

    /// Delete the entry, but only if `stamp` still matches its timestamp.
    /// A mismatch means a conflicting packet has since taken the entry
    /// over, and the entry keeps tracking the newer request.
    pub fn delete(&mut self, key: &TrackingKey, stamp: Instant) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.timestamp == stamp => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drop one packet reference; the entry goes away when none remain.
    /// Mirrors the packet-expiry path: a surviving entry loses its cached
    /// reply so the next packet is treated as new work.
    pub fn release(&mut self, key: &TrackingKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };

        debug_assert!(entry.packets > 0);
        entry.packets -= 1;

        if entry.packets == 0 {
            self.entries.remove(key);
            true
        } else {
            entry.reply = None;
            entry.reply_suppressed = false;
            false
        }
    }

    pub fn schedule_cleanup(&mut self, key: &TrackingKey, at: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.cleanup_at = Some(at);
        }
    }

    pub fn cancel_cleanup(&mut self, key: &TrackingKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.cleanup_at = None;
        }
    }

    /// The earliest pending cleanup deadline, for the event loop's timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.cleanup_at).min()
    }

    /// Run the cleanup-delay expiry for every entry whose deadline has
    /// passed. Returns how many packet references were dropped.
    pub fn expire(&mut self, now: Instant) -> u32 {
        let due: Vec<TrackingKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.cleanup_at.is_some_and(|at| at <= now))
            .map(|(k, _)| *k)
            .collect();

        let mut released = 0;
        for key in due {
            debug!(id = key.id, "cleanup delay expired");
            self.entries.remove(&key);
            released += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use super::*;

    fn address(id: u8) -> PacketAddress {
        PacketAddress::new(
            SocketAddr::from(([203, 0, 113, 7], 1000)),
            SocketAddr::from(([203, 0, 113, 1], 1812)),
            PacketCode::AccessRequest,
            id,
        )
    }

    fn packet(id: u8, authenticator: u8) -> Vec<u8> {
        let mut buf = vec![1, id, 0, 20];
        buf.extend_from_slice(&[authenticator; 16]);
        buf
    }

    #[test]
    fn new_then_same() {
        let mut table = TrackingTable::new(false);
        let addr = address(0x2a);
        let now = Instant::now();

        let (status, key) = table.insert(&addr, &packet(0x2a, 1), now, false).unwrap();
        assert_eq!(status, TrackingStatus::New);

        let (status, _) = table.insert(&addr, &packet(0x2a, 1), now, false).unwrap();
        assert_eq!(status, TrackingStatus::Same);
        assert_eq!(table.get(&key).unwrap().packets, 2);
    }

    #[test]
    fn conflict_before_reply_supersedes() {
        let mut table = TrackingTable::new(false);
        let addr = address(0x2a);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);

        let (_, key) = table.insert(&addr, &packet(0x2a, 1), t0, false).unwrap();
        let (status, _) = table.insert(&addr, &packet(0x2a, 2), t1, false).unwrap();
        assert_eq!(status, TrackingStatus::Conflicting);

        // The first worker's reply now fails the stamp check.
        assert!(!table.delete(&key, t0));
        assert_eq!(table.get(&key).unwrap().timestamp, t1);
        assert!(table.delete(&key, t1));
    }

    #[test]
    fn reuse_after_reply_is_updated() {
        let mut table = TrackingTable::new(false);
        let addr = address(0x2a);
        let t0 = Instant::now();

        let (_, key) = table.insert(&addr, &packet(0x2a, 1), t0, false).unwrap();
        table.attach_reply(&key, &packet(0x2a, 9));

        let (status, _) = table
            .insert(&addr, &packet(0x2a, 2), t0 + Duration::from_secs(1), false)
            .unwrap();
        assert_eq!(status, TrackingStatus::Updated);
        assert!(table.get(&key).unwrap().reply.is_none());
    }

    #[test]
    fn duplicate_for_pending_client_is_unused() {
        let mut table = TrackingTable::new(false);
        let addr = address(7);
        let now = Instant::now();

        table.insert(&addr, &packet(7, 1), now, true).unwrap();
        let (status, _) = table.insert(&addr, &packet(7, 1), now, true).unwrap();
        assert_eq!(status, TrackingStatus::Unused);
    }

    #[test]
    fn short_reply_suppresses_response() {
        let mut table = TrackingTable::new(false);
        let addr = address(1);
        let (_, key) = table
            .insert(&addr, &packet(1, 1), Instant::now(), false)
            .unwrap();

        table.attach_reply(&key, &[0]);
        let entry = table.get(&key).unwrap();
        assert!(entry.reply.is_none());
        assert!(entry.reply_suppressed);
    }

    #[test]
    fn connected_table_ignores_address() {
        let mut table = TrackingTable::new(true);
        let mut a = address(3);
        let mut b = address(3);
        a.src.set_port(1000);
        b.src.set_port(2000);

        let now = Instant::now();
        table.insert(&a, &packet(3, 1), now, false).unwrap();
        let (status, _) = table.insert(&b, &packet(3, 1), now, false).unwrap();
        assert_eq!(status, TrackingStatus::Same);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn release_drops_entry_at_zero() {
        let mut table = TrackingTable::new(false);
        let addr = address(4);
        let now = Instant::now();
        let (_, key) = table.insert(&addr, &packet(4, 1), now, false).unwrap();
        table.insert(&addr, &packet(4, 1), now, false).unwrap();

        assert!(!table.release(&key));
        assert!(table.release(&key));
        assert!(table.get(&key).is_none());
    }

    #[test]
    fn expire_runs_due_cleanups_only() {
        let mut table = TrackingTable::new(false);
        let now = Instant::now();

        let (_, key_a) = table.insert(&address(1), &packet(1, 1), now, false).unwrap();
        let (_, key_b) = table.insert(&address(2), &packet(2, 1), now, false).unwrap();

        table.schedule_cleanup(&key_a, now + Duration::from_secs(5));
        table.schedule_cleanup(&key_b, now + Duration::from_secs(10));

        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(5)));
        assert_eq!(table.expire(now + Duration::from_secs(6)), 1);
        assert!(table.get(&key_a).is_none());
        assert!(table.get(&key_b).is_some());
    }
}
