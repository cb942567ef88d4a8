use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::catalog::PlayerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub player_id: PlayerId,
    pub display_name: String,
    /// Only set on the host, and never for the local participant.
    pub address: Option<SocketAddr>,
    pub last_seen: Instant,
    pub has_map_loaded: bool,
}

impl PeerRecord {
    pub fn new(player_id: PlayerId, display_name: impl Into<String>, now: Instant) -> Self {
        Self {
            player_id,
            display_name: display_name.into(),
            address: None,
            last_seen: now,
            has_map_loaded: false,
        }
    }

    pub fn at(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// Every known participant of a session, the local one included.
#[derive(Debug, Default)]
pub struct Roster {
    peers: BTreeMap<PlayerId, PeerRecord>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: PeerRecord) -> Option<PeerRecord> {
        self.peers.insert(record.player_id, record)
    }

    pub fn get(&self, player_id: PlayerId) -> Option<&PeerRecord> {
        self.peers.get(&player_id)
    }

    pub fn get_mut(&mut self, player_id: PlayerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&player_id)
    }

    pub fn contains(&self, player_id: PlayerId) -> bool {
        self.peers.contains_key(&player_id)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&PeerRecord> {
        self.peers
            .values()
            .find(|record| record.address.as_ref() == Some(addr))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerRecord> {
        self.peers
            .values_mut()
            .find(|record| record.address.as_ref() == Some(addr))
    }

    pub fn remove(&mut self, player_id: PlayerId) -> Option<PeerRecord> {
        self.peers.remove(&player_id)
    }

    pub fn remove_by_addr(&mut self, addr: &SocketAddr) -> Option<PeerRecord> {
        let player_id = self.get_by_addr(addr)?.player_id;
        self.peers.remove(&player_id)
    }

    pub fn touch(&mut self, addr: &SocketAddr, now: Instant) -> bool {
        match self.get_by_addr_mut(addr) {
            Some(record) => {
                record.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Addresses of remote peers silent for longer than `timeout`.
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|record| record.is_timed_out(now, timeout))
            .filter_map(|record| record.address)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn ids(&self) -> Vec<PlayerId> {
        self.peers.keys().copied().collect()
    }

    pub fn as_map(&self) -> &BTreeMap<PlayerId, PeerRecord> {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_lookup_by_address() {
        let now = Instant::now();
        let mut roster = Roster::new();
        roster.insert(PeerRecord::new(1, "alice", now));
        roster.insert(PeerRecord::new(2, "bob", now).at(addr(5000)));

        assert_eq!(roster.get_by_addr(&addr(5000)).unwrap().display_name, "bob");
        assert!(roster.get_by_addr(&addr(5001)).is_none());

        let removed = roster.remove_by_addr(&addr(5000)).unwrap();
        assert_eq!(removed.player_id, 2);
        assert_eq!(roster.ids(), vec![1]);
    }

    #[test]
    fn test_timed_out_skips_local_record() {
        let start = Instant::now();
        let mut roster = Roster::new();
        roster.insert(PeerRecord::new(1, "host", start));
        roster.insert(PeerRecord::new(2, "quiet", start).at(addr(6000)));
        roster.insert(PeerRecord::new(3, "chatty", start).at(addr(6001)));

        let later = start + Duration::from_secs(11);
        assert!(roster.touch(&addr(6001), later));

        assert_eq!(
            roster.timed_out(later, Duration::from_secs(10)),
            vec![addr(6000)]
        );
        assert!(roster.timed_out(start, Duration::from_secs(10)).is_empty());
    }
}
