//! Splits payloads larger than [`SAFE_PAYLOAD_SIZE`] into FRAG packets and
//! reassembles them on the receiving side.
//!
//! Each FRAG payload starts with a 12 byte sub-header: message id, fragment
//! index and fragment count (u16 big-endian each), the flag of the original
//! packet, then 5 reserved bytes. The fragment index doubles as the FRAG
//! packet's wire sequence number.
//!
//! Reassembly buffers are keyed by sender address and message id, so every
//! peer has its own id space. Senders must not reuse a message id within the
//! staleness window: late fragments for a recently completed id are dropped,
//! and a first fragment that disagrees with a pending buffer's fragment count
//! evicts that buffer and starts over.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::bytes::{ByteReader, ByteWriter};
use crate::error::{NetError, Result};
use crate::packet::{Flag, Packet, PacketError, SAFE_PAYLOAD_SIZE};

pub const FRAGMENT_HEADER_SIZE: usize = 12;
pub const FRAGMENT_CHUNK_SIZE: usize = SAFE_PAYLOAD_SIZE - FRAGMENT_HEADER_SIZE;
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(30);

const RESERVED_BYTES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: u16,
    pub index: u16,
    pub total: u16,
    pub original_flag: Flag,
}

impl FragmentHeader {
    fn write(&self, writer: &mut ByteWriter) {
        writer.put_u16(self.message_id);
        writer.put_u16(self.index);
        writer.put_u16(self.total);
        writer.put_u8(self.original_flag.as_u8());
        writer.put_zeros(RESERVED_BYTES);
    }

    fn read(reader: &mut ByteReader<'_>) -> std::result::Result<Self, PacketError> {
        let message_id = reader.get_u16()?;
        let index = reader.get_u16()?;
        let total = reader.get_u16()?;
        let original_flag = Flag::try_from(reader.get_u8()?)?;
        reader.skip(RESERVED_BYTES)?;
        Ok(Self {
            message_id,
            index,
            total,
            original_flag,
        })
    }
}

/// A message put back together from all of its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    pub message_id: u16,
    pub original_flag: Flag,
    pub data: Vec<u8>,
}

impl Reassembled {
    /// Packet as it would have arrived had it not been fragmented.
    pub fn into_packet(self) -> Packet {
        let mut packet = Packet::new(self.original_flag, self.message_id);
        packet.payload = self.data;
        packet
    }
}

#[derive(Debug)]
struct ReassemblyBuffer {
    total: u16,
    original_flag: Flag,
    received: BTreeMap<u16, Vec<u8>>,
    last_update: Instant,
}

impl ReassemblyBuffer {
    fn new(header: &FragmentHeader, now: Instant) -> Self {
        Self {
            total: header.total,
            original_flag: header.original_flag,
            received: BTreeMap::new(),
            last_update: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() == usize::from(self.total)
    }

    fn concat(self) -> Vec<u8> {
        let len = self.received.values().map(Vec::len).sum();
        let mut data = Vec::with_capacity(len);
        for chunk in self.received.into_values() {
            data.extend_from_slice(&chunk);
        }
        data
    }
}

type BufferKey = (SocketAddr, u16);

#[derive(Debug)]
pub struct FragmentAssembler {
    buffers: HashMap<BufferKey, ReassemblyBuffer>,
    completed: HashMap<BufferKey, Instant>,
    next_message_id: u16,
    stale_timeout: Duration,
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_STALE_TIMEOUT)
    }

    pub fn with_timeout(stale_timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            completed: HashMap::new(),
            next_message_id: 0,
            stale_timeout,
        }
    }

    pub fn fragment_count(len: usize) -> usize {
        len.div_ceil(FRAGMENT_CHUNK_SIZE).max(1)
    }

    /// Splits `data` into FRAG packets under a fresh message id.
    pub fn fragment(&mut self, data: &[u8], flag: Flag) -> Result<Vec<Packet>> {
        let count = Self::fragment_count(data.len());
        let total = u16::try_from(count).map_err(|_| NetError::MessageTooLarge {
            len: data.len(),
            max: usize::from(u16::MAX) * FRAGMENT_CHUNK_SIZE,
        })?;

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(FRAGMENT_CHUNK_SIZE).collect()
        };

        let packets = chunks
            .into_iter()
            .zip(0u16..)
            .map(|(chunk, index)| {
                let header = FragmentHeader {
                    message_id,
                    index,
                    total,
                    original_flag: flag,
                };
                let mut writer = ByteWriter::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
                header.write(&mut writer);
                writer.put_bytes(chunk);
                Packet::frag(index, writer.into_inner())
            })
            .collect();

        Ok(packets)
    }

    /// Feeds one FRAG packet. Returns the whole message exactly once, when its
    /// last missing fragment arrives.
    pub fn add_fragment(&mut self, packet: &Packet, from: SocketAddr) -> Option<Reassembled> {
        self.add_fragment_at(packet, from, Instant::now())
    }

    pub fn add_fragment_at(
        &mut self,
        packet: &Packet,
        from: SocketAddr,
        now: Instant,
    ) -> Option<Reassembled> {
        if packet.flag != Flag::Frag || packet.payload.len() < FRAGMENT_HEADER_SIZE {
            return None;
        }

        let mut reader = ByteReader::new(&packet.payload);
        let header = match FragmentHeader::read(&mut reader) {
            Ok(header) => header,
            Err(e) => {
                log::debug!("dropping fragment from {}: {}", from, e);
                return None;
            }
        };
        if header.total == 0 || header.index >= header.total {
            log::debug!(
                "dropping fragment {}/{} of message {} from {}",
                header.index,
                header.total,
                header.message_id,
                from
            );
            return None;
        }

        let key = (from, header.message_id);
        if let Some(done_at) = self.completed.get(&key) {
            if now.saturating_duration_since(*done_at) < self.stale_timeout {
                return None;
            }
            self.completed.remove(&key);
        }

        let buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| ReassemblyBuffer::new(&header, now));
        if buffer.total != header.total || buffer.original_flag != header.original_flag {
            log::debug!(
                "message {} from {} restarted with {} fragments",
                header.message_id,
                from,
                header.total
            );
            *buffer = ReassemblyBuffer::new(&header, now);
        }

        buffer
            .received
            .entry(header.index)
            .or_insert_with(|| reader.rest().to_vec());
        buffer.last_update = now;

        if !buffer.is_complete() {
            return None;
        }

        let buffer = self.buffers.remove(&key)?;
        let original_flag = buffer.original_flag;
        self.completed.insert(key, now);

        Some(Reassembled {
            message_id: header.message_id,
            original_flag,
            data: buffer.concat(),
        })
    }

    /// Drops partial messages that have not seen a fragment within `timeout`.
    /// Returns how many were dropped.
    pub fn cleanup_stale(&mut self, timeout: Duration) -> usize {
        self.cleanup_stale_at(Instant::now(), timeout)
    }

    pub fn cleanup_stale_at(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| now.saturating_duration_since(buffer.last_update) <= timeout);
        self.completed
            .retain(|_, done_at| now.saturating_duration_since(*done_at) <= timeout);

        let removed = before - self.buffers.len();
        if removed > 0 {
            log::debug!("dropped {} stale partial messages", removed);
        }
        removed
    }

    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Forgets everything received from `addr`.
    pub fn forget_peer(&mut self, addr: SocketAddr) {
        self.buffers.retain(|(from, _), _| *from != addr);
        self.completed.retain(|(from, _), _| *from != addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn reassemble(assembler: &mut FragmentAssembler, packets: &[Packet]) -> Option<Reassembled> {
        let mut result = None;
        for packet in packets {
            if let Some(done) = assembler.add_fragment(packet, peer()) {
                assert!(result.is_none(), "message completed twice");
                result = Some(done);
            }
        }
        result
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_boundary_lengths() {
        let lengths = [
            (0, 1),
            (1, 1),
            (FRAGMENT_CHUNK_SIZE, 1),
            (FRAGMENT_CHUNK_SIZE + 1, 2),
            (10 * FRAGMENT_CHUNK_SIZE + 37, 11),
        ];

        for (len, expected) in lengths {
            let data = sample(len);
            let mut sender = FragmentAssembler::new();
            let mut receiver = FragmentAssembler::new();

            let packets = sender.fragment(&data, Flag::Give).unwrap();
            assert_eq!(packets.len(), expected, "len {}", len);
            assert!(packets.iter().all(|p| p.flag == Flag::Frag));
            assert!(
                packets
                    .iter()
                    .all(|p| p.payload.len() <= SAFE_PAYLOAD_SIZE)
            );

            let done = reassemble(&mut receiver, &packets).unwrap();
            assert_eq!(done.data, data);
            assert_eq!(done.original_flag, Flag::Give);
            assert_eq!(receiver.pending(), 0);
        }
    }

    #[test]
    fn test_fragment_index_is_wire_sequence() {
        let mut sender = FragmentAssembler::new();
        let packets = sender
            .fragment(&sample(3 * FRAGMENT_CHUNK_SIZE), Flag::Give)
            .unwrap();
        let sequences: Vec<u16> = packets.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_out_of_order_arrival() {
        let data = sample(4 * FRAGMENT_CHUNK_SIZE + 5);
        let mut sender = FragmentAssembler::new();
        let mut receiver = FragmentAssembler::new();

        let mut packets = sender.fragment(&data, Flag::Give).unwrap();
        packets.reverse();
        packets.swap(1, 3);

        let done = reassemble(&mut receiver, &packets).unwrap();
        assert_eq!(done.data, data);
    }

    #[test]
    fn test_message_ids_advance() {
        let mut sender = FragmentAssembler::new();
        let a = sender.fragment(b"a", Flag::Give).unwrap();
        let b = sender.fragment(b"b", Flag::Give).unwrap();

        let mut receiver = FragmentAssembler::new();
        let a = receiver.add_fragment(&a[0], peer()).unwrap();
        let b = receiver.add_fragment(&b[0], peer()).unwrap();
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(b.into_packet().payload, b"b");
    }

    #[test]
    fn test_rejects_without_side_effects() {
        let mut receiver = FragmentAssembler::new();

        assert!(receiver.add_fragment(&Packet::give(0, vec![0; 64]), peer()).is_none());
        for len in 0..FRAGMENT_HEADER_SIZE {
            assert!(receiver.add_fragment(&Packet::frag(0, vec![0; len]), peer()).is_none());
        }
        assert_eq!(receiver.pending(), 0);
    }

    #[test]
    fn test_invalid_header_fields_dropped() {
        let mut receiver = FragmentAssembler::new();

        // index past the declared count
        let mut writer = ByteWriter::new();
        FragmentHeader {
            message_id: 1,
            index: 2,
            total: 2,
            original_flag: Flag::Give,
        }
        .write(&mut writer);
        assert!(receiver.add_fragment(&Packet::frag(2, writer.into_inner()), peer()).is_none());

        // unknown original flag
        let mut payload = vec![0, 1, 0, 0, 0, 1, 99];
        payload.resize(FRAGMENT_HEADER_SIZE, 0);
        assert!(receiver.add_fragment(&Packet::frag(0, payload), peer()).is_none());

        assert_eq!(receiver.pending(), 0);
    }

    #[test]
    fn test_duplicate_after_completion_ignored() {
        let data = sample(FRAGMENT_CHUNK_SIZE + 10);
        let mut sender = FragmentAssembler::new();
        let mut receiver = FragmentAssembler::new();
        let packets = sender.fragment(&data, Flag::Give).unwrap();

        assert!(reassemble(&mut receiver, &packets).is_some());
        assert!(receiver.add_fragment(&packets[0], peer()).is_none());
        assert_eq!(receiver.pending(), 0);
    }

    #[test]
    fn test_senders_have_separate_id_spaces() {
        let mut alice = FragmentAssembler::new();
        let mut bob = FragmentAssembler::new();
        let from_alice = alice.fragment(&sample(FRAGMENT_CHUNK_SIZE + 1), Flag::Give).unwrap();
        let from_bob = bob.fragment(&sample(FRAGMENT_CHUNK_SIZE + 2), Flag::Take).unwrap();
        let bob_addr: SocketAddr = "127.0.0.1:5001".parse().unwrap();

        let mut receiver = FragmentAssembler::new();
        assert!(receiver.add_fragment(&from_alice[0], peer()).is_none());
        assert!(receiver.add_fragment(&from_bob[0], bob_addr).is_none());
        assert_eq!(receiver.pending(), 2);

        let done = receiver.add_fragment(&from_bob[1], bob_addr).unwrap();
        assert_eq!(done.original_flag, Flag::Take);
        assert_eq!(done.data.len(), FRAGMENT_CHUNK_SIZE + 2);
        assert_eq!(receiver.pending(), 1);
    }

    #[test]
    fn test_mismatched_count_restarts_buffer() {
        let mut sender = FragmentAssembler::new();
        let old = sender.fragment(&sample(3 * FRAGMENT_CHUNK_SIZE), Flag::Give).unwrap();
        let mut reuse = FragmentAssembler::new();
        let new = reuse.fragment(&sample(FRAGMENT_CHUNK_SIZE + 1), Flag::Give).unwrap();

        let mut receiver = FragmentAssembler::new();
        assert!(receiver.add_fragment(&old[0], peer()).is_none());
        assert!(receiver.add_fragment(&old[1], peer()).is_none());
        // same id, different fragment count
        assert!(receiver.add_fragment(&new[0], peer()).is_none());
        let done = receiver.add_fragment(&new[1], peer()).unwrap();
        assert_eq!(done.data, sample(FRAGMENT_CHUNK_SIZE + 1));
    }

    #[test]
    fn test_cleanup_stale() {
        let mut sender = FragmentAssembler::new();
        let packets = sender.fragment(&sample(2 * FRAGMENT_CHUNK_SIZE), Flag::Give).unwrap();

        let mut receiver = FragmentAssembler::new();
        let start = Instant::now();
        assert!(receiver.add_fragment_at(&packets[0], peer(), start).is_none());

        assert_eq!(
            receiver.cleanup_stale_at(start + Duration::from_secs(29), DEFAULT_STALE_TIMEOUT),
            0
        );
        assert_eq!(receiver.pending(), 1);
        assert_eq!(
            receiver.cleanup_stale_at(start + Duration::from_secs(31), DEFAULT_STALE_TIMEOUT),
            1
        );
        assert_eq!(receiver.pending(), 0);

        // the late fragment starts a new partial message rather than completing
        assert!(
            receiver
                .add_fragment_at(&packets[1], peer(), start + Duration::from_secs(32))
                .is_none()
        );
        assert_eq!(receiver.pending(), 1);
    }

    #[test]
    fn test_forget_peer() {
        let mut sender = FragmentAssembler::new();
        let packets = sender.fragment(&sample(2 * FRAGMENT_CHUNK_SIZE), Flag::Give).unwrap();
        let mut receiver = FragmentAssembler::new();
        receiver.add_fragment(&packets[0], peer());

        receiver.forget_peer(peer());
        assert_eq!(receiver.pending(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_fragment_roundtrip(len in 0usize..(3 * FRAGMENT_CHUNK_SIZE), seed in any::<u8>()) {
            let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
            let mut sender = FragmentAssembler::new();
            let mut receiver = FragmentAssembler::new();

            let packets = sender.fragment(&data, Flag::Give).unwrap();
            prop_assert_eq!(packets.len(), FragmentAssembler::fragment_count(len));

            let done = reassemble(&mut receiver, &packets).unwrap();
            prop_assert_eq!(done.data, data);
        }
    }
}
