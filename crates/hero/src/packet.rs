use crate::bytes::{ByteReader, ByteWriter};

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 8;
/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65507;
/// Payloads above this size are split into FRAG packets before sending.
pub const SAFE_PAYLOAD_SIZE: usize = 60000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    Conn = 0,
    Give = 1,
    Take = 2,
    Seen = 3,
    Stop = 4,
    Frag = 5,
    Ping = 6,
    Pong = 7,
}

impl Flag {
    pub const ALL: [Flag; 8] = [
        Flag::Conn,
        Flag::Give,
        Flag::Take,
        Flag::Seen,
        Flag::Stop,
        Flag::Frag,
        Flag::Ping,
        Flag::Pong,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control flags are answered by the endpoints themselves and never
    /// acknowledged with SEEN.
    pub fn is_liveness_only(self) -> bool {
        matches!(self, Flag::Seen | Flag::Ping | Flag::Pong)
    }
}

impl TryFrom<u8> for Flag {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Flag::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(PacketError::UnknownFlag(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("frame too short: {len} bytes")]
    TooShort { len: usize },
    #[error("frame truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("unknown flag {0}")]
    UnknownFlag(u8),
    #[error("unsupported protocol version {got}")]
    VersionMismatch { got: u8 },
    #[error("field too long for a u16 length prefix: {len} bytes")]
    FieldTooLong { len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flag: Flag,
    pub version: u8,
    pub sequence: u16,
    pub address_data: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(flag: Flag, sequence: u16) -> Self {
        Self {
            flag,
            version: PROTOCOL_VERSION,
            sequence,
            address_data: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn conn(sequence: u16, identity: &[u8]) -> Self {
        let mut packet = Self::new(Flag::Conn, sequence);
        packet.address_data = identity.to_vec();
        packet
    }

    pub fn give(sequence: u16, payload: Vec<u8>) -> Self {
        let mut packet = Self::new(Flag::Give, sequence);
        packet.payload = payload;
        packet
    }

    /// GIVE packet whose address-data names the intended target.
    pub fn give_to(sequence: u16, payload: Vec<u8>, target: &[u8]) -> Self {
        let mut packet = Self::give(sequence, payload);
        packet.address_data = target.to_vec();
        packet
    }

    pub fn take(sequence: u16) -> Self {
        Self::new(Flag::Take, sequence)
    }

    pub fn seen(acked_sequence: u16) -> Self {
        Self::new(Flag::Seen, acked_sequence)
    }

    pub fn stop(sequence: u16) -> Self {
        Self::new(Flag::Stop, sequence)
    }

    pub fn frag(fragment_index: u16, payload: Vec<u8>) -> Self {
        let mut packet = Self::new(Flag::Frag, fragment_index);
        packet.payload = payload;
        packet
    }

    pub fn ping(sequence: u16) -> Self {
        Self::new(Flag::Ping, sequence)
    }

    pub fn pong(sequence: u16) -> Self {
        Self::new(Flag::Pong, sequence)
    }

    pub fn is_valid(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.address_data.len() + self.payload.len()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = length_prefix(&self.payload)?;
        let address_len = length_prefix(&self.address_data)?;

        let mut writer = ByteWriter::with_capacity(self.encoded_len());
        writer.put_u8(self.flag.as_u8());
        writer.put_u8(self.version);
        writer.put_u16(self.sequence);
        writer.put_u16(payload_len);
        writer.put_u16(address_len);
        writer.put_bytes(&self.address_data);
        writer.put_bytes(&self.payload);
        Ok(writer.into_inner())
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::TooShort { len: data.len() });
        }

        let mut reader = ByteReader::new(data);
        let flag = Flag::try_from(reader.get_u8()?)?;
        let version = reader.get_u8()?;
        let sequence = reader.get_u16()?;
        let payload_len = usize::from(reader.get_u16()?);
        let address_len = usize::from(reader.get_u16()?);

        if payload_len + address_len > reader.remaining() {
            return Err(PacketError::Truncated {
                needed: payload_len + address_len,
                remaining: reader.remaining(),
            });
        }

        let address_data = reader.get_bytes(address_len)?.to_vec();
        let payload = reader.get_bytes(payload_len)?.to_vec();

        Ok(Self {
            flag,
            version,
            sequence,
            address_data,
            payload,
        })
    }

    /// Deserializes and rejects frames from a foreign protocol version.
    pub fn parse_valid(data: &[u8]) -> Result<Self, PacketError> {
        let packet = Self::deserialize(data)?;
        if !packet.is_valid() {
            return Err(PacketError::VersionMismatch {
                got: packet.version,
            });
        }
        Ok(packet)
    }
}

fn length_prefix(field: &[u8]) -> Result<u16, PacketError> {
    u16::try_from(field.len()).map_err(|_| PacketError::FieldTooLong { len: field.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wire_layout() {
        let mut packet = Packet::give(0x0102, b"hi".to_vec());
        packet.address_data = vec![9];

        let bytes = packet.serialize().unwrap();
        assert_eq!(
            bytes,
            vec![1, PROTOCOL_VERSION, 0x01, 0x02, 0x00, 0x02, 0x00, 0x01, 9, b'h', b'i']
        );
    }

    #[test]
    fn test_short_buffers_rejected() {
        let full = Packet::ping(7).serialize().unwrap();
        assert_eq!(full.len(), HEADER_SIZE);

        for len in 0..HEADER_SIZE {
            assert_eq!(
                Packet::deserialize(&full[..len]),
                Err(PacketError::TooShort { len })
            );
        }
        assert!(Packet::deserialize(&full).is_ok());
    }

    #[test]
    fn test_declared_lengths_exceed_buffer() {
        let mut bytes = Packet::give(1, b"abcd".to_vec()).serialize().unwrap();
        bytes.truncate(bytes.len() - 1);

        assert!(matches!(
            Packet::deserialize(&bytes),
            Err(PacketError::Truncated { needed: 4, remaining: 3 })
        ));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let mut bytes = Packet::ping(0).serialize().unwrap();
        bytes[0] = 8;
        assert_eq!(Packet::deserialize(&bytes), Err(PacketError::UnknownFlag(8)));
    }

    #[test]
    fn test_version_mismatch_parses_but_is_invalid() {
        let mut bytes = Packet::seen(3).serialize().unwrap();
        bytes[1] = PROTOCOL_VERSION + 1;

        let packet = Packet::deserialize(&bytes).unwrap();
        assert!(!packet.is_valid());
        assert_eq!(
            Packet::parse_valid(&bytes),
            Err(PacketError::VersionMismatch {
                got: PROTOCOL_VERSION + 1
            })
        );
    }

    #[test]
    fn test_factory_flags() {
        assert_eq!(Packet::conn(0, b"me").address_data, b"me");
        assert_eq!(Packet::take(4).flag, Flag::Take);
        assert_eq!(Packet::seen(42).sequence, 42);
        assert!(Packet::seen(42).payload.is_empty());
        assert_eq!(Packet::stop(0).flag, Flag::Stop);
        assert_eq!(Packet::frag(3, vec![1]).sequence, 3);
        assert!(Packet::pong(1).payload.is_empty());
        assert_eq!(Packet::give_to(2, vec![1], b"7").address_data, b"7");
    }

    #[test]
    fn test_oversized_field_fails_to_serialize() {
        let packet = Packet::give(0, vec![0; usize::from(u16::MAX) + 1]);
        assert!(matches!(
            packet.serialize(),
            Err(PacketError::FieldTooLong { .. })
        ));
    }

    fn flag_strategy() -> impl Strategy<Value = Flag> {
        (0u8..8).prop_map(|v| Flag::try_from(v).unwrap())
    }

    proptest! {
        #[test]
        fn prop_framing_roundtrip(
            flag in flag_strategy(),
            sequence in any::<u16>(),
            address_data in prop::collection::vec(any::<u8>(), 0..64),
            payload in prop::collection::vec(any::<u8>(), 0..2048),
        ) {
            let packet = Packet { flag, version: PROTOCOL_VERSION, sequence, address_data, payload };
            let bytes = packet.serialize().unwrap();
            prop_assert_eq!(bytes.len(), packet.encoded_len());
            prop_assert_eq!(Packet::deserialize(&bytes).unwrap(), packet);
        }

        #[test]
        fn prop_garbage_never_panics(data in prop::collection::vec(any::<u8>(), 0..128)) {
            let _ = Packet::deserialize(&data);
        }
    }
}
