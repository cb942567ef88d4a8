pub mod bytes;
pub mod catalog;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod frag;
pub mod message;
pub mod packet;
pub mod server;
pub mod session;
pub mod stats;
pub mod transport;

pub use bytes::{ByteReader, ByteWriter};
pub use catalog::{MessageKind, PlayerId, PlayerState, ShotFired};
pub use client::{ClientEndpoint, ConnectionState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EndpointConfig, SessionConfig};
pub use error::{NetError, Result};
pub use frag::{FRAGMENT_CHUNK_SIZE, FRAGMENT_HEADER_SIZE, FragmentAssembler, Reassembled};
pub use message::{Argument, CodeTable, Message};
pub use packet::{
    Flag, HEADER_SIZE, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION, Packet, PacketError,
    SAFE_PAYLOAD_SIZE,
};
pub use server::{PeerConnection, ServerEndpoint, ServerEvent};
pub use session::{PeerRecord, Role, Roster, Session};
pub use stats::NetworkStats;
pub use transport::UdpTransport;

pub const DEFAULT_PORT: u16 = 9001;
