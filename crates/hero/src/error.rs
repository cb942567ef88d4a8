use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::packet::PacketError;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] PacketError),

    #[error("handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),

    #[error("no player id assigned by {0}")]
    IdentityAssignmentTimeout(SocketAddr),

    #[error("unknown peer {0}")]
    UnknownPeer(SocketAddr),

    #[error("not connected")]
    NotConnected,

    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },
}
