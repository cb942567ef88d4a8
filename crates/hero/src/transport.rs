use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use crate::error::{NetError, Result};
use crate::packet::{MAX_DATAGRAM_SIZE, Packet};
use crate::stats::NetworkStats;

const RECV_BUFFER_SIZE: usize = 65536;

/// Non-blocking UDP socket. No operation here ever waits for the network.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: Vec<u8>,
    stats: NetworkStats,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|source| NetError::Bind { addr, source })?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE],
            stats: NetworkStats::default(),
        })
    }

    /// Binds an ephemeral port on the unspecified address of `remote`'s family.
    pub fn bind_for(remote: SocketAddr) -> Result<Self> {
        let local = match remote {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        Self::bind(local)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut NetworkStats {
        &mut self.stats
    }

    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(NetError::MessageTooLarge {
                len: data.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        match self.socket.send_to(data, addr) {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;
                Ok(bytes)
            }
            Err(e) => {
                self.stats.send_errors += 1;
                Err(e.into())
            }
        }
    }

    pub fn send_packet(&mut self, packet: &Packet, addr: SocketAddr) -> Result<usize> {
        let data = packet.serialize()?;
        self.send_to(&data, addr)
    }

    /// One non-blocking receive attempt.
    pub fn recv(&mut self) -> Result<Option<(&[u8], SocketAddr)>> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((size, addr)) => {
                self.stats.bytes_received += size as u64;
                Ok(Some((&self.recv_buffer[..size], addr)))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from an earlier send surfaces here on
            // some platforms
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Receives the next well-formed packet, discarding anything that does
    /// not parse or carries a foreign protocol version.
    pub fn recv_packet(&mut self) -> Result<Option<(Packet, SocketAddr)>> {
        loop {
            let parsed = match self.recv()? {
                Some((data, addr)) => (Packet::parse_valid(data), addr),
                None => return Ok(None),
            };

            match parsed {
                (Ok(packet), addr) => {
                    self.stats.packets_received += 1;
                    return Ok(Some((packet, addr)));
                }
                (Err(e), addr) => {
                    self.stats.packets_dropped += 1;
                    log::debug!("dropping datagram from {}: {}", addr, e);
                }
            }
        }
    }
}
