use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::EndpointConfig;
use crate::error::{NetError, Result};
use crate::frag::FragmentAssembler;
use crate::packet::{Flag, Packet, SAFE_PAYLOAD_SIZE};
use crate::stats::NetworkStats;
use crate::transport::UdpTransport;

#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub addr: SocketAddr,
    pub identity: Vec<u8>,
    pub connected_at: Instant,
    pub last_seen: Instant,
}

impl PeerConnection {
    fn new(addr: SocketAddr, identity: Vec<u8>) -> Self {
        let now = Instant::now();
        Self {
            addr,
            identity,
            connected_at: now,
            last_seen: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected { addr: SocketAddr, identity: Vec<u8> },
    Disconnected { addr: SocketAddr, known: bool },
    /// A liveness-only packet (PING, PONG, SEEN) or a partial fragment.
    Alive { addr: SocketAddr },
    Message { packet: Packet, addr: SocketAddr },
}

impl ServerEvent {
    pub fn addr(&self) -> SocketAddr {
        match self {
            ServerEvent::Connected { addr, .. }
            | ServerEvent::Disconnected { addr, .. }
            | ServerEvent::Alive { addr }
            | ServerEvent::Message { addr, .. } => *addr,
        }
    }
}

/// Server side of HERO: answers control packets itself and hands content
/// packets to the caller.
pub struct ServerEndpoint {
    transport: UdpTransport,
    peers: HashMap<SocketAddr, PeerConnection>,
    assembler: FragmentAssembler,
    config: EndpointConfig,
}

impl ServerEndpoint {
    pub fn bind(addr: SocketAddr, config: EndpointConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addr)?;
        log::debug!("server endpoint bound to {}", transport.local_addr());

        Ok(Self {
            transport,
            peers: HashMap::new(),
            assembler: FragmentAssembler::with_timeout(config.fragment_timeout),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn stats(&self) -> &NetworkStats {
        self.transport.stats()
    }

    pub fn peer(&self, addr: &SocketAddr) -> Option<&PeerConnection> {
        self.peers.get(addr)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn remove_peer(&mut self, addr: &SocketAddr) -> Option<PeerConnection> {
        self.assembler.forget_peer(*addr);
        self.peers.remove(addr)
    }

    fn touch(&mut self, addr: &SocketAddr) {
        match self.peers.get_mut(addr) {
            Some(peer) => peer.touch(),
            None => log::debug!("{}", NetError::UnknownPeer(*addr)),
        }
    }

    /// Control replies are best effort; the event they answer is still
    /// reported when one cannot be sent.
    fn reply(&mut self, packet: &Packet, addr: SocketAddr) {
        if let Err(e) = self.transport.send_packet(packet, addr) {
            log::warn!("{:?} to {} not sent: {}", packet.flag, addr, e);
        }
    }

    /// One non-blocking receive. `None` means nothing was waiting.
    pub fn poll(&mut self) -> Result<Option<ServerEvent>> {
        self.assembler.cleanup_stale(self.config.fragment_timeout);

        let Some((packet, addr)) = self.transport.recv_packet()? else {
            return Ok(None);
        };

        let event = match packet.flag {
            Flag::Conn => {
                let identity = packet.address_data.clone();
                if self.peers.contains_key(&addr) {
                    log::debug!("peer {} reconnected", addr);
                }
                self.peers
                    .insert(addr, PeerConnection::new(addr, identity.clone()));
                self.reply(&Packet::seen(packet.sequence), addr);
                ServerEvent::Connected { addr, identity }
            }
            Flag::Stop => {
                let known = self.remove_peer(&addr).is_some();
                self.reply(&Packet::seen(packet.sequence), addr);
                ServerEvent::Disconnected { addr, known }
            }
            Flag::Ping => {
                self.touch(&addr);
                self.reply(&Packet::pong(packet.sequence), addr);
                ServerEvent::Alive { addr }
            }
            Flag::Seen | Flag::Pong => {
                self.touch(&addr);
                ServerEvent::Alive { addr }
            }
            Flag::Frag => {
                self.touch(&addr);
                match self.assembler.add_fragment(&packet, addr) {
                    // acknowledged once for the whole message
                    Some(done) => {
                        self.reply(&Packet::seen(done.message_id), addr);
                        ServerEvent::Message {
                            packet: done.into_packet(),
                            addr,
                        }
                    }
                    None => ServerEvent::Alive { addr },
                }
            }
            Flag::Give | Flag::Take => {
                self.touch(&addr);
                self.reply(&Packet::seen(packet.sequence), addr);
                ServerEvent::Message { packet, addr }
            }
        };

        Ok(Some(event))
    }

    /// [`poll`](Self::poll) that hands content packets to `handler`. Returns
    /// whether anything was received.
    pub fn poll_with<F>(&mut self, mut handler: F) -> Result<bool>
    where
        F: FnMut(&Packet, SocketAddr),
    {
        match self.poll()? {
            Some(ServerEvent::Message { packet, addr }) => {
                handler(&packet, addr);
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    fn packets_for(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        if data.len() > SAFE_PAYLOAD_SIZE {
            self.assembler.fragment(data, Flag::Give)
        } else {
            Ok(vec![Packet::give(0, data.to_vec())])
        }
    }

    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        for packet in self.packets_for(data)? {
            self.transport.send_packet(&packet, addr)?;
        }
        Ok(())
    }

    pub fn broadcast(&mut self, data: &[u8]) -> Result<usize> {
        self.broadcast_filtered(data, |_| true)
    }

    pub fn broadcast_except(&mut self, data: &[u8], except: SocketAddr) -> Result<usize> {
        self.broadcast_filtered(data, |addr| addr != except)
    }

    /// Sends to the listed addresses that are connected peers.
    pub fn broadcast_to(&mut self, data: &[u8], targets: &[SocketAddr]) -> Result<usize> {
        self.broadcast_filtered(data, |addr| targets.contains(&addr))
    }

    /// Sends to every peer accepted by `filter`. A failed send to one peer
    /// does not stop the rest. Returns how many peers were sent to.
    fn broadcast_filtered<F>(&mut self, data: &[u8], filter: F) -> Result<usize>
    where
        F: Fn(SocketAddr) -> bool,
    {
        let packets = self.packets_for(data)?;
        let targets: Vec<SocketAddr> = self
            .peers
            .keys()
            .copied()
            .filter(|addr| filter(*addr))
            .collect();

        let mut delivered = 0;
        for addr in targets {
            let sent = packets
                .iter()
                .try_for_each(|packet| self.transport.send_packet(packet, addr).map(|_| ()));
            match sent {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!("broadcast to {} failed: {}", addr, e),
            }
        }
        Ok(delivered)
    }

    /// Best-effort STOP to `addr`, then forgets it.
    pub fn disconnect_peer(&mut self, addr: &SocketAddr) -> Option<PeerConnection> {
        if let Err(e) = self.transport.send_packet(&Packet::stop(0), *addr) {
            log::debug!("stop to {} not sent: {}", addr, e);
        }
        self.remove_peer(addr)
    }

    pub fn shutdown(&mut self) {
        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            self.disconnect_peer(&addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn server() -> ServerEndpoint {
        ServerEndpoint::bind("127.0.0.1:0".parse().unwrap(), EndpointConfig::default()).unwrap()
    }

    fn wait_for_event(server: &mut ServerEndpoint) -> Option<ServerEvent> {
        for _ in 0..500 {
            if let Some(event) = server.poll().unwrap() {
                return Some(event);
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    fn wait_for_reply(socket: &mut UdpTransport) -> Option<Packet> {
        for _ in 0..500 {
            if let Some((packet, _)) = socket.recv_packet().unwrap() {
                return Some(packet);
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_conn_registers_and_acks() {
        let mut server = server();
        let mut raw = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        raw.send_packet(&Packet::conn(5, b"bob"), server.local_addr()).unwrap();

        let event = wait_for_event(&mut server).unwrap();
        assert_eq!(
            event,
            ServerEvent::Connected {
                addr: raw.local_addr(),
                identity: b"bob".to_vec()
            }
        );
        assert_eq!(server.peer_count(), 1);
        assert_eq!(wait_for_reply(&mut raw).unwrap(), Packet::seen(5));
    }

    #[test]
    fn test_stop_from_unknown_peer_is_tolerated() {
        let mut server = server();
        let mut raw = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        raw.send_packet(&Packet::stop(2), server.local_addr()).unwrap();

        let event = wait_for_event(&mut server).unwrap();
        assert_eq!(
            event,
            ServerEvent::Disconnected {
                addr: raw.local_addr(),
                known: false
            }
        );
        assert_eq!(wait_for_reply(&mut raw).unwrap(), Packet::seen(2));
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let mut server = server();
        let mut raw = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        raw.send_packet(&Packet::ping(11), server.local_addr()).unwrap();

        assert!(matches!(
            wait_for_event(&mut server),
            Some(ServerEvent::Alive { .. })
        ));
        assert_eq!(wait_for_reply(&mut raw).unwrap(), Packet::pong(11));
    }

    #[test]
    fn test_seen_is_not_acknowledged() {
        let mut server = server();
        let mut raw = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        raw.send_packet(&Packet::seen(1), server.local_addr()).unwrap();
        assert!(wait_for_event(&mut server).is_some());

        thread::sleep(Duration::from_millis(20));
        assert!(raw.recv_packet().unwrap().is_none());
    }

    #[test]
    fn test_failed_reply_is_counted_not_raised() {
        let mut server = server();
        let unreachable: SocketAddr = "[::1]:9".parse().unwrap();

        server.reply(&Packet::seen(4), unreachable);

        assert_eq!(server.stats().send_errors, 1);
        assert_eq!(server.stats().packets_sent, 0);
    }

    #[test]
    fn test_stop_reported_after_its_ack() {
        let mut server = server();
        let mut raw = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        raw.send_packet(&Packet::conn(1, b"bob"), server.local_addr()).unwrap();
        wait_for_event(&mut server).unwrap();
        wait_for_reply(&mut raw).unwrap();

        raw.send_packet(&Packet::stop(2), server.local_addr()).unwrap();
        drop(raw);

        assert!(matches!(
            wait_for_event(&mut server),
            Some(ServerEvent::Disconnected { known: true, .. })
        ));
        assert_eq!(server.peer_count(), 0);
    }

    #[test]
    fn test_broadcast_to_only_listed_peers() {
        let mut server = server();
        let mut listed = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut other = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        for (seq, raw) in [(1, &mut listed), (2, &mut other)] {
            raw.send_packet(&Packet::conn(seq, b"x"), server.local_addr()).unwrap();
            wait_for_event(&mut server).unwrap();
        }
        wait_for_reply(&mut listed).unwrap();
        wait_for_reply(&mut other).unwrap();

        let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let reached = server
            .broadcast_to(b"news", &[listed.local_addr(), stranger])
            .unwrap();

        assert_eq!(reached, 1);
        assert_eq!(wait_for_reply(&mut listed).unwrap().payload, b"news");
        thread::sleep(Duration::from_millis(20));
        assert!(other.recv_packet().unwrap().is_none());

        assert_eq!(server.broadcast(b"all").unwrap(), 2);
        assert_eq!(wait_for_reply(&mut other).unwrap().payload, b"all");
    }

    #[test]
    fn test_poll_with_hands_over_content() {
        let mut server = server();
        let mut raw = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        raw.send_packet(&Packet::give(3, b"data".to_vec()), server.local_addr())
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..500 {
            if server
                .poll_with(|packet, from| seen.push((packet.payload.clone(), from)))
                .unwrap()
            {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(seen, vec![(b"data".to_vec(), raw.local_addr())]);
        assert_eq!(wait_for_reply(&mut raw).unwrap(), Packet::seen(3));
    }
}
