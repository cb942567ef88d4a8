use std::collections::VecDeque;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::EndpointConfig;
use crate::error::{NetError, Result};
use crate::frag::FragmentAssembler;
use crate::packet::{Flag, Packet, SAFE_PAYLOAD_SIZE};
use crate::stats::NetworkStats;
use crate::transport::UdpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client side of a HERO connection: one outbound link to a server.
///
/// Every content packet received is acknowledged with SEEN before it is
/// handed to the caller. Nothing is retransmitted when a SEEN goes missing.
pub struct ClientEndpoint {
    transport: Option<UdpTransport>,
    server_addr: Option<SocketAddr>,
    state: ConnectionState,
    send_sequence: u16,
    assembler: FragmentAssembler,
    inbox: VecDeque<Packet>,
    pending_ping: Option<(u16, Instant)>,
    rtt: Option<Duration>,
    last_receive: Instant,
    config: EndpointConfig,
}

impl ClientEndpoint {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            transport: None,
            server_addr: None,
            state: ConnectionState::Disconnected,
            send_sequence: 0,
            assembler: FragmentAssembler::with_timeout(config.fragment_timeout),
            inbox: VecDeque::new(),
            pending_ping: None,
            rtt: None,
            last_receive: Instant::now(),
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(UdpTransport::local_addr)
    }

    pub fn stats(&self) -> Option<&NetworkStats> {
        self.transport.as_ref().map(UdpTransport::stats)
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn since_last_receive(&self) -> Duration {
        self.last_receive.elapsed()
    }

    fn next_sequence(&mut self) -> u16 {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        sequence
    }

    /// Sends CONN and waits for the server's SEEN of that sequence number.
    pub fn connect(&mut self, addr: SocketAddr, identity: &[u8]) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            self.disconnect();
        }

        let mut transport = UdpTransport::bind_for(addr)?;
        let sequence = self.next_sequence();
        self.state = ConnectionState::Connecting;

        if let Err(e) = transport.send_packet(&Packet::conn(sequence, identity), addr) {
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }

        let deadline = Instant::now() + self.config.connect_timeout;
        while Instant::now() < deadline {
            let received = transport.recv_packet().inspect_err(|_| {
                self.state = ConnectionState::Disconnected;
            })?;
            let Some((packet, from)) = received else {
                thread::sleep(self.config.poll_interval);
                continue;
            };
            if from == addr && packet.flag == Flag::Seen && packet.sequence == sequence {
                log::debug!("connected to {} from {}", addr, transport.local_addr());
                self.transport = Some(transport);
                self.server_addr = Some(addr);
                self.state = ConnectionState::Connected;
                self.last_receive = Instant::now();
                return Ok(());
            }
        }

        self.state = ConnectionState::Disconnected;
        Err(NetError::HandshakeTimeout(addr))
    }

    /// Fire-and-forget send. Payloads above the safe size go out as FRAG
    /// packets.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(NetError::NotConnected);
        }

        let packets = if data.len() > SAFE_PAYLOAD_SIZE {
            self.assembler.fragment(data, Flag::Give)?
        } else {
            let sequence = self.next_sequence();
            vec![Packet::give(sequence, data.to_vec())]
        };

        let (transport, addr) = self.link()?;
        for packet in &packets {
            transport.send_packet(packet, addr)?;
        }
        Ok(())
    }

    fn link(&mut self) -> Result<(&mut UdpTransport, SocketAddr)> {
        match (self.transport.as_mut(), self.server_addr) {
            (Some(transport), Some(addr)) => Ok((transport, addr)),
            _ => Err(NetError::NotConnected),
        }
    }

    /// Waits up to `timeout` for the next content packet from the server.
    /// A zero timeout makes a single non-blocking attempt.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        if let Some(packet) = self.inbox.pop_front() {
            return Ok(Some(packet));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(packet) = self.poll_once()? {
                return Ok(Some(packet));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    fn poll_once(&mut self) -> Result<Option<Packet>> {
        let (Some(transport), Some(server)) = (self.transport.as_mut(), self.server_addr) else {
            return Err(NetError::NotConnected);
        };

        while let Some((packet, from)) = transport.recv_packet()? {
            if from != server {
                log::debug!("ignoring {:?} from stranger {}", packet.flag, from);
                continue;
            }
            self.last_receive = Instant::now();

            match packet.flag {
                Flag::Frag => {
                    if let Some(done) = self.assembler.add_fragment(&packet, from) {
                        transport.send_packet(&Packet::seen(done.message_id), server)?;
                        return Ok(Some(done.into_packet()));
                    }
                }
                Flag::Seen => {}
                Flag::Pong => {
                    if let Some((sequence, sent_at)) = self.pending_ping {
                        if sequence == packet.sequence {
                            let rtt = sent_at.elapsed();
                            self.rtt = Some(rtt);
                            transport.stats_mut().rtt = Some(rtt);
                            self.pending_ping = None;
                        }
                    }
                }
                Flag::Ping => {
                    transport.send_packet(&Packet::pong(packet.sequence), server)?;
                }
                Flag::Stop => {
                    transport.send_packet(&Packet::seen(packet.sequence), server)?;
                    log::info!("server {} closed the connection", server);
                    self.state = ConnectionState::Disconnected;
                    return Ok(Some(packet));
                }
                Flag::Conn | Flag::Give | Flag::Take => {
                    transport.send_packet(&Packet::seen(packet.sequence), server)?;
                    return Ok(Some(packet));
                }
            }
        }

        self.assembler.cleanup_stale(self.config.fragment_timeout);
        Ok(None)
    }

    /// Non-blocking ping; the PONG is picked up by later receives.
    pub fn send_ping(&mut self) -> Result<()> {
        let sequence = self.next_sequence();
        let (transport, addr) = self.link()?;
        transport.send_packet(&Packet::ping(sequence), addr)?;
        self.pending_ping = Some((sequence, Instant::now()));
        Ok(())
    }

    /// Sends PING and waits for the PONG. Returns `None` when none arrived
    /// within the ping timeout. Content packets seen meanwhile stay queued
    /// for [`receive`](Self::receive).
    pub fn ping(&mut self) -> Result<Option<Duration>> {
        self.send_ping()?;

        let deadline = Instant::now() + self.config.ping_timeout;
        while Instant::now() < deadline {
            if let Some(packet) = self.poll_once()? {
                self.inbox.push_back(packet);
            }
            if self.pending_ping.is_none() {
                return Ok(self.rtt);
            }
            thread::sleep(self.config.poll_interval);
        }

        log::warn!("no pong within {:?}", self.config.ping_timeout);
        self.pending_ping = None;
        Ok(None)
    }

    /// Pings when the link has been silent longer than the keepalive interval.
    pub fn keep_alive(&mut self) -> Result<Option<Duration>> {
        if self.last_receive.elapsed() <= self.config.keepalive_interval {
            return Ok(None);
        }
        self.ping()
    }

    /// Best-effort STOP; always ends up disconnected.
    pub fn disconnect(&mut self) {
        if self.is_connected() {
            let sequence = self.next_sequence();
            if let Ok((transport, addr)) = self.link() {
                if let Err(e) = transport.send_packet(&Packet::stop(sequence), addr) {
                    log::debug!("stop to {} not sent: {}", addr, e);
                }
            }
        }

        self.transport = None;
        self.server_addr = None;
        self.state = ConnectionState::Disconnected;
        self.inbox.clear();
        self.pending_ping = None;
        self.assembler = FragmentAssembler::with_timeout(self.config.fragment_timeout);
    }
}

impl Drop for ClientEndpoint {
    fn drop(&mut self) {
        self.disconnect();
    }
}
