use std::net::SocketAddr;
use std::time::Instant;

use crate::catalog::{MessageKind, PlayerId};
use crate::message::{self, Argument, Message};
use crate::packet::{Flag, Packet};
use crate::server::ServerEvent;

use super::{Link, PeerRecord, Session};

impl Session {
    pub(super) fn pump_host(&mut self) {
        loop {
            let polled = match self.link.as_mut() {
                Some(Link::Host(server)) => server.poll(),
                _ => return,
            };
            match polled {
                Ok(Some(event)) => self.handle_server_event(event),
                Ok(None) => return,
                Err(e) => {
                    log::warn!("host poll failed: {}", e);
                    return;
                }
            }
        }
    }

    pub(super) fn pump_client(&mut self) {
        let slice = self.config.receive_slice;
        loop {
            let received = match self.link.as_mut() {
                Some(Link::Client(client)) => match client.server_addr() {
                    Some(host) => client.receive(slice).map(|p| p.map(|p| (p, host))),
                    None => return,
                },
                _ => return,
            };
            match received {
                Ok(Some((packet, host))) => {
                    self.host_last_seen = self.clock.now();
                    if packet.flag == Flag::Stop {
                        log::info!("host {} ended the session", host);
                        self.lose_host();
                        return;
                    }
                    if is_content(&packet) {
                        self.route_from_host(&packet.payload, host);
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    log::warn!("receive failed: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        let now = self.clock.now();
        match event {
            ServerEvent::Connected { addr, .. } => {
                log::debug!("transport link from {}", addr);
                if self.roster.get_by_addr(&addr).is_none() {
                    self.unjoined.insert(addr, now);
                }
            }
            ServerEvent::Disconnected { addr, .. } => {
                self.unjoined.remove(&addr);
                self.remove_remote(addr, "disconnected");
            }
            ServerEvent::Alive { addr } => {
                self.touch_remote(&addr, now);
            }
            ServerEvent::Message { packet, addr } => {
                self.touch_remote(&addr, now);
                if is_content(&packet) {
                    self.route_from_client(&packet.payload, addr);
                }
            }
        }
    }

    fn touch_remote(&mut self, addr: &SocketAddr, now: Instant) {
        if !self.roster.touch(addr, now) {
            if let Some(seen) = self.unjoined.get_mut(addr) {
                *seen = now;
            }
        }
    }

    /// Host side router.
    fn route_from_client(&mut self, payload: &[u8], from: SocketAddr) {
        self.packets_received += 1;
        let msg = message::decode(&self.codes, payload);

        match MessageKind::from_tag(&msg.tag) {
            Some(MessageKind::PlayerJoin) => {
                let name = msg.arg(0).unwrap_or_default().to_string();
                let token = msg.arg(1).unwrap_or_default().to_string();
                self.admit(name, token, from);
            }
            Some(MessageKind::PlayerLeave) => {
                self.remove_remote(from, "left");
            }
            Some(MessageKind::PingRequest) => {
                let reply = self.encode(
                    MessageKind::PingResponse,
                    &[msg.arg(0).unwrap_or("0").into()],
                );
                self.send_to(&reply, from);
            }
            Some(MessageKind::PingResponse) => {}
            Some(kind) if kind.is_host_only() => {
                log::warn!("dropping {} from client {}", msg.tag, from);
            }
            Some(kind) => {
                if kind == MessageKind::MapInfo {
                    if let Some(record) = self.roster.get_by_addr_mut(&from) {
                        record.has_map_loaded = true;
                    }
                }
                self.relay(payload, from);
                self.deliver(&msg, from);
            }
            None => self.deliver(&msg, from),
        }
    }

    /// Client side router.
    fn route_from_host(&mut self, payload: &[u8], host: SocketAddr) {
        self.packets_received += 1;
        let msg = message::decode(&self.codes, payload);

        match MessageKind::from_tag(&msg.tag) {
            Some(MessageKind::PlayerJoin) => self.learn_player(&msg),
            Some(MessageKind::PlayerLeave) => {
                let Some(id) = msg.arg_parsed::<PlayerId>(0) else {
                    log::debug!("player leave without id");
                    return;
                };
                if Some(id) == self.local_player_id {
                    return;
                }
                if self.roster.remove(id).is_some() {
                    log::info!("player {} left", id);
                    if let Some(callback) = self.on_player_left.as_mut() {
                        callback(id);
                    }
                }
            }
            Some(MessageKind::PingRequest) => {
                let reply = self.encode(
                    MessageKind::PingResponse,
                    &[msg.arg(0).unwrap_or("0").into()],
                );
                if let Some(Link::Client(client)) = self.link.as_mut() {
                    if let Err(e) = client.send(&reply) {
                        log::debug!("ping response not sent: {}", e);
                    }
                }
            }
            Some(MessageKind::PingResponse) => {
                let ours = msg.arg_parsed::<PlayerId>(0) == self.local_player_id;
                if let (true, Some(sent_at)) = (ours, self.ping_sent_at) {
                    let rtt = self.clock.now().saturating_duration_since(sent_at);
                    log::debug!("rtt to host {:?}", rtt);
                    self.rtt = Some(rtt);
                    self.ping_sent_at = None;
                }
            }
            _ => self.deliver(&msg, host),
        }
    }

    /// `player-join(id, name[, token])` seen by a client: either the reply to
    /// our own join, carrying our token, or another participant.
    fn learn_player(&mut self, msg: &Message) {
        let (Some(id), Some(name)) = (msg.arg_parsed::<PlayerId>(0), msg.arg(1)) else {
            log::debug!("player join without id and name");
            return;
        };
        let now = self.clock.now();

        let ours = msg
            .arg(2)
            .is_some_and(|token| Some(token) == self.join_token.as_deref());
        if ours && self.local_player_id.is_none() {
            self.local_player_id = Some(id);
            self.roster.insert(PeerRecord::new(id, name, now));
            return;
        }
        if Some(id) == self.local_player_id || self.roster.contains(id) {
            return;
        }

        log::info!("player {} ({}) joined", id, name);
        self.roster.insert(PeerRecord::new(id, name, now));
        if let Some(callback) = self.on_player_joined.as_mut() {
            callback(id, name);
        }
    }

    /// Assigns an id to a joining client, replies to it with its own token,
    /// sends it the existing roster and announces it to the other joined
    /// participants.
    fn admit(&mut self, name: String, token: String, from: SocketAddr) {
        if let Some(record) = self.roster.get_by_addr(&from) {
            let reply = self.encode_reply(record.player_id, &name, &token);
            log::debug!("repeated join from {}", from);
            self.send_to(&reply, from);
            return;
        }
        self.unjoined.remove(&from);

        let id = self.allocate_player_id();
        let reply = self.encode_reply(id, &name, &token);
        self.send_to(&reply, from);

        let existing: Vec<Vec<u8>> = self
            .roster
            .iter()
            .map(|record| self.encode_join(record.player_id, &record.display_name))
            .collect();
        for data in &existing {
            self.send_to(data, from);
        }

        self.roster
            .insert(PeerRecord::new(id, name.as_str(), self.clock.now()).at(from));
        let announcement = self.encode_join(id, &name);
        self.relay(&announcement, from);

        log::info!("player {} ({}) joined from {}", id, name, from);
        if let Some(callback) = self.on_player_joined.as_mut() {
            callback(id, &name);
        }
    }

    /// Drops a remote participant on the host and tells the others.
    pub(super) fn remove_remote(&mut self, addr: SocketAddr, reason: &str) {
        if let Some(Link::Host(server)) = self.link.as_mut() {
            server.remove_peer(&addr);
        }
        self.unjoined.remove(&addr);
        let Some(record) = self.roster.remove_by_addr(&addr) else {
            return;
        };

        log::info!(
            "player {} ({}) {}",
            record.player_id,
            record.display_name,
            reason
        );
        let notice = self.encode(MessageKind::PlayerLeave, &[record.player_id.into()]);
        self.relay(&notice, addr);

        if let Some(callback) = self.on_player_left.as_mut() {
            callback(record.player_id);
        }
    }

    fn deliver(&mut self, msg: &Message, from: SocketAddr) {
        if let Some(callback) = self.on_message.as_mut() {
            callback(msg, from);
        }
    }

    fn encode(&self, kind: MessageKind, args: &[Argument]) -> Vec<u8> {
        message::encode(&self.codes, kind.tag(), args)
    }

    fn encode_join(&self, id: PlayerId, name: &str) -> Vec<u8> {
        self.encode(MessageKind::PlayerJoin, &[id.into(), name.into()])
    }

    fn encode_reply(&self, id: PlayerId, name: &str, token: &str) -> Vec<u8> {
        if token.is_empty() {
            return self.encode_join(id, name);
        }
        self.encode(
            MessageKind::PlayerJoin,
            &[id.into(), name.into(), token.into()],
        )
    }

    fn send_to(&mut self, data: &[u8], addr: SocketAddr) {
        if let Some(Link::Host(server)) = self.link.as_mut() {
            if let Err(e) = server.send_to(data, addr) {
                log::warn!("send to {} failed: {}", addr, e);
            }
        }
    }

    /// Forwards to every joined client except the originator. Transport
    /// peers still between CONN and player-join get nothing.
    fn relay(&mut self, data: &[u8], origin: SocketAddr) {
        let targets = self.joined_addrs(Some(origin));
        if let Some(Link::Host(server)) = self.link.as_mut() {
            if let Err(e) = server.broadcast_to(data, &targets) {
                log::warn!("relay from {} failed: {}", origin, e);
            }
        }
    }
}

fn is_content(packet: &Packet) -> bool {
    matches!(packet.flag, Flag::Give | Flag::Take)
}
