//! Host-authoritative session layer on top of the HERO endpoints.
//!
//! One [`Session`] per process acts either as the host (server endpoint,
//! assigns player ids, relays everything) or as a client (one link to the
//! host). All network work happens inside [`Session::update`] and the
//! blocking [`Session::join_game`]; callbacks run synchronously on that
//! thread and must not call back into the session.

mod roster;
mod router;

pub use roster::{PeerRecord, Roster};

use std::collections::hash_map::RandomState;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hasher};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use glam::Vec3;

use crate::catalog::{MessageKind, PlayerId, PlayerState, ShotFired};
use crate::client::ClientEndpoint;
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::error::NetError;
use crate::message::{self, Argument, CodeTable, Message};
use crate::server::ServerEndpoint;
use crate::stats::NetworkStats;

pub type MessageCallback = Box<dyn FnMut(&Message, SocketAddr) + Send>;
pub type PlayerJoinedCallback = Box<dyn FnMut(PlayerId, &str) + Send>;
pub type PlayerLeftCallback = Box<dyn FnMut(PlayerId) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

enum Link {
    Host(ServerEndpoint),
    Client(ClientEndpoint),
}

pub struct Session {
    link: Option<Link>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    codes: CodeTable,
    roster: Roster,
    /// Host only: transport peers that have not sent player-join yet.
    unjoined: HashMap<SocketAddr, Instant>,
    join_token: Option<String>,
    local_player_id: Option<PlayerId>,
    local_name: String,
    next_player_id: PlayerId,
    packets_sent: u64,
    packets_received: u64,
    ping_timer: Duration,
    ping_sent_at: Option<Instant>,
    rtt: Option<Duration>,
    host_last_seen: Instant,
    on_message: Option<MessageCallback>,
    on_player_joined: Option<PlayerJoinedCallback>,
    on_player_left: Option<PlayerLeftCallback>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            link: None,
            config,
            clock,
            codes: CodeTable::with_defaults(),
            roster: Roster::new(),
            unjoined: HashMap::new(),
            join_token: None,
            local_player_id: None,
            local_name: String::new(),
            next_player_id: 1,
            packets_sent: 0,
            packets_received: 0,
            ping_timer: Duration::ZERO,
            ping_sent_at: None,
            rtt: None,
            host_last_seen: now,
            on_message: None,
            on_player_joined: None,
            on_player_left: None,
        }
    }

    pub fn set_message_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&Message, SocketAddr) + Send + 'static,
    {
        self.on_message = Some(Box::new(callback));
    }

    pub fn set_player_joined_callback<F>(&mut self, callback: F)
    where
        F: FnMut(PlayerId, &str) + Send + 'static,
    {
        self.on_player_joined = Some(Box::new(callback));
    }

    pub fn set_player_left_callback<F>(&mut self, callback: F)
    where
        F: FnMut(PlayerId) + Send + 'static,
    {
        self.on_player_left = Some(Box::new(callback));
    }

    /// Registers an extra short code for messages this session sends and
    /// receives.
    pub fn register_code(&mut self, tag: &str, code: &str) {
        self.codes.register(tag, code);
    }

    fn reset(&mut self, name: &str) {
        self.roster.clear();
        self.unjoined.clear();
        self.join_token = None;
        self.local_player_id = None;
        self.local_name = name.to_string();
        self.next_player_id = 1;
        self.ping_timer = Duration::ZERO;
        self.ping_sent_at = None;
        self.rtt = None;
        self.host_last_seen = self.clock.now();
    }

    fn allocate_player_id(&mut self) -> PlayerId {
        let id = self.next_player_id;
        self.next_player_id += 1;
        id
    }

    /// Binds the server endpoint on every interface and takes player id 1.
    pub fn host_game(&mut self, port: u16, name: &str) -> bool {
        if self.link.is_some() {
            log::warn!("already in a session, leaving it first");
            self.disconnect();
        }

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let server = match ServerEndpoint::bind(addr, self.config.endpoint.clone()) {
            Ok(server) => server,
            Err(e) => {
                log::error!("failed to host on port {}: {}", port, e);
                return false;
            }
        };

        self.reset(name);
        let id = self.allocate_player_id();
        let mut record = PeerRecord::new(id, name, self.clock.now());
        record.has_map_loaded = true;
        self.roster.insert(record);
        self.local_player_id = Some(id);

        log::info!(
            "hosting on {} as {} (player {})",
            server.local_addr(),
            name,
            id
        );
        self.link = Some(Link::Host(server));
        true
    }

    /// Connects to the host, announces `name` and waits for the host to
    /// assign a player id. Blocks for at most the connect timeout plus the
    /// join polling budget.
    pub fn join_game(&mut self, host: &str, port: u16, name: &str) -> bool {
        if self.link.is_some() {
            log::warn!("already in a session, leaving it first");
            self.disconnect();
        }

        let addr = match resolve(host, port) {
            Some(addr) => addr,
            None => {
                log::error!("cannot resolve {}:{}", host, port);
                return false;
            }
        };

        let mut client = ClientEndpoint::new(self.config.endpoint.clone());
        if let Err(e) = client.connect(addr, name.as_bytes()) {
            log::error!("failed to connect to {}: {}", addr, e);
            return false;
        }

        self.reset(name);
        self.link = Some(Link::Client(client));

        // the host echoes the token in its reply, so only that reply is ours
        let token = join_token();
        self.join_token = Some(token.clone());
        if !self.send_message(MessageKind::PlayerJoin.tag(), &[name.into(), token.into()]) {
            self.disconnect();
            return false;
        }

        for _ in 0..self.config.join_attempts {
            self.pump_client();
            if let Some(id) = self.local_player_id {
                log::info!("joined {} as {} (player {})", addr, name, id);
                return true;
            }
            if self.link.is_none() {
                return false;
            }
            thread::sleep(self.config.join_poll_interval);
        }

        log::warn!("{}", NetError::IdentityAssignmentTimeout(addr));
        self.disconnect();
        false
    }

    /// Leaves the session. A host tells every client with STOP; a client
    /// tells the host. Local state is always cleared.
    pub fn disconnect(&mut self) {
        match self.link.take() {
            Some(Link::Host(mut server)) => {
                server.shutdown();
                log::info!("stopped hosting");
            }
            Some(Link::Client(mut client)) => {
                client.disconnect();
                log::info!("left the session");
            }
            None => return,
        }

        self.roster.clear();
        self.unjoined.clear();
        self.join_token = None;
        self.local_player_id = None;
        self.ping_sent_at = None;
    }

    /// Single scheduling point: keepalive, draining the endpoint, then the
    /// liveness sweep. `dt` is the time since the previous call in seconds.
    pub fn update(&mut self, dt: f32) {
        if self.link.is_none() {
            return;
        }

        self.ping_timer += Duration::try_from_secs_f32(dt).unwrap_or_default();
        if self.ping_timer >= self.config.ping_interval {
            self.ping_timer = Duration::ZERO;
            self.request_ping();
        }

        match self.role() {
            Some(Role::Host) => {
                self.pump_host();
                self.evict_stale_peers();
            }
            Some(Role::Client) => {
                self.pump_client();
                self.check_host_alive();
            }
            None => {}
        }
    }

    fn evict_stale_peers(&mut self) {
        let now = self.clock.now();
        for addr in self.roster.timed_out(now, self.config.peer_timeout) {
            self.remove_remote(addr, "timed out");
        }

        let timeout = self.config.peer_timeout;
        let never_joined: Vec<SocketAddr> = self
            .unjoined
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in never_joined {
            self.unjoined.remove(&addr);
            if let Some(Link::Host(server)) = self.link.as_mut() {
                server.disconnect_peer(&addr);
            }
            log::info!("dropped {}: connected but never joined", addr);
        }
    }

    fn check_host_alive(&mut self) {
        let silent = self
            .clock
            .now()
            .saturating_duration_since(self.host_last_seen);
        if silent > self.config.peer_timeout {
            log::warn!("no word from the host for {:?}", silent);
            self.lose_host();
        }
    }

    /// Client side: the host is gone, so is everyone else.
    fn lose_host(&mut self) {
        let local = self.local_player_id;
        let departed: Vec<PlayerId> = self
            .roster
            .ids()
            .into_iter()
            .filter(|id| Some(*id) != local)
            .collect();

        self.disconnect();

        if let Some(callback) = self.on_player_left.as_mut() {
            for id in departed {
                callback(id);
            }
        }
    }

    /// Encodes and sends one application message. A host sends to every
    /// client, a client sends to the host.
    pub fn send_message(&mut self, tag: &str, args: &[Argument]) -> bool {
        let kind = MessageKind::from_tag(tag);
        if kind.is_some_and(MessageKind::is_host_only) && !self.is_host() {
            log::warn!("only the host may send {}", tag);
            return false;
        }

        if let Some(arg) = args.iter().find(|arg| !arg.is_encodable()) {
            log::warn!(
                "not sending {}: argument {:?} holds a delimiter",
                tag,
                arg.to_string()
            );
            return false;
        }

        let data = message::encode(&self.codes, tag, args);
        let joined = self.joined_addrs(None);
        let sent = match self.link.as_mut() {
            Some(Link::Host(server)) => server.broadcast_to(&data, &joined).map(|_| ()),
            Some(Link::Client(client)) => client.send(&data),
            None => Err(NetError::NotConnected),
        };

        match sent {
            Ok(()) => {
                self.packets_sent += 1;
                true
            }
            Err(e) => {
                log::warn!("failed to send {}: {}", tag, e);
                false
            }
        }
    }

    /// Addresses of remote participants that completed the join.
    fn joined_addrs(&self, except: Option<SocketAddr>) -> Vec<SocketAddr> {
        self.roster
            .iter()
            .filter_map(|record| record.address)
            .filter(|addr| Some(*addr) != except)
            .collect()
    }

    fn local_id_arg(&self) -> Argument {
        self.local_player_id.unwrap_or(0).into()
    }

    pub fn send_player_state(&mut self, state: &PlayerState) -> bool {
        self.send_message(MessageKind::PlayerState.tag(), &state.to_args())
    }

    pub fn send_chat_message(&mut self, text: &str) -> bool {
        let args = [self.local_id_arg(), text.into()];
        self.send_message(MessageKind::Chat.tag(), &args)
    }

    pub fn send_game_start(&mut self, map_name: &str) -> bool {
        self.send_message(MessageKind::GameStart.tag(), &[map_name.into()])
    }

    pub fn send_game_end(&mut self, winner_name: &str) -> bool {
        self.send_message(MessageKind::GameEnd.tag(), &[winner_name.into()])
    }

    pub fn send_player_spawn(&mut self, position: Vec3) -> bool {
        let args = [
            self.local_id_arg(),
            position.x.into(),
            position.y.into(),
            position.z.into(),
        ];
        self.send_message(MessageKind::PlayerSpawn.tag(), &args)
    }

    pub fn send_player_shoot(&mut self, shot: &ShotFired) -> bool {
        self.send_message(MessageKind::PlayerShoot.tag(), &shot.to_args())
    }

    pub fn send_player_hit(&mut self, victim: PlayerId, damage: i32) -> bool {
        let args = [self.local_id_arg(), victim.into(), damage.into()];
        self.send_message(MessageKind::PlayerHit.tag(), &args)
    }

    pub fn send_player_death(&mut self, killer: PlayerId) -> bool {
        let args = [self.local_id_arg(), killer.into()];
        self.send_message(MessageKind::PlayerDeath.tag(), &args)
    }

    /// Announces the loaded map and marks the local participant ready.
    pub fn send_map_info(&mut self, map_name: &str, map_hash: &str) -> bool {
        if let Some(record) = self
            .local_player_id
            .and_then(|id| self.roster.get_mut(id))
        {
            record.has_map_loaded = true;
        }
        self.send_message(
            MessageKind::MapInfo.tag(),
            &[map_name.into(), map_hash.into()],
        )
    }

    /// Sends a ping request; the matching response sets [`rtt`](Self::rtt).
    pub fn request_ping(&mut self) -> bool {
        let args = [self.local_id_arg()];
        let sent = self.send_message(MessageKind::PingRequest.tag(), &args);
        if sent {
            self.ping_sent_at = Some(self.clock.now());
        }
        sent
    }

    pub fn role(&self) -> Option<Role> {
        match self.link {
            Some(Link::Host(_)) => Some(Role::Host),
            Some(Link::Client(_)) => Some(Role::Client),
            None => None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role() == Some(Role::Host)
    }

    pub fn is_connected(&self) -> bool {
        match &self.link {
            Some(Link::Host(_)) => true,
            Some(Link::Client(client)) => client.is_connected(),
            None => false,
        }
    }

    pub fn local_player_id(&self) -> Option<PlayerId> {
        self.local_player_id
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.link {
            Some(Link::Host(server)) => Some(server.local_addr()),
            Some(Link::Client(client)) => client.local_addr(),
            None => None,
        }
    }

    pub fn player_count(&self) -> usize {
        self.roster.len()
    }

    pub fn clients(&self) -> &BTreeMap<PlayerId, PeerRecord> {
        self.roster.as_map()
    }

    pub fn peer(&self, player_id: PlayerId) -> Option<&PeerRecord> {
        self.roster.get(player_id)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn stats(&self) -> Option<&NetworkStats> {
        match &self.link {
            Some(Link::Host(server)) => Some(server.stats()),
            Some(Link::Client(client)) => client.stats(),
            None => None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn join_token() -> String {
    let mut hasher = RandomState::new().build_hasher();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    hasher.write_u64(nanos);
    format!("{:08x}", hasher.finish() as u32)
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()?
        .find(SocketAddr::is_ipv4)
        .or_else(|| (host, port).to_socket_addrs().ok()?.next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::transport::UdpTransport;

    #[test]
    fn test_host_takes_first_id() {
        let mut session = Session::default();
        assert!(session.host_game(0, "alice"));

        assert!(session.is_host());
        assert!(session.is_connected());
        assert_eq!(session.local_player_id(), Some(1));
        assert_eq!(session.player_count(), 1);
        assert!(session.peer(1).unwrap().has_map_loaded);
    }

    #[test]
    fn test_host_on_taken_port_fails() {
        let taken = UdpTransport::bind("0.0.0.0:0".parse().unwrap()).unwrap();
        let mut session = Session::default();

        assert!(!session.host_game(taken.local_addr().port(), "alice"));
        assert!(!session.is_connected());
        assert_eq!(session.role(), None);
    }

    #[test]
    fn test_join_without_host_fails() {
        let silent = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let config = SessionConfig {
            endpoint: EndpointConfig {
                connect_timeout: Duration::from_millis(50),
                ..EndpointConfig::default()
            },
            ..SessionConfig::default()
        };
        let mut session = Session::new(config);

        assert!(!session.join_game("127.0.0.1", silent.local_addr().port(), "bob"));
        assert!(!session.is_connected());
        assert_eq!(session.local_player_id(), None);
    }

    #[test]
    fn test_sends_refused_outside_a_session() {
        let mut session = Session::default();
        assert!(!session.send_chat_message("hi"));
        assert!(!session.request_ping());
        assert_eq!(session.packets_sent(), 0);
    }

    #[test]
    fn test_text_with_delimiters_is_refused() {
        let mut session = Session::default();
        assert!(session.host_game(0, "alice"));

        assert!(!session.send_chat_message("a;b"));
        assert!(!session.send_chat_message("x|y"));
        assert!(session.send_chat_message("a, b"));
        assert_eq!(session.packets_sent(), 1);
    }

    #[test]
    fn test_join_tokens_differ() {
        assert_ne!(join_token(), join_token());
    }

    #[test]
    fn test_host_only_messages() {
        let mut session = Session::default();
        assert!(!session.send_game_start("arena"));

        assert!(session.host_game(0, "alice"));
        assert!(session.send_game_start("arena"));
        assert!(session.send_game_end("alice"));
        assert_eq!(session.packets_sent(), 2);
    }

    #[test]
    fn test_disconnect_clears_state() {
        let mut session = Session::default();
        assert!(session.host_game(0, "alice"));

        session.disconnect();

        assert!(!session.is_connected());
        assert_eq!(session.player_count(), 0);
        assert_eq!(session.local_player_id(), None);
        session.update(1.0);
    }
}
