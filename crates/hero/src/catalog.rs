use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::message::{Argument, CodeTable, Message};

pub type PlayerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    PlayerJoin,
    PlayerLeave,
    PlayerState,
    PlayerSpawn,
    PlayerShoot,
    PlayerHit,
    PlayerDeath,
    GameStart,
    GameEnd,
    MapInfo,
    Chat,
    PingRequest,
    PingResponse,
}

impl MessageKind {
    pub const ALL: [MessageKind; 13] = [
        MessageKind::PlayerJoin,
        MessageKind::PlayerLeave,
        MessageKind::PlayerState,
        MessageKind::PlayerSpawn,
        MessageKind::PlayerShoot,
        MessageKind::PlayerHit,
        MessageKind::PlayerDeath,
        MessageKind::GameStart,
        MessageKind::GameEnd,
        MessageKind::MapInfo,
        MessageKind::Chat,
        MessageKind::PingRequest,
        MessageKind::PingResponse,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::PlayerJoin => "PLAYER_JOIN",
            MessageKind::PlayerLeave => "PLAYER_LEAVE",
            MessageKind::PlayerState => "PLAYER_STATE",
            MessageKind::PlayerSpawn => "PLAYER_SPAWN",
            MessageKind::PlayerShoot => "PLAYER_SHOOT",
            MessageKind::PlayerHit => "PLAYER_HIT",
            MessageKind::PlayerDeath => "PLAYER_DEATH",
            MessageKind::GameStart => "GAME_START",
            MessageKind::GameEnd => "GAME_END",
            MessageKind::MapInfo => "MAP_INFO",
            MessageKind::Chat => "CHAT",
            MessageKind::PingRequest => "PING_REQUEST",
            MessageKind::PingResponse => "PING_RESPONSE",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            MessageKind::PlayerJoin => "PJ",
            MessageKind::PlayerLeave => "PL",
            MessageKind::PlayerState => "PS",
            MessageKind::PlayerSpawn => "PSP",
            MessageKind::PlayerShoot => "SH",
            MessageKind::PlayerHit => "HT",
            MessageKind::PlayerDeath => "DT",
            MessageKind::GameStart => "GS",
            MessageKind::GameEnd => "GE",
            MessageKind::MapInfo => "MI",
            MessageKind::Chat => "CH",
            MessageKind::PingRequest => "PQ",
            MessageKind::PingResponse => "PR",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Kinds the host forwards to every other peer.
    pub fn is_relayed(self) -> bool {
        !matches!(
            self,
            MessageKind::PlayerJoin | MessageKind::PingRequest | MessageKind::PingResponse
        )
    }

    /// Kinds only the host may originate.
    pub fn is_host_only(self) -> bool {
        matches!(self, MessageKind::GameStart | MessageKind::GameEnd)
    }
}

impl CodeTable {
    /// Table with every [`MessageKind`] registered under its short code.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        for kind in MessageKind::ALL {
            table.register(kind.tag(), kind.code());
        }
        table
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub player_id: PlayerId,
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub health: i32,
    pub weapon: i32,
}

impl PlayerState {
    pub fn to_args(&self) -> Vec<Argument> {
        vec![
            self.player_id.into(),
            self.position.x.into(),
            self.position.y.into(),
            self.position.z.into(),
            self.yaw.into(),
            self.pitch.into(),
            self.health.into(),
            self.weapon.into(),
        ]
    }

    pub fn from_message(msg: &Message) -> Option<Self> {
        Some(Self {
            player_id: msg.arg_parsed(0)?,
            position: Vec3::new(msg.arg_parsed(1)?, msg.arg_parsed(2)?, msg.arg_parsed(3)?),
            yaw: msg.arg_parsed(4)?,
            pitch: msg.arg_parsed(5)?,
            health: msg.arg_parsed(6)?,
            weapon: msg.arg_parsed(7)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShotFired {
    pub player_id: PlayerId,
    pub origin: Vec3,
    pub direction: Vec3,
    pub weapon_type: i32,
}

impl ShotFired {
    pub fn to_args(&self) -> Vec<Argument> {
        vec![
            self.player_id.into(),
            self.origin.x.into(),
            self.origin.y.into(),
            self.origin.z.into(),
            self.direction.x.into(),
            self.direction.y.into(),
            self.direction.z.into(),
            self.weapon_type.into(),
        ]
    }

    pub fn from_message(msg: &Message) -> Option<Self> {
        Some(Self {
            player_id: msg.arg_parsed(0)?,
            origin: Vec3::new(msg.arg_parsed(1)?, msg.arg_parsed(2)?, msg.arg_parsed(3)?),
            direction: Vec3::new(msg.arg_parsed(4)?, msg.arg_parsed(5)?, msg.arg_parsed(6)?),
            weapon_type: msg.arg_parsed(7)?,
        })
    }
}
