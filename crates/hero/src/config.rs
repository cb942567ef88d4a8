use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frag::DEFAULT_STALE_TIMEOUT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub connect_timeout: Duration,
    pub ping_timeout: Duration,
    pub keepalive_interval: Duration,
    pub fragment_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            ping_timeout: Duration::from_millis(1000),
            keepalive_interval: Duration::from_secs(5),
            fragment_timeout: DEFAULT_STALE_TIMEOUT,
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    pub peer_timeout: Duration,
    pub join_attempts: u32,
    pub join_poll_interval: Duration,
    pub receive_slice: Duration,
    pub endpoint: EndpointConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(2),
            peer_timeout: Duration::from_secs(10),
            join_attempts: 10,
            join_poll_interval: Duration::from_millis(100),
            receive_slice: Duration::from_millis(1),
            endpoint: EndpointConfig::default(),
        }
    }
}
