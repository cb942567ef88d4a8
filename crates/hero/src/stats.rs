use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub rtt: Option<Duration>,
}

impl NetworkStats {
    pub fn rtt_ms(&self) -> Option<f32> {
        self.rtt.map(|rtt| rtt.as_secs_f32() * 1000.0)
    }
}
