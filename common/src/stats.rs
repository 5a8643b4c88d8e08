use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ListeningPort {
    pub protocol: PortProtocol,
    pub address: String,
    pub port: u16,
}

/// Point-in-time resource usage of one process.
///
/// Replaced as a whole on every sample, never merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStats {
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_rss_bytes: u64,
    #[serde(default)]
    pub disk_read_bytes: u64,
    #[serde(default)]
    pub disk_write_bytes: u64,
    #[serde(default)]
    pub net_rx_bytes: u64,
    #[serde(default)]
    pub net_tx_bytes: u64,
    #[serde(default)]
    pub listening_ports: Vec<ListeningPort>,
    #[serde(default)]
    pub sampled_at: Option<DateTime<Utc>>,
}
