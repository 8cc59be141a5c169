use serde::{Deserialize, Serialize};

use crate::error::ReceiverError;

/// Receiver process configuration — parsed from the JSON config file,
/// individual fields overridable from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Control channel bind endpoint.
    #[serde(default = "default_ctrl_endpoint")]
    pub ctrl_endpoint: String,

    /// Frame-ready notification publish endpoint.
    #[serde(default = "default_ready_endpoint")]
    pub frame_ready_endpoint: String,

    /// Frame-release notification receive endpoint.
    #[serde(default = "default_release_endpoint")]
    pub frame_release_endpoint: String,

    /// In-process channel between the RX service and the controller.
    #[serde(default = "default_rx_channel_endpoint")]
    pub rx_channel_endpoint: String,

    /// UDP ports to receive frame data on.
    #[serde(default = "default_rx_ports")]
    pub rx_ports: Vec<u16>,

    /// Address to receive frame data on.
    #[serde(default = "default_rx_address")]
    pub rx_address: String,

    /// Kernel receive buffer size applied to each UDP socket.
    #[serde(default = "default_rx_recv_buffer_size")]
    pub rx_recv_buffer_size: usize,

    /// Name of the shared frame buffer segment.
    #[serde(default = "default_shared_buffer_name")]
    pub shared_buffer_name: String,

    /// Shared buffer memory to allocate; the pool holds
    /// `max_buffer_mem / frame_buffer_size` slots.
    #[serde(default = "default_max_buffer_mem")]
    pub max_buffer_mem: u64,

    /// Frame decoder identity, resolved through the decoder registry.
    #[serde(default = "default_decoder")]
    pub decoder: String,

    /// Decoder configuration parameters, passed to the decoder verbatim.
    #[serde(default)]
    pub decoder_config: serde_json::Value,

    /// Period of the RX service tick timer used for stop detection.
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,
}

fn default_ctrl_endpoint() -> String {
    "tcp://0.0.0.0:5000".into()
}

fn default_ready_endpoint() -> String {
    "tcp://0.0.0.0:5001".into()
}

fn default_release_endpoint() -> String {
    "tcp://0.0.0.0:5002".into()
}

fn default_rx_channel_endpoint() -> String {
    "inproc://rx_channel".into()
}

fn default_rx_ports() -> Vec<u16> {
    vec![8989, 8990]
}

fn default_rx_address() -> String {
    "0.0.0.0".into()
}

fn default_rx_recv_buffer_size() -> usize {
    30_000_000
}

fn default_shared_buffer_name() -> String {
    "FrameReceiverBuffer".into()
}

fn default_max_buffer_mem() -> u64 {
    1_048_576
}

fn default_decoder() -> String {
    "dummy_udp".into()
}

fn default_tick_period_ms() -> u64 {
    100
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            ctrl_endpoint: default_ctrl_endpoint(),
            frame_ready_endpoint: default_ready_endpoint(),
            frame_release_endpoint: default_release_endpoint(),
            rx_channel_endpoint: default_rx_channel_endpoint(),
            rx_ports: default_rx_ports(),
            rx_address: default_rx_address(),
            rx_recv_buffer_size: default_rx_recv_buffer_size(),
            shared_buffer_name: default_shared_buffer_name(),
            max_buffer_mem: default_max_buffer_mem(),
            decoder: default_decoder(),
            decoder_config: serde_json::Value::Null,
            tick_period_ms: default_tick_period_ms(),
        }
    }
}

impl ReceiverConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &str) -> Result<Self, ReceiverError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReceiverError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON string.
    pub fn parse(json: &str) -> Result<Self, ReceiverError> {
        serde_json::from_str(json).map_err(|e| ReceiverError::Config(e.to_string()))
    }
}
