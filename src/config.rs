//! Tunnel configuration

use crate::codec::{CodecError, SegmentCodec};
use crate::resolver::{DropPercentage, FaultInjector, NoFaults};
use crate::responder::ResponderConfig;
use crate::segment::SEGMENT_HEADER_LEN;
use crate::tc::TcConfig;
use crate::timing::TimingConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Main tunnel configuration, shared by both ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Recursive resolver the client sends its queries to
    pub resolver_addr: SocketAddr,

    /// Domain the server is authoritative for
    pub suffix_domain: String,

    /// Single label between the encoded data and the suffix domain
    pub proxy_prefix: char,

    /// Bound on a single DNS query round trip
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,

    /// Percentage of resolver responses to discard (testing only)
    #[serde(default)]
    pub drop_percentage: u8,

    /// Reliability and driver loop settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Query pacing bounds
    #[serde(default)]
    pub timing: TimingConfig,

    /// Authoritative side settings
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            resolver_addr: SocketAddr::from(([127, 0, 0, 1], 53)),
            suffix_domain: "example.com".to_string(),
            proxy_prefix: 't',
            io_timeout: Duration::from_secs(5),
            drop_percentage: 0,
            transport: TransportConfig::default(),
            timing: TimingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Transmission control and driver loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Deadline for reaching the established state
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Pause when nothing is ready to send or a query failed
    #[serde(with = "humantime_serde")]
    pub busy_wait_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub retransmission_interval: Duration,

    pub max_retransmissions: u32,

    /// Unacknowledged data segments in flight
    pub window_segments: usize,

    /// Application bytes buffered ahead of segmentation
    pub send_buffer: usize,

    /// Pause after close before the final segment is re-sent
    #[serde(with = "humantime_serde")]
    pub linger: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            busy_wait_interval: Duration::from_millis(50),
            retransmission_interval: Duration::from_secs(2),
            max_retransmissions: 30,
            window_segments: 8,
            send_buffer: 64 * 1024,
            linger: Duration::from_millis(500),
        }
    }
}

/// Authoritative side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Connections that stop querying for this long are dropped
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How long a closed connection keeps answering retransmissions
    #[serde(with = "humantime_serde")]
    pub closed_linger: Duration,

    /// TTL on CNAME answers; zero keeps resolvers from caching them
    pub answer_ttl: u32,

    /// Buffer size of the in-memory stream handed to the application
    pub stream_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            closed_linger: Duration::from_secs(10),
            answer_ttl: 0,
            stream_buffer: 64 * 1024,
        }
    }
}

impl TunnelConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let codec = self.codec().map_err(|e| e.to_string())?;

        // The header alone must leave room for payload
        if codec.optimal_seg_len() <= SEGMENT_HEADER_LEN {
            return Err(format!(
                "Suffix domain {} is too long to carry any payload",
                self.suffix_domain
            ));
        }

        if self.io_timeout.is_zero() {
            return Err("io_timeout must be non-zero".to_string());
        }

        if self.drop_percentage >= 100 {
            return Err("drop_percentage must be below 100".to_string());
        }

        let transport = &self.transport;
        if transport.handshake_timeout.is_zero() || transport.busy_wait_interval.is_zero() {
            return Err("handshake_timeout and busy_wait_interval must be non-zero".to_string());
        }
        if transport.retransmission_interval.is_zero() {
            return Err("retransmission_interval must be non-zero".to_string());
        }
        if transport.max_retransmissions == 0 || transport.window_segments == 0 {
            return Err("max_retransmissions and window_segments must be at least 1".to_string());
        }
        if transport.send_buffer == 0 || self.server.stream_buffer == 0 {
            return Err("Buffer sizes must be non-zero".to_string());
        }

        self.timing.validate()
    }

    /// Codec for this suffix domain and proxy prefix
    pub fn codec(&self) -> Result<SegmentCodec, CodecError> {
        SegmentCodec::new(self.proxy_prefix, &self.suffix_domain)
    }

    /// Transmission control settings, with payload sized to the suffix domain
    pub fn tc_config(&self, codec: &SegmentCodec) -> TcConfig {
        TcConfig {
            segment_payload: codec.payload_capacity(),
            window_segments: self.transport.window_segments,
            retransmission_interval: self.transport.retransmission_interval,
            max_retransmissions: self.transport.max_retransmissions,
            send_buffer: self.transport.send_buffer,
            timing: self.timing.clone(),
        }
    }

    pub fn responder_config(&self) -> Result<ResponderConfig, CodecError> {
        let codec = self.codec()?;
        Ok(ResponderConfig {
            tc: self.tc_config(&codec),
            codec,
            idle_timeout: self.server.idle_timeout,
            closed_linger: self.server.closed_linger,
            answer_ttl: self.server.answer_ttl,
            stream_buffer: self.server.stream_buffer,
        })
    }

    /// Fault injector matching `drop_percentage`
    pub fn fault_injector(&self) -> Arc<dyn FaultInjector> {
        if self.drop_percentage == 0 {
            Arc::new(NoFaults)
        } else {
            Arc::new(DropPercentage::new(self.drop_percentage))
        }
    }
}
