//! dnsconduit: reliable byte streams over recursive DNS
//!
//! dnsconduit carries an ordered, reliable byte stream through nothing but
//! ordinary DNS resolution. Each outgoing chunk becomes the label of an `A`
//! query under a domain the far end is authoritative for; each answer comes
//! back as a `CNAME` whose target encodes the reply.
//!
//! ## Features
//!
//! - **Segment Codec**: binary segments with CRC-32 integrity, base32hex text
//!   split into DNS labels, sized to the suffix domain
//! - **Transmission Control**: handshake, windowed sends, acknowledgements,
//!   retransmission, reassembly and an orderly close
//! - **Adaptive pacing**: query intervals back off on empty rounds and speed
//!   up while data flows
//! - **Responder**: the authoritative side, serving many tunnels from one
//!   UDP socket
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dnsconduit::{
//!     ConnIdGenerator, NoFaults, ProxiedConnection, TunnelConfig, UdpResolver,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> dnsconduit::Result<()> {
//! let config = TunnelConfig::default();
//! let resolver = Arc::new(UdpResolver::new(config.resolver_addr, config.io_timeout));
//! let ids = ConnIdGenerator::new();
//!
//! let (local, _app) = tokio::io::duplex(64 * 1024);
//! let conn = ProxiedConnection::new(&config, ids.next_id(), resolver, Arc::new(NoFaults), local)?;
//! let handle = conn.start().await?;
//! handle.stop();
//! let stats = handle.wait().await?;
//! println!("sent {} bytes", stats.bytes_sent);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐  A / CNAME  ┌─────────────┐     ┌─────────────┐
//! │ Application │────▶│  Proxied     │────────────▶│  Recursive  │────▶│ Responder + │
//! │   stream    │◀────│  Connection  │◀────────────│  resolver   │◀────│ DNS server  │
//! └─────────────┘     └──────────────┘             └─────────────┘     └─────────────┘
//! ```

pub mod backlog;
pub mod codec;
pub mod config;
pub mod conn_id;
pub mod dns;
pub mod proxied;
pub mod resolver;
pub mod responder;
pub mod segment;
pub mod server;
pub mod tc;
pub mod timing;

// Re-export core types
pub use backlog::SegmentBacklog;
pub use codec::{optimal_seg_len, CodecError, SegmentCodec};
pub use config::{ServerConfig, TransportConfig, TunnelConfig};
pub use conn_id::ConnIdGenerator;
pub use dns::DnsError;
pub use proxied::{ConnectionHandle, ProxiedConnection};
pub use resolver::{
    DropPercentage, FaultInjector, LoopbackResolver, NoFaults, ResolveError, Resolver,
    UdpResolver,
};
pub use responder::{AcceptedTunnel, Responder, ResponderConfig};
pub use segment::{Flags, Segment, SEGMENT_HEADER_LEN};
pub use server::DnsTunnelServer;
pub use tc::{Role, TcConfig, TcState, TcStats, TransmissionControl};
pub use timing::{AdaptiveTiming, Pacing, TimingConfig};

/// dnsconduit error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The peer reset the connection or retries ran out before it was established
    #[error("Handshake failed for connection {0:04x}")]
    HandshakeFailed(u16),

    /// No established state within the handshake deadline
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// Cancelled before the operation completed
    #[error("Connection cancelled")]
    Cancelled,

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The connection task panicked or was aborted
    #[error("Connection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
