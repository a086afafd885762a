//! DNS resolution seam
//!
//! The driver only needs one operation from the network: resolve a name
//! and hand back the CNAME target. [`UdpResolver`] talks to a real
//! recursive resolver; [`LoopbackResolver`] answers in-process from a
//! [`Responder`], which keeps tests off the network.

use crate::dns::{DnsError, DnsMessage, EDNS_UDP_SIZE, RCODE_NOERROR};
use crate::responder::Responder;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

/// Why a single query round trip produced no usable answer
///
/// All of these are transient: the driver backs off and tries again.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("DNS query timed out after {0:?}")]
    Timeout(Duration),

    #[error("First answer is not a CNAME (type {0})")]
    NotCname(u16),

    #[error("Response carried no answers")]
    EmptyAnswer,

    #[error("Resolver answered with rcode {0}")]
    ServerFailure(u8),

    #[error("Response discarded by fault injection")]
    Dropped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed DNS message: {0}")]
    Malformed(#[from] DnsError),
}

/// Resolves a tunnel query name to the CNAME target carrying the answer
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_cname(&self, name: &str) -> Result<String, ResolveError>;
}

/// Extract the CNAME target from a response, classifying failures
pub fn cname_target(response: &DnsMessage) -> Result<String, ResolveError> {
    let rcode = response.header.rcode();
    if rcode != RCODE_NOERROR {
        return Err(ResolveError::ServerFailure(rcode));
    }

    let first = response.answers.first().ok_or(ResolveError::EmptyAnswer)?;
    first
        .cname()
        .map(str::to_string)
        .ok_or(ResolveError::NotCname(first.rtype))
}

/// Whether `response` answers the query `id` for `name`
///
/// Resolvers may randomize the case of the echoed name.
fn answers_query(response: &DnsMessage, id: u16, name: &str) -> bool {
    response.header.is_response()
        && response.header.id == id
        && response
            .questions
            .first()
            .is_some_and(|q| q.qname.eq_ignore_ascii_case(name.trim_end_matches('.')))
}

/// Queries a recursive resolver over UDP
#[derive(Debug, Clone)]
pub struct UdpResolver {
    server: SocketAddr,
    io_timeout: Duration,
}

impl UdpResolver {
    pub fn new(server: SocketAddr, io_timeout: Duration) -> Self {
        Self { server, io_timeout }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    fn local_addr(&self) -> SocketAddr {
        // Match the resolver's address family and loopback-ness
        let local = match (self.server.is_ipv4(), self.server.ip().is_loopback()) {
            (true, true) => "127.0.0.1:0",
            (true, false) => "0.0.0.0:0",
            (false, true) => "[::1]:0",
            (false, false) => "[::]:0",
        };
        local
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}

#[async_trait]
impl Resolver for UdpResolver {
    async fn lookup_cname(&self, name: &str) -> Result<String, ResolveError> {
        let id = rand::random::<u16>();
        let query = DnsMessage::new_query(name, id).to_bytes()?;
        let deadline = Instant::now() + self.io_timeout;

        // Fresh socket per query so late answers to earlier queries never land here
        let socket = UdpSocket::bind(self.local_addr()).await?;
        socket.connect(self.server).await?;
        socket.send(&query).await?;

        let mut buf = vec![0u8; EDNS_UDP_SIZE as usize];
        loop {
            let len = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(ResolveError::Timeout(self.io_timeout)),
            };

            let response = match DnsMessage::parse(&buf[..len]) {
                Ok(response) => response,
                Err(e) => {
                    log::debug!("Ignoring unparseable datagram while waiting for {:04x}: {}", id, e);
                    continue;
                }
            };
            if !answers_query(&response, id, name) {
                log::debug!(
                    "Ignoring DNS message {:04x} while waiting for {:04x}",
                    response.header.id,
                    id
                );
                continue;
            }
            return cname_target(&response);
        }
    }
}

/// Answers queries directly from an in-process [`Responder`]
///
/// Goes through the same DNS message encoding as the UDP server.
#[derive(Clone)]
pub struct LoopbackResolver {
    responder: Arc<Responder>,
}

impl LoopbackResolver {
    pub fn new(responder: Arc<Responder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl Resolver for LoopbackResolver {
    async fn lookup_cname(&self, name: &str) -> Result<String, ResolveError> {
        let id = rand::random::<u16>();
        let query = DnsMessage::new_query(name, id).to_bytes()?;

        let reply = crate::server::handle_query(&self.responder, &query).ok_or_else(|| {
            ResolveError::Malformed(DnsError::InvalidMessage("Query rejected".into()))
        })?;

        let response = DnsMessage::parse(&reply)?;
        if !answers_query(&response, id, name) {
            return Err(ResolveError::Malformed(DnsError::InvalidMessage(
                "Response does not match query".into(),
            )));
        }
        cname_target(&response)
    }
}

/// Decides whether a successful response is thrown away before use
///
/// Production uses [`NoFaults`]; tests exercise loss recovery with
/// [`DropPercentage`] through the exact same driver path.
pub trait FaultInjector: Send + Sync {
    fn should_drop(&self) -> bool;
}

/// Never drops anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn should_drop(&self) -> bool {
        false
    }
}

/// Drops the given percentage of responses at random
#[derive(Debug)]
pub struct DropPercentage {
    percent: u8,
    rng: Mutex<StdRng>,
}

impl DropPercentage {
    pub fn new(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible drop pattern
    pub fn with_seed(percent: u8, seed: u64) -> Self {
        Self {
            percent: percent.min(100),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }
}

impl FaultInjector for DropPercentage {
    fn should_drop(&self) -> bool {
        if self.percent == 0 {
            return false;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_range(0..100u8) < self.percent
    }
}
