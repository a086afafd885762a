//! UDP DNS front-end for a [`Responder`]
//!
//! Answers tunnel queries with a single CNAME record. Names outside the
//! tunnel zone are refused, and in-zone names that carry no usable segment
//! get NXDOMAIN.

use crate::dns::{
    DnsMessage, EDNS_UDP_SIZE, RCODE_FORMERR, RCODE_NOERROR, RCODE_NXDOMAIN, RCODE_REFUSED,
};
use crate::responder::Responder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Build the reply to one raw DNS query packet
///
/// Returns `None` when the packet is not a query worth answering.
pub fn handle_query(responder: &Responder, packet: &[u8]) -> Option<Vec<u8>> {
    let query = match DnsMessage::parse(packet) {
        Ok(query) => query,
        Err(e) => {
            log::debug!("[Server] unparseable query: {}", e);
            return None;
        }
    };
    if query.header.is_response() {
        return None;
    }

    let reply = match query.questions.first() {
        None => DnsMessage::error_response(&query, RCODE_FORMERR),
        Some(q) if !responder.codec().owns(&q.qname) => {
            log::debug!("[Server] refusing out-of-zone query for {}", q.qname);
            DnsMessage::error_response(&query, RCODE_REFUSED)
        }
        Some(q) if responder.is_chase(&q.qname) => {
            DnsMessage::error_response(&query, RCODE_NOERROR)
        }
        Some(q) => match responder.answer(&q.qname) {
            Some(target) => DnsMessage::cname_response(&query, &target, responder.answer_ttl()),
            None => DnsMessage::error_response(&query, RCODE_NXDOMAIN),
        },
    };

    match reply.to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::error!("[Server] failed to encode reply: {}", e);
            None
        }
    }
}

/// Authoritative DNS server carrying tunnel traffic
pub struct DnsTunnelServer {
    socket: Arc<UdpSocket>,
    responder: Arc<Responder>,
}

impl DnsTunnelServer {
    pub async fn bind(listen_addr: SocketAddr, responder: Arc<Responder>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;

        log::info!(
            "DNS tunnel server listening on UDP {} for *.{}.{}",
            socket.local_addr()?,
            responder.codec().proxy_prefix(),
            responder.codec().suffix_domain()
        );

        Ok(Self {
            socket: Arc::new(socket),
            responder,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve queries until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> std::io::Result<()> {
        let mut buf = vec![0u8; EDNS_UDP_SIZE as usize];

        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("DNS tunnel server shutting down");
                    self.responder.shutdown();
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP unreachable from a vanished client surfaces here on some platforms
                        log::warn!("DNS tunnel server receive error: {}", e);
                        continue;
                    }
                },
            };

            log::debug!("DNS tunnel server received {} bytes from {}", len, peer);

            let Some(reply) = handle_query(&self.responder, &buf[..len]) else {
                continue;
            };
            if let Err(e) = self.socket.send_to(&reply, peer).await {
                log::warn!("DNS tunnel server failed to answer {}: {}", peer, e);
            }
        }
    }
}
