//! UDP transport for DNS queries.
//!
//! Every datagram is handled in its own task so a slow upstream never
//! blocks other clients. Replies larger than the client's advertised
//! payload size are cut down to a TC reply so the client retries over TCP.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dns::{DnsMessage, HEADER_LEN};
use crate::pipeline::ProxyPipeline;
use crate::stats::Stats;

use super::{MAX_DNS_PACKET_SIZE, Protocol};

/// UDP listener for the proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start serving. The returned handle runs until aborted.
    pub fn start(self, pipeline: Arc<ProxyPipeline>, stats: Arc<Stats>) -> JoinHandle<()> {
        tokio::spawn(run(self.socket, pipeline, stats))
    }
}

async fn run(socket: Arc<UdpSocket>, pipeline: Arc<ProxyPipeline>, stats: Arc<Stats>) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP recv error");
                continue;
            }
        };

        if len < HEADER_LEN {
            continue;
        }

        let packet = buf[..len].to_vec();
        tokio::spawn(handle_datagram(
            socket.clone(),
            packet,
            src,
            pipeline.clone(),
            stats.clone(),
        ));
    }
}

async fn handle_datagram(
    socket: Arc<UdpSocket>,
    packet: Vec<u8>,
    src: SocketAddr,
    pipeline: Arc<ProxyPipeline>,
    stats: Arc<Stats>,
) {
    let start_time = Instant::now();

    let request = match DnsMessage::parse(&packet) {
        Ok(request) if !request.is_response() => request,
        Ok(_) => return,
        Err(e) => {
            debug!(client = %src, error = %e, "malformed UDP query");
            if let Some(reply) = DnsMessage::format_error(&packet) {
                send(&socket, &reply.to_bytes(), src).await;
            }
            return;
        }
    };

    let result = pipeline.handle(&request, Protocol::Udp).await;

    let mut bytes = result.response.to_bytes();
    if bytes.len() > request.udp_payload_size() {
        debug!(client = %src, size = bytes.len(), "reply exceeds UDP payload size, truncating");
        bytes = result.response.truncated().to_bytes();
    }
    send(&socket, &bytes, src).await;

    let elapsed = start_time.elapsed();
    stats.record(result.disposition, elapsed);
    if let Some(question) = request.questions.first() {
        debug!(
            "[UDP] {} {} total={:.3}ms",
            question.domain,
            result.disposition,
            elapsed.as_secs_f64() * 1000.0
        );
    }
}

async fn send(socket: &UdpSocket, bytes: &[u8], dst: SocketAddr) {
    if let Err(e) = socket.send_to(bytes, dst).await {
        warn!(client = %dst, error = %e, "UDP response error");
    }
}
