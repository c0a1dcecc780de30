//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently. DNS messages over TCP
//! carry a 2-byte big-endian length prefix, and a connection may carry
//! several queries in sequence until the client closes it or goes quiet.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dns::DnsMessage;
use crate::pipeline::ProxyPipeline;
use crate::stats::Stats;

use super::{Protocol, TCP_READ_TIMEOUT};

/// TCP listener for the proxy.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop. Each connection is served in its own task.
    pub fn start(self, pipeline: Arc<ProxyPipeline>, stats: Arc<Stats>) -> JoinHandle<()> {
        tokio::spawn(run_accept_loop(self.listener, pipeline, stats))
    }
}

async fn run_accept_loop(listener: TcpListener, pipeline: Arc<ProxyPipeline>, stats: Arc<Stats>) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(client, peer, pipeline.clone(), stats.clone()));
            }
            Err(e) => {
                warn!(error = %e, "TCP accept error");
            }
        }
    }
}

/// Serve queries on one connection until EOF, error or read timeout.
async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<ProxyPipeline>,
    stats: Arc<Stats>,
) {
    loop {
        let packet = match tokio::time::timeout(TCP_READ_TIMEOUT, read_dns_message(&mut client)).await {
            Ok(Ok(Some(packet))) => packet,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!(client = %peer, error = %e, "TCP read error");
                return;
            }
            Err(_) => {
                debug!(client = %peer, "TCP client idle, closing");
                return;
            }
        };

        let start_time = Instant::now();

        let request = match DnsMessage::parse(&packet) {
            Ok(request) if !request.is_response() => request,
            Ok(_) => return,
            Err(e) => {
                debug!(client = %peer, error = %e, "malformed TCP query");
                if let Some(reply) = DnsMessage::format_error(&packet) {
                    let _ = write_dns_message(&mut client, &reply.to_bytes()).await;
                }
                return;
            }
        };

        let result = pipeline.handle(&request, Protocol::Tcp).await;

        if let Err(e) = write_dns_message(&mut client, &result.response.to_bytes()).await {
            debug!(client = %peer, error = %e, "TCP write error");
            return;
        }

        let elapsed = start_time.elapsed();
        stats.record(result.disposition, elapsed);
        if let Some(question) = request.questions.first() {
            debug!(
                "[TCP] {} {} total={:.3}ms",
                question.domain,
                result.disposition,
                elapsed.as_secs_f64() * 1000.0
            );
        }
    }
}

/// Read one length-prefixed DNS message. `None` on a clean EOF.
async fn read_dns_message(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let len = match stream.read_u16().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_dns_message(stream: &mut TcpStream, message: &[u8]) -> io::Result<()> {
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DNS message too large for TCP"))?;

    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await
}
