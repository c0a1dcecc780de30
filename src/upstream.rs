//! Forwarding to upstream nameservers.
//!
//! Every configured nameserver is queried concurrently and the first
//! successful answer wins. Each exchange is bounded by the configured
//! timeout; running out of time is just another failed exchange. When the
//! whole race fails it is repeated up to the configured number of attempts.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::dns::{DnsMessage, ParseError};
use crate::transport::{MAX_DNS_PACKET_SIZE, Protocol};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("upstream {server} timed out")]
    Timeout { server: SocketAddr },

    #[error("upstream {server} I/O error: {source}")]
    Io {
        server: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("upstream {server} sent a malformed response: {source}")]
    Malformed {
        server: SocketAddr,
        #[source]
        source: ParseError,
    },

    #[error("upstream {server} answered with ID {got:#06x}, expected {expected:#06x}")]
    IdMismatch {
        server: SocketAddr,
        expected: u16,
        got: u16,
    },

    #[error("no upstream nameservers configured")]
    NoNameservers,
}

/// Something that can resolve a request on the proxy's behalf.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn lookup(
        &self,
        request: &DnsMessage,
        protocol: Protocol,
    ) -> Result<DnsMessage, ResolveError>;
}

/// Nameservers, deadline and retry budget used for forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub nameservers: Vec<SocketAddr>,
    pub timeout: Duration,
    /// Races to run before giving up; values below 1 count as 1.
    pub attempts: u32,
}

/// Forwards requests to the configured nameservers.
pub struct UpstreamResolver {
    config: UpstreamConfig,
}

impl UpstreamResolver {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { config }
    }

    pub fn nameservers(&self) -> &[SocketAddr] {
        &self.config.nameservers
    }

    async fn exchange(
        &self,
        query: &[u8],
        id: u16,
        server: SocketAddr,
        protocol: Protocol,
    ) -> Result<DnsMessage, ResolveError> {
        let attempt = async {
            match protocol {
                Protocol::Udp => {
                    let response = exchange_udp(query, id, server).await?;
                    if response.truncated_flag() {
                        debug!(%server, "truncated UDP answer, retrying over TCP");
                        return exchange_tcp(query, id, server).await;
                    }
                    Ok(response)
                }
                Protocol::Tcp => exchange_tcp(query, id, server).await,
            }
        };

        tokio::time::timeout(self.config.timeout, attempt)
            .await
            .map_err(|_| ResolveError::Timeout { server })?
    }
}

#[async_trait]
impl Upstream for UpstreamResolver {
    async fn lookup(
        &self,
        request: &DnsMessage,
        protocol: Protocol,
    ) -> Result<DnsMessage, ResolveError> {
        if self.config.nameservers.is_empty() {
            return Err(ResolveError::NoNameservers);
        }

        // Answers larger than the receive buffer would arrive cut short.
        let query = request
            .with_udp_payload_limit(MAX_DNS_PACKET_SIZE as u16)
            .to_bytes();

        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            let exchanges: Vec<BoxFuture<'_, Result<DnsMessage, ResolveError>>> = self
                .config
                .nameservers
                .iter()
                .map(|&server| Box::pin(self.exchange(&query, request.id, server, protocol)) as _)
                .collect();

            match future::select_ok(exchanges).await {
                Ok((response, _)) => return Ok(response),
                Err(e) if attempt < attempts => {
                    debug!(attempt, error = %e, "every upstream failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// One query/response over UDP. Unparsable datagrams and datagrams with a
/// foreign ID are ignored.
async fn exchange_udp(query: &[u8], id: u16, server: SocketAddr) -> Result<DnsMessage, ResolveError> {
    let io_err = |source| ResolveError::Io { server, source };

    let local = if server.is_ipv4() {
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
    } else {
        SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
    };
    let socket = UdpSocket::bind(local).await.map_err(io_err)?;
    socket.connect(server).await.map_err(io_err)?;
    socket.send(query).await.map_err(io_err)?;

    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
    loop {
        let len = socket.recv(&mut buf).await.map_err(io_err)?;
        let response = match DnsMessage::parse(&buf[..len]) {
            Ok(response) => response,
            Err(e) => {
                debug!(%server, error = %e, "ignoring malformed UDP answer");
                continue;
            }
        };
        if response.id != id {
            debug!(%server, expected = id, got = response.id, "ignoring mismatched UDP answer");
            continue;
        }
        return Ok(response);
    }
}

/// One query/response over TCP with 2-byte length framing.
async fn exchange_tcp(query: &[u8], id: u16, server: SocketAddr) -> Result<DnsMessage, ResolveError> {
    let io_err = |source| ResolveError::Io { server, source };

    let mut stream = TcpStream::connect(server).await.map_err(io_err)?;

    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await.map_err(io_err)?;

    let len = stream.read_u16().await.map_err(io_err)? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(io_err)?;

    let response =
        DnsMessage::parse(&buf).map_err(|source| ResolveError::Malformed { server, source })?;
    if response.id != id {
        return Err(ResolveError::IdMismatch {
            server,
            expected: id,
            got: response.id,
        });
    }
    Ok(response)
}
