//! Transport layer implementations for the DNS proxy.
//!
//! Provides UDP and TCP listeners that decode client queries, hand them
//! to the [`ProxyPipeline`](crate::pipeline::ProxyPipeline) and write the
//! encoded reply back.

pub mod tcp;
pub mod udp;

use std::fmt;
use std::time::Duration;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Deadline for reading a query from a TCP client.
pub const TCP_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport a query arrived on. Upstream forwarding uses the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
