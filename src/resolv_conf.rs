//! Minimal resolv.conf reader for upstream discovery.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

const DNS_PORT: u16 = 53;

/// The parts of resolv.conf the proxy uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    pub nameservers: Vec<SocketAddr>,
    pub timeout: Option<Duration>,
    pub attempts: Option<u32>,
}

impl ResolvConf {
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::parse(&contents))
    }

    /// Parse `nameserver` lines and the `timeout:`/`attempts:` options.
    /// Unknown directives and unparsable addresses are ignored.
    pub fn parse(contents: &str) -> Self {
        let mut conf = Self::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => {
                    // Drop an IPv6 zone index, we cannot carry it in a SocketAddr.
                    let Some(addr) = fields.next().map(|a| a.split('%').next().unwrap_or(a)) else {
                        continue;
                    };
                    if let Ok(ip) = addr.parse::<IpAddr>() {
                        conf.nameservers.push(SocketAddr::new(ip, DNS_PORT));
                    }
                }
                Some("options") => {
                    for option in fields {
                        if let Some(secs) = option.strip_prefix("timeout:") {
                            conf.timeout = secs.parse().ok().map(Duration::from_secs);
                        } else if let Some(n) = option.strip_prefix("attempts:") {
                            conf.attempts = n.parse().ok();
                        }
                    }
                }
                _ => {}
            }
        }

        conf
    }
}
