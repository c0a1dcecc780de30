use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::hosts::HostsError;

/// Startup failures. Once the listeners are up, nothing is fatal.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hosts(#[from] HostsError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Failed to read resolv file {path}: {source}")]
    ResolvConf {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No upstream nameservers found in {0}")]
    NoNameservers(PathBuf),

    #[error("Failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open log file {path}: {source}")]
    Logging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProxyError>;
