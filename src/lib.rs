//! dnsproxy - a forwarding DNS proxy.
//!
//! Answers from a hosts file and an in-memory cache where it can, forwards
//! everything else to upstream nameservers and applies query and answer
//! policy along the way. The library exposes the pipeline and transports
//! for benchmarking and testing.

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod hosts;
pub mod logging;
pub mod pipeline;
pub mod proxy;
pub mod question;
pub mod resolv_conf;
pub mod stats;
pub mod transport;
pub mod upstream;
