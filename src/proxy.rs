//! DNS proxy orchestration.
//!
//! Builds the pipeline from settings, binds transports and runs the proxy
//! server until Ctrl-C.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cache::{self, ResponseCache};
use crate::config::Settings;
use crate::error::{ProxyError, Result};
use crate::hosts::HostsTable;
use crate::pipeline::{HostsOverride, ProxyPipeline};
use crate::resolv_conf::ResolvConf;
use crate::stats::Stats;
use crate::transport::{Protocol, tcp::TcpTransport, udp::UdpTransport};
use crate::upstream::{Upstream, UpstreamConfig, UpstreamResolver};

const STATS_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Upstream nameservers: the explicit list if given, otherwise resolv.conf.
///
/// The resolv file also supplies the timeout when the settings leave it
/// unset, and the number of attempts.
pub fn upstream_config(settings: &Settings) -> Result<UpstreamConfig> {
    let configured = settings.resolv.timeout.map(Duration::from_secs);

    let explicit = settings.resolv.explicit_nameservers()?;
    if !explicit.is_empty() {
        return Ok(UpstreamConfig {
            nameservers: explicit,
            timeout: configured.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT),
            attempts: 1,
        });
    }

    let path = &settings.resolv.resolv_file;
    let conf = ResolvConf::load(path).map_err(|source| ProxyError::ResolvConf {
        path: path.clone(),
        source,
    })?;
    if conf.nameservers.is_empty() {
        return Err(ProxyError::NoNameservers(path.clone()));
    }

    Ok(UpstreamConfig {
        nameservers: conf.nameservers,
        timeout: configured
            .or(conf.timeout.filter(|t| !t.is_zero()))
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT),
        attempts: conf.attempts.unwrap_or(1),
    })
}

/// Assemble the query pipeline around `upstream`.
pub fn build_pipeline(settings: &Settings, upstream: Arc<dyn Upstream>) -> Result<ProxyPipeline> {
    let hosts = if settings.hosts.enable {
        let table = HostsTable::load(&settings.hosts.host_file)?;
        info!(
            "Loaded {} hosts entries from {}",
            table.len(),
            settings.hosts.host_file.display()
        );
        Some(HostsOverride {
            table,
            ttl: settings.hosts.ttl,
        })
    } else {
        None
    };

    let cache = cache::build(&settings.cache)?;
    let filters = settings.filter_config()?;

    Ok(ProxyPipeline::new(hosts, cache, upstream, filters))
}

/// Run the DNS proxy with the given settings.
///
/// Starts UDP and TCP transports on the configured address. Runs until
/// Ctrl-C is received.
pub async fn run(settings: Settings) -> Result<()> {
    let upstream = UpstreamResolver::new(upstream_config(&settings)?);
    let upstream_strs: Vec<_> = upstream.nameservers().iter().map(|a| a.to_string()).collect();
    info!("Racing upstreams: {}", upstream_strs.join(", "));

    let pipeline = Arc::new(build_pipeline(&settings, Arc::new(upstream))?);
    let stats = Arc::new(Stats::new());

    let bind_addr = settings.bind_addr()?;
    let udp = UdpTransport::bind(bind_addr)
        .await
        .map_err(bind_error(Protocol::Udp, bind_addr))?;
    let tcp = TcpTransport::bind(bind_addr)
        .await
        .map_err(bind_error(Protocol::Tcp, bind_addr))?;

    info!("DNS proxy listening on {}", bind_addr);

    let tasks = [
        udp.start(pipeline.clone(), stats.clone()),
        tcp.start(pipeline.clone(), stats.clone()),
        tokio::spawn(report_stats(stats, pipeline.cache().clone())),
        tokio::spawn(purge_cache(
            pipeline.cache().clone(),
            Duration::from_secs(settings.cache.expire),
        )),
    ];

    // A failed signal handler just means we run until killed.
    if let Err(e) = tokio::signal::ctrl_c().await {
        debug!(error = %e, "unable to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }

    info!("Shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn bind_error(protocol: Protocol, addr: SocketAddr) -> impl FnOnce(io::Error) -> ProxyError {
    move |source| ProxyError::Bind {
        protocol: protocol.as_str(),
        addr,
        source,
    }
}

/// Log and reset the counters every minute.
async fn report_stats(stats: Arc<Stats>, cache: Arc<dyn ResponseCache>) {
    let started = tokio::time::Instant::now();
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let stats = stats.snapshot_and_reset();
        info!(
            "[stats] uptime={}s cache={} requests={} hosts={} cached={} forwarded={} rejected={} sinkholed={} failed={} avg_response={:.2}ms",
            started.elapsed().as_secs(),
            cache.len(),
            stats.requests,
            stats.hosts,
            stats.cached,
            stats.forwarded,
            stats.rejected,
            stats.sinkholed,
            stats.failed,
            stats.avg_response_ms
        );
    }
}

/// Drop expired cache entries once per expiry period.
async fn purge_cache(cache: Arc<dyn ResponseCache>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = cache.purge_expired();
        if removed > 0 {
            debug!(removed, "purged expired cache entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings_with(toml: &str) -> Settings {
        Settings::from_toml(toml).unwrap()
    }

    #[test]
    fn explicit_nameservers_win_over_resolv_conf() {
        let settings = settings_with(
            "[resolv]\nresolv-file = \"/nonexistent/resolv.conf\"\nnameservers = [\"9.9.9.9\", \"127.0.0.1:5300\"]\ntimeout = 2\n",
        );

        let config = upstream_config(&settings).unwrap();

        assert_eq!(
            config.nameservers,
            vec![
                "9.9.9.9:53".parse::<SocketAddr>().unwrap(),
                "127.0.0.1:5300".parse().unwrap(),
            ]
        );
        assert_eq!(config.timeout, Duration::from_secs(2));
    }

    #[test]
    fn nameservers_come_from_resolv_conf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nameserver 192.0.2.53").unwrap();
        let settings = settings_with(&format!(
            "[resolv]\nresolv-file = {:?}\n",
            file.path().display().to_string()
        ));

        let config = upstream_config(&settings).unwrap();

        assert_eq!(config.nameservers, vec!["192.0.2.53:53".parse().unwrap()]);
        assert_eq!(config.timeout, DEFAULT_UPSTREAM_TIMEOUT);
        assert_eq!(config.attempts, 1);
    }

    #[test]
    fn resolv_conf_options_fill_timeout_and_attempts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "nameserver 192.0.2.53\noptions timeout:2 attempts:3").unwrap();
        let resolv_file = format!("resolv-file = {:?}\n", file.path().display().to_string());

        let config = upstream_config(&settings_with(&format!("[resolv]\n{resolv_file}"))).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.attempts, 3);

        let config =
            upstream_config(&settings_with(&format!("[resolv]\n{resolv_file}timeout = 7\n"))).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(7));
        assert_eq!(config.attempts, 3);
    }

    #[test]
    fn resolv_conf_without_nameservers_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "search home.lan").unwrap();
        let settings = settings_with(&format!(
            "[resolv]\nresolv-file = {:?}\n",
            file.path().display().to_string()
        ));

        let err = upstream_config(&settings).unwrap_err();

        assert!(matches!(err, ProxyError::NoNameservers(_)));
    }

    #[test]
    fn missing_hosts_file_is_fatal_when_enabled() {
        let settings = settings_with("[hosts]\nenable = true\nhost-file = \"/nonexistent/hosts\"\n");
        let upstream = Arc::new(UpstreamResolver::new(UpstreamConfig {
            nameservers: Vec::new(),
            timeout: Duration::from_secs(1),
            attempts: 1,
        }));

        let err = build_pipeline(&settings, upstream).err().unwrap();

        assert!(matches!(err, ProxyError::Hosts(_)));
    }

    #[test]
    fn unknown_cache_backend_is_fatal() {
        let settings = settings_with("[hosts]\nenable = false\n[cache]\nbackend = \"redis\"\n");
        let upstream = Arc::new(UpstreamResolver::new(UpstreamConfig {
            nameservers: Vec::new(),
            timeout: Duration::from_secs(1),
            attempts: 1,
        }));

        let err = build_pipeline(&settings, upstream).err().unwrap();

        assert!(matches!(err, ProxyError::Cache(_)));
    }
}
