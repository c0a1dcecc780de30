//! Proxy settings, loaded once from TOML at startup.
//!
//! Every section and field has a default so a partial file (or none of
//! the optional sections) is valid. Key names of older configuration files
//! are accepted as aliases.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::filter::FilterConfig;

const DNS_PORT: u16 = 53;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Emit a debug event for every pipeline decision.
    #[serde(alias = "Debug")]
    pub debug: bool,

    pub server: ServerSettings,

    pub resolv: ResolvSettings,

    pub log: LogSettings,

    pub cache: CacheSettings,

    pub hosts: HostsSettings,

    pub filters: FilterSettings,
}

/// Listener address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DNS_PORT,
        }
    }
}

/// Upstream nameserver discovery.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolvSettings {
    #[serde(rename = "resolv-file")]
    pub resolv_file: PathBuf,

    /// Per-exchange deadline in seconds. Unset falls back to the resolv
    /// file's `options timeout:` and then to five seconds.
    pub timeout: Option<u64>,

    /// Explicit upstreams (`ip` or `ip:port`); overrides `resolv-file`.
    pub nameservers: Vec<String>,
}

impl Default for ResolvSettings {
    fn default() -> Self {
        Self {
            resolv_file: PathBuf::from("/etc/resolv.conf"),
            timeout: None,
            nameservers: Vec::new(),
        }
    }
}

impl ResolvSettings {
    /// Parse the explicit nameserver list, defaulting the port to 53.
    pub fn explicit_nameservers(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.nameservers
            .iter()
            .map(|entry| parse_nameserver(entry))
            .collect()
    }
}

fn parse_nameserver(entry: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok(addr);
    }
    entry
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| ConfigError::Validation(format!("invalid nameserver address '{entry}'")))
}

/// Log destination.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log file path; empty logs to stdout.
    pub file: String,
}

/// Response cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: String,

    /// Entry lifetime in seconds.
    pub expire: u64,

    #[serde(rename = "maxcount")]
    pub max_count: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            expire: 600,
            max_count: 10_000,
        }
    }
}

/// Hosts-file overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostsSettings {
    pub enable: bool,

    #[serde(rename = "host-file")]
    pub host_file: PathBuf,

    /// TTL of answers synthesized from the hosts file.
    pub ttl: u32,
}

impl Default for HostsSettings {
    fn default() -> Self {
        Self {
            enable: true,
            host_file: PathBuf::from("/etc/hosts"),
            ttl: 600,
        }
    }
}

/// Query and answer policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    #[serde(rename = "restrict-to-ip-types", alias = "onlyipq")]
    pub restrict_to_ip_types: bool,

    pub suffixes: Vec<String>,

    #[serde(rename = "answer-ip-prefixes", alias = "ipfilter")]
    pub answer_ip_prefixes: Vec<String>,

    /// IPv4 address answered when resolution fails; empty disables it.
    #[serde(rename = "sinkhole-address", alias = "swapnxdip")]
    pub sinkhole_address: String,

    #[serde(rename = "sinkhole-ttl", alias = "swapnxdttl")]
    pub sinkhole_ttl: u32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            restrict_to_ip_types: false,
            suffixes: Vec::new(),
            answer_ip_prefixes: Vec::new(),
            sinkhole_address: String::new(),
            sinkhole_ttl: 60,
        }
    }
}

impl FilterSettings {
    fn sinkhole(&self) -> Result<Option<Ipv4Addr>, ConfigError> {
        let address = self.sinkhole_address.trim();
        if address.is_empty() {
            return Ok(None);
        }
        address.parse().map(Some).map_err(|_| {
            ConfigError::Validation(format!("sinkhole address '{address}' is not an IPv4 address"))
        })
    }
}

/// Command-line overrides for configuration.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub upstreams: Vec<String>,
    pub debug: bool,
}

impl Settings {
    /// Load settings from `path` and apply command-line overrides.
    pub fn load(path: &Path, overrides: CliOverrides) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.display().to_string(), e.to_string()))?;
        let mut settings = Self::from_toml(&contents)?;
        settings.apply_cli_overrides(overrides);
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_cli_overrides(&mut self, overrides: CliOverrides) {
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(bind) = overrides.bind {
            self.server.host = bind;
        }
        if !overrides.upstreams.is_empty() {
            self.resolv.nameservers = overrides.upstreams;
        }
        if overrides.debug {
            self.debug = true;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("DNS port cannot be 0".to_string()));
        }
        self.bind_addr()?;

        if self.resolv.timeout == Some(0) {
            return Err(ConfigError::Validation(
                "upstream timeout must be at least one second".to_string(),
            ));
        }
        self.resolv.explicit_nameservers()?;

        if self.cache.expire == 0 {
            return Err(ConfigError::Validation(
                "cache expiry must be at least one second".to_string(),
            ));
        }
        if self.cache.max_count == 0 {
            return Err(ConfigError::Validation(
                "cache maxcount must be greater than 0".to_string(),
            ));
        }

        self.filters.sinkhole()?;

        Ok(())
    }

    /// Socket address the listeners bind to.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.server.host.parse().map_err(|_| {
            ConfigError::Validation(format!("invalid bind address '{}'", self.server.host))
        })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Build the filter rules. Suffixes are lowercased and lose any trailing
    /// dot, matching how question names are normalized.
    pub fn filter_config(&self) -> Result<FilterConfig, ConfigError> {
        Ok(FilterConfig {
            restrict_to_ip_types: self.filters.restrict_to_ip_types,
            allowed_suffixes: self
                .filters
                .suffixes
                .iter()
                .map(|s| s.trim().trim_end_matches('.').to_lowercase())
                .collect(),
            allowed_answer_ip_prefixes: self
                .filters
                .answer_ip_prefixes
                .iter()
                .map(|s| s.trim().to_string())
                .collect(),
            sinkhole_address: self.filters.sinkhole()?,
            sinkhole_ttl: self.filters.sinkhole_ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();

        assert!(!settings.debug);
        assert_eq!(settings.server.port, 53);
        assert_eq!(settings.cache.backend, "memory");
        assert_eq!(settings.cache.max_count, 10_000);
        assert!(settings.hosts.enable);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn parses_full_file() {
        let settings = Settings::from_toml(
            r#"
            debug = true

            [server]
            host = "0.0.0.0"
            port = 5353

            [resolv]
            resolv-file = "/tmp/resolv.conf"
            timeout = 2
            nameservers = ["1.1.1.1", "9.9.9.9:5353"]

            [log]
            file = "/var/log/dnsproxy.log"

            [cache]
            backend = "memory"
            expire = 300
            maxcount = 500

            [hosts]
            enable = false
            host-file = "/tmp/hosts"
            ttl = 120

            [filters]
            restrict-to-ip-types = true
            suffixes = [".Example.com"]
            answer-ip-prefixes = ["93.184."]
            sinkhole-address = "127.0.0.2"
            sinkhole-ttl = 30
            "#,
        )
        .unwrap();

        assert!(settings.debug);
        assert_eq!(settings.bind_addr().unwrap(), "0.0.0.0:5353".parse().unwrap());
        assert_eq!(
            settings.resolv.explicit_nameservers().unwrap(),
            vec!["1.1.1.1:53".parse().unwrap(), "9.9.9.9:5353".parse().unwrap()]
        );
        assert_eq!(settings.log.file, "/var/log/dnsproxy.log");
        assert_eq!(settings.cache.max_count, 500);
        assert!(!settings.hosts.enable);

        let filters = settings.filter_config().unwrap();
        assert!(filters.restrict_to_ip_types);
        assert_eq!(filters.allowed_suffixes, vec![".example.com"]);
        assert_eq!(filters.sinkhole_address, Some(Ipv4Addr::new(127, 0, 0, 2)));
        assert_eq!(filters.sinkhole_ttl, 30);
    }

    #[test]
    fn accepts_legacy_filter_keys() {
        let settings = Settings::from_toml(
            r#"
            [filters]
            onlyipq = true
            ipfilter = ["10."]
            swapnxdip = "0.0.0.0"
            swapnxdttl = 5
            "#,
        )
        .unwrap();

        let filters = settings.filter_config().unwrap();
        assert!(filters.restrict_to_ip_types);
        assert_eq!(filters.allowed_answer_ip_prefixes, vec!["10."]);
        assert_eq!(filters.sinkhole_address, Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(filters.sinkhole_ttl, 5);
    }

    #[test]
    fn fully_qualified_suffixes_still_match() {
        let settings =
            Settings::from_toml("[filters]\nsuffixes = [\"example.com.\", \".corp.lan.\"]").unwrap();

        let filters = settings.filter_config().unwrap();

        assert_eq!(filters.allowed_suffixes, vec!["example.com", ".corp.lan"]);
        assert_eq!(
            crate::filter::suffix_check("example.com", &filters.allowed_suffixes),
            crate::filter::Verdict::Allow
        );
        assert_eq!(
            crate::filter::suffix_check("a.corp.lan", &filters.allowed_suffixes),
            crate::filter::Verdict::Allow
        );
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        assert!(matches!(
            Settings::from_toml("[server\nport = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.cache.max_count = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.filters.sinkhole_address = "::1".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.server.host = "localhost".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.resolv.nameservers = vec!["dns.google".to_string()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn cli_overrides_win() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 5300").unwrap();

        let settings = Settings::load(
            file.path(),
            CliOverrides {
                port: Some(5400),
                bind: Some("::1".to_string()),
                upstreams: vec!["8.8.8.8".to_string()],
                debug: true,
            },
        )
        .unwrap();

        assert_eq!(settings.bind_addr().unwrap(), "[::1]:5400".parse().unwrap());
        assert_eq!(settings.resolv.nameservers, vec!["8.8.8.8"]);
        assert!(settings.debug);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Settings::load(Path::new("/nonexistent/dnsproxy.toml"), CliOverrides::default())
            .unwrap_err();

        assert!(matches!(err, ConfigError::FileRead(..)));
    }
}
