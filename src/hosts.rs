//! Static hosts-file overrides.
//!
//! The table is loaded once at startup and never modified afterwards, so it
//! can be shared between query tasks without locking.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to read hosts file {path}: {source}")]
pub struct HostsError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Address family a lookup asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Domain to address overrides, one address per domain.
#[derive(Debug, Default)]
pub struct HostsTable {
    entries: FxHashMap<String, IpAddr>,
}

impl HostsTable {
    /// Load a hosts file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HostsError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| HostsError {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self::parse(&contents))
    }

    /// Parse hosts-file text.
    ///
    /// The first token of a line is the address and the last is the domain.
    /// Comments, blank lines and malformed lines are skipped; a later line
    /// for the same domain replaces an earlier one.
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .filter_map(|line| {
                let line = line.trim().to_lowercase();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }

                let tokens: Vec<&str> = line.split_whitespace().collect();
                if tokens.len() < 2 {
                    return None;
                }

                let addr: IpAddr = tokens[0].parse().ok()?;
                let domain = tokens[tokens.len() - 1];
                if !is_domain(domain) {
                    return None;
                }

                Some((domain.to_string(), addr))
            })
            .collect();

        Self { entries }
    }

    /// Look up the override for `domain` in the requested family.
    ///
    /// Matching is exact (no wildcards, no parent domains). An entry of the
    /// other family is treated as absent.
    pub fn lookup(&self, domain: &str, family: AddressFamily) -> Option<IpAddr> {
        let addr = self.entries.get(domain.to_lowercase().as_str())?;
        match (family, addr) {
            (AddressFamily::V4, IpAddr::V4(_)) | (AddressFamily::V6, IpAddr::V6(_)) => Some(*addr),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_domain(token: &str) -> bool {
    if token.parse::<IpAddr>().is_ok() {
        return false;
    }
    token
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HOSTS: &str = "\
# local overrides
127.0.0.1   localhost
10.0.0.5    NAS.Home.Lan
fd00::10    printer.home.lan
192.168.1.1\trouter router.home.lan

not-an-ip   broken.home.lan
10.0.0.9
10.0.0.7    10.0.0.8
10.0.0.6    nas.home.lan
";

    #[test]
    fn parse_skips_comments_blank_and_malformed_lines() {
        let hosts = HostsTable::parse(HOSTS);

        assert_eq!(hosts.len(), 4);
        assert!(hosts.lookup("broken.home.lan", AddressFamily::V4).is_none());
        assert!(hosts.lookup("10.0.0.8", AddressFamily::V4).is_none());
    }

    #[test]
    fn parse_uses_last_token_as_domain() {
        let hosts = HostsTable::parse(HOSTS);

        assert_eq!(
            hosts.lookup("router.home.lan", AddressFamily::V4),
            Some("192.168.1.1".parse().unwrap())
        );
        assert!(hosts.lookup("router", AddressFamily::V4).is_none());
    }

    #[test]
    fn later_duplicate_wins() {
        let hosts = HostsTable::parse(HOSTS);

        assert_eq!(
            hosts.lookup("nas.home.lan", AddressFamily::V4),
            Some("10.0.0.6".parse().unwrap())
        );
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let hosts = HostsTable::parse(HOSTS);

        assert!(hosts.lookup("NAS.HOME.LAN", AddressFamily::V4).is_some());
    }

    #[test]
    fn lookup_respects_address_family() {
        let hosts = HostsTable::parse(HOSTS);

        assert!(hosts.lookup("localhost", AddressFamily::V6).is_none());
        assert!(hosts.lookup("printer.home.lan", AddressFamily::V4).is_none());
        assert_eq!(
            hosts.lookup("printer.home.lan", AddressFamily::V6),
            Some("fd00::10".parse().unwrap())
        );
    }

    #[test]
    fn lookup_does_not_match_subdomains() {
        let hosts = HostsTable::parse(HOSTS);

        assert!(hosts.lookup("www.localhost", AddressFamily::V4).is_none());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.1.2.3 files.example.com").unwrap();

        let hosts = HostsTable::load(file.path()).unwrap();

        assert_eq!(
            hosts.lookup("files.example.com", AddressFamily::V4),
            Some("10.1.2.3".parse().unwrap())
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let err = HostsTable::load("/nonexistent/hosts").unwrap_err();

        assert_eq!(err.path, PathBuf::from("/nonexistent/hosts"));
    }
}
