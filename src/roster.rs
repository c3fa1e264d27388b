//! Upstream roster (C1, spec.md §4.1).
//!
//! An immutable, capacity-bounded set of resolver IPv4 addresses loaded
//! once at startup. `10.0.0.0/8`, `127.0.0.0/8` and `192.168.0.0/16` are
//! rejected to avoid loops and local exposure.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::ConfigError;

/// Maximum number of nameservers accepted from the resolver file.
pub const MAX_NAMESERVERS: usize = 32;

pub struct Roster {
    addrs: Vec<Ipv4Addr>,
}

impl Roster {
    /// Loads a roster from a resolver file: one dotted-quad IPv4 address
    /// per line, `#`-comments, blank lines and lines starting with a
    /// space skipped, malformed lines reported and skipped. Fails with
    /// `EmptyRoster` if nothing usable remains.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ResolverFile {
            path: path.to_path_buf(),
            source,
        })?;

        let mut addrs = Vec::with_capacity(MAX_NAMESERVERS);
        for (lineno, raw) in text.lines().enumerate() {
            if addrs.len() >= MAX_NAMESERVERS {
                log::warn!(
                    "resolver file {}: capacity ({}) reached, discarding remaining lines",
                    path.display(),
                    MAX_NAMESERVERS
                );
                break;
            }

            let line = raw.trim_end();
            if line.is_empty() || line.starts_with('#') || line.starts_with(' ') {
                continue;
            }

            match line.parse::<Ipv4Addr>() {
                Ok(addr) if is_local(addr) => {
                    log::warn!(
                        "resolver file {}:{}: rejecting local/loopback address {}",
                        path.display(),
                        lineno + 1,
                        addr
                    );
                }
                Ok(addr) => addrs.push(addr),
                Err(_) => log::warn!(
                    "resolver file {}:{}: malformed address {:?}, skipped",
                    path.display(),
                    lineno + 1,
                    line
                ),
            }
        }

        if addrs.is_empty() {
            return Err(ConfigError::EmptyRoster(path_buf(path)));
        }

        Ok(Self { addrs })
    }

    /// Builds a roster directly from a list of addresses, applying the
    /// same loopback/RFC1918 filter as `load`. Used by tests.
    #[cfg(test)]
    pub fn from_addrs(addrs: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            addrs: addrs.into_iter().filter(|a| !is_local(*a)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Uniformly random selection with replacement; `None` if the
    /// roster is empty (the event loop must then refuse to initiate
    /// new upstream connections).
    pub fn select(&self, rng: &mut impl Rng) -> Option<Ipv4Addr> {
        if self.addrs.is_empty() {
            None
        } else {
            let idx = rng.random_range(0..self.addrs.len());
            Some(self.addrs[idx])
        }
    }
}

fn path_buf(path: &Path) -> PathBuf {
    path.to_path_buf()
}

fn is_local(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 10 || o[0] == 127 || (o[0] == 192 && o[1] == 168)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loopback_resolver_rejected() {
        let f = write_temp("127.0.0.53\n");
        let err = Roster::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRoster(_)));
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let f = write_temp("# a comment\n\n 8.8.8.8\n9.9.9.9\n");
        let roster = Roster::load(f.path()).unwrap();
        // the leading-space line is a comment per spec, only 9.9.9.9 survives
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn malformed_line_skipped_not_fatal() {
        let f = write_temp("not-an-ip\n9.9.9.9\n");
        let roster = Roster::load(f.path()).unwrap();
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn capacity_bounded() {
        let mut body = String::new();
        for i in 0..(MAX_NAMESERVERS + 5) {
            body.push_str(&format!("9.9.{}.{}\n", i / 256, i % 256));
        }
        let f = write_temp(&body);
        let roster = Roster::load(f.path()).unwrap();
        assert_eq!(roster.len(), MAX_NAMESERVERS);
    }

    #[test]
    fn select_is_uniform_over_nonempty_roster() {
        let roster = Roster::from_addrs([
            Ipv4Addr::new(9, 9, 9, 9),
            Ipv4Addr::new(1, 1, 1, 1),
        ]);
        let mut rng = rand::rng();
        for _ in 0..50 {
            assert!(roster.select(&mut rng).is_some());
        }
    }

    #[test]
    fn select_on_empty_roster_is_none() {
        let roster = Roster::from_addrs(std::iter::empty());
        let mut rng = rand::rng();
        assert!(roster.select(&mut rng).is_none());
    }
}
