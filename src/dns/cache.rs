// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! TTL-aware caching over [`NetResolver`], with a hosts-format file source.
//!
//! File entries are authoritative and do not decay. Network entries expire
//! at `received_at + ttl`; resolution failures are cached negatively with a
//! short floor TTL so a flapping upstream is not hammered.

use crate::config::ComponentConfig;
use crate::components::{Component, ComponentContext, ComponentFactory};
use crate::dns::resolver::{DnsResults, NetResolver};
use crate::error::Error;
use crate::exec::TaskProcessor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// TTL attributed to file-sourced answers when one is needed.
const FILE_TTL: Duration = Duration::from_secs(86400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    File,
    Network,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    addrs: Vec<IpAddr>,
    received_at: Instant,
    ttl: Duration,
    /// A cached `NotResolved`.
    negative: bool,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now >= self.received_at + self.ttl
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub nameserver: SocketAddr,
    pub query_timeout: Duration,
    pub max_attempts: u32,
    pub hosts_file: Option<PathBuf>,
    pub negative_ttl_floor: Duration,
}

impl ResolverConfig {
    pub fn new(nameserver: SocketAddr) -> Self {
        Self {
            nameserver,
            query_timeout: Duration::from_secs(1),
            max_attempts: 3,
            hosts_file: None,
            negative_ttl_floor: Duration::from_secs(5),
        }
    }
}

/// The caching resolver component.
pub struct Resolver {
    net: NetResolver,
    file_entries: HashMap<String, Vec<IpAddr>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    negative_ttl_floor: Duration,
}

impl Resolver {
    pub fn new(processor: TaskProcessor, config: ResolverConfig) -> Result<Self, Error> {
        let file_entries = match &config.hosts_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(Error::NetworkFailure)?;
                parse_hosts(&text)
            }
            None => HashMap::new(),
        };

        Ok(Self {
            net: NetResolver::new(
                processor,
                config.query_timeout,
                config.max_attempts,
                config.nameserver,
            ),
            file_entries,
            cache: Mutex::new(HashMap::new()),
            negative_ttl_floor: config.negative_ttl_floor,
        })
    }

    pub async fn resolve(&self, name: &str) -> Result<DnsResults, Error> {
        let name = name.to_ascii_lowercase();

        if let Some(addrs) = self.file_entries.get(&name) {
            return Ok(DnsResults {
                addrs: addrs.clone(),
                ttl: FILE_TTL,
                received_at: Instant::now(),
            });
        }

        let now = Instant::now();
        if let Some(entry) = self.lookup_cached(&name, now) {
            if entry.negative {
                return Err(Error::NotResolved);
            }
            return Ok(DnsResults {
                addrs: entry.addrs,
                ttl: entry.ttl.saturating_sub(now - entry.received_at),
                received_at: entry.received_at,
            });
        }

        match self.net.resolve(&name).await {
            Ok(results) => {
                self.cache.lock().insert(
                    name,
                    CacheEntry {
                        addrs: results.addrs.clone(),
                        received_at: results.received_at,
                        ttl: results.ttl,
                        negative: false,
                    },
                );
                Ok(results)
            }
            Err(Error::NotResolved) => {
                self.cache.lock().insert(
                    name,
                    CacheEntry {
                        addrs: Vec::new(),
                        received_at: Instant::now(),
                        ttl: self.negative_ttl_floor,
                        negative: true,
                    },
                );
                Err(Error::NotResolved)
            }
            Err(err) => Err(err),
        }
    }

    fn lookup_cached(&self, name: &str, now: Instant) -> Option<CacheEntry> {
        let mut cache = self.cache.lock();
        match cache.get(name) {
            Some(entry) if entry.expired(now) => {
                cache.remove(name);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Where an answer for `name` would come from right now.
    pub fn source_of(&self, name: &str) -> Option<CacheSource> {
        let name = name.to_ascii_lowercase();
        if self.file_entries.contains_key(&name) {
            return Some(CacheSource::File);
        }
        self.lookup_cached(&name, Instant::now())
            .map(|_| CacheSource::Network)
    }

    pub fn flush(&self, name: &str) {
        self.cache.lock().remove(&name.to_ascii_lowercase());
    }

    pub fn flush_all(&self) {
        self.cache.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn cached_names(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Component for Resolver {}

impl ComponentFactory for Resolver {
    const NAME: &'static str = "dns-resolver";

    fn new(config: &ComponentConfig, context: &ComponentContext) -> Result<Self, Error> {
        let nameserver: String = config.get("nameserver")?;
        let nameserver: SocketAddr = nameserver.parse().map_err(Error::user)?;

        let mut resolver_config = ResolverConfig::new(nameserver);
        if let Some(timeout_ms) = config.get_opt::<u64>("query_timeout_ms")? {
            resolver_config.query_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(attempts) = config.get_opt("max_attempts")? {
            resolver_config.max_attempts = attempts;
        }
        resolver_config.hosts_file = config.get_opt("hosts_file")?;
        if let Some(floor_ms) = config.get_opt::<u64>("negative_ttl_floor_ms")? {
            resolver_config.negative_ttl_floor = Duration::from_millis(floor_ms);
        }

        Self::new(context.default_task_processor().clone(), resolver_config)
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("net", &self.net)
            .field("file_entries", &self.file_entries.len())
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

/// Parse hosts-format text: `address name [name...]`, `#` comments.
fn parse_hosts(text: &str) -> HashMap<String, Vec<IpAddr>> {
    let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(addr) = fields.next().and_then(|f| f.parse::<IpAddr>().ok()) else {
            continue;
        };
        for name in fields {
            entries
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(addr);
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_format_parses_names_and_comments() {
        let text = "\
# local services
127.0.0.1 localhost localhost.localdomain
::1 localhost  # v6 too
10.0.0.7 db.internal
garbage line without an address
";
        let entries = parse_hosts(text);
        assert_eq!(
            entries["localhost"],
            vec!["127.0.0.1".parse::<IpAddr>().unwrap(), "::1".parse().unwrap()]
        );
        assert_eq!(entries["db.internal"], vec!["10.0.0.7".parse::<IpAddr>().unwrap()]);
        assert!(!entries.contains_key("garbage"));
    }
}
