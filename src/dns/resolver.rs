// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous name resolution against a UDP name server.
//!
//! A and AAAA queries are dispatched concurrently as tasks on the resolver's
//! processor; all I/O suspends on the reactor, never a worker thread. Per
//! query, `SERVFAIL` is retried with exponential backoff and jitter; any
//! other failure — a query timeout included — is fatal for that query only.
//! CNAME-only answers are chased with a bounded, loop-checked chain. One
//! family failing is tolerated; both failing is `NotResolved`. Only the
//! resolving task's own cancellation aborts the whole resolution.

use crate::dns::wire::{self, RData, RecordType};
use crate::error::Error;
use crate::exec::TaskProcessor;
use crate::reactor::UdpSocket;
use crate::task::JoinHandle;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_CNAME_CHAIN: usize = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_JITTER_MS: u64 = 20;

/// A completed resolution: AAAA addresses first, then A; `ttl` is the
/// minimum across the answers that contributed addresses.
#[derive(Debug, Clone)]
pub struct DnsResults {
    pub addrs: Vec<IpAddr>,
    pub ttl: Duration,
    pub received_at: Instant,
}

struct NetResolverInner {
    processor: TaskProcessor,
    server: SocketAddr,
    query_timeout: Duration,
    max_attempts: u32,
}

/// Resolver talking straight to one UDP name server, no caching.
#[derive(Clone)]
pub struct NetResolver {
    inner: Arc<NetResolverInner>,
}

/// What one address family's query chain produced.
struct FamilyAnswer {
    addrs: Vec<IpAddr>,
    min_ttl: Option<u32>,
}

impl NetResolver {
    pub fn new(
        processor: TaskProcessor,
        query_timeout: Duration,
        max_attempts: u32,
        server: SocketAddr,
    ) -> Self {
        Self {
            inner: Arc::new(NetResolverInner {
                processor,
                server,
                query_timeout,
                max_attempts: max_attempts.max(1),
            }),
        }
    }

    /// Resolve on the resolver's processor; the handle is awaitable from
    /// anywhere.
    pub fn spawn_resolve(
        &self,
        name: &str,
    ) -> Result<JoinHandle<Result<DnsResults, Error>>, Error> {
        let this = self.clone();
        let name = name.to_owned();
        self.inner
            .processor
            .spawn(async move { this.resolve(&name).await })
    }

    pub async fn resolve(&self, name: &str) -> Result<DnsResults, Error> {
        let a_task = {
            let this = self.clone();
            let name = name.to_owned();
            self.inner
                .processor
                .spawn(async move { this.query_family(&name, RecordType::A).await })?
        };
        let aaaa_task = {
            let this = self.clone();
            let name = name.to_owned();
            self.inner
                .processor
                .spawn(async move { this.query_family(&name, RecordType::Aaaa).await })?
        };

        let (a_result, aaaa_result) = futures::join!(a_task, aaaa_task);
        let a_result = a_result.and_then(|inner| inner);
        let aaaa_result = aaaa_result.and_then(|inner| inner);

        // A child query failing with `Deadline`/`Cancelled` is a per-family
        // failure like any other; only the resolution task itself being
        // cancelled aborts the whole lookup.
        if let Some(err) = crate::task::pending_cancellation() {
            return Err(err);
        }

        let (v4, v6) = match (a_result, aaaa_result) {
            (Err(a_err), Err(aaaa_err)) => {
                tracing::debug!(
                    name,
                    "both families failed: A: {a_err}; AAAA: {aaaa_err}"
                );
                return Err(Error::NotResolved);
            }
            (Ok(v4), Err(aaaa_err)) => {
                tracing::debug!(name, "AAAA lookup failed: {aaaa_err}");
                (v4, FamilyAnswer { addrs: Vec::new(), min_ttl: None })
            }
            (Err(a_err), Ok(v6)) => {
                tracing::debug!(name, "A lookup failed: {a_err}");
                (FamilyAnswer { addrs: Vec::new(), min_ttl: None }, v6)
            }
            (Ok(v4), Ok(v6)) => (v4, v6),
        };

        let mut addrs = v6.addrs;
        addrs.extend(v4.addrs);
        let ttl = match (v6.min_ttl, v4.min_ttl) {
            (Some(a), Some(b)) => a.min(b),
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => 0,
        };

        Ok(DnsResults {
            addrs,
            ttl: Duration::from_secs(u64::from(ttl)),
            received_at: Instant::now(),
        })
    }

    /// One address family's full query chain, CNAME indirection included.
    async fn query_family(&self, name: &str, rtype: RecordType) -> Result<FamilyAnswer, Error> {
        let mut target = name.to_ascii_lowercase();
        let mut visited = HashSet::new();
        visited.insert(target.clone());

        for _ in 0..MAX_CNAME_CHAIN {
            let answers = self.query_with_retries(&target, rtype).await?;

            let mut addrs = Vec::new();
            let mut min_ttl: Option<u32> = None;
            let mut cname: Option<String> = None;
            for answer in answers {
                match answer.data {
                    RData::A(ip) if rtype == RecordType::A => {
                        addrs.push(IpAddr::V4(ip));
                        min_ttl = Some(min_ttl.map_or(answer.ttl, |ttl| ttl.min(answer.ttl)));
                    }
                    RData::Aaaa(ip) if rtype == RecordType::Aaaa => {
                        addrs.push(IpAddr::V6(ip));
                        min_ttl = Some(min_ttl.map_or(answer.ttl, |ttl| ttl.min(answer.ttl)));
                    }
                    RData::Cname(chain_target) => cname = Some(chain_target),
                    _ => {}
                }
            }

            if !addrs.is_empty() {
                return Ok(FamilyAnswer { addrs, min_ttl });
            }
            if let Some(next) = cname {
                if !visited.insert(next.clone()) {
                    tracing::warn!(name, "CNAME loop via {next}");
                    return Err(Error::NotResolved);
                }
                tracing::trace!(name, "following CNAME to {next}");
                target = next;
                continue;
            }
            // an authoritative "no records of this type"
            return Ok(FamilyAnswer {
                addrs: Vec::new(),
                min_ttl: None,
            });
        }

        tracing::warn!(name, "CNAME chain exceeds {MAX_CNAME_CHAIN}");
        Err(Error::NotResolved)
    }

    async fn query_with_retries(
        &self,
        name: &str,
        rtype: RecordType,
    ) -> Result<Vec<wire::Answer>, Error> {
        let mut backoff = BACKOFF_BASE;
        for attempt in 0..self.inner.max_attempts {
            let response = self.query_once(name, rtype).await?;
            match response.rcode {
                wire::RCODE_NOERROR => return Ok(response.answers),
                wire::RCODE_NXDOMAIN => return Ok(Vec::new()),
                wire::RCODE_SERVFAIL => {
                    tracing::debug!(
                        name,
                        ?rtype,
                        attempt,
                        "name server answered SERVFAIL"
                    );
                    if attempt + 1 < self.inner.max_attempts {
                        let jitter = Duration::from_millis(fastrand::u64(..=BACKOFF_JITTER_MS));
                        let reactor = self.inner.processor.reactor().clone();
                        reactor.sleep(backoff + jitter).await?;
                        backoff *= 2;
                    }
                }
                other => return Err(Error::ServerFailure(other)),
            }
        }
        Err(Error::ServerFailure(wire::RCODE_SERVFAIL))
    }

    /// One request/response exchange, bounded by the query timeout. Stray
    /// datagrams (wrong peer, wrong id, garbage) are ignored, not fatal.
    async fn query_once(&self, name: &str, rtype: RecordType) -> Result<wire::Response, Error> {
        let reactor = self.inner.processor.reactor();
        let bind_addr: SocketAddr = match self.inner.server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(reactor, bind_addr)?;

        let id = fastrand::u16(..);
        let query = wire::encode_query(id, name, rtype)?;
        let server = self.inner.server;

        let exchange = async {
            socket.send_to(&query, server).await?;
            let mut buf = [0u8; 4096];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from != server {
                    continue;
                }
                match wire::parse_response(&buf[..len]) {
                    Ok(response) if response.id == id => return Ok(response),
                    Ok(_) | Err(_) => continue,
                }
            }
        };

        match reactor.timeout(self.inner.query_timeout, exchange).await {
            Ok(result) => result,
            // the query timer elapsed: fatal for this query, not for the
            // resolution — report it as a plain network failure
            Err(Error::Deadline) => Err(Error::NetworkFailure(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "name server did not answer within the query timeout",
            ))),
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for NetResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetResolver")
            .field("server", &self.inner.server)
            .field("query_timeout", &self.inner.query_timeout)
            .field("max_attempts", &self.inner.max_attempts)
            .finish()
    }
}
