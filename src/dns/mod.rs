// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! TTL-aware asynchronous name resolution.
//!
//! [`NetResolver`] speaks to one UDP name server; [`Resolver`] layers a TTL
//! cache and a hosts-format file source on top and plugs into the component
//! container.

pub mod cache;
pub mod resolver;
pub mod wire;

pub use cache::{CacheSource, Resolver, ResolverConfig};
pub use resolver::{DnsResults, NetResolver};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::exec::block_on;
    use crate::test_util::{DnsServerMock, MockFailure, fixture};
    use crate::dns::wire::{Answer, Question, RData, RecordType};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const V4_1: Ipv4Addr = Ipv4Addr::new(77, 88, 55, 55);
    const V4_2: Ipv4Addr = Ipv4Addr::new(77, 88, 55, 60);

    fn v6() -> Ipv6Addr {
        "2a02:6b8:a::a".parse().unwrap()
    }

    fn answer_a(name: &str, ip: Ipv4Addr, ttl: u32) -> Answer {
        Answer {
            name: name.to_owned(),
            data: RData::A(ip),
            ttl,
        }
    }

    fn answer_aaaa(name: &str, ip: Ipv6Addr, ttl: u32) -> Answer {
        Answer {
            name: name.to_owned(),
            data: RData::Aaaa(ip),
            ttl,
        }
    }

    fn answer_cname(name: &str, target: &str) -> Answer {
        Answer {
            name: name.to_owned(),
            data: RData::Cname(target.to_owned()),
            ttl: 0,
        }
    }

    fn resolver_for(
        rt: &crate::test_util::TestRuntime,
        mock: &DnsServerMock,
        max_attempts: u32,
    ) -> NetResolver {
        NetResolver::new(
            rt.processor.clone(),
            Duration::from_secs(5),
            max_attempts,
            mock.addr(),
        )
    }

    fn is_expected_v4(addr: &IpAddr) -> bool {
        *addr == IpAddr::V4(V4_1) || *addr == IpAddr::V4(V4_2)
    }

    #[test]
    fn smoke() {
        let rt = fixture();
        let mock = DnsServerMock::new(|query: &Question| match (query.name.as_str(), query.rtype)
        {
            ("a.test", RecordType::A) => Ok(vec![
                answer_a("a.test", V4_1, 13),
                answer_a("a.test", V4_2, 42),
            ]),
            ("a.test", RecordType::Aaaa) => Ok(vec![answer_aaaa("a.test", v6(), 1337)]),
            _ => Err(MockFailure::ServFail),
        });

        let resolver = resolver_for(&rt, &mock, 1);
        let result = block_on(resolver.spawn_resolve("a.test").unwrap())
            .unwrap()
            .unwrap();

        assert_eq!(result.addrs.len(), 3);
        assert_eq!(result.addrs[0], IpAddr::V6(v6()));
        assert!(is_expected_v4(&result.addrs[1]));
        assert!(is_expected_v4(&result.addrs[2]));
        assert_eq!(result.ttl, Duration::from_secs(13));
        assert!(result.received_at.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn single_family_names_resolve_alone() {
        let rt = fixture();
        let mock = DnsServerMock::new(|query: &Question| match (query.name.as_str(), query.rtype)
        {
            ("v4.test", RecordType::A) => Ok(vec![
                answer_a("v4.test", V4_1, 13),
                answer_a("v4.test", V4_2, 42),
            ]),
            ("v4.test", RecordType::Aaaa) => Ok(vec![]),
            ("v6.test", RecordType::Aaaa) => Ok(vec![answer_aaaa("v6.test", v6(), 1337)]),
            ("v6.test", RecordType::A) => Ok(vec![]),
            _ => Err(MockFailure::ServFail),
        });

        let resolver = resolver_for(&rt, &mock, 1);

        let result = block_on(resolver.spawn_resolve("v4.test").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(result.addrs.len(), 2);
        assert!(result.addrs.iter().all(is_expected_v4));
        assert_eq!(result.ttl, Duration::from_secs(13));

        let result = block_on(resolver.spawn_resolve("v6.test").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(result.addrs, vec![IpAddr::V6(v6())]);
        assert_eq!(result.ttl, Duration::from_secs(1337));
    }

    #[test]
    fn cname_answers_in_one_response() {
        let rt = fixture();
        let mock = DnsServerMock::new(|query: &Question| match (query.name.as_str(), query.rtype)
        {
            ("alias.test", RecordType::A) => Ok(vec![
                answer_cname("alias.test", "yandex.ru"),
                answer_a("yandex.ru", V4_1, 9),
                answer_a("yandex.ru", V4_2, 8),
            ]),
            ("alias.test", RecordType::Aaaa) => Ok(vec![
                answer_cname("alias.test", "yandex.ru"),
                answer_aaaa("yandex.ru", v6(), 7),
            ]),
            _ => Err(MockFailure::ServFail),
        });

        let resolver = resolver_for(&rt, &mock, 1);
        let result = block_on(resolver.spawn_resolve("alias.test").unwrap())
            .unwrap()
            .unwrap();

        assert_eq!(result.addrs.len(), 3);
        assert_eq!(result.addrs[0], IpAddr::V6(v6()));
        assert!(is_expected_v4(&result.addrs[1]));
        assert!(is_expected_v4(&result.addrs[2]));
        assert_eq!(result.ttl, Duration::from_secs(7));
    }

    #[test]
    fn cname_only_answers_are_chased() {
        let rt = fixture();
        let mock = DnsServerMock::new(|query: &Question| match (query.name.as_str(), query.rtype)
        {
            ("alias.test", _) => Ok(vec![answer_cname("alias.test", "target.test")]),
            ("target.test", RecordType::A) => Ok(vec![answer_a("target.test", V4_1, 5)]),
            ("target.test", RecordType::Aaaa) => Ok(vec![]),
            _ => Err(MockFailure::ServFail),
        });

        let resolver = resolver_for(&rt, &mock, 1);
        let result = block_on(resolver.spawn_resolve("alias.test").unwrap())
            .unwrap()
            .unwrap();

        assert_eq!(result.addrs, vec![IpAddr::V4(V4_1)]);
        assert_eq!(result.ttl, Duration::from_secs(5));
    }

    #[test]
    fn cname_loops_fail_cleanly() {
        let rt = fixture();
        let mock = DnsServerMock::new(|query: &Question| match query.name.as_str() {
            "loop.test" => Ok(vec![answer_cname("loop.test", "pool.test")]),
            "pool.test" => Ok(vec![answer_cname("pool.test", "loop.test")]),
            _ => Err(MockFailure::ServFail),
        });

        let resolver = resolver_for(&rt, &mock, 1);
        let result = block_on(resolver.spawn_resolve("loop.test").unwrap()).unwrap();
        assert!(matches!(result, Err(Error::NotResolved)));
    }

    #[test]
    fn partial_failure_returns_the_healthy_family() {
        let rt = fixture();
        let servfails = Arc::new(AtomicUsize::new(0));
        let servfails2 = Arc::clone(&servfails);

        let mock = DnsServerMock::new(move |query: &Question| {
            if query.name == "x.test" && query.rtype == RecordType::Aaaa {
                return Ok(vec![answer_aaaa("x.test", v6(), 300)]);
            }
            servfails2.fetch_add(1, Ordering::SeqCst);
            Err(MockFailure::ServFail)
        });

        let resolver = resolver_for(&rt, &mock, 2);
        let result = block_on(resolver.spawn_resolve("x.test").unwrap())
            .unwrap()
            .unwrap();

        assert!(servfails.load(Ordering::SeqCst) >= 1);
        assert_eq!(result.addrs, vec![IpAddr::V6(v6())]);
        assert_eq!(result.ttl, Duration::from_secs(300));
    }

    #[test]
    fn timed_out_family_does_not_mask_the_other() {
        let rt = fixture();
        let mock = DnsServerMock::new(|query: &Question| match (query.name.as_str(), query.rtype)
        {
            ("slow.test", RecordType::Aaaa) => Ok(vec![answer_aaaa("slow.test", v6(), 300)]),
            ("slow.test", RecordType::A) => Err(MockFailure::NoReply),
            _ => Err(MockFailure::ServFail),
        });

        // short query timeout so the silent A query fails fast
        let resolver = NetResolver::new(
            rt.processor.clone(),
            Duration::from_millis(100),
            1,
            mock.addr(),
        );
        let result = block_on(resolver.spawn_resolve("slow.test").unwrap())
            .unwrap()
            .unwrap();

        assert_eq!(result.addrs, vec![IpAddr::V6(v6())]);
        assert_eq!(result.ttl, Duration::from_secs(300));
    }

    #[test]
    fn total_failure_is_not_resolved() {
        let rt = fixture();
        let mock = DnsServerMock::new(|_: &Question| Err(MockFailure::ServFail));

        let resolver = resolver_for(&rt, &mock, 1);
        let result = block_on(resolver.spawn_resolve("x.test").unwrap()).unwrap();
        assert!(matches!(result, Err(Error::NotResolved)));
    }

    #[test]
    fn empty_answers_resolve_to_an_empty_set() {
        let rt = fixture();
        let mock = DnsServerMock::new(|_: &Question| Ok(vec![]));

        let resolver = resolver_for(&rt, &mock, 1);
        let result = block_on(resolver.spawn_resolve("nothing.test").unwrap())
            .unwrap()
            .unwrap();
        assert!(result.addrs.is_empty());
    }

    #[test]
    fn network_answers_are_cached_until_expiry() {
        let rt = fixture();
        let mock = DnsServerMock::new(|query: &Question| match query.rtype {
            RecordType::A => Ok(vec![answer_a(&query.name, V4_1, 300)]),
            _ => Ok(vec![]),
        });

        let resolver = Arc::new(
            Resolver::new(
                rt.processor.clone(),
                ResolverConfig::new(mock.addr()),
            )
            .unwrap(),
        );

        let resolver2 = Arc::clone(&resolver);
        let first = block_on(
            rt.processor
                .spawn(async move { resolver2.resolve("cached.test").await })
                .unwrap(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(first.addrs, vec![IpAddr::V4(V4_1)]);
        let after_first = mock.queries_handled();
        assert!(after_first >= 2, "expected A+AAAA queries");

        let resolver2 = Arc::clone(&resolver);
        let second = block_on(
            rt.processor
                .spawn(async move { resolver2.resolve("cached.test").await })
                .unwrap(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(second.addrs, vec![IpAddr::V4(V4_1)]);
        assert_eq!(mock.queries_handled(), after_first, "cache was bypassed");
        assert_eq!(resolver.source_of("cached.test"), Some(CacheSource::Network));

        resolver.flush("cached.test");
        assert_eq!(resolver.cached_names(), 0);

        let resolver2 = Arc::clone(&resolver);
        block_on(
            rt.processor
                .spawn(async move { resolver2.resolve("cached.test").await })
                .unwrap(),
        )
        .unwrap()
        .unwrap();
        assert!(mock.queries_handled() > after_first, "flush had no effect");
    }

    #[test]
    fn failures_are_cached_negatively() {
        let rt = fixture();
        let mock = DnsServerMock::new(|_: &Question| Err(MockFailure::ServFail));

        let resolver = Arc::new(
            Resolver::new(
                rt.processor.clone(),
                ResolverConfig {
                    max_attempts: 1,
                    ..ResolverConfig::new(mock.addr())
                },
            )
            .unwrap(),
        );

        let resolver2 = Arc::clone(&resolver);
        let first = block_on(
            rt.processor
                .spawn(async move { resolver2.resolve("down.test").await })
                .unwrap(),
        )
        .unwrap();
        assert!(matches!(first, Err(Error::NotResolved)));
        let after_first = mock.queries_handled();

        let resolver2 = Arc::clone(&resolver);
        let second = block_on(
            rt.processor
                .spawn(async move { resolver2.resolve("down.test").await })
                .unwrap(),
        )
        .unwrap();
        assert!(matches!(second, Err(Error::NotResolved)));
        assert_eq!(
            mock.queries_handled(),
            after_first,
            "negative cache was bypassed"
        );
    }

    #[test]
    fn file_entries_win_over_the_network() {
        let rt = fixture();
        let mock = DnsServerMock::new(|_: &Question| Err(MockFailure::ServFail));

        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");
        std::fs::write(&hosts, "10.0.0.7 db.internal\n").unwrap();

        let resolver = Arc::new(
            Resolver::new(
                rt.processor.clone(),
                ResolverConfig {
                    hosts_file: Some(hosts),
                    ..ResolverConfig::new(mock.addr())
                },
            )
            .unwrap(),
        );

        assert_eq!(resolver.source_of("db.internal"), Some(CacheSource::File));

        let resolver2 = Arc::clone(&resolver);
        let result = block_on(
            rt.processor
                .spawn(async move { resolver2.resolve("DB.internal").await })
                .unwrap(),
        )
        .unwrap()
        .unwrap();

        assert_eq!(result.addrs, vec!["10.0.0.7".parse::<IpAddr>().unwrap()]);
        assert_eq!(mock.queries_handled(), 0, "file entry hit the network");
    }
}
