//! Per-query answer pipeline.
//!
//! Composes a registry lookup, a health filter, and a router selection
//! into one response. The handler owns long-lived references to the
//! registry and the health capability; reconfiguration swaps state behind
//! them without invalidating the handler.

use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use super::wire::{
    Message, Question, Rcode, Record, RecordType, CLASS_IN, MAX_UDP_PAYLOAD,
};
use crate::backend::Backend;
use crate::health::{HealthProvider, HealthState};
use crate::metrics;
use crate::registry::{DomainEntry, Registry};
use crate::router::ClientContext;

/// Transport a query arrived over; decides the response size budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

const TCP_PAYLOAD_LIMIT: usize = u16::MAX as usize;

pub struct QueryHandler {
    registry: Arc<Registry>,
    health: Arc<dyn HealthProvider>,
    return_last_healthy: bool,
}

impl QueryHandler {
    pub fn new(
        registry: Arc<Registry>,
        health: Arc<dyn HealthProvider>,
        return_last_healthy: bool,
    ) -> Self {
        Self {
            registry,
            health,
            return_last_healthy,
        }
    }

    /// Answer one raw query. Returns `None` only for messages that cannot
    /// be answered at all (too short to carry an id, or already a
    /// response).
    pub fn handle(
        &self,
        buf: &[u8],
        transport: Transport,
        client_ip: Option<IpAddr>,
    ) -> Option<Vec<u8>> {
        let start = Instant::now();

        let message = match Message::decode(buf) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Failed to decode query");
                // Echo the id if the wire carried one
                if buf.len() < 2 {
                    return None;
                }
                let id = u16::from_be_bytes([buf[0], buf[1]]);
                let response = build_response(id, false, Rcode::FormErr, None, Vec::new());
                return self.finish(response, transport, None, start);
            }
        };

        // Never answer answers; that way lies reflection
        if message.header.response {
            return None;
        }

        let id = message.header.id;
        let rd = message.header.recursion_desired;
        let payload_limit = message.edns_payload_size();

        if message.questions.len() != 1 {
            debug!(
                questions = message.questions.len(),
                "Rejecting query without exactly one question"
            );
            let response = build_response(id, rd, Rcode::FormErr, None, Vec::new());
            return self.finish(response, transport, payload_limit, start);
        }
        let question = message.questions.into_iter().next().unwrap();

        if question.qclass != CLASS_IN {
            let response =
                build_response(id, rd, Rcode::NotImp, Some(&question), Vec::new());
            return self.finish(response, transport, payload_limit, start);
        }

        let Some(entry) = self.registry.lookup(&question.name) else {
            debug!(name = %question.name, "No entry for queried name");
            let response =
                build_response(id, rd, Rcode::NxDomain, Some(&question), Vec::new());
            return self.finish(response, transport, payload_limit, start);
        };

        let wants_ipv6 = match question.qtype {
            RecordType::A => false,
            RecordType::Aaaa => true,
            RecordType::Any => {
                let response =
                    build_response(id, rd, Rcode::NotImp, Some(&question), Vec::new());
                return self.finish(response, transport, payload_limit, start);
            }
            // Other record types are not our responsibility
            _ => {
                let response =
                    build_response(id, rd, Rcode::NoError, Some(&question), Vec::new());
                return self.finish(response, transport, payload_limit, start);
            }
        };

        let selected = match self.select(&entry, wants_ipv6, client_ip) {
            Ok(selected) => selected,
            Err(()) => {
                let response =
                    build_response(id, rd, Rcode::ServFail, Some(&question), Vec::new());
                return self.finish(response, transport, payload_limit, start);
            }
        };

        let answers: Vec<Record> = selected
            .iter()
            .filter_map(|backend| match backend.address {
                IpAddr::V4(address) if !wants_ipv6 => {
                    Some(Record::a(&question.name, entry.ttl, address))
                }
                IpAddr::V6(address) if wants_ipv6 => {
                    Some(Record::aaaa(&question.name, entry.ttl, address))
                }
                _ => None,
            })
            .collect();

        let response = build_response(id, rd, Rcode::NoError, Some(&question), answers);
        self.finish(response, transport, payload_limit, start)
    }

    /// Health-filter the entry's servers, apply stale-serve, and run the
    /// router. A router panic is contained here and surfaces as SERVFAIL
    /// for this query only.
    fn select(
        &self,
        entry: &DomainEntry,
        wants_ipv6: bool,
        client_ip: Option<IpAddr>,
    ) -> Result<Vec<Backend>, ()> {
        let family: Vec<&Backend> = entry
            .servers
            .iter()
            .filter(|b| b.is_ipv6() == wants_ipv6)
            .collect();

        let mut candidates: Vec<Backend> = family
            .iter()
            .filter(|b| {
                match self.health.status(&b.id()) {
                    Some(snapshot) => {
                        matches!(snapshot.state, HealthState::Healthy | HealthState::Unknown)
                    }
                    // Not yet registered with the manager: same contract
                    // as Unknown
                    None => true,
                }
            })
            .map(|b| (*b).clone())
            .collect();

        if candidates.is_empty() && self.return_last_healthy {
            // Serve-stale: every candidate is unhealthy, fall back to the
            // ones that have been healthy at least once
            candidates = family
                .iter()
                .filter(|b| {
                    self.health
                        .status(&b.id())
                        .map(|s| s.last_healthy.is_some())
                        .unwrap_or(false)
                })
                .map(|b| (*b).clone())
                .collect();
            if !candidates.is_empty() {
                debug!(fqdn = %entry.fqdn, "Serving last known healthy set");
                metrics::record_stale_serve(&entry.fqdn);
            }
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ctx = ClientContext {
            client_ip,
            region_hint: None,
        };

        catch_unwind(AssertUnwindSafe(|| entry.router.select(&candidates, &ctx))).map_err(
            |_| {
                error!(
                    fqdn = %entry.fqdn,
                    algorithm = entry.router.algorithm(),
                    "Router panicked during selection"
                );
            },
        )
    }

    fn finish(
        &self,
        response: Message,
        transport: Transport,
        payload_limit: Option<usize>,
        start: Instant,
    ) -> Option<Vec<u8>> {
        let limit = match transport {
            Transport::Udp => payload_limit.unwrap_or(MAX_UDP_PAYLOAD),
            Transport::Tcp => TCP_PAYLOAD_LIMIT,
        };

        match response.encode(limit) {
            Ok(bytes) => {
                metrics::record_query(
                    response.header.rcode.as_str(),
                    start.elapsed().as_secs_f64(),
                );
                Some(bytes)
            }
            Err(e) => {
                error!(error = %e, "Failed to encode response");
                None
            }
        }
    }
}

fn build_response(
    id: u16,
    recursion_desired: bool,
    rcode: Rcode,
    question: Option<&Question>,
    answers: Vec<Record>,
) -> Message {
    use super::wire::Header;

    Message {
        header: Header {
            id,
            response: true,
            opcode: 0,
            // We are authoritative for every name we serve
            authoritative: true,
            truncated: false,
            recursion_desired,
            recursion_available: false,
            rcode,
            question_count: question.map(|_| 1).unwrap_or(0),
            answer_count: answers.len() as u16,
            authority_count: 0,
            additional_count: 0,
        },
        questions: question.cloned().into_iter().collect(),
        answers,
        authorities: Vec::new(),
        additionals: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::backend::BackendId;
    use crate::config::RoutingAlgorithm;
    use crate::dns::wire::{self, RecordData};
    use crate::geo::{GeoLookup, NoGeo};
    use crate::health::HealthSnapshot;
    use crate::registry::{canonicalize, DomainEntry};
    use crate::router::{NoLatency, Router, RouterDeps};

    struct FakeHealth(HashMap<BackendId, HealthSnapshot>);

    impl FakeHealth {
        fn new() -> Self {
            Self(HashMap::new())
        }

        fn with(mut self, backend: &Backend, state: HealthState, ever_healthy: bool) -> Self {
            self.0.insert(
                backend.id(),
                HealthSnapshot {
                    state,
                    last_check: Some(Utc::now()),
                    last_healthy: ever_healthy.then(Utc::now),
                },
            );
            self
        }
    }

    impl HealthProvider for FakeHealth {
        fn status(&self, id: &BackendId) -> Option<HealthSnapshot> {
            self.0.get(id).cloned()
        }

        fn all_status(&self) -> HashMap<BackendId, HealthSnapshot> {
            self.0.clone()
        }
    }

    struct FixedGeo(&'static str);

    impl GeoLookup for FixedGeo {
        fn region_of(&self, _ip: IpAddr) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn backend(addr: &str, port: u16, region: &str) -> Backend {
        Backend {
            address: addr.parse().unwrap(),
            port,
            weight: 100,
            region: region.into(),
            host: None,
        }
    }

    fn deps() -> RouterDeps {
        RouterDeps {
            geo: Arc::new(NoGeo),
            latency: Arc::new(NoLatency),
        }
    }

    fn entry(
        fqdn: &str,
        ttl: u32,
        servers: Vec<Backend>,
        algorithm: RoutingAlgorithm,
        deps: &RouterDeps,
        fallback: Option<String>,
    ) -> DomainEntry {
        DomainEntry {
            fqdn: canonicalize(fqdn),
            ttl,
            servers,
            router: Router::new(algorithm, deps, fallback),
        }
    }

    fn handler(
        entries: Vec<DomainEntry>,
        health: FakeHealth,
        return_last_healthy: bool,
    ) -> QueryHandler {
        let registry = Arc::new(Registry::new());
        registry.replace_all(entries);
        QueryHandler::new(registry, Arc::new(health), return_last_healthy)
    }

    fn ask(handler: &QueryHandler, name: &str, qtype: RecordType) -> Message {
        let bytes = wire::query(42, name, qtype).encode(512).unwrap();
        let response = handler
            .handle(&bytes, Transport::Udp, Some("198.51.100.7".parse().unwrap()))
            .expect("expected a response");
        Message::decode(&response).unwrap()
    }

    fn answer_ips(message: &Message) -> Vec<String> {
        message
            .answers
            .iter()
            .map(|r| match &r.data {
                RecordData::A(ip) => ip.to_string(),
                RecordData::Aaaa(ip) => ip.to_string(),
                RecordData::Opaque(_) => panic!("unexpected opaque answer"),
            })
            .collect()
    }

    #[test]
    fn test_single_healthy_backend_answer() {
        let b = backend("10.0.1.10", 80, "us-east-1");
        let health = FakeHealth::new().with(&b, HealthState::Healthy, true);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![b],
                RoutingAlgorithm::RoundRobin,
                &deps(),
                None,
            )],
            health,
            false,
        );

        let response = ask(&h, "app.example.com", RecordType::A);
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert!(response.header.authoritative);
        assert!(response.header.response);
        assert_eq!(answer_ips(&response), vec!["10.0.1.10"]);
        assert_eq!(response.answers[0].ttl, 30);
    }

    #[test]
    fn test_round_robin_alternates_across_queries() {
        let a = backend("10.0.1.10", 80, "us-east-1");
        let b = backend("10.0.1.11", 80, "us-east-1");
        let health = FakeHealth::new()
            .with(&a, HealthState::Healthy, true)
            .with(&b, HealthState::Healthy, true);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![a, b],
                RoutingAlgorithm::RoundRobin,
                &deps(),
                None,
            )],
            health,
            false,
        );

        let picks: Vec<String> = (0..6)
            .map(|_| answer_ips(&ask(&h, "app.example.com", RecordType::A))[0].clone())
            .collect();
        assert_eq!(
            picks,
            vec![
                "10.0.1.10",
                "10.0.1.11",
                "10.0.1.10",
                "10.0.1.11",
                "10.0.1.10",
                "10.0.1.11"
            ]
        );
    }

    #[test]
    fn test_failover_skips_unhealthy_first_region() {
        let east = backend("10.0.1.10", 80, "us-east-1");
        let west = backend("10.0.2.10", 80, "us-west-2");
        let health = FakeHealth::new()
            .with(&east, HealthState::Unhealthy, true)
            .with(&west, HealthState::Healthy, true);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![east, west],
                RoutingAlgorithm::Failover,
                &deps(),
                None,
            )],
            health,
            false,
        );

        let response = ask(&h, "app.example.com", RecordType::A);
        assert_eq!(answer_ips(&response), vec!["10.0.2.10"]);
    }

    #[test]
    fn test_geolocation_falls_back_to_default_region() {
        let east = backend("10.0.1.10", 80, "us-east-1");
        let health = FakeHealth::new().with(&east, HealthState::Healthy, true);
        let geo_deps = RouterDeps {
            geo: Arc::new(FixedGeo("eu-west-1")),
            latency: Arc::new(NoLatency),
        };
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![east],
                RoutingAlgorithm::Geolocation,
                &geo_deps,
                Some("us-east-1".into()),
            )],
            health,
            false,
        );

        let response = ask(&h, "app.example.com", RecordType::A);
        assert_eq!(answer_ips(&response), vec!["10.0.1.10"]);
    }

    #[test]
    fn test_unknown_name_is_nxdomain() {
        let h = handler(Vec::new(), FakeHealth::new(), false);
        let response = ask(&h, "missing.example.com", RecordType::A);
        assert_eq!(response.header.rcode, Rcode::NxDomain);
        assert!(response.header.authoritative);
        assert!(response.answers.is_empty());
        assert!(response.authorities.is_empty());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let b = backend("10.0.1.10", 80, "us-east-1");
        let health = FakeHealth::new().with(&b, HealthState::Healthy, true);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![b],
                RoutingAlgorithm::Failover,
                &deps(),
                None,
            )],
            health,
            false,
        );

        let response = ask(&h, "APP.Example.COM", RecordType::A);
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert_eq!(response.answers.len(), 1);
    }

    #[test]
    fn test_multi_question_is_formerr() {
        let h = handler(Vec::new(), FakeHealth::new(), false);
        let mut message = wire::query(42, "app.example.com", RecordType::A);
        message.questions.push(Question {
            name: "other.example.com".into(),
            qtype: RecordType::A,
            qclass: CLASS_IN,
        });
        message.header.question_count = 2;
        let bytes = message.encode(512).unwrap();

        let response = h.handle(&bytes, Transport::Udp, None).unwrap();
        let decoded = Message::decode(&response).unwrap();
        assert_eq!(decoded.header.rcode, Rcode::FormErr);
        assert_eq!(decoded.header.id, 42);
    }

    #[test]
    fn test_zero_questions_is_formerr() {
        let h = handler(Vec::new(), FakeHealth::new(), false);
        let mut message = wire::query(42, "app.example.com", RecordType::A);
        message.questions.clear();
        message.header.question_count = 0;
        let bytes = message.encode(512).unwrap();

        let response = h.handle(&bytes, Transport::Udp, None).unwrap();
        let decoded = Message::decode(&response).unwrap();
        assert_eq!(decoded.header.rcode, Rcode::FormErr);
    }

    #[test]
    fn test_garbage_bytes_get_formerr_with_echoed_id() {
        let h = handler(Vec::new(), FakeHealth::new(), false);
        let response = h
            .handle(&[0xAB, 0xCD, 0xFF, 0x01, 0x02], Transport::Udp, None)
            .unwrap();
        let decoded = Message::decode(&response).unwrap();
        assert_eq!(decoded.header.rcode, Rcode::FormErr);
        assert_eq!(decoded.header.id, 0xABCD);
    }

    #[test]
    fn test_any_query_is_notimp() {
        let b = backend("10.0.1.10", 80, "us-east-1");
        let health = FakeHealth::new().with(&b, HealthState::Healthy, true);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![b],
                RoutingAlgorithm::RoundRobin,
                &deps(),
                None,
            )],
            health,
            false,
        );
        let response = ask(&h, "app.example.com", RecordType::Any);
        assert_eq!(response.header.rcode, Rcode::NotImp);

        // The lookup runs first: ANY for an unknown name is NXDOMAIN
        let response = ask(&h, "missing.example.com", RecordType::Any);
        assert_eq!(response.header.rcode, Rcode::NxDomain);
    }

    #[test]
    fn test_non_in_class_is_notimp() {
        let h = handler(Vec::new(), FakeHealth::new(), false);
        let mut message = wire::query(42, "app.example.com", RecordType::A);
        message.questions[0].qclass = 3; // CHAOS
        let bytes = message.encode(512).unwrap();

        let response = h.handle(&bytes, Transport::Udp, None).unwrap();
        let decoded = Message::decode(&response).unwrap();
        assert_eq!(decoded.header.rcode, Rcode::NotImp);
    }

    #[test]
    fn test_other_types_get_noerror_empty() {
        let b = backend("10.0.1.10", 80, "us-east-1");
        let health = FakeHealth::new().with(&b, HealthState::Healthy, true);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![b],
                RoutingAlgorithm::RoundRobin,
                &deps(),
                None,
            )],
            health,
            false,
        );

        // TXT
        let response = ask(&h, "app.example.com", RecordType::Other(16));
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn test_family_filter_for_aaaa() {
        let v4 = backend("10.0.1.10", 80, "us-east-1");
        let v6 = backend("2001:db8::10", 80, "us-east-1");
        let health = FakeHealth::new()
            .with(&v4, HealthState::Healthy, true)
            .with(&v6, HealthState::Healthy, true);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![v4, v6],
                RoutingAlgorithm::Failover,
                &deps(),
                None,
            )],
            health,
            false,
        );

        let response = ask(&h, "app.example.com", RecordType::Aaaa);
        assert_eq!(answer_ips(&response), vec!["2001:db8::10"]);
        assert_eq!(response.answers[0].rtype, RecordType::Aaaa);

        let response = ask(&h, "app.example.com", RecordType::A);
        assert_eq!(answer_ips(&response), vec!["10.0.1.10"]);
    }

    #[test]
    fn test_unknown_state_is_served() {
        let b = backend("10.0.1.10", 80, "us-east-1");
        let health = FakeHealth::new().with(&b, HealthState::Unknown, false);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![b],
                RoutingAlgorithm::RoundRobin,
                &deps(),
                None,
            )],
            health,
            false,
        );

        let response = ask(&h, "app.example.com", RecordType::A);
        assert_eq!(response.answers.len(), 1);
    }

    #[test]
    fn test_all_unhealthy_without_stale_serve_is_empty_noerror() {
        let b = backend("10.0.1.10", 80, "us-east-1");
        let health = FakeHealth::new().with(&b, HealthState::Unhealthy, true);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![b],
                RoutingAlgorithm::RoundRobin,
                &deps(),
                None,
            )],
            health,
            false,
        );

        let response = ask(&h, "app.example.com", RecordType::A);
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn test_stale_serve_returns_last_healthy_set() {
        let b = backend("10.0.1.10", 80, "us-east-1");
        let health = FakeHealth::new().with(&b, HealthState::Unhealthy, true);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![b],
                RoutingAlgorithm::RoundRobin,
                &deps(),
                None,
            )],
            health,
            true,
        );

        let response = ask(&h, "app.example.com", RecordType::A);
        assert_eq!(answer_ips(&response), vec!["10.0.1.10"]);
    }

    #[test]
    fn test_stale_serve_without_history_stays_empty() {
        let b = backend("10.0.1.10", 80, "us-east-1");
        let health = FakeHealth::new().with(&b, HealthState::Unhealthy, false);
        let h = handler(
            vec![entry(
                "app.example.com",
                30,
                vec![b],
                RoutingAlgorithm::RoundRobin,
                &deps(),
                None,
            )],
            health,
            true,
        );

        let response = ask(&h, "app.example.com", RecordType::A);
        assert_eq!(response.header.rcode, Rcode::NoError);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn test_rd_flag_is_echoed_and_ra_clear() {
        let h = handler(Vec::new(), FakeHealth::new(), false);

        let mut message = wire::query(42, "x.example.com", RecordType::A);
        message.header.recursion_desired = false;
        let bytes = message.encode(512).unwrap();
        let response = h.handle(&bytes, Transport::Udp, None).unwrap();
        let decoded = Message::decode(&response).unwrap();
        assert!(!decoded.header.recursion_desired);
        assert!(!decoded.header.recursion_available);
    }

    #[test]
    fn test_responses_are_dropped() {
        let h = handler(Vec::new(), FakeHealth::new(), false);
        let mut message = wire::query(42, "app.example.com", RecordType::A);
        message.header.response = true;
        let bytes = message.encode(512).unwrap();
        assert!(h.handle(&bytes, Transport::Udp, None).is_none());
    }
}
