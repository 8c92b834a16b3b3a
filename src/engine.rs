use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::ResponseCode;
use tracing::{debug, trace};

use crate::config::Transport;
use crate::matcher::{RuntimeAction, RuntimeConfig, eval_match_chain};
use crate::proto_utils::{Query, parse_query};
use crate::response::{ResponseSynthesizer, WireSynthesizer};
use crate::tags::TagContext;
use crate::upstream::Forwarder;

/// Outcome of rule evaluation for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Spoof {
        addrs: Vec<IpAddr>,
        ttl: u32,
        rule: Arc<str>,
    },
    Static {
        rcode: ResponseCode,
        rule: Arc<str>,
    },
    Drop {
        rule: Arc<str>,
    },
    /// `rule` is `None` when no rule ended evaluation.
    Forward {
        upstream: SocketAddr,
        transport: Transport,
        rule: Option<Arc<str>>,
    },
}

impl Decision {
    pub fn rule(&self) -> Option<&str> {
        match self {
            Decision::Spoof { rule, .. } | Decision::Static { rule, .. } | Decision::Drop { rule } => {
                Some(rule)
            }
            Decision::Forward { rule, .. } => rule.as_deref(),
        }
    }
}

/// Run the rules in declaration order until one executes a terminal action.
///
/// Matchers see the tags written by earlier rules, so lookups chain through
/// rule placement alone. Without a terminal action the query goes to the
/// default upstream.
pub fn evaluate(cfg: &RuntimeConfig, query: &Query, tags: &mut TagContext) -> Decision {
    for rule in &cfg.rules {
        let matched = eval_match_chain(
            &rule.matchers,
            |m| m.operator,
            |m| m.matcher.matches(query, tags),
        );
        if !matched {
            continue;
        }
        for action in &rule.actions {
            match action {
                RuntimeAction::Log { level } => {
                    log_match(level.as_deref(), &rule.name, query.qname(), query.client_ip())
                }
                RuntimeAction::Lookup(lookup) => lookup.execute(query, tags),
                RuntimeAction::SetTag { tag, value } => tags.set(tag, value.clone()),
                RuntimeAction::Terminal(decision) => {
                    debug!(
                        event = "rule_terminal",
                        rule = %rule.name,
                        qname = %query.qname(),
                        client_ip = %query.client_ip(),
                        decision = ?decision
                    );
                    return decision.clone();
                }
            }
        }
    }

    Decision::Forward {
        upstream: cfg.default_upstream,
        transport: Transport::Udp,
        rule: None,
    }
}

#[derive(Clone)]
pub struct Engine {
    runtime: Arc<ArcSwap<RuntimeConfig>>,
    synthesizer: Arc<dyn ResponseSynthesizer>,
    forwarder: Forwarder,
}

impl Engine {
    pub fn new(runtime: Arc<ArcSwap<RuntimeConfig>>) -> Self {
        Self::with_synthesizer(runtime, Arc::new(WireSynthesizer))
    }

    pub fn with_synthesizer(
        runtime: Arc<ArcSwap<RuntimeConfig>>,
        synthesizer: Arc<dyn ResponseSynthesizer>,
    ) -> Self {
        Self {
            runtime,
            synthesizer,
            forwarder: Forwarder::new(),
        }
    }

    /// Answer one request packet. `Ok(None)` means nothing is sent back.
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> anyhow::Result<Option<Bytes>> {
        let Some(query) = parse_query(packet, peer) else {
            debug!(event = "parse_failed", peer = %peer, len = packet.len(), "dropping malformed query");
            return Ok(None);
        };

        // one snapshot per query so a reload never swaps rules mid-evaluation
        let cfg = self.runtime.load_full();
        let mut tags = TagContext::new();
        let decision = evaluate(&cfg, &query, &mut tags);
        trace!(event = "query_evaluated", qname = %query.qname(), tags = tags.len(), rule = ?decision.rule());

        match &decision {
            Decision::Forward {
                upstream,
                transport,
                ..
            } => match self
                .forwarder
                .forward(packet, *upstream, *transport, cfg.upstream_timeout())
                .await
            {
                Ok(bytes) => Ok(Some(bytes)),
                Err(_) => {
                    let servfail = Decision::Static {
                        rcode: ResponseCode::ServFail,
                        rule: Arc::from("upstream_failure"),
                    };
                    self.synthesizer.synthesize(&query, &servfail)
                }
            },
            Decision::Drop { rule } => {
                debug!(event = "query_dropped", rule = %rule, qname = %query.qname());
                Ok(None)
            }
            _ => self.synthesizer.synthesize(&query, &decision),
        }
    }
}

fn log_match(level: Option<&str>, rule_name: &str, qname: &str, client_ip: IpAddr) {
    match level.unwrap_or("info") {
        "trace" => {
            tracing::trace!(event = "matcher_log", rule = %rule_name, qname = %qname, client_ip = %client_ip, level = "trace")
        }
        "debug" => {
            tracing::debug!(event = "matcher_log", rule = %rule_name, qname = %qname, client_ip = %client_ip, level = "debug")
        }
        "warn" => {
            tracing::warn!(event = "matcher_log", rule = %rule_name, qname = %qname, client_ip = %client_ip, level = "warn")
        }
        "error" => {
            tracing::error!(event = "matcher_log", rule = %rule_name, qname = %qname, client_ip = %client_ip, level = "error")
        }
        _ => {
            tracing::info!(event = "matcher_log", rule = %rule_name, qname = %qname, client_ip = %client_ip, level = "info")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KvsConfig;
    use crate::kvs::StoreRegistry;
    use crate::kvs::testing::{FailingStore, MemoryStore, populate_lmdb};
    use futures::future::join_all;
    use hickory_proto::op::Message;
    use hickory_proto::rr::{RData, RecordType};
    use hickory_proto::serialize::binary::BinDecodable;
    use serde_json::json;
    use std::net::Ipv4Addr;
    use std::path::{Path, PathBuf};

    const QNAME_VALUE: &[u8] = b"this is the value of the qname tag";

    fn lookup_rules(path: &Path) -> serde_json::Value {
        json!({
            "settings": { "spoof_ttl": 3600 },
            "kv_stores": [
                { "name": "kvs", "type": "lmdb", "path": path, "db_name": "db-name" }
            ],
            "rules": [
                { "name": "source lookup", "matchers": [ { "type": "any" } ], "actions": [
                    { "type": "kvs_lookup", "store": "kvs", "key": { "type": "source_ip" }, "tag": "kvs-sourceip-result" }
                ] },
                { "name": "qname lookup", "actions": [
                    { "type": "kvs_lookup", "store": "kvs", "key": { "type": "qname" }, "tag": "kvs-qname-result" }
                ] },
                { "name": "chained lookup",
                  "matchers": [ { "type": "tag", "tag": "kvs-qname-result", "value": "this is the value of the qname tag" } ],
                  "actions": [
                    { "type": "kvs_lookup", "store": "kvs", "key": { "type": "tag", "tag": "kvs-qname-result" }, "tag": "kvs-tag-result" }
                ] },
                { "name": "source lookup again", "actions": [
                    { "type": "kvs_lookup", "store": "kvs", "key": { "type": "source_ip" }, "tag": "kvs-sourceip-result" }
                ] },
                { "name": "suffix lookup", "actions": [
                    { "type": "kvs_lookup", "store": "kvs", "key": { "type": "suffix" }, "tag": "kvs-suffix-result" }
                ] },
                { "name": "second tag",
                  "matchers": [ { "type": "tag", "tag": "kvs-tag-result", "value": "this is the value of the second tag" } ],
                  "actions": [ { "type": "spoof", "ips": ["1.2.3.4"] } ] },
                { "name": "suffix tag",
                  "matchers": [ { "type": "tag", "tag": "kvs-suffix-result", "value": "this is the value of the suffix tag" } ],
                  "actions": [ { "type": "spoof", "ips": ["42.42.42.42"] } ] },
                { "name": "source tag",
                  "matchers": [ { "type": "tag", "tag": "kvs-sourceip-result", "value": "this is the value of the source address tag" } ],
                  "actions": [ { "type": "spoof", "ips": ["5.6.7.8"] } ] },
                { "name": "fallback", "actions": [ { "type": "spoof", "ips": ["9.9.9.9"] } ] }
            ]
        })
    }

    fn lmdb_fixture(dir: &Path) -> RuntimeConfig {
        let path = populate_fixture(dir);
        let cfg: KvsConfig = serde_json::from_value(lookup_rules(&path)).expect("parse");
        RuntimeConfig::from_config(cfg).expect("compile")
    }

    fn populate_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("test-lmdb-db");
        let source = Ipv4Addr::new(127, 0, 0, 1).octets();
        populate_lmdb(
            &path,
            "db-name",
            &[
                (b"\x05qname\x04lmdb\x05tests\x08powerdns\x03com\x00", QNAME_VALUE),
                (&source[..], b"this is the value of the source address tag"),
                (QNAME_VALUE, b"this is the value of the second tag"),
                (
                    b"\x06suffix\x04lmdb\x05tests\x08powerdns\x03com\x00",
                    b"this is the value of the suffix tag",
                ),
            ],
        );
        path
    }

    fn spoofed(decision: &Decision) -> Vec<IpAddr> {
        match decision {
            Decision::Spoof { addrs, .. } => addrs.clone(),
            other => panic!("expected spoof, got {other:?}"),
        }
    }

    fn ask(cfg: &RuntimeConfig, name: &str, peer: &str) -> (Decision, TagContext) {
        let query = Query::from_name(name, RecordType::A, peer.parse().unwrap());
        let mut tags = TagContext::new();
        let decision = evaluate(cfg, &query, &mut tags);
        (decision, tags)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn lookup_scenarios_pick_expected_answers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = lmdb_fixture(dir.path());

        let (d, _) = ask(&cfg, "source-ip.lmdb.tests.powerdns.com", "127.0.0.1:5300");
        assert_eq!(spoofed(&d), vec![ip("5.6.7.8")]);

        let (d, tags) = ask(&cfg, "qname.lmdb.tests.powerdns.com", "127.0.0.1:5300");
        assert_eq!(spoofed(&d), vec![ip("1.2.3.4")]);
        assert_eq!(tags.get("kvs-qname-result"), Some(QNAME_VALUE));

        let (d, _) = ask(&cfg, "sub.sub.suffix.lmdb.tests.powerdns.com", "127.0.0.1:5300");
        assert_eq!(spoofed(&d), vec![ip("42.42.42.42")]);

        let (d, tags) = ask(&cfg, "other.lmdb.tests.powerdns.com", "127.0.0.2:5300");
        assert_eq!(spoofed(&d), vec![ip("9.9.9.9")]);
        assert!(tags.is_empty());
        assert_eq!(d.rule(), Some("fallback"));
    }

    #[test]
    fn bundled_config_serves_lookup_scenarios() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fixture = populate_fixture(dir.path());
        let mut cfg: KvsConfig =
            serde_json::from_str(include_str!("../config/kvsdns.json")).expect("parse");
        match &mut cfg.kv_stores[0].backend {
            crate::config::StoreBackend::Lmdb { path, .. } => *path = fixture,
            other => panic!("expected lmdb, got {other:?}"),
        }
        let cfg = RuntimeConfig::from_config(cfg).expect("compile");

        let (d, _) = ask(&cfg, "source-ip.lmdb.tests.powerdns.com", "127.0.0.1:5300");
        assert_eq!(spoofed(&d), vec![ip("5.6.7.8")]);
        let (d, _) = ask(&cfg, "qname.lmdb.tests.powerdns.com", "127.0.0.1:5300");
        assert_eq!(spoofed(&d), vec![ip("1.2.3.4")]);
        let (d, _) = ask(&cfg, "sub.sub.suffix.lmdb.tests.powerdns.com", "127.0.0.1:5300");
        assert_eq!(spoofed(&d), vec![ip("42.42.42.42")]);
        let (d, _) = ask(&cfg, "other.lmdb.tests.powerdns.com", "127.0.0.2:5300");
        assert_eq!(spoofed(&d), vec![ip("9.9.9.9")]);
        let (d, _) = ask(&cfg, "www.blocked.example", "127.0.0.2:5300");
        assert!(matches!(d, Decision::Static { rcode: ResponseCode::NXDomain, .. }));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = lmdb_fixture(dir.path());
        let first = ask(&cfg, "qname.lmdb.tests.powerdns.com", "127.0.0.1:5300");
        for _ in 0..10 {
            assert_eq!(ask(&cfg, "qname.lmdb.tests.powerdns.com", "127.0.0.1:5300"), first);
        }
    }

    #[test]
    fn no_terminal_rule_forwards_to_default_upstream() {
        let raw = json!({
            "settings": { "default_upstream": "192.0.2.53:53" },
            "rules": [ { "name": "tag only", "actions": [ { "type": "set_tag", "tag": "seen", "value": "" } ] } ]
        });
        let cfg = RuntimeConfig::compile(serde_json::from_value(raw).unwrap(), StoreRegistry::default())
            .expect("compile");
        let (d, tags) = ask(&cfg, "a.example", "127.0.0.1:53");
        assert_eq!(
            d,
            Decision::Forward {
                upstream: "192.0.2.53:53".parse().unwrap(),
                transport: Transport::Udp,
                rule: None,
            }
        );
        assert_eq!(tags.get("seen"), Some(&b""[..]));
    }

    #[test]
    fn first_terminal_action_wins() {
        let raw = json!({
            "rules": [
                { "name": "nx", "matchers": [ { "type": "domain_suffix", "value": "blocked.example" } ],
                  "actions": [ { "type": "static_response", "rcode": "NXDOMAIN" }, { "type": "drop" } ] },
                { "name": "drop", "actions": [ { "type": "drop" } ] }
            ]
        });
        let cfg = RuntimeConfig::compile(serde_json::from_value(raw).unwrap(), StoreRegistry::default())
            .expect("compile");
        let (d, _) = ask(&cfg, "www.blocked.example", "127.0.0.1:53");
        assert!(matches!(d, Decision::Static { rcode: ResponseCode::NXDomain, .. }));
        let (d, _) = ask(&cfg, "www.fine.example", "127.0.0.1:53");
        assert_eq!(d.rule(), Some("drop"));
    }

    #[test]
    fn store_failure_falls_through_to_later_rules() {
        let raw = json!({
            "rules": [
                { "name": "lookup", "actions": [
                    { "type": "kvs_lookup", "store": "broken", "key": { "type": "qname" }, "tag": "t" }
                ] },
                { "name": "hit", "matchers": [ { "type": "tag", "tag": "t" } ],
                  "actions": [ { "type": "spoof", "ips": ["1.2.3.4"] } ] },
                { "name": "fallback", "actions": [ { "type": "spoof", "ips": ["9.9.9.9"] } ] }
            ]
        });
        let mut stores = StoreRegistry::default();
        stores.insert("broken", Arc::new(FailingStore));
        let cfg = RuntimeConfig::compile(serde_json::from_value(raw).unwrap(), stores).expect("compile");
        let (d, tags) = ask(&cfg, "a.example", "127.0.0.1:53");
        assert_eq!(spoofed(&d), vec![ip("9.9.9.9")]);
        assert!(!tags.contains("t"));
    }

    #[test]
    fn empty_value_is_not_absent() {
        let raw = json!({
            "rules": [
                { "name": "lookup", "actions": [
                    { "type": "kvs_lookup", "store": "kvs", "key": { "type": "qname", "wire_format": false }, "tag": "t" }
                ] },
                { "name": "present", "matchers": [ { "type": "tag", "tag": "t", "value": "" } ],
                  "actions": [ { "type": "spoof", "ips": ["1.1.1.1"] } ] },
                { "name": "absent", "actions": [ { "type": "spoof", "ips": ["2.2.2.2"] } ] }
            ]
        });
        let mut stores = StoreRegistry::default();
        stores.insert("kvs", Arc::new(MemoryStore::with(&[(b"empty.example", b"")])));
        let cfg = RuntimeConfig::compile(serde_json::from_value(raw).unwrap(), stores).expect("compile");

        let (d, _) = ask(&cfg, "empty.example", "127.0.0.1:53");
        assert_eq!(spoofed(&d), vec![ip("1.1.1.1")]);
        let (d, _) = ask(&cfg, "missing.example", "127.0.0.1:53");
        assert_eq!(spoofed(&d), vec![ip("2.2.2.2")]);
    }

    fn wire_query(name_wire: &[u8], qtype: RecordType, id: u16) -> Vec<u8> {
        let mut p = Vec::with_capacity(12 + name_wire.len() + 4);
        p.extend_from_slice(&id.to_be_bytes());
        p.extend_from_slice(&[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        p.extend_from_slice(name_wire);
        p.extend_from_slice(&u16::from(qtype).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        p
    }

    #[tokio::test]
    async fn handle_packet_answers_and_drops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = lmdb_fixture(dir.path());
        cfg.rules.insert(
            0,
            RuntimeConfig::compile(
                serde_json::from_value(json!({
                    "rules": [ { "name": "drop any", "matchers": [ { "type": "qtype", "value": "ANY" } ],
                                 "actions": [ { "type": "drop" } ] } ]
                }))
                .unwrap(),
                StoreRegistry::default(),
            )
            .expect("compile")
            .rules
            .remove(0),
        );
        let engine = Engine::new(Arc::new(ArcSwap::from_pointee(cfg)));
        let peer: SocketAddr = "127.0.0.1:5300".parse().unwrap();

        let packet = wire_query(b"\x09source-ip\x04lmdb\x05tests\x08powerdns\x03com\x00", RecordType::A, 0x4242);
        let resp = engine.handle_packet(&packet, peer).await.unwrap().expect("response");
        let msg = Message::from_bytes(&resp).expect("decode");
        assert_eq!(msg.id(), 0x4242);
        assert_eq!(msg.answers().len(), 1);
        assert_eq!(msg.answers()[0].ttl(), 3600);
        assert_eq!(
            msg.answers()[0].data(),
            Some(&RData::A(hickory_proto::rr::rdata::A(Ipv4Addr::new(5, 6, 7, 8))))
        );

        let any = wire_query(b"\x01a\x07example\x00", RecordType::ANY, 1);
        assert!(engine.handle_packet(&any, peer).await.unwrap().is_none());

        assert!(engine.handle_packet(&[0u8; 5], peer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_queries_share_one_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(Arc::new(ArcSwap::from_pointee(lmdb_fixture(dir.path()))));
        let peer: SocketAddr = "127.0.0.1:5300".parse().unwrap();
        let packet = wire_query(b"\x05qname\x04lmdb\x05tests\x08powerdns\x03com\x00", RecordType::A, 9);

        let tasks = (0..32).map(|_| {
            let engine = engine.clone();
            let packet = packet.clone();
            tokio::spawn(async move { engine.handle_packet(&packet, peer).await })
        });
        for res in join_all(tasks).await {
            let resp = res.expect("join").expect("handle").expect("response");
            let msg = Message::from_bytes(&resp).expect("decode");
            assert_eq!(
                msg.answers()[0].data(),
                Some(&RData::A(hickory_proto::rr::rdata::A(Ipv4Addr::new(1, 2, 3, 4))))
            );
        }
    }
}
