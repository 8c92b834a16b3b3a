use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{DNSClass, RecordType};
use ipnet::IpNet;
use regex::Regex;
use tracing::warn;

use crate::config::{self, Action, ConfigError, GlobalSettings, KvsConfig, MatchOperator, Transport};
use crate::engine::Decision;
use crate::key::KeyExtractor;
use crate::kvs::StoreRegistry;
use crate::lookup::{LookupAction, StoreLookup};
use crate::proto_utils::Query;
use crate::tags::TagContext;

/// Configuration compiled for the hot path: stores opened, rules resolved.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub settings: GlobalSettings,
    /// `settings.default_upstream`, parsed.
    pub default_upstream: SocketAddr,
    pub stores: StoreRegistry,
    pub rules: Vec<RuntimeRule>,
}

#[derive(Debug, Clone)]
pub struct RuntimeRule {
    pub name: Arc<str>,
    pub matchers: Vec<RuntimeMatcherWithOp>,
    pub actions: Vec<RuntimeAction>,
}

#[derive(Debug, Clone)]
pub enum RuntimeMatcher {
    Any,
    Tag { tag: String, value: Option<Bytes> },
    KvsLookup { lookup: StoreLookup },
    DomainSuffix { value: String },
    DomainRegex { regex: Regex },
    ClientIp { net: IpNet },
    Qtype { value: RecordType },
    Qclass { value: DNSClass },
}

#[derive(Debug, Clone)]
pub struct RuntimeMatcherWithOp {
    pub operator: MatchOperator,
    pub matcher: RuntimeMatcher,
}

#[derive(Debug, Clone)]
pub enum RuntimeAction {
    Log { level: Option<String> },
    Lookup(LookupAction),
    SetTag { tag: Arc<str>, value: Bytes },
    /// Ends evaluation with a precomputed decision.
    Terminal(Decision),
}

impl RuntimeConfig {
    /// Open the declared stores and compile the rules against them.
    pub fn from_config(cfg: KvsConfig) -> Result<Self, ConfigError> {
        let stores = StoreRegistry::build(&cfg.kv_stores)?;
        Self::compile(cfg, stores)
    }

    pub fn compile(cfg: KvsConfig, stores: StoreRegistry) -> Result<Self, ConfigError> {
        let default_upstream = parse_upstream(&cfg.settings.default_upstream, "settings")?;
        let mut rules = Vec::with_capacity(cfg.rules.len());
        for r in cfg.rules {
            if r.actions.is_empty() {
                return Err(ConfigError::NoActions { rule: r.name });
            }

            let mut matchers = Vec::with_capacity(r.matchers.len());
            let mut matchers_all_default = true;
            for m in r.matchers {
                if m.operator != MatchOperator::And {
                    matchers_all_default = false;
                }
                matchers.push(RuntimeMatcherWithOp {
                    operator: m.operator,
                    matcher: RuntimeMatcher::from_config(m.matcher, &r.name, &stores)?,
                });
            }
            // a rule-level operator applies only when no matcher set its own
            if matchers_all_default && !matchers.is_empty() && r.matcher_operator != MatchOperator::And
            {
                for m in &mut matchers {
                    m.operator = r.matcher_operator;
                }
            }

            let mut actions = Vec::with_capacity(r.actions.len());
            let mut terminal_seen = false;
            for a in r.actions {
                if terminal_seen {
                    warn!(target = "config", rule = %r.name, action = ?a, "action after a terminal action is never run");
                }
                terminal_seen |= a.is_terminal();
                actions.push(RuntimeAction::from_config(
                    a,
                    &r.name,
                    &cfg.settings,
                    default_upstream,
                    &stores,
                )?);
            }

            rules.push(RuntimeRule {
                name: Arc::from(r.name),
                matchers,
                actions,
            });
        }

        Ok(Self {
            settings: cfg.settings,
            default_upstream,
            stores,
            rules,
        })
    }

    pub fn upstream_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.settings.upstream_timeout_ms)
    }
}

fn parse_upstream(value: &str, rule: &str) -> Result<SocketAddr, ConfigError> {
    value
        .trim()
        .parse::<SocketAddr>()
        .map_err(|_| ConfigError::InvalidUpstream {
            rule: rule.to_string(),
            value: value.to_string(),
        })
}

/// Tag literal from either its text or its hex form.
fn tag_literal(
    value: Option<String>,
    value_hex: Option<String>,
    rule: &str,
) -> Result<Option<Bytes>, ConfigError> {
    match (value, value_hex) {
        (Some(_), Some(_)) => Err(ConfigError::AmbiguousTagValue {
            rule: rule.to_string(),
        }),
        (Some(text), None) => Ok(Some(Bytes::from(text))),
        (None, Some(encoded)) => match hex::decode(encoded.trim()) {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(source) => Err(ConfigError::InvalidHex {
                rule: rule.to_string(),
                value: encoded,
                source,
            }),
        },
        (None, None) => Ok(None),
    }
}

fn require_tag(tag: &str, rule: &str) -> Result<(), ConfigError> {
    if tag.is_empty() {
        return Err(ConfigError::EmptyTag {
            rule: rule.to_string(),
        });
    }
    Ok(())
}

impl RuntimeMatcher {
    fn from_config(m: config::Matcher, rule: &str, stores: &StoreRegistry) -> Result<Self, ConfigError> {
        Ok(match m {
            config::Matcher::Any => RuntimeMatcher::Any,
            config::Matcher::Tag {
                tag,
                value,
                value_hex,
            } => {
                require_tag(&tag, rule)?;
                RuntimeMatcher::Tag {
                    tag,
                    value: tag_literal(value, value_hex, rule)?,
                }
            }
            config::Matcher::KvsLookup { store, key } => {
                let extractor = KeyExtractor::from_spec(&key, rule)?;
                RuntimeMatcher::KvsLookup {
                    lookup: StoreLookup::new(&store, stores.get(&store)?, extractor),
                }
            }
            config::Matcher::DomainSuffix { value } => RuntimeMatcher::DomainSuffix {
                value: value.trim_matches('.').to_ascii_lowercase(),
            },
            config::Matcher::DomainRegex { value } => RuntimeMatcher::DomainRegex {
                regex: Regex::new(&value).map_err(|source| ConfigError::InvalidRegex {
                    rule: rule.to_string(),
                    source,
                })?,
            },
            config::Matcher::ClientIp { cidr } => RuntimeMatcher::ClientIp {
                net: parse_net(&cidr).map_err(|source| ConfigError::InvalidCidr {
                    rule: rule.to_string(),
                    value: cidr.clone(),
                    source,
                })?,
            },
            config::Matcher::Qtype { value } => RuntimeMatcher::Qtype {
                value: RecordType::from_str(&value.to_ascii_uppercase()).map_err(|_| {
                    ConfigError::InvalidQtype {
                        rule: rule.to_string(),
                        value,
                    }
                })?,
            },
            config::Matcher::Qclass { value } => RuntimeMatcher::Qclass {
                value: parse_dns_class(&value).ok_or_else(|| ConfigError::InvalidQclass {
                    rule: rule.to_string(),
                    value,
                })?,
            },
        })
    }

    #[inline]
    pub fn matches(&self, query: &Query, tags: &TagContext) -> bool {
        match self {
            RuntimeMatcher::Any => true,
            RuntimeMatcher::Tag { tag, value } => match (tags.get(tag), value) {
                (Some(current), Some(expected)) => current == expected.as_ref(),
                (Some(_), None) => true,
                (None, _) => false,
            },
            RuntimeMatcher::KvsLookup { lookup } => lookup.find(query, tags).is_some(),
            RuntimeMatcher::DomainSuffix { value } => domain_suffix_matches(query.qname(), value),
            RuntimeMatcher::DomainRegex { regex } => regex.is_match(query.qname()),
            RuntimeMatcher::ClientIp { net } => net.contains(&query.client_ip()),
            RuntimeMatcher::Qtype { value } => *value == query.qtype,
            RuntimeMatcher::Qclass { value } => *value == query.qclass,
        }
    }
}

impl RuntimeAction {
    fn from_config(
        a: Action,
        rule: &str,
        settings: &GlobalSettings,
        default_upstream: SocketAddr,
        stores: &StoreRegistry,
    ) -> Result<Self, ConfigError> {
        let rule_name: Arc<str> = Arc::from(rule);
        Ok(match a {
            Action::Log { level } => RuntimeAction::Log { level },
            Action::KvsLookup { store, key, tag } => {
                require_tag(&tag, rule)?;
                let extractor = KeyExtractor::from_spec(&key, rule)?;
                RuntimeAction::Lookup(LookupAction::new(&store, stores.get(&store)?, extractor, &tag))
            }
            Action::SetTag {
                tag,
                value,
                value_hex,
            } => {
                require_tag(&tag, rule)?;
                let value = tag_literal(value, value_hex, rule)?.ok_or_else(|| {
                    ConfigError::MissingTagValue {
                        rule: rule.to_string(),
                    }
                })?;
                RuntimeAction::SetTag {
                    tag: Arc::from(tag),
                    value,
                }
            }
            Action::Spoof { ips } => {
                if ips.is_empty() {
                    return Err(ConfigError::EmptySpoof {
                        rule: rule.to_string(),
                    });
                }
                let mut addrs = Vec::with_capacity(ips.len());
                for ip in ips {
                    match ip.trim().parse::<IpAddr>() {
                        Ok(addr) => addrs.push(addr),
                        Err(_) => {
                            return Err(ConfigError::InvalidAddress {
                                rule: rule.to_string(),
                                value: ip,
                            });
                        }
                    }
                }
                RuntimeAction::Terminal(Decision::Spoof {
                    addrs,
                    ttl: settings.spoof_ttl,
                    rule: rule_name,
                })
            }
            Action::StaticResponse { rcode } => {
                let code = parse_rcode(&rcode).ok_or_else(|| ConfigError::InvalidRcode {
                    rule: rule.to_string(),
                    value: rcode.clone(),
                })?;
                RuntimeAction::Terminal(Decision::Static {
                    rcode: code,
                    rule: rule_name,
                })
            }
            Action::Deny => RuntimeAction::Terminal(Decision::Static {
                rcode: ResponseCode::Refused,
                rule: rule_name,
            }),
            Action::Drop => RuntimeAction::Terminal(Decision::Drop { rule: rule_name }),
            Action::Allow => RuntimeAction::Terminal(Decision::Forward {
                upstream: default_upstream,
                transport: Transport::Udp,
                rule: Some(rule_name),
            }),
            Action::Forward {
                upstream,
                transport,
            } => RuntimeAction::Terminal(Decision::Forward {
                upstream: match upstream {
                    Some(addr) => parse_upstream(&addr, rule)?,
                    None => default_upstream,
                },
                transport: transport.unwrap_or(Transport::Udp),
                rule: Some(rule_name),
            }),
        })
    }
}

/// Evaluate a left-to-right chain where each item carries its own operator.
/// The first item's result seeds the accumulator; empty chains default to true.
#[inline]
pub fn eval_match_chain<T>(
    entries: &[T],
    mut op_of: impl FnMut(&T) -> MatchOperator,
    mut pred: impl FnMut(&T) -> bool,
) -> bool {
    let mut iter = entries.iter();
    let Some(first) = iter.next() else {
        return true;
    };
    let mut acc = pred(first);
    for item in iter {
        match op_of(item) {
            MatchOperator::And => {
                if !acc {
                    continue;
                }
                acc = pred(item);
            }
            MatchOperator::Or => {
                if acc {
                    continue;
                }
                acc = pred(item);
            }
            MatchOperator::AndNot => {
                if !acc {
                    continue;
                }
                acc = !pred(item);
            }
            MatchOperator::OrNot => {
                if acc {
                    continue;
                }
                acc = !pred(item);
            }
        };
    }
    acc
}

/// Label-aligned suffix test on lowercase names without trailing dots.
fn domain_suffix_matches(qname: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return true;
    }
    match qname.strip_suffix(suffix) {
        Some("") => true,
        Some(rest) => rest.ends_with('.'),
        None => false,
    }
}

fn parse_net(cidr: &str) -> Result<IpNet, ipnet::AddrParseError> {
    let s = cidr.trim();
    match s.parse::<IpNet>() {
        Ok(net) => Ok(net),
        // a bare address means a host route
        Err(err) => s.parse::<IpAddr>().map(IpNet::from).map_err(|_| err),
    }
}

pub(crate) fn parse_rcode(rcode: &str) -> Option<ResponseCode> {
    match rcode.to_ascii_uppercase().as_str() {
        "NOERROR" => Some(ResponseCode::NoError),
        "FORMERR" => Some(ResponseCode::FormErr),
        "SERVFAIL" => Some(ResponseCode::ServFail),
        "NXDOMAIN" => Some(ResponseCode::NXDomain),
        "NOTIMP" => Some(ResponseCode::NotImp),
        "REFUSED" => Some(ResponseCode::Refused),
        _ => None,
    }
}

fn parse_dns_class(v: &str) -> Option<DNSClass> {
    match v.to_ascii_uppercase().as_str() {
        "IN" => Some(DNSClass::IN),
        "CH" | "CHAOS" => Some(DNSClass::CH),
        "HS" => Some(DNSClass::HS),
        _ => None,
    }
}
