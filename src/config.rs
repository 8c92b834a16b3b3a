use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct KvsConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    /// Key-value stores available to lookup rules, by logical name.
    #[serde(default)]
    pub kv_stores: Vec<StoreConfig>,
    /// Evaluated strictly in declaration order.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// UDP listen address; defaults to an unprivileged port.
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    #[serde(default = "default_bind_tcp")]
    pub bind_tcp: String,
    /// Upstream used when no rule answers the query.
    #[serde(default = "default_upstream")]
    pub default_upstream: String,
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// TTL of records synthesized by `spoof`.
    #[serde(default = "default_spoof_ttl")]
    pub spoof_ttl: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            bind_tcp: default_bind_tcp(),
            default_upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            spoof_ttl: default_spoof_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub name: String,
    #[serde(flatten)]
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
    Lmdb {
        path: PathBuf,
        /// Named database inside the environment; empty selects the unnamed one.
        #[serde(default)]
        db_name: String,
        /// Environment is a directory rather than a single file.
        #[serde(default)]
        subdir: bool,
    },
    Cdb {
        path: PathBuf,
        /// Seconds between checks for a replaced file; 0 never checks.
        #[serde(default = "default_cdb_refresh_secs")]
        refresh_secs: u64,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub matchers: Vec<MatcherWithOp>,
    #[serde(default = "default_match_operator")]
    pub matcher_operator: MatchOperator,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Matcher {
    Any,
    /// With `value` (or `value_hex` for arbitrary bytes): exact byte
    /// equality. Without either: the tag is present.
    Tag {
        tag: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        value_hex: Option<String>,
    },
    /// True when any candidate key is present in the store.
    KvsLookup { store: String, key: KeySpec },
    /// Case-insensitive domain suffix.
    DomainSuffix {
        value: String,
    },
    /// Matched against the lowercase question name without trailing dot.
    DomainRegex {
        value: String,
    },
    ClientIp {
        cidr: String,
    },
    /// Query type such as A/AAAA/TXT.
    Qtype {
        value: String,
    },
    /// Query class such as IN/CH/HS.
    Qclass {
        value: String,
    },
}

/// How the lookup key is built from the query.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySpec {
    /// Packed source address, host bits beyond the masks cleared.
    SourceIp {
        #[serde(default = "default_v4_mask")]
        v4_mask: u8,
        #[serde(default = "default_v6_mask")]
        v6_mask: u8,
    },
    Qname {
        #[serde(default = "default_wire_format")]
        wire_format: bool,
    },
    /// Longest stored suffix of the question name.
    Suffix {
        #[serde(default)]
        min_labels: usize,
        #[serde(default = "default_wire_format")]
        wire_format: bool,
    },
    /// Current value of another tag.
    Tag { tag: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Log the match; level is trace/debug/info/warn/error.
    Log { level: Option<String> },
    /// Look the key up and store the value (or absence) into `tag`.
    KvsLookup {
        store: String,
        key: KeySpec,
        tag: String,
    },
    /// Set a tag to a literal value, given as text or as hex.
    SetTag {
        tag: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        value_hex: Option<String>,
    },
    /// Answer with the given addresses (A and/or AAAA).
    Spoof { ips: Vec<String> },
    /// Answer with a fixed rcode such as NXDOMAIN.
    StaticResponse { rcode: String },
    /// Answer REFUSED.
    Deny,
    /// Send nothing back.
    Drop,
    /// Stop evaluating and forward to the default upstream.
    Allow,
    /// Stop evaluating and forward; `upstream` falls back to the default.
    Forward {
        upstream: Option<String>,
        #[serde(default)]
        transport: Option<Transport>,
    },
}

impl Action {
    /// Terminal actions end rule evaluation for the query.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Action::Log { .. } | Action::KvsLookup { .. } | Action::SetTag { .. }
        )
    }
}

#[derive(Debug, Clone, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchOperator {
    And,
    Or,
    #[serde(alias = "not", alias = "and_not", alias = "and-not", alias = "andnot")]
    AndNot,
    #[serde(alias = "or_not", alias = "or-not", alias = "ornot")]
    OrNot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatcherWithOp {
    #[serde(default = "default_match_operator")]
    pub operator: MatchOperator,
    #[serde(flatten)]
    pub matcher: Matcher,
}

/// Problems that must stop the engine from starting (or a reload from applying).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("store name must not be empty")]
    EmptyStoreName,
    #[error("duplicate store: {0}")]
    DuplicateStore(String),
    #[error("unknown store: {0}")]
    UnknownStore(String),
    #[error("cannot open store at {path}: {message}")]
    StoreOpen { path: String, message: String },
    #[error("rule {rule}: tag name must not be empty")]
    EmptyTag { rule: String },
    #[error("rule {rule}: no actions")]
    NoActions { rule: String },
    #[error("rule {rule}: invalid {what} mask /{mask}")]
    InvalidMask {
        rule: String,
        what: &'static str,
        mask: u8,
    },
    #[error("rule {rule}: invalid cidr {value}: {source}")]
    InvalidCidr {
        rule: String,
        value: String,
        source: ipnet::AddrParseError,
    },
    #[error("rule {rule}: invalid regex: {source}")]
    InvalidRegex { rule: String, source: regex::Error },
    #[error("rule {rule}: invalid address {value}")]
    InvalidAddress { rule: String, value: String },
    /// `rule` is `settings` for the default upstream.
    #[error("{rule}: invalid upstream address {value}")]
    InvalidUpstream { rule: String, value: String },
    #[error("rule {rule}: give either value or value_hex, not both")]
    AmbiguousTagValue { rule: String },
    #[error("rule {rule}: set_tag needs value or value_hex")]
    MissingTagValue { rule: String },
    #[error("rule {rule}: invalid value_hex {value}: {source}")]
    InvalidHex {
        rule: String,
        value: String,
        source: hex::FromHexError,
    },
    #[error("rule {rule}: spoof needs at least one address")]
    EmptySpoof { rule: String },
    #[error("rule {rule}: unsupported rcode {value}")]
    InvalidRcode { rule: String, value: String },
    #[error("rule {rule}: unsupported qtype {value}")]
    InvalidQtype { rule: String, value: String },
    #[error("rule {rule}: unsupported qclass {value}")]
    InvalidQclass { rule: String, value: String },
}

fn default_match_operator() -> MatchOperator {
    MatchOperator::And
}

fn default_v4_mask() -> u8 {
    32
}

fn default_v6_mask() -> u8 {
    128
}

fn default_wire_format() -> bool {
    true
}

fn default_cdb_refresh_secs() -> u64 {
    60
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_bind_tcp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_upstream() -> String {
    "1.1.1.1:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    2000
}

fn default_spoof_ttl() -> u32 {
    60
}

pub fn load_config(path: &Path) -> Result<KvsConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: KvsConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }
    Ok(cfg)
}
