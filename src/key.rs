use std::borrow::Cow;
use std::net::IpAddr;

use ipnet::{Ipv4Net, Ipv6Net};

use crate::config::{ConfigError, KeySpec};
use crate::proto_utils::{Query, presentation};
use crate::tags::TagContext;

/// Builds store keys from a query. Closed set; one arm per key kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExtractor {
    /// Packed source address: 4 bytes for IPv4, 16 for IPv6.
    SourceAddress { v4_mask: u8, v6_mask: u8 },
    QuestionName { wire_format: bool },
    /// Candidates from the full name toward the root, longest first.
    QuestionNameSuffix { min_labels: usize, wire_format: bool },
    Tag { tag: String },
}

impl KeyExtractor {
    pub fn from_spec(spec: &KeySpec, rule: &str) -> Result<Self, ConfigError> {
        Ok(match spec {
            KeySpec::SourceIp { v4_mask, v6_mask } => {
                if *v4_mask > 32 {
                    return Err(ConfigError::InvalidMask {
                        rule: rule.to_string(),
                        what: "ipv4",
                        mask: *v4_mask,
                    });
                }
                if *v6_mask > 128 {
                    return Err(ConfigError::InvalidMask {
                        rule: rule.to_string(),
                        what: "ipv6",
                        mask: *v6_mask,
                    });
                }
                KeyExtractor::SourceAddress {
                    v4_mask: *v4_mask,
                    v6_mask: *v6_mask,
                }
            }
            KeySpec::Qname { wire_format } => KeyExtractor::QuestionName {
                wire_format: *wire_format,
            },
            KeySpec::Suffix {
                min_labels,
                wire_format,
            } => KeyExtractor::QuestionNameSuffix {
                min_labels: *min_labels,
                wire_format: *wire_format,
            },
            KeySpec::Tag { tag } => {
                if tag.is_empty() {
                    return Err(ConfigError::EmptyTag {
                        rule: rule.to_string(),
                    });
                }
                KeyExtractor::Tag { tag: tag.clone() }
            }
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KeyExtractor::SourceAddress { .. } => "source_ip",
            KeyExtractor::QuestionName { .. } => "qname",
            KeyExtractor::QuestionNameSuffix { .. } => "suffix",
            KeyExtractor::Tag { .. } => "tag",
        }
    }

    /// Candidate keys in lookup order, or `None` when no key can be built
    /// (absent source tag, name shorter than `min_labels`).
    pub fn keys<'a>(&self, query: &'a Query, tags: &'a TagContext) -> Option<Vec<Cow<'a, [u8]>>> {
        match self {
            KeyExtractor::SourceAddress { v4_mask, v6_mask } => {
                let packed = match query.client_ip() {
                    IpAddr::V4(v4) if *v4_mask < 32 => {
                        Ipv4Net::new(v4, *v4_mask).ok()?.network().octets().to_vec()
                    }
                    IpAddr::V4(v4) => v4.octets().to_vec(),
                    IpAddr::V6(v6) if *v6_mask < 128 => {
                        Ipv6Net::new(v6, *v6_mask).ok()?.network().octets().to_vec()
                    }
                    IpAddr::V6(v6) => v6.octets().to_vec(),
                };
                Some(vec![Cow::Owned(packed)])
            }
            KeyExtractor::QuestionName { wire_format } => {
                Some(vec![name_key(query.qname_wire(), *wire_format)])
            }
            KeyExtractor::QuestionNameSuffix {
                min_labels,
                wire_format,
            } => {
                let labels = query.label_count();
                if labels < *min_labels {
                    return None;
                }
                // a walk limited by min_labels never reaches the root
                let take = labels + 1 - *min_labels;
                Some(
                    query
                        .wire_suffixes()
                        .take(take)
                        .map(|suffix| name_key(suffix, *wire_format))
                        .collect(),
                )
            }
            KeyExtractor::Tag { tag } => tags.get(tag).map(|v| vec![Cow::Borrowed(v)]),
        }
    }
}

fn name_key(wire: &[u8], wire_format: bool) -> Cow<'_, [u8]> {
    if wire_format {
        Cow::Borrowed(wire)
    } else {
        Cow::Owned(presentation(wire).to_ascii_lowercase().into_bytes())
    }
}
