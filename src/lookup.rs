use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::key::KeyExtractor;
use crate::kvs::KeyValueStore;
use crate::proto_utils::Query;
use crate::tags::TagContext;

/// A store paired with the extractor that builds its keys.
#[derive(Clone)]
pub struct StoreLookup {
    store_name: Arc<str>,
    store: Arc<dyn KeyValueStore>,
    extractor: KeyExtractor,
}

impl fmt::Debug for StoreLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLookup")
            .field("store", &self.store_name)
            .field("backend", &self.store.kind())
            .field("extractor", &self.extractor)
            .finish()
    }
}

impl StoreLookup {
    pub fn new(store_name: &str, store: Arc<dyn KeyValueStore>, extractor: KeyExtractor) -> Self {
        Self {
            store_name: Arc::from(store_name),
            store,
            extractor,
        }
    }

    /// First stored value among the extractor's candidates.
    ///
    /// Backend failures are logged and reported as a miss so that an outage
    /// only disables the rules depending on the lookup.
    pub fn find(&self, query: &Query, tags: &TagContext) -> Option<Bytes> {
        let keys = self.extractor.keys(query, tags)?;
        for key in keys {
            match self.store.get(&key) {
                Ok(Some(value)) => return Some(value),
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        event = "kvs_lookup_error",
                        store = %self.store_name,
                        backend = self.store.kind(),
                        key_kind = self.extractor.kind(),
                        qname = %query.qname(),
                        error = %err,
                        "store lookup failed, treating as miss"
                    );
                    return None;
                }
            }
        }
        None
    }
}

/// Lookup whose result lands in a tag; never terminal.
#[derive(Debug, Clone)]
pub struct LookupAction {
    lookup: StoreLookup,
    tag: Arc<str>,
}

impl LookupAction {
    pub fn new(
        store_name: &str,
        store: Arc<dyn KeyValueStore>,
        extractor: KeyExtractor,
        tag: &str,
    ) -> Self {
        Self {
            lookup: StoreLookup::new(store_name, store, extractor),
            tag: Arc::from(tag),
        }
    }

    /// Run the lookup and record the result (or absence) in `tags`.
    pub fn execute(&self, query: &Query, tags: &mut TagContext) {
        let found = self.lookup.find(query, tags);
        trace!(
            event = "kvs_lookup",
            store = %self.lookup.store_name,
            key_kind = self.lookup.extractor.kind(),
            tag = %self.tag,
            hit = found.is_some()
        );
        match found {
            Some(value) => tags.set(&self.tag, value),
            None => tags.unset(&self.tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvs::testing::{FailingStore, MemoryStore};
    use hickory_proto::rr::RecordType;

    fn query(name: &str) -> Query {
        Query::from_name(name, RecordType::A, "127.0.0.1:4242".parse().unwrap())
    }

    fn store(entries: &[(&[u8], &[u8])]) -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryStore::with(entries))
    }

    #[test]
    fn hit_writes_value_into_tag() {
        let action = LookupAction::new(
            "kvs",
            store(&[(&[127u8, 0, 0, 1][..], b"source value")]),
            KeyExtractor::SourceAddress {
                v4_mask: 32,
                v6_mask: 128,
            },
            "src",
        );
        let mut tags = TagContext::new();
        action.execute(&query("a.example"), &mut tags);
        assert_eq!(tags.get("src"), Some(&b"source value"[..]));
    }

    #[test]
    fn miss_clears_previous_value() {
        let action = LookupAction::new(
            "kvs",
            store(&[]),
            KeyExtractor::QuestionName { wire_format: true },
            "t",
        );
        let mut tags = TagContext::new();
        tags.set("t", Bytes::from_static(b"stale"));
        action.execute(&query("a.example"), &mut tags);
        assert_eq!(tags.get("t"), None);
    }

    #[test]
    fn suffix_lookup_returns_longest_stored_suffix() {
        let action = LookupAction::new(
            "kvs",
            store(&[
                (b"\x07example\x03com\x00", b"short"),
                (b"\x03sub\x07example\x03com\x00", b"long"),
            ]),
            KeyExtractor::QuestionNameSuffix {
                min_labels: 0,
                wire_format: true,
            },
            "sfx",
        );
        let mut tags = TagContext::new();
        action.execute(&query("a.b.sub.example.com"), &mut tags);
        assert_eq!(tags.get("sfx"), Some(&b"long"[..]));

        action.execute(&query("other.example.com"), &mut tags);
        assert_eq!(tags.get("sfx"), Some(&b"short"[..]));

        action.execute(&query("example.org"), &mut tags);
        assert_eq!(tags.get("sfx"), None);
    }

    #[test]
    fn suffix_lookup_can_match_root_key() {
        let action = LookupAction::new(
            "kvs",
            store(&[(b"\x00", b"root")]),
            KeyExtractor::QuestionNameSuffix {
                min_labels: 0,
                wire_format: true,
            },
            "sfx",
        );
        let mut tags = TagContext::new();
        action.execute(&query("anything.example"), &mut tags);
        assert_eq!(tags.get("sfx"), Some(&b"root"[..]));
    }

    #[test]
    fn tag_chained_lookup_depends_on_first_result() {
        let kvs = store(&[(b"first value", b"second value")]);
        let chained = LookupAction::new(
            "kvs",
            kvs,
            KeyExtractor::Tag { tag: "a".into() },
            "b",
        );
        let q = query("a.example");

        let mut tags = TagContext::new();
        tags.set("a", Bytes::from_static(b"first value"));
        chained.execute(&q, &mut tags);
        assert_eq!(tags.get("b"), Some(&b"second value"[..]));

        let mut tags = TagContext::new();
        chained.execute(&q, &mut tags);
        assert_eq!(tags.get("b"), None);
    }

    #[test]
    fn store_error_is_treated_as_absent() {
        let action = LookupAction::new(
            "broken",
            Arc::new(FailingStore),
            KeyExtractor::QuestionName { wire_format: true },
            "t",
        );
        let mut tags = TagContext::new();
        tags.set("t", Bytes::from_static(b"stale"));
        action.execute(&query("a.example"), &mut tags);
        assert_eq!(tags.get("t"), None);
    }
}
