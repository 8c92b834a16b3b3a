use bytes::Bytes;
use rustc_hash::FxHashMap;

/// Per-query tag table.
///
/// Created empty for each query and dropped with it. A name missing from the
/// table is "absent", which is not the same as a present empty value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagContext {
    tags: FxHashMap<String, Bytes>,
}

impl TagContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.tags.get(name).map(|v| v.as_ref())
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn set(&mut self, name: &str, value: Bytes) {
        if let Some(slot) = self.tags.get_mut(name) {
            *slot = value;
        } else {
            self.tags.insert(name.to_owned(), value);
        }
    }

    /// Mark the tag absent, dropping any value a previous rule wrote.
    pub fn unset(&mut self, name: &str) {
        self.tags.remove(name);
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
