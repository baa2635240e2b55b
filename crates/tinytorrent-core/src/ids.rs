use std::collections::HashMap;

use tinytorrent_session::InfoHash;

/// Bijection between infohashes and the stable integer ids handed to RPC
/// clients.
///
/// Ids are assigned monotonically on first observation and survive restarts
/// through the torrent table. A released id is never reused within a daemon
/// run.
#[derive(Debug, Default)]
pub struct RpcIdRegistry {
    by_hash: HashMap<InfoHash, i64>,
    by_id: HashMap<i64, InfoHash>,
    next: i64,
}

impl RpcIdRegistry {
    /// An empty registry starting at id 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_hash: HashMap::new(),
            by_id: HashMap::new(),
            next: 1,
        }
    }

    /// Restore persisted assignments; the counter resumes past the largest
    /// id seen.
    pub fn restore(&mut self, entries: impl IntoIterator<Item = (InfoHash, i64)>) {
        for (hash, id) in entries {
            if id <= 0 {
                continue;
            }
            self.by_hash.insert(hash, id);
            self.by_id.insert(id, hash);
            if id >= self.next {
                self.next = id + 1;
            }
        }
    }

    /// Id for `hash`, assigning the next free id on first observation.
    ///
    /// Returns the id and whether it was newly assigned.
    pub fn ensure(&mut self, hash: InfoHash) -> (i64, bool) {
        if let Some(id) = self.by_hash.get(&hash) {
            return (*id, false);
        }
        let id = self.next;
        self.next += 1;
        self.by_hash.insert(hash, id);
        self.by_id.insert(id, hash);
        (id, true)
    }

    /// Current id for `hash`, if assigned.
    #[must_use]
    pub fn id_for(&self, hash: &InfoHash) -> Option<i64> {
        self.by_hash.get(hash).copied()
    }

    /// Hash behind an id, if assigned.
    #[must_use]
    pub fn hash_for(&self, id: i64) -> Option<InfoHash> {
        self.by_id.get(&id).copied()
    }

    /// Drop the mapping for `hash`; its id stays burned for this run.
    pub fn release(&mut self, hash: &InfoHash) -> Option<i64> {
        let id = self.by_hash.remove(hash)?;
        self.by_id.remove(&id);
        Some(id)
    }

    /// Number of live mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether no mappings exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::from_bytes([byte; 20])
    }

    #[test]
    fn ids_are_monotonic_and_stable() {
        let mut registry = RpcIdRegistry::new();
        let (first, new_first) = registry.ensure(hash(1));
        let (second, _) = registry.ensure(hash(2));
        let (again, new_again) = registry.ensure(hash(1));
        assert!(new_first);
        assert!(!new_again);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(again, first);
    }

    #[test]
    fn released_ids_are_not_reused() {
        let mut registry = RpcIdRegistry::new();
        let (first, _) = registry.ensure(hash(1));
        assert_eq!(registry.release(&hash(1)), Some(first));
        let (second, _) = registry.ensure(hash(2));
        assert_eq!(second, first + 1);
        assert!(registry.hash_for(first).is_none());
    }

    #[test]
    fn restore_resumes_past_largest_id() {
        let mut registry = RpcIdRegistry::new();
        registry.restore([(hash(1), 3), (hash(2), 7)]);
        assert_eq!(registry.id_for(&hash(2)), Some(7));
        let (next, _) = registry.ensure(hash(3));
        assert_eq!(next, 8);
    }
}
