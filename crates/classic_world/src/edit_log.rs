//! The in-memory overlay of block edits not yet merged into the world file.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Pending block mutations keyed by linear cell index. A later edit to the
/// same index supersedes the earlier one. For any index absent from the log,
/// the world file holds the authoritative value.
#[derive(Default)]
pub struct EditLog {
    entries: Mutex<HashMap<u64, u8>>,
}

impl EditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, index: u64, block: u8) {
        self.entries.lock().insert(index, block);
    }

    pub fn get(&self, index: u64) -> Option<u8> {
        self.entries.lock().get(&index).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copies the current contents. The compactor merges a snapshot, not the
    /// live log, so edits arriving during the slow I/O phase are untouched.
    pub fn snapshot(&self) -> HashMap<u64, u8> {
        self.entries.lock().clone()
    }

    /// Drops the entries that a compaction pass wrote to disk. An entry is
    /// only dropped while it still holds the merged value; an index
    /// overwritten after the snapshot keeps its newer value for the next
    /// pass.
    pub fn remove_merged(&self, merged: &HashMap<u64, u8>) {
        let mut entries = self.entries.lock();
        for (&index, &block) in merged {
            if entries.get(&index) == Some(&block) {
                entries.remove(&index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_edits_supersede() {
        let log = EditLog::new();
        log.put(7, 1);
        log.put(7, 3);
        assert_eq!(log.get(7), Some(3));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn remove_merged_spares_newer_values() {
        let log = EditLog::new();
        log.put(1, 10);
        log.put(2, 20);

        let snapshot = log.snapshot();

        // Lands after the snapshot: index 2 now carries a newer value and
        // index 3 is brand new.
        log.put(2, 21);
        log.put(3, 30);

        log.remove_merged(&snapshot);

        assert_eq!(log.get(1), None);
        assert_eq!(log.get(2), Some(21));
        assert_eq!(log.get(3), Some(30));
    }
}
