//! Bounded ring buffer of handled errors.

use std::collections::VecDeque;

use crate::types::ErrorLogEntry;

/// Keeps the most recent `capacity` entries; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    entries: VecDeque<ErrorLogEntry>,
    capacity: usize,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuild from persisted entries, keeping only the newest `capacity`.
    pub fn from_entries(capacity: usize, entries: impl IntoIterator<Item = ErrorLogEntry>) -> Self {
        let mut log = Self::new(capacity);
        for entry in entries {
            log.push(entry);
        }
        log
    }

    /// Append an entry, returning the evicted one if the buffer was full.
    pub fn push(&mut self, entry: ErrorLogEntry) -> Option<ErrorLogEntry> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Oldest to newest.
    pub fn entries(&self) -> impl Iterator<Item = &ErrorLogEntry> {
        self.entries.iter()
    }

    /// The newest `n` entries, newest first.
    pub fn recent(&self, n: usize) -> Vec<ErrorLogEntry> {
        self.entries.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HavenError;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn entry(n: usize) -> ErrorLogEntry {
        ErrorLogEntry::new(
            &HavenError::network(format!("failure {n}")),
            BTreeMap::new(),
            Utc::now(),
        )
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut log = ErrorLog::new(2);
        assert!(log.push(entry(1)).is_none());
        assert!(log.push(entry(2)).is_none());
        let evicted = log.push(entry(3)).unwrap();
        assert!(evicted.message.contains("failure 1"));

        let messages: Vec<_> = log.entries().map(|e| e.message.clone()).collect();
        assert!(messages[0].contains("failure 2"));
        assert!(messages[1].contains("failure 3"));
    }

    #[test]
    fn test_recent_is_newest_first() {
        let log = ErrorLog::from_entries(5, (0..4).map(entry));
        let recent = log.recent(2);
        assert!(recent[0].message.contains("failure 3"));
        assert!(recent[1].message.contains("failure 2"));
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..20, inserts in 0usize..60) {
            let log = ErrorLog::from_entries(capacity, (0..inserts).map(entry));
            prop_assert_eq!(log.len(), inserts.min(capacity));
            if inserts > 0 {
                let newest = log.recent(1);
                let expected = format!("failure {}", inserts - 1);
                prop_assert!(newest[0].message.contains(&expected));
            }
        }
    }
}
