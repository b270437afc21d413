use std::collections::VecDeque;

pub const DEFAULT_MAX_EVENTS: usize = 1_000;
pub const DEFAULT_FEED_WINDOW: usize = 100;

/// Append-only log that keeps the newest `max_entries` items in arrival order.
///
/// Eviction is purely by age: reading an entry never promotes it.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedLog<T> {
    max_entries: usize,
    entries: VecDeque<T>,
}

impl<T> BoundedLog<T> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            entries: VecDeque::with_capacity(max_entries.min(1_024)),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Appends `item` and returns how many old entries were evicted.
    pub fn push(&mut self, item: T) -> usize {
        self.entries.push_back(item);
        self.trim()
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) -> usize {
        self.entries.extend(items);
        self.trim()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    fn trim(&mut self) -> usize {
        let overflow = self.entries.len().saturating_sub(self.max_entries);
        if overflow > 0 {
            self.entries.drain(..overflow);
        }
        overflow
    }
}

impl<T: Clone> BoundedLog<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

impl<T> Default for BoundedLog<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}
