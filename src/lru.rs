//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

//! An ordered key→value map with move-to-end-on-hit and pop-oldest-on-overflow,
//! per spec §4.1.
//!
//! No thread-safety is provided at this level; callers hold the branch's
//! compile lock or run on the branch's background task, matching the
//! single-threaded cooperative scheduling model assumed by §5.

use std::collections::HashMap;
use std::hash::Hash;

/// An ordered map used for both the compiled-query and compiled-SQL caches.
///
/// Iteration order is oldest-first; the most recently touched entry is
/// always last.
pub struct Lru<K, V> {
    capacity: usize,
    order: Vec<K>,
    entries: HashMap<K, V>,
}

impl<K, V> Lru<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an LRU with the given capacity. Capacity must be positive;
    /// setting it never evicts eagerly.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU capacity must be positive");
        Lru {
            capacity,
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    /// Move `key` to the most-recent end and return its value, or `None` on a miss.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get(key)
    }

    /// Insert or update `key` at the most-recent end.
    pub fn put(&mut self, key: K, value: V) {
        if self.entries.contains_key(&key) {
            self.touch(&key);
        } else {
            self.order.push(key.clone());
        }
        self.entries.insert(key, value);
    }

    /// Remove `key` unconditionally (used when an entry transitions to `Evicted`).
    pub fn remove(&mut self, key: &K) -> Option<V> {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up without touching recency order. Used by callers that only
    /// need to inspect a value (e.g. the persistence worker filtering a
    /// batch) and must not perturb LRU ordering as a side effect.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        assert!(capacity > 0, "LRU capacity must be positive");
        self.capacity = capacity;
    }

    /// True iff `len() > capacity`.
    pub fn needs_cleanup(&self) -> bool {
        self.entries.len() > self.capacity
    }

    /// Remove and return the least-recently-used entry, if any.
    pub fn cleanup_one(&mut self) -> Option<(K, V)> {
        if self.order.is_empty() {
            return None;
        }
        let key = self.order.remove(0);
        let value = self.entries.remove(&key)?;
        Some((key, value))
    }

    /// Iterate entries most-recent last.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order.iter().filter_map(move |k| self.entries.get(k).map(|v| (k, v)))
    }

    /// Iterate keys most-recently-used first (used by the recompile sweep in §4.4).
    pub fn keys_most_recent_first(&self) -> impl Iterator<Item = &K> {
        self.order.iter().rev()
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_moves_to_most_recent_end() {
        let mut lru: Lru<&str, i32> = Lru::new(3);
        lru.put("a", 1);
        lru.put("b", 2);
        lru.put("c", 3);
        assert_eq!(lru.get(&"a"), Some(&1));
        // "a" is now most-recent; "b" is the oldest.
        assert_eq!(lru.keys_most_recent_first().next(), Some(&"a"));
        let mut it = lru.keys_most_recent_first();
        it.next();
        assert_eq!(it.next(), Some(&"c"));
        assert_eq!(it.next(), Some(&"b"));
    }

    #[test]
    fn overflow_is_resolved_by_background_cleanup_not_eager_eviction() {
        let mut lru: Lru<i32, i32> = Lru::new(2);
        lru.put(1, 1);
        lru.put(2, 2);
        lru.put(3, 3);
        assert!(lru.needs_cleanup());
        assert_eq!(lru.len(), 3);
        let (evicted_key, _) = lru.cleanup_one().unwrap();
        assert_eq!(evicted_key, 1);
        assert!(!lru.needs_cleanup());
    }

    #[test]
    fn set_capacity_never_evicts_eagerly() {
        let mut lru: Lru<i32, i32> = Lru::new(5);
        lru.put(1, 1);
        lru.put(2, 2);
        lru.set_capacity(1);
        assert_eq!(lru.len(), 2);
        assert!(lru.needs_cleanup());
    }

    #[test]
    fn miss_returns_none() {
        let mut lru: Lru<&str, i32> = Lru::new(2);
        assert_eq!(lru.get(&"missing"), None);
    }
}
