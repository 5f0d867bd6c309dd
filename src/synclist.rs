//! Concurrent deduplicating list
//!
//! An ordered, lock-guarded collection shared between tasks. Equality is
//! pluggable: lists of plain keys use `PartialEq`, lists of domain objects
//! can supply their own predicate.
//!
//! Every lookup is a linear scan, so this is meant for watch-sets and
//! per-address histories of small to moderate size.

use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Equality predicate used for deduplication.
pub type EqualFn<T> = fn(&T, &T) -> bool;

/// Thread-safe ordered list with optional deduplication.
pub struct SyncList<T> {
    items: RwLock<Vec<T>>,
    equal: EqualFn<T>,
}

impl<T: PartialEq> SyncList<T> {
    /// Create an empty list that compares items with `PartialEq`.
    pub fn new() -> Self {
        Self::with_equality(T::eq)
    }
}

impl<T: PartialEq> Default for SyncList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncList<T> {
    /// Create an empty list that compares items with `equal`.
    pub fn with_equality(equal: EqualFn<T>) -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            equal,
        }
    }

    // A panic while holding the lock cannot leave a half-pushed element
    // behind, so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `item` unconditionally.
    pub fn append(&self, item: T) {
        self.write().push(item);
    }

    /// Append each item that is not equal to an element already present.
    ///
    /// Items are checked against the list as it grows, so duplicates within
    /// `items` are collapsed too. Returns true if anything was added.
    pub fn append_if_not_exists<I>(&self, items: I) -> bool
    where
        I: IntoIterator<Item = T>,
    {
        let mut list = self.write();
        let mut added = false;
        for item in items {
            if list.iter().any(|existing| (self.equal)(existing, &item)) {
                continue;
            }
            list.push(item);
            added = true;
        }
        added
    }

    /// True if any element equals any of `items`.
    pub fn contains(&self, items: &[T]) -> bool {
        let list = self.read();
        list.iter()
            .any(|existing| items.iter().any(|item| (self.equal)(existing, item)))
    }

    /// Number of (element, item) pairs that compare equal.
    pub fn count(&self, items: &[T]) -> usize {
        let list = self.read();
        list.iter()
            .map(|existing| {
                items
                    .iter()
                    .filter(|item| (self.equal)(existing, item))
                    .count()
            })
            .sum()
    }

    /// Current number of elements.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl<T: Clone> SyncList<T> {
    /// Independent copy of the current contents.
    ///
    /// The read lock is held only while cloning, so callers can iterate the
    /// result without blocking writers.
    pub fn get_all(&self) -> Vec<T> {
        self.read().clone()
    }
}

impl<T: fmt::Debug> fmt::Debug for SyncList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.read().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures;
    use alloy_primitives::address;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_append_if_not_exists_is_idempotent() {
        let list = SyncList::new();
        assert!(list.append_if_not_exists(["foo".to_string()]));
        assert!(!list.append_if_not_exists(["foo".to_string()]));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_append_if_not_exists_collapses_batch_duplicates() {
        let list = SyncList::new();
        assert!(list.append_if_not_exists([1, 2, 2, 3, 1]));
        assert_eq!(list.get_all(), vec![1, 2, 3]);
    }

    #[test]
    fn test_append_keeps_duplicates() {
        let list = SyncList::new();
        list.append(7);
        list.append(7);
        assert_eq!(list.count(&[7]), 2);
        assert_eq!(list.count(&[7, 8]), 2);
        assert_eq!(list.count(&[8]), 0);
    }

    #[test]
    fn test_contains_any() {
        let list = SyncList::new();
        list.append("a".to_string());
        assert!(list.contains(&["b".to_string(), "a".to_string()]));
        assert!(!list.contains(&["b".to_string()]));
        assert!(!list.contains(&[]));
    }

    #[test]
    fn test_custom_equality() {
        let list: SyncList<String> = SyncList::with_equality(|a, b| a.eq_ignore_ascii_case(b));
        assert!(list.append_if_not_exists(["0xAbC".to_string()]));
        assert!(!list.append_if_not_exists(["0xabc".to_string()]));
        assert!(list.contains(&["0XABC".to_string()]));
    }

    #[test]
    fn test_get_all_is_a_snapshot() {
        let list = SyncList::new();
        list.append(1);
        let snapshot = list.get_all();
        list.append(2);
        assert_eq!(snapshot, vec![1]);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_parallel_len_matches_accepted_inserts() {
        let list = Arc::new(SyncList::new());
        let accepted = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..10 {
            let (l, a) = (list.clone(), accepted.clone());
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    l.append("foo".to_string());
                    a.fetch_add(1, Ordering::SeqCst);
                }
            }));
            let (l, a) = (list.clone(), accepted.clone());
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    if l.append_if_not_exists(["foo".to_string()]) {
                        a.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
            let l = list.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    for item in l.get_all() {
                        assert_eq!(item, "foo");
                    }
                }
            }));
            let l = list.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    l.contains(&["foo".to_string()]);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), list.len());
    }

    #[test]
    fn test_parallel_transaction_dedup() {
        let from = address!("0000000000000000000000000000000000000001");
        let to = address!("0000000000000000000000000000000000000002");
        let tx = Arc::new(fixtures::tx(from, Some(to), 1, 0));
        let list = Arc::new(SyncList::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (l, tx) = (list.clone(), tx.clone());
                thread::spawn(move || {
                    for _ in 0..500 {
                        // A fresh allocation with equal contents must still dedup
                        l.append_if_not_exists([Arc::new((*tx).clone())]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(list.len(), 1);
    }
}
