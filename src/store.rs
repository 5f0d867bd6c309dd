//! TransactionStore trait and in-memory implementation
//!
//! Transactions are indexed by every address they touch: the sender, and
//! the recipient when there is one. Each address keeps its transactions in
//! arrival order with duplicates suppressed.

use crate::error::StoreError;
use crate::synclist::SyncList;
use crate::types::{normalize_address, Transaction};
use dashmap::DashMap;
use std::sync::Arc;

/// Per-address transaction history.
pub type TxList = SyncList<Arc<Transaction>>;

/// Storage for watched-wallet transactions.
///
/// Implementations must tolerate concurrent writes from the persistence
/// stage and reads from any number of callers.
pub trait TransactionStore: Send + Sync {
    /// Record `tx` under its sender and its recipient.
    ///
    /// Storing a transaction that is already present is a no-op.
    fn store_transaction(&self, tx: Arc<Transaction>) -> Result<(), StoreError>;

    /// All transactions touching `address`, in arrival order.
    ///
    /// Returns `None` if nothing was ever stored for the address.
    fn get_transactions(&self, address: &str) -> Result<Option<Vec<Arc<Transaction>>>, StoreError>;

    /// Transactions touching `address` in blocks strictly after `block`.
    ///
    /// Returns `None` if nothing was ever stored for the address, and an
    /// empty list if there is history but none of it is recent enough.
    fn get_transactions_after_block(
        &self,
        block: u64,
        address: &str,
    ) -> Result<Option<Vec<Arc<Transaction>>>, StoreError> {
        Ok(self.get_transactions(address)?.map(|txs| {
            txs.into_iter()
                .filter(|tx| tx.block_number > block)
                .collect()
        }))
    }
}

fn same_transaction(a: &Arc<Transaction>, b: &Arc<Transaction>) -> bool {
    Arc::ptr_eq(a, b) || **a == **b
}

/// Deduplicating store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    addresses: DashMap<String, Arc<TxList>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// History list for `key`, created on first use.
    ///
    /// Concurrent first writers for the same address all get the same list.
    fn list_for(&self, key: String) -> Arc<TxList> {
        self.addresses
            .entry(key)
            .or_insert_with(|| Arc::new(SyncList::with_equality(same_transaction)))
            .clone()
    }

    /// Addresses that have at least one stored transaction.
    pub fn addresses(&self) -> Vec<String> {
        self.addresses.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of distinct addresses tracked.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl TransactionStore for MemoryStore {
    fn store_transaction(&self, tx: Arc<Transaction>) -> Result<(), StoreError> {
        let from = tx.from_key();
        match tx.to_key() {
            Some(to) if to != from => {
                self.list_for(to).append_if_not_exists([tx.clone()]);
            }
            _ => {}
        }
        self.list_for(from).append_if_not_exists([tx]);
        Ok(())
    }

    fn get_transactions(&self, address: &str) -> Result<Option<Vec<Arc<Transaction>>>, StoreError> {
        let key = normalize_address(address);
        // Clone the list handle out so the map shard is not locked while copying
        let list = self.addresses.get(&key).map(|e| e.value().clone());
        Ok(list.map(|l| l.get_all()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{address_key, fixtures};
    use alloy_primitives::{address, Address};
    use std::thread;

    fn alice() -> Address {
        address!("000000000000000000000000000000000000a11c")
    }

    fn bob() -> Address {
        address!("0000000000000000000000000000000000000b0b")
    }

    #[test]
    fn test_store_indexes_sender_and_recipient() {
        let store = MemoryStore::new();
        let tx = Arc::new(fixtures::tx(alice(), Some(bob()), 1, 0));
        store.store_transaction(tx.clone()).unwrap();

        assert_eq!(store.get_transactions(&address_key(&alice())).unwrap(), Some(vec![tx.clone()]));
        assert_eq!(store.get_transactions(&address_key(&bob())).unwrap(), Some(vec![tx]));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_store_deduplicates_equal_transactions() {
        let store = MemoryStore::new();
        let tx = fixtures::tx(alice(), Some(bob()), 1, 0);
        store.store_transaction(Arc::new(tx.clone())).unwrap();
        store.store_transaction(Arc::new(tx)).unwrap();

        let txs = store.get_transactions(&address_key(&alice())).unwrap().unwrap();
        assert_eq!(txs.len(), 1);
    }

    #[test]
    fn test_self_transfer_stored_once() {
        let store = MemoryStore::new();
        let tx = Arc::new(fixtures::tx(alice(), Some(alice()), 1, 0));
        store.store_transaction(tx.clone()).unwrap();

        assert_eq!(store.get_transactions(&address_key(&alice())).unwrap(), Some(vec![tx]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_contract_creation_stored_under_sender() {
        let store = MemoryStore::new();
        let tx = Arc::new(fixtures::tx(alice(), None, 1, 0));
        store.store_transaction(tx.clone()).unwrap();

        assert_eq!(store.addresses(), vec![address_key(&alice())]);
    }

    #[test]
    fn test_lookup_normalizes_address() {
        let store = MemoryStore::new();
        let tx = Arc::new(fixtures::tx(alice(), Some(bob()), 1, 0));
        store.store_transaction(tx.clone()).unwrap();

        let got = store
            .get_transactions("000000000000000000000000000000000000A11C")
            .unwrap();
        assert_eq!(got, Some(vec![tx]));
    }

    #[test]
    fn test_unknown_address_is_none() {
        let store = MemoryStore::new();
        assert!(store.get_transactions(&address_key(&alice())).unwrap().is_none());
        assert!(store
            .get_transactions_after_block(0, &address_key(&alice()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_after_block_is_strict_and_ordered() {
        let store = MemoryStore::new();
        let txs: Vec<_> = [3u64, 5, 4, 6]
            .iter()
            .map(|&n| Arc::new(fixtures::tx(alice(), Some(bob()), n, 0)))
            .collect();
        for tx in &txs {
            store.store_transaction(tx.clone()).unwrap();
        }

        let key = address_key(&bob());
        let after = store.get_transactions_after_block(4, &key).unwrap().unwrap();
        assert_eq!(after, vec![txs[1].clone(), txs[3].clone()]);

        let none_newer = store.get_transactions_after_block(6, &key).unwrap();
        assert_eq!(none_newer, Some(Vec::new()));
    }

    #[test]
    fn test_parallel_store_and_read() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();

        for worker in 0..4u64 {
            let s = store.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    // Every worker writes the same 250 transactions
                    let tx = fixtures::tx(alice(), Some(bob()), 1 + i / 10, i % 10);
                    s.store_transaction(Arc::new(tx)).unwrap();
                }
                worker
            }));
            let s = store.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    if let Some(txs) = s.get_transactions(&address_key(&alice())).unwrap() {
                        assert!(txs.len() <= 250);
                    }
                    s.get_transactions_after_block(10, &address_key(&bob())).unwrap();
                }
                worker
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let txs = store.get_transactions(&address_key(&alice())).unwrap().unwrap();
        assert_eq!(txs.len(), 250);
        assert_eq!(store.get_transactions(&address_key(&bob())).unwrap().unwrap().len(), 250);
    }
}
