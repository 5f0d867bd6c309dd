//! Pipeline stages between the block fetcher and the store
//!
//! Each stage consumes one bounded queue, runs as its own task and owns its
//! output queue. A stage ends when its input queue closes, and its output
//! queue closes with it, so termination flows downstream.

use crate::error::{StoreError, StoreErrors};
use crate::store::TransactionStore;
use crate::synclist::SyncList;
use crate::types::{normalize_address, DetailedBlock, Transaction};
use crate::QUEUE_CAPACITY;
use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Number of unread store errors tolerated before the persistence stage gives up.
pub const ERROR_BACKLOG_CAPACITY: usize = 10;

/// Splits detailed blocks into their transactions, preserving block order.
pub struct BlockToTx {
    input: mpsc::Receiver<DetailedBlock>,
    output: mpsc::Sender<Arc<Transaction>>,
}

impl BlockToTx {
    pub fn new(input: mpsc::Receiver<DetailedBlock>) -> (Self, mpsc::Receiver<Arc<Transaction>>) {
        let (output, out) = mpsc::channel(QUEUE_CAPACITY);
        (Self { input, output }, out)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(block) = self.input.recv().await {
            for tx in block.transactions {
                if self.output.send(Arc::new(tx)).await.is_err() {
                    debug!("Transaction consumer went away, stopping block expansion");
                    return;
                }
            }
        }
    }
}

/// Set of watched addresses, shared between the filter and its callers.
///
/// Addresses are stored in canonical lowercase form and never removed.
#[derive(Clone, Default)]
pub struct WatchSet {
    wallets: Arc<SyncList<String>>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `address`. Returns false if it was already watched.
    pub fn add_wallet(&self, address: &str) -> bool {
        self.wallets.append_if_not_exists([normalize_address(address)])
    }

    /// True if the sender or the recipient of `tx` is watched.
    pub fn matches(&self, tx: &Transaction) -> bool {
        match tx.to_key() {
            Some(to) => self.wallets.contains(&[tx.from_key(), to]),
            None => self.wallets.contains(&[tx.from_key()]),
        }
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

/// Passes on only transactions that touch a watched address.
pub struct TxWalletFilter {
    watch_set: WatchSet,
    input: mpsc::Receiver<Arc<Transaction>>,
    output: mpsc::Sender<Arc<Transaction>>,
}

impl TxWalletFilter {
    pub fn new(
        input: mpsc::Receiver<Arc<Transaction>>,
    ) -> (Self, mpsc::Receiver<Arc<Transaction>>) {
        let (output, out) = mpsc::channel(QUEUE_CAPACITY);
        let filter = Self {
            watch_set: WatchSet::new(),
            input,
            output,
        };
        (filter, out)
    }

    /// Handle for changing the watch-set, also after the filter is spawned.
    pub fn watch_set(&self) -> WatchSet {
        self.watch_set.clone()
    }

    pub fn add_wallet(&self, address: &str) -> bool {
        self.watch_set.add_wallet(address)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(tx) = self.input.recv().await {
            if !self.watch_set.matches(&tx) {
                continue;
            }
            debug!("Matched transaction {:?} in block {}", tx.hash, tx.block_number);
            if self.output.send(tx).await.is_err() {
                debug!("Filtered transaction consumer went away, stopping wallet filter");
                return;
            }
        }
    }
}

/// Bounded queue of store errors that nobody has read yet.
#[derive(Clone)]
pub struct ErrorBacklog {
    errors: Arc<ArrayQueue<StoreError>>,
}

impl ErrorBacklog {
    pub fn new(capacity: usize) -> Self {
        Self {
            errors: Arc::new(ArrayQueue::new(capacity)),
        }
    }

    /// Queue `err` without blocking. Returns false if the backlog is full.
    pub fn push(&self, err: StoreError) -> bool {
        self.errors.push(err).is_ok()
    }

    /// Take every queued error, or `None` if there are none.
    pub fn drain(&self) -> Option<StoreErrors> {
        let errs: Vec<StoreError> = std::iter::from_fn(|| self.errors.pop()).collect();
        if errs.is_empty() {
            None
        } else {
            Some(StoreErrors(errs))
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

type TxReceiver = mpsc::Receiver<Arc<Transaction>>;

/// Writes every incoming transaction into a [`TransactionStore`].
///
/// Store errors go to an [`ErrorBacklog`]. If the backlog is already full
/// when another error arrives, the stage stops consuming altogether. Its
/// input queue is parked rather than dropped, so the bounded queues
/// upstream fill up and ingestion stalls instead of silently dropping.
pub struct TxPersister<S: ?Sized> {
    store: Arc<S>,
    input: TxReceiver,
    handle: PersisterHandle,
}

/// Shared view of a running [`TxPersister`].
#[derive(Clone)]
pub struct PersisterHandle {
    backlog: ErrorBacklog,
    halted: Arc<AtomicBool>,
    parked: Arc<Mutex<Option<TxReceiver>>>,
}

impl PersisterHandle {
    /// Drain and join all queued store errors.
    pub fn last_error(&self) -> Option<StoreErrors> {
        self.backlog.drain()
    }

    /// True once the stage has given up because of unread errors.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn backlog(&self) -> &ErrorBacklog {
        &self.backlog
    }
}

impl<S: TransactionStore + ?Sized + 'static> TxPersister<S> {
    pub fn new(input: TxReceiver, store: Arc<S>) -> Self {
        Self {
            store,
            input,
            handle: PersisterHandle {
                backlog: ErrorBacklog::new(ERROR_BACKLOG_CAPACITY),
                halted: Arc::new(AtomicBool::new(false)),
                parked: Arc::new(Mutex::new(None)),
            },
        }
    }

    /// Handle for reading errors while the stage runs.
    pub fn handle(&self) -> PersisterHandle {
        self.handle.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(tx) = self.input.recv().await {
            let hash = tx.hash;
            let Err(err) = self.store.store_transaction(tx) else {
                continue;
            };
            warn!("Failed to store transaction {:?}: {}", hash, err);
            if !self.handle.backlog.push(err) {
                error!(
                    "{} store errors left unread, stopping transaction persistence",
                    ERROR_BACKLOG_CAPACITY
                );
                self.handle.halted.store(true, Ordering::SeqCst);
                *self
                    .handle
                    .parked
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(self.input);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::fixtures;
    use alloy_primitives::{address, Address};
    use std::sync::atomic::AtomicUsize;

    fn watched() -> Address {
        address!("00000000000000000000000000000000000000aa")
    }

    fn other() -> Address {
        address!("00000000000000000000000000000000000000bb")
    }

    #[tokio::test]
    async fn test_block_to_tx_preserves_order() {
        let (blocks, input) = mpsc::channel(4);
        let (stage, mut out) = BlockToTx::new(input);
        let handle = stage.spawn();

        let txs: Vec<_> = (0..3).map(|i| fixtures::tx(other(), Some(watched()), 1, i)).collect();
        blocks.send(fixtures::block(1, txs.clone())).await.unwrap();
        blocks.send(fixtures::block(2, Vec::new())).await.unwrap();
        let later = fixtures::tx(other(), Some(watched()), 3, 0);
        blocks.send(fixtures::block(3, vec![later.clone()])).await.unwrap();
        drop(blocks);

        let mut seen = Vec::new();
        while let Some(tx) = out.recv().await {
            seen.push((*tx).clone());
        }
        let mut expected = txs;
        expected.push(later);
        assert_eq!(seen, expected);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wallet_filter_matches_sender_or_recipient() {
        let (txs, input) = mpsc::channel(8);
        let (filter, mut out) = TxWalletFilter::new(input);
        assert!(filter.add_wallet("0x00000000000000000000000000000000000000AA"));
        assert!(!filter.add_wallet("0x00000000000000000000000000000000000000aa"));
        filter.spawn();

        let outgoing = Arc::new(fixtures::tx(watched(), Some(other()), 1, 0));
        let unrelated = Arc::new(fixtures::tx(other(), Some(other()), 1, 1));
        let incoming = Arc::new(fixtures::tx(other(), Some(watched()), 1, 2));
        let creation = Arc::new(fixtures::tx(watched(), None, 1, 3));
        for tx in [&outgoing, &unrelated, &incoming, &creation] {
            txs.send(tx.clone()).await.unwrap();
        }
        drop(txs);

        let mut seen = Vec::new();
        while let Some(tx) = out.recv().await {
            seen.push(tx);
        }
        assert_eq!(seen, vec![outgoing, incoming, creation]);
    }

    #[tokio::test]
    async fn test_wallet_added_while_running() {
        let (txs, input) = mpsc::channel(8);
        let (filter, mut out) = TxWalletFilter::new(input);
        let watch_set = filter.watch_set();
        filter.spawn();

        txs.send(Arc::new(fixtures::tx(other(), Some(watched()), 1, 0))).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(watch_set.add_wallet(&crate::types::address_key(&watched())));
        let wanted = Arc::new(fixtures::tx(other(), Some(watched()), 2, 0));
        txs.send(wanted.clone()).await.unwrap();
        drop(txs);

        assert_eq!(out.recv().await, Some(wanted));
        assert_eq!(out.recv().await, None);
    }

    #[test]
    fn test_error_backlog_is_bounded() {
        let backlog = ErrorBacklog::new(2);
        assert!(backlog.push(StoreError("a".to_string())));
        assert!(backlog.push(StoreError("b".to_string())));
        assert!(!backlog.push(StoreError("c".to_string())));

        let errs = backlog.drain().unwrap();
        assert_eq!(errs.0.len(), 2);
        assert!(backlog.drain().is_none());
        assert!(backlog.push(StoreError("d".to_string())));
    }

    /// Store that fails every write and counts the attempts.
    #[derive(Default)]
    struct FailingStore {
        attempts: AtomicUsize,
    }

    impl TransactionStore for FailingStore {
        fn store_transaction(&self, _tx: Arc<Transaction>) -> Result<(), StoreError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError(format!("write {} failed", n)))
        }

        fn get_transactions(
            &self,
            _address: &str,
        ) -> Result<Option<Vec<Arc<Transaction>>>, StoreError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_persister_stores_transactions() {
        let store = Arc::new(MemoryStore::new());
        let (txs, input) = mpsc::channel(8);
        let persister = TxPersister::new(input, store.clone());
        let handle = persister.spawn();

        let tx = Arc::new(fixtures::tx(watched(), Some(other()), 5, 0));
        txs.send(tx.clone()).await.unwrap();
        drop(txs);
        handle.await.unwrap();

        let key = crate::types::address_key(&watched());
        assert_eq!(store.get_transactions(&key).unwrap(), Some(vec![tx]));
    }

    #[tokio::test]
    async fn test_persister_fail_stops_on_full_backlog() {
        let store = Arc::new(FailingStore::default());
        let (txs, input) = mpsc::channel(64);
        let persister = TxPersister::new(input, store.clone());
        let state = persister.handle();
        let handle = persister.spawn();

        for i in 0..20 {
            txs.send(Arc::new(fixtures::tx(other(), Some(watched()), 1, i)))
                .await
                .unwrap();
        }
        // The stage exits on the eleventh error without closing its input
        handle.await.unwrap();

        assert!(state.is_halted());
        assert_eq!(store.attempts.load(Ordering::SeqCst), ERROR_BACKLOG_CAPACITY + 1);
        assert!(!txs.is_closed());

        // Nothing is consumed any more, even after the errors are read
        let errs = state.last_error().unwrap();
        assert_eq!(errs.0.len(), ERROR_BACKLOG_CAPACITY);
        assert_eq!(errs.0[0], StoreError("write 0 failed".to_string()));
        txs.send(Arc::new(fixtures::tx(other(), Some(watched()), 2, 0)))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(store.attempts.load(Ordering::SeqCst), ERROR_BACKLOG_CAPACITY + 1);
    }

    #[tokio::test]
    async fn test_persister_keeps_going_while_errors_are_drained() {
        let store = Arc::new(FailingStore::default());
        let (txs, input) = mpsc::channel(1);
        let persister = TxPersister::new(input, store.clone());
        let state = persister.handle();
        let handle = persister.spawn();

        for i in 0..30 {
            txs.send(Arc::new(fixtures::tx(other(), Some(watched()), 1, i)))
                .await
                .unwrap();
            if state.backlog().len() >= ERROR_BACKLOG_CAPACITY / 2 {
                state.last_error();
            }
        }
        drop(txs);
        handle.await.unwrap();
        assert!(!state.is_halted());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 30);
    }
}
