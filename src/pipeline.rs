//! Ready-made pipelines
//!
//! Both pipelines run a [`BlockFetcher`] for detailed blocks, expand the
//! blocks into transactions and keep only those touching a watched
//! address. [`ChannelPipeline`] hands the matching transactions to the
//! caller as a queue; [`StorePipeline`] writes them into a
//! [`TransactionStore`] and answers queries instead.

use crate::error::{FetchError, StoreError};
use crate::fetcher::{BlockDetail, BlockFetcher, FetcherConfig};
use crate::processors::{BlockToTx, PersisterHandle, TxPersister, TxWalletFilter, WatchSet};
use crate::store::TransactionStore;
use crate::types::{DetailedBlock, Transaction};
use anyhow::anyhow;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::info;

/// Receiving end of a transaction queue.
pub type TxStream = mpsc::Receiver<Arc<Transaction>>;

/// The block fetcher and the two stages every pipeline starts with.
struct Front {
    fetcher: BlockFetcher<DetailedBlock>,
    watch_set: WatchSet,
    stages: Mutex<Option<(BlockToTx, TxWalletFilter)>>,
}

impl Front {
    fn new(config: FetcherConfig) -> Result<(Self, TxStream), FetchError> {
        let fetcher = BlockFetcher::<DetailedBlock>::new(config, BlockDetail::Full)?;
        let blocks = fetcher.take_blocks().ok_or(FetchError::QueueClosed)?;
        let (expander, txs) = BlockToTx::new(blocks);
        let (filter, matched) = TxWalletFilter::new(txs);
        let front = Self {
            fetcher,
            watch_set: filter.watch_set(),
            stages: Mutex::new(Some((expander, filter))),
        };
        Ok((front, matched))
    }

    /// Start the fetcher, then the stages behind it.
    ///
    /// The stages are only consumed once the fetcher is up, so a failed
    /// start can be retried.
    async fn start(&self) -> Result<(), FetchError> {
        self.fetcher.start().await?;
        let stages = self
            .stages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((expander, filter)) = stages {
            expander.spawn();
            filter.spawn();
        }
        Ok(())
    }

    fn fetch_error(&self) -> Option<anyhow::Error> {
        self.fetcher
            .last_error()
            .map(|e| anyhow::Error::new(e).context("block subscriber error"))
    }
}

/// Join several errors into one, one message per line.
fn join_errors(errors: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    let mut errors = errors.into_iter();
    let first = errors.next()?;
    let rest: Vec<String> = errors.map(|e| format!("{:#}", e)).collect();
    if rest.is_empty() {
        return Some(first);
    }
    Some(anyhow!("{:#}\n{}", first, rest.join("\n")))
}

/// Pipeline that exposes matching transactions as a queue.
pub struct ChannelPipeline {
    front: Front,
    output: Mutex<Option<TxStream>>,
}

impl ChannelPipeline {
    pub fn new(config: FetcherConfig) -> Result<Self, FetchError> {
        let (front, matched) = Front::new(config)?;
        Ok(Self {
            front,
            output: Mutex::new(Some(matched)),
        })
    }

    /// Hand out the transaction queue. Returns `None` after the first call.
    ///
    /// The queue closes once the pipeline has stopped and drained.
    pub fn take_transactions(&self) -> Option<TxStream> {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Watch `address`. Returns false if it was already watched.
    pub fn subscribe(&self, address: &str) -> bool {
        self.front.watch_set.add_wallet(address)
    }

    pub async fn start(&self) -> Result<(), FetchError> {
        self.front.start().await?;
        info!("Transaction channel pipeline started");
        Ok(())
    }

    pub fn stop(&self) {
        self.front.fetcher.stop();
    }

    pub fn is_running(&self) -> bool {
        self.front.fetcher.is_running()
    }

    pub fn current_block(&self) -> u64 {
        self.front.fetcher.current_block()
    }

    pub fn last_error(&self) -> Option<anyhow::Error> {
        self.front.fetch_error()
    }
}

/// Pipeline that persists matching transactions into a store.
pub struct StorePipeline<S: ?Sized> {
    front: Front,
    store: Arc<S>,
    persister: Mutex<Option<TxPersister<S>>>,
    persister_handle: PersisterHandle,
}

impl<S: TransactionStore + ?Sized + 'static> StorePipeline<S> {
    pub fn new(config: FetcherConfig, store: Arc<S>) -> Result<Self, FetchError> {
        let (front, matched) = Front::new(config)?;
        let persister = TxPersister::new(matched, store.clone());
        Ok(Self {
            front,
            store,
            persister_handle: persister.handle(),
            persister: Mutex::new(Some(persister)),
        })
    }

    /// Watch `address`. Returns false if it was already watched.
    pub fn subscribe(&self, address: &str) -> bool {
        self.front.watch_set.add_wallet(address)
    }

    pub async fn start(&self) -> Result<(), FetchError> {
        self.front.start().await?;
        let persister = self
            .persister
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(persister) = persister {
            persister.spawn();
        }
        info!("Transaction store pipeline started");
        Ok(())
    }

    pub fn stop(&self) {
        self.front.fetcher.stop();
    }

    pub fn is_running(&self) -> bool {
        self.front.fetcher.is_running()
    }

    pub fn current_block(&self) -> u64 {
        self.front.fetcher.current_block()
    }

    /// Pending store errors followed by the fetcher error, if any.
    ///
    /// Reading drains the store errors, which lets a persistence stage
    /// close to its error limit keep going.
    pub fn last_error(&self) -> Option<anyhow::Error> {
        let mut errors = Vec::new();
        if let Some(errs) = self.persister_handle.last_error() {
            errors.push(anyhow::Error::new(errs).context("transaction store processor error"));
        }
        if let Some(err) = self.front.fetch_error() {
            errors.push(err);
        }
        join_errors(errors)
    }

    /// True once persistence gave up because store errors went unread.
    pub fn is_persistence_halted(&self) -> bool {
        self.persister_handle.is_halted()
    }

    pub fn get_transactions(
        &self,
        address: &str,
    ) -> Result<Option<Vec<Arc<Transaction>>>, StoreError> {
        self.store.get_transactions(address)
    }

    pub fn get_transactions_after_block(
        &self,
        block: u64,
        address: &str,
    ) -> Result<Option<Vec<Arc<Transaction>>>, StoreError> {
        self.store.get_transactions_after_block(block, address)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}
