//! Walletscan - block stream ingestion for watched Ethereum wallets
//!
//! This library polls a JSON-RPC endpoint for new blocks, expands them
//! into transactions, keeps the ones touching watched addresses and either
//! hands them to the caller or indexes them in a deduplicating store.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod pipeline;
pub mod processors;
pub mod rpc;
pub mod store;
pub mod synclist;
pub mod types;

/// Capacity of every queue between two pipeline stages.
pub const QUEUE_CAPACITY: usize = 1000;

// Re-export the main types for convenience
pub use error::{FetchError, StoreError, StoreErrors};
pub use fetcher::{BlockDetail, BlockFetcher, FetcherConfig};
pub use pipeline::{ChannelPipeline, StorePipeline};
pub use store::{MemoryStore, TransactionStore};
pub use synclist::SyncList;
pub use types::{Block, DetailedBlock, LightBlock, Transaction};
