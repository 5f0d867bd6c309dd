//! Polling block fetcher
//!
//! Tracks the chain height of a JSON-RPC endpoint and emits every block,
//! in height order, onto a bounded queue. The fetcher halts for good on
//! cancellation, on reaching the configured end block, or on the first
//! fetch error; the queue is closed in every case and the error (if any)
//! is kept for [`BlockFetcher::last_error`].

use crate::error::FetchError;
use crate::rpc::{HttpTransport, RpcClient, Transport};
use crate::types::BlockLike;
use crate::QUEUE_CAPACITY;
use reqwest::Url;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Default delay between two height polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Which shape of block to request from `eth_getBlockByNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockDetail {
    /// Transaction hashes only.
    #[default]
    Light,
    /// Full transaction objects.
    Full,
}

impl BlockDetail {
    /// Value of the `full transactions` request flag.
    pub fn full_transactions(self) -> bool {
        matches!(self, BlockDetail::Full)
    }
}

/// Block fetcher settings.
#[derive(Clone)]
pub struct FetcherConfig {
    /// JSON-RPC endpoint (http, https or ws)
    pub endpoint: String,
    /// Delay between height polls
    pub poll_interval: Duration,
    /// First height to fetch; the current chain height when unset
    pub start_block: Option<u64>,
    /// Last height to fetch; 0 means unbounded
    pub end_block: u64,
    /// Request executor; plain `reqwest` when unset
    pub transport: Option<Arc<dyn Transport>>,
}

impl FetcherConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_block: None,
            end_block: 0,
            transport: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }

    pub fn with_end_block(mut self, block: u64) -> Self {
        self.end_block = block;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

impl fmt::Debug for FetcherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherConfig")
            .field("endpoint", &self.endpoint)
            .field("poll_interval", &self.poll_interval)
            .field("start_block", &self.start_block)
            .field("end_block", &self.end_block)
            .field("custom_transport", &self.transport.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Http,
    WebSocket,
}

/// State written only by the polling task and read by anyone.
#[derive(Default)]
struct Shared {
    running: AtomicBool,
    current_block: AtomicU64,
    last_error: OnceLock<FetchError>,
}

/// Polls an endpoint and emits blocks of type `B`.
pub struct BlockFetcher<B> {
    client: RpcClient,
    mode: Mode,
    detail: BlockDetail,
    poll_interval: Duration,
    start_block: Option<u64>,
    end_block: u64,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    sender: Mutex<Option<mpsc::Sender<B>>>,
    receiver: Mutex<Option<mpsc::Receiver<B>>>,
}

impl<B: BlockLike> BlockFetcher<B> {
    /// Create a fetcher for `config.endpoint`.
    ///
    /// `detail` decides whether full transaction objects are requested and
    /// must match the shape of `B`.
    pub fn new(config: FetcherConfig, detail: BlockDetail) -> Result<Self, FetchError> {
        let url = Url::parse(&config.endpoint)
            .map_err(|e| FetchError::InvalidUrl(format!("{:?}: {}", config.endpoint, e)))?;
        let mode = match url.scheme() {
            "http" | "https" => Mode::Http,
            "ws" => Mode::WebSocket,
            other => return Err(FetchError::UnsupportedScheme(other.to_string())),
        };

        let transport = config
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let shared = Shared::default();
        if let Some(start) = config.start_block {
            shared.current_block.store(start, Ordering::SeqCst);
        }

        Ok(Self {
            client: RpcClient::new(url.to_string(), transport),
            mode,
            detail,
            poll_interval: config.poll_interval,
            start_block: config.start_block,
            end_block: config.end_block,
            shared: Arc::new(shared),
            cancel: CancellationToken::new(),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Hand the block queue to its consumer. Returns `None` after the first call.
    pub fn take_blocks(&self) -> Option<mpsc::Receiver<B>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Start polling in a background task.
    ///
    /// When no start block was configured the current chain height is
    /// queried first and becomes the initial cursor. Returns as soon as the
    /// polling task is spawned.
    pub async fn start(&self) -> Result<(), FetchError> {
        if self.mode == Mode::WebSocket {
            return Err(FetchError::NotImplemented("websocket block subscription"));
        }
        if self.sender_slot().is_none() {
            return Err(FetchError::AlreadyStarted);
        }

        let cursor = match self.start_block {
            Some(block) => block,
            None => self
                .client
                .get_block_number()
                .await
                .map_err(|e| e.context("get current block number on init"))?,
        };

        let sender = self.sender_slot().take().ok_or(FetchError::AlreadyStarted)?;
        self.shared.current_block.store(cursor, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        info!(
            "Starting block fetcher for {} at block {} ({:?} blocks, end block {})",
            self.client.url(),
            cursor,
            self.detail,
            self.end_block
        );

        let poller = Poller {
            client: self.client.clone(),
            full_tx: self.detail.full_transactions(),
            poll_interval: self.poll_interval,
            end_block: self.end_block,
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
            sender,
        };
        tokio::spawn(poller.run());
        Ok(())
    }

    fn sender_slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<B>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B> BlockFetcher<B> {
    /// Ask the polling task to stop. Its queue closes once it has noticed.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Next height the fetcher will request.
    pub fn current_block(&self) -> u64 {
        self.shared.current_block.load(Ordering::SeqCst)
    }

    /// The error that halted the polling task, if any.
    pub fn last_error(&self) -> Option<FetchError> {
        self.shared.last_error.get().cloned()
    }
}

/// The background half of a started fetcher.
struct Poller<B> {
    client: RpcClient,
    full_tx: bool,
    poll_interval: Duration,
    end_block: u64,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    sender: mpsc::Sender<B>,
}

impl<B: BlockLike> Poller<B> {
    async fn run(self) {
        let result = self.poll().await;
        let Poller { shared, sender, .. } = self;

        match result {
            Ok(()) => info!("Block fetcher stopped"),
            Err(err) => {
                error!("Block fetcher halted: {}", err);
                let _ = shared.last_error.set(err);
            }
        }
        // Consumers that observe the closed queue must already see the final state.
        shared.running.store(false, Ordering::SeqCst);
        drop(sender);
    }

    fn past_end(&self, cursor: u64) -> bool {
        self.end_block != 0 && cursor > self.end_block
    }

    async fn poll(&self) -> Result<(), FetchError> {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cursor = self.shared.current_block.load(Ordering::SeqCst);

        loop {
            if self.past_end(cursor) {
                info!("Reached end block {}", self.end_block);
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let height = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                height = self.client.get_block_number() => {
                    height.map_err(|e| e.context("get current block number"))?
                }
            };

            while cursor <= height && !self.past_end(cursor) {
                let block: B = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(()),
                    block = self.client.get_block_by_number::<B>(cursor, self.full_tx) => {
                        block.map_err(|e| e.context(format!("read block 0x{:x} info", cursor)))?
                    }
                };
                debug!("Fetched block {}", cursor);

                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(()),
                    sent = self.sender.send(block) => sent.map_err(|_| FetchError::QueueClosed)?,
                }

                cursor += 1;
                self.shared.current_block.store(cursor, Ordering::SeqCst);
            }
        }
    }
}
