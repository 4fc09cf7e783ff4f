//! Fetch scheduler.
//!
//! Distributes transaction hashes over the provider pool, fetches each
//! transaction and receipt with the shared retry policy, normalizes and
//! decodes them. Two dispatch policies are supported:
//!
//! - `SharedQueue`: M workers pull from one queue, worker `i` pinned to provider `i % N`.
//! - `StaticChunks`: the list is cut into `min(N, len)` contiguous chunks of
//!   near-equal size, one worker per provider.
//!
//! Workers share only the failure list and the progress counter, both behind
//! a mutex. Finished outcomes are sent over a channel as each hash completes,
//! so a consumer can persist them while the run is still going.
//! Cancellation stops new dispatch; a hash cancelled mid-retry is reported as
//! abandoned and produces no outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use fpmm_data::{normalize_receipt, NormalizationError, TradeRecord};
use fpmm_decode::{DecodedTransaction, TradeDecoder};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::provider_pool::{PacedProvider, ProviderPool};
use crate::retry::{RetryError, RetryPolicy};

/// Tag of a hash whose transaction or receipt could not be fetched or normalized.
pub const TRANSACTION_PROCESSING_ERROR: &str = "transaction_processing_error";
/// Tag of a single primary log that failed to decode.
pub const LOG_PROCESSING_ERROR: &str = "log_processing_error";

/// A finished hash and what came of it.
pub type HashOutcome = (String, ProcessingOutcome);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchPolicy {
    SharedQueue { workers: usize },
    StaticChunks,
}

/// Why a whole hash produced no records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionFailure {
    #[error("{call} failed: {source}")]
    Fetch {
        call: &'static str,
        #[source]
        source: RetryError,
    },
    #[error("normalization failed: {0}")]
    Normalization(#[from] NormalizationError),
}

/// Per-hash result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Decoded(DecodedTransaction),
    Failed(TransactionFailure),
}

impl ProcessingOutcome {
    pub fn records(&self) -> &[TradeRecord] {
        match self {
            ProcessingOutcome::Decoded(decoded) => &decoded.records,
            ProcessingOutcome::Failed(_) => &[],
        }
    }

    /// Diagnostics for this outcome, empty when everything decoded.
    pub fn failures(&self, hash: &str) -> Vec<FailedHash> {
        match self {
            ProcessingOutcome::Failed(failure) => vec![FailedHash {
                transaction_hash: hash.to_string(),
                tag: TRANSACTION_PROCESSING_ERROR,
                log_index: None,
                message: failure.to_string(),
            }],
            ProcessingOutcome::Decoded(decoded) => decoded
                .log_errors
                .iter()
                .map(|err| FailedHash {
                    transaction_hash: hash.to_string(),
                    tag: LOG_PROCESSING_ERROR,
                    log_index: Some(err.log_index),
                    message: err.source.to_string(),
                })
                .collect(),
        }
    }
}

/// One entry of the failure list.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FailedHash {
    pub transaction_hash: String,
    pub tag: &'static str,
    pub log_index: Option<u64>,
    pub message: String,
}

/// Monotonic completed-hash counter, mirrored to a progress bar.
pub struct ProgressCounter {
    completed: Mutex<u64>,
    bar: ProgressBar,
}

impl ProgressCounter {
    pub fn new(total: u64, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} hashes ({eta})",
            ) {
                bar.set_style(style.progress_chars("#>-"));
            }
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            completed: Mutex::new(0),
            bar,
        }
    }

    /// Records one finished hash and returns the new total.
    pub fn increment(&self) -> u64 {
        let mut completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        *completed += 1;
        self.bar.inc(1);
        *completed
    }

    pub fn completed(&self) -> u64 {
        *self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Result of one scheduler run.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    /// Filled by [`FetchScheduler::run`]; empty after [`FetchScheduler::stream`].
    pub outcomes: HashMap<String, ProcessingOutcome>,
    /// Sorted by hash, then log index.
    pub failures: Vec<FailedHash>,
    pub completed: u64,
    /// Hashes started but given up on cancellation.
    pub abandoned: Vec<String>,
    /// Hashes never picked up because of cancellation.
    pub not_dispatched: usize,
    pub cancelled: bool,
}

impl ScheduleReport {
    /// Records of every decoded hash, following the order of `hashes`.
    pub fn records_in_order(&self, hashes: &[String]) -> Vec<TradeRecord> {
        hashes
            .iter()
            .filter_map(|hash| self.outcomes.get(hash))
            .flat_map(|outcome| outcome.records().iter().cloned())
            .collect()
    }
}

enum WorkSource {
    Shared {
        hashes: Arc<Vec<String>>,
        cursor: Arc<AtomicUsize>,
    },
    Chunk(std::vec::IntoIter<String>),
}

impl WorkSource {
    fn next_hash(&mut self) -> Option<String> {
        match self {
            WorkSource::Shared { hashes, cursor } => {
                let position = cursor.fetch_add(1, Ordering::Relaxed);
                hashes.get(position).cloned()
            }
            WorkSource::Chunk(chunk) => chunk.next(),
        }
    }
}

/// Cuts `items` into `min(parts, len)` contiguous chunks whose sizes differ by at most one.
pub(crate) fn split_chunks<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    let parts = parts.max(1).min(items.len());
    if parts == 0 {
        return Vec::new();
    }
    let base = items.len() / parts;
    let extra = items.len() % parts;

    let mut remaining = items.into_iter();
    (0..parts)
        .map(|part| {
            let size = if part < extra { base + 1 } else { base };
            remaining.by_ref().take(size).collect()
        })
        .collect()
}

struct WorkerShared {
    decoder: Arc<TradeDecoder>,
    retry: RetryPolicy,
    progress: ProgressCounter,
    failures: Mutex<Vec<FailedHash>>,
    cancel: CancellationToken,
}

/// Finished outcomes buffered between workers and the consumer.
const OUTCOME_BUFFER: usize = 256;

pub struct FetchScheduler {
    pool: Arc<ProviderPool>,
    decoder: Arc<TradeDecoder>,
    retry: RetryPolicy,
    dispatch: DispatchPolicy,
    show_progress: bool,
}

impl FetchScheduler {
    pub fn new(
        pool: Arc<ProviderPool>,
        decoder: TradeDecoder,
        retry: RetryPolicy,
        dispatch: DispatchPolicy,
    ) -> Self {
        Self {
            pool,
            decoder: Arc::new(decoder),
            retry,
            dispatch,
            show_progress: false,
        }
    }

    /// Shows an `indicatif` progress bar while running.
    pub fn with_progress(mut self, visible: bool) -> Self {
        self.show_progress = visible;
        self
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Fetches and decodes every hash, returning one outcome per completed hash.
    pub async fn run(&self, hashes: Vec<String>, cancel: CancellationToken) -> ScheduleReport {
        let (sender, mut receiver) = mpsc::channel::<HashOutcome>(OUTCOME_BUFFER);
        let collect = async move {
            let mut outcomes = HashMap::new();
            while let Some((hash, outcome)) = receiver.recv().await {
                outcomes.insert(hash, outcome);
            }
            outcomes
        };

        let (mut report, outcomes) = tokio::join!(self.stream(hashes, cancel, sender), collect);
        report.outcomes = outcomes;
        report
    }

    /// Fetches and decodes every hash, sending each outcome to `outcomes` as
    /// soon as its hash finishes. The channel closes when the run ends.
    #[tracing::instrument(skip_all, fields(hashes = hashes.len(), providers = self.pool.len()))]
    pub async fn stream(
        &self,
        hashes: Vec<String>,
        cancel: CancellationToken,
        outcomes: mpsc::Sender<HashOutcome>,
    ) -> ScheduleReport {
        let total = hashes.len();
        let shared = Arc::new(WorkerShared {
            decoder: Arc::clone(&self.decoder),
            retry: self.retry,
            progress: ProgressCounter::new(total as u64, self.show_progress),
            failures: Mutex::new(Vec::new()),
            cancel: cancel.clone(),
        });

        let sources: Vec<(usize, WorkSource)> = match self.dispatch {
            DispatchPolicy::SharedQueue { workers } => {
                let hashes = Arc::new(hashes);
                let cursor = Arc::new(AtomicUsize::new(0));
                (0..workers.max(1))
                    .map(|worker| {
                        let source = WorkSource::Shared {
                            hashes: Arc::clone(&hashes),
                            cursor: Arc::clone(&cursor),
                        };
                        (worker, source)
                    })
                    .collect()
            }
            DispatchPolicy::StaticChunks => split_chunks(hashes, self.pool.len())
                .into_iter()
                .enumerate()
                .map(|(worker, chunk)| (worker, WorkSource::Chunk(chunk.into_iter())))
                .collect(),
        };

        info!(workers = sources.len(), "dispatching hashes");

        let mut handles = Vec::with_capacity(sources.len());
        for (worker, source) in sources {
            let provider = self.pool.for_worker(worker);
            let shared = Arc::clone(&shared);
            let outcomes = outcomes.clone();
            handles.push(tokio::spawn(run_worker(worker, provider, source, shared, outcomes)));
        }
        drop(outcomes);

        let mut report = ScheduleReport::default();
        for handle in handles {
            match handle.await {
                Ok(abandoned) => report.abandoned.extend(abandoned),
                Err(e) => error!("worker task join error: {}", e),
            }
        }

        shared.progress.finish();
        report.completed = shared.progress.completed();
        report.cancelled = cancel.is_cancelled();
        report.not_dispatched =
            total.saturating_sub(report.completed as usize + report.abandoned.len());
        report.failures = std::mem::take(
            &mut *shared.failures.lock().unwrap_or_else(PoisonError::into_inner),
        );
        report.failures.sort();

        info!(
            completed = report.completed,
            failures = report.failures.len(),
            abandoned = report.abandoned.len(),
            not_dispatched = report.not_dispatched,
            cancelled = report.cancelled,
            "scheduler finished"
        );
        report
    }
}

/// Returns the hashes abandoned on cancellation.
async fn run_worker(
    worker: usize,
    provider: Arc<PacedProvider>,
    mut source: WorkSource,
    shared: Arc<WorkerShared>,
    outcomes: mpsc::Sender<HashOutcome>,
) -> Vec<String> {
    let mut abandoned = Vec::new();

    while !shared.cancel.is_cancelled() {
        let Some(hash) = source.next_hash() else {
            break;
        };

        match process_hash(&provider, &shared, &hash).await {
            Some(outcome) => {
                let failures = outcome.failures(&hash);
                if !failures.is_empty() {
                    shared
                        .failures
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend(failures);
                }
                let done = shared.progress.increment();
                debug!(tx_hash = %hash, worker, done, "hash processed");
                if outcomes.send((hash, outcome)).await.is_err() {
                    warn!(worker, "outcome receiver dropped, result discarded");
                }
            }
            None => {
                debug!(tx_hash = %hash, worker, "hash abandoned on cancellation");
                abandoned.push(hash);
            }
        }
    }

    abandoned
}

/// Fetch, normalize, decode. `None` means the hash was abandoned on cancellation.
async fn process_hash(
    provider: &PacedProvider,
    shared: &WorkerShared,
    hash: &str,
) -> Option<ProcessingOutcome> {
    let cancel = &shared.cancel;

    let transaction = match shared
        .retry
        .run("eth_getTransactionByHash", cancel, |_| provider.get_transaction(hash))
        .await
    {
        Ok(transaction) => transaction,
        Err(RetryError::Cancelled { .. }) => return None,
        Err(source) => return Some(fetch_failure("eth_getTransactionByHash", source, provider, hash)),
    };

    let receipt = match shared
        .retry
        .run("eth_getTransactionReceipt", cancel, |_| {
            provider.get_transaction_receipt(hash)
        })
        .await
    {
        Ok(receipt) => receipt,
        Err(RetryError::Cancelled { .. }) => return None,
        Err(source) => {
            return Some(fetch_failure("eth_getTransactionReceipt", source, provider, hash))
        }
    };

    match normalize_receipt(transaction, receipt) {
        Ok(receipt) => Some(ProcessingOutcome::Decoded(
            shared.decoder.decode_receipt(&receipt),
        )),
        Err(err) => {
            warn!(tx_hash = %hash, error = %err, "transaction_processing_error");
            Some(ProcessingOutcome::Failed(err.into()))
        }
    }
}

fn fetch_failure(
    call: &'static str,
    source: RetryError,
    provider: &PacedProvider,
    hash: &str,
) -> ProcessingOutcome {
    error!(
        tx_hash = %hash,
        provider = provider.endpoint(),
        attempts = source.attempts(),
        error = %source,
        "transaction_processing_error"
    );
    ProcessingOutcome::Failed(TransactionFailure::Fetch { call, source })
}
