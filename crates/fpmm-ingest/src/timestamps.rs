//! Block timestamp enrichment.
//!
//! Collects the blocks of every record that has no `timestamp` yet, fetches
//! each block once over the provider pool and writes `timestamp` and `date`
//! back into the affected records.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use eyre::WrapErr;
use fpmm_data::document::fields;
use fpmm_data::sanitize::restore_int;
use fpmm_data::{normalize_block, TradeFilter, TradeStore, TradeType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::provider_pool::{PacedProvider, ProviderPool};
use crate::retry::{RetryError, RetryPolicy};
use crate::scheduler::split_chunks;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimestampReport {
    /// Records found without a timestamp.
    pub documents: usize,
    /// Distinct blocks among them.
    pub blocks: usize,
    pub fetched: usize,
    /// Blocks whose header could not be fetched, with the reason.
    pub failed_blocks: Vec<(u64, String)>,
    /// Blocks whose retries were cut short by cancellation.
    pub abandoned_blocks: Vec<u64>,
    /// Records updated in the store.
    pub updated: usize,
    pub write_errors: usize,
    pub cancelled: bool,
}

/// Fills in `timestamp` and `date` for every record of `trade_type` missing them.
#[tracing::instrument(skip_all, fields(collection = trade_type.collection()))]
pub async fn enrich_timestamps<S: TradeStore + ?Sized>(
    pool: Arc<ProviderPool>,
    store: &S,
    trade_type: TradeType,
    retry: RetryPolicy,
    batch_size: usize,
    cancel: CancellationToken,
) -> eyre::Result<TimestampReport> {
    let filter = TradeFilter {
        missing_timestamp: true,
        ..TradeFilter::default()
    };
    let documents = store
        .find(trade_type, &filter)
        .wrap_err("failed to query records without timestamps")?;

    let mut blocks = BTreeSet::new();
    for doc in &documents {
        let block = doc
            .get(fields::BLOCK_NUMBER)
            .and_then(|value| restore_int(value).ok())
            .and_then(|value| u64::try_from(value).ok());
        match block {
            Some(block) => {
                blocks.insert(block);
            }
            None => warn!(
                tx_hash = ?doc.get(fields::TRANSACTION_HASH),
                "record has no usable block number"
            ),
        }
    }
    let blocks: Vec<u64> = blocks.into_iter().collect();

    let mut report = TimestampReport {
        documents: documents.len(),
        blocks: blocks.len(),
        ..TimestampReport::default()
    };
    info!(documents = report.documents, blocks = report.blocks, "enriching timestamps");
    if blocks.is_empty() {
        return Ok(report);
    }

    let cache: Arc<DashMap<u64, u64>> = Arc::new(DashMap::new());
    let failed: Arc<Mutex<Vec<(u64, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = split_chunks(blocks, pool.len())
        .into_iter()
        .enumerate()
        .map(|(worker, chunk)| {
            tokio::spawn(fetch_blocks(
                pool.for_worker(worker),
                chunk,
                retry,
                Arc::clone(&cache),
                Arc::clone(&failed),
                cancel.clone(),
            ))
        })
        .collect();

    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok(abandoned) => report.abandoned_blocks.extend(abandoned),
            Err(e) => error!("block fetch task join error: {}", e),
        }
    }
    report.abandoned_blocks.sort_unstable();

    let mut timestamps: Vec<(u64, u64)> = cache.iter().map(|entry| (*entry.key(), *entry.value())).collect();
    timestamps.sort_unstable();
    report.fetched = timestamps.len();
    report.failed_blocks = std::mem::take(&mut *failed.lock().unwrap_or_else(PoisonError::into_inner));
    report.failed_blocks.sort();
    report.cancelled = cancel.is_cancelled();

    for (batch, chunk) in timestamps.chunks(batch_size.max(1)).enumerate() {
        match store.set_block_timestamps(trade_type, chunk) {
            Ok(updated) => {
                debug!(batch, blocks = chunk.len(), updated, "timestamps written");
                report.updated += updated;
            }
            Err(err) => {
                error!(batch, blocks = chunk.len(), error = %err, "timestamp batch write failed");
                report.write_errors += 1;
            }
        }
    }

    info!(
        fetched = report.fetched,
        failed = report.failed_blocks.len(),
        abandoned = report.abandoned_blocks.len(),
        updated = report.updated,
        "timestamp enrichment complete"
    );
    Ok(report)
}

/// Returns the blocks abandoned on cancellation.
async fn fetch_blocks(
    provider: Arc<PacedProvider>,
    blocks: Vec<u64>,
    retry: RetryPolicy,
    cache: Arc<DashMap<u64, u64>>,
    failed: Arc<Mutex<Vec<(u64, String)>>>,
    cancel: CancellationToken,
) -> Vec<u64> {
    let mut abandoned = Vec::new();
    for block in blocks {
        if cancel.is_cancelled() {
            break;
        }
        if cache.contains_key(&block) {
            continue;
        }

        let outcome = match retry
            .run("eth_getBlockByNumber", &cancel, |_| provider.get_block(block))
            .await
        {
            Err(RetryError::Cancelled { .. }) => {
                debug!(block, "block abandoned on cancellation");
                abandoned.push(block);
                continue;
            }
            fetched => fetched
                .map_err(|err| err.to_string())
                .and_then(|raw| normalize_block(raw).map_err(|err| err.to_string())),
        };

        match outcome {
            Ok(info) => {
                cache.insert(block, info.timestamp);
            }
            Err(message) => {
                warn!(block, provider = provider.endpoint(), error = %message, "block fetch failed");
                failed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((block, message));
            }
        }
    }

    abandoned
}
