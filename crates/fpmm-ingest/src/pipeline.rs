//! End-to-end ingestion: hashes in, persisted trades and a report out.

use fpmm_data::document::fields;
use fpmm_data::{TradeFilter, TradeStore, TradeType};
use eyre::WrapErr;
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::scheduler::{FailedHash, FetchScheduler, HashOutcome};
use crate::sink::{PersistenceSink, SinkReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IngestOptions {
    /// Drop hashes that already have a record in any collection.
    pub skip_known: bool,
    pub batch_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            skip_known: false,
            batch_size: 2000,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct IngestReport {
    /// Unique hashes after normalization.
    pub requested: usize,
    pub skipped_known: usize,
    /// Hashes that reached an outcome (decoded or failed).
    pub processed: u64,
    pub abandoned: usize,
    pub not_dispatched: usize,
    /// Trade records produced by the decoder.
    pub records: usize,
    pub sink: SinkReport,
    pub failures: Vec<FailedHash>,
    pub cancelled: bool,
}

/// Trims, lower-cases and `0x`-prefixes hashes, dropping blanks and repeats.
pub fn prepare_hashes<I, S>(hashes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut prepared = Vec::new();
    for hash in hashes {
        let hash = hash.as_ref().trim().to_lowercase();
        if hash.is_empty() {
            continue;
        }
        let hash = if hash.starts_with("0x") {
            hash
        } else {
            format!("0x{hash}")
        };
        if seen.insert(hash.clone()) {
            prepared.push(hash);
        }
    }
    prepared
}

/// Fetches, decodes and persists the trades of `hashes`.
///
/// Records are written batch by batch while the scheduler is still running,
/// so hashes finished before a cancellation or crash are already stored.
/// Per-hash failures end up in [`IngestReport::failures`]; only a store
/// failure while loading known hashes aborts the run.
#[tracing::instrument(skip_all, fields(hashes = hashes.len(), skip_known = options.skip_known))]
pub async fn run_ingest<S: TradeStore + ?Sized>(
    scheduler: &FetchScheduler,
    store: &S,
    hashes: Vec<String>,
    options: IngestOptions,
    cancel: CancellationToken,
) -> eyre::Result<IngestReport> {
    let mut hashes = prepare_hashes(hashes);
    let requested = hashes.len();

    let mut skipped_known = 0;
    if options.skip_known {
        let known = store
            .known_hashes()
            .wrap_err("failed to load already ingested hashes")?;
        hashes.retain(|hash| !known.contains(hash));
        skipped_known = requested - hashes.len();
        info!(skipped_known, remaining = hashes.len(), "filtered known hashes");
    }

    let (sender, mut receiver) = mpsc::channel::<HashOutcome>(options.batch_size.max(1));
    let persist = async move {
        let mut sink = PersistenceSink::new(store, options.batch_size);
        let mut records = 0;
        while let Some((_, outcome)) = receiver.recv().await {
            for record in outcome.records() {
                sink.push(record);
            }
            records += outcome.records().len();
        }
        (records, sink.finish())
    };

    let (schedule, (records, sink)) = tokio::join!(scheduler.stream(hashes, cancel, sender), persist);

    let report = IngestReport {
        requested,
        skipped_known,
        processed: schedule.completed,
        abandoned: schedule.abandoned.len(),
        not_dispatched: schedule.not_dispatched,
        records,
        sink,
        failures: schedule.failures,
        cancelled: schedule.cancelled,
    };

    info!(
        requested = report.requested,
        processed = report.processed,
        records = report.records,
        failures = report.failures.len(),
        cancelled = report.cancelled,
        "ingest complete"
    );
    Ok(report)
}

/// Fields whose absence marks a record of `trade_type` as incomplete.
pub fn default_repair_fields(trade_type: TradeType) -> Vec<String> {
    let names: &[&str] = match trade_type {
        TradeType::Buy | TradeType::Sell => &[
            fields::INPUT_AMOUNT,
            fields::INPUT_ASSET_ID,
            fields::OUTPUT_ASSET_ID,
        ],
        TradeType::FundingAdded => &[fields::COLLATERAL_AMOUNT],
        TradeType::FundingRemoved => &[],
    };
    names.iter().map(|name| (*name).to_string()).collect()
}

/// Reprocesses every hash of `trade_type` whose record lacks one of `missing`.
///
/// The store merges fields, so reprocessing fills gaps without dropping
/// fields added later (such as timestamps).
#[tracing::instrument(skip_all, fields(collection = trade_type.collection()))]
pub async fn repair_incomplete<S: TradeStore + ?Sized>(
    scheduler: &FetchScheduler,
    store: &S,
    trade_type: TradeType,
    missing: &[String],
    batch_size: usize,
    cancel: CancellationToken,
) -> eyre::Result<IngestReport> {
    if missing.is_empty() {
        info!("no fields to repair");
        return Ok(IngestReport::default());
    }

    let filter = TradeFilter {
        missing_any_field: missing.to_vec(),
        ..TradeFilter::default()
    };
    let documents = store
        .find(trade_type, &filter)
        .wrap_err_with(|| format!("failed to query incomplete {} records", trade_type.collection()))?;

    let hashes: Vec<String> = documents
        .iter()
        .filter_map(|doc| doc.get(fields::TRANSACTION_HASH).and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    info!(incomplete = hashes.len(), "reprocessing incomplete records");

    let options = IngestOptions {
        skip_known: false,
        batch_size,
    };
    run_ingest(scheduler, store, hashes, options, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_normalized_and_deduplicated() {
        let prepared = prepare_hashes([" 0xABC ", "abc", "", "0xdef", "0xabc"]);
        assert_eq!(prepared, vec!["0xabc".to_string(), "0xdef".to_string()]);
    }

    #[test]
    fn repair_defaults_per_collection() {
        assert_eq!(
            default_repair_fields(TradeType::Buy),
            vec!["inputAmount", "inputAssetId", "outputAssetId"]
        );
        assert_eq!(default_repair_fields(TradeType::FundingAdded), vec!["collateralAmount"]);
        assert!(default_repair_fields(TradeType::FundingRemoved).is_empty());
    }
}
