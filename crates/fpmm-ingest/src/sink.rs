//! Persistence sink: groups decoded records by trade type and bulk-upserts
//! them in fixed-size batches.

use std::collections::{BTreeMap, HashSet};

use fpmm_data::{FailedWrite, StoredTrade, TradeKey, TradeRecord, TradeStore, TradeType};
use tracing::{debug, error, info};

/// Batch that failed as a whole. Other batches are still written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchError {
    pub collection: &'static str,
    pub batch: usize,
    pub records: usize,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinkReport {
    /// Unique records handed to the store.
    pub submitted: usize,
    /// Records dropped because an earlier record had the same key.
    pub duplicates: usize,
    pub inserted: usize,
    pub matched: usize,
    pub modified: usize,
    pub failed_records: Vec<FailedWrite>,
    pub batch_errors: Vec<BatchError>,
}

impl SinkReport {
    /// Records that made it into the store, new or existing.
    pub fn written(&self) -> usize {
        self.inserted + self.matched
    }
}

/// Buffers records per collection and writes a batch whenever one fills up.
///
/// Records are handed over with [`push`](Self::push) as they are decoded;
/// [`finish`](Self::finish) flushes the partial batches and returns the totals.
pub struct PersistenceSink<'a, S: TradeStore + ?Sized> {
    store: &'a S,
    batch_size: usize,
    seen: HashSet<TradeKey>,
    pending: BTreeMap<TradeType, Vec<StoredTrade>>,
    batches: BTreeMap<TradeType, usize>,
    report: SinkReport,
}

impl<'a, S: TradeStore + ?Sized> PersistenceSink<'a, S> {
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            seen: HashSet::new(),
            pending: BTreeMap::new(),
            batches: BTreeMap::new(),
            report: SinkReport::default(),
        }
    }

    /// Queues `record`, writing its collection's batch once it is full.
    /// The first record for a `(hash, type)` key wins.
    pub fn push(&mut self, record: &TradeRecord) {
        if !self.seen.insert(record.key()) {
            self.report.duplicates += 1;
            return;
        }
        let trade_type = record.trade_type();
        let pending = self.pending.entry(trade_type).or_default();
        pending.push(StoredTrade::from_record(record));
        if pending.len() >= self.batch_size {
            self.flush(trade_type);
        }
    }

    /// Totals of the batches written so far.
    pub fn report(&self) -> &SinkReport {
        &self.report
    }

    /// Writes what is left and returns the totals.
    pub fn finish(mut self) -> SinkReport {
        let collections: Vec<TradeType> = self.pending.keys().copied().collect();
        for trade_type in collections {
            self.flush(trade_type);
        }

        let report = self.report;
        info!(
            submitted = report.submitted,
            duplicates = report.duplicates,
            inserted = report.inserted,
            matched = report.matched,
            modified = report.modified,
            failed = report.failed_records.len(),
            batch_errors = report.batch_errors.len(),
            "records persisted"
        );
        report
    }

    /// Writes all of `records` at once.
    #[tracing::instrument(skip_all, fields(records = records.len(), batch_size = self.batch_size))]
    pub fn write(mut self, records: &[TradeRecord]) -> SinkReport {
        for record in records {
            self.push(record);
        }
        self.finish()
    }

    fn flush(&mut self, trade_type: TradeType) {
        let Some(chunk) = self.pending.remove(&trade_type) else {
            return;
        };
        if chunk.is_empty() {
            return;
        }
        let collection = trade_type.collection();
        let batch = {
            let counter = self.batches.entry(trade_type).or_default();
            let batch = *counter;
            *counter += 1;
            batch
        };

        self.report.submitted += chunk.len();
        match self.store.bulk_upsert(trade_type, &chunk) {
            Ok(summary) => {
                debug!(
                    collection,
                    batch,
                    inserted = summary.inserted,
                    matched = summary.matched,
                    "batch written"
                );
                self.report.inserted += summary.inserted;
                self.report.matched += summary.matched;
                self.report.modified += summary.modified;
                self.report.failed_records.extend(summary.failed);
            }
            Err(err) => {
                error!(collection, batch, records = chunk.len(), error = %err, "batch write failed");
                self.report.batch_errors.push(BatchError {
                    collection,
                    batch,
                    records: chunk.len(),
                    message: err.to_string(),
                });
            }
        }
    }
}
