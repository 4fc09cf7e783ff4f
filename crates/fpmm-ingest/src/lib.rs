//! fpmm-ingest crate
//!
//! Batch ingestion of FPMM trades: provider pool with pacing, bounded retry
//! policy, fetch scheduler, persistence sink and the pipelines built on them
//! (ingest, repair, timestamp enrichment).

pub mod config;
pub mod pipeline;
pub mod provider_pool;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod timestamps;

pub use config::{ConfigError, DispatchKind, IngestConfig};
pub use pipeline::{
    default_repair_fields, prepare_hashes, repair_incomplete, run_ingest, IngestOptions,
    IngestReport,
};
pub use provider_pool::{PacedProvider, ProviderPool};
pub use retry::{Backoff, RetryError, RetryPolicy};
pub use scheduler::{
    DispatchPolicy, FailedHash, FetchScheduler, HashOutcome, ProcessingOutcome, ProgressCounter,
    ScheduleReport, TransactionFailure, LOG_PROCESSING_ERROR, TRANSACTION_PROCESSING_ERROR,
};
pub use sink::{BatchError, PersistenceSink, SinkReport};
pub use timestamps::{enrich_timestamps, TimestampReport};
