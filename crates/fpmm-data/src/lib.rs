//! fpmm-data crate
//!
//! Receipt and trade data model, receipt normalization, the JSON-RPC client
//! used to fetch raw node data, and the SQLite-backed trade store.

pub mod document;
pub mod normalize;
pub mod rpc;
pub mod sanitize;
pub mod store;
pub mod types;

pub use document::{DocumentError, StoredTrade};
pub use normalize::{normalize_block, normalize_receipt, normalize_value, NormalizationError};
pub use rpc::{FetchError, JsonRpcClient, RpcClient};
pub use store::{FailedWrite, SqliteStore, StoreError, TradeFilter, TradeStore, UpsertSummary};
pub use types::{
    AssetId, BlockInfo, FundingAddedDetails, FundingRemovedDetails, LogEntry, Receipt,
    SwapDetails, TradeCommon, TradeDetails, TradeKey, TradeRecord, TradeType,
};
