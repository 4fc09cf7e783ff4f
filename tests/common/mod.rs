//! Shared test helpers and utilities.
//!
//! Provides a scripted in-memory RPC client and builders for raw
//! transaction, receipt and block JSON as a node would return them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{hex, Address, B256, U256};
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use fpmm_data::{FetchError, RpcClient, SqliteStore};
use fpmm_decode::addresses;
use fpmm_decode::signatures::{FPMM_BUY, FPMM_FUNDING_ADDED, FPMM_SELL, TRANSFER, TRANSFER_SINGLE};
use fpmm_decode::TradeDecoder;
use fpmm_ingest::{DispatchPolicy, FetchScheduler, ProviderPool, RetryPolicy};
use serde_json::{json, Value};

pub const TRADER: Address = Address::repeat_byte(0x11);
pub const FPMM: Address = Address::repeat_byte(0xaa);
pub const BLOCK: u64 = 50_000_000;

/// Creates an in-memory SQLite store.
///
/// # Panics
/// Panics if the in-memory database cannot be created (should never happen).
pub fn test_store() -> SqliteStore {
    SqliteStore::new(":memory:").expect("in-memory store should always open")
}

/// Transaction hash `0x00…nn` as a lowercase hex string.
pub fn tx_hash(n: u64) -> String {
    format!("{:#x}", B256::from(U256::from(n)))
}

pub fn topic(address: Address) -> String {
    format!("{:#x}", address.into_word())
}

pub fn topic_uint(value: u64) -> String {
    format!("{:#x}", B256::from(U256::from(value)))
}

/// Concatenated 32-byte big-endian words, `0x`-prefixed.
pub fn words(values: &[U256]) -> String {
    let mut data = Vec::with_capacity(values.len() * 32);
    for value in values {
        data.extend_from_slice(&value.to_be_bytes::<32>());
    }
    hex::encode_prefixed(data)
}

pub fn u(value: u64) -> U256 {
    U256::from(value)
}

pub fn log(address: Address, topics: Vec<String>, data: String, log_index: u64) -> Value {
    json!({
        "address": format!("{:#x}", address),
        "topics": topics,
        "data": data,
        "logIndex": format!("{:#x}", log_index),
    })
}

/// `FPMMBuy(buyer, investmentAmount, feeAmount, outcomeIndex, outcomeTokensBought)`.
pub fn buy_log(buyer: Address, investment: u64, fee: u64, outcome_index: u64, bought: u64, log_index: u64) -> Value {
    log(
        FPMM,
        vec![format!("{:#x}", FPMM_BUY), topic(buyer), topic_uint(outcome_index)],
        words(&[u(investment), u(fee), u(bought)]),
        log_index,
    )
}

/// `FPMMSell` with an arbitrary raw payload.
pub fn sell_log(seller: Address, outcome_index: u64, data: String, log_index: u64) -> Value {
    log(
        FPMM,
        vec![format!("{:#x}", FPMM_SELL), topic(seller), topic_uint(outcome_index)],
        data,
        log_index,
    )
}

pub fn funding_added_log(funder: Address, amounts: Vec<U256>, shares: U256, log_index: u64) -> Value {
    log(
        FPMM,
        vec![format!("{:#x}", FPMM_FUNDING_ADDED), topic(funder)],
        hex::encode_prefixed((amounts, shares).abi_encode_params()),
        log_index,
    )
}

/// ERC-20 `Transfer` emitted by `token`.
pub fn transfer_log(token: Address, from: Address, to: Address, amount: U256, log_index: u64) -> Value {
    log(
        token,
        vec![format!("{:#x}", TRANSFER), topic(from), topic(to)],
        words(&[amount]),
        log_index,
    )
}

/// ERC-1155 `TransferSingle` on the conditional-token ledger.
pub fn outcome_transfer_log(from: Address, to: Address, id: U256, value: U256, log_index: u64) -> Value {
    log(
        addresses::CONDITIONAL_TOKENS,
        vec![
            format!("{:#x}", TRANSFER_SINGLE),
            topic(FPMM),
            topic(from),
            topic(to),
        ],
        words(&[id, value]),
        log_index,
    )
}

pub fn transaction_json(hash: &str, block: u64) -> Value {
    json!({
        "hash": hash,
        "blockNumber": format!("{:#x}", block),
        "gas": "0x61a80",
        "gasPrice": "0x6fc23ac00",
        "maxFeePerGas": "0xba43b7400",
        "maxPriorityFeePerGas": "0x6fc23ac00",
        "transactionIndex": "0x3",
        "from": format!("{:#x}", TRADER),
        "to": format!("{:#x}", FPMM),
    })
}

pub fn receipt_json(hash: &str, block: u64, logs: Vec<Value>) -> Value {
    json!({
        "transactionHash": hash,
        "blockNumber": format!("{:#x}", block),
        "from": format!("{:#x}", TRADER),
        "status": "0x1",
        "logs": logs,
    })
}

pub fn block_json(number: u64, timestamp: u64) -> Value {
    json!({
        "number": format!("{:#x}", number),
        "hash": format!("{:#x}", B256::from(U256::from(number))),
        "timestamp": format!("{:#x}", timestamp),
    })
}

/// Buy of 1 000 000 collateral for 1 950 000 outcome tokens of id 7, fee 20 000.
pub fn buy_receipt_logs() -> Vec<Value> {
    vec![
        transfer_log(addresses::USDC, TRADER, FPMM, u(1_000_000), 0),
        outcome_transfer_log(FPMM, TRADER, u(7), u(1_950_000), 1),
        buy_log(TRADER, 1_000_000, 20_000, 1, 1_950_000, 2),
    ]
}

/// In-memory node. Unknown hashes and blocks answer `NotFound`.
#[derive(Default)]
pub struct MockRpcClient {
    name: String,
    transactions: HashMap<String, Value>,
    receipts: HashMap<String, Value>,
    blocks: HashMap<u64, Value>,
    /// Remaining transient failures per hash (applied to `get_transaction`)
    /// or per decimal block number (applied to `get_block`).
    flaky: Mutex<HashMap<String, u32>>,
    delay: Duration,
    calls: AtomicUsize,
    served: Mutex<Vec<String>>,
}

impl MockRpcClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Adds a transaction and its receipt.
    pub fn with_receipt(mut self, hash: &str, block: u64, logs: Vec<Value>) -> Self {
        self.transactions
            .insert(hash.to_string(), transaction_json(hash, block));
        self.receipts
            .insert(hash.to_string(), receipt_json(hash, block, logs));
        self
    }

    pub fn with_raw(mut self, hash: &str, transaction: Value, receipt: Value) -> Self {
        self.transactions.insert(hash.to_string(), transaction);
        self.receipts.insert(hash.to_string(), receipt);
        self
    }

    pub fn with_block(mut self, number: u64, timestamp: u64) -> Self {
        self.blocks.insert(number, block_json(number, timestamp));
        self
    }

    /// First `failures` transaction lookups of `hash` time out.
    pub fn with_flaky(self, hash: &str, failures: u32) -> Self {
        self.flaky
            .lock()
            .expect("flaky map lock should not be poisoned")
            .insert(hash.to_string(), failures);
        self
    }

    /// First `failures` lookups of block `number` time out.
    pub fn with_flaky_block(self, number: u64, failures: u32) -> Self {
        self.with_flaky(&number.to_string(), failures)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Hashes whose transaction was requested from this client, in order.
    pub fn served(&self) -> Vec<String> {
        self.served
            .lock()
            .expect("served lock should not be poisoned")
            .clone()
    }

    fn fail_if_flaky(&self, key: &str) -> Result<(), FetchError> {
        let mut flaky = self.flaky.lock().expect("flaky map lock should not be poisoned");
        match flaky.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(FetchError::Timeout(Duration::from_secs(1)))
            }
            _ => Ok(()),
        }
    }

    async fn respond(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl RpcClient for MockRpcClient {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn get_transaction(&self, hash: &str) -> Result<Value, FetchError> {
        self.served
            .lock()
            .expect("served lock should not be poisoned")
            .push(hash.to_string());
        self.respond().await;
        self.fail_if_flaky(hash)?;

        self.transactions
            .get(hash)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                kind: "transaction",
                id: hash.to_string(),
            })
    }

    async fn get_transaction_receipt(&self, hash: &str) -> Result<Value, FetchError> {
        self.respond().await;
        self.receipts
            .get(hash)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                kind: "receipt",
                id: hash.to_string(),
            })
    }

    async fn get_block(&self, number: u64) -> Result<Value, FetchError> {
        self.respond().await;
        self.fail_if_flaky(&number.to_string())?;
        self.blocks
            .get(&number)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                kind: "block",
                id: number.to_string(),
            })
    }
}

/// Pool over the given clients with no pacing.
pub fn pool(clients: Vec<Arc<MockRpcClient>>) -> Arc<ProviderPool> {
    let clients = clients
        .into_iter()
        .map(|client| client as Arc<dyn RpcClient>)
        .collect();
    Arc::new(
        ProviderPool::new(clients, Duration::ZERO, Duration::from_secs(5))
            .expect("pool should build"),
    )
}

pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: fpmm_ingest::Backoff::Fixed(Duration::from_millis(1)),
    }
}

pub fn scheduler(pool: Arc<ProviderPool>, dispatch: DispatchPolicy) -> FetchScheduler {
    FetchScheduler::new(pool, TradeDecoder::default(), quick_retry(3), dispatch)
}
