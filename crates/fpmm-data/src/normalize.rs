//! Receipt normalization.
//!
//! Node responses arrive with a mix of encodings: hex strings with or without
//! the `0x` prefix, upper- or lower-case digits, quantities as JSON numbers or
//! hex strings. [`normalize_value`] rewrites a raw JSON tree so every
//! byte-like value is a lowercase `0x`-prefixed hex string, and
//! [`normalize_receipt`] builds the typed [`Receipt`] the decoder works on.
//!
//! Normalization is idempotent: normalizing an already normalized value
//! yields the same value.

use alloy::primitives::{Address, Bytes, B256};
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;

use crate::types::{BlockInfo, LogEntry, Receipt};

/// Keys whose string values are raw bytes even when a node omits the `0x` prefix.
const BYTE_LIKE_KEYS: &[&str] = &[
    "address",
    "blockHash",
    "contractAddress",
    "data",
    "from",
    "hash",
    "input",
    "logsBloom",
    "parentHash",
    "r",
    "s",
    "to",
    "topics",
    "transactionHash",
];

/// A receipt or transaction could not be turned into a [`Receipt`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("required field `{field}` is missing")]
    MissingField { field: &'static str },
    #[error("field `{field}` has invalid value `{value}`")]
    InvalidField { field: &'static str, value: String },
}

/// Recursively canonicalizes a raw JSON value.
///
/// Mappings are walked key by key, sequences element by element. Strings
/// that already carry a `0x` prefix and hex digits are lower-cased; bare hex
/// strings under byte-like keys gain the prefix. Everything else is returned
/// unchanged.
pub fn normalize_value(value: Value) -> Value {
    normalize_inner(value, false)
}

fn normalize_inner(value: Value, byte_like: bool) -> Value {
    match value {
        Value::String(text) => Value::String(normalize_text(text, byte_like)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| normalize_inner(item, byte_like))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| {
                    let byte_like = BYTE_LIKE_KEYS.contains(&key.as_str());
                    (key, normalize_inner(item, byte_like))
                })
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

fn normalize_text(text: String, byte_like: bool) -> String {
    let lowered = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) if is_hex(hex) => Some(format!("0x{}", hex.to_ascii_lowercase())),
        None if byte_like && is_hex(&text) => Some(format!("0x{}", text.to_ascii_lowercase())),
        _ => None,
    };
    lowered.unwrap_or(text)
}

fn is_hex(text: &str) -> bool {
    text.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Builds a [`Receipt`] from the raw transaction and receipt objects.
///
/// Both inputs are normalized first. Transaction fields take precedence;
/// `blockNumber`, `transactionIndex` and `from` fall back to the receipt,
/// and `gasPrice` falls back to the receipt's `effectiveGasPrice`.
///
/// # Errors
/// Returns [`NormalizationError`] when `hash`, `blockNumber`, `gas`, `from`
/// or `logs` is missing, or when any present field cannot be parsed.
pub fn normalize_receipt(
    transaction: Value,
    receipt: Value,
) -> Result<Receipt, NormalizationError> {
    let transaction = normalize_value(transaction);
    let receipt = normalize_value(receipt);

    let transaction_hash = field(&transaction, "hash")
        .or_else(|| field(&receipt, "transactionHash"))
        .ok_or(NormalizationError::MissingField {
            field: "transactionHash",
        })
        .and_then(|value| parse_b256(value, "transactionHash"))?;

    let block_number = required(either(&transaction, &receipt, "blockNumber"), "blockNumber")
        .and_then(|value| quantity_u64(value, "blockNumber"))?;
    let gas = required(field(&transaction, "gas"), "gas")
        .and_then(|value| quantity_u64(value, "gas"))?;
    let from = required(either(&transaction, &receipt, "from"), "from")
        .and_then(|value| parse_address(value, "from"))?;

    let gas_price = field(&transaction, "gasPrice")
        .or_else(|| field(&receipt, "effectiveGasPrice"))
        .map(|value| quantity_u128(value, "gasPrice"))
        .transpose()?;
    let max_fee_per_gas = field(&transaction, "maxFeePerGas")
        .map(|value| quantity_u128(value, "maxFeePerGas"))
        .transpose()?;
    let max_priority_fee_per_gas = field(&transaction, "maxPriorityFeePerGas")
        .map(|value| quantity_u128(value, "maxPriorityFeePerGas"))
        .transpose()?;
    let transaction_index = either(&transaction, &receipt, "transactionIndex")
        .map(|value| quantity_u64(value, "transactionIndex"))
        .transpose()?;
    let to = either(&transaction, &receipt, "to")
        .map(|value| parse_address(value, "to"))
        .transpose()?;
    let status = field(&receipt, "status")
        .map(|value| quantity_u64(value, "status").map(|status| status == 1))
        .transpose()?;

    let raw_logs = field(&receipt, "logs")
        .and_then(Value::as_array)
        .ok_or(NormalizationError::MissingField { field: "logs" })?;
    let mut logs = raw_logs
        .iter()
        .enumerate()
        .map(|(position, raw)| parse_log(raw, position as u64))
        .collect::<Result<Vec<_>, _>>()?;
    logs.sort_by_key(|log| log.log_index);

    Ok(Receipt {
        transaction_hash,
        block_number,
        gas,
        gas_price,
        max_fee_per_gas,
        max_priority_fee_per_gas,
        transaction_index,
        from,
        to,
        status,
        logs,
    })
}

/// Extracts block number, hash and timestamp from a raw block object.
///
/// # Errors
/// Returns [`NormalizationError`] when `number` or `timestamp` is missing or invalid.
pub fn normalize_block(block: Value) -> Result<BlockInfo, NormalizationError> {
    let block = normalize_value(block);
    let number = required(field(&block, "number"), "number")
        .and_then(|value| quantity_u64(value, "number"))?;
    let timestamp = required(field(&block, "timestamp"), "timestamp")
        .and_then(|value| quantity_u64(value, "timestamp"))?;
    let hash = field(&block, "hash")
        .map(|value| parse_b256(value, "hash"))
        .transpose()?;
    Ok(BlockInfo {
        number,
        hash,
        timestamp,
    })
}

fn parse_log(raw: &Value, position: u64) -> Result<LogEntry, NormalizationError> {
    let address = required(field(raw, "address"), "logs.address")
        .and_then(|value| parse_address(value, "logs.address"))?;
    let topics = match field(raw, "topics") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|topic| parse_b256(topic, "logs.topics"))
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(NormalizationError::InvalidField {
                field: "logs.topics",
                value: other.to_string(),
            })
        }
        None => Vec::new(),
    };
    let data = match field(raw, "data") {
        Some(value) => parse_bytes(value, "logs.data")?,
        None => Bytes::new(),
    };
    let log_index = field(raw, "logIndex")
        .map(|value| quantity_u64(value, "logs.logIndex"))
        .transpose()?
        .unwrap_or(position);

    Ok(LogEntry {
        address,
        topics,
        data,
        log_index,
    })
}

/// Looks up `key`, treating JSON `null` as absent.
fn field<'a>(object: &'a Value, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|value| !value.is_null())
}

fn either<'a>(primary: &'a Value, fallback: &'a Value, key: &str) -> Option<&'a Value> {
    field(primary, key).or_else(|| field(fallback, key))
}

fn required<'a>(
    value: Option<&'a Value>,
    name: &'static str,
) -> Result<&'a Value, NormalizationError> {
    value.ok_or(NormalizationError::MissingField { field: name })
}

fn invalid(name: &'static str, value: &Value) -> NormalizationError {
    NormalizationError::InvalidField {
        field: name,
        value: value.to_string(),
    }
}

fn quantity_u64(value: &Value, name: &'static str) -> Result<u64, NormalizationError> {
    quantity_u128(value, name).and_then(|q| u64::try_from(q).map_err(|_| invalid(name, value)))
}

/// Parses a quantity given as a hex string, a decimal string or a JSON number.
fn quantity_u128(value: &Value, name: &'static str) -> Result<u128, NormalizationError> {
    match value {
        Value::Number(number) => number.as_u64().map(u128::from).ok_or_else(|| invalid(name, value)),
        Value::String(text) => match text.strip_prefix("0x") {
            Some("") => Ok(0),
            Some(hex) => u128::from_str_radix(hex, 16).map_err(|_| invalid(name, value)),
            None => text.parse::<u128>().map_err(|_| invalid(name, value)),
        },
        _ => Err(invalid(name, value)),
    }
}

fn parse_address(value: &Value, name: &'static str) -> Result<Address, NormalizationError> {
    value
        .as_str()
        .and_then(|text| Address::from_str(text).ok())
        .ok_or_else(|| invalid(name, value))
}

fn parse_b256(value: &Value, name: &'static str) -> Result<B256, NormalizationError> {
    value
        .as_str()
        .and_then(|text| B256::from_str(text).ok())
        .ok_or_else(|| invalid(name, value))
}

fn parse_bytes(value: &Value, name: &'static str) -> Result<Bytes, NormalizationError> {
    value
        .as_str()
        .and_then(|text| Bytes::from_str(text).ok())
        .ok_or_else(|| invalid(name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "0xAB00000000000000000000000000000000000000000000000000000000000001";

    fn raw_transaction() -> Value {
        json!({
            "hash": HASH,
            "blockNumber": "0x10",
            "gas": 210000,
            "gasPrice": "0x3B9ACA00",
            "transactionIndex": "0x2",
            "from": "F00000000000000000000000000000000000000F",
            "to": "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045",
        })
    }

    fn raw_receipt(logs: Value) -> Value {
        json!({
            "transactionHash": HASH,
            "status": "0x1",
            "logs": logs,
        })
    }

    #[test]
    fn normalize_value_is_idempotent() {
        let raw = json!({
            "hash": "ABCDEF",
            "blockNumber": "0x1F",
            "topics": ["0xDDF2", "aa"],
            "nested": [{"data": "0XFF", "memo": "hello"}],
            "count": 3,
        });

        let once = normalize_value(raw);
        let twice = normalize_value(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once["hash"], "0xabcdef");
        assert_eq!(once["blockNumber"], "0x1f");
        assert_eq!(once["topics"], json!(["0xddf2", "0xaa"]));
        assert_eq!(once["nested"][0]["data"], "0xff");
        assert_eq!(once["nested"][0]["memo"], "hello");
        assert_eq!(once["count"], 3);
    }

    #[test]
    fn bare_hex_outside_byte_keys_is_untouched() {
        let normalized = normalize_value(json!({"label": "deadbeef"}));
        assert_eq!(normalized["label"], "deadbeef");
    }

    #[test]
    fn receipt_sorts_logs_and_parses_quantities() {
        let logs = json!([
            {"address": format!("0x{}", "1".repeat(40)), "topics": [], "data": "0x", "logIndex": "0x5"},
            {"address": format!("0x{}", "2".repeat(40)), "topics": [], "data": "0x", "logIndex": 1},
        ]);

        let receipt =
            normalize_receipt(raw_transaction(), raw_receipt(logs)).expect("receipt should normalize");

        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.gas, 210_000);
        assert_eq!(receipt.gas_price, Some(1_000_000_000));
        assert_eq!(receipt.transaction_index, Some(2));
        assert_eq!(receipt.status, Some(true));
        assert_eq!(
            receipt.logs.iter().map(|l| l.log_index).collect::<Vec<_>>(),
            vec![1, 5]
        );
        assert_eq!(
            format!("{:#x}", receipt.transaction_hash),
            HASH.to_ascii_lowercase()
        );
    }

    #[test]
    fn missing_block_number_is_reported() {
        let mut tx = raw_transaction();
        tx["blockNumber"] = Value::Null;

        let err = normalize_receipt(tx, raw_receipt(json!([])))
            .expect_err("pending transaction should not normalize");
        assert_eq!(
            err,
            NormalizationError::MissingField {
                field: "blockNumber"
            }
        );
    }

    #[test]
    fn missing_logs_is_reported() {
        let err = normalize_receipt(raw_transaction(), json!({"status": "0x1"}))
            .expect_err("receipt without logs should not normalize");
        assert_eq!(err, NormalizationError::MissingField { field: "logs" });
    }

    #[test]
    fn gas_price_falls_back_to_effective_price() {
        let mut tx = raw_transaction();
        tx.as_object_mut().expect("object").remove("gasPrice");
        let mut receipt = raw_receipt(json!([]));
        receipt["effectiveGasPrice"] = json!("0x64");

        let receipt = normalize_receipt(tx, receipt).expect("receipt should normalize");
        assert_eq!(receipt.gas_price, Some(100));
    }

    #[test]
    fn block_info_parses_timestamp() {
        let block = normalize_block(json!({"number": "0x2a", "timestamp": "0x5F5E100"}))
            .expect("block should normalize");
        assert_eq!(block.number, 42);
        assert_eq!(block.timestamp, 100_000_000);
        assert!(block.hash.is_none());
    }
}
