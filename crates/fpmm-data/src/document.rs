//! Conversion between [`TradeRecord`] and the JSON documents kept in the store.
//!
//! Every integer goes through [`sanitize_int`], so documents never carry a
//! number above `i64::MAX`. Optional fields that the decoder could not
//! recover are omitted rather than written as `null`; merge-style upserts
//! then leave previously stored values in place.

use alloy::primitives::{Address, B256, U256};
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;

use crate::sanitize::{restore_int, sanitize_int, sanitize_u128};
use crate::types::{
    AssetId, FundingAddedDetails, FundingRemovedDetails, SwapDetails, TradeCommon, TradeDetails,
    TradeKey, TradeRecord, TradeType,
};

/// Document field names.
pub mod fields {
    pub const TYPE: &str = "type";
    pub const TRANSACTION_HASH: &str = "transactionHash";
    pub const CONTRACT_ADDRESS: &str = "contractAddress";
    pub const FPMM_ADDRESS: &str = "fpmmAddress";
    pub const BLOCK_NUMBER: &str = "blockNumber";
    pub const GAS: &str = "gas";
    pub const GAS_PRICE: &str = "gasPrice";
    pub const MAX_FEE_PER_GAS: &str = "maxFeePerGas";
    pub const MAX_PRIORITY_FEE_PER_GAS: &str = "maxPriorityFeePerGas";
    pub const TRANSACTION_INDEX: &str = "transactionIndex";
    pub const SENDER: &str = "sender";
    pub const LOG_INDEX: &str = "logIndex";

    pub const TRADER: &str = "trader";
    pub const OUTCOME_INDEX: &str = "outcomeIndex";
    pub const INPUT_ASSET_ID: &str = "inputAssetId";
    pub const INPUT_AMOUNT: &str = "inputAmount";
    pub const OUTPUT_ASSET_ID: &str = "outputAssetId";
    pub const OUTPUT_AMOUNT: &str = "outputAmount";
    pub const FEE: &str = "CPMMFee";

    pub const FUNDER: &str = "funder";
    pub const SHARES_MINTED: &str = "sharesMinted";
    pub const AMOUNTS_ADDED: &str = "amountsAdded";
    pub const COLLATERAL_AMOUNT: &str = "collateralAmount";
    pub const SHARES_BURNT: &str = "sharesBurnt";
    pub const AMOUNTS_REMOVED: &str = "amountsRemoved";
    pub const COLLATERAL_REMOVED_FROM_FEE_POOL: &str = "collateralRemovedFromFeePool";

    /// Written by timestamp enrichment.
    pub const TIMESTAMP: &str = "timestamp";
    /// Written by timestamp enrichment, `YYYY-MM-DD` in UTC.
    pub const DATE: &str = "date";
}

use fields::*;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("document is not a JSON object")]
    NotAnObject,
    #[error("document field `{0}` is missing")]
    MissingField(&'static str),
    #[error("document field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A trade prepared for the store: natural key, indexed columns and document body.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredTrade {
    pub key: TradeKey,
    pub fpmm_address: String,
    pub block_number: u64,
    pub document: Value,
}

impl StoredTrade {
    pub fn from_record(record: &TradeRecord) -> Self {
        Self {
            key: record.key(),
            fpmm_address: record.common.fpmm_address(),
            block_number: record.common.block_number,
            document: record.to_document(),
        }
    }
}

fn int(value: u64) -> Value {
    sanitize_int(U256::from(value))
}

fn asset_value(asset: &AssetId) -> Value {
    match asset {
        AssetId::Collateral(token) => Value::String(format!("{token:#x}")),
        AssetId::OutcomeToken(id) => sanitize_int(*id),
    }
}

fn int_list(values: &[U256]) -> Value {
    Value::Array(values.iter().copied().map(sanitize_int).collect())
}

impl TradeRecord {
    /// Renders the record as a storage-safe document.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        insert_common(&mut doc, self.trade_type(), &self.common);

        match &self.details {
            TradeDetails::Buy(swap) | TradeDetails::Sell(swap) => insert_swap(&mut doc, swap),
            TradeDetails::FundingAdded(added) => {
                doc.insert(FUNDER.into(), Value::String(format!("{:#x}", added.funder)));
                doc.insert(SHARES_MINTED.into(), sanitize_int(added.shares_minted));
                doc.insert(AMOUNTS_ADDED.into(), int_list(&added.amounts_added));
                if let Some(amount) = added.collateral_amount {
                    doc.insert(COLLATERAL_AMOUNT.into(), sanitize_int(amount));
                }
            }
            TradeDetails::FundingRemoved(removed) => {
                doc.insert(FUNDER.into(), Value::String(format!("{:#x}", removed.funder)));
                doc.insert(SHARES_BURNT.into(), sanitize_int(removed.shares_burnt));
                doc.insert(AMOUNTS_REMOVED.into(), int_list(&removed.amounts_removed));
                doc.insert(
                    COLLATERAL_REMOVED_FROM_FEE_POOL.into(),
                    sanitize_int(removed.collateral_removed_from_fee_pool),
                );
            }
        }

        Value::Object(doc)
    }

    /// Rebuilds a record from a stored document.
    ///
    /// Fields added after ingestion (`timestamp`, `date`) are ignored.
    ///
    /// # Errors
    /// Returns [`DocumentError`] when a required field is missing or malformed.
    pub fn from_document(doc: &Value) -> Result<Self, DocumentError> {
        let map = doc.as_object().ok_or(DocumentError::NotAnObject)?;
        let trade_type = required_str(map, TYPE)?
            .parse::<TradeType>()
            .map_err(|reason| DocumentError::InvalidField {
                field: TYPE,
                reason,
            })?;

        let common = TradeCommon {
            transaction_hash: parse_hex::<B256>(map, TRANSACTION_HASH)?,
            contract_address: parse_hex::<Address>(map, CONTRACT_ADDRESS)?,
            block_number: required_u64(map, BLOCK_NUMBER)?,
            gas: required_u64(map, GAS)?,
            gas_price: required_u128(map, GAS_PRICE)?,
            max_fee_per_gas: optional_int(map, MAX_FEE_PER_GAS)?
                .map(|v| narrow_u128(v, MAX_FEE_PER_GAS))
                .transpose()?,
            max_priority_fee_per_gas: optional_int(map, MAX_PRIORITY_FEE_PER_GAS)?
                .map(|v| narrow_u128(v, MAX_PRIORITY_FEE_PER_GAS))
                .transpose()?,
            transaction_index: required_u64(map, TRANSACTION_INDEX)?,
            sender: parse_hex::<Address>(map, SENDER)?,
            log_index: required_u64(map, LOG_INDEX)?,
        };

        let details = match trade_type {
            TradeType::Buy => TradeDetails::Buy(swap_from(map)?),
            TradeType::Sell => TradeDetails::Sell(swap_from(map)?),
            TradeType::FundingAdded => TradeDetails::FundingAdded(FundingAddedDetails {
                funder: parse_hex::<Address>(map, FUNDER)?,
                shares_minted: required_int(map, SHARES_MINTED)?,
                amounts_added: int_list_from(map, AMOUNTS_ADDED)?,
                collateral_amount: optional_int(map, COLLATERAL_AMOUNT)?,
            }),
            TradeType::FundingRemoved => TradeDetails::FundingRemoved(FundingRemovedDetails {
                funder: parse_hex::<Address>(map, FUNDER)?,
                shares_burnt: required_int(map, SHARES_BURNT)?,
                amounts_removed: int_list_from(map, AMOUNTS_REMOVED)?,
                collateral_removed_from_fee_pool: required_int(
                    map,
                    COLLATERAL_REMOVED_FROM_FEE_POOL,
                )?,
            }),
        };

        Ok(Self { common, details })
    }
}

fn insert_common(doc: &mut Map<String, Value>, trade_type: TradeType, common: &TradeCommon) {
    doc.insert(TYPE.into(), Value::from(trade_type.as_str()));
    doc.insert(
        TRANSACTION_HASH.into(),
        Value::String(common.transaction_hash_hex()),
    );
    doc.insert(
        CONTRACT_ADDRESS.into(),
        Value::String(common.contract_address.to_checksum(None)),
    );
    doc.insert(FPMM_ADDRESS.into(), Value::String(common.fpmm_address()));
    doc.insert(BLOCK_NUMBER.into(), int(common.block_number));
    doc.insert(GAS.into(), int(common.gas));
    doc.insert(GAS_PRICE.into(), sanitize_u128(common.gas_price));
    if let Some(fee) = common.max_fee_per_gas {
        doc.insert(MAX_FEE_PER_GAS.into(), sanitize_u128(fee));
    }
    if let Some(tip) = common.max_priority_fee_per_gas {
        doc.insert(MAX_PRIORITY_FEE_PER_GAS.into(), sanitize_u128(tip));
    }
    doc.insert(TRANSACTION_INDEX.into(), int(common.transaction_index));
    doc.insert(SENDER.into(), Value::String(format!("{:#x}", common.sender)));
    doc.insert(LOG_INDEX.into(), int(common.log_index));
}

fn insert_swap(doc: &mut Map<String, Value>, swap: &SwapDetails) {
    doc.insert(TRADER.into(), Value::String(format!("{:#x}", swap.trader)));
    let optional = [
        (OUTCOME_INDEX, swap.outcome_index.map(sanitize_int)),
        (INPUT_ASSET_ID, swap.input_asset_id.as_ref().map(asset_value)),
        (INPUT_AMOUNT, swap.input_amount.map(sanitize_int)),
        (OUTPUT_ASSET_ID, swap.output_asset_id.as_ref().map(asset_value)),
        (OUTPUT_AMOUNT, swap.output_amount.map(sanitize_int)),
        (FEE, swap.fee.map(sanitize_int)),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            doc.insert(key.into(), value);
        }
    }
}

fn swap_from(map: &Map<String, Value>) -> Result<SwapDetails, DocumentError> {
    Ok(SwapDetails {
        trader: parse_hex::<Address>(map, TRADER)?,
        outcome_index: optional_int(map, OUTCOME_INDEX)?,
        input_asset_id: optional_asset(map, INPUT_ASSET_ID)?,
        input_amount: optional_int(map, INPUT_AMOUNT)?,
        output_asset_id: optional_asset(map, OUTPUT_ASSET_ID)?,
        output_amount: optional_int(map, OUTPUT_AMOUNT)?,
        fee: optional_int(map, FEE)?,
    })
}

fn present<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|value| !value.is_null())
}

fn required_str<'a>(
    map: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, DocumentError> {
    match present(map, key) {
        Some(Value::String(text)) => Ok(text.as_str()),
        Some(other) => Err(DocumentError::InvalidField {
            field: key,
            reason: format!("expected a string, found {other}"),
        }),
        None => Err(DocumentError::MissingField(key)),
    }
}

fn parse_hex<T: FromStr>(map: &Map<String, Value>, key: &'static str) -> Result<T, DocumentError> {
    let text = required_str(map, key)?;
    text.parse::<T>().map_err(|_| DocumentError::InvalidField {
        field: key,
        reason: format!("'{text}' is not valid hex"),
    })
}

fn optional_int(map: &Map<String, Value>, key: &'static str) -> Result<Option<U256>, DocumentError> {
    present(map, key)
        .map(|value| {
            restore_int(value).map_err(|err| DocumentError::InvalidField {
                field: key,
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn required_int(map: &Map<String, Value>, key: &'static str) -> Result<U256, DocumentError> {
    optional_int(map, key)?.ok_or(DocumentError::MissingField(key))
}

fn required_u64(map: &Map<String, Value>, key: &'static str) -> Result<u64, DocumentError> {
    let value = required_int(map, key)?;
    u64::try_from(value).map_err(|_| DocumentError::InvalidField {
        field: key,
        reason: format!("{value} does not fit in 64 bits"),
    })
}

fn narrow_u128(value: U256, key: &'static str) -> Result<u128, DocumentError> {
    u128::try_from(value).map_err(|_| DocumentError::InvalidField {
        field: key,
        reason: format!("{value} does not fit in 128 bits"),
    })
}

fn required_u128(map: &Map<String, Value>, key: &'static str) -> Result<u128, DocumentError> {
    narrow_u128(required_int(map, key)?, key)
}

fn int_list_from(map: &Map<String, Value>, key: &'static str) -> Result<Vec<U256>, DocumentError> {
    match present(map, key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                restore_int(item).map_err(|err| DocumentError::InvalidField {
                    field: key,
                    reason: err.to_string(),
                })
            })
            .collect(),
        Some(other) => Err(DocumentError::InvalidField {
            field: key,
            reason: format!("expected an array, found {other}"),
        }),
        None => Err(DocumentError::MissingField(key)),
    }
}

/// Collateral ids are stored as 20-byte hex addresses, outcome-token ids as integers.
fn optional_asset(
    map: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<AssetId>, DocumentError> {
    match present(map, key) {
        None => Ok(None),
        Some(Value::String(text)) if text.starts_with("0x") => text
            .parse::<Address>()
            .map(|token| Some(AssetId::Collateral(token)))
            .map_err(|_| DocumentError::InvalidField {
                field: key,
                reason: format!("'{text}' is not an address"),
            }),
        Some(_) => optional_int(map, key).map(|id| id.map(AssetId::OutcomeToken)),
    }
}
