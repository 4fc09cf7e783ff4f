//! Trade reconstruction from FPMM event logs.
//!
//! Each primary event (`FPMMBuy`, `FPMMSell`, `FPMMFundingAdded`,
//! `FPMMFundingRemoved`) in a receipt becomes one [`TradeRecord`]. Fields the
//! event itself does not carry are recovered from transfer logs in the same
//! receipt via [`crate::matcher`]; a missing auxiliary log leaves the field
//! empty and emits a warning, it never fails the record.
//!
//! Decoding is pure over the receipt. The only side effect is tracing output.

use alloy::primitives::{Address, U256};
use alloy::sol_types::SolEvent;
use fpmm_data::{
    AssetId, FundingAddedDetails, FundingRemovedDetails, LogEntry, Receipt, SwapDetails,
    TradeCommon, TradeDetails, TradeRecord, TradeType,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::matcher::{self, Direction};
use crate::signatures::abi::IFixedProductMarketMaker::{
    FPMMBuy, FPMMFundingAdded, FPMMFundingRemoved,
};
use crate::signatures::SignatureRegistry;

/// Polygon contract addresses used by the Omen/Presagio markets.
pub mod addresses {
    use alloy::primitives::Address;

    /// Bridged USDC on Polygon, the FPMM collateral token.
    pub const USDC: Address =
        alloy::primitives::address!("2791bca1f2de4661ed88a30c99a7a9449aa84174");

    /// Gnosis ConditionalTokens, the ERC-1155 outcome-token ledger.
    pub const CONDITIONAL_TOKENS: Address =
        alloy::primitives::address!("4D97DCd97eC945f40cF65F87097ACe5EA0476045");
}

/// Contracts the decoder correlates against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    pub collateral_token: Address,
    pub conditional_tokens: Address,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            collateral_token: addresses::USDC,
            conditional_tokens: addresses::CONDITIONAL_TOKENS,
        }
    }
}

/// Why one primary log could not become a record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing indexed topic {index}")]
    MissingTopic { index: usize },
    #[error("event data holds {actual} bytes, expected at least {expected}")]
    ShortData { expected: usize, actual: usize },
    #[error("failed to decode {event}: {reason}")]
    Abi { event: &'static str, reason: String },
    #[error("transaction field `{field}` is missing")]
    MissingCommonField { field: &'static str },
}

/// A [`DecodeError`] attributed to its transaction and log.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("log {log_index} of {transaction_hash} ({trade_type}): {source}")]
pub struct LogProcessingError {
    pub transaction_hash: String,
    pub log_index: u64,
    pub trade_type: TradeType,
    #[source]
    pub source: DecodeError,
}

/// Everything one receipt produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedTransaction {
    /// Records in ascending log order.
    pub records: Vec<TradeRecord>,
    /// Primary logs that failed; other logs of the receipt were still decoded.
    pub log_errors: Vec<LogProcessingError>,
}

pub struct TradeDecoder {
    config: DecoderConfig,
    registry: &'static SignatureRegistry,
}

impl Default for TradeDecoder {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

fn abi_error(event: &'static str, err: alloy::sol_types::Error) -> DecodeError {
    DecodeError::Abi {
        event,
        reason: err.to_string(),
    }
}

/// Fixed 32-byte slot of the raw payload.
fn payload_word(log: &LogEntry, slot: usize, slots: usize) -> Result<U256, DecodeError> {
    log.data_word(slot).ok_or(DecodeError::ShortData {
        expected: slots * 32,
        actual: log.data.len(),
    })
}

impl TradeDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            registry: SignatureRegistry::global(),
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Trade type of a primary log; `None` for every other log.
    pub fn classify(&self, log: &LogEntry) -> Option<TradeType> {
        let topic0 = log.topic0()?;
        self.registry.classify(topic0)?.trade_type()
    }

    /// Decodes every primary event of `receipt`, in log order.
    #[tracing::instrument(skip_all, fields(tx_hash = %receipt.transaction_hash))]
    pub fn decode_receipt(&self, receipt: &Receipt) -> DecodedTransaction {
        let mut decoded = DecodedTransaction::default();

        for log in &receipt.logs {
            let Some(trade_type) = self.classify(log) else {
                continue;
            };
            match self.decode_log(receipt, log, trade_type) {
                Ok(record) => decoded.records.push(record),
                Err(source) => {
                    warn!(
                        log_index = log.log_index,
                        trade_type = %trade_type,
                        error = %source,
                        "log_processing_error"
                    );
                    decoded.log_errors.push(LogProcessingError {
                        transaction_hash: format!("{:#x}", receipt.transaction_hash),
                        log_index: log.log_index,
                        trade_type,
                        source,
                    });
                }
            }
        }

        debug!(
            records = decoded.records.len(),
            errors = decoded.log_errors.len(),
            "receipt decoded"
        );
        decoded
    }

    /// Builds the record for one primary log already classified as `trade_type`.
    ///
    /// # Errors
    /// Returns [`DecodeError`] when the transaction lacks a required common
    /// field or the event payload is malformed.
    pub fn decode_log(
        &self,
        receipt: &Receipt,
        log: &LogEntry,
        trade_type: TradeType,
    ) -> Result<TradeRecord, DecodeError> {
        let common = common_fields(receipt, log)?;
        let details = match trade_type {
            TradeType::Buy => TradeDetails::Buy(self.decode_buy(receipt, log)?),
            TradeType::Sell => TradeDetails::Sell(self.decode_sell(receipt, log)?),
            TradeType::FundingAdded => {
                TradeDetails::FundingAdded(self.decode_funding_added(receipt, log)?)
            }
            TradeType::FundingRemoved => {
                TradeDetails::FundingRemoved(decode_funding_removed(log)?)
            }
        };
        Ok(TradeRecord { common, details })
    }

    fn decode_buy(&self, receipt: &Receipt, log: &LogEntry) -> Result<SwapDetails, DecodeError> {
        let trader = log
            .topic_address(1)
            .ok_or(DecodeError::MissingTopic { index: 1 })?;
        let event = FPMMBuy::decode_raw_log(log.topics.iter().copied(), log.data.as_ref(), true)
            .map_err(|err| abi_error("FPMMBuy", err))?;

        let received = matcher::outcome_transfer(
            receipt,
            self.config.conditional_tokens,
            trader,
            Direction::To,
        );
        if received.is_none() {
            warn!(
                log_index = log.log_index,
                trader = %trader,
                "no outcome-token transfer to buyer, outputAssetId left empty"
            );
        }

        if let Some(paid) =
            matcher::collateral_transfer_from(receipt, self.config.collateral_token, trader)
        {
            if paid.amount != event.investmentAmount {
                debug!(
                    log_index = log.log_index,
                    event_amount = %event.investmentAmount,
                    transfer_amount = %paid.amount,
                    "collateral transfer differs from investmentAmount"
                );
            }
        }

        Ok(SwapDetails {
            trader,
            outcome_index: Some(event.outcomeIndex),
            input_asset_id: Some(AssetId::Collateral(self.config.collateral_token)),
            input_amount: Some(event.investmentAmount),
            output_asset_id: received.map(|transfer| AssetId::OutcomeToken(transfer.token_id)),
            output_amount: Some(event.outcomeTokensBought),
            fee: Some(event.feeAmount),
        })
    }

    /// The Sell payload is read as three consecutive words: return amount,
    /// fee, outcome tokens sold. The last one only cross-checks the matched transfer.
    fn decode_sell(&self, receipt: &Receipt, log: &LogEntry) -> Result<SwapDetails, DecodeError> {
        let trader = log
            .topic_address(1)
            .ok_or(DecodeError::MissingTopic { index: 1 })?;
        let return_amount = payload_word(log, 0, 3)?;
        let fee = payload_word(log, 1, 3)?;
        let tokens_sold = payload_word(log, 2, 3)?;

        let sent = matcher::outcome_transfer(
            receipt,
            self.config.conditional_tokens,
            trader,
            Direction::From,
        );
        match &sent {
            None => warn!(
                log_index = log.log_index,
                trader = %trader,
                "no outcome-token transfer from seller, input leg left empty"
            ),
            Some(transfer) if transfer.value != tokens_sold => warn!(
                log_index = log.log_index,
                event_amount = %tokens_sold,
                transfer_amount = %transfer.value,
                "outcome tokens sold differ from matched transfer"
            ),
            Some(_) => {}
        }

        Ok(SwapDetails {
            trader,
            outcome_index: log.topic_uint(2),
            input_asset_id: sent.map(|transfer| AssetId::OutcomeToken(transfer.token_id)),
            input_amount: sent.map(|transfer| transfer.value),
            output_asset_id: Some(AssetId::Collateral(self.config.collateral_token)),
            output_amount: Some(return_amount),
            fee: Some(fee),
        })
    }

    fn decode_funding_added(
        &self,
        receipt: &Receipt,
        log: &LogEntry,
    ) -> Result<FundingAddedDetails, DecodeError> {
        let event =
            FPMMFundingAdded::decode_raw_log(log.topics.iter().copied(), log.data.as_ref(), true)
                .map_err(|err| abi_error("FPMMFundingAdded", err))?;

        let candidates = matcher::funding_collateral_candidates(receipt, event.funder, log.address);
        match candidates.len() {
            0 => warn!(
                log_index = log.log_index,
                funder = %event.funder,
                "no collateral transfer from funder, collateralAmount left empty"
            ),
            1 => {}
            n => debug!(
                log_index = log.log_index,
                candidates = n,
                "several funding transfers, taking the last"
            ),
        }

        Ok(FundingAddedDetails {
            funder: event.funder,
            shares_minted: event.sharesMinted,
            amounts_added: event.amountsAdded,
            collateral_amount: candidates.last().map(|transfer| transfer.amount),
        })
    }
}

fn decode_funding_removed(log: &LogEntry) -> Result<FundingRemovedDetails, DecodeError> {
    let event =
        FPMMFundingRemoved::decode_raw_log(log.topics.iter().copied(), log.data.as_ref(), true)
            .map_err(|err| abi_error("FPMMFundingRemoved", err))?;
    Ok(FundingRemovedDetails {
        funder: event.funder,
        shares_burnt: event.sharesBurnt,
        amounts_removed: event.amountsRemoved,
        collateral_removed_from_fee_pool: event.collateralRemovedFromFeePool,
    })
}

fn common_fields(receipt: &Receipt, log: &LogEntry) -> Result<TradeCommon, DecodeError> {
    let gas_price = receipt
        .gas_price
        .ok_or(DecodeError::MissingCommonField { field: "gasPrice" })?;
    let transaction_index = receipt
        .transaction_index
        .ok_or(DecodeError::MissingCommonField {
            field: "transactionIndex",
        })?;

    Ok(TradeCommon {
        transaction_hash: receipt.transaction_hash,
        contract_address: log.address,
        block_number: receipt.block_number,
        gas: receipt.gas,
        gas_price,
        max_fee_per_gas: receipt.max_fee_per_gas,
        max_priority_fee_per_gas: receipt.max_priority_fee_per_gas,
        transaction_index,
        sender: receipt.from,
        log_index: log.log_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::{FPMM_BUY, FPMM_FUNDING_REMOVED, FPMM_SELL};
    use alloy::primitives::{Bytes, B256};
    use alloy::sol_types::SolValue;

    fn words(values: &[u64]) -> Bytes {
        let mut data = Vec::with_capacity(values.len() * 32);
        for value in values {
            data.extend_from_slice(&U256::from(*value).to_be_bytes::<32>());
        }
        Bytes::from(data)
    }

    fn receipt_with(logs: Vec<LogEntry>) -> Receipt {
        Receipt {
            transaction_hash: B256::repeat_byte(0x77),
            block_number: 50_000_000,
            gas: 400_000,
            gas_price: Some(30_000_000_000),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            transaction_index: Some(3),
            from: Address::repeat_byte(0x11),
            to: None,
            status: Some(true),
            logs,
        }
    }

    #[test]
    fn unknown_and_auxiliary_logs_are_skipped() {
        let decoder = TradeDecoder::default();
        let receipt = receipt_with(vec![
            LogEntry {
                address: Address::repeat_byte(1),
                topics: vec![B256::repeat_byte(0xee)],
                data: Bytes::new(),
                log_index: 0,
            },
            LogEntry {
                address: Address::repeat_byte(1),
                topics: vec![],
                data: Bytes::new(),
                log_index: 1,
            },
        ]);

        let decoded = decoder.decode_receipt(&receipt);
        assert!(decoded.records.is_empty());
        assert!(decoded.log_errors.is_empty());
    }

    #[test]
    fn short_sell_payload_is_a_log_error() {
        let decoder = TradeDecoder::default();
        let trader = Address::repeat_byte(0x11);
        let receipt = receipt_with(vec![LogEntry {
            address: Address::repeat_byte(0xaa),
            topics: vec![FPMM_SELL, trader.into_word(), B256::ZERO],
            data: words(&[500_000, 5_000]),
            log_index: 9,
        }]);

        let decoded = decoder.decode_receipt(&receipt);
        assert!(decoded.records.is_empty());
        assert_eq!(decoded.log_errors.len(), 1);
        assert_eq!(decoded.log_errors[0].log_index, 9);
        assert_eq!(
            decoded.log_errors[0].source,
            DecodeError::ShortData {
                expected: 96,
                actual: 64
            }
        );
    }

    #[test]
    fn missing_transaction_index_fails_the_record() {
        let decoder = TradeDecoder::default();
        let mut receipt = receipt_with(vec![LogEntry {
            address: Address::repeat_byte(0xaa),
            topics: vec![FPMM_BUY, Address::repeat_byte(0x11).into_word(), B256::ZERO],
            data: words(&[1, 2, 3]),
            log_index: 0,
        }]);
        receipt.transaction_index = None;

        let decoded = decoder.decode_receipt(&receipt);
        assert_eq!(
            decoded.log_errors[0].source,
            DecodeError::MissingCommonField {
                field: "transactionIndex"
            }
        );
    }

    #[test]
    fn funding_removed_reads_event_arguments() {
        let decoder = TradeDecoder::default();
        let funder = Address::repeat_byte(0x33);
        let amounts = vec![U256::from(10u8), U256::from(20u8)];
        let data = (amounts.clone(), U256::from(4u8), U256::from(99u8)).abi_encode_params();
        let fpmm = Address::repeat_byte(0xaa);
        let receipt = receipt_with(vec![LogEntry {
            address: fpmm,
            topics: vec![FPMM_FUNDING_REMOVED, funder.into_word()],
            data: Bytes::from(data),
            log_index: 2,
        }]);

        let decoded = decoder.decode_receipt(&receipt);
        assert!(decoded.log_errors.is_empty(), "{:?}", decoded.log_errors);
        let record = &decoded.records[0];
        assert_eq!(record.common.contract_address, fpmm);
        assert_eq!(
            record.details,
            TradeDetails::FundingRemoved(FundingRemovedDetails {
                funder,
                shares_burnt: U256::from(99u8),
                amounts_removed: amounts,
                collateral_removed_from_fee_pool: U256::from(4u8),
            })
        );
    }
}
