//! Type definitions for receipts and reconstructed FPMM trades.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, Bytes, B256, U256};

/// One event log emitted inside a transaction receipt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Contract that emitted the log.
    pub address: Address,
    /// Indexed words; `topics[0]` is the event signature hash.
    pub topics: Vec<B256>,
    /// Non-indexed, ABI-encoded arguments.
    pub data: Bytes,
    /// Position of the log inside the block.
    pub log_index: u64,
}

impl LogEntry {
    /// Event signature topic, if the log has any topics.
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }

    /// Address right-aligned in topic `index` (bytes 12..32 of the word).
    pub fn topic_address(&self, index: usize) -> Option<Address> {
        self.topics
            .get(index)
            .map(|topic| Address::from_slice(&topic[12..]))
    }

    /// Indexed topic `index` read as a big-endian unsigned integer.
    pub fn topic_uint(&self, index: usize) -> Option<U256> {
        self.topics
            .get(index)
            .map(|topic| U256::from_be_slice(topic.as_slice()))
    }

    /// Big-endian 32-byte word at `slot` of the data payload.
    ///
    /// Returns `None` when the payload is too short to hold the slot.
    pub fn data_word(&self, slot: usize) -> Option<U256> {
        let data: &[u8] = self.data.as_ref();
        let start = slot.checked_mul(32)?;
        let word = data.get(start..start.checked_add(32)?)?;
        Some(U256::from_be_slice(word))
    }
}

/// Normalized view of a transaction together with its receipt.
///
/// Built once per fetch by [`crate::normalize::normalize_receipt`] and never
/// mutated afterwards. Logs are sorted by ascending `log_index`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    /// Transaction hash.
    pub transaction_hash: B256,
    /// Block containing the transaction.
    pub block_number: u64,
    /// Gas limit of the transaction.
    pub gas: u64,
    /// Gas price in Wei (legacy price or effective price).
    pub gas_price: Option<u128>,
    /// EIP-1559 max fee per gas in Wei.
    pub max_fee_per_gas: Option<u128>,
    /// EIP-1559 max priority fee per gas in Wei.
    pub max_priority_fee_per_gas: Option<u128>,
    /// Position of the transaction inside the block.
    pub transaction_index: Option<u64>,
    /// Transaction sender.
    pub from: Address,
    /// Transaction recipient (None for contract creation).
    pub to: Option<Address>,
    /// Execution status when the node reports one.
    pub status: Option<bool>,
    /// Logs in ascending `log_index` order.
    pub logs: Vec<LogEntry>,
}

/// Block header fields needed for timestamp enrichment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block number.
    pub number: u64,
    /// Block hash, when the node returned one.
    pub hash: Option<B256>,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
}

/// Kind of reconstructed trade. Each kind is persisted to its own collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TradeType {
    Buy,
    Sell,
    FundingAdded,
    FundingRemoved,
}

impl TradeType {
    /// Every trade type, in collection order.
    pub const ALL: [TradeType; 4] = [
        TradeType::Buy,
        TradeType::Sell,
        TradeType::FundingAdded,
        TradeType::FundingRemoved,
    ];

    /// Value written to the `type` field of stored documents.
    pub const fn as_str(self) -> &'static str {
        match self {
            TradeType::Buy => "Buy",
            TradeType::Sell => "Sell",
            TradeType::FundingAdded => "FundingAdded",
            TradeType::FundingRemoved => "FundingRemoved",
        }
    }

    /// Name of the collection (table) holding this trade type.
    pub const fn collection(self) -> &'static str {
        match self {
            TradeType::Buy => "FPMMBuy",
            TradeType::Sell => "FPMMSell",
            TradeType::FundingAdded => "FPMMFundingAdded",
            TradeType::FundingRemoved => "FPMMFundingRemoved",
        }
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeType {
    type Err = String;

    /// Accepts the document value (`FundingAdded`), the collection name
    /// (`FPMMFundingAdded`) or a kebab/snake-case form (`funding-added`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let folded: String = value
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        let folded = folded.strip_prefix("fpmm").unwrap_or(&folded);
        match folded {
            "buy" => Ok(TradeType::Buy),
            "sell" => Ok(TradeType::Sell),
            "fundingadded" => Ok(TradeType::FundingAdded),
            "fundingremoved" => Ok(TradeType::FundingRemoved),
            _ => Err(format!("unknown trade type '{value}'")),
        }
    }
}

/// Identifier of an asset moving in a trade leg.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetId {
    /// The collateral ERC-20 token, identified by its address.
    Collateral(Address),
    /// An outcome token of the conditional-token ledger.
    OutcomeToken(U256),
}

/// Natural key of a stored trade.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TradeKey {
    /// Lowercase `0x`-prefixed transaction hash.
    pub transaction_hash: String,
    /// Trade type.
    pub trade_type: TradeType,
}

/// Fields shared by every trade type, taken from the transaction and the primary log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TradeCommon {
    /// Transaction hash.
    pub transaction_hash: B256,
    /// FPMM contract that emitted the primary event.
    pub contract_address: Address,
    /// Block number.
    pub block_number: u64,
    /// Gas limit.
    pub gas: u64,
    /// Gas price in Wei.
    pub gas_price: u128,
    /// EIP-1559 max fee per gas in Wei.
    pub max_fee_per_gas: Option<u128>,
    /// EIP-1559 max priority fee per gas in Wei.
    pub max_priority_fee_per_gas: Option<u128>,
    /// Position of the transaction inside the block.
    pub transaction_index: u64,
    /// Transaction sender.
    pub sender: Address,
    /// Log index of the primary event.
    pub log_index: u64,
}

impl TradeCommon {
    /// Lower-cased FPMM address used as the join key across collections.
    pub fn fpmm_address(&self) -> String {
        format!("{:#x}", self.contract_address)
    }

    /// Lower-cased `0x`-prefixed transaction hash.
    pub fn transaction_hash_hex(&self) -> String {
        format!("{:#x}", self.transaction_hash)
    }
}

/// Legs of a Buy or Sell. Fields recovered from auxiliary logs may be absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapDetails {
    /// Buyer or seller, from the first indexed topic of the primary event.
    pub trader: Address,
    /// Indexed outcome slot of the primary event.
    pub outcome_index: Option<U256>,
    pub input_asset_id: Option<AssetId>,
    pub input_amount: Option<U256>,
    pub output_asset_id: Option<AssetId>,
    pub output_amount: Option<U256>,
    /// FPMM fee charged on the trade.
    pub fee: Option<U256>,
}

/// Liquidity added to an FPMM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingAddedDetails {
    pub funder: Address,
    pub shares_minted: U256,
    /// One amount per outcome.
    pub amounts_added: Vec<U256>,
    /// Collateral transferred by the funder, recovered from a Transfer log.
    pub collateral_amount: Option<U256>,
}

/// Liquidity removed from an FPMM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingRemovedDetails {
    pub funder: Address,
    pub shares_burnt: U256,
    /// One amount per outcome.
    pub amounts_removed: Vec<U256>,
    pub collateral_removed_from_fee_pool: U256,
}

/// Variant-specific part of a trade.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TradeDetails {
    Buy(SwapDetails),
    Sell(SwapDetails),
    FundingAdded(FundingAddedDetails),
    FundingRemoved(FundingRemovedDetails),
}

/// A reconstructed trade. Immutable once built by the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TradeRecord {
    pub common: TradeCommon,
    pub details: TradeDetails,
}

impl TradeRecord {
    /// Trade type derived from the variant.
    pub fn trade_type(&self) -> TradeType {
        match self.details {
            TradeDetails::Buy(_) => TradeType::Buy,
            TradeDetails::Sell(_) => TradeType::Sell,
            TradeDetails::FundingAdded(_) => TradeType::FundingAdded,
            TradeDetails::FundingRemoved(_) => TradeType::FundingRemoved,
        }
    }

    /// Natural key `(transaction_hash, type)` used for idempotent upserts.
    pub fn key(&self) -> TradeKey {
        TradeKey {
            transaction_hash: self.common.transaction_hash_hex(),
            trade_type: self.trade_type(),
        }
    }

    /// Swap legs for Buy and Sell records.
    pub fn swap(&self) -> Option<&SwapDetails> {
        match &self.details {
            TradeDetails::Buy(swap) | TradeDetails::Sell(swap) => Some(swap),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(topics: Vec<B256>, data: Vec<u8>) -> LogEntry {
        LogEntry {
            address: Address::ZERO,
            topics,
            data: Bytes::from(data),
            log_index: 0,
        }
    }

    #[test]
    fn topic_address_reads_low_twenty_bytes() {
        let mut word = [0u8; 32];
        word[31] = 0x42;
        word[12] = 0x11;
        let log = log_with(vec![B256::ZERO, B256::from(word)], Vec::new());

        let address = log.topic_address(1).expect("topic 1 present");
        assert_eq!(address.as_slice()[0], 0x11);
        assert_eq!(address.as_slice()[19], 0x42);
        assert!(log.topic_address(2).is_none());
    }

    #[test]
    fn data_word_respects_slot_boundaries() {
        let mut data = vec![0u8; 64];
        data[31] = 7;
        data[63] = 9;
        let log = log_with(vec![B256::ZERO], data);

        assert_eq!(log.data_word(0), Some(U256::from(7)));
        assert_eq!(log.data_word(1), Some(U256::from(9)));
        assert_eq!(log.data_word(2), None);
    }

    #[test]
    fn trade_type_parses_all_spellings() {
        assert_eq!("Buy".parse::<TradeType>(), Ok(TradeType::Buy));
        assert_eq!("FPMMSell".parse::<TradeType>(), Ok(TradeType::Sell));
        assert_eq!(
            "funding-added".parse::<TradeType>(),
            Ok(TradeType::FundingAdded)
        );
        assert_eq!(
            "funding_removed".parse::<TradeType>(),
            Ok(TradeType::FundingRemoved)
        );
        assert!("swap".parse::<TradeType>().is_err());
    }

    #[test]
    fn collections_are_distinct() {
        let names: std::collections::HashSet<_> =
            TradeType::ALL.iter().map(|t| t.collection()).collect();
        assert_eq!(names.len(), 4);
    }
}
