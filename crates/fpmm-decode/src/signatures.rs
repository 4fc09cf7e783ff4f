//! Event signature registry.
//!
//! Maps `topics[0]` hashes to the events this crate understands. The ABI of
//! each event is compiled in with `sol!`; the hashes are also spelled out as
//! constants so the registry can be built without touching the ABI types.

use std::collections::HashMap;
use std::sync::OnceLock;

use alloy::primitives::{b256, B256};
use fpmm_data::TradeType;

/// Gnosis Fixed Product Market Maker and ERC-20/ERC-1155 event ABIs.
pub mod abi {
    use alloy::sol;

    sol! {
        interface IERC20 {
            event Transfer(address indexed from, address indexed to, uint256 value);
            event Approval(address indexed owner, address indexed spender, uint256 value);
        }

        interface IFixedProductMarketMaker {
            event FPMMBuy(
                address indexed buyer,
                uint256 investmentAmount,
                uint256 feeAmount,
                uint256 indexed outcomeIndex,
                uint256 outcomeTokensBought
            );
            event FPMMSell(
                address indexed seller,
                uint256 returnAmount,
                uint256 feeAmount,
                uint256 indexed outcomeIndex,
                uint256 outcomeTokensSold
            );
            event FPMMFundingAdded(
                address indexed funder,
                uint256[] amountsAdded,
                uint256 sharesMinted
            );
            event FPMMFundingRemoved(
                address indexed funder,
                uint256[] amountsRemoved,
                uint256 collateralRemovedFromFeePool,
                uint256 sharesBurnt
            );
        }

        interface IConditionalTokens {
            event TransferSingle(
                address indexed operator,
                address indexed from,
                address indexed to,
                uint256 id,
                uint256 value
            );
        }
    }
}

/// `Transfer(address,address,uint256)`
pub const TRANSFER: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");
/// `Approval(address,address,uint256)`
pub const APPROVAL: B256 =
    b256!("8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925");
/// `FPMMBuy(address,uint256,uint256,uint256,uint256)`
pub const FPMM_BUY: B256 =
    b256!("4f62630f51608fc8a7603a9391a5101e58bd7c276139366fc107dc3b67c3dcf8");
/// `FPMMSell(address,uint256,uint256,uint256,uint256)`
pub const FPMM_SELL: B256 =
    b256!("adcf2a240ed9300d681d9a3f5382b6c1beed1b7e46643e0c7b42cbe6e2d766b4");
/// `FPMMFundingAdded(address,uint256[],uint256)`
pub const FPMM_FUNDING_ADDED: B256 =
    b256!("ec2dc3e5a3bb9aa0a1deb905d2bd23640d07f107e6ceb484024501aad964a951");
/// `FPMMFundingRemoved(address,uint256[],uint256,uint256)`
pub const FPMM_FUNDING_REMOVED: B256 =
    b256!("8b4b2c8ebd04c47fc8bce136a85df9b93fcb1f47c8aa296457d4391519d190e7");
/// `TransferSingle(address,address,address,uint256,uint256)`
pub const TRANSFER_SINGLE: B256 =
    b256!("c3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62");

/// Every event the registry recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Transfer,
    Approval,
    FpmmBuy,
    FpmmSell,
    FpmmFundingAdded,
    FpmmFundingRemoved,
    TransferSingle,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Transfer,
        EventKind::Approval,
        EventKind::FpmmBuy,
        EventKind::FpmmSell,
        EventKind::FpmmFundingAdded,
        EventKind::FpmmFundingRemoved,
        EventKind::TransferSingle,
    ];

    /// Solidity event name.
    pub const fn name(self) -> &'static str {
        match self {
            EventKind::Transfer => "Transfer",
            EventKind::Approval => "Approval",
            EventKind::FpmmBuy => "FPMMBuy",
            EventKind::FpmmSell => "FPMMSell",
            EventKind::FpmmFundingAdded => "FPMMFundingAdded",
            EventKind::FpmmFundingRemoved => "FPMMFundingRemoved",
            EventKind::TransferSingle => "TransferSingle",
        }
    }

    pub const fn signature(self) -> B256 {
        match self {
            EventKind::Transfer => TRANSFER,
            EventKind::Approval => APPROVAL,
            EventKind::FpmmBuy => FPMM_BUY,
            EventKind::FpmmSell => FPMM_SELL,
            EventKind::FpmmFundingAdded => FPMM_FUNDING_ADDED,
            EventKind::FpmmFundingRemoved => FPMM_FUNDING_REMOVED,
            EventKind::TransferSingle => TRANSFER_SINGLE,
        }
    }

    /// Trade type produced by a primary event; `None` for auxiliary events.
    pub const fn trade_type(self) -> Option<TradeType> {
        match self {
            EventKind::FpmmBuy => Some(TradeType::Buy),
            EventKind::FpmmSell => Some(TradeType::Sell),
            EventKind::FpmmFundingAdded => Some(TradeType::FundingAdded),
            EventKind::FpmmFundingRemoved => Some(TradeType::FundingRemoved),
            EventKind::Transfer | EventKind::Approval | EventKind::TransferSingle => None,
        }
    }
}

/// Read-only mapping between event names and signature hashes.
#[derive(Debug)]
pub struct SignatureRegistry {
    by_topic: HashMap<B256, EventKind>,
    by_name: HashMap<&'static str, EventKind>,
}

impl SignatureRegistry {
    fn build() -> Self {
        let by_topic = EventKind::ALL
            .iter()
            .map(|kind| (kind.signature(), *kind))
            .collect();
        let by_name = EventKind::ALL
            .iter()
            .map(|kind| (kind.name(), *kind))
            .collect();
        Self { by_topic, by_name }
    }

    /// Process-wide registry, built on first use.
    pub fn global() -> &'static SignatureRegistry {
        static REGISTRY: OnceLock<SignatureRegistry> = OnceLock::new();
        REGISTRY.get_or_init(Self::build)
    }

    /// Event kind for a `topics[0]` value.
    pub fn classify(&self, topic0: &B256) -> Option<EventKind> {
        self.by_topic.get(topic0).copied()
    }

    /// Signature hash for an event name such as `FPMMBuy`.
    pub fn signature(&self, name: &str) -> Option<B256> {
        self.by_name.get(name).map(|kind| kind.signature())
    }
}
