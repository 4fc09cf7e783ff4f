//! Integration tests for receipt normalization and trade decoding.
//!
//! Receipts are built as raw node JSON, normalized and decoded the same way
//! the scheduler does it.

mod common;

use alloy::primitives::{Address, U256};
use common::*;
use fpmm_data::{normalize_receipt, AssetId, TradeDetails, TradeRecord, TradeType};
use fpmm_decode::{addresses, DecodedTransaction, TradeDecoder};
use serde_json::{json, Value};

fn decode(logs: Vec<Value>) -> DecodedTransaction {
    let hash = tx_hash(1);
    let receipt = normalize_receipt(transaction_json(&hash, BLOCK), receipt_json(&hash, BLOCK, logs))
        .expect("receipt should normalize");
    TradeDecoder::default().decode_receipt(&receipt)
}

fn single(decoded: &DecodedTransaction) -> &TradeRecord {
    assert!(decoded.log_errors.is_empty(), "{:?}", decoded.log_errors);
    assert_eq!(decoded.records.len(), 1);
    &decoded.records[0]
}

fn usdc() -> Value {
    Value::String(format!("{:#x}", addresses::USDC))
}

/// A Buy of 1 000 000 collateral for 1 950 000 tokens of outcome id 7 with a
/// 20 000 fee becomes a record paying USDC and receiving token 7.
#[test]
fn buy_receipt_yields_buy_record() {
    let decoded = decode(buy_receipt_logs());
    let record = single(&decoded);
    assert_eq!(record.trade_type(), TradeType::Buy);

    let doc = record.to_document();
    assert_eq!(doc["type"], json!("Buy"));
    assert_eq!(doc["inputAssetId"], usdc());
    assert_eq!(doc["inputAmount"], json!(1_000_000));
    assert_eq!(doc["outputAssetId"], json!(7));
    assert_eq!(doc["outputAmount"], json!(1_950_000));
    assert_eq!(doc["CPMMFee"], json!(20_000));
    assert_eq!(doc["outcomeIndex"], json!(1));
    assert_eq!(doc["logIndex"], json!(2));
}

/// Sell amounts come from fixed 32-byte slots of the raw payload:
/// return amount, fee, outcome tokens sold.
#[test]
fn sell_receipt_reads_fixed_payload_slots() {
    let payload = words(&[u(500_000), u(5_000), u(900_000)]);
    let decoded = decode(vec![
        outcome_transfer_log(TRADER, FPMM, u(3), u(900_000), 0),
        sell_log(TRADER, 0, payload.clone(), 1),
        transfer_log(addresses::USDC, FPMM, TRADER, u(500_000), 2),
    ]);
    let record = single(&decoded);

    let raw = alloy::primitives::hex::decode(&payload).expect("payload is valid hex");
    let slot = |i: usize| U256::from_be_slice(&raw[i * 32..(i + 1) * 32]);

    let swap = record.swap().expect("sell is a swap");
    assert_eq!(swap.output_amount, Some(slot(0)));
    assert_eq!(swap.fee, Some(slot(1)));
    assert_eq!(swap.input_amount, Some(slot(2)));

    let doc = record.to_document();
    assert_eq!(doc["type"], json!("Sell"));
    assert_eq!(doc["inputAssetId"], json!(3));
    assert_eq!(doc["inputAmount"], json!(900_000));
    assert_eq!(doc["outputAssetId"], usdc());
    assert_eq!(doc["outputAmount"], json!(500_000));
    assert_eq!(doc["CPMMFee"], json!(5_000));
}

#[test]
fn sell_mismatch_keeps_matched_transfer_amount() {
    let decoded = decode(vec![
        outcome_transfer_log(TRADER, FPMM, u(3), u(899_000), 0),
        sell_log(TRADER, 0, words(&[u(500_000), u(5_000), u(900_000)]), 1),
    ]);
    let swap = single(&decoded).swap().expect("sell is a swap").clone();
    assert_eq!(swap.input_amount, Some(u(899_000)));
}

#[test]
fn funding_without_collateral_transfer_keeps_record() {
    let decoded = decode(vec![funding_added_log(
        TRADER,
        vec![u(10), u(20)],
        u(15),
        0,
    )]);
    let record = single(&decoded);

    match &record.details {
        TradeDetails::FundingAdded(added) => {
            assert_eq!(added.collateral_amount, None);
            assert_eq!(added.shares_minted, u(15));
            assert_eq!(added.amounts_added, vec![u(10), u(20)]);
        }
        other => panic!("expected FundingAdded, got {other:?}"),
    }
    let doc = record.to_document();
    assert!(doc.get("collateralAmount").is_none());
    assert_eq!(doc["amountsAdded"], json!([10, 20]));
}

/// With two qualifying funder→AMM transfers the later one wins, even when
/// the node lists logs out of order.
#[test]
fn funding_collateral_last_match_wins() {
    let decoded = decode(vec![
        transfer_log(addresses::USDC, TRADER, FPMM, u(250), 1),
        transfer_log(addresses::USDC, TRADER, FPMM, u(100), 0),
        transfer_log(addresses::USDC, TRADER, Address::repeat_byte(0x42), u(999), 2),
        funding_added_log(TRADER, vec![u(100), u(150)], u(200), 3),
    ]);
    match &single(&decoded).details {
        TradeDetails::FundingAdded(added) => assert_eq!(added.collateral_amount, Some(u(250))),
        other => panic!("expected FundingAdded, got {other:?}"),
    }
}

/// A transfer to someone else must not be taken as the buyer's tokens.
#[test]
fn buy_without_matching_transfer_leaves_output_asset_empty() {
    let decoded = decode(vec![
        outcome_transfer_log(FPMM, Address::repeat_byte(0x99), u(7), u(1_950_000), 0),
        buy_log(TRADER, 1_000_000, 20_000, 1, 1_950_000, 1),
    ]);
    let swap = single(&decoded).swap().expect("buy is a swap").clone();
    assert_eq!(swap.output_asset_id, None);
    assert_eq!(swap.input_asset_id, Some(AssetId::Collateral(addresses::USDC)));
    assert_eq!(swap.output_amount, Some(u(1_950_000)));
}

#[test]
fn outcome_ids_drop_trailing_zero_nibbles() {
    let decoded = decode(vec![
        outcome_transfer_log(FPMM, TRADER, U256::from(0x7a00u64), u(5), 0),
        buy_log(TRADER, 10, 1, 0, 5, 1),
    ]);
    let swap = single(&decoded).swap().expect("buy is a swap").clone();
    assert_eq!(swap.output_asset_id, Some(AssetId::OutcomeToken(U256::from(0x7au64))));
}

#[test]
fn common_fields_come_from_transaction_and_log() {
    let decoded = decode(buy_receipt_logs());
    let doc = single(&decoded).to_document();

    assert_eq!(doc["transactionHash"], json!(tx_hash(1)));
    assert_eq!(doc["contractAddress"], json!(FPMM.to_checksum(None)));
    assert_eq!(doc["fpmmAddress"], json!(format!("{:#x}", FPMM)));
    assert_eq!(doc["blockNumber"], json!(BLOCK));
    assert_eq!(doc["gas"], json!(400_000));
    assert_eq!(doc["gasPrice"], json!(30_000_000_000u64));
    assert_eq!(doc["maxFeePerGas"], json!(50_000_000_000u64));
    assert_eq!(doc["transactionIndex"], json!(3));
    assert_eq!(doc["sender"], json!(format!("{:#x}", TRADER)));
    assert_eq!(doc["trader"], json!(format!("{:#x}", TRADER)));
}

#[test]
fn several_events_in_one_receipt_decode_independently() {
    let mut logs = buy_receipt_logs();
    logs.push(sell_log(TRADER, 0, words(&[u(1)]), 3));
    logs.push(funding_added_log(TRADER, vec![u(1)], u(1), 4));

    let decoded = decode(logs);
    assert_eq!(decoded.records.len(), 2);
    assert_eq!(decoded.records[0].trade_type(), TradeType::Buy);
    assert_eq!(decoded.records[1].trade_type(), TradeType::FundingAdded);
    assert_eq!(decoded.log_errors.len(), 1);
    assert_eq!(decoded.log_errors[0].log_index, 3);
}

#[test]
fn documents_round_trip_through_json() {
    let decoded = decode(buy_receipt_logs());
    let record = single(&decoded);
    let rebuilt = TradeRecord::from_document(&record.to_document())
        .expect("document should parse back");
    assert_eq!(&rebuilt, record);
}
