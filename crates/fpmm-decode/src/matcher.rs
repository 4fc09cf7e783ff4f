//! Correlation of a primary FPMM event with auxiliary logs of the same receipt.
//!
//! FPMM events do not carry every leg of a trade. The missing pieces come
//! from token-transfer logs emitted in the same transaction, found here by
//! signature plus a predicate over emitter, topics and data. Candidates are
//! scanned in ascending `log_index` order.

use alloy::primitives::{Address, B256, U256};
use fpmm_data::{LogEntry, Receipt};

use crate::signatures::{TRANSFER, TRANSFER_SINGLE};

/// A decoded ERC-20 `Transfer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenTransfer {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub log_index: u64,
}

/// A decoded ERC-1155 `TransferSingle` on the conditional-token ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutcomeTransfer {
    pub ledger: Address,
    pub operator: Address,
    pub from: Address,
    pub to: Address,
    pub token_id: U256,
    pub value: U256,
    pub log_index: u64,
}

/// Which side of an outcome-token transfer the trader is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Trader is the sender (topic 2); a Sell's input leg.
    From,
    /// Trader is the recipient (topic 3); a Buy's output leg.
    To,
}

/// Logs with `signature` satisfying `predicate`, in ascending log order.
pub fn matching<'a, P>(
    receipt: &'a Receipt,
    signature: B256,
    predicate: P,
) -> impl Iterator<Item = &'a LogEntry> + 'a
where
    P: Fn(&LogEntry) -> bool + 'a,
{
    receipt
        .logs
        .iter()
        .filter(move |log| log.topic0() == Some(&signature) && predicate(*log))
}

/// First matching log.
pub fn find_first<'a, P>(receipt: &'a Receipt, signature: B256, predicate: P) -> Option<&'a LogEntry>
where
    P: Fn(&LogEntry) -> bool + 'a,
{
    matching(receipt, signature, predicate).next()
}

/// Last matching log.
pub fn find_last<'a, P>(receipt: &'a Receipt, signature: B256, predicate: P) -> Option<&'a LogEntry>
where
    P: Fn(&LogEntry) -> bool + 'a,
{
    matching(receipt, signature, predicate).last()
}

/// Leading 32-byte word of `data`, or the whole payload when shorter.
fn leading_word(data: &[u8]) -> U256 {
    let end = data.len().min(32);
    U256::from_be_slice(&data[..end])
}

/// Parses an ERC-20 Transfer log. Returns `None` for anything else.
pub fn parse_transfer(log: &LogEntry) -> Option<TokenTransfer> {
    if log.topic0() != Some(&TRANSFER) || log.topics.len() < 3 {
        return None;
    }
    Some(TokenTransfer {
        token: log.address,
        from: log.topic_address(1)?,
        to: log.topic_address(2)?,
        amount: leading_word(log.data.as_ref()),
        log_index: log.log_index,
    })
}

/// Parses an ERC-1155 TransferSingle log.
///
/// The first data word is the token id with trailing zero nibbles removed,
/// the second is the transferred value.
pub fn parse_transfer_single(log: &LogEntry) -> Option<OutcomeTransfer> {
    if log.topic0() != Some(&TRANSFER_SINGLE) || log.topics.len() < 4 {
        return None;
    }
    Some(OutcomeTransfer {
        ledger: log.address,
        operator: log.topic_address(1)?,
        from: log.topic_address(2)?,
        to: log.topic_address(3)?,
        token_id: strip_trailing_zero_nibbles(log.data_word(0)?),
        value: log.data_word(1)?,
        log_index: log.log_index,
    })
}

/// Drops trailing zero hex digits; an all-zero word stays zero.
pub fn strip_trailing_zero_nibbles(word: U256) -> U256 {
    if word.is_zero() {
        return word;
    }
    let zero_nibbles = word.trailing_zeros() / 4;
    word >> (zero_nibbles * 4)
}

/// First collateral transfer of `token` sent by `from`.
pub fn collateral_transfer_from(
    receipt: &Receipt,
    token: Address,
    from: Address,
) -> Option<TokenTransfer> {
    find_first(receipt, TRANSFER, move |log| {
        log.address == token && log.topic_address(1) == Some(from)
    })
    .and_then(parse_transfer)
}

/// First outcome-token transfer on `ledger` where `trader` is on the given side.
pub fn outcome_transfer(
    receipt: &Receipt,
    ledger: Address,
    trader: Address,
    direction: Direction,
) -> Option<OutcomeTransfer> {
    let topic = match direction {
        Direction::From => 2,
        Direction::To => 3,
    };
    find_first(receipt, TRANSFER_SINGLE, move |log| {
        log.address == ledger && log.topic_address(topic) == Some(trader)
    })
    .and_then(parse_transfer_single)
}

/// Every collateral Transfer from `funder` to `fpmm`, in log order.
///
/// The emitting token is not checked; callers wanting one candidate take the last.
pub fn funding_collateral_candidates(
    receipt: &Receipt,
    funder: Address,
    fpmm: Address,
) -> Vec<TokenTransfer> {
    matching(receipt, TRANSFER, move |log| {
        log.topic_address(1) == Some(funder) && log.topic_address(2) == Some(fpmm)
    })
    .filter_map(parse_transfer)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Bytes;

    fn topic(address: Address) -> B256 {
        address.into_word()
    }

    fn transfer_log(token: Address, from: Address, to: Address, amount: u64, index: u64) -> LogEntry {
        LogEntry {
            address: token,
            topics: vec![TRANSFER, topic(from), topic(to)],
            data: Bytes::from(U256::from(amount).to_be_bytes::<32>().to_vec()),
            log_index: index,
        }
    }

    fn receipt_with(logs: Vec<LogEntry>) -> Receipt {
        Receipt {
            transaction_hash: B256::repeat_byte(1),
            block_number: 1,
            gas: 1,
            gas_price: Some(1),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            transaction_index: Some(0),
            from: Address::ZERO,
            to: None,
            status: Some(true),
            logs,
        }
    }

    #[test]
    fn strip_trailing_zero_nibbles_matches_hex_trimming() {
        assert_eq!(strip_trailing_zero_nibbles(U256::from(0x7000u64)), U256::from(7u8));
        assert_eq!(strip_trailing_zero_nibbles(U256::from(0x1230u64)), U256::from(0x123u64));
        assert_eq!(strip_trailing_zero_nibbles(U256::from(0x1234u64)), U256::from(0x1234u64));
        assert_eq!(strip_trailing_zero_nibbles(U256::ZERO), U256::ZERO);
    }

    #[test]
    fn first_and_last_follow_log_order() {
        let funder = Address::repeat_byte(0xf1);
        let fpmm = Address::repeat_byte(0xaa);
        let token = Address::repeat_byte(0x05);
        let receipt = receipt_with(vec![
            transfer_log(token, funder, fpmm, 100, 1),
            transfer_log(token, Address::repeat_byte(9), fpmm, 7, 2),
            transfer_log(token, funder, fpmm, 250, 3),
        ]);

        let candidates = funding_collateral_candidates(&receipt, funder, fpmm);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates.last().map(|t| t.amount), Some(U256::from(250u64)));

        let first = collateral_transfer_from(&receipt, token, funder).expect("transfer exists");
        assert_eq!(first.amount, U256::from(100u64));
        assert_eq!(first.log_index, 1);

        let last = find_last(&receipt, TRANSFER, move |log| log.address == token);
        assert_eq!(last.map(|log| log.log_index), Some(3));
    }

    #[test]
    fn collateral_match_checks_emitter() {
        let trader = Address::repeat_byte(0x11);
        let receipt = receipt_with(vec![transfer_log(
            Address::repeat_byte(0x99),
            trader,
            Address::repeat_byte(0x22),
            5,
            0,
        )]);
        assert!(collateral_transfer_from(&receipt, Address::repeat_byte(0x05), trader).is_none());
    }

    #[test]
    fn outcome_transfer_uses_direction_topic() {
        let ledger = Address::repeat_byte(0x4d);
        let trader = Address::repeat_byte(0x11);
        let fpmm = Address::repeat_byte(0xaa);
        let mut data = U256::from(0x3000u64).to_be_bytes::<32>().to_vec();
        data.extend_from_slice(&U256::from(900_000u64).to_be_bytes::<32>());
        let log = LogEntry {
            address: ledger,
            topics: vec![TRANSFER_SINGLE, topic(fpmm), topic(trader), topic(fpmm)],
            data: Bytes::from(data),
            log_index: 4,
        };
        let receipt = receipt_with(vec![log]);

        let sold = outcome_transfer(&receipt, ledger, trader, Direction::From)
            .expect("trader is the sender");
        assert_eq!(sold.token_id, U256::from(3u8));
        assert_eq!(sold.value, U256::from(900_000u64));
        assert!(outcome_transfer(&receipt, ledger, trader, Direction::To).is_none());
    }
}
