//! Globally comparable event coordinates.
//!
//! A checkpoint orders events across every synced chain. Comparison is
//! lexicographic on (block_timestamp, chain_id, block_number,
//! transaction_index, event_index), which the derived `Ord` gives us from
//! field order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Digit widths of the encoded form. The encoding is fixed-width decimal so
/// that string comparison agrees with numeric comparison wherever a
/// checkpoint is persisted (journal rows, `_ponder_meta`).
const TIMESTAMP_DIGITS: usize = 10;
const CHAIN_ID_DIGITS: usize = 20;
const BLOCK_DIGITS: usize = 20;
const TX_DIGITS: usize = 20;
const EVENT_DIGITS: usize = 20;

pub const ENCODED_LEN: usize =
    TIMESTAMP_DIGITS + CHAIN_ID_DIGITS + BLOCK_DIGITS + TX_DIGITS + EVENT_DIGITS;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("encoded checkpoint must be {ENCODED_LEN} digits, got {0}")]
    BadLength(usize),

    #[error("encoded checkpoint contains a non-decimal segment: {0}")]
    BadSegment(String),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Checkpoint {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub event_index: u64,
}

impl Checkpoint {
    pub const ZERO: Checkpoint = Checkpoint {
        block_timestamp: 0,
        chain_id: 0,
        block_number: 0,
        transaction_index: 0,
        event_index: 0,
    };

    pub const MAX: Checkpoint = Checkpoint {
        block_timestamp: 9_999_999_999,
        chain_id: u64::MAX,
        block_number: u64::MAX,
        transaction_index: u64::MAX,
        event_index: u64::MAX,
    };

    /// Checkpoint of a whole block: orders before any event inside it.
    pub fn block_start(block_timestamp: u64, chain_id: u64, block_number: u64) -> Self {
        Checkpoint {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: 0,
            event_index: 0,
        }
    }

    /// Largest checkpoint inside the given block.
    pub fn block_end(block_timestamp: u64, chain_id: u64, block_number: u64) -> Self {
        Checkpoint {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index: u64::MAX,
            event_index: u64::MAX,
        }
    }

    /// Fixed-width decimal encoding; lexicographic order equals `Ord`.
    pub fn encode(&self) -> String {
        format!(
            "{:0tw$}{:0cw$}{:0bw$}{:0xw$}{:0ew$}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.event_index,
            tw = TIMESTAMP_DIGITS,
            cw = CHAIN_ID_DIGITS,
            bw = BLOCK_DIGITS,
            xw = TX_DIGITS,
            ew = EVENT_DIGITS,
        )
    }

    pub fn decode(encoded: &str) -> Result<Self, CheckpointError> {
        if encoded.len() != ENCODED_LEN {
            return Err(CheckpointError::BadLength(encoded.len()));
        }
        let mut offset = 0;
        let mut segment = |width: usize| -> Result<u64, CheckpointError> {
            let raw = &encoded[offset..offset + width];
            offset += width;
            u64::from_str(raw).map_err(|_| CheckpointError::BadSegment(raw.to_string()))
        };
        Ok(Checkpoint {
            block_timestamp: segment(TIMESTAMP_DIGITS)?,
            chain_id: segment(CHAIN_ID_DIGITS)?,
            block_number: segment(BLOCK_DIGITS)?,
            transaction_index: segment(TX_DIGITS)?,
            event_index: segment(EVENT_DIGITS)?,
        })
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}, {})",
            self.chain_id,
            self.block_timestamp,
            self.block_number,
            self.transaction_index,
            self.event_index
        )
    }
}

/// Smallest checkpoint of a non-empty iterator, or `None`.
pub fn min_checkpoint<I: IntoIterator<Item = Checkpoint>>(iter: I) -> Option<Checkpoint> {
    iter.into_iter().min()
}

/// Largest checkpoint of a non-empty iterator, or `None`.
pub fn max_checkpoint<I: IntoIterator<Item = Checkpoint>>(iter: I) -> Option<Checkpoint> {
    iter.into_iter().max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(ts: u64, chain: u64, block: u64, tx: u64, event: u64) -> Checkpoint {
        Checkpoint {
            block_timestamp: ts,
            chain_id: chain,
            block_number: block,
            transaction_index: tx,
            event_index: event,
        }
    }

    #[test]
    fn timestamp_dominates_chain_id() {
        // A block mined earlier on a higher-numbered chain orders first.
        assert!(cp(999, 2, 50, 0, 0) < cp(1000, 1, 10, 0, 0));
    }

    #[test]
    fn order_within_a_block() {
        let a = cp(1000, 1, 10, 0, 0);
        let b = cp(1000, 1, 10, 0, 1);
        let c = cp(1000, 1, 10, 1, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn encode_round_trips() {
        let original = cp(1_700_000_000, 8453, 19_000_000, 113, 7);
        let decoded = Checkpoint::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
        for sentinel in [Checkpoint::ZERO, Checkpoint::MAX] {
            assert_eq!(Checkpoint::decode(&sentinel.encode()).unwrap(), sentinel);
        }
    }

    #[test]
    fn encoded_order_matches_numeric_order() {
        let mut checkpoints = vec![
            cp(1000, 1, 10, 0, 0),
            cp(999, 2, 50, 3, 1),
            cp(1000, 1, 9, 200, 5),
            cp(1001, 1, 11, 0, 0),
            Checkpoint::ZERO,
            Checkpoint::MAX,
        ];
        let mut by_encoding = checkpoints.clone();
        checkpoints.sort();
        by_encoding.sort_by_key(|c| c.encode());
        assert_eq!(checkpoints, by_encoding);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Checkpoint::decode("123").is_err());
        let mut bad = Checkpoint::ZERO.encode();
        bad.replace_range(0..1, "x");
        assert!(Checkpoint::decode(&bad).is_err());
    }

    #[test]
    fn min_max_helpers() {
        let set = [cp(5, 1, 1, 0, 0), cp(3, 1, 1, 0, 0), cp(9, 1, 1, 0, 0)];
        assert_eq!(min_checkpoint(set).unwrap().block_timestamp, 3);
        assert_eq!(max_checkpoint(set).unwrap().block_timestamp, 9);
        assert_eq!(min_checkpoint([]), None);
    }
}
