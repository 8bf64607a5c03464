//! Hex codecs for persisting EVM-width values in portable TEXT columns.
//!
//! Everything is stored lowercase 0x-prefixed so TEXT equality in SQL agrees
//! with value equality, regardless of how a value was displayed elsewhere.

use std::str::FromStr;

use alloy_primitives::{hex, Address, Bytes, B256, U256};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("stored value is not valid {kind} hex: {raw}")]
pub struct CodecError {
    kind: &'static str,
    raw: String,
}

pub fn encode_address(value: &Address) -> String {
    format!("0x{}", hex::encode(value.as_slice()))
}

pub fn decode_address(raw: &str) -> Result<Address, CodecError> {
    Address::from_str(raw).map_err(|_| CodecError {
        kind: "address",
        raw: raw.to_string(),
    })
}

pub fn encode_b256(value: &B256) -> String {
    format!("0x{}", hex::encode(value.as_slice()))
}

pub fn decode_b256(raw: &str) -> Result<B256, CodecError> {
    B256::from_str(raw).map_err(|_| CodecError {
        kind: "b256",
        raw: raw.to_string(),
    })
}

pub fn encode_bytes(value: &Bytes) -> String {
    format!("0x{}", hex::encode(value))
}

pub fn decode_bytes(raw: &str) -> Result<Bytes, CodecError> {
    Bytes::from_str(raw).map_err(|_| CodecError {
        kind: "bytes",
        raw: raw.to_string(),
    })
}

pub fn encode_u256(value: &U256) -> String {
    format!("{value:#x}")
}

pub fn decode_u256(raw: &str) -> Result<U256, CodecError> {
    U256::from_str(raw).map_err(|_| CodecError {
        kind: "u256",
        raw: raw.to_string(),
    })
}
