//! Key encoding and decoding utilities
//!
//! All keys use a single-byte prefix followed by binary data.
//! This ensures deterministic, lexicographically ordered keys in RocksDB,
//! so per-user rows can be walked with a prefix scan.

use alloy_primitives::{Address, B256};
use anyhow::Result;

/// Encode a ledger event key.
///
/// Format: byte 'E' + tx_hash (32 bytes) + log_index (8 bytes, big-endian)
/// Total length: 41 bytes
pub fn encode_event_key(tx_hash: B256, log_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(b'E');
    key.extend_from_slice(tx_hash.as_slice());
    key.extend_from_slice(&log_index.to_be_bytes());
    key
}

/// Decode a ledger event key into (tx_hash, log_index).
pub fn decode_event_key(key: &[u8]) -> Result<(B256, u64)> {
    if key.len() != 41 || key[0] != b'E' {
        anyhow::bail!("Invalid event key (len {})", key.len());
    }
    let tx_hash = B256::from_slice(&key[1..33]);
    let mut index = [0u8; 8];
    index.copy_from_slice(&key[33..41]);
    Ok((tx_hash, u64::from_be_bytes(index)))
}

/// Encode a user account key.
///
/// Format: byte 'U' + address (20 bytes)
/// Total length: 21 bytes
pub fn encode_user_key(addr: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'U');
    key.extend_from_slice(addr.as_slice());
    key
}

/// Prefix shared by all XP ledger entries of one user.
///
/// Format: byte 'X' + address (20 bytes)
pub fn encode_xp_prefix(addr: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(29);
    key.push(b'X');
    key.extend_from_slice(addr.as_slice());
    key
}

/// Encode an XP ledger entry key.
///
/// Format: byte 'X' + address (20 bytes) + sequence (8 bytes, big-endian)
/// Total length: 29 bytes
pub fn encode_xp_entry_key(addr: Address, sequence: u64) -> Vec<u8> {
    let mut key = encode_xp_prefix(addr);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// Encode a deployment key.
///
/// Format: byte 'D' + contract address (20 bytes) + deployment tx (32 bytes)
/// Total length: 53 bytes
pub fn encode_deployment_key(contract: Address, tx: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(53);
    key.push(b'D');
    key.extend_from_slice(contract.as_slice());
    key.extend_from_slice(tx.as_slice());
    key
}

/// Prefix shared by all deployment index entries of one user.
///
/// Format: byte 'd' + user address (20 bytes)
pub fn encode_user_deployment_prefix(user: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(73);
    key.push(b'd');
    key.extend_from_slice(user.as_slice());
    key
}

/// Encode a per-user deployment index key.
///
/// Format: byte 'd' + user (20 bytes) + contract (20 bytes) + deployment tx (32 bytes)
/// Total length: 73 bytes
pub fn encode_user_deployment_key(user: Address, contract: Address, tx: B256) -> Vec<u8> {
    let mut key = encode_user_deployment_prefix(user);
    key.extend_from_slice(contract.as_slice());
    key.extend_from_slice(tx.as_slice());
    key
}

/// Decode a per-user deployment index key into (user, contract, tx).
pub fn decode_user_deployment_key(key: &[u8]) -> Result<(Address, Address, B256)> {
    if key.len() != 73 || key[0] != b'd' {
        anyhow::bail!("Invalid user deployment key (len {})", key.len());
    }
    Ok((
        Address::from_slice(&key[1..21]),
        Address::from_slice(&key[21..41]),
        B256::from_slice(&key[41..73]),
    ))
}

/// Encode a badge template key.
///
/// Format: byte 'T' + badge id (UTF-8)
pub fn encode_badge_key(badge_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + badge_id.len());
    key.push(b'T');
    key.extend_from_slice(badge_id.as_bytes());
    key
}

/// Encode a held-badge key.
///
/// Format: byte 'B' + user (20 bytes) + badge id (UTF-8)
pub fn encode_user_badge_key(user: Address, badge_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(21 + badge_id.len());
    key.push(b'B');
    key.extend_from_slice(user.as_slice());
    key.extend_from_slice(badge_id.as_bytes());
    key
}

/// Encode a mission progress key.
///
/// Format: byte 'P' + user (20 bytes) + mission id (UTF-8)
pub fn encode_mission_key(user: Address, mission_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(21 + mission_id.len());
    key.push(b'P');
    key.extend_from_slice(user.as_slice());
    key.extend_from_slice(mission_id.as_bytes());
    key
}

/// Encode a meta key.
///
/// Format: byte 'M' (0x4D) + meta_id (1 byte)
/// Total length: 2 bytes
///
/// Meta IDs:
/// - 0x01: scan cursor (last fully processed block)
pub fn encode_meta_key(meta_id: u8) -> Vec<u8> {
    vec![b'M', meta_id]
}

/// Meta id of the scan cursor.
pub const META_SCAN_CURSOR: u8 = 0x01;
