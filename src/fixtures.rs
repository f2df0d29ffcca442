//! Shared test helpers for building ABI-encoded logs.

use crate::records::LedgerEvent;
use crate::router::{
    event_topic, WatchedContracts, CONTRACT_DEPLOYED_SIGNATURE, LEVEL_UP_SIGNATURE,
    REPUTATION_CHANGED_SIGNATURE, XP_GRANTED_SIGNATURE,
};
use crate::types::Log;
use alloy_primitives::{address, Address, B256, U256};

pub const XP_SYSTEM: Address = address!("5fbdb2315678afecb367f032d93f642f64180aa3");
pub const TRACKER: Address = address!("e7f1725e7734ce288f8367e1bb143e90bb3f0512");
pub const ALICE: Address = address!("0742d35cc6634c0532925a3b844bc9e7595f0beb");
pub const BOB: Address = address!("dac17f958d2ee523a2206206994597c13d831ec7");

pub fn contracts() -> WatchedContracts {
    WatchedContracts {
        xp_system: XP_SYSTEM,
        deployment_tracker: TRACKER,
    }
}

pub fn encode_word(value: U256) -> [u8; 32] {
    value.to_be_bytes::<32>()
}

pub fn address_topic(addr: Address) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(addr.as_slice());
    B256::from(bytes)
}

fn log(address: Address, topics: Vec<B256>, data: Vec<u8>, tx: B256, log_index: u64, block: u64) -> Log {
    Log {
        address,
        topics,
        data,
        transaction_hash: tx,
        log_index,
        block_number: block,
    }
}

pub fn xp_granted_log(user: Address, amount: u64, reason: &str, tx: B256, log_index: u64, block: u64) -> Log {
    let mut data = Vec::new();
    data.extend_from_slice(&encode_word(U256::from(amount)));
    data.extend_from_slice(&encode_word(U256::from(64u64)));
    data.extend_from_slice(&encode_word(U256::from(reason.len())));
    let mut tail = reason.as_bytes().to_vec();
    tail.resize(reason.len().div_ceil(32) * 32, 0);
    data.extend_from_slice(&tail);

    log(
        XP_SYSTEM,
        vec![event_topic(XP_GRANTED_SIGNATURE), address_topic(user)],
        data,
        tx,
        log_index,
        block,
    )
}

pub fn level_log(user: Address, level: u64, tx: B256, log_index: u64, block: u64) -> Log {
    log(
        XP_SYSTEM,
        vec![event_topic(LEVEL_UP_SIGNATURE), address_topic(user)],
        encode_word(U256::from(level)).to_vec(),
        tx,
        log_index,
        block,
    )
}

pub fn reputation_log(user: Address, reputation: u64, tx: B256, log_index: u64, block: u64) -> Log {
    log(
        XP_SYSTEM,
        vec![event_topic(REPUTATION_CHANGED_SIGNATURE), address_topic(user)],
        encode_word(U256::from(reputation)).to_vec(),
        tx,
        log_index,
        block,
    )
}

pub fn deployed_log(
    deployer: Address,
    contract: Address,
    template: u64,
    tx: B256,
    log_index: u64,
    block: u64,
) -> Log {
    let mut data = Vec::new();
    data.extend_from_slice(&encode_word(U256::from(template)));
    data.extend_from_slice(&encode_word(U256::from(1_700_000_000u64)));
    log(
        TRACKER,
        vec![
            event_topic(CONTRACT_DEPLOYED_SIGNATURE),
            address_topic(deployer),
            address_topic(contract),
        ],
        data,
        tx,
        log_index,
        block,
    )
}

pub fn ledger_row(log: &Log) -> LedgerEvent {
    LedgerEvent::observed(1, log, 1_700_000_000)
}
