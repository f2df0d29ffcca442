//! Indexer configuration and badge template loading
//!
//! Badge templates are read from a JSON file holding an array of
//! templates, each with an ordered `mintConditions` list.

use crate::progression::DEPLOYMENT_XP_REWARD;
use crate::records::BadgeTemplate;
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Interval between poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Blocks processed between cursor advances.
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Settings for the chain poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub batch_size: u64,
    /// First block to scan when no cursor is stored; defaults to block 1.
    pub start_block: Option<u64>,
    pub deployment_reward: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            start_block: None,
            deployment_reward: DEPLOYMENT_XP_REWARD,
        }
    }
}

impl PollerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("Batch size must be at least 1");
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("Poll interval must be non-zero");
        }
        Ok(())
    }
}

/// Load badge templates from a JSON file.
///
/// # Example file format:
/// ```json
/// [
///   {"id": "first-deploy", "name": "First Deploy",
///    "mintConditions": [{"type": "CONTRACT_DEPLOYED"}]}
/// ]
/// ```
pub fn load_badge_templates(path: &Path) -> Result<Vec<BadgeTemplate>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read badge file: {:?}", path))?;
    let templates: Vec<BadgeTemplate> = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid badge file: {:?}", path))?;

    let mut seen = HashSet::new();
    for template in &templates {
        if template.id.is_empty() {
            anyhow::bail!("Badge template with empty id: {}", template.name);
        }
        if !seen.insert(template.id.as_str()) {
            anyhow::bail!("Duplicate badge template id: {}", template.id);
        }
    }

    Ok(templates)
}

/// Pad an odd-length hex string with a leading zero.
fn pad_hex_string(s: &str) -> String {
    if s.is_empty() {
        return s.to_string();
    }
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Parse an address from a hex string.
///
/// Accepts addresses with or without 0x prefix.
pub fn parse_address(s: &str) -> Result<Address> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = pad_hex_string(s);
    let bytes = hex::decode(&s).with_context(|| format!("Invalid hex address: {}", s))?;

    if bytes.len() != 20 {
        anyhow::bail!("Address must be 20 bytes (40 hex chars), got {} bytes", bytes.len());
    }

    Ok(Address::from_slice(&bytes))
}

/// Parse a transaction hash from a hex string.
pub fn parse_tx_hash(s: &str) -> Result<B256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("Invalid hex hash: {}", s))?;

    if bytes.len() != 32 {
        anyhow::bail!("Hash must be 32 bytes (64 hex chars), got {} bytes", bytes.len());
    }

    Ok(B256::from_slice(&bytes))
}
