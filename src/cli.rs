//! CLI implementation for guildctl
//!
//! Operator interface over the progression store. All commands output
//! pretty JSON.

use crate::badge::{Award, BadgeEvaluator, Eligibility, XpLeaderboard};
use crate::config::{load_badge_templates, parse_address, parse_tx_hash};
use crate::poller::reconcile_pending;
use crate::progression::{LedgerCheck, Progression, DEPLOYMENT_XP_REWARD};
use crate::records::{ContractTemplate, DeploymentStatus, LedgerEvent, XpSource};
use crate::router::{Router, WatchedContracts};
use crate::rpc::RpcClient;
use crate::store::{ProgressStore, RocksProgressStore};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;

/// Progression store CLI tool
#[derive(Parser)]
#[command(name = "guildctl")]
#[command(about = "Inspect and operate the guild progression store")]
pub struct Cli {
    /// Path to the RocksDB database directory
    #[arg(short, long, default_value = "./guild_db")]
    db_path: PathBuf,

    /// XP granted per successful contract deployment
    #[arg(long, default_value_t = DEPLOYMENT_XP_REWARD)]
    deployment_reward: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get the last fully processed block
    GetCursor,
    /// Move the cursor forward (never backwards)
    SetCursor {
        /// Block number
        block: u64,
    },
    /// Get a user account
    GetUser {
        /// Ethereum address (hex, with or without 0x prefix)
        address: String,
    },
    /// List a user's XP ledger entries
    XpHistory {
        /// Ethereum address (hex, with or without 0x prefix)
        address: String,
    },
    /// Compare account XP and level with the XP ledger
    CheckLedger {
        /// Ethereum address; all users when omitted
        address: Option<String>,
    },
    /// Grant XP manually
    GrantXp {
        /// Ethereum address (hex, with or without 0x prefix)
        address: String,
        /// XP amount
        amount: u64,
        /// Ledger description
        #[arg(long, default_value = "Manual grant")]
        description: String,
    },
    /// Get a deployment record
    GetDeployment {
        /// Contract address
        contract: String,
        /// Deployment transaction hash (64 hex chars)
        tx: String,
    },
    /// List a user's deployments
    ListDeployments {
        /// Ethereum address (hex, with or without 0x prefix)
        address: String,
    },
    /// Record a deployment observation
    RecordDeployment {
        /// Deployer address
        user: String,
        /// Contract address
        contract: String,
        /// Deployment transaction hash (64 hex chars)
        tx: String,
        /// Contract template (ERC20, ERC721, ERC1155, MULTISIG, TIMELOCK, GOVERNOR, CUSTOM)
        #[arg(long, default_value = "CUSTOM")]
        template: String,
        /// Status (PENDING, SUCCESS, FAILED)
        #[arg(long, default_value = "SUCCESS")]
        status: String,
    },
    /// Verify a submitted deployment against its on-chain receipt
    VerifyDeployment {
        /// Deployer address
        user: String,
        /// Contract address
        contract: String,
        /// Deployment transaction hash (64 hex chars)
        tx: String,
        /// Contract template
        #[arg(long, default_value = "CUSTOM")]
        template: String,
        /// RPC endpoint URL
        #[arg(short, long, default_value = "http://127.0.0.1:8545")]
        rpc_url: String,
    },
    /// Get a ledger event
    GetEvent {
        /// Transaction hash (64 hex chars)
        tx: String,
        /// Log index within the transaction
        log_index: u64,
    },
    /// Load badge templates from a JSON file
    LoadBadges {
        /// Path to the badge template file
        file: PathBuf,
    },
    /// Check whether a user may earn a badge
    EvaluateBadge {
        /// Ethereum address (hex, with or without 0x prefix)
        address: String,
        /// Badge template id
        badge_id: String,
    },
    /// Award a badge if the user is eligible
    AwardBadge {
        /// Ethereum address (hex, with or without 0x prefix)
        address: String,
        /// Badge template id
        badge_id: String,
    },
    /// Mark a mission completed and grant its XP
    CompleteMission {
        /// Ethereum address (hex, with or without 0x prefix)
        address: String,
        /// Mission id
        mission_id: String,
        /// XP reward
        xp: u64,
        /// Season id
        #[arg(long)]
        season: Option<String>,
    },
    /// Retry ledger events that were never applied
    Reconcile {
        /// XP system contract address
        #[arg(long)]
        xp_system: String,
        /// Deployment tracker contract address
        #[arg(long)]
        deployment_tracker: String,
    },
}

fn parse_status(s: &str) -> Result<DeploymentStatus> {
    match s.to_ascii_uppercase().as_str() {
        "PENDING" => Ok(DeploymentStatus::Pending),
        "SUCCESS" => Ok(DeploymentStatus::Success),
        "FAILED" => Ok(DeploymentStatus::Failed),
        other => anyhow::bail!("Unknown deployment status: {}", other),
    }
}

fn event_json(event: &LedgerEvent) -> Value {
    let args = event
        .decoded_args
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
    json!({
        "chain_id": event.chain_id,
        "tx_hash": format!("0x{:x}", event.transaction_hash),
        "log_index": event.log_index,
        "block_number": event.block_number,
        "contract": format!("0x{:x}", event.contract_address),
        "sender": event.sender.map(|s| format!("0x{:x}", s)),
        "topics": event.topics.iter().map(|t| format!("0x{:x}", t)).collect::<Vec<_>>(),
        "data": format!("0x{}", hex::encode(&event.raw_data)),
        "event": event.decoded_name,
        "args": args,
        "processed": event.processed,
        "observed_at": event.observed_at,
    })
}

fn ledger_check_json(check: &LedgerCheck) -> Value {
    json!({
        "address": format!("0x{:x}", check.address),
        "account_xp": check.account_xp,
        "ledger_xp": check.ledger_xp,
        "entries": check.entries,
        "level": check.level,
        "expected_level": check.expected_level,
        "xp_consistent": check.xp_consistent(),
        "level_consistent": check.level_consistent(),
    })
}

/// Run the CLI command and print JSON output.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = RocksProgressStore::open(&cli.db_path)
        .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?;
    let engine = Progression::new(&store).with_deployment_reward(cli.deployment_reward);

    let result = match cli.command {
        Commands::GetCursor => json!({ "cursor": store.get_cursor()? }),
        Commands::SetCursor { block } => {
            store.advance_cursor(block)?;
            json!({ "status": "ok", "cursor": block })
        }
        Commands::GetUser { address } => {
            let addr = parse_address(&address)?;
            json!({
                "address": format!("0x{:x}", addr),
                "user": store.get_user(addr)?,
            })
        }
        Commands::XpHistory { address } => {
            let addr = parse_address(&address)?;
            let entries = store.xp_entries(addr)?;
            json!({
                "address": format!("0x{:x}", addr),
                "total": entries.iter().map(|e| e.amount).sum::<u64>(),
                "entries": entries,
            })
        }
        Commands::CheckLedger { address } => match address {
            Some(address) => {
                let addr = parse_address(&address)?;
                ledger_check_json(&engine.check_ledger(addr)?)
            }
            None => {
                let mut checks = Vec::new();
                let mut inconsistent = 0;
                for user in store.list_users()? {
                    let check = engine.check_ledger(user.address)?;
                    if !check.xp_consistent() || !check.level_consistent() {
                        inconsistent += 1;
                    }
                    checks.push(ledger_check_json(&check));
                }
                json!({
                    "users": checks.len(),
                    "inconsistent": inconsistent,
                    "checks": checks,
                })
            }
        },
        Commands::GrantXp { address, amount, description } => {
            let addr = parse_address(&address)?;
            let user = engine.grant_xp(addr, amount, XpSource::Manual, &description, None)?;
            json!({ "status": "ok", "user": user })
        }
        Commands::GetDeployment { contract, tx } => {
            let contract = parse_address(&contract)?;
            let tx = parse_tx_hash(&tx)?;
            json!({ "deployment": store.get_deployment(contract, tx)? })
        }
        Commands::ListDeployments { address } => {
            let addr = parse_address(&address)?;
            json!({
                "address": format!("0x{:x}", addr),
                "deployments": store.user_deployments(addr)?,
            })
        }
        Commands::RecordDeployment {
            user,
            contract,
            tx,
            template,
            status,
        } => {
            let outcome = engine.record_deployment(
                parse_address(&user)?,
                parse_address(&contract)?,
                parse_tx_hash(&tx)?,
                template.parse::<ContractTemplate>()?,
                parse_status(&status)?,
                None,
            )?;
            serde_json::to_value(&outcome)?
        }
        Commands::VerifyDeployment {
            user,
            contract,
            tx,
            template,
            rpc_url,
        } => {
            let rpc = RpcClient::new(rpc_url);
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            let outcome = runtime.block_on(engine.verify_deployment(
                &rpc,
                parse_address(&user)?,
                parse_address(&contract)?,
                parse_tx_hash(&tx)?,
                template.parse::<ContractTemplate>()?,
            ))?;
            serde_json::to_value(&outcome)?
        }
        Commands::GetEvent { tx, log_index } => {
            let tx = parse_tx_hash(&tx)?;
            match store.get_event(tx, log_index)? {
                Some(event) => event_json(&event),
                None => json!({
                    "tx_hash": format!("0x{:x}", tx),
                    "log_index": log_index,
                    "event": null
                }),
            }
        }
        Commands::LoadBadges { file } => {
            let templates = load_badge_templates(&file)?;
            for template in &templates {
                store.put_badge_template(template)?;
            }
            json!({
                "status": "ok",
                "loaded": templates.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            })
        }
        Commands::EvaluateBadge { address, badge_id } => {
            let addr = parse_address(&address)?;
            let leaderboard = XpLeaderboard::new(&store);
            let evaluator = BadgeEvaluator::new(&store, &leaderboard);
            match evaluator.evaluate(addr, &badge_id)? {
                Eligibility::Eligible => json!({ "eligible": true }),
                Eligibility::Ineligible(reason) => json!({
                    "eligible": false,
                    "reason": reason.to_string(),
                }),
            }
        }
        Commands::AwardBadge { address, badge_id } => {
            let addr = parse_address(&address)?;
            let leaderboard = XpLeaderboard::new(&store);
            let evaluator = BadgeEvaluator::new(&store, &leaderboard);
            match evaluator.award(addr, &badge_id)? {
                Award::Awarded(badge) => json!({ "awarded": true, "badge": badge }),
                Award::Refused(reason) => json!({
                    "awarded": false,
                    "reason": reason.to_string(),
                }),
            }
        }
        Commands::CompleteMission {
            address,
            mission_id,
            xp,
            season,
        } => {
            let addr = parse_address(&address)?;
            serde_json::to_value(engine.complete_mission(addr, &mission_id, season, xp)?)?
        }
        Commands::Reconcile {
            xp_system,
            deployment_tracker,
        } => {
            let router = Router::new(WatchedContracts {
                xp_system: parse_address(&xp_system)?,
                deployment_tracker: parse_address(&deployment_tracker)?,
            });
            let report = reconcile_pending(&engine, &router)?;
            json!({
                "examined": report.examined,
                "applied": report.applied,
                "cleared": report.cleared,
                "failed": report.failed,
            })
        }
    };

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ALICE;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("success").unwrap(), DeploymentStatus::Success);
        assert_eq!(parse_status("FAILED").unwrap(), DeploymentStatus::Failed);
        assert!(parse_status("done").is_err());
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from([
            "guildctl",
            "--db-path",
            "/tmp/db",
            "record-deployment",
            "0x0742d35Cc6634C0532925a3b844Bc9e7595f0bEb",
            "0xdAC17F958D2ee523a2206206994597C13D831ec7",
            "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef",
            "--template",
            "erc20",
        ])
        .unwrap();
        assert_eq!(cli.deployment_reward, DEPLOYMENT_XP_REWARD);
        match cli.command {
            Commands::RecordDeployment { template, status, .. } => {
                assert_eq!(template, "erc20");
                assert_eq!(status, "SUCCESS");
            }
            _ => panic!("wrong command"),
        }

        let cli = Cli::try_parse_from(["guildctl", "check-ledger"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckLedger { address: None }));
    }

    #[test]
    fn test_event_json_shape() {
        let event = LedgerEvent {
            chain_id: 1,
            transaction_hash: alloy_primitives::B256::repeat_byte(0xab),
            log_index: 3,
            block_number: 10,
            contract_address: ALICE,
            sender: None,
            topics: vec![],
            raw_data: vec![0x01, 0x02],
            decoded_name: Some("LevelUp".into()),
            decoded_args: Some(r#"{"newLevel":"4"}"#.into()),
            processed: true,
            observed_at: 0,
        };
        let value = event_json(&event);
        assert_eq!(value["data"], "0x0102");
        assert_eq!(value["args"]["newLevel"], "4");
        assert_eq!(value["contract"], "0x0742d35cc6634c0532925a3b844bc9e7595f0beb");
    }
}
