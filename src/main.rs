//! guildctl - guild progression store CLI tool
//!
//! Inspect accounts, deployments, ledger events and badges, and run
//! manual operations against the RocksDB store the indexer writes.

use guildwatch::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
