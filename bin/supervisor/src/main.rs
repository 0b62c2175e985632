//! `ekko-supervisor`: the blockchain-head ingestion control plane binary.
//!
//! Watches the config key-value bucket, converges one `ManagedPipeline` per
//! `(network, subnet, vmType)` group and one `BlockFetcher` per enabled node, and persists
//! fetched transactions to object storage via `ArrowWriter`.

pub mod cli;
pub mod flags;
pub mod metrics;
pub(crate) mod version;

use clap::Parser;

fn main() {
    ekko_cli::sigsegv_handler::install();
    ekko_cli::backtrace::enable();

    if let Err(err) = cli::Cli::parse().run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
