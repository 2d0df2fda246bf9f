use crate::build_info;
use crate::commands::{BlockArgs, FetchArgs, ReplayArgs};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    about = "Rate-limited batch getBlock fetcher for Solana RPC",
    version = build_info::VERSION_WITH_COMMIT,
    long_version = build_info::VERSION_WITH_COMMIT
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch every slot in an inclusive range
    Fetch(FetchArgs),
    /// Re-fetch the slots listed in a failure file
    Replay(ReplayArgs),
    /// Fetch a single block and print it as JSON
    Block(BlockArgs),
}

pub fn parse_args() -> Cli {
    Cli::parse()
}
