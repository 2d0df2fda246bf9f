use slot_fetcher_lib::cli::{parse_args, Command};
use slot_fetcher_lib::commands::{run_block_once, run_fetch_once, run_replay_once};

#[tokio::main]
async fn main() {
    let cli = parse_args();
    let exit_code = match cli.command {
        Command::Fetch(args) => run_fetch_once(args, "fetch").await,
        Command::Replay(args) => run_replay_once(args, "replay").await,
        Command::Block(args) => run_block_once(args, "block").await,
    };
    std::process::exit(exit_code);
}
