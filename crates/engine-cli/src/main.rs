// UCI (Universal Chess Interface) adapter.

mod uci;

use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Number of search threads
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Transposition table size in MB
    #[arg(long, default_value_t = 16)]
    hash: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { "debug" } else { "warn" };
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, filter),
    );

    log::info!("UCI engine starting (threads={}, hash={}MB)", args.threads, args.hash);

    uci::run(args.threads, args.hash)
}
