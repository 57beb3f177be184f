use std::io::IsTerminal;

use clap::{Parser, Subcommand};
use holo_coord::{open_store, CoordConfig, ListArgs, NodeArgs};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-coord")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a coordinator node until Ctrl-C.
    Node(NodeArgs),
    /// Print a page of stored transactions as JSON lines.
    List(ListArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,h2=warn,hyper=warn,tower=warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => holo_coord::run_node(args).await,
        Command::List(args) => list(args),
    }
}

fn list(args: ListArgs) -> anyhow::Result<()> {
    let store = open_store(&CoordConfig::from(&args))?;
    let mut cursor = args.after.clone();
    let page = store.scan_trans_globals(&mut cursor, args.limit)?;
    for global in &page {
        println!("{}", serde_json::to_string(global)?);
    }
    if let (false, Some(next)) = (page.is_empty(), cursor) {
        tracing::info!(next_after = %next, "end of page");
    }
    Ok(())
}
