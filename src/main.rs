use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use slsk_brokerd::config::Options;
use slsk_brokerd::peer::{FakePeerClient, PeerClient};
use slsk_brokerd::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("run");

    match command {
        "run" => run(&args).await?,
        "help" | "--help" | "-h" => print_help(),
        other => {
            eprintln!("unknown command '{other}'");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn run(args: &[String]) -> Result<()> {
    let log_level = parse_arg(args, "--log-level").unwrap_or("info");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config_path = parse_arg(args, "--config").map(PathBuf::from);
    let force_migrate = args.contains(&"--force-migrate".to_string());

    let options = Options::load(config_path.as_deref())?;

    // No wire-protocol client ships in this crate; `FakePeerClient` stands in
    // so the daemon is runnable end-to-end against its own coordination
    // logic alone. A deployment wires in a real `PeerClient` here instead.
    log::warn!("no real PeerClient wired in; running against the in-memory fake");
    let peer: Arc<dyn PeerClient> = Arc::new(FakePeerClient::new());

    let daemon = Daemon::new_with_migration_mode(options, peer, None, force_migrate)?;
    daemon.start();

    log::info!("daemon started, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    daemon.shutdown(false).await;

    Ok(())
}

fn parse_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().position(|arg| arg == flag).and_then(|pos| args.get(pos + 1)).map(|s| s.as_str())
}

fn print_help() {
    println!("slsk-brokerd");
    println!("Core coordination daemon for a Soulseek-style file sharing client");
    println!();
    println!("USAGE:");
    println!("    slsk-brokerd <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    run                   Start the daemon (default)");
    println!("    help                  Show this help message");
    println!();
    println!("OPTIONS (for `run`):");
    println!("    --config <PATH>       Path to a TOML configuration file");
    println!("    --log-level <LEVEL>   Log level if RUST_LOG is unset (default: info)");
    println!("    --force-migrate       Reapply every registered migration, ignoring history");
}
