//! wsrelay CLI

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsrelay::config::Config;
use wsrelay::network::NetworkHandler;

fn usage() -> ! {
    eprintln!("wsrelay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: wsrelay [command] [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  serve [config.toml]   Start the relay (default command)");
    eprintln!("  check <config.toml>   Validate a configuration file");
    eprintln!();
    eprintln!("Log level is read from RUST_LOG (default: info).");
    process::exit(1);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        None => serve(None),
        Some("serve") => serve(args.get(2).map(PathBuf::from)),
        Some("check") => {
            let Some(path) = args.get(2) else {
                eprintln!("Usage: wsrelay check <config.toml>");
                process::exit(1);
            };
            check(Path::new(path));
        }
        Some("-h" | "--help" | "help") => usage(),
        Some(command) => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'wsrelay --help' for usage information.");
            process::exit(1);
        }
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wsrelay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn serve(path: Option<PathBuf>) {
    init_logging();

    if let Err(e) = run(path.as_deref()) {
        error!("{e:#}");
        process::exit(1);
    }
}

fn run(path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(path)?;
    info!(
        "Starting server on port {} (pong wait {:?}, ping period {:?}, max message {} bytes)",
        config.server.port,
        config.heartbeat.policy().pong_wait,
        config.heartbeat.policy().ping_period,
        config.limits.max_message_size
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(NetworkHandler::new(config).run())?;
    Ok(())
}

fn check(path: &Path) {
    match load_config(Some(path)) {
        Ok(config) => {
            let policy = config.heartbeat.policy();
            println!("Configuration OK: {}", path.display());
            println!();
            println!("  listen:           {}", config.server.socket_addr());
            println!("  write wait:       {:?}", policy.write_wait);
            println!("  pong wait:        {:?}", policy.pong_wait);
            println!("  ping period:      {:?}", policy.ping_period);
            println!("  max message size: {} bytes", config.limits.max_message_size);
            println!("  max connections:  {}", config.limits.max_connections);
        }
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            process::exit(1);
        }
    }
}
