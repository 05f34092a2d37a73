use clap::Parser;
use colored::*;
use log::{info, warn};
use std::path::PathBuf;
use tokio::signal;

use meridian_miner::config::{Config, NodeConfig, PoolConfig};
use meridian_miner::miner::{Algorithm, Engine};

#[derive(Parser, Debug)]
#[command(
    name = "meridian-miner",
    version,
    author = "Meridian Core Team",
    about = "Meridian multi-device proof-of-work miner (pool + solo)",
    long_about = None
)]
struct Cli {
    /// Pool URL (stratum+tcp://host:port). Pool mode wins over solo.
    #[arg(short, long)]
    pool: Option<String>,

    /// Wallet address (pool mode)
    #[arg(short, long)]
    wallet: Option<String>,

    /// Node JSON-RPC URL (http://host:port, solo mode)
    #[arg(short, long)]
    node: Option<String>,

    /// Coinbase payout address (solo mode)
    #[arg(long)]
    miner_address: Option<String>,

    /// Mining algorithm (blake2bd, sha3d, blake3)
    #[arg(short, long)]
    algorithm: Option<String>,

    /// Number of CPU devices (0 = one per logical core)
    #[arg(short, long)]
    devices: Option<usize>,

    /// Device ids allowed to mine (comma-separated, e.g. "0,2").
    /// Others start invalid so shutdown stays uniform.
    #[arg(long)]
    use_devices: Option<String>,

    /// Worker name (default: hostname)
    #[arg(long)]
    worker: Option<String>,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Stats endpoint listen address (host:port)
    #[arg(long)]
    stats_listen: Option<String>,

    /// Write stats JSON to this file
    #[arg(long)]
    stats_file: Option<String>,

    /// Global status interval in seconds
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Quiet mode (warnings only)
    #[arg(short, long)]
    quiet: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if cli.debug {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else if cli.quiet {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Warn)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    if cli.no_color {
        colored::control::set_override(false);
    }

    print_banner();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_default()?,
    };
    apply_cli(&mut config, &cli);

    // Fail fast on configuration errors, before any task starts.
    config.validate()?;
    let algorithm = Algorithm::from_str(&config.mining.algorithm)
        .ok_or_else(|| anyhow::anyhow!("invalid algorithm: {}", config.mining.algorithm))?;

    print_config(&config, algorithm);

    let engine = Engine::new(config);

    // Ctrl+C fans one shutdown signal out to every task; the engine
    // then waits for the full drain.
    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        warn!("interrupt received - shutting down");
        shutdown.trigger();
    });

    engine.run().await?;
    info!("miner exited cleanly");
    Ok(())
}

fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(url) = &cli.pool {
        let mut pool = config.pool.take().unwrap_or(PoolConfig {
            url: String::new(),
            wallet: String::new(),
            worker: String::new(),
        });
        pool.url = url.clone();
        config.pool = Some(pool);
    } else if cli.node.is_some() {
        // Explicit solo mode on the command line overrides a configured
        // pool section.
        config.pool = None;
    }

    if let Some(wallet) = &cli.wallet {
        if let Some(pool) = config.pool.as_mut() {
            pool.wallet = wallet.clone();
        }
    }
    if let Some(worker) = &cli.worker {
        if let Some(pool) = config.pool.as_mut() {
            pool.worker = worker.clone();
        }
    }

    if let Some(url) = &cli.node {
        let mut node = config.node.take().unwrap_or(NodeConfig {
            url: String::new(),
            miner_address: String::new(),
            coinbase_tag: "meridian-miner".to_string(),
        });
        node.url = url.clone();
        config.node = Some(node);
    }
    if let Some(addr) = &cli.miner_address {
        if let Some(node) = config.node.as_mut() {
            node.miner_address = addr.clone();
        }
    }

    if let Some(algorithm) = &cli.algorithm {
        config.mining.algorithm = algorithm.clone();
    }
    if let Some(devices) = cli.devices {
        config.devices.count = devices;
    }
    if let Some(list) = &cli.use_devices {
        config.devices.allow = list
            .split(',')
            .filter_map(|d| d.trim().parse::<usize>().ok())
            .collect();
    }
    if let Some(listen) = &cli.stats_listen {
        config.stats.listen = Some(listen.clone());
    }
    if let Some(file) = &cli.stats_file {
        config.stats.file = Some(PathBuf::from(file));
    }
    if let Some(interval) = cli.stats_interval {
        config.stats.interval_secs = interval;
    }
}

fn print_banner() {
    println!();
    println!("{}", " ╔══════════════════════════════════════════════════════════╗".bright_cyan());
    println!("{}{}{}", " ║ ".bright_cyan(), "       MERIDIAN MINER  -  multi-device PoW client        ".bright_white().bold(), " ║".bright_cyan());
    println!("{}", " ╠══════════════════════════════════════════════════════════╣".bright_cyan());
    println!("{}{}{}", " ║ ".bright_cyan(), " Algorithms   blake2bd · sha3d · blake3                  ".white(), " ║".bright_cyan());
    println!("{}{}{}", " ║ ".bright_cyan(), " Modes        pool (stratum) · solo (node RPC)           ".white(), " ║".bright_cyan());
    println!("{}", " ╚══════════════════════════════════════════════════════════╝".bright_cyan());
    println!();
}

fn print_config(config: &Config, algorithm: Algorithm) {
    println!("{} {}", " * ".bright_green().bold(), "CONFIG".bright_white().bold());
    println!("   {:<12} {}", "algorithm".bright_black(), algorithm.name().bright_cyan());

    if let Some(pool) = &config.pool {
        println!("   {:<12} {}", "pool".bright_black(), pool.url.bright_white());
        let wallet = &pool.wallet;
        let head = &wallet[..wallet.len().min(8)];
        let tail = &wallet[wallet.len().saturating_sub(6)..];
        println!("   {:<12} {}...{}", "wallet".bright_black(), head.bright_white(), tail.bright_white());
        println!("   {:<12} {}", "worker".bright_black(), pool.worker.bright_white().bold());
    } else if let Some(node) = &config.node {
        println!("   {:<12} {}", "node".bright_black(), node.url.bright_white());
        println!("   {:<12} {}", "payout".bright_black(), node.miner_address.bright_white());
    }

    let devices = if config.devices.count == 0 {
        num_cpus::get()
    } else {
        config.devices.count
    };
    println!("   {:<12} {}", "devices".bright_black(), devices.to_string().bright_magenta().bold());
    if !config.devices.allow.is_empty() {
        println!("   {:<12} {:?}", "allow-list".bright_black(), config.devices.allow);
    }
    if let Some(listen) = &config.stats.listen {
        println!("   {:<12} http://{}/api/stats", "stats".bright_black(), listen.bright_white());
    }
    println!();
}
