//! portod daemon entry point: load the config, bootstrap the host
//! network and keep the per-namespace traffic trees fresh.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use console::style;
use env_logger::{Builder, Env};
use log::{error, info, Level, LevelFilter};
use std::io::Write;

use portod::config::Config;
use portod::network::NetRegistry;
use portod::utils;

#[derive(Parser, Debug)]
#[command(name = "portod", about = "Linux container management daemon")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/portod/config.json")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Seconds between network refresh sweeps
    #[arg(long, default_value_t = 60)]
    refresh_interval: u64,
}

/// Initialize logger based on verbose flag
fn init_logger(verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", if verbose { "debug" } else { "info" });

    Builder::from_env(env)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => format!("{}", style("ERROR").red().bold()),
                Level::Warn => format!("{}", style("WARN ").yellow().bold()),
                Level::Info => format!("{}", style("INFO ").green()),
                Level::Debug => format!("{}", style("DEBUG").cyan()),
                Level::Trace => format!("{}", style("TRACE").dim()),
            };
            writeln!(buf, "{} {}", level, record.args())
        })
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    if !utils::is_root() {
        eprintln!("Error: portod requires root privileges");
        std::process::exit(1);
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) if e.is_not_found() => {
            info!("no config at {}, using defaults", cli.config.display());
            let mut config = Config::default();
            config.init();
            config
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let registry = NetRegistry::new();
    let net_cfg = Arc::new(config.network.clone());

    if let Err(e) = registry.init_host_network(net_cfg) {
        eprintln!("Error: cannot initialize host network: {}", e);
        std::process::exit(1);
    }
    info!("host network ready");

    loop {
        std::thread::sleep(Duration::from_secs(cli.refresh_interval));
        registry.refresh_networks();
        if let Some(host) = registry.host() {
            if let Err(e) = host.refresh_devices() {
                error!("host refresh failed: {}", e);
            }
        }
    }
}
