//! # wardend — the warden container supervisor
//!
//! One binary, two roles: the master supervises and never dies, the
//! slave owns container state and serves clients. The master forks the
//! slave and re-execs this binary with `--slave`.

mod master;
mod rpc;
mod signals;
mod slave;

use std::path::PathBuf;

use clap::Parser;

use warden_common::config::WardenConfig;
use warden_common::constants::CONFIG_PATH;

#[derive(Debug, Parser)]
#[command(name = "wardend", version, about = "Linux container supervisor daemon")]
struct Args {
    /// Execute the slave role directly (used by the master).
    #[arg(long)]
    slave: bool,

    /// Duplicate logs to standard error.
    #[arg(long)]
    stdlog: bool,

    /// Tolerate recoverable initialization errors.
    #[arg(long)]
    failsafe: bool,

    /// Force network QoS off.
    #[arg(long)]
    nonet: bool,

    /// Dump the persistence store and exit.
    #[arg(long = "kv-dump")]
    kv_dump: bool,

    /// Validate a configuration file and exit.
    #[arg(short = 't', value_name = "PATH")]
    test_config: Option<PathBuf>,

    /// Configuration file path.
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Print version.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

const LOG_PATH: &str = "/var/log/wardend.log";

fn init_logging(stdlog: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let log_file = if stdlog {
        None
    } else {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(LOG_PATH)
            .ok()
            .map(std::sync::Arc::new)
    };
    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(move || std::sync::Arc::clone(&file))
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn kv_dump(config: &WardenConfig) -> anyhow::Result<()> {
    let store = warden_runtime::kv::KvStore::open(&config.daemon.kv_root)?;
    for (id, pairs) in store.restore_all()? {
        println!("container {id}");
        for (key, value) in pairs {
            println!("    {key} = {value}");
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.test_config {
        return match WardenConfig::load(path) {
            Ok(_) => {
                println!("{} is valid", path.display());
                Ok(())
            }
            Err(e) => {
                eprintln!("{}: {e}", path.display());
                std::process::exit(1);
            }
        };
    }

    init_logging(args.stdlog);
    let config = WardenConfig::load(&args.config)?;

    if args.kv_dump {
        return kv_dump(&config);
    }

    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("wardend needs root privileges");
    }

    let code = if args.slave {
        slave::run(config, args.failsafe, args.nonet)?
    } else {
        let flags = master::SlaveFlags {
            stdlog: args.stdlog,
            failsafe: args.failsafe,
            nonet: args.nonet,
        };
        master::run(&config, flags)?
    };
    std::process::exit(code);
}
