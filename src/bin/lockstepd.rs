//! Fabric server daemon: accept loop plus sequencer polling.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use lockstep::config::{self, Config};
use lockstep::server::Sequencer;
use lockstep::transport::{TcpChannel, TcpChannelListener};

#[derive(Debug, Parser)]
#[command(name = "lockstepd", version, about = "Deterministic pub/sub sequencer")]
struct Cli {
    /// Listen address, overriding config and environment.
    #[arg(long)]
    listen: Option<String>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config load failed: {err}");
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    init_tracing(&config, cli.verbose);

    if let Err(err) = run(&config) {
        tracing::error!("fatal: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config, verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_new(&config.log_filter)
            .unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(config: &Config) -> std::io::Result<()> {
    let listener = TcpChannelListener::bind(&config.listen_addr, config.limits.max_frame_bytes)?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let mut sequencer: Sequencer<TcpChannel> = Sequencer::new();
    loop {
        let mut busy = false;
        while let Some(channel) = listener.accept()? {
            sequencer.attach(channel);
            busy = true;
        }
        busy |= sequencer.handle_io();
        if !busy {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
