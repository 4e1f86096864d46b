mod commands;
mod config;
mod session;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::{path::PathBuf, sync::Arc};
use tokio::io::BufReader;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use commands::{drive, Exit, Repl};
use config::{Overrides, Settings};
use pedal_link_ble::BleTransport;
use pedal_link_core::{channel, ConnectionManager, Transport, TransportKind};
use pedal_link_serial::SerialTransport;
use session::{spawn_pump, ConsoleSession};

#[derive(Parser, Debug)]
#[command(name = "pedal-console", version, about = "Operator console for the pedal controller")]
struct Cli {
    /// Settings file; defaults to <config dir>/pedal-console/config.toml when present.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug-level diagnostics on stderr (RUST_LOG still wins).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the interactive console, optionally connecting right away.
    Run(RunArgs),
    /// List serial ports.
    Ports {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Connect over USB serial on this port.
    #[arg(long, value_name = "PORT", conflicts_with = "ble")]
    serial: Option<String>,

    #[arg(long, value_name = "BAUD")]
    baud: Option<u32>,

    /// Connect over BLE.
    #[arg(long)]
    ble: bool,

    /// Advertised BLE name to look for.
    #[arg(long, value_name = "NAME")]
    device_name: Option<String>,

    /// One JSON object per output line.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            serial_port: self.serial.clone(),
            baud_rate: self.baud,
            device_name: self.device_name.clone(),
            json: self.json,
        }
    }

    fn initial_link(&self) -> Option<TransportKind> {
        if self.ble {
            Some(TransportKind::Ble)
        } else if self.serial.is_some() {
            Some(TransportKind::Serial)
        } else {
            None
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file = config::load(cli.config.as_deref()).context("load config")?;
    match cli.command {
        Command::Ports { json } => list_ports(json),
        Command::Run(args) => {
            let settings = Settings::resolve(file, &args.overrides());
            run(settings, args.initial_link()).await
        }
    }
}

fn list_ports(json: bool) -> anyhow::Result<()> {
    let ports = pedal_link_serial::available_ports()?;
    if ports.is_empty() && !json {
        println!("no serial ports found");
    }
    for port in ports {
        if json {
            println!("{}", json!({ "port": port.name, "description": port.description }));
        } else {
            println!("{:<20} {}", port.name, port.description);
        }
    }
    Ok(())
}

async fn run(settings: Settings, initial: Option<TransportKind>) -> anyhow::Result<()> {
    debug!(?settings, "starting console");
    let (tx, rx) = channel();
    let transports: Vec<Arc<dyn Transport>> = vec![
        Arc::new(SerialTransport::new(settings.serial.clone())),
        Arc::new(BleTransport::new(settings.ble.clone())),
    ];
    let manager = ConnectionManager::new(tx, transports);
    let session = Arc::new(ConsoleSession::new(settings.json));
    let _pump = spawn_pump(rx, session.clone());

    if let Some(kind) = initial {
        if let Err(e) = manager.connect(kind).await {
            session.error(&e);
        }
    }
    if !session.json() {
        session.say("type `help` for commands");
    }

    let mut repl = Repl::new(manager.clone(), session.clone());
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(%e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let exit = drive(&mut repl, BufReader::new(tokio::io::stdin()), interrupt)
        .await
        .context("read stdin")?;
    match exit {
        Exit::Quit => return Ok(()),
        Exit::Interrupted => info!("interrupted"),
        Exit::EndOfInput => debug!("end of input"),
    }

    if let Err(e) = manager.disconnect().await {
        session.error(&e);
    }
    Ok(())
}
