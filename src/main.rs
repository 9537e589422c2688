mod api;
mod domain;
mod error;
mod loader;
mod logger;

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::clock::WallClock;
use crate::domain::control::server::{ControlGateway, spawn_listener};
use crate::domain::executor::executor::{Executor, ExecutorConfig};
use crate::domain::status_store::persistence::CsvHistoryBackend;
use crate::domain::status_store::store::StatusStore;
use crate::error::Error;
use crate::loader::graph_json::JsonGraphParser;
use crate::loader::parser::load_lab_document;

use actix::Actor;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_FATAL: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "labflow", about = "Laboratory workflow orchestration core")]
struct Cli {
    /// Directory for the log file.
    #[arg(long, default_value = "logs", global = true)]
    log_dir: std::path::PathBuf,

    /// Log to the file only, keep the console clean.
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a lab configuration document and exit.
    Check {
        /// Path to the lab configuration JSON.
        lab: String,
    },
    /// Run the orchestrator with the control surface.
    Run {
        /// Path to the lab configuration JSON.
        lab: String,
        /// Control surface listen address.
        #[arg(long, default_value = "127.0.0.1:47200")]
        listen: String,
        /// Append history records to this CSV file.
        #[arg(long)]
        history_csv: Option<String>,
        /// Start in simulation mode at the given speed factor.
        #[arg(long)]
        simulation_speed: Option<f64>,
    },
}

#[actix_rt::main]
async fn main() {
    let cli = Cli::parse();
    logger::init_with(&logger::LogSettings { dir: cli.log_dir.clone(), console: !cli.quiet, ..Default::default() });

    let code = match cli.command {
        Command::Check { lab } => check(&lab),
        Command::Run { lab, listen, history_csv, simulation_speed } => run(&lab, &listen, history_csv, simulation_speed).await,
    };
    std::process::exit(code);
}

fn check(lab: &str) -> i32 {
    match load_lab_document(lab) {
        Ok((dto, devices)) => {
            log::info!("Lab '{}' is valid: {} devices.", dto.description, devices.len());
            for device in devices {
                log::info!("  {} ({}, capacity {})", device.id, device.kind, device.capacity);
            }
            EXIT_OK
        }
        Err(e) => {
            log::error!("Lab document is invalid: {}", e);
            EXIT_CONFIG
        }
    }
}

async fn run(lab: &str, listen: &str, history_csv: Option<String>, simulation_speed: Option<f64>) -> i32 {
    let (_, devices) = match load_lab_document(lab) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("Cannot load lab document: {}", e);
            return EXIT_CONFIG;
        }
    };
    let listen_addr: std::net::SocketAddr = match listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("Invalid listen address '{}': {}", listen, e);
            return EXIT_CONFIG;
        }
    };

    let store = StatusStore::with_backend(Box::new(CsvHistoryBackend::init(history_csv)));
    store.replace_devices(devices);

    // The binary ships no real device adapters; running without simulation
    // requires embedding the crate and registering adapters.
    let (executor, handle) = Executor::new(store, Box::new(WallClock), HashMap::new(), ExecutorConfig::default());
    tokio::spawn(executor.run());

    if let Some(speed) = simulation_speed {
        if let Err(e) = handle.enable_simulation(speed).await {
            log::error!("Could not enable simulation: {}", e);
            return EXIT_FATAL;
        }
    }

    let gateway = ControlGateway::new(handle.clone(), Arc::new(JsonGraphParser)).start();
    spawn_listener(listen_addr, gateway.recipient());

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            log::info!("Interrupted; shutting down.");
            handle.shutdown().await;
            EXIT_INTERRUPTED
        }
        Err(e) => {
            log::error!("Signal handling failed: {}", Error::IoError(e));
            handle.shutdown().await;
            EXIT_FATAL
        }
    }
}
