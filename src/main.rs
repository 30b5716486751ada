//! Plotsync node CLI
//!
//! Run one replication server over a CSV-seeded plot store.
//!
//! Usage:
//!   plotsync --serve --identity sv1 --bind 127.0.0.1:9999 \
//!       --peer sv2=127.0.0.1:9998 --peer sv3=127.0.0.1:9997 \
//!       --plots plots.csv --out reconciled.csv

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use tracing::{error, info};

use plotsync::network::crypto::KEY_LEN;
use plotsync::{PlotStore, ReplConfig, ReplServer};

/// Parse PLOTSYNC_KEY (32 hex chars) into the 16-byte pre-shared key.
fn key_from_env() -> [u8; KEY_LEN] {
    let hex_str = env::var("PLOTSYNC_KEY").unwrap_or_else(|_| {
        eprintln!("Error: PLOTSYNC_KEY environment variable is not set.");
        eprintln!("  Set it to a 32-character hex string (16 bytes), e.g.:");
        eprintln!("  export PLOTSYNC_KEY=$(openssl rand -hex 16)");
        std::process::exit(1);
    });
    let bytes = hex::decode(&hex_str).unwrap_or_else(|_| {
        eprintln!("Error: PLOTSYNC_KEY is not valid hex.");
        std::process::exit(1);
    });
    if bytes.len() != KEY_LEN {
        eprintln!(
            "Error: PLOTSYNC_KEY must be exactly {} hex characters ({} bytes), got {}.",
            KEY_LEN * 2,
            KEY_LEN,
            hex_str.len()
        );
        std::process::exit(1);
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    key
}

fn print_usage() {
    println!("Plotsync Node v0.1.0");
    println!();
    println!("Usage:");
    println!("  plotsync --serve --identity sv1 [options]");
    println!();
    println!("Options:");
    println!("  --serve, -s                 Run the replication server (required)");
    println!("  --identity <ID>             Node identity, e.g. sv1 (required)");
    println!("  --bind <ADDR:PORT>          Listen address (default: 127.0.0.1:9999)");
    println!("  --peer <ID=ADDR:PORT>       Known peer, repeatable");
    println!("  --plots <PATH>              File to seed the store from");
    println!("  --out <PATH>                Write the reconciled store here on exit");
    println!("  --binary, -b                Read/write plot files as binary wire records");
    println!("                              instead of CSV");
    println!("  --time-mult <F>             Simulation speed multiplier (default: 1.0)");
    println!("  --help, -h                  Show this help");
    println!();
    println!("Environment:");
    println!("  PLOTSYNC_KEY                Pre-shared AES key (32 hex chars, required)");
    println!("  RUST_LOG                    Log level (e.g. info, debug)");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    let show_help = args.iter().any(|a| a == "--help" || a == "-h");
    let serve_mode = args.iter().any(|a| a == "--serve" || a == "-s");

    if show_help || !serve_mode {
        print_usage();
        return if show_help {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let identity = match args.windows(2).find(|w| w[0] == "--identity") {
        Some(w) => w[1].clone(),
        None => {
            eprintln!("Error: --identity is required.");
            return ExitCode::FAILURE;
        }
    };

    let (bind_addr, bind_port) = match args.windows(2).find(|w| w[0] == "--bind") {
        Some(w) => match w[1].rsplit_once(':').and_then(|(a, p)| {
            let port: u16 = p.parse().ok()?;
            Some((a.to_string(), port))
        }) {
            Some(parsed) => parsed,
            None => {
                eprintln!("Error: --bind expects ADDR:PORT, got '{}'.", w[1]);
                return ExitCode::FAILURE;
            }
        },
        None => ("127.0.0.1".to_string(), 9999),
    };

    let mut peers = Vec::new();
    for w in args.windows(2).filter(|w| w[0] == "--peer") {
        match ReplConfig::parse_peer_spec(&w[1]) {
            Ok(peer) => peers.push(peer),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let binary_plots = args.iter().any(|a| a == "--binary" || a == "-b");
    let plots_path: Option<PathBuf> = args
        .windows(2)
        .find(|w| w[0] == "--plots")
        .map(|w| PathBuf::from(&w[1]));
    let out_path: Option<PathBuf> = args
        .windows(2)
        .find(|w| w[0] == "--out")
        .map(|w| PathBuf::from(&w[1]));

    let time_mult: f32 = match args.windows(2).find(|w| w[0] == "--time-mult") {
        Some(w) => match w[1].parse() {
            Ok(f) => f,
            Err(_) => {
                eprintln!("Error: --time-mult expects a number, got '{}'.", w[1]);
                return ExitCode::FAILURE;
            }
        },
        None => 1.0,
    };

    if let Err(e) = ReplConfig::parse_node_id(&identity) {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let mut store = PlotStore::new();
    if let Some(path) = &plots_path {
        let loaded = if binary_plots {
            store.load_binary(path)
        } else {
            store.load_csv(path)
        };
        match loaded {
            Ok(n) => info!(path = %path.display(), plots = n, "seeded store"),
            Err(e) => {
                eprintln!("Error: failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        }
    }

    let config = ReplConfig {
        bind_addr,
        bind_port,
        identity,
        key: key_from_env(),
        peers,
        time_mult,
        ..ReplConfig::default()
    };

    let mut server = ReplServer::new(store, config);
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    if let Err(e) = server.run().await {
        error!(error = %e, "replication server failed");
        return ExitCode::FAILURE;
    }

    let store = server.into_store();
    info!(plots = store.len(), "replication finished");
    if let Some(path) = &out_path {
        let saved = if binary_plots {
            store.save_binary(path)
        } else {
            store.save_csv(path)
        };
        if let Err(e) = saved {
            eprintln!("Error: failed to write {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
        info!(path = %path.display(), "reconciled store written");
    }

    ExitCode::SUCCESS
}
