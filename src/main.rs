//! Command-line companion for BLE smart sockets.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use smart_socket_companion_lib::commands::{self, connect_scanned_code};
use smart_socket_companion_lib::core::bluetooth::{BluestPlatform, ScannerEvent};
use smart_socket_companion_lib::core::notice::NoticeStyle;
use smart_socket_companion_lib::logging;
use smart_socket_companion_lib::state::AppState;

#[derive(Parser)]
#[command(name = "smart-socket")]
#[command(about = "Discover, connect to and control BLE smart sockets")]
struct Cli {
    /// Default log level; RUST_LOG overrides it
    #[arg(short, long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for smart sockets
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
    /// Pair with a device from its code (MAC address or JSON)
    Pair { code: String },
    /// Pair, then send one raw command line such as `CHARGE:1`
    Send { code: String, message: String },
    /// Pair, then toggle the output
    Power { code: String },
    /// Pair, then print everything the device reports
    Watch {
        code: String,
        /// Watch duration in seconds
        #[arg(short, long, default_value = "60")]
        duration: u64,
    },
    /// Probe whether the given devices are reachable
    Check { devices: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::setup(cli.log_level.parse().unwrap_or(LevelFilter::Info));

    let platform = BluestPlatform::new().await.context("No usable Bluetooth adapter")?;
    let state = AppState::new(platform).await?;
    spawn_notice_printer(&state);

    if let Err(e) = state.initialize().await {
        state.shutdown().await;
        return Err(e).context("Bluetooth initialization failed");
    }

    let outcome = run(&state, cli.command).await;
    state.shutdown().await;
    outcome
}

async fn run(state: &AppState, command: Commands) -> Result<()> {
    match command {
        Commands::Scan { duration } => scan(state, duration).await,
        Commands::Pair { code } => {
            let record = connect_scanned_code(state, &code).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::Send { code, message } => {
            connect_scanned_code(state, &code).await?;
            let line = if message.ends_with("\r\n") {
                message
            } else {
                format!("{}\r\n", message.trim_end())
            };
            state.bluetooth_manager.lock().await.send_message(&line).await?;
            println!("Sent {}", line.trim_end());
            Ok(())
        }
        Commands::Power { code } => {
            let record = connect_scanned_code(state, &code).await?;
            let record = commands::toggle_power(state, &record.device_id).await?;
            println!("Power is now {}", if record.power_on { "on" } else { "off" });
            Ok(())
        }
        Commands::Watch { code, duration } => watch(state, &code, duration).await,
        Commands::Check { devices } => {
            let manager = state.bluetooth_manager.lock().await;
            let mut states: Vec<(String, bool)> = manager
                .check_all_devices_connection_state(&devices)
                .await
                .into_iter()
                .collect();
            states.sort();
            for (id, reachable) in states {
                println!("{} {}", id, if reachable { "online" } else { "offline" });
            }
            Ok(())
        }
    }
}

async fn scan(state: &AppState, duration: u64) -> Result<()> {
    println!("Scanning for smart sockets ({} seconds)...", duration);
    let mut manager = state.bluetooth_manager.lock().await;
    let mut events = manager.subscribe_scanner();
    manager.start_search().await?;

    let listen = async {
        while let Ok(event) = events.recv().await {
            if let ScannerEvent::DevicesChanged(devices) = event {
                info!("{} devices discovered so far", devices.len());
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(duration), listen).await;
    let devices = manager.discovered_devices();
    manager.stop_search().await;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        println!("  {} ({}) RSSI: {} dBm", device.name, device.id, device.rssi);
    }
    Ok(())
}

async fn watch(state: &AppState, code: &str, duration: u64) -> Result<()> {
    let record = connect_scanned_code(state, code).await?;
    let mut frames = state.notifications.subscribe();
    println!("Watching {} for {} seconds", record.name, duration);

    let listen = async {
        while let Ok(frame) = frames.recv().await {
            println!("{:?}", frame.frame);
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(duration), listen).await;
    Ok(())
}

fn spawn_notice_printer(state: &AppState) {
    let mut notices = state.notices.subscribe();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            let marker = match notice.style {
                NoticeStyle::Modal => "!!",
                NoticeStyle::Toast => "--",
            };
            match notice.detail {
                Some(detail) => {
                    println!("{} [{:?}] {}: {}", marker, notice.level, notice.title, detail)
                }
                None => println!("{} [{:?}] {}", marker, notice.level, notice.title),
            }
        }
    });
}
