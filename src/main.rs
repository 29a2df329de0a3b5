//! Binary entrypoint for the rfgw CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `decode <HEX>` - decode one frame and print its forward record
//! - `replay --file <frames.txt> [--duration <s>]` - run the gateway loop over
//!   recorded frames against an in-process bus
//!
//! See the library crate docs for module-level details: `rfgw::`.
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::mpsc;

use rfgw::bus::LoopbackBus;
use rfgw::codec;
use rfgw::config::Config;
use rfgw::delivery::record::ForwardRecord;
use rfgw::gateway::{Gateway, GatewayControl};
use rfgw::logutil::hex_compact;
use rfgw::metrics;
use rfgw::radio::{parse_hex, RadioFrame, ScriptedRadio};

#[derive(Parser)]
#[command(name = "rfgw")]
#[command(about = "Gateway from an FSK sensor radio network to a message bus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Decode one raw frame given as hex and print the forward record
    Decode {
        /// Frame bytes, e.g. 003d05aabb
        hex: String,
        /// RSSI to attach to the frame
        #[arg(long, default_value_t = -80, allow_hyphen_values = true)]
        rssi: i16,
        /// SNR margin to attach to the frame
        #[arg(long, default_value_t = 15)]
        snr: u8,
    },
    /// Run the gateway loop over frames read from a file
    Replay {
        /// One frame per line: HEX [rssi snr fei]
        #[arg(short, long)]
        file: String,
        /// Seconds to keep the loop running
        #[arg(short, long, default_value_t = 5)]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Init => {
            info!("Initializing new gateway configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Decode { hex, rssi, snr } => {
            let config = pre_config.unwrap_or_default();
            let bytes = parse_hex(&hex).map_err(|e| anyhow!("invalid frame hex: {}", e))?;
            let frame = RadioFrame::new(bytes, rssi, snr, 0, chrono::Utc::now());
            let pkt = codec::decode(&frame).map_err(|e| anyhow!("cannot decode frame: {}", e))?;
            info!(
                "Decoded {} frame {} from node {:x} [{}]",
                pkt.version,
                hex_compact(&frame.bytes),
                pkt.node_id,
                pkt.flag_summary()
            );
            let json = ForwardRecord::new(&config.gateway.name, &pkt).to_json()?;
            println!("{}", String::from_utf8_lossy(&json));
        }
        Commands::Replay { file, duration } => {
            let config = match pre_config {
                Some(cfg) => cfg,
                None => {
                    warn!("No usable config at {}, using defaults", cli.config);
                    Config::default()
                }
            };
            let script = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read frames from {}", file))?;
            let radio = ScriptedRadio::from_script(&script, chrono::Utc::now())?;
            info!("Replaying {} frame(s) from {}", radio.pending(), file);

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let bus = LoopbackBus::new()
                .with_events(events_tx)
                .auto_confirm(true)
                .echo(true)
                .log_publishes(true);

            let timer_tx = control_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(duration)).await;
                let _ = timer_tx.send(GatewayControl::Shutdown);
            });
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = control_tx.send(GatewayControl::Shutdown);
                }
            });

            let mut gateway = Gateway::new(config, radio, bus);
            gateway.run(events_rx, control_rx).await?;

            info!(
                "Replay finished: {} published, {} still pending",
                gateway.bus().published().len(),
                gateway.delivery().len()
            );
            println!("{}", metrics::snapshot());
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // echo to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
