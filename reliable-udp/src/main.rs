//! Entry point for `reliable-udp`.
//!
//! Parses CLI arguments and runs either the **send** or the **receive**
//! agent.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing, files).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use reliable_udp::{AgentConfig, Receiver, Sender};

/// Reliable file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Send a file to a waiting receiver.
    Send {
        /// File to send.
        #[arg(short, long)]
        file: PathBuf,
        /// Receiver address.
        #[arg(long, default_value = "127.0.0.1:10001")]
        peer: SocketAddr,
        /// Local UDP port.
        #[arg(short, long, default_value_t = 10000)]
        port: u16,
        #[command(flatten)]
        common: Common,
    },
    /// Receive one file and write it to disk.
    Receive {
        /// Output file.
        #[arg(short, long)]
        file: PathBuf,
        /// Local UDP port.
        #[arg(short, long, default_value_t = 10001)]
        port: u16,
        #[command(flatten)]
        common: Common,
    },
}

/// Options shared by both modes.
#[derive(Args)]
struct Common {
    /// Log every packet at info level.
    #[arg(long)]
    packet_logging: bool,
    /// Percentage of outgoing packets to corrupt.
    #[arg(long, default_value_t = 0.0)]
    corruption: f64,
    /// Percentage of outgoing packets to drop.
    #[arg(long, default_value_t = 0.0)]
    drop: f64,
    /// Initial retransmission timeout in milliseconds.
    #[arg(long, default_value_t = 100)]
    timeout_ms: u64,
    /// Receive buffer size in bytes.
    #[arg(long, default_value_t = 32_000)]
    buffer: u32,
    /// Initial congestion window in packets.
    #[arg(long, default_value_t = 1)]
    cwnd: u32,
    /// Initial slow-start threshold in packets.
    #[arg(long, default_value_t = 16)]
    ssthresh: u32,
    /// Seed for the fault-injection RNG.
    #[arg(long)]
    seed: Option<u64>,
}

impl Common {
    fn into_config(self) -> anyhow::Result<AgentConfig> {
        let config = AgentConfig {
            packet_logging: self.packet_logging,
            corruption_pct: self.corruption,
            drop_pct: self.drop,
            initial_timeout: Duration::from_millis(self.timeout_ms),
            max_buffer: self.buffer,
            initial_cwnd: self.cwnd,
            ssthresh: self.ssthresh,
            seed: self.seed,
            ..AgentConfig::default()
        };
        config.validate().context("invalid options")?;
        Ok(config)
    }
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let report = match cli.mode {
        Mode::Send {
            file,
            peer,
            port,
            common,
        } => {
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("cannot open {}", file.display()))?;
            let sender = Sender::bind(any_addr(port), peer, common.into_config()?).await?;
            log::info!("Sending {} to {peer}", file.display());
            let handle = sender.start(source);
            stop_on_ctrl_c(handle.kill_switch());
            handle.join().await?
        }
        Mode::Receive { file, port, common } => {
            let sink = tokio::fs::File::create(&file)
                .await
                .with_context(|| format!("cannot create {}", file.display()))?;
            let receiver = Receiver::bind(any_addr(port), common.into_config()?).await?;
            log::info!("Receiving into {}", file.display());
            let handle = receiver.start(sink);
            stop_on_ctrl_c(handle.kill_switch());
            let (report, mut sink) = handle.join().await?;
            tokio::io::AsyncWriteExt::shutdown(&mut sink).await?;
            report
        }
    };

    log::info!("{report:#?}");
    Ok(())
}

fn stop_on_ctrl_c(kill: reliable_udp::shutdown::KillSwitch) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, stopping");
            kill.kill();
        }
    });
}
