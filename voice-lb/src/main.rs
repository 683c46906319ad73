use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use voice_lb::backends::{PinnedPool, SlotRow};
use voice_lb::config::{BackendEntry, BalancerConfig, MacAddr};
use voice_lb::loader::{self, XdpMode};
use voice_lb::stats::{self, StatsSnapshot};
use voice_lb_common::{MAX_BACKENDS, Pool, Stat, select};

#[derive(Parser)]
#[command(name = "voice-lb")]
#[command(about = "XDP load balancer for SIP, RTP and API traffic", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and attach the XDP program, then report until Ctrl+C
    Run(RunCommand),
    /// Print counters aggregated over every CPU
    Stats(StatsCommand),
    /// Inspect or edit backend slots of a running balancer
    #[command(subcommand)]
    Backend(BackendCommand),
    /// Show which slot a source would be steered to
    Select(SelectCommand),
    /// Parse and validate a config file without loading anything
    CheckConfig(ConfigArg),
}

#[derive(Args)]
struct ConfigArg {
    /// TOML configuration file
    #[arg(long, short, value_name = "FILE")]
    config: PathBuf,
}

#[derive(Args)]
struct PinDirArg {
    /// bpffs directory holding the pinned maps
    #[arg(long, value_name = "DIR", default_value = loader::DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,
}

#[derive(Args)]
struct RunCommand {
    #[command(flatten)]
    config: ConfigArg,
    /// Interface to attach to
    #[arg(long, value_name = "IFACE")]
    iface: String,
    #[arg(long, value_enum, default_value_t = XdpMode::Driver)]
    xdp_mode: XdpMode,
    #[command(flatten)]
    pins: PinDirArg,
}

#[derive(Args)]
struct StatsCommand {
    #[command(flatten)]
    pins: PinDirArg,
    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum PoolArg {
    Signaling,
    Api,
}

impl From<PoolArg> for Pool {
    fn from(value: PoolArg) -> Self {
        match value {
            PoolArg::Signaling => Pool::Signaling,
            PoolArg::Api => Pool::Api,
        }
    }
}

#[derive(Args)]
struct PoolArgs {
    #[arg(long, value_enum)]
    pool: PoolArg,
    #[command(flatten)]
    pins: PinDirArg,
}

#[derive(Subcommand)]
enum BackendCommand {
    /// List every slot of a pool
    List(PoolArgs),
    /// Fill a slot
    Set {
        #[command(flatten)]
        target: PoolArgs,
        #[arg(long)]
        slot: u32,
        #[arg(long)]
        address: Ipv4Addr,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value_t = 100)]
        weight: u16,
        /// Backend MAC for direct server return, e.g. 02:00:00:00:00:01
        #[arg(long)]
        mac: Option<MacAddr>,
    },
    /// Empty a slot
    Clear {
        #[command(flatten)]
        target: PoolArgs,
        #[arg(long)]
        slot: u32,
    },
}

#[derive(Args)]
struct SelectCommand {
    #[arg(long)]
    addr: Ipv4Addr,
    #[arg(long)]
    port: u16,
    #[arg(long, default_value_t = MAX_BACKENDS, value_parser = clap::value_parser!(u32).range(1..=MAX_BACKENDS as i64))]
    slots: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run().await {
        eprintln!("voice-lb error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(cmd)) => {
            let config = BalancerConfig::load(&cmd.config.config)?;
            loader::run(loader::RunOptions {
                iface: cmd.iface,
                pin_dir: cmd.pins.pin_dir,
                xdp_mode: cmd.xdp_mode,
                config,
            })
            .await?;
        }
        Some(Commands::Stats(cmd)) => {
            let map = stats::open_pinned(cmd.pins.pin_dir.join(loader::MAP_STATS))?;
            let snapshot = StatsSnapshot::read(&map)?;
            if cmd.json {
                println!("{}", serde_json::to_string_pretty(&snapshot.to_json())?);
            } else {
                for stat in Stat::ALL {
                    println!("{:<20}{}", stat.name(), snapshot.get(stat));
                }
            }
        }
        Some(Commands::Backend(cmd)) => backend(cmd)?,
        Some(Commands::Select(cmd)) => {
            let addr = u32::from(cmd.addr);
            println!(
                "slot {} (maglev index {})",
                select::select(addr, cmd.port, cmd.slots),
                select::maglev_index(addr, cmd.port)
            );
        }
        Some(Commands::CheckConfig(cmd)) => {
            let config = BalancerConfig::load(&cmd.config)?;
            println!(
                "{}: ok ({} signaling, {} api backends)",
                cmd.config.display(),
                config.signaling_backends.len(),
                config.api_backends.len()
            );
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn backend(cmd: BackendCommand) -> Result<()> {
    match cmd {
        BackendCommand::List(target) => {
            let pool = PinnedPool::open(&target.pins.pin_dir, target.pool.into())?;
            for (slot, backend) in pool.list()?.iter().enumerate() {
                println!("{}", SlotRow { slot, backend });
            }
        }
        BackendCommand::Set {
            target,
            slot,
            address,
            port,
            weight,
            mac,
        } => {
            let entry = BackendEntry {
                slot: Some(slot),
                address,
                port,
                weight,
                mac,
            };
            let mut pool = PinnedPool::open(&target.pins.pin_dir, target.pool.into())?;
            pool.update(slot, Some(entry.to_backend()))?;
            tracing::info!(slot, %address, port, "backend set");
        }
        BackendCommand::Clear { target, slot } => {
            let mut pool = PinnedPool::open(&target.pins.pin_dir, target.pool.into())?;
            pool.update(slot, None)?;
            tracing::info!(slot, "backend cleared");
        }
    }
    Ok(())
}
