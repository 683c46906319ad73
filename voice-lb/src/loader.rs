use std::{
    convert::TryFrom,
    fs, future, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::maps::{Array, HashMap, PerCpuArray};
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader, include_bytes_aligned};
use clap::ValueEnum;
use tokio::{
    signal,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use voice_lb_common::{Backend, CONFIG_SLOT_RUNTIME, LbConfig, Pool, RateRecord};

use crate::{
    backends::{self, PinnedPool, SlotTable},
    config::{BalancerConfig, pool_name},
    health::{self, HealthPolicy, PoolHealth},
    stats::{self, StatsSnapshot},
    sweep::{self, SweepPolicy},
};

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/voice-lb-xdp"));

pub const MAP_RATE_LIMIT: &str = "rate_limit";
pub const MAP_SIGNALING_BACKENDS: &str = "sig_backends";
pub const MAP_API_BACKENDS: &str = "api_backends";
pub const MAP_SIGNALING_MAGLEV: &str = "sig_maglev";
pub const MAP_API_MAGLEV: &str = "api_maglev";
pub const MAP_STATS: &str = "stats";
pub const MAP_LB_CONFIG: &str = "lb_config";
const XDP_PROGRAM: &str = "xdp_voice_lb";

pub const PINNED_MAPS: [&str; 7] = [
    MAP_RATE_LIMIT,
    MAP_SIGNALING_BACKENDS,
    MAP_API_BACKENDS,
    MAP_SIGNALING_MAGLEV,
    MAP_API_MAGLEV,
    MAP_STATS,
    MAP_LB_CONFIG,
];

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/voice_lb";

/// Backend array and Maglev table names for a pool.
pub fn pool_map_names(pool: Pool) -> (&'static str, &'static str) {
    match pool {
        Pool::Signaling => (MAP_SIGNALING_BACKENDS, MAP_SIGNALING_MAGLEV),
        Pool::Api => (MAP_API_BACKENDS, MAP_API_MAGLEV),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    Skb,
    Driver,
    Hw,
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub iface: String,
    pub pin_dir: PathBuf,
    pub xdp_mode: XdpMode,
    pub config: BalancerConfig,
}

/// Loads, configures and attaches the balancer, then serves until Ctrl+C.
pub async fn run(opts: RunOptions) -> Result<()> {
    ensure!(
        !EBPF_BYTES.is_empty(),
        "this binary was built without the XDP object; install bpf-linker and rebuild without VOICE_LB_SKIP_EBPF"
    );
    let cfg = &opts.config;

    let mut loader = EbpfLoader::new();
    #[allow(deprecated)]
    {
        // `set_max_entries` is currently the only stable API across our Aya pin.
        loader.set_max_entries(MAP_RATE_LIMIT, cfg.rate_limit.table_capacity);
    }
    let mut bpf = loader
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;

    write_runtime_config(&mut bpf, cfg.lb_config())?;
    for pool in [Pool::Signaling, Pool::Api] {
        let table = cfg.backend_table(pool)?;
        write_pool_maps(&mut bpf, pool, &table)?;
        info!(
            pool = pool_name(pool),
            active = table.iter().filter(|b| b.is_usable()).count(),
            "backends loaded"
        );
    }

    let attached = PINNED_MAPS
        .iter()
        .try_for_each(|name| pin_map(&mut bpf, name, &opts.pin_dir.join(name)))
        .and_then(|()| attach_xdp(&mut bpf, &opts.iface, opts.xdp_mode));
    let link = unpin_on_error(&opts.pin_dir, attached)?;
    info!(
        iface = %opts.iface,
        mode = ?opts.xdp_mode,
        pin_dir = %opts.pin_dir.display(),
        "attached XDP program, press Ctrl+C to detach"
    );

    let served = serve(&mut bpf, cfg).await;

    info!(iface = %opts.iface, "detaching");
    let detached = detach(&mut bpf, link);
    unpin_all(&opts.pin_dir);
    served.and(detached)
}

async fn serve(bpf: &mut Ebpf, cfg: &BalancerConfig) -> Result<()> {
    let stats_map = bpf
        .take_map(MAP_STATS)
        .with_context(|| format!("map {MAP_STATS} not found"))?;
    let stats_map = PerCpuArray::<_, u64>::try_from(stats_map)
        .context("stats map has unexpected type")?;
    let rate_map = bpf
        .take_map(MAP_RATE_LIMIT)
        .with_context(|| format!("map {MAP_RATE_LIMIT} not found"))?;
    let mut rate_map = HashMap::<_, u32, RateRecord>::try_from(rate_map)
        .context("rate map has unexpected type")?;

    let policy = SweepPolicy {
        window_ns: cfg.lb_config().rate_window_ns,
        idle_windows: cfg.rate_limit.sweep_idle_windows,
    };

    let mut report = time::interval(cfg.report_interval());
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    report.tick().await;
    let mut sweeper = cfg.sweep_interval().map(delayed_interval);

    let health_policy = cfg.health_policy();
    let mut health_timer = health_policy.map(|(every, _)| delayed_interval(every));
    let mut pools = Vec::with_capacity(2);
    for pool in [Pool::Signaling, Pool::Api] {
        pools.push((PinnedPool::take(bpf, pool)?, PoolHealth::default()));
    }

    let mut previous = StatsSnapshot::read(&stats_map)?;
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                res.context("failed to wait for shutdown signal")?;
                return Ok(());
            }
            _ = report.tick() => {
                match StatsSnapshot::read(&stats_map) {
                    Ok(current) => {
                        stats::report(&current, &previous);
                        previous = current;
                    }
                    Err(err) => warn!("failed to read stats: {err:#}"),
                }
            }
            _ = tick(&mut sweeper) => {
                match sweep::monotonic_now_ns() {
                    Ok(now) => {
                        let outcome = sweep::sweep_map(&mut rate_map, now, policy);
                        debug!(scanned = outcome.scanned, removed = outcome.removed, "rate table swept");
                    }
                    Err(err) => warn!("skipping sweep: {err:#}"),
                }
            }
            _ = tick(&mut health_timer) => {
                if let Some((_, policy)) = &health_policy {
                    for (pool, tracker) in pools.iter_mut() {
                        if let Err(err) = check_pool(pool, tracker, policy).await {
                            warn!(pool = pool_name(pool.pool), "health pass failed: {err:#}");
                        }
                    }
                }
            }
        }
    }
}

fn delayed_interval(every: Duration) -> Interval {
    let mut interval = time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Ticks an optional interval; a missing one never fires.
async fn tick(interval: &mut Option<Interval>) -> Instant {
    match interval.as_mut() {
        Some(interval) => interval.tick().await,
        None => future::pending().await,
    }
}

/// Checks one pool and rewrites its maps when a backend changed state.
async fn check_pool(
    pool: &mut PinnedPool,
    tracker: &mut PoolHealth,
    policy: &HealthPolicy,
) -> Result<()> {
    let mut table = pool.list()?;
    let targets = tracker.targets(&table);
    if targets.is_empty() {
        return Ok(());
    }
    let results = health::check_all(targets, policy.timeout).await;
    if tracker.apply(&mut table, &results, policy, pool_name(pool.pool)) {
        pool.replace(&table)?;
        info!(
            pool = pool_name(pool.pool),
            active = table.iter().filter(|b| b.is_usable()).count(),
            "backends rebalanced"
        );
    }
    Ok(())
}

fn write_runtime_config(bpf: &mut Ebpf, cfg: LbConfig) -> Result<()> {
    let map = bpf
        .map_mut(MAP_LB_CONFIG)
        .with_context(|| format!("map {MAP_LB_CONFIG} not found"))?;
    let mut array = Array::<_, LbConfig>::try_from(map).context("config map has unexpected type")?;
    array
        .set(CONFIG_SLOT_RUNTIME, cfg, 0)
        .with_context(|| "failed to write runtime config")?;
    Ok(())
}

fn write_pool_maps(bpf: &mut Ebpf, pool: Pool, table: &SlotTable) -> Result<()> {
    let (backends_name, maglev_name) = pool_map_names(pool);
    {
        let map = bpf
            .map_mut(backends_name)
            .with_context(|| format!("map {backends_name} not found"))?;
        let mut array =
            Array::<_, Backend>::try_from(map).context("backend map has unexpected type")?;
        backends::write_pool(&mut array, table)?;
    }
    let map = bpf
        .map_mut(maglev_name)
        .with_context(|| format!("map {maglev_name} not found"))?;
    let mut array = Array::<_, u32>::try_from(map).context("maglev map has unexpected type")?;
    backends::write_maglev(&mut array, table)
}

/// Pins a map, replacing whatever a previous run left at `path`.
fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale pin"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to remove stale pin {}", path.display()));
        }
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    map.pin(path)
        .map_err(|err| anyhow!("failed to pin map {map_name} at {}: {err}", path.display()))
}

/// Removes the pins again when setup failed after pinning started.
fn unpin_on_error<T>(pin_dir: &Path, result: Result<T>) -> Result<T> {
    if result.is_err() {
        unpin_all(pin_dir);
    }
    result
}

fn unpin_all(pin_dir: &Path) {
    for name in PINNED_MAPS {
        let path = pin_dir.join(name);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), %err, "failed to remove pin");
            }
        }
    }
}

fn attach_xdp(bpf: &mut Ebpf, iface: &str, mode: XdpMode) -> Result<XdpLinkId> {
    let flags = xdp_flags(mode);
    let program: &mut Xdp = bpf
        .program_mut(XDP_PROGRAM)
        .with_context(|| format!("program {XDP_PROGRAM} not found"))?
        .try_into()
        .context("xdp program has wrong type")?;
    program.load().context("failed to load xdp program")?;
    program
        .attach(iface, flags)
        .with_context(|| format!("failed to attach xdp on {iface}"))
}

fn detach(bpf: &mut Ebpf, link: XdpLinkId) -> Result<()> {
    let program: &mut Xdp = bpf
        .program_mut(XDP_PROGRAM)
        .with_context(|| format!("program {XDP_PROGRAM} not found"))?
        .try_into()
        .context("xdp program has wrong type")?;
    program.detach(link).context("failed to detach xdp program")
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}
