//! Orchestration: algorithm registry, device fan-out, supervision.

pub mod algos;
pub mod cpu;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

use crate::config::Config;
use crate::rpc::NodeRpcClient;
use crate::source::{run_listener, PoolSource, SoloSource, SourceMode, WorkSource};
use crate::stats_http;
use crate::stratum::PoolClient;
use crate::submit::{run_drain, CandidateSubmission, SoloTotals};
use crate::work::WorkBoard;
use cpu::CpuMiner;
use stats::{fmt_hashrate, DeviceSnapshot, DeviceState, HashrateWindow, ShareCounters};

const DEVICE_STATUS_INTERVAL: Duration = Duration::from_secs(10);
const SUBMIT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Blake2bD,
    Sha3D,
    Blake3,
}

impl Algorithm {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "blake2bd" | "blake2b-double" => Some(Self::Blake2bD),
            "sha3d" | "sha3-double" => Some(Self::Sha3D),
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blake2bD => "blake2bd",
            Self::Sha3D => "sha3d",
            Self::Blake3 => "blake3",
        }
    }
}

pub type HashFn = fn(&[u8]) -> [u8; 32];

/// Everything a device search task needs, handed over at construction.
pub struct DeviceContext {
    pub device: Arc<DeviceState>,
    pub board: Arc<WorkBoard>,
    pub submit_tx: mpsc::Sender<CandidateSubmission>,
    pub quit: Arc<AtomicBool>,
}

/// Capability surface of one device search task.
pub trait DeviceMiner: Send {
    fn init(&mut self) -> Result<()>;
    fn update(&mut self) -> Result<()>;
    /// Blocking search loop; returns only on quit or a fatal task error.
    fn mine(&mut self);
    fn status(&self) -> DeviceSnapshot;
}

pub type MinerCtor = fn(DeviceContext) -> Box<dyn DeviceMiner>;

fn build_blake2bd(ctx: DeviceContext) -> Box<dyn DeviceMiner> {
    Box::new(CpuMiner::new(ctx, algos::blake2bd))
}

fn build_sha3d(ctx: DeviceContext) -> Box<dyn DeviceMiner> {
    Box::new(CpuMiner::new(ctx, algos::sha3d))
}

fn build_blake3(ctx: DeviceContext) -> Box<dyn DeviceMiner> {
    Box::new(CpuMiner::new(ctx, algos::blake3))
}

/// Algorithm tag -> device task constructor. Startup dispatch goes
/// through here; an unknown tag is a fatal configuration error.
pub const REGISTRY: &[(Algorithm, MinerCtor)] = &[
    (Algorithm::Blake2bD, build_blake2bd),
    (Algorithm::Sha3D, build_sha3d),
    (Algorithm::Blake3, build_blake3),
];

pub fn miner_ctor(algorithm: Algorithm) -> Option<MinerCtor> {
    REGISTRY
        .iter()
        .find(|(a, _)| *a == algorithm)
        .map(|(_, ctor)| *ctor)
}

/// Lets main (ctrl-c handler) fan the shutdown out to every task.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
    quit: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.quit.store(true, Ordering::Relaxed);
        let _ = self.tx.send(true);
    }
}

/// Owns startup, supervision and coordinated shutdown of the full task
/// set: per-device search + status, work listener, submission drain,
/// periodic global status and the optional stats endpoint.
pub struct Engine {
    config: Config,
    shutdown_tx: watch::Sender<bool>,
    quit: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shutdown_tx,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
            quit: Arc::clone(&self.quit),
        }
    }

    pub async fn run(&self) -> Result<()> {
        // Unknown algorithm tags die here, before any task starts.
        let algorithm = Algorithm::from_str(&self.config.mining.algorithm)
            .ok_or_else(|| anyhow!("pow {} does not exist", self.config.mining.algorithm))?;
        let ctor = miner_ctor(algorithm)
            .ok_or_else(|| anyhow!("no device miner registered for {}", algorithm.name()))?;

        let board = Arc::new(WorkBoard::new());
        let counters = Arc::new(ShareCounters::new());
        let totals = Arc::new(SoloTotals::new());
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);

        // Device list is built once; read-only for everyone afterwards.
        let count = if self.config.devices.count == 0 {
            num_cpus::get()
        } else {
            self.config.devices.count
        };
        let allow = &self.config.devices.allow;
        let mut devices = Vec::with_capacity(count);
        for id in 0..count {
            let device = Arc::new(DeviceState::new(id, algorithm));
            if !allow.is_empty() && !allow.contains(&id) {
                device.set_valid(false);
                debug!("device #{} excluded by allow-list", id);
            }
            devices.push(device);
        }
        let enabled = devices.iter().filter(|d| d.is_valid()).count();
        info!(
            "{} devices ({} enabled), algorithm {}",
            devices.len(),
            enabled,
            algorithm.name()
        );

        let source: Arc<dyn WorkSource> = match (&self.config.pool, &self.config.node) {
            (Some(pool), _) => {
                let client = PoolClient::new(&pool.url, &pool.wallet, &pool.worker)?;
                Arc::new(PoolSource::new(client, algorithm))
            }
            (None, Some(node)) => Arc::new(SoloSource::new(
                NodeRpcClient::new(&node.url)?,
                algorithm,
                &node.miner_address,
                &node.coinbase_tag,
            )),
            (None, None) => return Err(anyhow!("neither pool nor node configured")),
        };
        let mode = match source.mode() {
            SourceMode::Pool => "pool",
            SourceMode::Solo => "solo",
        };
        info!("{} miner start", mode);

        // Transient connect failures are not fatal; poll_work retries.
        if let Err(e) = source.connect().await {
            warn!("work source connect failed, will keep retrying: {}", e);
        }

        let mut handles = Vec::new();

        // One blocking search task per device, uniform even for invalid
        // devices so shutdown drains everything the same way.
        for device in &devices {
            let ctx = DeviceContext {
                device: Arc::clone(device),
                board: Arc::clone(&board),
                submit_tx: submit_tx.clone(),
                quit: Arc::clone(&self.quit),
            };
            let device = Arc::clone(device);
            let mut miner = ctor(ctx);
            handles.push(tokio::task::spawn_blocking(move || {
                if let Err(e) = miner.init() {
                    // Init failure disables this device only.
                    warn!("device #{} init failed, marked invalid: {}", device.id, e);
                    device.set_valid(false);
                }
                miner.mine();
            }));
        }
        // The pipeline ends when the last device sender is gone.
        drop(submit_tx);

        for device in &devices {
            handles.push(tokio::spawn(run_device_status(
                Arc::clone(device),
                self.shutdown_tx.subscribe(),
            )));
        }

        handles.push(tokio::spawn(run_listener(
            Arc::clone(&source),
            Arc::clone(&board),
            self.shutdown_tx.subscribe(),
        )));

        handles.push(tokio::spawn(run_drain(
            Arc::clone(&source),
            submit_rx,
            Arc::clone(&counters),
            devices.clone(),
            Arc::clone(&totals),
            self.shutdown_tx.subscribe(),
        )));

        let stats_ctx = Arc::new(stats_http::StatsContext {
            devices: devices.clone(),
            counters: Arc::clone(&counters),
            totals: Arc::clone(&totals),
            source: Arc::clone(&source),
            started: Instant::now(),
        });

        handles.push(tokio::spawn(run_global_status(
            Arc::clone(&stats_ctx),
            Arc::clone(&board),
            self.config.stats.clone(),
            self.shutdown_tx.subscribe(),
        )));

        if let Some(listen) = self.config.stats.listen.clone() {
            handles.push(tokio::spawn(stats_http::serve(
                Arc::clone(&stats_ctx),
                listen,
                self.shutdown_tx.subscribe(),
            )));
        }

        // Block until every task has exited after the shutdown signal.
        futures::future::join_all(handles).await;
        info!("all tasks drained");
        Ok(())
    }
}

/// Per-device rate/status reporting.
async fn run_device_status(device: Arc<DeviceState>, mut shutdown: watch::Receiver<bool>) {
    let mut window = HashrateWindow::new(60);
    let mut last_hashes = device.hashes();
    let mut ticker = tokio::time::interval(DEVICE_STATUS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let hashes = device.hashes();
                window.push(Instant::now(), hashes - last_hashes);
                last_hashes = hashes;
                let rate = window.rate();
                device.set_rate(rate);
                if device.is_valid() && device.is_active() {
                    debug!(
                        "device #{}: {} ({} hashes total)",
                        device.id,
                        fmt_hashrate(rate),
                        hashes
                    );
                }
            }
        }
    }
}

/// 30-second global counter snapshot. Pool-side counters win in pool
/// mode; nothing is logged before the first work arrives.
async fn run_global_status(
    ctx: Arc<stats_http::StatsContext>,
    board: Arc<WorkBoard>,
    stats_cfg: crate::config::StatsConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(stats_cfg.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if board.generation() == 0 {
                    continue;
                }
                let shares = ctx
                    .source
                    .pool_counters()
                    .unwrap_or_else(|| ctx.counters.snapshot());
                info!(
                    "global stats: accepted: {}, stale: {}, rejected: {}, total: {}",
                    shares.valid,
                    shares.stale,
                    shares.invalid,
                    shares.total(),
                );
                if let Some(path) = &stats_cfg.file {
                    stats::write_stats_file(path, &ctx.payload());
                }
            }
        }
    }
}
