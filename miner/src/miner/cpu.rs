//! CPU device search task.
//!
//! The hot loop never blocks: between hash attempts it only polls the
//! quit flag and the board generation (two atomic loads), which bounds
//! both abort latency and throughput loss. Work refresh rebuilds the
//! header outside the per-hash path.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, error};

use crate::miner::stats::DeviceSnapshot;
use crate::miner::{DeviceContext, DeviceMiner, HashFn};
use crate::submit::{CandidateSubmission, SubmissionPayload};
use crate::work::{
    meets_target, varint_hex, Work, EXTRANONCE1_RANGE, EXTRANONCE2_RANGE, HEADER_LEN, NONCE_RANGE,
    TX_ROOT_RANGE,
};

const IDLE_WAIT: Duration = Duration::from_millis(200);
const STATS_FLUSH_EVERY: u64 = 2048;

pub struct CpuMiner {
    ctx: DeviceContext,
    hash: HashFn,
    header: [u8; HEADER_LEN],
    work: Option<Arc<Work>>,
    /// Local search-space instance, bumped on nonce exhaustion.
    instance: u32,
    extranonce2: u32,
}

impl CpuMiner {
    pub fn new(ctx: DeviceContext, hash: HashFn) -> Self {
        Self {
            ctx,
            hash,
            header: [0u8; HEADER_LEN],
            work: None,
            instance: 0,
            extranonce2: 0,
        }
    }

    /// Device-unique extranonce2: device id in the top byte keeps the
    /// per-device search spaces disjoint across instances.
    fn next_extranonce2(&self) -> u32 {
        ((self.ctx.device.id as u32) << 24) | (self.instance & 0x00ff_ffff)
    }

    fn candidate(&self, work: &Work, nonce: u32) -> CandidateSubmission {
        let payload = match (&work.pool, &work.solo) {
            (Some(_), _) => SubmissionPayload::Pool {
                block_hex: hex::encode(self.header),
                job_id: work.job_id.clone(),
                extranonce2: format!("{:08x}", self.extranonce2),
            },
            (None, Some(solo)) => {
                let mut block_hex = hex::encode(self.header);
                block_hex.push_str(&varint_hex(solo.parents.len() as u64));
                for parent in &solo.parents {
                    block_hex.push_str(parent);
                }
                block_hex.push_str(&varint_hex(solo.tx_count()));
                for tx in &solo.transactions {
                    block_hex.push_str(&tx.data);
                }
                SubmissionPayload::Solo {
                    block_hex,
                    tx_count: solo.tx_count(),
                    height: work.height,
                }
            }
            (None, None) => SubmissionPayload::KeepAlive,
        };
        CandidateSubmission {
            device_id: self.ctx.device.id,
            nonce,
            payload,
        }
    }
}

impl DeviceMiner for CpuMiner {
    fn init(&mut self) -> Result<()> {
        debug!(
            "device #{}: cpu miner ready, algorithm {}",
            self.ctx.device.id,
            self.ctx.device.algorithm.name()
        );
        Ok(())
    }

    /// Rebuild the header from the current work and instance. Pool work
    /// gets a fresh extranonce2; solo work gets a recomputed coinbase
    /// and transaction root.
    fn update(&mut self) -> Result<()> {
        let Some(work) = self.work.clone() else {
            return Ok(());
        };
        self.header.copy_from_slice(&work.template);

        if let Some(pool) = &work.pool {
            let n = pool.extranonce1.len().min(EXTRANONCE1_RANGE.len());
            self.header[EXTRANONCE1_RANGE][..n].copy_from_slice(&pool.extranonce1[..n]);
            self.extranonce2 = self.next_extranonce2();
            self.header[EXTRANONCE2_RANGE].copy_from_slice(&self.extranonce2.to_be_bytes());
        } else if let Some(solo) = &work.solo {
            let root = solo.tx_root(self.ctx.device.id, self.instance)?;
            self.header[TX_ROOT_RANGE].copy_from_slice(&root);
        }
        Ok(())
    }

    fn mine(&mut self) {
        let quit = Arc::clone(&self.ctx.quit);
        let device = Arc::clone(&self.ctx.device);

        if !device.is_valid() {
            // Excluded by the allow-list: no searching, but keep
            // observing the quit signal so shutdown stays uniform.
            while !quit.load(Ordering::Relaxed) {
                std::thread::sleep(IDLE_WAIT);
            }
            debug!("device #{} (invalid) stopped", device.id);
            return;
        }

        let mut generation = 0u64;
        let mut nonce: u32 = 0;
        let mut pending_hashes = 0u64;
        let mut last_flush = Instant::now();

        'refresh: loop {
            if quit.load(Ordering::Relaxed) {
                break;
            }

            if self.work.is_none() || self.ctx.board.generation() != generation {
                let Some(work) = self.ctx.board.snapshot() else {
                    device.set_active(false);
                    std::thread::sleep(IDLE_WAIT);
                    continue;
                };
                // Trust the generation inside the snapshot, not a
                // separately-read counter.
                generation = work.generation;
                if !work.is_minable() {
                    self.work = None;
                    device.set_active(false);
                    std::thread::sleep(IDLE_WAIT);
                    continue;
                }
                debug!(
                    "device #{}: new work job={} generation={}",
                    device.id, work.job_id, generation
                );
                self.work = Some(work);
                self.instance = 0;
                nonce = 0;
                if let Err(e) = self.update() {
                    error!(
                        "device #{}: header construction failed, task stops: {}",
                        device.id, e
                    );
                    device.set_active(false);
                    return;
                }
                device.set_active(true);
            }

            let Some(work) = self.work.clone() else {
                continue;
            };

            loop {
                if quit.load(Ordering::Relaxed) {
                    break 'refresh;
                }
                if self.ctx.board.generation() != generation {
                    // Superseded: abandon the in-flight range.
                    continue 'refresh;
                }

                self.header[NONCE_RANGE].copy_from_slice(&nonce.to_le_bytes());
                let digest = (self.hash)(&self.header);
                pending_hashes += 1;

                if meets_target(&digest, &work.target) {
                    debug!(
                        "device #{} found hash: {} nonce={} job={}",
                        device.id,
                        hex::encode(digest),
                        nonce,
                        work.job_id
                    );
                    // Best effort: a full queue must not stall hashing.
                    let _ = self.ctx.submit_tx.try_send(self.candidate(&work, nonce));
                }

                if pending_hashes >= STATS_FLUSH_EVERY
                    || last_flush.elapsed() >= Duration::from_secs(1)
                {
                    device.add_hashes(pending_hashes);
                    pending_hashes = 0;
                    last_flush = Instant::now();
                }

                nonce = match nonce.checked_add(1) {
                    Some(n) => n,
                    None => {
                        // Nonce space exhausted: rebuild the search space
                        // locally instead of wrapping or going idle.
                        self.instance = self.instance.wrapping_add(1);
                        debug!(
                            "device #{}: nonce space exhausted, new instance {}",
                            device.id, self.instance
                        );
                        if let Err(e) = self.update() {
                            error!(
                                "device #{}: header construction failed, task stops: {}",
                                device.id, e
                            );
                            device.set_active(false);
                            return;
                        }
                        0
                    }
                };
            }
        }

        if pending_hashes > 0 {
            device.add_hashes(pending_hashes);
        }
        device.set_active(false);
        debug!("device #{} stopped", device.id);
    }

    fn status(&self) -> DeviceSnapshot {
        self.ctx.device.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::miner::stats::DeviceState;
    use crate::miner::{algos, Algorithm};
    use crate::work::{PoolWork, WorkBoard};
    use num_bigint::BigUint;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn test_ctx(
        device: Arc<DeviceState>,
        board: Arc<WorkBoard>,
        quit: Arc<AtomicBool>,
    ) -> (DeviceContext, mpsc::Receiver<CandidateSubmission>) {
        let (tx, rx) = mpsc::channel(64);
        (
            DeviceContext {
                device,
                board,
                submit_tx: tx,
                quit,
            },
            rx,
        )
    }

    fn easy_pool_work(job_id: &str) -> Work {
        Work {
            generation: 0,
            algorithm: Algorithm::Blake2bD,
            job_id: job_id.to_string(),
            template: vec![0u8; HEADER_LEN],
            // Every digest satisfies the all-ones target.
            target: BigUint::from_bytes_be(&[0xff; 32]),
            height: 100,
            pool: Some(PoolWork {
                extranonce1: vec![0xaa, 0xbb, 0xcc, 0xdd],
                extranonce2_size: 4,
            }),
            solo: None,
        }
    }

    #[test]
    fn test_finds_candidate_within_bounded_iterations() {
        let device = Arc::new(DeviceState::new(0, Algorithm::Blake2bD));
        let board = Arc::new(WorkBoard::new());
        let quit = Arc::new(AtomicBool::new(false));
        let (ctx, mut rx) = test_ctx(Arc::clone(&device), Arc::clone(&board), Arc::clone(&quit));

        board.publish(easy_pool_work("job-7"));

        let handle = std::thread::spawn(move || {
            let mut miner = CpuMiner::new(ctx, algos::blake2bd);
            miner.init().unwrap();
            miner.mine();
        });

        // With an all-ones target the very first nonce must hit.
        let sub = rx.blocking_recv().expect("candidate expected");
        assert_eq!(sub.nonce, 0);
        match &sub.payload {
            SubmissionPayload::Pool {
                job_id,
                extranonce2,
                block_hex,
            } => {
                assert_eq!(job_id, "job-7");
                // Device 0, instance 0.
                assert_eq!(extranonce2, "00000000");
                let bytes = hex::decode(block_hex).unwrap();
                assert_eq!(bytes.len(), HEADER_LEN);
                // Extranonce1 was woven into its slot.
                assert_eq!(&bytes[EXTRANONCE1_RANGE], &[0xaa, 0xbb, 0xcc, 0xdd]);
            }
            other => panic!("expected pool payload, got {:?}", other),
        }

        quit.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_cancellation_terminates_mid_search() {
        let device = Arc::new(DeviceState::new(1, Algorithm::Blake2bD));
        let board = Arc::new(WorkBoard::new());
        let quit = Arc::new(AtomicBool::new(false));
        let (ctx, _rx) = test_ctx(Arc::clone(&device), Arc::clone(&board), Arc::clone(&quit));

        let mut work = easy_pool_work("job-7");
        // Impossible target: the loop would search forever.
        work.target = BigUint::from(0u32);
        board.publish(work);

        let handle = std::thread::spawn(move || {
            CpuMiner::new(ctx, algos::blake2bd).mine();
        });

        std::thread::sleep(Duration::from_millis(50));
        quit.store(true, Ordering::Relaxed);

        let started = Instant::now();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(device.hashes() > 0, "device should have been searching");
    }

    #[test]
    fn test_invalid_device_never_searches_but_observes_quit() {
        let device = Arc::new(DeviceState::new(2, Algorithm::Blake2bD));
        device.set_valid(false);
        let board = Arc::new(WorkBoard::new());
        let quit = Arc::new(AtomicBool::new(false));
        let (ctx, mut rx) = test_ctx(Arc::clone(&device), Arc::clone(&board), Arc::clone(&quit));

        board.publish(easy_pool_work("job-7"));

        let handle = std::thread::spawn(move || {
            CpuMiner::new(ctx, algos::blake2bd).mine();
        });

        std::thread::sleep(Duration::from_millis(100));
        quit.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        assert_eq!(device.hashes(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_non_minable_work_waits() {
        let device = Arc::new(DeviceState::new(3, Algorithm::Blake2bD));
        let board = Arc::new(WorkBoard::new());
        let quit = Arc::new(AtomicBool::new(false));
        let (ctx, mut rx) = test_ctx(Arc::clone(&device), Arc::clone(&board), Arc::clone(&quit));

        // No job data and no height: not minable.
        let mut work = easy_pool_work("");
        work.pool = None;
        work.height = 0;
        board.publish(work);

        let handle = std::thread::spawn(move || {
            CpuMiner::new(ctx, algos::blake2bd).mine();
        });

        std::thread::sleep(Duration::from_millis(150));
        quit.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        assert_eq!(device.hashes(), 0);
        assert!(rx.try_recv().is_err());
    }
}
