/// Orchestration suite: submission classification, counter
/// conservation, work supersession and search-loop behavior, exercised
/// through the same task plumbing the engine wires up.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use num_bigint::BigUint;
use tokio::sync::{mpsc, watch, Mutex};

use meridian_miner::error::SubmitError;
use meridian_miner::miner::stats::{DeviceState, ShareCounters, ShareSnapshot};
use meridian_miner::miner::{miner_ctor, Algorithm, DeviceContext};
use meridian_miner::source::{SourceMode, WorkSource};
use meridian_miner::submit::{run_drain, CandidateSubmission, SoloTotals, SubmissionPayload};
use meridian_miner::work::{SoloWork, TemplateTx, Work, WorkBoard, HEADER_LEN};

// ═══════════════════════════════════════════════════════════════════════
// Scripted work source
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone, Copy)]
enum Verdict {
    Valid,
    StaleWork,
    SameWork,
    Rejected,
    Connection,
}

/// Work source double: replays a script of verdicts and counts every
/// network submission it receives.
struct MockSource {
    mode: SourceMode,
    calls: AtomicU64,
    script: Mutex<VecDeque<Verdict>>,
    current_job: Option<String>,
    last_payload: std::sync::Mutex<Option<SubmissionPayload>>,
}

impl MockSource {
    fn new(mode: SourceMode, script: Vec<Verdict>) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicU64::new(0),
            script: Mutex::new(script.into()),
            current_job: None,
            last_payload: std::sync::Mutex::new(None),
        })
    }

    fn with_current_job(mode: SourceMode, job: &str) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicU64::new(0),
            script: Mutex::new(VecDeque::new()),
            current_job: Some(job.to_string()),
            last_payload: std::sync::Mutex::new(None),
        })
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WorkSource for MockSource {
    fn mode(&self) -> SourceMode {
        self.mode
    }

    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn poll_work(&self) -> anyhow::Result<Option<Work>> {
        Ok(None)
    }

    async fn submit(&self, payload: &SubmissionPayload) -> Result<(), SubmitError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        *self.last_payload.lock().unwrap() = Some(payload.clone());

        // Mirror of the pool client's rule: a submission for anything
        // but the current job is stale.
        if let (Some(current), SubmissionPayload::Pool { job_id, .. }) =
            (&self.current_job, payload)
        {
            if job_id != current {
                return Err(SubmitError::StaleWork(job_id.clone()));
            }
            return Ok(());
        }

        let verdict = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Verdict::Valid);
        match verdict {
            Verdict::Valid => Ok(()),
            Verdict::StaleWork => Err(SubmitError::StaleWork("scripted".into())),
            Verdict::SameWork => Err(SubmitError::SameWork),
            Verdict::Rejected => Err(SubmitError::Rejected("scripted".into())),
            Verdict::Connection => Err(SubmitError::Connection("scripted".into())),
        }
    }

    fn pool_counters(&self) -> Option<ShareSnapshot> {
        None
    }
}

fn pipeline(
    source: Arc<MockSource>,
) -> (
    mpsc::Sender<CandidateSubmission>,
    tokio::task::JoinHandle<()>,
    Arc<ShareCounters>,
    Arc<SoloTotals>,
    Vec<Arc<DeviceState>>,
    watch::Sender<bool>,
) {
    let counters = Arc::new(ShareCounters::new());
    let totals = Arc::new(SoloTotals::new());
    let devices = vec![Arc::new(DeviceState::new(0, Algorithm::Blake2bD))];
    let (tx, rx) = mpsc::channel(512);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain = tokio::spawn(run_drain(
        source,
        rx,
        Arc::clone(&counters),
        devices.clone(),
        Arc::clone(&totals),
        shutdown_rx,
    ));
    (tx, drain, counters, totals, devices, shutdown_tx)
}

fn solo_submission(device_id: usize, nonce: u32, height: u64) -> CandidateSubmission {
    CandidateSubmission {
        device_id,
        nonce,
        payload: SubmissionPayload::Solo {
            block_hex: format!("{}{:08x}", "00".repeat(HEADER_LEN - 4), nonce),
            tx_count: 2,
            height,
        },
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 1. Classification table and counter conservation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_concurrent_submissions_conserve_counters() {
    // 100 networked submissions: 30 valid, 20 stale-work, 10 same-work,
    // 25 rejected, 15 transport errors. Plus 10 keep-alives that never
    // reach the source.
    let mut script = Vec::new();
    script.extend(std::iter::repeat(Verdict::Valid).take(30));
    script.extend(std::iter::repeat(Verdict::StaleWork).take(20));
    script.extend(std::iter::repeat(Verdict::SameWork).take(10));
    script.extend(std::iter::repeat(Verdict::Rejected).take(25));
    script.extend(std::iter::repeat(Verdict::Connection).take(15));

    let source = MockSource::new(SourceMode::Solo, script);
    let (tx, drain, counters, _totals, devices, _shutdown) = pipeline(Arc::clone(&source));

    let mut producers = Vec::new();
    for p in 0..4 {
        let tx = tx.clone();
        producers.push(tokio::spawn(async move {
            for n in 0..25u32 {
                tx.send(solo_submission(0, p * 100 + n, 100)).await.unwrap();
            }
        }));
    }
    // Keep-alive producer.
    {
        let tx = tx.clone();
        producers.push(tokio::spawn(async move {
            for _ in 0..10 {
                tx.send(CandidateSubmission {
                    device_id: 0,
                    nonce: 0,
                    payload: SubmissionPayload::KeepAlive,
                })
                .await
                .unwrap();
            }
        }));
    }
    for p in producers {
        p.await.unwrap();
    }
    drop(tx);
    drain.await.unwrap();

    let shares = counters.snapshot();
    // Exactly one bucket per submission, no lost updates.
    assert_eq!(shares.total(), 110);
    assert_eq!(shares.valid, 30);
    assert_eq!(shares.stale, 20 + 10 + 10); // stale-work + same-work + keep-alives
    assert_eq!(shares.invalid, 25 + 15); // rejected + transport
    assert_eq!(source.calls(), 100);

    let dev = devices[0].snapshot();
    assert_eq!(dev.accepted + dev.stale + dev.rejected, 110);
}

#[tokio::test]
async fn test_blank_submission_never_touches_network() {
    let source = MockSource::new(SourceMode::Pool, vec![]);
    let (tx, drain, counters, _totals, _devices, _shutdown) = pipeline(Arc::clone(&source));

    tx.send(CandidateSubmission {
        device_id: 0,
        nonce: 0,
        payload: SubmissionPayload::KeepAlive,
    })
    .await
    .unwrap();
    drop(tx);
    drain.await.unwrap();

    assert_eq!(source.calls(), 0);
    let shares = counters.snapshot();
    assert_eq!(shares.stale, 1);
    assert_eq!(shares.total(), 1);
}

// ═══════════════════════════════════════════════════════════════════════
// 2. Supersession scenario
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_late_submission_for_superseded_job_is_stale() {
    // job-7 was replaced by job-8 before the in-flight search finished;
    // the late job-7 share is stale even though its hash was good.
    let source = MockSource::with_current_job(SourceMode::Pool, "job-8");
    let (tx, drain, counters, _totals, _devices, _shutdown) = pipeline(Arc::clone(&source));

    tx.send(CandidateSubmission {
        device_id: 0,
        nonce: 42,
        payload: SubmissionPayload::Pool {
            block_hex: "00".repeat(HEADER_LEN),
            job_id: "job-7".into(),
            extranonce2: "00000000".into(),
        },
    })
    .await
    .unwrap();
    drop(tx);
    drain.await.unwrap();

    let shares = counters.snapshot();
    assert_eq!(shares.stale, 1);
    assert_eq!(shares.valid, 0);
}

// ═══════════════════════════════════════════════════════════════════════
// 3. Search task against the board, end to end
// ═══════════════════════════════════════════════════════════════════════

fn solo_work(height: u64, target: BigUint) -> Work {
    Work {
        generation: 0,
        algorithm: Algorithm::Blake2bD,
        job_id: format!("height-{}", height),
        template: vec![0u8; HEADER_LEN],
        target,
        height,
        pool: None,
        solo: Some(SoloWork {
            miner_address: "MrdTestAddress".into(),
            coinbase_tag: "meridian-miner".into(),
            parents: vec!["cafe".into()],
            transactions: vec![
                TemplateTx {
                    hash: "11".repeat(32),
                    data: "dead".into(),
                },
                TemplateTx {
                    hash: "22".repeat(32),
                    data: "beef".into(),
                },
            ],
        }),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_found_solo_block_updates_counters_and_tx_total() {
    let source = MockSource::new(SourceMode::Solo, vec![]);
    let counters = Arc::new(ShareCounters::new());
    let totals = Arc::new(SoloTotals::new());
    let board = Arc::new(WorkBoard::new());
    let device = Arc::new(DeviceState::new(0, Algorithm::Blake2bD));
    let quit = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let drain = tokio::spawn(run_drain(
        Arc::clone(&source) as Arc<dyn WorkSource>,
        rx,
        Arc::clone(&counters),
        vec![Arc::clone(&device)],
        Arc::clone(&totals),
        shutdown_rx,
    ));

    // All-ones target: the first nonce already satisfies it.
    board.publish(solo_work(100, BigUint::from_bytes_be(&[0xff; 32])));

    let ctor = miner_ctor(Algorithm::Blake2bD).unwrap();
    let ctx = DeviceContext {
        device: Arc::clone(&device),
        board: Arc::clone(&board),
        submit_tx: tx,
        quit: Arc::clone(&quit),
    };
    let search = tokio::task::spawn_blocking(move || {
        let mut miner = ctor(ctx);
        miner.init().unwrap();
        miner.mine();
    });

    // Let it find at least one block, then drain everything.
    let deadline = Instant::now() + Duration::from_secs(5);
    while counters.snapshot().valid == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    quit.store(true, Ordering::Relaxed);
    search.await.unwrap();
    drop(shutdown_tx);
    drain.await.unwrap();

    let shares = counters.snapshot();
    assert!(shares.valid >= 1, "expected at least one valid block");
    assert_eq!(shares.invalid, 0);

    // Each accepted block carried 2 transactions.
    assert_eq!(totals.blocks(), shares.valid);
    assert_eq!(totals.transactions(), shares.valid * 2);

    // The submission referenced the height it was found under and
    // framed the parent/transaction lists behind the header.
    let last = source.last_payload.lock().unwrap().clone().unwrap();
    match last {
        SubmissionPayload::Solo {
            block_hex,
            tx_count,
            height,
        } => {
            assert_eq!(height, 100);
            assert_eq!(tx_count, 2);
            assert!(block_hex.len() > HEADER_LEN * 2);
            let tail = &block_hex[HEADER_LEN * 2..];
            // varint(1 parent) + parent + varint(2 txs) + tx data
            assert_eq!(tail, format!("01{}02{}{}", "cafe", "dead", "beef"));
        }
        other => panic!("expected solo payload, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_device_abandons_superseded_generation() {
    let board = Arc::new(WorkBoard::new());
    let device = Arc::new(DeviceState::new(0, Algorithm::Blake2bD));
    let quit = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel(64);

    // Generation 1: unsatisfiable target, the device grinds forever.
    board.publish(solo_work(100, BigUint::from(0u32)));

    let ctor = miner_ctor(Algorithm::Blake2bD).unwrap();
    let ctx = DeviceContext {
        device: Arc::clone(&device),
        board: Arc::clone(&board),
        submit_tx: tx,
        quit: Arc::clone(&quit),
    };
    let search = tokio::task::spawn_blocking(move || {
        ctor(ctx).mine();
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(device.hashes() > 0 || device.is_active());

    // Generation 2 supersedes: every emission from now on must
    // reference the new work, never the abandoned one.
    board.publish(solo_work(101, BigUint::from_bytes_be(&[0xff; 32])));

    let sub = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("candidate expected")
        .expect("channel open");
    match sub.payload {
        SubmissionPayload::Solo { height, .. } => assert_eq!(height, 101),
        other => panic!("expected solo payload, got {:?}", other),
    }

    quit.store(true, Ordering::Relaxed);
    search.await.unwrap();
}
