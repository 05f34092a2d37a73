//! The work source contract and its two variants.
//!
//! Pool and solo differ in how work arrives (pushed jobs vs polled
//! templates) and how submissions are judged, but the orchestration core
//! only ever sees this one surface. The variant is chosen once at
//! startup; no mode branches exist inside hot loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::time::Duration;

use crate::error::SubmitError;
use crate::miner::stats::ShareSnapshot;
use crate::miner::Algorithm;
use crate::rpc::NodeRpcClient;
use crate::stratum::{PoolClient, PoolJob};
use crate::submit::SubmissionPayload;
use crate::work::{
    diff_to_target, parse_target_hex, PoolWork, SoloWork, Work, WorkBoard, HEADER_LEN, NONCE_RANGE,
};

pub const SOLO_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Pool,
    Solo,
}

/// Capability contract over {fetch-or-receive work, submit, classify}.
/// Protocol failures are handled behind this surface; callers only see
/// "new work" or "no change".
#[async_trait]
pub trait WorkSource: Send + Sync {
    fn mode(&self) -> SourceMode;

    /// Establish the session. Failure is non-fatal; `poll_work` keeps
    /// retrying.
    async fn connect(&self) -> Result<()>;

    /// One wait step. `Ok(None)` means nothing new yet.
    async fn poll_work(&self) -> Result<Option<Work>>;

    async fn submit(&self, payload: &SubmissionPayload) -> Result<(), SubmitError>;

    /// Pool-side counters; authoritative when present.
    fn pool_counters(&self) -> Option<ShareSnapshot>;
}

/// Publishes every work a source yields onto the board until shutdown.
pub async fn run_listener(
    source: Arc<dyn WorkSource>,
    board: Arc<WorkBoard>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("listening for new work");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = source.poll_work() => match res {
                Ok(Some(work)) => {
                    let job = work.job_id.clone();
                    let gen = board.publish(work);
                    debug!("published work: job={} generation={}", job, gen);
                }
                Ok(None) => {}
                Err(e) => warn!("work source error: {}", e),
            }
        }
    }
    info!("work listener stopped");
}

fn nonce_from_block_hex(block_hex: &str) -> Result<u32, SubmitError> {
    let bytes = hex::decode(block_hex)
        .map_err(|e| SubmitError::Rejected(format!("bad block hex: {}", e)))?;
    if bytes.len() < HEADER_LEN {
        return Err(SubmitError::Rejected("block shorter than header".to_string()));
    }
    let mut nonce = [0u8; 4];
    nonce.copy_from_slice(&bytes[NONCE_RANGE]);
    Ok(u32::from_le_bytes(nonce))
}

// ─── Pool variant ──────────────────────────────────────────────────────

pub struct PoolSource {
    client: Arc<PoolClient>,
    algorithm: Algorithm,
    job_rx: Mutex<watch::Receiver<Option<PoolJob>>>,
}

impl PoolSource {
    pub fn new(client: Arc<PoolClient>, algorithm: Algorithm) -> Self {
        let job_rx = client.subscribe_jobs();
        Self {
            client,
            algorithm,
            job_rx: Mutex::new(job_rx),
        }
    }

    fn work_from_job(&self, job: PoolJob) -> Result<Work> {
        let template = hex::decode(&job.header)
            .map_err(|e| anyhow!("job {} has bad header hex: {}", job.job_id, e))?;
        if template.len() != HEADER_LEN {
            return Err(anyhow!(
                "job {} header is {} bytes, want {}",
                job.job_id,
                template.len(),
                HEADER_LEN
            ));
        }
        Ok(Work {
            generation: 0,
            algorithm: self.algorithm,
            job_id: job.job_id,
            template,
            target: diff_to_target(self.client.difficulty()),
            height: job.height,
            pool: Some(PoolWork {
                extranonce1: self.client.extranonce1(),
                extranonce2_size: self.client.extranonce2_size(),
            }),
            solo: None,
        })
    }
}

#[async_trait]
impl WorkSource for PoolSource {
    fn mode(&self) -> SourceMode {
        SourceMode::Pool
    }

    async fn connect(&self) -> Result<()> {
        self.client.connect_with_retry(5).await
    }

    async fn poll_work(&self) -> Result<Option<Work>> {
        if !self.client.is_ready() {
            // Transport dropped: reconnect with backoff, non-fatal.
            if let Err(e) = self.client.connect_with_retry(5).await {
                warn!("pool reconnect failed, will retry: {}", e);
            }
            return Ok(None);
        }

        let mut rx = self.job_rx.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), rx.changed()).await {
            // Timeout: wake up to re-check session liveness.
            Err(_) => Ok(None),
            Ok(Err(_)) => Ok(None),
            Ok(Ok(())) => {
                let job = rx.borrow_and_update().clone();
                drop(rx);
                match job {
                    Some(job) => Ok(Some(self.work_from_job(job)?)),
                    None => Ok(None),
                }
            }
        }
    }

    async fn submit(&self, payload: &SubmissionPayload) -> Result<(), SubmitError> {
        let SubmissionPayload::Pool {
            block_hex,
            job_id,
            extranonce2,
        } = payload
        else {
            return Err(SubmitError::Rejected(
                "pool source got non-pool submission".to_string(),
            ));
        };
        let nonce = nonce_from_block_hex(block_hex)?;
        self.client
            .submit(job_id, extranonce2, &format!("{:08x}", nonce))
            .await
    }

    fn pool_counters(&self) -> Option<ShareSnapshot> {
        Some(self.client.share_snapshot())
    }
}

// ─── Solo variant ──────────────────────────────────────────────────────

pub struct SoloSource {
    rpc: NodeRpcClient,
    algorithm: Algorithm,
    miner_address: String,
    coinbase_tag: String,
    poll_interval: Duration,
    last_template: std::sync::Mutex<Option<(u64, String)>>,
    current_height: AtomicU64,
    last_submitted: std::sync::Mutex<Option<String>>,
}

impl SoloSource {
    pub fn new(
        rpc: NodeRpcClient,
        algorithm: Algorithm,
        miner_address: &str,
        coinbase_tag: &str,
    ) -> Self {
        Self {
            rpc,
            algorithm,
            miner_address: miner_address.to_string(),
            coinbase_tag: coinbase_tag.to_string(),
            poll_interval: SOLO_POLL_INTERVAL,
            last_template: std::sync::Mutex::new(None),
            current_height: AtomicU64::new(0),
            last_submitted: std::sync::Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn set_current_height(&self, height: u64) {
        self.current_height.store(height, Ordering::Relaxed);
    }
}

#[async_trait]
impl WorkSource for SoloSource {
    fn mode(&self) -> SourceMode {
        SourceMode::Solo
    }

    async fn connect(&self) -> Result<()> {
        // First poll doubles as the health check; a dead node now is the
        // same non-fatal condition as a dead node later.
        match self.rpc.get_block_template(&self.miner_address).await {
            Ok(t) => {
                info!("node reachable, template height {}", t.height);
                Ok(())
            }
            Err(e) => {
                warn!("node not reachable yet: {}", e);
                Ok(())
            }
        }
    }

    async fn poll_work(&self) -> Result<Option<Work>> {
        tokio::time::sleep(self.poll_interval).await;

        let template = match self.rpc.get_block_template(&self.miner_address).await {
            Ok(t) => t,
            Err(e) => {
                warn!("getBlockTemplate failed: {}", e);
                return Ok(None);
            }
        };

        let fingerprint = template.fingerprint();
        {
            let mut last = self.last_template.lock().expect("template state poisoned");
            if last.as_ref() == Some(&fingerprint) {
                return Ok(None);
            }
            *last = Some(fingerprint);
        }
        self.current_height.store(template.height, Ordering::Relaxed);

        let header = hex::decode(&template.header)
            .map_err(|e| anyhow!("template header hex: {}", e))?;
        if header.len() != HEADER_LEN {
            return Err(anyhow!(
                "template header is {} bytes, want {}",
                header.len(),
                HEADER_LEN
            ));
        }
        Ok(Some(Work {
            generation: 0,
            algorithm: self.algorithm,
            job_id: format!("height-{}", template.height),
            template: header,
            target: parse_target_hex(&template.target)?,
            height: template.height,
            pool: None,
            solo: Some(SoloWork {
                miner_address: self.miner_address.clone(),
                coinbase_tag: self.coinbase_tag.clone(),
                parents: template.parents,
                transactions: template.transactions,
            }),
        }))
    }

    async fn submit(&self, payload: &SubmissionPayload) -> Result<(), SubmitError> {
        let SubmissionPayload::Solo {
            block_hex, height, ..
        } = payload
        else {
            return Err(SubmitError::Rejected(
                "solo source got non-solo submission".to_string(),
            ));
        };

        let current = self.current_height.load(Ordering::Relaxed);
        if *height < current {
            return Err(SubmitError::StaleWork(format!("height-{}", height)));
        }
        {
            let last = self.last_submitted.lock().expect("submit state poisoned");
            if last.as_deref() == Some(block_hex.as_str()) {
                return Err(SubmitError::SameWork);
            }
        }

        let accepted = self
            .rpc
            .submit_block(block_hex)
            .await
            .map_err(|e| SubmitError::Connection(e.to_string()))?;
        if !accepted {
            return Err(SubmitError::Rejected("node rejected block".to_string()));
        }
        *self.last_submitted.lock().expect("submit state poisoned") = Some(block_hex.clone());
        Ok(())
    }

    fn pool_counters(&self) -> Option<ShareSnapshot> {
        None
    }
}
