//! Candidate submissions, their exact wire encoding and the drain
//! pipeline that classifies outcomes into the global share buckets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, watch};

use crate::error::ShareResult;
use crate::miner::algos;
use crate::miner::stats::{DeviceState, ShareCounters};
use crate::source::{SourceMode, WorkSource};

/// Emitted exactly once by a device search task on success, consumed
/// exactly once by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSubmission {
    pub device_id: usize,
    pub nonce: u32,
    pub payload: SubmissionPayload,
}

/// Mode-specific submission body. The wire string is
/// `hex(header+proof)` followed by `-<jobID>-<extranonce2>` (pool) or,
/// with the varint-framed parent/transaction lists already inside the
/// block hex, `-<txCount>-<height>` (solo). A blank string is the
/// keep-alive no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionPayload {
    KeepAlive,
    Pool {
        block_hex: String,
        job_id: String,
        extranonce2: String,
    },
    Solo {
        block_hex: String,
        tx_count: u64,
        height: u64,
    },
}

impl SubmissionPayload {
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, SubmissionPayload::KeepAlive)
    }

    pub fn block_hex(&self) -> Option<&str> {
        match self {
            SubmissionPayload::KeepAlive => None,
            SubmissionPayload::Pool { block_hex, .. } => Some(block_hex),
            SubmissionPayload::Solo { block_hex, .. } => Some(block_hex),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            SubmissionPayload::KeepAlive => String::new(),
            SubmissionPayload::Pool {
                block_hex,
                job_id,
                extranonce2,
            } => format!("{}-{}-{}", block_hex, job_id, extranonce2),
            SubmissionPayload::Solo {
                block_hex,
                tx_count,
                height,
            } => format!("{}-{}-{}", block_hex, tx_count, height),
        }
    }

    /// Inverse of `encode` for the given mode. Pool job ids may contain
    /// dashes; the block hex never does and the extranonce2 is the final
    /// field, so the first and last separators are authoritative.
    pub fn parse(mode: SourceMode, s: &str) -> Result<Self> {
        if s.is_empty() {
            return Ok(SubmissionPayload::KeepAlive);
        }
        match mode {
            SourceMode::Pool => {
                let (block_hex, rest) = s
                    .split_once('-')
                    .ok_or_else(|| anyhow!("pool submission missing job id: {}", s))?;
                let (job_id, extranonce2) = rest
                    .rsplit_once('-')
                    .ok_or_else(|| anyhow!("pool submission missing extranonce2: {}", s))?;
                if block_hex.is_empty() || job_id.is_empty() || extranonce2.is_empty() {
                    return Err(anyhow!("malformed pool submission: {}", s));
                }
                Ok(SubmissionPayload::Pool {
                    block_hex: block_hex.to_string(),
                    job_id: job_id.to_string(),
                    extranonce2: extranonce2.to_string(),
                })
            }
            SourceMode::Solo => {
                let (rest, height) = s
                    .rsplit_once('-')
                    .ok_or_else(|| anyhow!("solo submission missing height: {}", s))?;
                let (block_hex, tx_count) = rest
                    .rsplit_once('-')
                    .ok_or_else(|| anyhow!("solo submission missing tx count: {}", s))?;
                if block_hex.is_empty() {
                    return Err(anyhow!("malformed solo submission: {}", s));
                }
                Ok(SubmissionPayload::Solo {
                    block_hex: block_hex.to_string(),
                    tx_count: tx_count.parse()?,
                    height: height.parse()?,
                })
            }
        }
    }
}

/// Running totals only solo mode feeds: transactions folded into
/// accepted blocks (coinbase excluded) and the block count itself.
#[derive(Debug, Default)]
pub struct SoloTotals {
    transactions: AtomicU64,
    blocks: AtomicU64,
}

impl SoloTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&self, tx_count: u64) -> u64 {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.transactions.fetch_add(tx_count, Ordering::Relaxed) + tx_count
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

/// Drain loop: dequeue candidates from every device, hand them to the
/// work source and fold the outcome into exactly one bucket.
///
/// Keep-alives never touch the network. Classification:
/// stale/same work -> Stale, any other error -> Invalid, success -> Valid.
pub async fn run_drain(
    source: Arc<dyn WorkSource>,
    mut rx: mpsc::Receiver<CandidateSubmission>,
    counters: Arc<ShareCounters>,
    devices: Vec<Arc<DeviceState>>,
    totals: Arc<SoloTotals>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("submission pipeline started");
    loop {
        let sub = tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            sub = rx.recv() => match sub {
                Some(sub) => sub,
                None => break,
            },
        };

        let result = if sub.payload.is_keep_alive() {
            ShareResult::Stale
        } else {
            match source.submit(&sub.payload).await {
                Ok(()) => ShareResult::Valid,
                Err(e) => {
                    log::debug!("device #{} submit failed: {}", sub.device_id, e);
                    e.classify()
                }
            }
        };

        counters.record(result);
        if let Some(dev) = devices.get(sub.device_id) {
            dev.record_share(result);
        }

        if result == ShareResult::Valid {
            report_valid(&sub, &totals);
        }
    }
    log::info!("submission pipeline stopped");
}

fn report_valid(sub: &CandidateSubmission, totals: &SoloTotals) {
    if let Some(block_hex) = sub.payload.block_hex() {
        if let Ok(bytes) = hex::decode(block_hex) {
            let shown = bytes.len().min(crate::work::HEADER_LEN);
            log::info!(
                "[found hash and submit] {}",
                hex::encode(algos::blake2bd(&bytes[..shown]))
            );
        }
    }
    if let SubmissionPayload::Solo {
        tx_count, height, ..
    } = &sub.payload
    {
        let total = totals.add_block(*tx_count);
        log::info!(
            "{}, receive block, block height = {}, including {} transactions (not counting coinbase); received total transactions = {}",
            chrono::Local::now().format("%Y-%m-%d %I:%M:%S %p"),
            height,
            tx_count,
            total,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_wire_round_trip() {
        let payload = SubmissionPayload::Pool {
            block_hex: "00ff".repeat(44),
            job_id: "job-7-b".into(),
            extranonce2: "0000002a".into(),
        };
        let wire = payload.encode();
        assert_eq!(SubmissionPayload::parse(SourceMode::Pool, &wire).unwrap(), payload);
    }

    #[test]
    fn test_solo_wire_round_trip() {
        let payload = SubmissionPayload::Solo {
            block_hex: format!("{}01{}", "ab".repeat(88), "cd".repeat(40)),
            tx_count: 3,
            height: 100,
        };
        let wire = payload.encode();
        assert!(wire.ends_with("-3-100"));
        assert_eq!(SubmissionPayload::parse(SourceMode::Solo, &wire).unwrap(), payload);
    }

    #[test]
    fn test_blank_is_keep_alive() {
        for mode in [SourceMode::Pool, SourceMode::Solo] {
            assert_eq!(
                SubmissionPayload::parse(mode, "").unwrap(),
                SubmissionPayload::KeepAlive
            );
        }
        assert_eq!(SubmissionPayload::KeepAlive.encode(), "");
    }

    #[test]
    fn test_malformed_wire_rejected() {
        assert!(SubmissionPayload::parse(SourceMode::Pool, "deadbeef").is_err());
        assert!(SubmissionPayload::parse(SourceMode::Pool, "deadbeef-job").is_err());
        assert!(SubmissionPayload::parse(SourceMode::Solo, "deadbeef-x-100").is_err());
        assert!(SubmissionPayload::parse(SourceMode::Solo, "-3-100").is_err());
    }

    #[test]
    fn test_solo_totals() {
        let totals = SoloTotals::new();
        assert_eq!(totals.add_block(5), 5);
        assert_eq!(totals.add_block(2), 7);
        assert_eq!(totals.blocks(), 2);
        assert_eq!(totals.transactions(), 7);
    }
}
