//! Pool protocol client.
//!
//! One persistent JSON-line TCP session per pool. The session walks
//! `Disconnected -> Connecting -> Subscribed -> Authorized -> Ready`;
//! in `Ready` the read loop turns `mining.notify` into jobs on a watch
//! channel and `mining.set_difficulty` into a retarget for subsequent
//! jobs, leaving the assigned extranonce untouched. Transport loss drops
//! the session back to `Disconnected`; reconnecting is the caller's
//! non-fatal, backed-off loop.

mod messages;

pub use messages::{PoolJob, StratumRequest, StratumResponse};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{timeout, Duration};

use crate::error::SubmitError;
use crate::miner::stats::ShareSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Subscribed = 2,
    Authorized = 3,
    Ready = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Connecting,
            2 => SessionState::Subscribed,
            3 => SessionState::Authorized,
            4 => SessionState::Ready,
            _ => SessionState::Disconnected,
        }
    }
}

/// Pool-side share outcome counters, kept inside the client because the
/// pool's accept/reject verdicts are authoritative in pool mode.
#[derive(Debug, Default)]
struct PoolCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
}

pub struct PoolClient {
    url: String,
    wallet: String,
    worker: String,
    state: AtomicU8,
    writer: Mutex<Option<OwnedWriteHalf>>,
    extranonce1: std::sync::Mutex<Vec<u8>>,
    extranonce2_size: AtomicUsize,
    // Difficulty in f64 bits; updated by the read loop, read when a job
    // is turned into work.
    difficulty_bits: AtomicU64,
    job_tx: watch::Sender<Option<PoolJob>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<StratumResponse>>>,
    next_id: AtomicU64,
    // Session epoch: a read loop from a torn-down session must not
    // flip the state of its successor back to Disconnected.
    epoch: AtomicU64,
    counters: PoolCounters,
}

impl PoolClient {
    pub fn new(pool_url: &str, wallet: &str, worker: &str) -> Result<Arc<Self>> {
        // Accept either `stratum+tcp://host:port` or bare `host:port`.
        let url = pool_url
            .strip_prefix("stratum+tcp://")
            .or_else(|| pool_url.strip_prefix("tcp://"))
            .unwrap_or(pool_url)
            .trim();
        if url.is_empty() || !url.contains(':') {
            return Err(anyhow!(
                "invalid pool URL, expected host:port or stratum+tcp://host:port"
            ));
        }

        let (job_tx, _) = watch::channel(None);

        Ok(Arc::new(Self {
            url: url.to_string(),
            wallet: wallet.to_string(),
            worker: worker.to_string(),
            state: AtomicU8::new(SessionState::Disconnected as u8),
            writer: Mutex::new(None),
            extranonce1: std::sync::Mutex::new(Vec::new()),
            extranonce2_size: AtomicUsize::new(4),
            difficulty_bits: AtomicU64::new(1.0f64.to_bits()),
            job_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            counters: PoolCounters::default(),
        }))
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn difficulty(&self) -> f64 {
        f64::from_bits(self.difficulty_bits.load(Ordering::Relaxed))
    }

    pub fn extranonce1(&self) -> Vec<u8> {
        self.extranonce1.lock().expect("extranonce poisoned").clone()
    }

    pub fn extranonce2_size(&self) -> usize {
        self.extranonce2_size.load(Ordering::Relaxed)
    }

    pub fn subscribe_jobs(&self) -> watch::Receiver<Option<PoolJob>> {
        self.job_tx.subscribe()
    }

    pub fn current_job_id(&self) -> Option<String> {
        self.job_tx.borrow().as_ref().map(|j| j.job_id.clone())
    }

    pub fn share_snapshot(&self) -> ShareSnapshot {
        ShareSnapshot {
            valid: self.counters.accepted.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            invalid: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Full session establishment: TCP, reader, subscribe, authorize.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.set_state(SessionState::Connecting);
        debug!("connecting to pool {}", self.url);

        let stream = match timeout(Duration::from_secs(15), TcpStream::connect(&self.url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(SessionState::Disconnected);
                return Err(anyhow!("connect {}: {}", self.url, e));
            }
            Err(_) => {
                self.set_state(SessionState::Disconnected);
                return Err(anyhow!("connection timeout"));
            }
        };

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;

        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = client.clone().read_loop(read_half).await {
                debug!("pool read loop ended: {}", e);
            }
            if client.epoch.load(Ordering::Acquire) == epoch {
                client.set_state(SessionState::Disconnected);
            }
        });

        self.subscribe().await?;
        self.set_state(SessionState::Subscribed);

        self.authorize().await?;
        self.set_state(SessionState::Authorized);

        self.set_state(SessionState::Ready);
        info!("pool session ready ({})", self.url);
        Ok(())
    }

    /// Reconnect after transport loss, clearing per-session state.
    /// Never fatal: retries with exponential backoff up to `max_attempts`.
    pub async fn connect_with_retry(self: &Arc<Self>, max_attempts: u32) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.reconnect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(anyhow!(
                            "failed to connect after {} attempts: {}",
                            max_attempts,
                            e
                        ));
                    }
                    let delay = std::cmp::min(2u64.pow(attempt), 30);
                    warn!(
                        "pool connection attempt {}/{} failed: {} - retrying in {}s",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.set_state(SessionState::Disconnected);
        *self.writer.lock().await = None;
        self.pending.lock().await.clear();
        self.connect().await
    }

    pub async fn disconnect(&self) {
        debug!("disconnecting from pool");
        *self.writer.lock().await = None;
        self.pending.lock().await.clear();
        self.set_state(SessionState::Disconnected);
    }

    async fn subscribe(&self) -> Result<()> {
        let id = self.next_request_id();
        let resp = self.send_request(&StratumRequest::subscribe(id)).await?;

        // Standard response: [[subscriptions], extranonce1_hex, extranonce2_size]
        if let Some(arr) = resp.result.as_ref().and_then(|v| v.as_array()) {
            if let Some(en1) = arr.get(1).and_then(|v| v.as_str()) {
                match hex::decode(en1) {
                    Ok(bytes) => {
                        debug!("extranonce1 {} ({} bytes)", en1, bytes.len());
                        *self.extranonce1.lock().expect("extranonce poisoned") = bytes;
                    }
                    Err(e) => warn!("pool sent unparsable extranonce1 {}: {}", en1, e),
                }
            }
            if let Some(size) = arr.get(2).and_then(|v| v.as_u64()) {
                self.extranonce2_size.store(size as usize, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn authorize(&self) -> Result<()> {
        let username = if self.worker.is_empty() {
            self.wallet.clone()
        } else {
            format!("{}.{}", self.wallet, self.worker)
        };
        let id = self.next_request_id();
        let resp = self
            .send_request(&StratumRequest::authorize(id, &username, "x"))
            .await?;

        let authorized = match resp.result.as_ref() {
            Some(v) if v.as_bool() == Some(true) => true,
            Some(v) => v
                .as_str()
                .map(|s| s.eq_ignore_ascii_case("ok"))
                .unwrap_or(false),
            None => false,
        };
        if !authorized {
            return Err(anyhow!("pool rejected authorization for {}", username));
        }
        debug!("authorized as {}", username);
        Ok(())
    }

    /// Submit one share. A share for anything but the pool's current job
    /// is stale before it leaves the process.
    pub async fn submit(
        &self,
        job_id: &str,
        extranonce2: &str,
        nonce_hex: &str,
    ) -> Result<(), SubmitError> {
        match self.current_job_id() {
            Some(current) if current == job_id => {}
            _ => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                return Err(SubmitError::StaleWork(job_id.to_string()));
            }
        }

        let username = if self.worker.is_empty() {
            self.wallet.clone()
        } else {
            format!("{}.{}", self.wallet, self.worker)
        };
        let id = self.next_request_id();
        let req = StratumRequest::submit(id, &username, job_id, extranonce2, nonce_hex);

        let resp = self
            .send_request(&req)
            .await
            .map_err(|e| SubmitError::Connection(e.to_string()))?;

        if let Some(err) = resp.error {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::Rejected(format!(
                "{} (code {})",
                err.message, err.code
            )));
        }
        let accepted = resp
            .result
            .as_ref()
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if accepted {
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            Err(SubmitError::Rejected("pool returned false".to_string()))
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_request(&self, request: &StratumRequest) -> Result<StratumResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request.id, tx);

        let json = serde_json::to_string(request)?;
        debug!("-> {}", json);
        {
            let mut writer = self.writer.lock().await;
            let Some(stream) = writer.as_mut() else {
                self.pending.lock().await.remove(&request.id);
                return Err(anyhow!("not connected to pool"));
            };
            stream.write_all(json.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await?;
        }

        match timeout(Duration::from_secs(10), rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(anyhow!("request cancelled")),
            Err(_) => {
                self.pending.lock().await.remove(&request.id);
                Err(anyhow!("request timeout"))
            }
        }
    }

    async fn read_loop(self: Arc<Self>, read_half: OwnedReadHalf) -> Result<()> {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed: StratumResponse = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    debug!("invalid stratum line: {}", e);
                    continue;
                }
            };

            match parsed.method.as_deref() {
                Some("mining.notify") => {
                    if let Some(job) = parsed.params.as_ref().and_then(PoolJob::from_params) {
                        debug!(
                            "mining.notify: job={} height={} clean={}",
                            job.job_id, job.height, job.clean
                        );
                        // send_replace: the current job must be tracked
                        // even while no listener is subscribed yet.
                        self.job_tx.send_replace(Some(job));
                    }
                    continue;
                }
                Some("mining.set_difficulty") => {
                    let diff = parsed
                        .params
                        .as_ref()
                        .and_then(|p| p.as_array())
                        .and_then(|a| a.first())
                        .and_then(|v| v.as_f64());
                    if let Some(diff) = diff {
                        // Retarget applies to subsequent jobs; the
                        // extranonce assignment is untouched.
                        self.difficulty_bits
                            .store(diff.to_bits(), Ordering::Relaxed);
                        debug!("pool difficulty updated: {}", diff);
                    }
                    continue;
                }
                Some(other) => {
                    debug!("unhandled pool method: {}", other);
                    continue;
                }
                None => {}
            }

            if let Some(id) = parsed.id {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(parsed);
                } else {
                    debug!("no pending request for id={}", id);
                }
            }
        }
        Ok(())
    }
}
