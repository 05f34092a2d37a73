use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const AGENT: &str = concat!("meridian-miner/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl StratumRequest {
    /// Create subscribe request
    pub fn subscribe(id: u64) -> Self {
        Self {
            id,
            method: "mining.subscribe".to_string(),
            params: serde_json::json!([AGENT]),
        }
    }

    /// Create authorize request
    pub fn authorize(id: u64, username: &str, password: &str) -> Self {
        Self {
            id,
            method: "mining.authorize".to_string(),
            params: serde_json::json!([username, password]),
        }
    }

    /// Create submit request
    pub fn submit(id: u64, worker: &str, job_id: &str, extranonce2: &str, nonce_hex: &str) -> Self {
        Self {
            id,
            method: "mining.submit".to_string(),
            params: serde_json::json!([worker, job_id, extranonce2, nonce_hex]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<StratumError>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

/// One job from `mining.notify`:
/// `[job_id, header_hex, height, clean_jobs]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolJob {
    pub job_id: String,
    pub header: String,
    pub height: u64,
    pub clean: bool,
}

impl PoolJob {
    pub fn from_params(params: &Value) -> Option<Self> {
        let arr = params.as_array()?;
        if arr.len() < 2 {
            return None;
        }
        let job_id = arr.first()?.as_str()?.to_string();
        let header = arr.get(1)?.as_str()?.to_string();
        if job_id.is_empty() || header.is_empty() {
            return None;
        }
        Some(Self {
            job_id,
            header,
            height: arr.get(2).and_then(Value::as_u64).unwrap_or(0),
            clean: arr.get(3).and_then(Value::as_bool).unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_params_parse() {
        let params = serde_json::json!(["job-7", "aa".repeat(88), 100, false]);
        let job = PoolJob::from_params(&params).unwrap();
        assert_eq!(job.job_id, "job-7");
        assert_eq!(job.height, 100);
        assert!(!job.clean);

        // Height/clean are optional.
        let short = serde_json::json!(["job-8", "bb"]);
        let job = PoolJob::from_params(&short).unwrap();
        assert_eq!(job.height, 0);
        assert!(job.clean);

        assert!(PoolJob::from_params(&serde_json::json!(["only-id"])).is_none());
        assert!(PoolJob::from_params(&serde_json::json!(["", "aa"])).is_none());
    }

    #[test]
    fn test_submit_request_shape() {
        let req = StratumRequest::submit(9, "wallet.rig0", "job-7", "0000002a", "00bc614e");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("mining.submit"));
        assert!(json.contains("job-7"));
        assert!(json.contains("0000002a"));
    }
}
