pub mod config;
pub mod error;
pub mod miner;
pub mod rpc;
pub mod source;
pub mod stats_http;
pub mod stratum;
pub mod submit;
pub mod work;
