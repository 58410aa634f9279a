pub mod aggregator;
pub mod config;
pub mod decode;
pub mod error;
pub mod grpc;
pub mod pipeline;
pub mod publisher;
pub mod reporter;
pub mod server;
pub mod source;
pub mod types;
pub mod upstream;
pub mod ws;

/// Name reported by the HTTP root endpoint and in logs.
pub const SERVICE_NAME: &str = "hyperliquid-fillstats";

