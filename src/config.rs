use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregator::BuilderDirectory;
use crate::types::{BuilderInfo, GroupBy};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Known builders keyed by address.
    #[serde(default)]
    pub builders: BTreeMap<String, BuilderInfo>,
    /// Display settings for the catch-all category.
    #[serde(default)]
    pub other: BuilderInfo,
}

/// How the upstream fill stream is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Server-streaming RPC on the L1 gateway.
    #[default]
    Grpc,
    /// JSON frames from a WebSocket relay.
    #[value(name = "websocket")]
    WebSocket,
}

/// Where a gRPC stream starts. Without one the gateway streams from the latest block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Block(u64),
    TimestampMs(u64),
}

/// Upstream stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub transport: Transport,
    /// Gateway address. `host[:port]` becomes `https://host:443` for gRPC
    /// and `wss://host` for WebSocket.
    #[serde(default)]
    pub endpoint: String,
    /// Sent as `x-api-key` metadata (gRPC) or header (WebSocket) when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Full path of the server-streaming fills RPC.
    #[serde(default = "default_grpc_method")]
    pub grpc_method: String,
    /// Largest gRPC message accepted; busy blocks carry many fills.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// First block of the stream (gRPC only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    /// First block at or after this Unix time in milliseconds (gRPC only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp_ms: Option<u64>,
    /// JSON message sent right after a WebSocket connects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<serde_json::Value>,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_grpc_method() -> String {
    "/hyperliquid_l1_gateway.v2.HyperliquidL1Gateway/StreamFills".to_string()
}

fn default_max_message_bytes() -> usize {
    150 * 1024 * 1024
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            endpoint: String::new(),
            api_key: None,
            grpc_method: default_grpc_method(),
            max_message_bytes: default_max_message_bytes(),
            start_block: None,
            start_timestamp_ms: None,
            subscribe: None,
            group_by: GroupBy::default(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl StreamConfig {
    pub fn start_position(&self) -> Option<StartPosition> {
        match (self.start_block, self.start_timestamp_ms) {
            (Some(block), _) => Some(StartPosition::Block(block)),
            (None, Some(ts)) => Some(StartPosition::TimestampMs(ts)),
            (None, None) => None,
        }
    }
}

/// Aggregator bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Number of recent event identifiers remembered for deduplication.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Number of recent events kept for display.
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_recent_capacity() -> usize {
    100
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: default_dedup_capacity(),
            recent_capacity: default_recent_capacity(),
        }
    }
}

/// Subscriber delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Minimum spacing between published updates; 0 publishes every event.
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
    /// Updates buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_min_interval() -> u64 {
    250
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Dashboard API bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load config from `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("{} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply `HYPERLIQUID_ENDPOINT` (or `GRPC_ENDPOINT`), `API_KEY`, `HOST` and
    /// `PORT` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = var("HYPERLIQUID_ENDPOINT").or_else(|| var("GRPC_ENDPOINT")) {
            self.stream.endpoint = endpoint;
        }
        if let Some(key) = var("API_KEY") {
            self.stream.api_key = Some(key);
        }
        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {port}"))?;
        }
        Ok(())
    }

    /// Normalize the endpoint and check settings that would otherwise fail at runtime.
    pub fn validate(&mut self) -> Result<()> {
        let stream = &mut self.stream;
        stream.endpoint = normalize_endpoint(&stream.endpoint, stream.transport);
        if stream.endpoint.is_empty() {
            bail!("stream.endpoint is not set (config.toml or HYPERLIQUID_ENDPOINT)");
        }
        let url = url::Url::parse(&stream.endpoint)
            .with_context(|| format!("invalid stream.endpoint {}", stream.endpoint))?;
        match stream.transport {
            Transport::Grpc => {
                if !matches!(url.scheme(), "http" | "https") {
                    bail!("stream.endpoint must be an http:// or https:// URL for gRPC, got {url}");
                }
                let method = stream.grpc_method.trim_start_matches('/');
                if !stream.grpc_method.starts_with('/') || !method.contains('/') {
                    bail!(
                        "stream.grpc_method must look like /package.Service/Method, got {}",
                        stream.grpc_method
                    );
                }
                if stream.max_message_bytes == 0 {
                    bail!("stream.max_message_bytes must be positive");
                }
            }
            Transport::WebSocket => {
                if !matches!(url.scheme(), "ws" | "wss") {
                    bail!("stream.endpoint must be a ws:// or wss:// URL, got {url}");
                }
                if stream.start_position().is_some() {
                    bail!("stream.start_block and stream.start_timestamp_ms need the grpc transport");
                }
            }
        }
        if stream.start_block.is_some() && stream.start_timestamp_ms.is_some() {
            bail!("set at most one of stream.start_block and stream.start_timestamp_ms");
        }
        if self.aggregator.dedup_capacity == 0 {
            bail!("aggregator.dedup_capacity must be positive");
        }
        if self.publish.channel_capacity == 0 {
            bail!("publish.channel_capacity must be positive");
        }
        Ok(())
    }

    /// Builder metadata with addresses normalized to lowercase.
    pub fn builder_directory(&self) -> BuilderDirectory {
        BuilderDirectory::new(
            self.builders
                .iter()
                .map(|(addr, info)| (addr.to_lowercase(), info.clone())),
            self.other.clone(),
        )
    }
}

/// Trim the endpoint and add the transport's secure scheme when none is given.
/// Bare gRPC hosts also get the default TLS port.
pub fn normalize_endpoint(raw: &str, transport: Transport) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.contains("://") {
        return trimmed.to_string();
    }
    match transport {
        Transport::Grpc => {
            let host = trimmed.replace("/:", ":");
            let host = host.trim_end_matches('/');
            if host.contains(':') {
                format!("https://{host}")
            } else {
                format!("https://{host}:443")
            }
        }
        Transport::WebSocket => format!("wss://{trimmed}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r##"
[stream]
transport = "websocket"
endpoint = "relay.example.com:9443/fills"
group_by = "user"
subscribe = { method = "subscribe", subscription = { type = "blockFills" } }

[aggregator]
dedup_capacity = 500

[publish]
min_interval_ms = 0

[builders."0xABCDEF"]
name = "Rage Trade"
color = "#3B82F6"
logo = "https://example.com/rage.png"

[builders."0x123456"]
name = "Plain"

[other]
name = "Everyone else"
color = "#000000"
"##;

    #[test]
    fn parses_sample_with_defaults() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.stream.group_by, GroupBy::User);
        assert_eq!(config.stream.reconnect_delay_secs, 5);
        assert_eq!(config.aggregator.dedup_capacity, 500);
        assert_eq!(config.aggregator.recent_capacity, 100);
        assert_eq!(config.publish.min_interval_ms, 0);
        assert_eq!(config.publish.channel_capacity, 64);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.builders["0x123456"].color, "#6B7280");
        assert_eq!(config.other.name, "Everyone else");

        let subscribe = config.stream.subscribe.as_ref().unwrap();
        assert_eq!(subscribe["subscription"]["type"], "blockFills");
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.stream.endpoint.is_empty());
        assert_eq!(config.stream.group_by, GroupBy::Builder);
        assert_eq!(config.other.name, "Other");
        assert!(config.builders.is_empty());
    }

    #[test]
    fn directory_lowercases_addresses() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        let directory = config.builder_directory();
        assert_eq!(directory.lookup("0xabcdef").map(|b| b.name.as_str()), Some("Rage Trade"));
        assert!(directory.lookup("0xABCDEF").is_none());
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("HYPERLIQUID_ENDPOINT", "ws://localhost:9000"),
            ("API_KEY", "secret"),
            ("PORT", "8081"),
            ("HOST", ""),
        ]);
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.stream.endpoint, "ws://localhost:9000");
        assert_eq!(config.stream.api_key.as_deref(), Some("secret"));
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn bad_port_override_is_error() {
        let mut config = AppConfig::default();
        let result = config.apply_overrides(|name| (name == "PORT").then(|| "eighty".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn validate_normalizes_endpoint() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.stream.endpoint, "wss://relay.example.com:9443/fills");
    }

    #[test]
    fn validate_rejects_missing_endpoint() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_http_endpoint_for_websocket() {
        let mut config = AppConfig::default();
        config.stream.transport = Transport::WebSocket;
        config.stream.endpoint = "https://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = AppConfig::default();
        config.stream.endpoint = "gw:443".to_string();
        config.aggregator.dedup_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn normalize_endpoint_cases() {
        let ws = Transport::WebSocket;
        assert_eq!(normalize_endpoint("  host:443 ", ws), "wss://host:443");
        assert_eq!(normalize_endpoint("ws://host", ws), "ws://host");
        assert_eq!(normalize_endpoint("", ws), "");

        let grpc = Transport::Grpc;
        assert_eq!(normalize_endpoint("gw.example.com", grpc), "https://gw.example.com:443");
        assert_eq!(normalize_endpoint("gw.example.com/:8443", grpc), "https://gw.example.com:8443");
        assert_eq!(normalize_endpoint("http://localhost:50051", grpc), "http://localhost:50051");
    }

    #[test]
    fn grpc_is_the_default_transport() {
        let mut config = AppConfig::default();
        config.stream.endpoint = "gw.example.com".to_string();
        config.validate().unwrap();
        assert_eq!(config.stream.transport, Transport::Grpc);
        assert_eq!(config.stream.endpoint, "https://gw.example.com:443");
        assert_eq!(config.stream.max_message_bytes, 150 * 1024 * 1024);
        assert!(config.stream.grpc_method.ends_with("/StreamFills"));
    }

    #[test]
    fn grpc_endpoint_env_is_a_fallback() {
        let mut config = AppConfig::default();
        config
            .apply_overrides(|name| (name == "GRPC_ENDPOINT").then(|| "gw:443".to_string()))
            .unwrap();
        assert_eq!(config.stream.endpoint, "gw:443");

        let env: HashMap<&str, &str> =
            HashMap::from([("HYPERLIQUID_ENDPOINT", "primary:443"), ("GRPC_ENDPOINT", "gw:443")]);
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.stream.endpoint, "primary:443");
    }

    #[test]
    fn start_position_prefers_block() {
        let mut stream = StreamConfig::default();
        assert_eq!(stream.start_position(), None);
        stream.start_timestamp_ms = Some(1_700_000_000_000);
        assert_eq!(
            stream.start_position(),
            Some(StartPosition::TimestampMs(1_700_000_000_000))
        );
        stream.start_block = Some(42);
        assert_eq!(stream.start_position(), Some(StartPosition::Block(42)));
    }

    #[test]
    fn validate_rejects_conflicting_start() {
        let mut config = AppConfig::default();
        config.stream.endpoint = "gw:443".to_string();
        config.stream.start_block = Some(1);
        config.stream.start_timestamp_ms = Some(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_start_on_websocket() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.stream.start_block = Some(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_grpc_method() {
        let mut config = AppConfig::default();
        config.stream.endpoint = "gw:443".to_string();
        config.stream.grpc_method = "StreamFills".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_ws_endpoint_for_grpc() {
        let mut config = AppConfig::default();
        config.stream.endpoint = "wss://gw:443".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load_keeps_settings() {
        let dir = std::env::temp_dir().join(format!("fillstats-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.server.port = 9100;
        config.stream.subscribe = None;
        config.save(&path).unwrap();
        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9100);
        assert_eq!(loaded.stream.group_by, GroupBy::User);
        assert_eq!(loaded.builders.len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
