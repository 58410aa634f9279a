use std::pin::Pin;

use anyhow::Result;
use futures_util::Stream;

use crate::config::{StartPosition, StreamConfig, Transport};
use crate::source::EventSource;
use crate::{grpc, ws};

/// Metadata key (gRPC) or header (WebSocket) carrying the gateway API key.
pub(crate) const API_KEY_HEADER: &str = "x-api-key";

/// Raw payloads from whichever transport is configured.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, anyhow::Error>> + Send>>;

/// Connect with the configured transport and wrap the payloads in an [`EventSource`].
///
/// `start` only applies to gRPC; the WebSocket relay always streams live.
pub async fn connect(
    config: &StreamConfig,
    start: Option<StartPosition>,
) -> Result<EventSource<PayloadStream>> {
    let payloads = match config.transport {
        Transport::Grpc => grpc::connect(config, start).await?,
        Transport::WebSocket => ws::connect(config).await?,
    };
    Ok(EventSource::new(payloads, config.group_by))
}
