//! gRPC upstream: the L1 gateway's server-streaming fills RPC.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

use crate::config::{StartPosition, StreamConfig};
use crate::upstream::{API_KEY_HEADER, PayloadStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE: Duration = Duration::from_secs(30);

/// Gateway messages.
pub mod proto {
    /// Stream start point. Empty means the latest block.
    #[derive(Clone, Copy, PartialEq, ::prost::Message)]
    pub struct Position {
        #[prost(oneof = "position::Point", tags = "1, 2")]
        pub point: ::core::option::Option<position::Point>,
    }

    pub mod position {
        #[derive(Clone, Copy, PartialEq, ::prost::Oneof)]
        pub enum Point {
            #[prost(int64, tag = "1")]
            TimestampMs(i64),
            #[prost(int64, tag = "2")]
            BlockHeight(i64),
        }
    }

    /// One block of fills as a JSON document.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BlockData {
        #[prost(bytes = "vec", tag = "1")]
        pub data: ::prost::alloc::vec::Vec<u8>,
    }
}

/// Build the request message for a start point.
pub fn position(start: Option<StartPosition>) -> Result<proto::Position> {
    use proto::position::Point;

    let point = match start {
        None => None,
        Some(StartPosition::Block(height)) => Some(Point::BlockHeight(
            i64::try_from(height).context("start block out of range")?,
        )),
        Some(StartPosition::TimestampMs(ts)) => Some(Point::TimestampMs(
            i64::try_from(ts).context("start timestamp out of range")?,
        )),
    };
    Ok(proto::Position { point })
}

async fn open_channel(endpoint: &str) -> Result<Channel> {
    let mut builder = Endpoint::from_shared(endpoint.to_string())
        .with_context(|| format!("invalid gRPC endpoint {endpoint}"))?
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(Some(KEEPALIVE))
        .http2_keep_alive_interval(KEEPALIVE)
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);
    if endpoint.starts_with("https://") {
        builder = builder
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .context("failed to configure TLS")?;
    }
    builder
        .connect()
        .await
        .with_context(|| format!("failed to connect to {endpoint}"))
}

/// Open the fills stream. Each message's `data` field is one raw payload.
pub async fn connect(config: &StreamConfig, start: Option<StartPosition>) -> Result<PayloadStream> {
    let path = PathAndQuery::try_from(config.grpc_method.as_str())
        .with_context(|| format!("invalid gRPC method {}", config.grpc_method))?;
    let mut request = tonic::Request::new(position(start)?);
    if let Some(key) = &config.api_key {
        let value: AsciiMetadataValue = key.parse().context("API key is not valid metadata")?;
        request.metadata_mut().insert(API_KEY_HEADER, value);
    }

    let channel = open_channel(&config.endpoint).await?;
    let mut grpc =
        tonic::client::Grpc::new(channel).max_decoding_message_size(config.max_message_bytes);
    grpc.ready().await.context("gRPC channel not ready")?;

    debug!("Calling {} from {:?}", config.grpc_method, start);
    let codec = tonic_prost::ProstCodec::<proto::Position, proto::BlockData>::default();
    let response = grpc
        .server_streaming(request, path, codec)
        .await
        .with_context(|| format!("{} was rejected", config.grpc_method))?;
    info!("Streaming {} from {}", config.grpc_method, config.endpoint);

    let payloads = response
        .into_inner()
        .map(|message| message.map(|block| block.data).map_err(anyhow::Error::from));
    Ok(Box::pin(payloads))
}
