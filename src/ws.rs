use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::config::StreamConfig;
use crate::upstream::{API_KEY_HEADER, PayloadStream};

/// Connect to a WebSocket relay of the fill stream.
///
/// Sends the configured subscription message (if any) once connected. Text and
/// binary frames become payloads; control frames are dropped.
pub async fn connect(config: &StreamConfig) -> Result<PayloadStream> {
    let mut request = config
        .endpoint
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid stream endpoint {}", config.endpoint))?;
    if let Some(key) = &config.api_key {
        let value = HeaderValue::from_str(key).context("API key is not a valid header value")?;
        request.headers_mut().insert(API_KEY_HEADER, value);
    }

    let (ws, response) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {}", config.endpoint))?;
    info!(
        "Connected to {} (status {})",
        config.endpoint,
        response.status()
    );

    let (mut write, read) = ws.split();
    if let Some(subscribe) = &config.subscribe {
        let msg = subscribe.to_string();
        debug!("Sending subscription: {msg}");
        write
            .send(Message::Text(msg.into()))
            .await
            .context("failed to send subscription message")?;
    }

    let payloads = read.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().as_bytes().to_vec())),
            Ok(Message::Binary(data)) => Some(Ok(data.to_vec())),
            Ok(Message::Close(frame)) => {
                info!("Upstream closed the connection: {frame:?}");
                None
            }
            Ok(_) => None,
            Err(e) => Some(Err(anyhow::Error::from(e))),
        }
    });

    Ok(Box::pin(payloads))
}
