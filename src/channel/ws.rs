use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::{ChannelTransport, MessageStream};
use crate::errors::{PipelineError, PipelineResult};

/// WebSocket transport for the worker's `/ws/{correlation_id}` endpoint.
///
/// Ping frames are answered by tungstenite while the stream is polled; close
/// frames end the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn connect(&self, url: &str) -> PipelineResult<MessageStream> {
        let (socket, response) = connect_async(url)
            .await
            .map_err(|e| PipelineError::Channel(format!("connect to {} failed: {}", url, e)))?;
        debug!(%url, status = %response.status(), "WebSocket handshake complete");

        let frames = socket.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| PipelineError::MalformedEvent(format!("binary frame: {}", e))),
                ),
                // Ping/Pong are handled by tungstenite, Close ends the stream
                Ok(_) => None,
                Err(e) => Some(Err(PipelineError::Channel(e.to_string()))),
            }
        });

        Ok(frames.boxed())
    }
}

/// Derive the WebSocket base from the worker's HTTP base URL.
pub fn ws_base_from_http(base_url: &str) -> PipelineResult<String> {
    let trimmed = base_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        Ok(trimmed.to_string())
    } else {
        Err(PipelineError::Channel(format!(
            "cannot derive a WebSocket address from '{}'",
            base_url
        )))
    }
}

/// `{ws_base}/ws/{correlation_id}`.
pub fn channel_url(ws_base: &str, correlation_id: &str) -> String {
    format!("{}/ws/{}", ws_base.trim_end_matches('/'), correlation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_base_from_http() {
        assert_eq!(
            ws_base_from_http("http://127.0.0.1:8000").unwrap(),
            "ws://127.0.0.1:8000"
        );
        assert_eq!(
            ws_base_from_http("https://papers.example.com/api/").unwrap(),
            "wss://papers.example.com/api"
        );
        assert_eq!(
            ws_base_from_http("ws://already:1").unwrap(),
            "ws://already:1"
        );
        assert!(ws_base_from_http("ftp://nope").is_err());
    }

    #[test]
    fn test_channel_url_is_deterministic() {
        assert_eq!(
            channel_url("ws://host:8000/", "syllabus-17"),
            "ws://host:8000/ws/syllabus-17"
        );
        assert_eq!(
            channel_url("ws://host:8000", "syllabus-17"),
            channel_url("ws://host:8000", "syllabus-17")
        );
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_channel_error() {
        // Port 9 (discard) is closed on CI hosts; the handshake must fail fast
        let err = WsTransport
            .connect("ws://127.0.0.1:9/ws/x")
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, PipelineError::Channel(_)));
    }
}
