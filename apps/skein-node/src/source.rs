//! External stream capability.
//!
//! A [`StreamSource`] opens a connection and yields messages until the peer
//! closes it or a read fails. The ingestion worker owns reconnect policy;
//! sources never retry on their own.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::time::Duration;
use tokio_tungstenite::tungstenite;

use crate::error::IngestError;

/// One message received from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Source-assigned sequence, `None` when the payload does not carry one.
    pub sequence: Option<u64>,
    pub payload: String,
}

pub type MessageStream = BoxStream<'static, Result<StreamMessage, IngestError>>;

#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Watermark key for records from this source.
    fn source_id(&self) -> &str;

    async fn connect(&self) -> Result<MessageStream, IngestError>;
}

/// Reads the sequence number out of a JSON payload.
#[derive(Debug, Clone)]
pub struct SequenceExtractor {
    field: String,
}

impl SequenceExtractor {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    /// Accepts an unsigned integer or a string holding one.
    pub fn extract(&self, payload: &str) -> Option<u64> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        match value.get(&self.field)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn message(&self, payload: String) -> StreamMessage {
        StreamMessage {
            sequence: self.extract(&payload),
            payload,
        }
    }
}

/// WebSocket client source.
pub struct WebSocketSource {
    url: String,
    source_id: String,
    extractor: SequenceExtractor,
    connect_timeout: Duration,
}

impl WebSocketSource {
    pub fn new(
        url: impl Into<String>,
        source_id: impl Into<String>,
        extractor: SequenceExtractor,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            source_id: source_id.into(),
            extractor,
            connect_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl StreamSource for WebSocketSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn connect(&self) -> Result<MessageStream, IngestError> {
        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| IngestError::StreamConnect {
                url: self.url.clone(),
                reason: format!("timed out after {:?}", self.connect_timeout),
            })?
            .map_err(|e| IngestError::StreamConnect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(url = %self.url, "Connected to stream");

        let extractor = self.extractor.clone();
        let url = self.url.clone();

        // State is `None` once the stream has ended or failed.
        let messages = stream::unfold(Some(ws), move |ws| {
            let extractor = extractor.clone();
            let url = url.clone();
            async move {
                let mut ws = ws?;
                loop {
                    match ws.next().await {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            let msg = extractor.message(text.as_str().to_string());
                            return Some((Ok(msg), Some(ws)));
                        }
                        Some(Ok(tungstenite::Message::Binary(data))) => {
                            let text = String::from_utf8_lossy(&data).into_owned();
                            return Some((Ok(extractor.message(text)), Some(ws)));
                        }
                        Some(Ok(tungstenite::Message::Close(frame))) => {
                            tracing::info!(url = %url, ?frame, "Stream closed by peer");
                            return None;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            return Some((Err(IngestError::StreamRead(e.to_string())), None));
                        }
                        None => return None,
                    }
                }
            }
        });

        Ok(messages.boxed())
    }
}
