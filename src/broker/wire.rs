//! Bit-exact wire protocol for the embedding worker (§4.4/§6). Newline-delimited
//! JSON; this is the only module that touches raw socket bytes, per the design
//! note that models the protocol as a tagged union of message variants with a
//! single buffered newline framer around it.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    #[serde(rename = "embed")]
    Embed { text: String },
    #[serde(rename = "batch_embed")]
    BatchEmbed { texts: Vec<String> },
    #[serde(rename = "health")]
    Health,
}

impl WorkerRequest {
    pub fn to_line(&self) -> String {
        let mut s = serde_json::to_string(self).expect("WorkerRequest is always serializable");
        s.push('\n');
        s
    }
}

/// Terminal and heartbeat shapes on the response stream. `Health` is accepted
/// loosely per the resolved open question: any object with a `status` field
/// that isn't `"error"` counts as alive. Field presence, not an untagged
/// derive, disambiguates the shapes: a bare `{"status":"processing"}` is the
/// heartbeat, `{"status": <anything else>}` is a health reply, and
/// `embedding`/`embeddings`/`error` are the terminal shapes.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Processing,
    Ready { embedding: Vec<f32> },
    ReadyBatch { embeddings: Vec<Option<Vec<f32>>> },
    Error { error: String },
    Health { status: String },
}

impl<'de> Deserialize<'de> for WorkerMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("worker message must be a JSON object"))?;

        if let Some(embedding) = obj.get("embedding") {
            let embedding: Vec<f32> =
                serde_json::from_value(embedding.clone()).map_err(serde::de::Error::custom)?;
            return Ok(WorkerMessage::Ready { embedding });
        }
        if let Some(embeddings) = obj.get("embeddings") {
            let embeddings: Vec<Option<Vec<f32>>> =
                serde_json::from_value(embeddings.clone()).map_err(serde::de::Error::custom)?;
            return Ok(WorkerMessage::ReadyBatch { embeddings });
        }
        if let Some(error) = obj.get("error") {
            let error = error.as_str().unwrap_or("unknown worker error").to_string();
            return Ok(WorkerMessage::Error { error });
        }
        if let Some(status) = obj.get("status") {
            let status = status.as_str().unwrap_or("").to_string();
            if status == "processing" {
                return Ok(WorkerMessage::Processing);
            }
            return Ok(WorkerMessage::Health { status });
        }
        Err(serde::de::Error::custom(
            "worker message missing embedding/embeddings/error/status",
        ))
    }
}

impl WorkerMessage {
    pub fn is_processing(&self) -> bool {
        matches!(self, WorkerMessage::Processing { .. })
    }

    pub fn is_healthy(&self) -> bool {
        match self {
            WorkerMessage::Health { status } => status != "error",
            _ => false,
        }
    }
}

/// Per-request response buffer caps (§4.4 "buffer guards").
pub const SINGLE_RESPONSE_CAP_BYTES: usize = 1024 * 1024;
pub const BATCH_RESPONSE_CAP_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("socket closed mid-response")]
    SocketClosed,
    #[error("response exceeded buffer cap of {0} bytes")]
    BufferOverflow(usize),
    #[error("malformed JSON frame: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write a single request line to `writer`, flushing immediately.
pub async fn write_request<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    request: &WorkerRequest,
) -> Result<(), FramingError> {
    let line = request.to_line();
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read frames from `reader` until a terminal message (`Ready`/`ReadyBatch`/
/// `Error`) arrives, buffering heartbeats. Returns the terminal message plus
/// the count of `processing` heartbeats observed (§8 property 7 / S6).
pub async fn read_until_terminal<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    response_cap_bytes: usize,
    max_heartbeats: usize,
) -> Result<(WorkerMessage, usize), FramingError> {
    let mut heartbeats = 0usize;
    let mut total_bytes = 0usize;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(FramingError::SocketClosed);
        }
        total_bytes += n;
        if total_bytes > response_cap_bytes {
            return Err(FramingError::BufferOverflow(response_cap_bytes));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let msg: WorkerMessage = serde_json::from_str(trimmed)?;
        if msg.is_processing() {
            heartbeats += 1;
            if heartbeats > max_heartbeats {
                return Ok((msg, heartbeats));
            }
            continue;
        }
        return Ok((msg, heartbeats));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_request_serializes_bit_exact() {
        let req = WorkerRequest::Embed {
            text: "hello".into(),
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"type":"embed","text":"hello"}"#
        );
    }

    #[test]
    fn batch_embed_request_serializes_bit_exact() {
        let req = WorkerRequest::BatchEmbed {
            texts: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"type":"batch_embed","texts":["a","b"]}"#
        );
    }

    #[test]
    fn parses_processing_and_terminal_shapes() {
        let p: WorkerMessage = serde_json::from_str(r#"{"status":"processing"}"#).unwrap();
        assert!(p.is_processing());

        let ready: WorkerMessage = serde_json::from_str(r#"{"embedding":[0.1,0.2]}"#).unwrap();
        matches!(ready, WorkerMessage::Ready { .. });

        let batch: WorkerMessage =
            serde_json::from_str(r#"{"embeddings":[[0.1],[0.2]]}"#).unwrap();
        matches!(batch, WorkerMessage::ReadyBatch { .. });

        let err: WorkerMessage = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        matches!(err, WorkerMessage::Error { .. });
    }
}
