use crate::domain::EventRecord;
use serde::Deserialize;
use serde_json::Value;

/// Incremental decoder for the backend's server-sent event framing:
///
/// ```text
/// event: workflow
/// data: {"topic":"...","ts":"...","payload":"..."}
/// <blank line>
/// ```
///
/// Chunks arrive aligned to network reads, not to lines; the parser owns the
/// reassembly of partial lines. Unknown field prefixes are skipped so new
/// server fields never break the stream, and a frame whose data fails to
/// decode is dropped with a diagnostic instead of terminating parsing.
#[derive(Debug, Default)]
pub struct FrameParser {
    partial_line: Vec<u8>,
    data_lines: Vec<String>,
    event_name: Option<String>,
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    topic: String,
    ts: String,
    #[serde(default)]
    payload: Option<Value>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event id from the most recent `id:` field, if the server sent one.
    pub fn last_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Feeds one transport chunk and returns every record completed by it,
    /// in arrival order. Buffering is byte-level so a multi-byte character
    /// split across reads is decoded only once its line is complete.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<EventRecord> {
        let mut records = Vec::new();

        for &byte in chunk {
            if byte != b'\n' {
                self.partial_line.push(byte);
                continue;
            }
            let mut line = std::mem::take(&mut self.partial_line);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(record) = self.push_line(&line) {
                records.push(record);
            }
        }

        records
    }

    fn push_line(&mut self, line: &str) -> Option<EventRecord> {
        if line.is_empty() {
            return self.complete_frame();
        }

        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("event:") {
            self.event_name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("id:") {
            self.last_id = Some(value.trim().to_string());
        }
        // Anything else (comments, unknown fields) is skipped.

        None
    }

    fn complete_frame(&mut self) -> Option<EventRecord> {
        let event_name = self.event_name.take();
        let data_lines = std::mem::take(&mut self.data_lines);
        if data_lines.is_empty() {
            return None;
        }

        let data = data_lines.join("\n");
        match serde_json::from_str::<WireEvent>(&data) {
            Ok(wire) => Some(EventRecord {
                timestamp: wire.ts,
                topic: wire.topic,
                payload: payload_text(wire.payload),
            }),
            Err(error) => {
                tracing::warn!(
                    event = event_name.as_deref().unwrap_or(""),
                    %error,
                    "dropping undecodable frame"
                );
                None
            }
        }
    }
}

fn payload_text(payload: Option<Value>) -> String {
    match payload {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    }
}
