use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name the backend uses for the stream handshake frame.
pub const CONNECT_EVENT: &str = "connect";

/// Payload of the handshake frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectMessage {
    #[serde(rename = "clientId")]
    pub client_id: String,
}

/// Control request registering topic interest for a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeCommand {
    pub client_id: String,
    pub subscriptions: Vec<String>,
}

/// A decoded record change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What happened to the record, e.g. `create`, `update`, `delete`.
    pub action: String,
    /// The record as the backend serialized it. Kept as raw JSON so callers
    /// can map it onto their own types.
    pub record: Value,
}

impl Event {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One parsed server-sent-events frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    /// Value of the `event:` field, if the frame carried one.
    pub name: Option<String>,
    /// Concatenated `data:` lines, joined with newlines.
    pub data: String,
}

impl SseFrame {
    /// Frames without payload exist only to keep the connection alive.
    pub fn is_keep_alive(&self) -> bool {
        self.data.trim().is_empty()
    }

    pub fn is_connect(&self) -> bool {
        self.name.as_deref() == Some(CONNECT_EVENT)
    }
}

/// Appends raw stream bytes to the text buffer. A multi-byte code point cut
/// off at a chunk boundary is held back in `carry` until the bytes that
/// complete it arrive; genuinely invalid bytes become replacement characters.
pub(crate) fn append_chunk(buffer: &mut String, carry: &mut Vec<u8>, chunk: &[u8]) {
    carry.extend_from_slice(chunk);
    loop {
        match std::str::from_utf8(carry.as_slice()) {
            Ok(text) => {
                buffer.push_str(text);
                carry.clear();
                return;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                buffer.push_str(&String::from_utf8_lossy(&carry[..valid]));
                match err.error_len() {
                    Some(bad) => {
                        buffer.push('\u{FFFD}');
                        carry.drain(..valid + bad);
                    }
                    // The tail is an incomplete sequence, not garbage; keep
                    // it for the next chunk.
                    None => {
                        carry.drain(..valid);
                        return;
                    }
                }
            }
        }
    }
}

/// Removes the next blank-line-delimited block from `buffer`, or returns
/// `None` while the buffer holds no complete block yet.
pub(crate) fn next_block(buffer: &mut String) -> Option<String> {
    let (at, sep_len) = match (buffer.find("\n\n"), buffer.find("\r\n\r\n")) {
        (Some(lf), Some(crlf)) if crlf < lf => (crlf, 4),
        (Some(lf), _) => (lf, 2),
        (None, Some(crlf)) => (crlf, 4),
        (None, None) => return None,
    };
    let block = buffer[..at].to_string();
    buffer.drain(..at + sep_len);
    Some(block)
}

/// Parses one block into a frame. Blocks made of comments only carry no
/// fields and yield `None`.
pub(crate) fn parse_frame(block: &str) -> Option<SseFrame> {
    let mut name = None;
    let mut data: Vec<&str> = Vec::new();
    let mut saw_field = false;
    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(at) => {
                let value = &line[at + 1..];
                (&line[..at], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "event" => {
                name = Some(value.to_string());
                saw_field = true;
            }
            "data" => {
                data.push(value);
                saw_field = true;
            }
            // Recognized but unused; still counts as a non-comment frame.
            "id" | "retry" => saw_field = true,
            _ => {}
        }
    }
    saw_field.then(|| SseFrame {
        name,
        data: data.join("\n"),
    })
}

/// Extracts the client id from a handshake frame payload.
pub(crate) fn decode_connect(frame: &SseFrame) -> Result<String, serde_json::Error> {
    serde_json::from_str::<ConnectMessage>(&frame.data).map(|message| message.client_id)
}
