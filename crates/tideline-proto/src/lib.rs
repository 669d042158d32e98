//! Wire protocol types shared by the tideline client and server harnesses.
//! Keeping the message shapes in their own crate means test servers and the
//! client cannot drift apart on serialization details.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// RFC6902 operation kinds. The client only ever consumes these; it never
/// originates operations against its own mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

/// A single JSON-Patch operation targeting a slash-delimited pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: OpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl PatchOp {
    pub fn new(op: OpKind, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            value: None,
            from: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

/// Envelope for the structured object channel, one JSON object per message.
///
/// The terminal marker has drifted across server generations: the canonical
/// spelling is `{"Finished": true}`, but `{"finished": <bool>}` and
/// `{"Finished": ""}` are still seen in the wild. The decoder accepts all
/// three; the encoder only ever writes the canonical one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StructuredEnvelope {
    JsonPatch(Vec<PatchOp>),
    Ready(bool),
    #[serde(alias = "finished")]
    Finished(Value),
}

impl StructuredEnvelope {
    /// Canonical terminal marker.
    pub fn finished() -> Self {
        StructuredEnvelope::Finished(Value::Bool(true))
    }

    /// Whether this frame terminates the stream. Legacy servers send
    /// `{"finished": false}` as a keepalive-ish non-event; only an explicit
    /// `false` payload is non-terminal.
    pub fn is_terminal(&self) -> bool {
        match self {
            StructuredEnvelope::Finished(value) => !matches!(value, Value::Bool(false)),
            _ => false,
        }
    }

    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization cannot fail")
    }
}

/// Frames for the byte-stream duplex channel. `input`/`output` payloads are
/// base64-encoded so raw control bytes survive a text-safe transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalFrame {
    Output {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Input {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Exit,
}

impl TerminalFrame {
    pub fn input(data: impl Into<Vec<u8>>) -> Self {
        TerminalFrame::Input { data: data.into() }
    }

    pub fn output(data: impl Into<Vec<u8>>) -> Self {
        TerminalFrame::Output { data: data.into() }
    }

    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("frame serialization cannot fail")
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)
    }
}

/// Swap an http(s) URL's scheme for its ws(s) equivalent, leaving path and
/// query untouched. URLs already using a ws scheme pass through unchanged.
pub fn ws_endpoint(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_op_round_trip() {
        let raw = r#"{"op":"add","path":"/entries/0","value":{"id":"a"}}"#;
        let op: PatchOp = serde_json::from_str(raw).expect("decode op");
        assert_eq!(op.op, OpKind::Add);
        assert_eq!(op.path, "/entries/0");
        assert_eq!(op.value, Some(json!({"id": "a"})));
        assert_eq!(op.from, None);
        let encoded = serde_json::to_string(&op).expect("encode op");
        assert_eq!(encoded, raw);
    }

    #[test]
    fn envelope_patch_batch() {
        let env = StructuredEnvelope::decode(
            r#"{"JsonPatch":[{"op":"remove","path":"/entries/3"}]}"#,
        )
        .expect("decode envelope");
        match env {
            StructuredEnvelope::JsonPatch(ops) => {
                assert_eq!(ops.len(), 1);
                assert_eq!(ops[0].op, OpKind::Remove);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn envelope_ready() {
        let env = StructuredEnvelope::decode(r#"{"Ready":true}"#).expect("decode ready");
        assert_eq!(env, StructuredEnvelope::Ready(true));
        assert!(!env.is_terminal());
    }

    #[test]
    fn finished_spellings() {
        for raw in [
            r#"{"Finished":true}"#,
            r#"{"Finished":""}"#,
            r#"{"finished":true}"#,
        ] {
            let env = StructuredEnvelope::decode(raw).expect("decode finished");
            assert!(env.is_terminal(), "{raw} should be terminal");
        }
        let env = StructuredEnvelope::decode(r#"{"finished":false}"#).expect("decode");
        assert!(!env.is_terminal());
    }

    #[test]
    fn canonical_finished_encoding() {
        assert_eq!(StructuredEnvelope::finished().encode(), r#"{"Finished":true}"#);
    }

    #[test]
    fn terminal_frame_tags() {
        let frame = TerminalFrame::decode(r#"{"type":"output","data":"aGVsbG8="}"#)
            .expect("decode output");
        assert_eq!(frame, TerminalFrame::output(&b"hello"[..]));

        let input = TerminalFrame::input(&b"x"[..]);
        assert_eq!(input.encode(), r#"{"type":"input","data":"eA=="}"#);

        let resize = TerminalFrame::decode(r#"{"type":"resize","cols":80,"rows":24}"#)
            .expect("decode resize");
        assert_eq!(resize, TerminalFrame::Resize { cols: 80, rows: 24 });

        let exit = TerminalFrame::decode(r#"{"type":"exit"}"#).expect("decode exit");
        assert_eq!(exit, TerminalFrame::Exit);
    }

    #[test]
    fn rejects_garbage_base64() {
        assert!(TerminalFrame::decode(r#"{"type":"input","data":"@@@"}"#).is_err());
    }

    #[test]
    fn endpoint_scheme_swap() {
        assert_eq!(
            ws_endpoint("https://api.example.com/tasks/42/live?mode=full"),
            "wss://api.example.com/tasks/42/live?mode=full"
        );
        assert_eq!(ws_endpoint("http://localhost:8080/tty"), "ws://localhost:8080/tty");
        assert_eq!(ws_endpoint("ws://localhost:8080/tty"), "ws://localhost:8080/tty");
    }
}
