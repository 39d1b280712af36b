//! Output events and their payloads.
//!
//! Payloads are structured: rendering them to text or HTML is left to the
//! presentation layer, which picks a renderer from [`FormatHint`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rkyv::Archive;
use serde::{Deserialize, Serialize};

use crate::script::RunId;

/// An output channel. Channels are numbered and open-ended.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct OutputChannel(pub u32);

impl OutputChannel {
    /// Primary channel for dumped values.
    pub const RESULTS: OutputChannel = OutputChannel(scriptpad_runtime::channel::RESULTS);
    /// Console text, errors, and pipeline warnings.
    pub const LOG: OutputChannel = OutputChannel(scriptpad_runtime::channel::LOG);
}

impl fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            OutputChannel::RESULTS => f.write_str("results"),
            OutputChannel::LOG => f.write_str("log"),
            OutputChannel(n) => write!(f, "channel-{}", n),
        }
    }
}

/// How the presentation layer should treat a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatHint {
    Structured,
    PlainText,
    Html,
}

/// What a script wrote.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPayload {
    /// A dumped value.
    Value {
        type_name: String,
        title: Option<String>,
        /// Pretty `Debug` rendering of the value.
        debug: String,
    },
    /// Console text.
    Text { text: String, stderr: bool },
    /// A pre-rendered HTML fragment.
    Html { fragment: String },
    /// An error raised by the script or the engine.
    Error { message: String },
    /// A warning from the engine, e.g. dropped output.
    Warning { message: String },
}

impl OutputPayload {
    pub fn text(text: impl Into<String>) -> Self {
        OutputPayload::Text {
            text: text.into(),
            stderr: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OutputPayload::Error {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        OutputPayload::Warning {
            message: message.into(),
        }
    }

    pub fn format_hint(&self) -> FormatHint {
        match self {
            OutputPayload::Value { .. } => FormatHint::Structured,
            OutputPayload::Html { .. } => FormatHint::Html,
            OutputPayload::Text { .. } | OutputPayload::Error { .. } | OutputPayload::Warning { .. } => {
                FormatHint::PlainText
            }
        }
    }

    /// The main text of the payload.
    pub fn body(&self) -> &str {
        match self {
            OutputPayload::Value { debug, .. } => debug,
            OutputPayload::Text { text, .. } => text,
            OutputPayload::Html { fragment } => fragment,
            OutputPayload::Error { message } | OutputPayload::Warning { message } => message,
        }
    }
}

/// One unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub run_id: RunId,
    pub channel: OutputChannel,
    /// Monotonic per channel within one run, starting at 1.
    pub sequence: u64,
    pub payload: OutputPayload,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_display() {
        assert_eq!(OutputChannel::RESULTS.to_string(), "results");
        assert_eq!(OutputChannel::LOG.to_string(), "log");
        assert_eq!(OutputChannel(7).to_string(), "channel-7");
    }

    #[test]
    fn test_format_hints() {
        let value = OutputPayload::Value {
            type_name: "i32".to_string(),
            title: None,
            debug: "1".to_string(),
        };
        assert_eq!(value.format_hint(), FormatHint::Structured);
        assert_eq!(
            OutputPayload::Html {
                fragment: "<b>x</b>".to_string()
            }
            .format_hint(),
            FormatHint::Html
        );
        assert_eq!(OutputPayload::text("hi").format_hint(), FormatHint::PlainText);
    }

    #[test]
    fn test_payload_json_shape() {
        let json = serde_json::to_value(OutputPayload::error("boom")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");
    }
}
