//! Wire messages for the ASR streaming protocol.
//!
//! Frames are MessagePack maps keyed by a `type` string. Decoding is
//! deliberately tolerant: unknown types become [`InboundEvent::Unknown`],
//! missing fields fall back to zero values, and numeric fields accept any
//! integer or float width the server happens to emit.

use anyhow::{Context, Result};
use rmpv::Value;
use serde::Serialize;

#[derive(Serialize)]
struct AudioMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    pcm: &'a [f32],
}

/// Encode a PCM frame as an `Audio` message.
pub fn encode_audio(pcm: &[f32]) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(&AudioMessage {
        msg_type: "Audio",
        pcm,
    })
    .context("Failed to encode audio message")
}

/// VAD probability heads from a `Step` message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepProbabilities(pub Vec<Vec<f64>>);

impl StepProbabilities {
    /// The 2-second-pause prediction head (index 2) above 0.5 marks the end
    /// of a turn.
    pub fn is_end_of_turn(&self) -> bool {
        self.0
            .get(2)
            .and_then(|head| head.first())
            .is_some_and(|&p| p > 0.5)
    }

    /// The first head below 0.4 means speech is present (lower values are
    /// more confident speech).
    pub fn is_speech_present(&self) -> bool {
        self.0
            .first()
            .and_then(|head| head.first())
            .is_some_and(|&p| p < 0.4)
    }
}

/// A decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A recognized word. Empty text is legal.
    Word { text: String },
    /// VAD probabilities for the current step.
    Step { prs: StepProbabilities },
    /// Word-boundary timing marker.
    EndWord { stop_time: f64 },
    /// The server is ready to accept audio.
    Ready,
    /// A server-side error report.
    Error { message: String },
    /// Sync acknowledgment.
    Marker { id: i64 },
    /// Anything this client does not understand.
    Unknown { msg_type: String, raw: Value },
}

impl InboundEvent {
    /// The wire `type` string of this event.
    pub fn message_type(&self) -> &str {
        match self {
            InboundEvent::Word { .. } => "Word",
            InboundEvent::Step { .. } => "Step",
            InboundEvent::EndWord { .. } => "EndWord",
            InboundEvent::Ready => "Ready",
            InboundEvent::Error { .. } => "Error",
            InboundEvent::Marker { .. } => "Marker",
            InboundEvent::Unknown { msg_type, .. } => msg_type,
        }
    }
}

/// Decode one MessagePack frame into an event. Only a malformed frame
/// errors; unrecognized content does not.
pub fn decode(data: &[u8]) -> Result<InboundEvent> {
    let value =
        rmpv::decode::read_value(&mut &data[..]).context("Failed to decode msgpack frame")?;

    let msg_type = field(&value, "type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let event = match msg_type.as_str() {
        "Word" => InboundEvent::Word {
            text: field(&value, "text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "Step" => InboundEvent::Step {
            prs: StepProbabilities(
                field(&value, "prs").map(nested_floats).unwrap_or_default(),
            ),
        },
        "EndWord" => InboundEvent::EndWord {
            stop_time: field(&value, "stop_time").and_then(as_float).unwrap_or(0.0),
        },
        "Ready" => InboundEvent::Ready,
        "Error" => InboundEvent::Error {
            message: field(&value, "message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "Marker" => InboundEvent::Marker {
            id: field(&value, "id").and_then(Value::as_i64).unwrap_or(0),
        },
        _ => InboundEvent::Unknown {
            msg_type,
            raw: value,
        },
    };

    Ok(event)
}

fn field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::F32(f) => Some(f64::from(*f)),
        Value::F64(f) => Some(*f),
        Value::Integer(i) => i.as_f64(),
        _ => None,
    }
}

fn nested_floats(value: &Value) -> Vec<Vec<f64>> {
    let Some(outer) = value.as_array() else {
        return Vec::new();
    };

    outer
        .iter()
        .map(|inner| {
            inner
                .as_array()
                .map(|arr| arr.iter().filter_map(as_float).collect())
                .unwrap_or_default()
        })
        .collect()
}

#[cfg(test)]
#[path = "messages_test.rs"]
mod tests;
