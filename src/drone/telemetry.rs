//! Decoder for the vehicle's `key:value;` status frames.
//!
//! A frame looks like
//! `pitch:0;roll:0;yaw:0;vgx:0;vgy:0;vgz:0;templ:20;temph:22;tof:30;h:50;bat:87;baro:101325.00;time:12;agx:0.00;agy:0.00;agz:1.00;`
//! possibly followed by `\r\n`. Keys are matched by name, so the order the
//! vehicle sends them in does not matter, and keys this decoder does not know
//! about (newer firmware prepends mission pad fields) are skipped.

use std::fmt;

use super::state::FlightState;

/// Keys every frame must carry, in the order of [`FlightState::from_values`].
pub const FIELD_KEYS: [&str; FlightState::FIELD_COUNT] = [
    "pitch", "roll", "yaw", "vgx", "vgy", "vgz", "templ", "temph", "tof", "h", "bat", "baro",
    "time", "agx", "agy", "agz",
];

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Nothing but noise in the datagram.
    Empty,
    /// Text after the last `;`, typically a half-received datagram.
    Truncated(String),
    /// A segment with no `:` between key and value.
    MalformedSegment(String),
    DuplicateKey(&'static str),
    MissingKey(&'static str),
    InvalidValue { key: &'static str, value: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty telemetry frame"),
            DecodeError::Truncated(rest) => write!(f, "truncated telemetry frame at {:?}", rest),
            DecodeError::MalformedSegment(segment) => {
                write!(f, "malformed telemetry segment {:?}", segment)
            }
            DecodeError::DuplicateKey(key) => write!(f, "telemetry key {} repeated", key),
            DecodeError::MissingKey(key) => write!(f, "telemetry key {} missing", key),
            DecodeError::InvalidValue { key, value } => {
                write!(f, "telemetry key {} has non-numeric value {:?}", key, value)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one frame into a complete state, or fail without a partial result.
pub fn decode(frame: &str) -> Result<FlightState, DecodeError> {
    let frame = frame.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if frame.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut values: [Option<f64>; FlightState::FIELD_COUNT] = [None; FlightState::FIELD_COUNT];
    let mut segments = frame.split(';').peekable();

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            // Whatever follows the final ';' must be empty.
            if !segment.trim().is_empty() {
                return Err(DecodeError::Truncated(segment.to_string()));
            }
            break;
        }

        let (key, raw) = segment
            .split_once(':')
            .ok_or_else(|| DecodeError::MalformedSegment(segment.to_string()))?;
        let key = key.trim();

        let Some(index) = FIELD_KEYS.iter().position(|k| *k == key) else {
            continue;
        };
        let key = FIELD_KEYS[index];

        if values[index].is_some() {
            return Err(DecodeError::DuplicateKey(key));
        }

        let value = raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| DecodeError::InvalidValue {
                key,
                value: raw.to_string(),
            })?;
        values[index] = Some(value);
    }

    let mut complete = [0.0; FlightState::FIELD_COUNT];
    for (index, value) in values.iter().enumerate() {
        complete[index] = value.ok_or(DecodeError::MissingKey(FIELD_KEYS[index]))?;
    }
    Ok(FlightState::from_values(complete))
}
