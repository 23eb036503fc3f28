//! Normalization of inbound firmware messages.
//!
//! Firmware publishes on per-device topics with loosely typed JSON. Everything
//! here turns that into [`InboundMessage`] before it reaches the engine:
//! topic classification, field aliases, unit conversion, and chunk payload
//! decoding (byte array or base64).

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::errors::WireError;
use crate::telemetry::{fahrenheit_to_celsius, TelemetryReading};

/// What a topic carries, before looking at the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicKind {
    Status,
    Metadata,
    Chunk,
    /// Camera data topic: metadata or chunk depending on `chunk_id`.
    CameraData,
}

/// Split a topic into the device MAC and its kind.
pub fn classify_topic(topic: &str) -> Result<(String, TopicKind), WireError> {
    let parts: Vec<&str> = topic.split('/').collect();
    let unknown = || WireError::UnknownTopic(topic.to_string());
    let [root, mac, leaf] = parts.as_slice() else {
        return Err(unknown());
    };
    if mac.is_empty() {
        return Err(unknown());
    }
    let kind = match (*root, *leaf) {
        ("device", "status") => TopicKind::Status,
        ("device", "metadata") => TopicKind::Metadata,
        ("device", "chunk") => TopicKind::Chunk,
        ("ESP32CAM", "data") => TopicKind::CameraData,
        _ => return Err(unknown()),
    };
    Ok((mac.to_string(), kind))
}

pub fn command_topic(mac: &str) -> String {
    format!("device/{mac}/cmd")
}

pub fn ack_topic(mac: &str) -> String {
    format!("device/{mac}/ack")
}

#[derive(Clone, Debug, PartialEq)]
pub struct PresenceMessage {
    pub mac: String,
    pub device_id: Option<String>,
    pub status: String,
    pub pending_images: u32,
    pub error_code: Option<i64>,
    pub telemetry: TelemetryReading,
}

impl PresenceMessage {
    /// Non-zero error code or an explicit `error` status.
    pub fn reported_error(&self) -> Option<i64> {
        match self.error_code {
            Some(code) if code != 0 => Some(code),
            _ if self.status.eq_ignore_ascii_case("error") => Some(-1),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetadataMessage {
    pub mac: String,
    pub image_name: String,
    pub image_size: Option<u64>,
    pub max_chunk_size: Option<u32>,
    pub total_chunks: u32,
    pub captured_at: Option<DateTime<Utc>>,
    pub error_code: i64,
    pub telemetry: TelemetryReading,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChunkMessage {
    pub mac: String,
    pub image_name: String,
    pub index: u32,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    Presence(PresenceMessage),
    Metadata(MetadataMessage),
    Chunk(ChunkMessage),
}

impl InboundMessage {
    pub fn mac(&self) -> &str {
        match self {
            Self::Presence(m) => &m.mac,
            Self::Metadata(m) => &m.mac,
            Self::Chunk(m) => &m.mac,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Presence(_) => "presence",
            Self::Metadata(_) => "metadata",
            Self::Chunk(_) => "chunk",
        }
    }
}

#[derive(Deserialize)]
struct RawPresence {
    device_id: Option<String>,
    status: Option<String>,
    #[serde(rename = "pendingImg", alias = "pending_images", alias = "pendingCount")]
    pending: Option<i64>,
    error_code: Option<i64>,
    battery_voltage: Option<f64>,
    wifi_rssi: Option<f64>,
}

#[derive(Deserialize)]
struct RawMetadata {
    image_name: Option<String>,
    image_size: Option<u64>,
    max_chunk_size: Option<u32>,
    #[serde(alias = "total_chunk_count")]
    total_chunks_count: Option<i64>,
    capture_timestamp: Option<String>,
    error: Option<i64>,
    location: Option<String>,
    /// Firmware reports Fahrenheit.
    temperature: Option<f64>,
    temperature_c: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    gas_resistance: Option<f64>,
}

#[derive(Deserialize)]
struct RawChunk {
    image_name: Option<String>,
    chunk_id: Option<i64>,
    payload: Option<Value>,
}

/// Parse and normalize one inbound message.
pub fn parse_inbound(topic: &str, payload: &Value) -> Result<InboundMessage, WireError> {
    let (mac, kind) = classify_topic(topic)?;
    if !payload.is_object() {
        return Err(WireError::InvalidField {
            field: "payload",
            reason: "expected a JSON object".into(),
        });
    }
    match kind {
        TopicKind::Status => parse_presence(mac, payload).map(InboundMessage::Presence),
        TopicKind::Metadata => parse_metadata(mac, payload).map(InboundMessage::Metadata),
        TopicKind::Chunk => parse_chunk(mac, payload).map(InboundMessage::Chunk),
        TopicKind::CameraData if payload.get("chunk_id").is_some() => {
            parse_chunk(mac, payload).map(InboundMessage::Chunk)
        }
        TopicKind::CameraData => parse_metadata(mac, payload).map(InboundMessage::Metadata),
    }
}

fn parse_presence(mac: String, payload: &Value) -> Result<PresenceMessage, WireError> {
    let raw: RawPresence = serde_json::from_value(payload.clone())?;
    let pending = raw.pending.unwrap_or(0);
    if pending < 0 {
        return Err(WireError::InvalidField {
            field: "pendingImg",
            reason: format!("negative count {pending}"),
        });
    }
    Ok(PresenceMessage {
        mac,
        device_id: raw.device_id,
        status: raw.status.unwrap_or_else(|| "alive".to_string()),
        pending_images: u32::try_from(pending).unwrap_or(u32::MAX),
        error_code: raw.error_code,
        telemetry: TelemetryReading {
            battery_voltage: raw.battery_voltage,
            wifi_rssi: raw.wifi_rssi,
            ..Default::default()
        },
    })
}

fn parse_metadata(mac: String, payload: &Value) -> Result<MetadataMessage, WireError> {
    let raw: RawMetadata = serde_json::from_value(payload.clone())?;
    let total = raw.total_chunks_count.unwrap_or(0);
    let total_chunks = u32::try_from(total).map_err(|_| WireError::InvalidField {
        field: "total_chunks_count",
        reason: format!("{total} is not a valid chunk count"),
    })?;
    // Telemetry-only wakes carry no image at all.
    let image_name = match raw.image_name.filter(|n| !n.is_empty()) {
        Some(name) => name,
        None if total_chunks == 0 => String::new(),
        None => return Err(WireError::MissingField("image_name")),
    };

    let temperature_c = raw
        .temperature_c
        .or_else(|| raw.temperature.map(fahrenheit_to_celsius));

    Ok(MetadataMessage {
        mac,
        image_name,
        image_size: raw.image_size,
        max_chunk_size: raw.max_chunk_size,
        total_chunks,
        captured_at: raw.capture_timestamp.as_deref().and_then(parse_timestamp),
        error_code: raw.error.unwrap_or(0),
        telemetry: TelemetryReading {
            temperature_c,
            humidity: raw.humidity,
            pressure: raw.pressure,
            gas_resistance: raw.gas_resistance,
            location: raw.location,
            ..Default::default()
        },
    })
}

fn parse_chunk(mac: String, payload: &Value) -> Result<ChunkMessage, WireError> {
    let raw: RawChunk = serde_json::from_value(payload.clone())?;
    let image_name = raw
        .image_name
        .filter(|n| !n.is_empty())
        .ok_or(WireError::MissingField("image_name"))?;
    let id = raw.chunk_id.ok_or(WireError::MissingField("chunk_id"))?;
    let index = u32::try_from(id).map_err(|_| WireError::InvalidField {
        field: "chunk_id",
        reason: format!("{id} is not a valid index"),
    })?;
    let bytes = decode_chunk_payload(raw.payload.as_ref().ok_or(WireError::MissingField("payload"))?)?;
    Ok(ChunkMessage {
        mac,
        image_name,
        index,
        bytes,
    })
}

/// Chunk bytes arrive either as a JSON array of 0..=255 or as base64.
pub fn decode_chunk_payload(value: &Value) -> Result<Vec<u8>, WireError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| WireError::InvalidField {
                        field: "payload",
                        reason: format!("{item} is not a byte"),
                    })
            })
            .collect(),
        Value::String(s) => STANDARD.decode(s).map_err(|e| WireError::InvalidField {
            field: "payload",
            reason: e.to_string(),
        }),
        other => Err(WireError::InvalidField {
            field: "payload",
            reason: format!("unsupported payload type {other}"),
        }),
    }
}

/// ISO-8601 with or without an offset; naive values are taken as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|n| n.and_utc())
        })
}
