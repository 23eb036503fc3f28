//! Outbound commands and their firmware encoding.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::wire::{ack_topic, command_topic};

/// A command for one device, in domain terms.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Ask the device to capture. With `resend`, ask it to resend a buffered
    /// image instead.
    CaptureImage { resend: Option<String> },
    /// Acknowledge chunk progress and list the gaps the device should resend.
    ChunkAck {
        image_name: String,
        received: u32,
        total: u32,
        missing_chunks: Vec<u32>,
    },
    /// Go back to sleep until `next_wake`.
    Sleep {
        next_wake: DateTime<Utc>,
        image_name: Option<String>,
    },
}

/// Encoded command ready for the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub topic: String,
    pub payload: Value,
}

pub fn format_wake_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Command {
    pub fn capture() -> Self {
        Self::CaptureImage { resend: None }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CaptureImage { resend: None } => "capture_image",
            Self::CaptureImage { resend: Some(_) } => "send_image",
            Self::ChunkAck { .. } => "chunk_ack",
            Self::Sleep { .. } => "sleep",
        }
    }

    pub fn is_capture_request(&self) -> bool {
        matches!(self, Self::CaptureImage { .. })
    }

    pub fn topic(&self, mac: &str) -> String {
        match self {
            Self::CaptureImage { .. } => command_topic(mac),
            Self::ChunkAck { .. } => ack_topic(mac),
            Self::Sleep {
                image_name: Some(_),
                ..
            } => ack_topic(mac),
            Self::Sleep { image_name: None, .. } => command_topic(mac),
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::CaptureImage { resend: None } => json!({ "capture_image": true }),
            Self::CaptureImage { resend: Some(name) } => json!({ "send_image": name }),
            Self::ChunkAck {
                image_name,
                received,
                total,
                missing_chunks,
            } => json!({
                "image_name": image_name,
                "received": received,
                "total": total,
                "missing_chunks": missing_chunks,
            }),
            Self::Sleep {
                next_wake,
                image_name: Some(name),
            } => json!({
                "ACK_OK": {
                    "image_name": name,
                    "next_wake_time": format_wake_time(*next_wake),
                }
            }),
            Self::Sleep {
                next_wake,
                image_name: None,
            } => json!({ "next_wake": format_wake_time(*next_wake) }),
        }
    }

    pub fn encode(&self, mac: &str) -> OutboundCommand {
        OutboundCommand {
            topic: self.topic(mac),
            payload: self.payload(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn capture_request_encoding() {
        let out = Command::capture().encode("M1");
        assert_eq!(out.topic, "device/M1/cmd");
        assert_eq!(out.payload, json!({"capture_image": true}));

        let resend = Command::CaptureImage {
            resend: Some("img_9.jpg".into()),
        };
        assert_eq!(resend.kind(), "send_image");
        assert_eq!(resend.payload(), json!({"send_image": "img_9.jpg"}));
    }

    #[test]
    fn chunk_ack_goes_to_ack_topic() {
        let cmd = Command::ChunkAck {
            image_name: "a.jpg".into(),
            received: 2,
            total: 4,
            missing_chunks: vec![1],
        };
        let out = cmd.encode("M1");
        assert_eq!(out.topic, "device/M1/ack");
        assert_eq!(out.payload["missing_chunks"], json!([1]));
    }

    #[test]
    fn sleep_encodings() {
        let next = at("2026-05-01T11:00:00.500Z");
        let after_image = Command::Sleep {
            next_wake: next,
            image_name: Some("a.jpg".into()),
        }
        .encode("M1");
        assert_eq!(after_image.topic, "device/M1/ack");
        assert_eq!(
            after_image.payload["ACK_OK"]["next_wake_time"],
            json!("2026-05-01T11:00:00Z")
        );

        let plain = Command::Sleep {
            next_wake: next,
            image_name: None,
        }
        .encode("M1");
        assert_eq!(plain.topic, "device/M1/cmd");
        assert_eq!(plain.payload, json!({"next_wake": "2026-05-01T11:00:00Z"}));
    }

    #[test]
    fn serde_roundtrip_for_outbox() {
        let cmd = Command::Sleep {
            next_wake: at("2026-05-01T11:00:00Z"),
            image_name: None,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"kind\":\"sleep\""));
        assert_eq!(serde_json::from_str::<Command>(&json).unwrap(), cmd);
    }
}
