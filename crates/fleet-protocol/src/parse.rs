//! Decoding controller lines into typed messages.
//!
//! Decoding distinguishes a line that is not an envelope at all from an
//! envelope of a type we do not know, so the gateway can log each at the
//! right level without closing the session.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::message::{DeviceMessage, DEVICE_MESSAGE_KINDS};

/// Field carrying the message type.
pub const TYPE_FIELD: &str = "type";

/// Legacy field name still emitted by older firmware builds.
pub const LEGACY_TYPE_FIELD: &str = "message_type";

/// Reasons a line could not be turned into a [`DeviceMessage`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Malformed JSON: {0}")]
    Malformed(String),

    #[error("Envelope is not a JSON object")]
    NotAnObject,

    #[error("Envelope has no type field")]
    MissingType,

    #[error("Unknown message type: '{0}'")]
    UnknownType(String),

    #[error("Invalid {kind} message: {reason}")]
    InvalidFields { kind: String, reason: String },
}

impl ParseError {
    /// Returns true if the line was a well-formed envelope of an unknown type.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}

/// Decodes one line received from a controller.
///
/// Accepts the type under `type` or, for older firmware, `message_type`.
/// Surrounding whitespace (including the line terminator) is ignored.
pub fn decode_device_line(line: &str) -> Result<DeviceMessage, ParseError> {
    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| ParseError::Malformed(e.to_string()))?;

    let Value::Object(mut fields) = value else {
        return Err(ParseError::NotAnObject);
    };

    let kind = message_kind(&mut fields)?;

    if !DEVICE_MESSAGE_KINDS.contains(&kind.as_str()) {
        return Err(ParseError::UnknownType(kind));
    }

    serde_json::from_value(Value::Object(fields)).map_err(|e| ParseError::InvalidFields {
        kind,
        reason: e.to_string(),
    })
}

/// Extracts the type tag, normalising the legacy field onto `type`.
fn message_kind(fields: &mut Map<String, Value>) -> Result<String, ParseError> {
    if let Some(Value::String(kind)) = fields.get(TYPE_FIELD) {
        let kind = kind.clone();
        fields.remove(LEGACY_TYPE_FIELD);
        return Ok(kind);
    }

    match fields.remove(LEGACY_TYPE_FIELD) {
        Some(Value::String(kind)) => {
            fields.insert(TYPE_FIELD.to_string(), Value::String(kind.clone()));
            Ok(kind)
        }
        _ => Err(ParseError::MissingType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{CommandId, DeviceId, DeviceType};

    #[test]
    fn test_registration_parsing() {
        let line = r#"{"type":"registration","device_id":"servoscontroller","device_type":"servo-driver","metadata":{"fw":"1.0.0"}}"#;
        let msg = decode_device_line(line).unwrap();
        match msg {
            DeviceMessage::Registration {
                device_id,
                device_type,
                metadata,
            } => {
                assert_eq!(device_id, DeviceId::new("servoscontroller"));
                assert_eq!(device_type, DeviceType::new("servo-driver"));
                let metadata = metadata.expect("metadata present");
                assert_eq!(metadata.get("fw"), Some(&serde_json::json!("1.0.0")));
            }
            other => panic!("Expected Registration, got {other:?}"),
        }
    }

    #[test]
    fn test_registration_without_metadata() {
        let line = r#"{"type":"registration","device_id":"wheels","device_type":"wheel-driver"}"#;
        assert!(matches!(
            decode_device_line(line),
            Ok(DeviceMessage::Registration { metadata: None, .. })
        ));
    }

    #[test]
    fn test_legacy_message_type_field() {
        let line = r#"{"message_type":"heartbeat","device_id":"wheels"}"#;
        assert_eq!(
            decode_device_line(line).unwrap(),
            DeviceMessage::Heartbeat {
                device_id: Some(DeviceId::new("wheels"))
            }
        );
    }

    #[test]
    fn test_command_ack_defaults_to_success() {
        let line = r#"{"type":"command_ack","command_id":"abc"}"#;
        assert_eq!(
            decode_device_line(line).unwrap(),
            DeviceMessage::CommandAck {
                command_id: CommandId::new("abc"),
                status: "success".to_string(),
            }
        );
    }

    #[test]
    fn test_trailing_newline_ignored() {
        let line = "{\"type\":\"ping\",\"timestamp\":42}\n";
        assert_eq!(
            decode_device_line(line).unwrap(),
            DeviceMessage::Ping {
                timestamp: serde_json::json!(42)
            }
        );
    }

    #[test]
    fn test_unknown_type() {
        let err = decode_device_line(r#"{"type":"telemetry","x":1}"#).unwrap_err();
        assert_eq!(err, ParseError::UnknownType("telemetry".to_string()));
        assert!(err.is_unknown_type());
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(decode_device_line("not json"), Err(ParseError::Malformed(_))));
        assert!(matches!(decode_device_line(r#"{"type":"#), Err(ParseError::Malformed(_))));
        assert_eq!(decode_device_line("[1,2]"), Err(ParseError::NotAnObject));
        assert_eq!(decode_device_line(r#"{"device_id":"x"}"#), Err(ParseError::MissingType));
        assert_eq!(decode_device_line(r#"{"type":7}"#), Err(ParseError::MissingType));
    }

    #[test]
    fn test_missing_required_field() {
        let err = decode_device_line(r#"{"type":"registration","device_id":"x"}"#).unwrap_err();
        match err {
            ParseError::InvalidFields { kind, reason } => {
                assert_eq!(kind, "registration");
                assert!(reason.contains("device_type"));
            }
            other => panic!("Expected InvalidFields, got {other:?}"),
        }
    }

    #[test]
    fn test_servo_feedback_from_firmware() {
        let line = r#"{"type":"feedback","channel":0,"current_angle":119.5,"target_angle":120.5,"pulse_width_us":1610,"pwm_ticks":329,"is_moving":false,"timestamp":"2026-01-26T12:35:02"}"#;
        match decode_device_line(line).unwrap() {
            DeviceMessage::ServoFeedback(feedback) => {
                assert_eq!(feedback.channel, 0);
                assert_eq!(feedback.current_angle, 119.5);
                assert_eq!(feedback.target_angle, Some(120.5));
                assert_eq!(feedback.pulse_width_us, Some(1610));
                assert_eq!(feedback.pca9685_ticks, Some(329));
                assert!(!feedback.is_moving);
            }
            other => panic!("Expected ServoFeedback, got {other:?}"),
        }
    }

    #[test]
    fn test_servo_fault_from_firmware() {
        let line = r#"{"type":"error","channel":3,"error_code":2,"error_message":"Angle 250 exceeds max 180"}"#;
        match decode_device_line(line).unwrap() {
            DeviceMessage::ServoFault(fault) => {
                assert_eq!(fault.channel, Some(3));
                assert_eq!(fault.error_code, 2);
                assert_eq!(fault.error_message, "Angle 250 exceeds max 180");
            }
            other => panic!("Expected ServoFault, got {other:?}"),
        }

        // Board-level fault with the short field name
        let line = r#"{"message_type":"error","error":"PCA9685 not found"}"#;
        assert!(matches!(
            decode_device_line(line),
            Ok(DeviceMessage::ServoFault(fault)) if fault.channel.is_none() && fault.error_code == 0
        ));
    }
}
