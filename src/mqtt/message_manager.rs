use crate::error::{DecodeError, SessionError};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Key/value readings as the appliance sends them, e.g. `"fnsp" -> "0005"`
pub type Readings = BTreeMap<String, String>;

/// Fields of a `STATE-SET` command
pub type CommandFields = BTreeMap<String, String>;

pub const MSG_CURRENT_STATE: &str = "CURRENT-STATE";
pub const MSG_STATE_CHANGE: &str = "STATE-CHANGE";
pub const MSG_ENVIRONMENTAL: &str = "ENVIRONMENTAL-CURRENT-SENSOR-DATA";
pub const MSG_LOCATION: &str = "LOCATION";
pub const MSG_CURRENT_FAULTS: &str = "CURRENT-FAULTS";
pub const MSG_FAULTS_CHANGE: &str = "FAULTS-CHANGE";
pub const MSG_STATE_SET: &str = "STATE-SET";
pub const MSG_REQUEST_CURRENT_STATE: &str = "REQUEST-CURRENT-STATE";

const MODE_REASON: &str = "RAPP";

/// Raw message as handed over by the transport's receive thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Local>,
}

impl InboundMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: Local::now(),
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = String::from_utf8_lossy(&self.payload);
        let preview: String = content.chars().take(60).collect();
        write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
    }
}

/// Discriminant of a decoded device message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    CurrentState,
    StateChange,
    Environmental,
    Location,
    Fault,
    Unknown,
}

impl MessageKind {
    pub fn from_type(msg_type: &str) -> Self {
        match msg_type {
            MSG_CURRENT_STATE => MessageKind::CurrentState,
            MSG_STATE_CHANGE => MessageKind::StateChange,
            MSG_ENVIRONMENTAL => MessageKind::Environmental,
            MSG_LOCATION => MessageKind::Location,
            MSG_CURRENT_FAULTS | MSG_FAULTS_CHANGE => MessageKind::Fault,
            _ => MessageKind::Unknown,
        }
    }
}

/// One setting's transition inside a `STATE-CHANGE` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub previous: Option<String>,
    pub current: String,
}

/// A status message decoded once at the router boundary
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    CurrentState {
        time: Option<String>,
        product_state: Readings,
    },
    StateChange {
        time: Option<String>,
        changes: BTreeMap<String, Change>,
    },
    Environmental {
        time: Option<String>,
        data: Readings,
    },
    Location {
        time: Option<String>,
        fields: Map<String, Value>,
    },
    Fault {
        msg_type: String,
        time: Option<String>,
        fields: Map<String, Value>,
    },
    Unknown {
        msg_type: String,
        time: Option<String>,
    },
}

impl DeviceMessage {
    /// Decodes a raw status payload
    ///
    /// Only the envelope shape is checked here; unknown message types decode
    /// to [`DeviceMessage::Unknown`] rather than failing.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let Value::Object(mut object) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let msg_type = match object.remove("msg") {
            Some(Value::String(msg)) => msg,
            _ => return Err(DecodeError::MissingType),
        };
        let time = object.remove("time").map(|t| value_to_string(&t));

        let message = match MessageKind::from_type(&msg_type) {
            MessageKind::CurrentState => DeviceMessage::CurrentState {
                time,
                product_state: readings(object.get("product-state")),
            },
            MessageKind::StateChange => DeviceMessage::StateChange {
                time,
                changes: changes(object.get("product-state")),
            },
            MessageKind::Environmental => DeviceMessage::Environmental {
                time,
                data: readings(object.get("data")),
            },
            MessageKind::Location => DeviceMessage::Location {
                time,
                fields: object,
            },
            MessageKind::Fault => DeviceMessage::Fault {
                msg_type,
                time,
                fields: object,
            },
            MessageKind::Unknown => DeviceMessage::Unknown { msg_type, time },
        };
        Ok(message)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            DeviceMessage::CurrentState { .. } => MessageKind::CurrentState,
            DeviceMessage::StateChange { .. } => MessageKind::StateChange,
            DeviceMessage::Environmental { .. } => MessageKind::Environmental,
            DeviceMessage::Location { .. } => MessageKind::Location,
            DeviceMessage::Fault { .. } => MessageKind::Fault,
            DeviceMessage::Unknown { .. } => MessageKind::Unknown,
        }
    }

    pub fn time(&self) -> Option<&str> {
        match self {
            DeviceMessage::CurrentState { time, .. }
            | DeviceMessage::StateChange { time, .. }
            | DeviceMessage::Environmental { time, .. }
            | DeviceMessage::Location { time, .. }
            | DeviceMessage::Fault { time, .. }
            | DeviceMessage::Unknown { time, .. } => time.as_deref(),
        }
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn readings(section: Option<&Value>) -> Readings {
    match section {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| (key.clone(), value_to_string(value)))
            .collect(),
        _ => Readings::new(),
    }
}

// Each entry is `[previous, new]`; a bare scalar is taken as the new value.
fn changes(section: Option<&Value>) -> BTreeMap<String, Change> {
    let Some(Value::Object(map)) = section else {
        return BTreeMap::new();
    };

    map.iter()
        .map(|(key, value)| {
            let change = match value {
                Value::Array(pair) if pair.len() == 2 => Change {
                    previous: Some(value_to_string(&pair[0])),
                    current: value_to_string(&pair[1]),
                },
                other => Change {
                    previous: None,
                    current: value_to_string(other),
                },
            };
            (key.clone(), change)
        })
        .collect()
}

/// Timestamp in the appliance's wire format, second precision UTC
pub fn wire_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Debug, Serialize)]
struct CommandEnvelope<'a> {
    data: &'a CommandFields,
    msg: &'static str,
    time: String,
    #[serde(rename = "mode-reason")]
    mode_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct RequestEnvelope {
    msg: &'static str,
    time: String,
}

/// Serialises a `STATE-SET` envelope for the given fields
pub fn state_set_payload(
    fields: &CommandFields,
    now: DateTime<Utc>,
) -> Result<Vec<u8>, SessionError> {
    let envelope = CommandEnvelope {
        data: fields,
        msg: MSG_STATE_SET,
        time: wire_timestamp(now),
        mode_reason: MODE_REASON,
    };
    serde_json::to_vec(&envelope)
        .map_err(|e| SessionError::Publish(format!("Failed to encode STATE-SET: {}", e)))
}

/// Serialises a `REQUEST-CURRENT-STATE` envelope
pub fn request_state_payload(now: DateTime<Utc>) -> Result<Vec<u8>, SessionError> {
    let envelope = RequestEnvelope {
        msg: MSG_REQUEST_CURRENT_STATE,
        time: wire_timestamp(now),
    };
    serde_json::to_vec(&envelope).map_err(|e| {
        SessionError::Publish(format!("Failed to encode REQUEST-CURRENT-STATE: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn decode(value: Value) -> DeviceMessage {
        DeviceMessage::decode(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_decode_current_state() {
        let msg = decode(json!({
            "msg": "CURRENT-STATE",
            "time": "2025-01-01T10:00:00.000Z",
            "product-state": {"fnsp": "0005", "fpwr": "ON"}
        }));

        assert_eq!(msg.kind(), MessageKind::CurrentState);
        assert_eq!(msg.time(), Some("2025-01-01T10:00:00.000Z"));
        match msg {
            DeviceMessage::CurrentState { product_state, .. } => {
                assert_eq!(product_state.get("fnsp").map(String::as_str), Some("0005"));
                assert_eq!(product_state.get("fpwr").map(String::as_str), Some("ON"));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_state_change_takes_pairs_and_scalars() {
        let msg = decode(json!({
            "msg": "STATE-CHANGE",
            "product-state": {"fnsp": ["0005", "0003"], "rssi": -42}
        }));

        let DeviceMessage::StateChange { changes, .. } = msg else {
            panic!("expected state change");
        };
        assert_eq!(
            changes["fnsp"],
            Change {
                previous: Some("0005".into()),
                current: "0003".into()
            }
        );
        assert_eq!(
            changes["rssi"],
            Change {
                previous: None,
                current: "-42".into()
            }
        );
    }

    #[test]
    fn test_decode_environmental_and_faults() {
        let env = decode(json!({
            "msg": "ENVIRONMENTAL-CURRENT-SENSOR-DATA",
            "data": {"pm25": "0004", "pm10": "0007"}
        }));
        assert_eq!(env.kind(), MessageKind::Environmental);

        let fault = decode(json!({"msg": "CURRENT-FAULTS", "product-errors": {}}));
        assert_eq!(fault.kind(), MessageKind::Fault);

        let location = decode(json!({"msg": "LOCATION", "apos": "0180"}));
        let DeviceMessage::Location { fields, .. } = location else {
            panic!("expected location");
        };
        assert_eq!(fields.get("apos"), Some(&json!("0180")));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let msg = decode(json!({"msg": "HELLO"}));
        assert_eq!(
            msg,
            DeviceMessage::Unknown {
                msg_type: "HELLO".into(),
                time: None
            }
        );
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        assert!(matches!(
            DeviceMessage::decode(b"not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            DeviceMessage::decode(b"[1,2]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            DeviceMessage::decode(br#"{"time":"x"}"#),
            Err(DecodeError::MissingType)
        ));
    }

    #[test]
    fn test_state_set_envelope_shape() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let mut fields = CommandFields::new();
        fields.insert("fpwr".into(), "ON".into());

        let payload = state_set_payload(&fields, now).unwrap();
        let payload: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            payload,
            json!({
                "data": {"fpwr": "ON"},
                "msg": "STATE-SET",
                "time": "2025-03-04T05:06:07Z",
                "mode-reason": "RAPP"
            })
        );
    }

    #[test]
    fn test_request_envelope_shape() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let payload = request_state_payload(now).unwrap();
        let payload: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            payload,
            json!({"msg": "REQUEST-CURRENT-STATE", "time": "2025-03-04T05:06:07Z"})
        );
    }

    #[test]
    fn test_state_set_payload_carries_every_field() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let mut fields = CommandFields::new();
        fields.insert("oson".into(), "ON".into());
        fields.insert("osal".into(), "0135".into());
        fields.insert("osau".into(), "0225".into());

        let payload = state_set_payload(&fields, now).unwrap();
        assert!(!payload.is_empty());
        let payload: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(payload["data"].as_object().map(Map::len), Some(3));
        assert_eq!(payload["data"]["osal"], "0135");
    }
}
