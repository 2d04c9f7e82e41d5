use atvlink_protocol::DeviceId;
use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Error details in a link message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

/// Envelope for all link communication.
///
/// The `payload` field uses `serde_json::value::RawValue` so it is only
/// parsed once the receiver knows the expected type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Message {
    /// Creates a new message with the given type and payload.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            id: id.into(),
            msg_type,
            device: None,
            payload: raw,
            error: None,
        })
    }

    /// Addresses the message to a device.
    pub fn for_device(mut self, device: &DeviceId) -> Self {
        self.device = Some(device.clone());
        self
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Creates an error message.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg_type: MessageType::Error,
            device: None,
            payload: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// Creates a response message for this request.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let mut reply = Message::new(&self.id, msg_type, payload)?;
        reply.device = self.device.clone();
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atvlink_protocol::{DeviceEvent, PowerState};

    #[test]
    fn message_new_with_payload() {
        let payload = serde_json::json!({"key": "value"});
        let msg = Message::new("msg-1", MessageType::Command, Some(&payload)).unwrap();
        assert_eq!(msg.id, "msg-1");
        assert_eq!(msg.msg_type, MessageType::Command);
        assert!(msg.payload.is_some());
        assert!(msg.error.is_none());
    }

    #[test]
    fn message_error_creation() {
        let msg = Message::error("msg-3", 401, "bad credentials");
        assert_eq!(msg.msg_type, MessageType::Error);
        let err = msg.error.unwrap();
        assert_eq!(err.code, 401);
        assert_eq!(err.message, "bad credentials");
    }

    #[test]
    fn event_payload_parses() {
        let event = DeviceEvent::PowerStateChanged(PowerState::On);
        let msg = Message::new("e1", MessageType::Event, Some(&event))
            .unwrap()
            .for_device(&DeviceId::new("tv-1"));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.device, Some(DeviceId::new("tv-1")));
        assert_eq!(parsed.parse_payload::<DeviceEvent>().unwrap(), Some(event));
    }

    #[test]
    fn message_omits_null_fields() {
        let msg = Message::new::<()>("m1", MessageType::Hello, None).unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("payload"));
        assert!(!json.contains("error"));
        assert!(!json.contains("device"));
    }

    #[test]
    fn reply_preserves_id_and_device() {
        let original = Message::new::<()>("req-42", MessageType::Connect, None)
            .unwrap()
            .for_device(&DeviceId::new("tv-1"));
        let reply = original
            .reply(MessageType::Connected, Some(&serde_json::json!({})))
            .unwrap();
        assert_eq!(reply.id, "req-42");
        assert_eq!(reply.device, Some(DeviceId::new("tv-1")));
    }
}
