use serde::{Deserialize, Serialize};

use crate::constants::MessageType;
use crate::error::ProtocolError;

/// Error details carried by an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

/// Envelope for every message on a stream.
///
/// `seq` is chosen by the requester and echoed by the reply, so a reply can
/// always be matched to the single outstanding request. The `payload` is kept
/// raw until the state machine knows which type to decode it as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Message {
    /// Creates a new message with the given type and payload.
    pub fn new<T: Serialize>(
        seq: u64,
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
            seq,
            msg_type,
            payload: raw,
            error: None,
        })
    }

    /// Creates a message that carries no payload.
    pub fn bare(seq: u64, msg_type: MessageType) -> Self {
        Self {
            seq,
            msg_type,
            payload: None,
            error: None,
        }
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

    /// Deserializes a payload that must be present.
    pub fn require_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        self.parse_payload()?
            .ok_or(ProtocolError::MissingPayload(self.msg_type))
    }

    /// Creates an error message.
    pub fn error(seq: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            seq,
            msg_type: MessageType::Error,
            payload: None,
            error: Some(WireError {
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
        Message::new(self.seq, msg_type, payload)
    }

    /// Creates a payload-less response for this request.
    pub fn reply_bare(&self, msg_type: MessageType) -> Self {
        Message::bare(self.seq, msg_type)
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(self.seq, code, message)
    }
}
