//! Client-facing wire envelope.
//!
//! Every frame on the wire and every record in a mailbox log is
//! `{"op": <code>, "payload": {...}}`. The op code is read once into
//! [`OpCode`] and then exactly one payload type is decoded for it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OpCode {
    PrivateMessage = 0,
    GroupMessage = 1,
    GroupCount = 3,
    GroupRoster = 4,
    PresenceOnline = 5,
    PresenceOffline = 6,
}

impl OpCode {
    /// Ops addressed to a group and fanned out by the registry.
    pub fn is_group(self) -> bool {
        matches!(
            self,
            Self::GroupMessage | Self::GroupCount | Self::GroupRoster
        )
    }

    /// Chat ops travel on the message queue and are archived after delivery.
    pub fn is_chat(self) -> bool {
        matches!(self, Self::PrivateMessage | Self::GroupMessage)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::PrivateMessage => "private_message",
            Self::GroupMessage => "group_message",
            Self::GroupCount => "group_count",
            Self::GroupRoster => "group_roster",
            Self::PresenceOnline => "presence_online",
            Self::PresenceOffline => "presence_offline",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = EnvelopeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::PrivateMessage),
            1 => Ok(Self::GroupMessage),
            3 => Ok(Self::GroupCount),
            4 => Ok(Self::GroupRoster),
            5 => Ok(Self::PresenceOnline),
            6 => Ok(Self::PresenceOffline),
            other => Err(EnvelopeError::UnknownOp(other)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Unique id used by clients and the archive to drop duplicates.
    pub message_id: String,
    pub from: u64,
    /// Recipient user id for private messages, group id for group messages.
    pub target: u64,
    pub content: String,
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCount {
    pub group_id: u64,
    pub online_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterMember {
    pub id: u64,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRoster {
    pub group_id: u64,
    pub online_count: u64,
    #[serde(default)]
    pub members: Vec<RosterMember>,
    #[serde(default)]
    pub online_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    /// User whose presence changed.
    pub who: u64,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    PrivateMessage(ChatMessage),
    GroupMessage(ChatMessage),
    GroupCount(GroupCount),
    GroupRoster(GroupRoster),
    PresenceOnline(Presence),
    PresenceOffline(Presence),
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown op code {0}")]
    UnknownOp(u8),
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid {} payload: {source}", .op.label())]
    Payload {
        op: OpCode,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Deserialize)]
struct RawFrame {
    op: u8,
    #[serde(default)]
    payload: Value,
}

#[derive(Serialize)]
struct FrameRef<'a, T: Serialize> {
    op: OpCode,
    payload: &'a T,
}

impl Envelope {
    pub fn op(&self) -> OpCode {
        match self {
            Self::PrivateMessage(_) => OpCode::PrivateMessage,
            Self::GroupMessage(_) => OpCode::GroupMessage,
            Self::GroupCount(_) => OpCode::GroupCount,
            Self::GroupRoster(_) => OpCode::GroupRoster,
            Self::PresenceOnline(_) => OpCode::PresenceOnline,
            Self::PresenceOffline(_) => OpCode::PresenceOffline,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let raw: RawFrame = serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)?;
        let op = OpCode::try_from(raw.op)?;
        Self::from_parts(op, raw.payload)
    }

    /// Decode the payload for an already-known op code.
    pub fn from_parts(op: OpCode, payload: Value) -> Result<Self, EnvelopeError> {
        let invalid = |source| EnvelopeError::Payload { op, source };
        let envelope = match op {
            OpCode::PrivateMessage => {
                Self::PrivateMessage(serde_json::from_value(payload).map_err(invalid)?)
            }
            OpCode::GroupMessage => {
                Self::GroupMessage(serde_json::from_value(payload).map_err(invalid)?)
            }
            OpCode::GroupCount => Self::GroupCount(serde_json::from_value(payload).map_err(invalid)?),
            OpCode::GroupRoster => {
                Self::GroupRoster(serde_json::from_value(payload).map_err(invalid)?)
            }
            OpCode::PresenceOnline => {
                Self::PresenceOnline(serde_json::from_value(payload).map_err(invalid)?)
            }
            OpCode::PresenceOffline => {
                Self::PresenceOffline(serde_json::from_value(payload).map_err(invalid)?)
            }
        };
        Ok(envelope)
    }

    pub fn encode_to_string(&self) -> Result<String, EnvelopeError> {
        let op = self.op();
        let encoded = match self {
            Self::PrivateMessage(msg) | Self::GroupMessage(msg) => {
                serde_json::to_string(&FrameRef { op, payload: msg })
            }
            Self::GroupCount(count) => serde_json::to_string(&FrameRef { op, payload: count }),
            Self::GroupRoster(roster) => serde_json::to_string(&FrameRef { op, payload: roster }),
            Self::PresenceOnline(presence) | Self::PresenceOffline(presence) => {
                serde_json::to_string(&FrameRef {
                    op,
                    payload: presence,
                })
            }
        };
        encoded.map_err(EnvelopeError::Encode)
    }

    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        self.encode_to_string().map(Bytes::from)
    }

    pub fn chat(&self) -> Option<&ChatMessage> {
        match self {
            Self::PrivateMessage(msg) | Self::GroupMessage(msg) => Some(msg),
            _ => None,
        }
    }
}
