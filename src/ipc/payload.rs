// src/ipc/payload.rs

//! Wire format for everything that crosses a hub connection.
//!
//! The wire shape is a flat envelope (`opcode`, `author`, `recipients`,
//! `data`) so the hub can forward frames without fully decoding them — it
//! only needs `recipients` to route. Clients decode `data` according to
//! `opcode` into one of the five logical [`Payload`] variants.

use crate::error::FleetError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection identifier assigned by the hub at handshake time.
pub type Uid = u32;

/// WebSocket close code the hub sends when the handshake token doesn't match.
pub const INVALID_TOKEN_CLOSE_CODE: u16 = 4001;

/// Identifier correlating a command to its eventual response(s).
pub type CallbackId = u64;

const OP_COMMAND: u8 = 0;
const OP_EVENT: u8 = 1;
const OP_RESPONSE_OK: u8 = 2;
const OP_RESPONSE_TRACEBACK: u8 = 3;
const OP_RESPONSE_NOT_FOUND: u8 = 4;

/// The flat shape actually serialized onto the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    opcode: u8,
    author: Uid,
    recipients: Vec<Uid>,
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommandData {
    callback: CallbackId,
    name: String,
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventData {
    name: String,
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResponseOkData {
    callback: CallbackId,
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResponseTracebackData {
    callback: CallbackId,
    traceback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResponseNotFoundData {
    callback: CallbackId,
}

/// A fully-decoded application-level message.
#[derive(Debug, Clone)]
pub enum Payload {
    Command {
        author: Uid,
        recipients: Vec<Uid>,
        callback: CallbackId,
        name: String,
        data: Value,
    },
    Event {
        author: Uid,
        recipients: Vec<Uid>,
        name: String,
        data: Value,
    },
    ResponseOk {
        author: Uid,
        recipients: Vec<Uid>,
        callback: CallbackId,
        data: Value,
    },
    ResponseTraceback {
        author: Uid,
        recipients: Vec<Uid>,
        callback: CallbackId,
        traceback: String,
    },
    ResponseNotFound {
        author: Uid,
        recipients: Vec<Uid>,
        callback: CallbackId,
    },
}

impl Payload {
    /// The recipient uids this payload should be routed to.
    pub fn recipients(&self) -> &[Uid] {
        match self {
            Self::Command { recipients, .. }
            | Self::Event { recipients, .. }
            | Self::ResponseOk { recipients, .. }
            | Self::ResponseTraceback { recipients, .. }
            | Self::ResponseNotFound { recipients, .. } => recipients,
        }
    }

    pub fn author(&self) -> Uid {
        match self {
            Self::Command { author, .. }
            | Self::Event { author, .. }
            | Self::ResponseOk { author, .. }
            | Self::ResponseTraceback { author, .. }
            | Self::ResponseNotFound { author, .. } => *author,
        }
    }

    /// Serialize to the wire JSON text frame.
    pub fn to_json(&self) -> Result<String, FleetError> {
        let envelope = match self {
            Self::Command {
                author,
                recipients,
                callback,
                name,
                data,
            } => Envelope {
                opcode: OP_COMMAND,
                author: *author,
                recipients: recipients.clone(),
                data: serde_json::to_value(CommandData {
                    callback: *callback,
                    name: name.clone(),
                    data: data.clone(),
                })?,
            },
            Self::Event {
                author,
                recipients,
                name,
                data,
            } => Envelope {
                opcode: OP_EVENT,
                author: *author,
                recipients: recipients.clone(),
                data: serde_json::to_value(EventData {
                    name: name.clone(),
                    data: data.clone(),
                })?,
            },
            Self::ResponseOk {
                author,
                recipients,
                callback,
                data,
            } => Envelope {
                opcode: OP_RESPONSE_OK,
                author: *author,
                recipients: recipients.clone(),
                data: serde_json::to_value(ResponseOkData {
                    callback: *callback,
                    data: data.clone(),
                })?,
            },
            Self::ResponseTraceback {
                author,
                recipients,
                callback,
                traceback,
            } => Envelope {
                opcode: OP_RESPONSE_TRACEBACK,
                author: *author,
                recipients: recipients.clone(),
                data: serde_json::to_value(ResponseTracebackData {
                    callback: *callback,
                    traceback: traceback.clone(),
                })?,
            },
            Self::ResponseNotFound {
                author,
                recipients,
                callback,
            } => Envelope {
                opcode: OP_RESPONSE_NOT_FOUND,
                author: *author,
                recipients: recipients.clone(),
                data: serde_json::to_value(ResponseNotFoundData { callback: *callback })?,
            },
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Parse a wire JSON text frame into a typed payload.
    pub fn from_json(text: &str) -> Result<Self, FleetError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let Envelope {
            opcode,
            author,
            recipients,
            data,
        } = envelope;

        Ok(match opcode {
            OP_COMMAND => {
                let d: CommandData = serde_json::from_value(data)?;
                Self::Command {
                    author,
                    recipients,
                    callback: d.callback,
                    name: d.name,
                    data: d.data,
                }
            }
            OP_EVENT => {
                let d: EventData = serde_json::from_value(data)?;
                Self::Event {
                    author,
                    recipients,
                    name: d.name,
                    data: d.data,
                }
            }
            OP_RESPONSE_OK => {
                let d: ResponseOkData = serde_json::from_value(data)?;
                Self::ResponseOk {
                    author,
                    recipients,
                    callback: d.callback,
                    data: d.data,
                }
            }
            OP_RESPONSE_TRACEBACK => {
                let d: ResponseTracebackData = serde_json::from_value(data)?;
                Self::ResponseTraceback {
                    author,
                    recipients,
                    callback: d.callback,
                    traceback: d.traceback,
                }
            }
            OP_RESPONSE_NOT_FOUND => {
                let d: ResponseNotFoundData = serde_json::from_value(data)?;
                Self::ResponseNotFound {
                    author,
                    recipients,
                    callback: d.callback,
                }
            }
            other => return Err(FleetError::Protocol(format!("unknown opcode {other}"))),
        })
    }
}

/// The hub's own presence broadcast frame — not routed, sent directly to
/// every connection every 5 seconds, so it is kept out of the `Payload`
/// enum entirely (it never carries `recipients`/`author`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceFrame {
    pub internal: bool,
    pub client_uids: Vec<Uid>,
}

impl PresenceFrame {
    pub fn new(client_uids: Vec<Uid>) -> Self {
        Self {
            internal: true,
            client_uids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips() {
        let payload = Payload::Command {
            author: 1,
            recipients: vec![2, 3],
            callback: 42,
            name: "ping".into(),
            data: serde_json::json!({"x": 1}),
        };
        let json = payload.to_json().unwrap();
        let decoded = Payload::from_json(&json).unwrap();
        match decoded {
            Payload::Command {
                author,
                recipients,
                callback,
                name,
                data,
            } => {
                assert_eq!(author, 1);
                assert_eq!(recipients, vec![2, 3]);
                assert_eq!(callback, 42);
                assert_eq!(name, "ping");
                assert_eq!(data, serde_json::json!({"x": 1}));
            }
            other => panic!("wrong variant decoded: {other:?}"),
        }
    }

    #[test]
    fn response_not_found_round_trips() {
        let payload = Payload::ResponseNotFound {
            author: 5,
            recipients: vec![1],
            callback: 7,
        };
        let json = payload.to_json().unwrap();
        let decoded = Payload::from_json(&json).unwrap();
        assert!(matches!(decoded, Payload::ResponseNotFound { callback: 7, .. }));
    }

    #[test]
    fn unknown_opcode_is_protocol_error() {
        let raw = r#"{"opcode":99,"author":0,"recipients":[],"data":{}}"#;
        let err = Payload::from_json(raw).unwrap_err();
        assert!(matches!(err, FleetError::Protocol(_)));
    }

    #[test]
    fn presence_frame_marks_internal() {
        let frame = PresenceFrame::new(vec![1, 2, 3]);
        assert!(frame.internal);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"internal\":true"));
    }
}
