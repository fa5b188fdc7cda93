//! Wire vocabulary shared by both transports.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::identity::Peer;

/// Reserved call answered by whichever context believes it is master.
pub const CHECK_ALIVE: &str = "CHECK_ALIVE";

/// Reserved error codes carried in [`CallResponse::error`].
pub mod codes {
    /// No responder is registered under the requested name.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// The responder declined to answer.
    pub const IGNORED: &str = "IGNORED";
}

/// The kind of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    // ── Hub handshake ───────────────────────────────────────────────
    /// Hub → client: attach accepted, carries the initial state.
    Connected,
    /// Client → hub: declare the client's name.
    Initial,

    // ── Liveness ────────────────────────────────────────────────────
    /// Presence ping.
    Ping,
    /// Presence reply.
    Pong,
    /// Explicit departure notice.
    Destroy,

    // ── Mastership & membership ─────────────────────────────────────
    /// Hub → client: you are now master.
    BecomeMaster,
    /// Current membership list.
    UpdatePeers,
    /// Current master.
    UpdateMaster,

    // ── Application traffic ─────────────────────────────────────────
    /// Application payload, see [`Message`].
    Message,
    /// Correlated request, see [`CallEnvelope`].
    Call,
    /// Correlated reply, see [`CallResponse`].
    CallResponse,
}

impl EventKind {
    /// Control kinds are consumed by the hub and never routed onwards.
    pub fn is_hub_control(&self) -> bool {
        matches!(self, Self::Pong | Self::Destroy | Self::Initial)
    }
}

/// The unit carried by the medium or the hub link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// An envelope without payload.
    pub fn new(kind: EventKind) -> Self {
        Self { kind, data: None }
    }

    /// An envelope carrying `data` serialized as JSON.
    pub fn with_data<T: Serialize>(kind: EventKind, data: &T) -> Result<Self> {
        Ok(Self {
            kind,
            data: Some(serde_json::to_value(data)?),
        })
    }

    /// Decode the payload. A missing payload decodes from `null`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.data.clone().unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

/// Application payload delivered through the `message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub data: Value,
    pub source: Peer,
}

/// A correlated request. `id` is unique only within the sending process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// The reply to a [`CallEnvelope`]. Exactly one of `data` / `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallResponse {
    pub fn success(id: u64, name: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            name: name.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: u64, name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Answer to a [`CHECK_ALIVE`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliveStatus {
    /// The responder is master.
    Ok,
    /// The responder knows of a different master.
    Correction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAliveReply {
    pub status: AliveStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventKind::CallResponse).unwrap(),
            "\"CALL_RESPONSE\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::BecomeMaster).unwrap(),
            "\"BECOME_MASTER\""
        );
        let kind: EventKind = serde_json::from_str("\"UPDATE_PEERS\"").unwrap();
        assert_eq!(kind, EventKind::UpdatePeers);
    }

    #[test]
    fn test_envelope_shape() {
        let env = Envelope::new(EventKind::Ping);
        assert_eq!(serde_json::to_value(&env).unwrap(), json!({"type": "PING"}));

        let call = CallEnvelope {
            id: 9,
            name: "sum".into(),
            args: vec![json!(1), json!(2)],
        };
        let env = Envelope::with_data(EventKind::Call, &call).unwrap();
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"type": "CALL", "data": {"id": 9, "name": "sum", "args": [1, 2]}})
        );
        let back: CallEnvelope = env.decode().unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn test_decode_mismatch_is_error() {
        let env = Envelope::with_data(EventKind::Call, &json!("not a call")).unwrap();
        assert!(env.decode::<CallEnvelope>().is_err());
    }

    #[test]
    fn test_not_found_response_has_no_data() {
        let resp = CallResponse::failure(1, "missing", codes::NOT_FOUND);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value, json!({"id": 1, "name": "missing", "error": "NOT_FOUND"}));
    }

    #[test]
    fn test_check_alive_reply() {
        let reply: CheckAliveReply = serde_json::from_value(json!({"status": "correction"})).unwrap();
        assert_eq!(reply.status, AliveStatus::Correction);
    }

    #[test]
    fn test_hub_control_kinds() {
        assert!(EventKind::Pong.is_hub_control());
        assert!(EventKind::Initial.is_hub_control());
        assert!(!EventKind::Message.is_hub_control());
        assert!(!EventKind::Call.is_hub_control());
    }
}
