//! Wire types for the line-delimited JSON protocol.
//!
//! Every line is an [`Envelope`] of `{src, dest, body}`. At the envelope layer the body is schema-less; a cheap
//! [`Probe`] extracts its `type` and `msg_id` so routing and error replies can proceed even when the full body does
//! not decode. Known bodies resolve once into the closed [`Payload`] sum type, while types without a schema here
//! are carried as raw JSON in [`Inbound::Unknown`] for handlers that want to interpret them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// Mapping from every known node id to its neighbour ids.
pub type Topology = HashMap<String, Vec<String>>;

/// The outer `{src, dest, body}` wrapper of every protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<B = Body> {
    /// The sending node or client.
    #[serde(default)]
    pub src: String,
    /// The receiving node.
    #[serde(default)]
    pub dest: String,
    /// The message body.
    pub body: B,
}

/// A typed message body: correlation ids plus a [`Payload`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Body<P = Payload> {
    /// Id of this message, unique per sender. Absent for fire-and-forget messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    /// The `msg_id` of the request this message replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    /// The type-specific part of the body, tagged by `type`.
    #[serde(flatten)]
    pub payload: P,
}

impl<P> Body<P> {
    /// Creates a body with no correlation ids.
    pub fn new(payload: P) -> Self {
        Body {
            msg_id: None,
            in_reply_to: None,
            payload,
        }
    }
}

/// Every message schema known to this node, tagged by its `type` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Handshake assigning this node its id and the cluster membership.
    Init {
        /// The id assigned to this node.
        node_id: String,
        /// Every node in the cluster, including this one.
        #[serde(default)]
        node_ids: Vec<String>,
    },
    /// Acknowledges an `init`.
    InitOk,
    /// Asks the node to echo a string back.
    Echo {
        /// The string to echo.
        echo: String,
    },
    /// Carries the echoed string.
    EchoOk {
        /// The string copied from the request.
        echo: String,
    },
    /// Asks the node for a globally unique id.
    Generate,
    /// Carries a freshly generated unique id.
    GenerateOk {
        /// The generated id.
        id: String,
    },
    /// Supplies the neighbour graph.
    Topology {
        /// Neighbour ids keyed by node id.
        topology: Topology,
    },
    /// Acknowledges a `topology`.
    TopologyOk,
    /// Gossips a value through the cluster.
    Broadcast {
        /// The value to disseminate.
        message: i64,
    },
    /// Acknowledges a `broadcast`.
    BroadcastOk,
    /// Asks for every value seen so far.
    Read,
    /// Carries every value seen so far.
    ReadOk {
        /// Distinct values in first-observed order.
        messages: Vec<i64>,
    },
    /// A failed request.
    Error {
        /// The failure class.
        code: ErrorCode,
        /// Human readable description.
        #[serde(default)]
        text: String,
    },
}

impl Payload {
    /// The type tags of every schema in [`Payload`].
    pub const KINDS: &'static [&'static str] = &[
        "init",
        "init_ok",
        "echo",
        "echo_ok",
        "generate",
        "generate_ok",
        "topology",
        "topology_ok",
        "broadcast",
        "broadcast_ok",
        "read",
        "read_ok",
        "error",
    ];

    /// Returns the `type` tag of this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Init { .. } => "init",
            Payload::InitOk => "init_ok",
            Payload::Echo { .. } => "echo",
            Payload::EchoOk { .. } => "echo_ok",
            Payload::Generate => "generate",
            Payload::GenerateOk { .. } => "generate_ok",
            Payload::Topology { .. } => "topology",
            Payload::TopologyOk => "topology_ok",
            Payload::Broadcast { .. } => "broadcast",
            Payload::BroadcastOk => "broadcast_ok",
            Payload::Read => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Error { .. } => "error",
        }
    }

    /// Returns `true` if `kind` names a schema in [`Payload`].
    pub fn is_known(kind: &str) -> bool {
        Payload::KINDS.contains(&kind)
    }

    /// Builds an `error` payload from a code, using its canonical text.
    pub fn error(code: ErrorCode) -> Self {
        Payload::Error {
            code,
            text: code.text().to_string(),
        }
    }
}

/// The `type` and `msg_id` of a body, extracted without validating the rest of its schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe {
    /// The `type` tag.
    pub kind: String,
    /// The inbound `msg_id`, if present and a non-negative integer.
    pub msg_id: Option<u64>,
}

/// An inbound body resolved against the known schemas.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// A body matching one of the [`Payload`] schemas.
    Known(Payload),
    /// A body whose type has no schema here, kept as raw JSON.
    Unknown(Value),
}

/// An inbound message as seen by a handler.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// The sender.
    pub src: String,
    /// The addressee.
    pub dest: String,
    /// The probed `type` tag.
    pub kind: String,
    /// The inbound `msg_id`. Absent for fire-and-forget messages.
    pub msg_id: Option<u64>,
    /// The inbound `in_reply_to`, if the message is itself a reply.
    pub in_reply_to: Option<u64>,
    /// The resolved body.
    pub message: Inbound,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn body_flattens_payload_with_type_tag() {
        let body = Body {
            msg_id: Some(3),
            in_reply_to: Some(1),
            payload: Payload::EchoOk {
                echo: "hi".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"type": "echo_ok", "msg_id": 3, "in_reply_to": 1, "echo": "hi"})
        );
    }

    #[test]
    fn absent_ids_are_omitted() {
        let body = Body::new(Payload::Broadcast { message: 42 });
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"type": "broadcast", "message": 42})
        );
    }

    #[test]
    fn init_node_ids_default_to_empty() {
        let body: Body = serde_json::from_value(json!({
            "type": "init",
            "msg_id": 1,
            "node_id": "n1"
        }))
        .unwrap();
        assert_eq!(body.msg_id, Some(1));
        assert_eq!(
            body.payload,
            Payload::Init {
                node_id: "n1".to_string(),
                node_ids: vec![]
            }
        );
    }

    #[test]
    fn every_kind_is_listed() {
        let payloads = [
            Payload::InitOk,
            Payload::Generate,
            Payload::TopologyOk,
            Payload::BroadcastOk,
            Payload::Read,
            Payload::error(ErrorCode::Crashed),
        ];
        for payload in payloads {
            assert!(Payload::is_known(payload.kind()));
            let value = serde_json::to_value(&payload).unwrap();
            assert_eq!(value["type"], payload.kind());
        }
        assert!(!Payload::is_known("txn"));
    }

    #[test]
    fn error_payload_uses_canonical_text() {
        assert_eq!(
            serde_json::to_value(Payload::error(ErrorCode::Malformed)).unwrap(),
            json!({"type": "error", "code": 12, "text": "Malformed request"})
        );
    }
}
