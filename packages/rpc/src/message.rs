//! The operation and reply messages exchanged over an endpoint.

use std::fmt;

use serde::{Deserialize, Serialize};
use tether_core::{Path, Value};
use uuid::Uuid;

/// Correlates a response with the request that caused it.
pub type CallId = Uuid;

/// A value as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    /// Plain data, copied as-is.
    Raw(Value),
    /// A value a named transfer handler serialized.
    Handler { name: String, value: Value },
}

impl WireValue {
    pub fn null() -> Self {
        WireValue::Raw(Value::Null)
    }
}

/// What the proxy side asks the exposer to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Get { path: Path },
    Set { path: Path, value: WireValue },
    Apply { path: Path, arguments: Vec<WireValue> },
    Construct { path: Path, arguments: Vec<WireValue> },
    /// Open a fresh sub-channel exposing the same root.
    Endpoint,
    /// Tear down the endpoint after acknowledging.
    Release,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Get { .. } => OperationKind::Get,
            Operation::Set { .. } => OperationKind::Set,
            Operation::Apply { .. } => OperationKind::Apply,
            Operation::Construct { .. } => OperationKind::Construct,
            Operation::Endpoint => OperationKind::Endpoint,
            Operation::Release => OperationKind::Release,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Operation::Get { path }
            | Operation::Set { path, .. }
            | Operation::Apply { path, .. }
            | Operation::Construct { path, .. } => Some(path),
            Operation::Endpoint | Operation::Release => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Get,
    Set,
    Apply,
    Construct,
    Endpoint,
    Release,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Get => "GET",
            OperationKind::Set => "SET",
            OperationKind::Apply => "APPLY",
            OperationKind::Construct => "CONSTRUCT",
            OperationKind::Endpoint => "ENDPOINT",
            OperationKind::Release => "RELEASE",
        };
        f.write_str(name)
    }
}

/// Every message carries a correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request { id: CallId, operation: Operation },
    Response { id: CallId, value: WireValue },
}

impl Message {
    pub fn id(&self) -> CallId {
        match self {
            Message::Request { id, .. } | Message::Response { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::path;

    #[test]
    fn kinds_display_as_wire_names() {
        let op = Operation::Apply {
            path: path!("gateway/handle_request"),
            arguments: vec![],
        };
        assert_eq!(op.kind().to_string(), "APPLY");
        assert_eq!(op.path(), Some(&path!("gateway/handle_request")));
        assert_eq!(Operation::Release.path(), None);
    }

    #[test]
    fn messages_travel_as_json() {
        let message = Message::Request {
            id: Uuid::new_v4(),
            operation: Operation::Set {
                path: path!("counter"),
                value: WireValue::Raw(Value::from(3i64)),
            },
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
        assert_eq!(back.id(), message.id());
    }

    #[test]
    fn invalid_paths_rejected_on_decode() {
        let json = format!(
            r#"{{"Request":{{"id":"{}","operation":{{"Get":{{"path":["not valid"]}}}}}}}}"#,
            Uuid::new_v4()
        );
        assert!(serde_json::from_str::<Message>(&json).is_err());
    }
}
