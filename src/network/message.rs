// src/network/message.rs
// Message envelope exchanged inside a protocol session

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Protocol identifiers spoken by knowledge-graph nodes
pub mod protocols {
    pub const STORE: &str = "/store/1.0.0";
    pub const GET: &str = "/get/1.0.0";
    pub const SEARCH: &str = "/search/1.0.0";
    pub const SEARCH_RESULT: &str = "/search/result/1.0.0";
    pub const SEARCH_ASSERTIONS: &str = "/search/assertions/1.0.0";
    pub const SEARCH_ASSERTIONS_RESULT: &str = "/search/assertions/result/1.0.0";
    /// Single-step liveness exchange used by the CLI
    pub const PING: &str = "/dkg/ping/1.0.0";
}

pub const PROTOCOL_INIT: &str = "PROTOCOL_INIT";
pub const PROTOCOL_REQUEST: &str = "PROTOCOL_REQUEST";

/// Only request type of the ping protocol
pub const PING_REQUEST: &str = "PING";

/// Header frame: `{"sessionId": ..., "messageType": ...}`
///
/// Missing fields decode as empty strings so that a malformed header can
/// still be answered with a NACK carrying whatever session id was sent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub message_type: String,
}

impl MessageHeader {
    pub fn new(session_id: impl Into<String>, message_type: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message_type: message_type.into(),
        }
    }

    /// Parsed response type, if this header carries one
    pub fn response_type(&self) -> Option<ResponseType> {
        ResponseType::parse(&self.message_type)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub data: Value,
}

impl Message {
    pub fn new(session_id: impl Into<String>, message_type: impl Into<String>, data: Value) -> Self {
        Self {
            header: MessageHeader::new(session_id, message_type),
            data,
        }
    }

    /// Response with an empty object payload, as sent for NACK and BUSY
    pub fn response(session_id: impl Into<String>, response: ResponseType) -> Self {
        Self::new(session_id, response.as_str(), Value::Object(Default::default()))
    }

    pub fn session_id(&self) -> &str {
        &self.header.session_id
    }

    pub fn message_type(&self) -> &str {
        &self.header.message_type
    }

    pub fn response_type(&self) -> Option<ResponseType> {
        self.header.response_type()
    }
}

/// Generate a fresh session id for an exchange we initiate
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// The fixed response enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Ack,
    Nack,
    Busy,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Ack => "ACK",
            ResponseType::Nack => "NACK",
            ResponseType::Busy => "BUSY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACK" => Some(ResponseType::Ack),
            "NACK" => Some(ResponseType::Nack),
            "BUSY" => Some(ResponseType::Busy),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("request sequence must name at least the opening type")]
    Empty,
    #[error("request type {0:?} is reserved for responses")]
    ResponseType(String),
}

/// Ordered request types of one protocol. The first entry is the only type
/// allowed to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSequence(Vec<String>);

impl RequestSequence {
    pub fn new<I, S>(types: I) -> Result<Self, SequenceError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        if types.is_empty() {
            return Err(SequenceError::Empty);
        }
        if let Some(t) = types.iter().find(|t| ResponseType::parse(t).is_some()) {
            return Err(SequenceError::ResponseType(t.clone()));
        }
        Ok(Self(types))
    }

    fn from_static(types: &[&str]) -> Self {
        Self(types.iter().map(|t| t.to_string()).collect())
    }

    pub fn initial(&self) -> &str {
        &self.0[0]
    }

    pub fn is_initial(&self, message_type: &str) -> bool {
        self.initial() == message_type
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.0.iter().any(|t| t == message_type)
    }

    pub fn last(&self) -> &str {
        &self.0[self.0.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Types still expected once the opening request has been acknowledged
    pub fn after_initial(&self) -> VecDeque<String> {
        self.0[1..].iter().cloned().collect()
    }
}

impl RequestSequence {
    /// Single-step exchange of the ping protocol
    pub fn ping() -> Self {
        Self::from_static(&[PING_REQUEST])
    }
}

impl Default for RequestSequence {
    fn default() -> Self {
        Self::from_static(&[PROTOCOL_INIT, PROTOCOL_REQUEST])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_uses_camel_case_on_the_wire() {
        let header = MessageHeader::new("abc", PROTOCOL_INIT);
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(
            json,
            json!({"sessionId": "abc", "messageType": "PROTOCOL_INIT"})
        );
    }

    #[test]
    fn header_with_missing_fields_still_decodes() {
        let header: MessageHeader = serde_json::from_str(r#"{"sessionId":"x"}"#).unwrap();
        assert_eq!(header.session_id, "x");
        assert!(header.message_type.is_empty());
    }

    #[test]
    fn response_types_parse() {
        for t in [ResponseType::Ack, ResponseType::Nack, ResponseType::Busy] {
            assert_eq!(ResponseType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ResponseType::parse(PROTOCOL_INIT), None);
        let nack = Message::response("s", ResponseType::Nack);
        assert_eq!(nack.data, json!({}));
        assert_eq!(nack.response_type(), Some(ResponseType::Nack));
    }

    #[test]
    fn sequence_accessors() {
        let seq = RequestSequence::new(["INIT", "DATA", "FIN"]).unwrap();
        assert_eq!(seq.initial(), "INIT");
        assert_eq!(seq.last(), "FIN");
        assert!(seq.contains("DATA"));
        assert!(!seq.contains("ACK"));
        assert_eq!(seq.after_initial(), VecDeque::from(vec!["DATA".to_string(), "FIN".to_string()]));
    }

    #[test]
    fn unusable_sequences_are_refused() {
        let empty: [&str; 0] = [];
        assert_eq!(RequestSequence::new(empty), Err(SequenceError::Empty));
        assert_eq!(
            RequestSequence::new(["INIT", "ACK"]),
            Err(SequenceError::ResponseType("ACK".into()))
        );
        assert_eq!(RequestSequence::default().initial(), PROTOCOL_INIT);
        assert_eq!(RequestSequence::ping().last(), PING_REQUEST);
    }
}
