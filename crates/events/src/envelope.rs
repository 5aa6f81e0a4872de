use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::Method;

/// Header carrying the semantic operation (`POST.USER`, ...).
pub const METHOD_HEADER: &str = "method";

/// Header carrying the role of the service that produced the message.
pub const ORIGIN_HEADER: &str = "origin";

/// Transport-level message as seen by a broker.
///
/// Notes:
/// - `payload` is opaque bytes; for user-change events it is a JSON `UserMessage`.
/// - `id` is assigned by the broker on delivery (stream entry id, offset, ...)
///   and is `None` on messages that have not been produced yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub topic: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub id: Option<String>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            headers: BTreeMap::new(),
            payload,
            id: None,
        }
    }

    /// A user-change message tagged with `method` (and optionally `origin`).
    pub fn user_change(
        topic: impl Into<String>,
        method: Method,
        origin: Option<&str>,
        payload: Vec<u8>,
    ) -> Self {
        let mut msg = Self::new(topic, payload).with_header(METHOD_HEADER, method.as_str());
        if let Some(origin) = origin {
            msg = msg.with_header(ORIGIN_HEADER, origin);
        }
        msg
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Raw `method` header, if present.
    pub fn method(&self) -> Option<&str> {
        self.header(METHOD_HEADER)
    }

    pub fn origin(&self) -> Option<&str> {
        self.header(ORIGIN_HEADER)
    }
}

/// Broker acknowledgment for a produced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: String,
}
