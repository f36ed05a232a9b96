use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-chosen tag identifying a category of payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty tag is not a subscribable event type.
    pub fn is_recognized(&self) -> bool {
        !self.0.is_empty()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for EventType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&String> for EventType {
    fn from(value: &String) -> Self {
        Self(value.clone())
    }
}

/// Ordered set of event types a connection wants to receive.
///
/// Replaced wholesale on every subscribe; never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet(Vec<EventType>);

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EventType> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[EventType] {
        &self.0
    }
}

impl<T> FromIterator<T> for SubscriptionSet
where
    T: Into<EventType>,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for SubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, event_type) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{event_type}")?;
        }
        f.write_str("]")
    }
}

/// One unit of streamed data plus its event-type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: String,
    pub event_type: EventType,
}

impl Payload {
    pub fn new(event_type: impl Into<EventType>, data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            event_type: event_type.into(),
        }
    }
}

/// Outgoing control message on a duplex stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Replace the server-side subscription with the full set.
    Subscribe(SubscriptionSet),
    /// Ask the server to end the stream before the transport is released.
    ForceClose,
}

impl Request {
    pub fn is_force_close(&self) -> bool {
        matches!(self, Self::ForceClose)
    }

    pub fn to_message(&self) -> RequestMsg {
        match self {
            Self::Subscribe(events) => RequestMsg {
                events: events.iter().map(EventTypeMsg::from).collect(),
                force_close: false,
            },
            Self::ForceClose => RequestMsg {
                events: Vec::new(),
                force_close: true,
            },
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_message())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventTypeMsg {
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl From<&EventType> for EventTypeMsg {
    fn from(value: &EventType) -> Self {
        Self {
            kind: value.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestMsg {
    #[serde(default)]
    pub events: Vec<EventTypeMsg>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_close: bool,
}

impl RequestMsg {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn into_request(self) -> Request {
        if self.force_close {
            return Request::ForceClose;
        }
        Request::Subscribe(self.events.into_iter().map(|event| event.kind).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventTypeMsg>,
    #[serde(default)]
    pub data: String,
}

impl PayloadMsg {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Converts to a [`Payload`]; a missing tag becomes the empty event type.
    pub fn into_payload(self) -> Payload {
        Payload {
            data: self.data,
            event_type: EventType::new(self.event_type.map(|tag| tag.kind).unwrap_or_default()),
        }
    }
}

impl From<&Payload> for PayloadMsg {
    fn from(value: &Payload) -> Self {
        Self {
            event_type: Some(EventTypeMsg::from(&value.event_type)),
            data: value.data.clone(),
        }
    }
}
