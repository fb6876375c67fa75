//! Core types shared by the client registry and the channel server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::warn;

use crate::timestamp::DistributedTimestamp;

/// Identifier of a connected client session.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        ClientId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlates a request with its `processed` or `undo` response.
/// Unique per client session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Req({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extra subscribe parameters supplied by the caller (e.g. a field list).
///
/// Compared by value: two requests for the same channel with equal params
/// are the same subscription. Keys are kept sorted.
///
/// Params travel flattened next to the request fields, so the names in
/// [`RESERVED_PARAMS`](Self::RESERVED_PARAMS) are ignored on insert.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelParams(BTreeMap<String, Value>);

impl ChannelParams {
    /// Request field names a param may not shadow.
    pub const RESERVED_PARAMS: [&'static str; 4] = ["type", "request_id", "channel", "since"];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_reserved(key: &str) -> bool {
        Self::RESERVED_PARAMS.contains(&key)
    }

    /// Builder-style insert. Reserved names are dropped.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key.into(), value.into());
        self
    }

    fn insert(&mut self, key: String, value: Value) {
        if Self::is_reserved(&key) {
            warn!(param = %key, "Ignoring reserved channel param");
            return;
        }
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String items of an array param, e.g. a requested field list.
    pub fn get_str_list(&self, key: &str) -> Vec<&str> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl Hash for ChannelParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Equal values render to equal JSON, so this agrees with Eq.
        for (key, value) in &self.0 {
            key.hash(state);
            value.to_string().hash(state);
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ChannelParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = ChannelParams::new();
        for (key, value) in iter {
            params.insert(key.into(), value.into());
        }
        params
    }
}

/// Identity of a subscription: channel name plus params.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub channel: String,
    pub params: ChannelParams,
}

impl ChannelKey {
    pub fn new(channel: impl Into<String>, params: ChannelParams) -> Self {
        Self {
            channel: channel.into(),
            params,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            f.write_str(&self.channel)
        } else {
            let params = serde_json::to_string(&self.params).map_err(|_| fmt::Error)?;
            write!(f, "{}{}", self.channel, params)
        }
    }
}

/// Parameters captured from a channel name by a pattern (`users/:id`).
pub type RouteParams = BTreeMap<String, String>;

/// An opaque domain action. Only `type` is interpreted by this crate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Metadata travelling with an action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// When and where the action was produced.
    pub id: DistributedTimestamp,

    /// Channels the action is delivered on. Filled in by the server.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub channels: BTreeSet<String>,
}

impl Meta {
    pub fn new(id: DistributedTimestamp) -> Self {
        Self {
            id,
            channels: BTreeSet::new(),
        }
    }
}

/// An action together with its metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    pub meta: Meta,
}

impl Envelope {
    pub fn new(action: Action, meta: Meta) -> Self {
        Self { action, meta }
    }
}
