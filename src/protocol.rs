//! Logical shape of the messages exchanged between a client registry and
//! the channel server. The transport and its encoding are up to the caller;
//! these types only derive serde so any encoding can carry them.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::timestamp::DistributedTimestamp;
use crate::types::{Action, ChannelKey, ChannelParams, Meta, RequestId};

/// Request to start receiving a channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub request_id: RequestId,
    pub channel: String,

    /// Latest timestamp the client already has for this channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DistributedTimestamp>,

    /// Extra params, flattened next to the fields above. See
    /// [`ChannelParams::RESERVED_PARAMS`].
    #[serde(flatten)]
    pub params: ChannelParams,
}

impl SubscribeRequest {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.channel.clone(), self.params.clone())
    }
}

/// Request to stop receiving a channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub request_id: RequestId,
    pub channel: String,

    #[serde(flatten)]
    pub params: ChannelParams,
}

impl UnsubscribeRequest {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.channel.clone(), self.params.clone())
    }
}

/// Messages sent by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
}

impl ClientMessage {
    pub fn request_id(&self) -> RequestId {
        match self {
            ClientMessage::Subscribe(req) => req.request_id,
            ClientMessage::Unsubscribe(req) => req.request_id,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            ClientMessage::Subscribe(req) => &req.channel,
            ClientMessage::Unsubscribe(req) => &req.channel,
        }
    }
}

/// Messages sent by the server to one client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A domain action, either from an initial load or a live resend.
    Action { action: Action, meta: Meta },

    /// The request completed. For a subscribe this follows the initial load.
    Processed { request_id: RequestId },

    /// The request was rejected.
    Undo {
        request_id: RequestId,
        reason: ErrorKind,
    },
}
