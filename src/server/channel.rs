//! The interface channel-owning code implements.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::protocol::SubscribeRequest;
use crate::types::{Action, ClientId, Envelope, Meta, RouteParams};

/// Per-subscription predicate deciding which resent actions are delivered.
pub type ActionFilter = Box<dyn Fn(&Action, &Meta) -> bool + Send + Sync>;

/// Context handed to `access`, `load` and `filter`.
#[derive(Clone, Debug)]
pub struct SubscribeContext {
    /// Client that sent the subscribe.
    pub client_id: ClientId,
    /// Authenticated user of that client, if any.
    pub user_id: Option<String>,
    /// Parameters captured by the channel pattern.
    pub params: RouteParams,
    /// Cancelled when the client unsubscribes or disconnects mid-pipeline.
    pub cancel: CancellationToken,
}

impl SubscribeContext {
    /// Captured pattern parameter, e.g. `id` for `users/:id`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Context handed to `resend`: who produced the action.
#[derive(Clone, Debug, Default)]
pub struct ActionContext {
    /// Client the action came from, if it came from a client.
    pub client_id: Option<ClientId>,
    pub user_id: Option<String>,
}

impl ActionContext {
    /// Action produced by the server itself.
    pub fn server() -> Self {
        Self::default()
    }

    pub fn from_client(client_id: ClientId, user_id: Option<String>) -> Self {
        Self {
            client_id: Some(client_id),
            user_id,
        }
    }
}

/// Behaviour of one channel pattern.
///
/// Only `access` is required. The other slots default to: load nothing,
/// resend nothing, allow every action.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Decide whether the client may subscribe. `Err` is treated as a denial.
    async fn access(
        &self,
        ctx: &SubscribeContext,
        request: &SubscribeRequest,
    ) -> Result<bool, ChannelError>;

    /// Initial actions for the subscriber. `request.since` is passed through
    /// untouched; omitting data the client already has is up to the channel.
    async fn load(
        &self,
        _ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<Vec<Envelope>, ChannelError> {
        Ok(Vec::new())
    }

    /// Action types `resend` is consulted for. Read once at registration.
    fn resend_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// Channel names an action of a declared type belongs to.
    fn resend(&self, _ctx: &ActionContext, _action: &Action, _meta: &Meta) -> Vec<String> {
        Vec::new()
    }

    /// Predicate installed for the subscription once it is live.
    /// `None` allows every action.
    async fn filter(
        &self,
        _ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<Option<ActionFilter>, ChannelError> {
        Ok(None)
    }
}
