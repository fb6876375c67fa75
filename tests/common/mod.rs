//! Shared fixtures: an in-memory user channel and a client peer wired to a
//! server through the registry's outbox.

#![allow(dead_code)]

use channel_sync::{
    async_trait, is_earlier, Action, ActionFilter, Channel, ChannelError, ChannelParams,
    ChannelServer, ClientConnection, ClientId, ClientMessage, DistributedTimestamp, Envelope,
    Meta, RegistryConfig, ServerMessage, SubscribeContext, SubscribeRequest,
    SubscriptionHandle, SubscriptionRegistry, TimestampClock,
};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(100);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// --- User channel ---

/// Every `user/set` action produced so far.
#[derive(Clone)]
pub struct UserLog {
    entries: Arc<Mutex<Vec<Envelope>>>,
    clock: Arc<TimestampClock>,
}

impl UserLog {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            clock: Arc::new(TimestampClock::new("server")),
        }
    }

    /// Record a `user/set` action and return it for resending.
    pub fn set(&self, user: &str, key: &str, value: &str) -> Envelope {
        let action = Action::new("user/set")
            .with("user", user)
            .with("key", key)
            .with("value", value);
        let envelope = Envelope::new(action, Meta::new(self.clock.now()));
        self.entries.lock().push(envelope.clone());
        envelope
    }

    fn for_user(&self, user: &str, since: Option<&DistributedTimestamp>) -> Vec<Envelope> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.action.get_str("user") == Some(user))
            .filter(|e| since.map(|s| is_earlier(s, &e.meta.id)).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// `users/:id`: a user may read themselves, `admin` may read anyone.
/// Loads only what is newer than `since`; `fields` restricts live updates.
pub struct UserChannel {
    log: UserLog,
    pub seen_since: Arc<Mutex<Vec<Option<DistributedTimestamp>>>>,
}

impl UserChannel {
    pub fn new(log: UserLog) -> Self {
        Self {
            log,
            seen_since: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Channel for UserChannel {
    async fn access(
        &self,
        ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<bool, ChannelError> {
        let Some(user) = ctx.user_id.as_deref() else {
            return Ok(false);
        };
        Ok(user == "admin" || ctx.param("id") == Some(user))
    }

    async fn load(
        &self,
        ctx: &SubscribeContext,
        request: &SubscribeRequest,
    ) -> Result<Vec<Envelope>, ChannelError> {
        self.seen_since.lock().push(request.since.clone());
        let user = ctx
            .param("id")
            .ok_or_else(|| ChannelError::new("missing id"))?;
        Ok(self.log.for_user(user, request.since.as_ref()))
    }

    fn resend_types(&self) -> Vec<String> {
        vec!["user/set".to_string()]
    }

    fn resend(&self, _ctx: &channel_sync::ActionContext, action: &Action, _meta: &Meta) -> Vec<String> {
        action
            .get_str("user")
            .map(|user| vec![format!("users/{}", user)])
            .unwrap_or_default()
    }

    async fn filter(
        &self,
        _ctx: &SubscribeContext,
        request: &SubscribeRequest,
    ) -> Result<Option<ActionFilter>, ChannelError> {
        let fields: Vec<String> = request
            .params
            .get_str_list("fields")
            .into_iter()
            .map(String::from)
            .collect();
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Box::new(move |action: &Action, _meta: &Meta| {
            action.kind == "user/set"
                && action
                    .get_str("key")
                    .map(|key| fields.iter().any(|f| f == key))
                    .unwrap_or(false)
        })))
    }
}

// --- Peer ---

/// A client session: registry plus server connection.
pub struct Peer {
    pub registry: SubscriptionRegistry,
    pub outgoing: Receiver<ClientMessage>,
    pub conn: ClientConnection,
    user: Option<String>,
}

impl Peer {
    pub fn connect(server: &Arc<ChannelServer>, id: &str, user: Option<&str>) -> Self {
        let user = user.map(String::from);
        let conn = server.connect(ClientId::new(id), user.clone());
        let registry = SubscriptionRegistry::new(RegistryConfig::default());
        let outgoing = registry.outgoing();
        registry.on_connect();
        Self {
            registry,
            outgoing,
            conn,
            user,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.conn.client_id
    }

    pub fn acquire(&self, channel: &str, params: ChannelParams) -> SubscriptionHandle {
        self.registry.acquire(channel, params)
    }

    /// Hand every queued request to the server.
    pub fn flush(&self, server: &Arc<ChannelServer>) {
        for message in self.outgoing.try_iter() {
            server
                .handle(&self.conn.client_id, message)
                .expect("handle request");
        }
    }

    /// Feed server messages into the registry until `count` replies
    /// (processed or undo) arrived. Returns the actions and the replies.
    pub fn await_replies(&self, count: usize) -> (Vec<Envelope>, Vec<ServerMessage>) {
        let mut actions = Vec::new();
        let mut replies = Vec::new();
        while replies.len() < count {
            let message = self.conn.recv_timeout(WAIT).expect("server reply");
            match &message {
                ServerMessage::Action { .. } => {
                    if let Some(envelope) = self.registry.handle_message(message) {
                        actions.push(envelope);
                    }
                }
                _ => {
                    self.registry.handle_message(message.clone());
                    replies.push(message);
                }
            }
        }
        (actions, replies)
    }

    /// Feed messages until the connection stays quiet. Returns the actions.
    pub fn drain_actions(&self) -> Vec<Envelope> {
        let mut actions = Vec::new();
        while let Ok(message) = self.conn.recv_timeout(QUIET) {
            if let Some(envelope) = self.registry.handle_message(message) {
                actions.push(envelope);
            }
        }
        actions
    }

    /// Drop the connection on both ends, then connect again.
    pub fn reconnect(&mut self, server: &Arc<ChannelServer>) {
        self.registry.on_disconnect();
        server.disconnect(&self.conn.client_id);
        self.conn = server.connect(self.conn.client_id.clone(), self.user.clone());
        self.registry.on_connect();
    }
}
