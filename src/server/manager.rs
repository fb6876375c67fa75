//! Channel server: runs subscribe pipelines and fans resent actions out to
//! live subscribers.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result, SyncError};
use crate::protocol::{ClientMessage, ServerMessage, SubscribeRequest, UnsubscribeRequest};
use crate::types::{Action, ChannelKey, ClientId, Envelope, Meta, RequestId};

use super::channel::{ActionContext, ActionFilter, Channel, SubscribeContext};
use super::live::LiveTable;
use super::router::{RouteMatch, Router};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Max queued messages per client before it is dropped as a slow consumer.
    /// Default: 1024
    pub outbox_capacity: usize,

    /// Max live plus in-flight subscriptions per client.
    /// Default: 1000
    pub max_subscriptions_per_client: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 1024,
            max_subscriptions_per_client: 1000,
        }
    }
}

/// Point-in-time counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub clients: usize,
    pub live: usize,
    pub pending: usize,
}

/// Receiving end of a connected client's outbox.
pub struct ClientConnection {
    pub client_id: ClientId,
    receiver: Receiver<ServerMessage>,
}

impl ClientConnection {
    /// Receive the next message (blocking).
    pub fn recv(&self) -> std::result::Result<ServerMessage, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<ServerMessage, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> std::result::Result<ServerMessage, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn receiver(&self) -> &Receiver<ServerMessage> {
        &self.receiver
    }
}

struct ClientSession {
    /// Distinguishes reconnects that reuse a client id.
    session: u64,
    user_id: Option<String>,
    sender: Sender<ServerMessage>,
}

impl ClientSession {
    /// Returns false if the client cannot keep up or has gone away.
    fn try_send(&self, message: ServerMessage) -> bool {
        self.sender.try_send(message).is_ok()
    }
}

/// A subscribe whose access/load/filter work has not finished.
struct PendingSubscribe {
    generation: u64,
    session: u64,
    cancel: CancellationToken,
    /// Subscribe requests answered when the pipeline completes.
    waiting: Vec<RequestId>,
}

type PendingKey = (ClientId, ChannelKey);

/// Successful pipeline result, not yet delivered.
struct Authorized {
    envelopes: Vec<Envelope>,
    filter: Option<ActionFilter>,
}

/// Serves channel subscriptions for many concurrent clients.
///
/// Lock order: `pending`, then `dispatch`, then the live table, then
/// `clients`.
pub struct ChannelServer {
    router: Router,
    config: ServerConfig,
    clients: RwLock<HashMap<ClientId, ClientSession>>,
    pending: Mutex<HashMap<PendingKey, PendingSubscribe>>,
    live: LiveTable,
    /// Serializes outbox writes so per-channel order matches production order,
    /// and guards every change to the live table.
    dispatch: Mutex<()>,
    next_generation: AtomicU64,
}

impl ChannelServer {
    /// Create a server. The router is frozen from here on.
    pub fn new(router: Router, config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            router,
            config,
            clients: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            live: LiveTable::new(),
            dispatch: Mutex::new(()),
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    // --- Connections ---

    /// Register a client session. A session already using this id is
    /// replaced and loses its subscriptions.
    pub fn connect(&self, client_id: ClientId, user_id: Option<String>) -> ClientConnection {
        if self.clients.write().remove(&client_id).is_some() {
            debug!(client = %client_id, "Replacing existing session");
            self.drop_client_state(&client_id);
        }

        let (sender, receiver) = bounded(self.config.outbox_capacity.max(1));
        let session = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.clients.write().insert(
            client_id.clone(),
            ClientSession {
                session,
                user_id,
                sender,
            },
        );

        info!(client = %client_id, "Client connected");

        ClientConnection {
            client_id,
            receiver,
        }
    }

    /// Forget a client: cancel its in-flight pipelines and remove its live
    /// subscriptions. Returns false if it was not connected.
    pub fn disconnect(&self, client_id: &ClientId) -> bool {
        let existed = self.clients.write().remove(client_id).is_some();
        let (cancelled, removed) = self.drop_client_state(client_id);

        if existed {
            info!(
                client = %client_id,
                cancelled,
                removed,
                "Client disconnected"
            );
        }
        existed
    }

    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.clients.read().contains_key(client_id)
    }

    fn drop_client_state(&self, client_id: &ClientId) -> (usize, usize) {
        let mut pending = self.pending.lock();
        let _dispatch = self.dispatch.lock();
        let mut cancelled = 0;
        pending.retain(|(owner, _), entry| {
            if owner == client_id {
                entry.cancel.cancel();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        let removed = self.live.remove_client(client_id);
        (cancelled, removed)
    }

    // --- Requests ---

    /// Handle a request from a connected client.
    ///
    /// Subscribe pipelines are spawned onto the current Tokio runtime.
    pub fn handle(self: &Arc<Self>, client_id: &ClientId, message: ClientMessage) -> Result<()> {
        let (session, user_id) = self
            .clients
            .read()
            .get(client_id)
            .map(|s| (s.session, s.user_id.clone()))
            .ok_or_else(|| SyncError::UnknownClient(client_id.clone()))?;

        match message {
            ClientMessage::Subscribe(request) => {
                self.subscribe(client_id, session, user_id, request)
            }
            ClientMessage::Unsubscribe(request) => {
                self.unsubscribe(client_id, request);
                Ok(())
            }
        }
    }

    fn subscribe(
        self: &Arc<Self>,
        client_id: &ClientId,
        session: u64,
        user_id: Option<String>,
        request: SubscribeRequest,
    ) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let Some(RouteMatch { route, params }) = self.router.route(&request.channel) else {
            debug!(client = %client_id, channel = %request.channel, "No matching channel");
            self.reply(
                client_id,
                ServerMessage::Undo {
                    request_id: request.request_id,
                    reason: ErrorKind::NoMatchingChannel,
                },
            );
            return Ok(());
        };

        let key = request.key();
        let pending_key = (client_id.clone(), key.clone());
        let mut pending = self.pending.lock();

        if self.live.contains(client_id, &key) {
            drop(pending);
            debug!(client = %client_id, channel = %key, "Duplicate subscribe, already live");
            self.reply(
                client_id,
                ServerMessage::Processed {
                    request_id: request.request_id,
                },
            );
            return Ok(());
        }

        if let Some(in_flight) = pending.get_mut(&pending_key) {
            in_flight.waiting.push(request.request_id);
            debug!(client = %client_id, channel = %key, "Duplicate subscribe, joining in-flight pipeline");
            return Ok(());
        }

        let held = self.live.count_for_client(client_id)
            + pending.keys().filter(|(owner, _)| owner == client_id).count();
        if held >= self.config.max_subscriptions_per_client {
            drop(pending);
            warn!(client = %client_id, channel = %key, held, "Subscription limit reached");
            self.reply(
                client_id,
                ServerMessage::Undo {
                    request_id: request.request_id,
                    reason: ErrorKind::LimitExceeded,
                },
            );
            return Ok(());
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        pending.insert(
            pending_key.clone(),
            PendingSubscribe {
                generation,
                session,
                cancel: cancel.clone(),
                waiting: vec![request.request_id],
            },
        );
        drop(pending);

        debug!(client = %client_id, channel = %key, since = ?request.since, "Subscribe received");

        let ctx = SubscribeContext {
            client_id: client_id.clone(),
            user_id,
            params,
            cancel: cancel.clone(),
        };
        let server = Arc::clone(self);
        let channel = route.channel;

        // Own task: a panicking callback comes back as a JoinError.
        let mut pipeline = runtime.spawn(async move {
            run_pipeline(channel.as_ref(), &ctx, &request).await
        });
        let abort = pipeline.abort_handle();

        runtime.spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    abort.abort();
                    None
                }
                joined = &mut pipeline => Some(joined.unwrap_or_else(|error| {
                    warn!(
                        client = %pending_key.0,
                        channel = %pending_key.1,
                        panicked = error.is_panic(),
                        "Subscribe pipeline failed"
                    );
                    Err(ErrorKind::LoadFailure)
                })),
            };

            match outcome {
                Some(outcome) => server.finish(&pending_key, generation, outcome),
                None => debug!(
                    client = %pending_key.0,
                    channel = %pending_key.1,
                    "Subscribe cancelled before completion"
                ),
            }
        });

        Ok(())
    }

    /// Deliver or reject a finished pipeline, unless it was cancelled.
    fn finish(&self, key: &PendingKey, generation: u64, outcome: std::result::Result<Authorized, ErrorKind>) {
        let (client_id, channel_key) = key;
        let delivered = {
            let mut pending = self.pending.lock();

            let current = pending
                .get(key)
                .map(|entry| entry.generation == generation && !entry.cancel.is_cancelled())
                .unwrap_or(false);
            if !current {
                debug!(client = %client_id, channel = %channel_key, "Dropping result of cancelled subscribe");
                return;
            }
            let Some(entry) = pending.remove(key) else {
                return;
            };

            let same_session = self
                .clients
                .read()
                .get(client_id)
                .map(|s| s.session == entry.session)
                .unwrap_or(false);
            if !same_session {
                debug!(client = %client_id, channel = %channel_key, "Session ended before subscribe completed");
                return;
            }

            match outcome {
                Ok(Authorized { envelopes, filter }) => {
                    let _dispatch = self.dispatch.lock();
                    let loaded = envelopes.len();

                    let mut messages: Vec<ServerMessage> = envelopes
                        .into_iter()
                        .map(|mut envelope| {
                            envelope.meta.channels.insert(channel_key.channel.clone());
                            ServerMessage::Action {
                                action: envelope.action,
                                meta: envelope.meta,
                            }
                        })
                        .collect();
                    messages.extend(
                        entry
                            .waiting
                            .iter()
                            .map(|&request_id| ServerMessage::Processed { request_id }),
                    );

                    self.live.insert(client_id, channel_key, filter);
                    debug!(client = %client_id, channel = %channel_key, loaded, "Subscription live");
                    self.send_all(client_id, messages)
                }
                Err(reason) => {
                    let messages = entry
                        .waiting
                        .iter()
                        .map(|&request_id| ServerMessage::Undo { request_id, reason })
                        .collect();
                    self.send_all(client_id, messages)
                }
            }
        };

        if !delivered {
            self.drop_slow_client(client_id);
        }
    }

    fn unsubscribe(&self, client_id: &ClientId, request: UnsubscribeRequest) {
        let key = request.key();
        let pending_key = (client_id.clone(), key.clone());

        let (cancelled, removed) = {
            let mut pending = self.pending.lock();
            let cancelled = match pending.remove(&pending_key) {
                Some(entry) => {
                    entry.cancel.cancel();
                    true
                }
                None => false,
            };
            // An in-progress `process` finishes its sends before the filter goes.
            let _dispatch = self.dispatch.lock();
            (cancelled, self.live.remove(client_id, &key))
        };

        if cancelled || removed {
            debug!(client = %client_id, channel = %key, cancelled, "Unsubscribed");
        } else {
            debug!(client = %client_id, channel = %key, "Unsubscribe for unknown subscription");
        }

        self.reply(
            client_id,
            ServerMessage::Processed {
                request_id: request.request_id,
            },
        );
    }

    // --- Resend ---

    /// Fan an action out to every live subscriber of the channels it is
    /// resent to. Returns the number of clients it was queued for.
    ///
    /// Filters run under the live-table read lock and must not call back
    /// into the server.
    pub fn process(&self, ctx: &ActionContext, action: &Action, meta: &Meta) -> usize {
        let mut targets = BTreeSet::new();
        for route in self.router.resenders(&action.kind) {
            targets.extend(route.channel.resend(ctx, action, meta));
        }
        if targets.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut slow = Vec::new();
        {
            let _dispatch = self.dispatch.lock();
            let recipients = self.live.recipients(&targets, action, meta);
            let clients = self.clients.read();

            for (client_id, channels) in recipients {
                let Some(session) = clients.get(&client_id) else {
                    continue;
                };
                let mut meta = meta.clone();
                meta.channels = channels;
                let message = ServerMessage::Action {
                    action: action.clone(),
                    meta,
                };
                if session.try_send(message) {
                    delivered += 1;
                } else {
                    slow.push(client_id);
                }
            }
        }

        for client_id in &slow {
            self.drop_slow_client(client_id);
        }

        debug!(
            action = %action.kind,
            channels = targets.len(),
            delivered,
            "Action resent"
        );
        delivered
    }

    // --- Delivery ---

    fn reply(&self, client_id: &ClientId, message: ServerMessage) {
        if !self.send_all(client_id, vec![message]) {
            self.drop_slow_client(client_id);
        }
    }

    /// Queue messages in order. Returns false if the client's outbox is full
    /// or closed.
    fn send_all(&self, client_id: &ClientId, messages: Vec<ServerMessage>) -> bool {
        let clients = self.clients.read();
        let Some(session) = clients.get(client_id) else {
            return true;
        };
        messages.into_iter().all(|message| session.try_send(message))
    }

    fn drop_slow_client(&self, client_id: &ClientId) {
        warn!(client = %client_id, "Client outbox full or closed, dropping client");
        self.disconnect(client_id);
    }

    // --- Introspection ---

    pub fn is_live(&self, client_id: &ClientId, key: &ChannelKey) -> bool {
        self.live.contains(client_id, key)
    }

    pub fn stats(&self) -> ServerStats {
        let pending = self.pending.lock().len();
        ServerStats {
            clients: self.clients.read().len(),
            live: self.live.len(),
            pending,
        }
    }
}

/// Access, then load, then build the filter.
async fn run_pipeline(
    channel: &dyn Channel,
    ctx: &SubscribeContext,
    request: &SubscribeRequest,
) -> std::result::Result<Authorized, ErrorKind> {
    match channel.access(ctx, request).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(client = %ctx.client_id, channel = %request.channel, "Access denied");
            return Err(ErrorKind::AccessDenied);
        }
        Err(error) => {
            warn!(client = %ctx.client_id, channel = %request.channel, %error, "Access check failed");
            return Err(ErrorKind::AccessDenied);
        }
    }

    let envelopes = channel.load(ctx, request).await.map_err(|error| {
        warn!(client = %ctx.client_id, channel = %request.channel, %error, "Load failed");
        ErrorKind::LoadFailure
    })?;

    let filter = channel.filter(ctx, request).await.map_err(|error| {
        warn!(client = %ctx.client_id, channel = %request.channel, %error, "Filter setup failed");
        ErrorKind::LoadFailure
    })?;

    Ok(Authorized { envelopes, filter })
}
