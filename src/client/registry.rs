//! Reference-counted client subscriptions with since-based resubscription.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ServerMessage, SubscribeRequest, UnsubscribeRequest};
use crate::timestamp::{is_earlier, DistributedTimestamp};
use crate::types::{ChannelKey, ChannelParams, Envelope, RequestId};

use super::types::{RegistryConfig, SubscriptionHandle, SubscriptionState};

/// Internal subscription record.
struct Subscription {
    ref_count: usize,
    state: SubscriptionState,
    /// Subscribe request awaiting a reply, if any.
    request: Option<RequestId>,
}

enum InFlight {
    Subscribe(ChannelKey),
    Unsubscribe(ChannelKey),
}

struct RegistryState {
    connected: bool,
    next_request: u64,
    next_handle: u64,
    subscriptions: HashMap<ChannelKey, Subscription>,
    /// Latest known timestamp per channel name.
    since: HashMap<String, DistributedTimestamp>,
    in_flight: HashMap<RequestId, InFlight>,
    /// Released subscriptions whose `unsubscribe` never made it into the
    /// outbox. Sent on the next connect.
    unsent_unsubscribes: HashSet<ChannelKey>,
}

impl RegistryState {
    fn request_id(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId(self.next_request)
    }

    fn advance_since(&mut self, channel: &str, timestamp: &DistributedTimestamp) {
        match self.since.get_mut(channel) {
            Some(current) if !is_earlier(current, timestamp) => {}
            Some(current) => *current = timestamp.clone(),
            None => {
                self.since.insert(channel.to_string(), timestamp.clone());
            }
        }
    }
}

/// The set of channels one client session is interested in.
///
/// Callers `acquire` a channel and get a handle; the first holder causes a
/// `subscribe`, the last `release` an `unsubscribe`. Subscriptions survive
/// connection loss and are re-requested with their since cursor on
/// reconnect. Outgoing requests are queued for the transport on
/// [`outgoing`](Self::outgoing); replies are fed back through
/// [`handle_message`](Self::handle_message).
///
/// Since cursors are kept per channel name, not per params: two
/// subscriptions to the same channel with different params share one
/// cursor, so a `load` that honours `since` may skip state the newer
/// subscription never saw.
///
/// A full or closed outbox is treated as connection loss. The transport
/// learns about it on [`connection_lost`](Self::connection_lost) and is
/// expected to reconnect and call [`on_connect`](Self::on_connect).
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    sender: Sender<ClientMessage>,
    receiver: Receiver<ClientMessage>,
    lost_sender: Sender<()>,
    lost_receiver: Receiver<()>,
}

impl SubscriptionRegistry {
    /// Create a registry for a new session. It starts disconnected.
    pub fn new(config: RegistryConfig) -> Self {
        let (sender, receiver) = bounded(config.outbox_capacity.max(1));
        let (lost_sender, lost_receiver) = bounded(1);
        Self {
            state: Mutex::new(RegistryState {
                connected: false,
                next_request: 0,
                next_handle: 0,
                subscriptions: HashMap::new(),
                since: HashMap::new(),
                in_flight: HashMap::new(),
                unsent_unsubscribes: HashSet::new(),
            }),
            sender,
            receiver,
            lost_sender,
            lost_receiver,
        }
    }

    /// Requests for the transport to deliver to the server, in order.
    pub fn outgoing(&self) -> Receiver<ClientMessage> {
        self.receiver.clone()
    }

    /// Signalled when the registry gave up on the outbox and considers
    /// itself disconnected. Signals coalesce until received.
    pub fn connection_lost(&self) -> Receiver<()> {
        self.lost_receiver.clone()
    }

    // --- Acquire / Release ---

    /// Declare interest in a channel.
    ///
    /// Requests with equal channel and params share one subscription; only
    /// the first one sends a `subscribe`.
    pub fn acquire(&self, channel: impl Into<String>, params: ChannelParams) -> SubscriptionHandle {
        let key = ChannelKey::new(channel, params);
        let mut state = self.state.lock();

        state.next_handle += 1;
        // A fresh subscribe supersedes an unsubscribe that never went out.
        state.unsent_unsubscribes.remove(&key);
        let handle = SubscriptionHandle {
            id: state.next_handle,
            key: key.clone(),
        };

        if let Some(sub) = state.subscriptions.get_mut(&key) {
            sub.ref_count += 1;
            debug!(channel = %key, ref_count = sub.ref_count, "Subscription shared");
            return handle;
        }

        state.subscriptions.insert(
            key.clone(),
            Subscription {
                ref_count: 1,
                state: SubscriptionState::Pending,
                request: None,
            },
        );
        debug!(channel = %key, "Subscription created");

        if state.connected {
            self.send_subscribe(&mut state, &key);
        }

        handle
    }

    /// Give back a handle. The last release sends `unsubscribe`.
    pub fn release(&self, handle: SubscriptionHandle) {
        let mut state = self.state.lock();
        let key = handle.key;

        let Some(sub) = state.subscriptions.get_mut(&key) else {
            warn!(channel = %key, handle = handle.id, "Release of unknown subscription");
            return;
        };

        if sub.ref_count > 1 {
            sub.ref_count -= 1;
            debug!(channel = %key, ref_count = sub.ref_count, "Subscription released");
            return;
        }

        let Some(sub) = state.subscriptions.remove(&key) else {
            return;
        };
        if let Some(request_id) = sub.request {
            state.in_flight.remove(&request_id);
        }
        debug!(channel = %key, "Subscription removed");

        if !state.connected || matches!(sub.state, SubscriptionState::Rejected(_)) {
            return;
        }

        self.send_unsubscribe(&mut state, key);
    }

    // --- Connection lifecycle ---

    /// The transport connected (or reconnected). Every resident subscription
    /// that was not rejected is requested again with its since cursor.
    pub fn on_connect(&self) {
        let mut state = self.state.lock();
        state.connected = true;

        let keys: Vec<ChannelKey> = state
            .subscriptions
            .iter()
            .filter(|(_, sub)| !matches!(sub.state, SubscriptionState::Rejected(_)))
            .map(|(key, _)| key.clone())
            .collect();

        info!(subscriptions = keys.len(), "Connected, resubscribing");

        for key in keys {
            if !state.connected {
                return;
            }
            self.send_subscribe(&mut state, &key);
        }

        let unsent: Vec<ChannelKey> = state.unsent_unsubscribes.drain().collect();
        for key in unsent {
            if !state.connected {
                state.unsent_unsubscribes.insert(key);
                continue;
            }
            self.send_unsubscribe(&mut state, key);
        }
    }

    /// The transport lost its connection. Subscriptions stay resident and
    /// go back to pending; outstanding replies will never arrive.
    pub fn on_disconnect(&self) {
        let mut state = self.state.lock();
        Self::mark_disconnected(&mut state);
        info!(subscriptions = state.subscriptions.len(), "Disconnected");
    }

    fn mark_disconnected(state: &mut RegistryState) {
        state.connected = false;
        state.in_flight.clear();
        for sub in state.subscriptions.values_mut() {
            sub.request = None;
            if sub.state == SubscriptionState::Loaded {
                sub.state = SubscriptionState::Pending;
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    // --- Server replies ---

    /// Apply a message from the server. Actions are handed back to the
    /// caller for processing after their channels' since cursors advance.
    pub fn handle_message(&self, message: ServerMessage) -> Option<Envelope> {
        let mut state = self.state.lock();

        match message {
            ServerMessage::Action { action, meta } => {
                for channel in &meta.channels {
                    state.advance_since(channel, &meta.id);
                }
                Some(Envelope::new(action, meta))
            }
            ServerMessage::Processed { request_id } => {
                match state.in_flight.remove(&request_id) {
                    Some(InFlight::Subscribe(key)) => {
                        if let Some(sub) = state.subscriptions.get_mut(&key) {
                            if sub.request == Some(request_id) {
                                sub.request = None;
                                sub.state = SubscriptionState::Loaded;
                                debug!(channel = %key, "Subscription loaded");
                            }
                        }
                    }
                    Some(InFlight::Unsubscribe(key)) => {
                        debug!(channel = %key, "Unsubscribe acknowledged");
                    }
                    None => debug!(request = %request_id, "Reply to stale request"),
                }
                None
            }
            ServerMessage::Undo { request_id, reason } => {
                match state.in_flight.remove(&request_id) {
                    Some(InFlight::Subscribe(key)) => {
                        if let Some(sub) = state.subscriptions.get_mut(&key) {
                            if sub.request == Some(request_id) {
                                sub.request = None;
                                sub.state = SubscriptionState::Rejected(reason);
                                warn!(channel = %key, %reason, "Subscription rejected");
                            }
                        }
                    }
                    Some(InFlight::Unsubscribe(key)) => {
                        warn!(channel = %key, %reason, "Unsubscribe rejected");
                    }
                    None => debug!(request = %request_id, "Undo for stale request"),
                }
                None
            }
        }
    }

    /// Seed or advance the since cursor of a channel, e.g. from local
    /// storage. Never moves it backwards.
    pub fn advance_since(&self, channel: &str, timestamp: &DistributedTimestamp) {
        self.state.lock().advance_since(channel, timestamp);
    }

    // --- Introspection ---

    pub fn state(&self, handle: &SubscriptionHandle) -> Option<SubscriptionState> {
        self.state
            .lock()
            .subscriptions
            .get(&handle.key)
            .map(|sub| sub.state)
    }

    /// Number of outstanding handles for the handle's subscription.
    pub fn ref_count(&self, handle: &SubscriptionHandle) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(&handle.key)
            .map(|sub| sub.ref_count)
            .unwrap_or(0)
    }

    pub fn since(&self, channel: &str) -> Option<DistributedTimestamp> {
        self.state.lock().since.get(channel).cloned()
    }

    /// Number of distinct subscriptions.
    pub fn len(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- Sending ---

    fn send_subscribe(&self, state: &mut RegistryState, key: &ChannelKey) {
        let request_id = state.request_id();
        let since = state.since.get(&key.channel).cloned();

        if let Some(sub) = state.subscriptions.get_mut(key) {
            sub.request = Some(request_id);
            sub.state = SubscriptionState::Pending;
        }
        state
            .in_flight
            .insert(request_id, InFlight::Subscribe(key.clone()));

        self.send(
            state,
            ClientMessage::Subscribe(SubscribeRequest {
                request_id,
                channel: key.channel.clone(),
                since,
                params: key.params.clone(),
            }),
        );
    }

    fn send_unsubscribe(&self, state: &mut RegistryState, key: ChannelKey) {
        let request_id = state.request_id();
        state
            .in_flight
            .insert(request_id, InFlight::Unsubscribe(key.clone()));

        let sent = self.send(
            state,
            ClientMessage::Unsubscribe(UnsubscribeRequest {
                request_id,
                channel: key.channel.clone(),
                params: key.params.clone(),
            }),
        );
        if !sent {
            state.unsent_unsubscribes.insert(key);
        }
    }

    /// Queue a request. A full or closed outbox counts as connection loss:
    /// subscribes are re-issued on the next connect, unsubscribes are kept
    /// by the caller.
    fn send(&self, state: &mut RegistryState, message: ClientMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) | Err(TrySendError::Disconnected(message)) => {
                warn!(
                    channel = %message.channel(),
                    request = %message.request_id(),
                    "Outbox unavailable, treating as disconnect"
                );
                Self::mark_disconnected(state);
                let _ = self.lost_sender.try_send(());
                false
            }
        }
    }
}
