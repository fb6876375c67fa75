//! Error handling and edge case tests.

mod common;

use channel_sync::{
    async_trait, ActionContext, Channel, ChannelError, ChannelKey, ChannelParams, ChannelServer,
    ClientId, ClientMessage, Envelope, ErrorKind, RequestId, Router, ServerConfig,
    ServerMessage, SubscribeContext, SubscribeRequest, SubscriptionState, SyncError,
    UnsubscribeRequest,
};
use common::{init_tracing, Peer, UserChannel, UserLog, QUIET, WAIT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn subscribe(id: u64, channel: &str) -> ClientMessage {
    ClientMessage::Subscribe(SubscribeRequest {
        request_id: RequestId(id),
        channel: channel.to_string(),
        since: None,
        params: ChannelParams::new(),
    })
}

fn unsubscribe(id: u64, channel: &str) -> ClientMessage {
    ClientMessage::Unsubscribe(UnsubscribeRequest {
        request_id: RequestId(id),
        channel: channel.to_string(),
        params: ChannelParams::new(),
    })
}

/// Access check that errors instead of answering.
struct BrokenAccess;

#[async_trait]
impl Channel for BrokenAccess {
    async fn access(
        &self,
        _ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<bool, ChannelError> {
        Err(ChannelError::new("directory unavailable"))
    }
}

/// Access passes, load fails.
struct BrokenLoad;

#[async_trait]
impl Channel for BrokenLoad {
    async fn access(
        &self,
        _ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<bool, ChannelError> {
        Ok(true)
    }

    async fn load(
        &self,
        _ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<Vec<Envelope>, ChannelError> {
        Err(ChannelError::new("storage offline"))
    }
}

/// Access that takes far longer than any test; records whether load ran.
struct SlowAccess {
    loaded: Arc<AtomicBool>,
}

#[async_trait]
impl Channel for SlowAccess {
    async fn access(
        &self,
        _ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<bool, ChannelError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(true)
    }

    async fn load(
        &self,
        _ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<Vec<Envelope>, ChannelError> {
        self.loaded.store(true, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// Load that panics on its first call and succeeds afterwards.
struct PanicOnceLoad {
    panicked: AtomicBool,
}

#[async_trait]
impl Channel for PanicOnceLoad {
    async fn access(
        &self,
        _ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<bool, ChannelError> {
        Ok(true)
    }

    async fn load(
        &self,
        _ctx: &SubscribeContext,
        _request: &SubscribeRequest,
    ) -> Result<Vec<Envelope>, ChannelError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("load exploded");
        }
        Ok(Vec::new())
    }
}

fn server_with(log: &UserLog, config: ServerConfig) -> (Arc<ChannelServer>, Arc<AtomicBool>) {
    init_tracing();
    let loaded = Arc::new(AtomicBool::new(false));
    let mut router = Router::new();
    router.register("users/:id", UserChannel::new(log.clone())).unwrap();
    router.register("broken/access", BrokenAccess).unwrap();
    router.register("broken/load", BrokenLoad).unwrap();
    router
        .register(
            "fragile/:id",
            PanicOnceLoad {
                panicked: AtomicBool::new(false),
            },
        )
        .unwrap();
    router
        .register(
            "slow/:id",
            SlowAccess {
                loaded: loaded.clone(),
            },
        )
        .unwrap();
    (ChannelServer::new(router, config), loaded)
}

fn expect_undo(message: ServerMessage, expected: ErrorKind) {
    match message {
        ServerMessage::Undo { reason, .. } => assert_eq!(reason, expected),
        other => panic!("Expected Undo({:?}), got {:?}", expected, other),
    }
}

// --- Access ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_denied_access_retains_nothing() {
    let log = UserLog::new();
    let (server, _) = server_with(&log, ServerConfig::default());

    let owner = Peer::connect(&server, "owner", Some("1"));
    owner.acquire("users/1", ChannelParams::new());
    owner.flush(&server);
    owner.await_replies(1);

    let intruder = Peer::connect(&server, "intruder", Some("2"));
    let handle = intruder.acquire("users/1", ChannelParams::new());
    intruder.flush(&server);
    let (_, replies) = intruder.await_replies(1);
    expect_undo(replies[0].clone(), ErrorKind::AccessDenied);

    assert_eq!(
        intruder.registry.state(&handle),
        Some(SubscriptionState::Rejected(ErrorKind::AccessDenied))
    );
    let key = ChannelKey::new("users/1", ChannelParams::new());
    assert!(!server.is_live(intruder.id(), &key));
    assert_eq!(server.stats().live, 1);

    let update = log.set("1", "name", "Ann");
    server.process(&ActionContext::server(), &update.action, &update.meta);
    assert_eq!(owner.drain_actions().len(), 1);
    assert!(intruder.drain_actions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_subscription_not_retried_on_reconnect() {
    let log = UserLog::new();
    let (server, _) = server_with(&log, ServerConfig::default());

    let mut peer = Peer::connect(&server, "c1", Some("2"));
    peer.acquire("users/1", ChannelParams::new());
    peer.flush(&server);
    peer.await_replies(1);

    peer.reconnect(&server);
    assert!(peer.outgoing.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_access_error_is_denial() {
    let log = UserLog::new();
    let (server, _) = server_with(&log, ServerConfig::default());
    let conn = server.connect(ClientId::new("c1"), None);

    server.handle(&conn.client_id, subscribe(1, "broken/access")).unwrap();
    expect_undo(conn.recv_timeout(WAIT).unwrap(), ErrorKind::AccessDenied);
    assert_eq!(server.stats().pending, 0);
}

// --- Routing & Load ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_matching_channel() {
    let log = UserLog::new();
    let (server, _) = server_with(&log, ServerConfig::default());
    let conn = server.connect(ClientId::new("c1"), Some("1".into()));

    server.handle(&conn.client_id, subscribe(1, "users/1/posts")).unwrap();
    let message = conn.recv_timeout(WAIT).unwrap();
    assert_eq!(
        message,
        ServerMessage::Undo {
            request_id: RequestId(1),
            reason: ErrorKind::NoMatchingChannel,
        }
    );
    assert!(ErrorKind::NoMatchingChannel.is_permanent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_failure_is_scoped_to_one_subscribe() {
    let log = UserLog::new();
    let (server, _) = server_with(&log, ServerConfig::default());
    let conn = server.connect(ClientId::new("c1"), Some("1".into()));

    server.handle(&conn.client_id, subscribe(1, "broken/load")).unwrap();
    expect_undo(conn.recv_timeout(WAIT).unwrap(), ErrorKind::LoadFailure);

    server.handle(&conn.client_id, subscribe(2, "users/1")).unwrap();
    assert_eq!(
        conn.recv_timeout(WAIT).unwrap(),
        ServerMessage::Processed {
            request_id: RequestId(2)
        }
    );
    assert_eq!(server.stats().live, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_load_is_scoped_to_one_subscribe() {
    let log = UserLog::new();
    let config = ServerConfig {
        max_subscriptions_per_client: 1,
        ..Default::default()
    };
    let (server, _) = server_with(&log, config);
    let conn = server.connect(ClientId::new("c1"), None);

    server.handle(&conn.client_id, subscribe(1, "fragile/1")).unwrap();
    expect_undo(conn.recv_timeout(WAIT).unwrap(), ErrorKind::LoadFailure);
    assert_eq!(server.stats().pending, 0);

    // Neither stuck nor counted against the limit.
    server.handle(&conn.client_id, subscribe(2, "fragile/1")).unwrap();
    assert_eq!(
        conn.recv_timeout(WAIT).unwrap(),
        ServerMessage::Processed {
            request_id: RequestId(2)
        }
    );
    assert_eq!(server.stats().live, 1);
    assert!(server.is_connected(&conn.client_id));
}

// --- Unsubscribe & Cancellation ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_unsubscribe_is_noop() {
    let log = UserLog::new();
    let (server, _) = server_with(&log, ServerConfig::default());
    let conn = server.connect(ClientId::new("c1"), None);

    server.handle(&conn.client_id, unsubscribe(5, "users/1")).unwrap();
    assert_eq!(
        conn.recv_timeout(WAIT).unwrap(),
        ServerMessage::Processed {
            request_id: RequestId(5)
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_cancels_pending_pipeline() {
    let log = UserLog::new();
    let (server, loaded) = server_with(&log, ServerConfig::default());
    let conn = server.connect(ClientId::new("c1"), None);

    server.handle(&conn.client_id, subscribe(1, "slow/1")).unwrap();
    assert_eq!(server.stats().pending, 1);

    server.handle(&conn.client_id, unsubscribe(2, "slow/1")).unwrap();
    assert_eq!(
        conn.recv_timeout(WAIT).unwrap(),
        ServerMessage::Processed {
            request_id: RequestId(2)
        }
    );

    assert!(conn.recv_timeout(QUIET).is_err());
    assert_eq!(server.stats().pending, 0);
    assert_eq!(server.stats().live, 0);
    assert!(!loaded.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_cancels_pending_pipeline() {
    let log = UserLog::new();
    let (server, _) = server_with(&log, ServerConfig::default());
    let conn = server.connect(ClientId::new("c1"), None);

    server.handle(&conn.client_id, subscribe(1, "slow/1")).unwrap();
    assert!(server.disconnect(&conn.client_id));
    assert!(!server.disconnect(&conn.client_id));

    let stats = server.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.clients, 0);
}

// --- Limits ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscription_limit() {
    let log = UserLog::new();
    let config = ServerConfig {
        max_subscriptions_per_client: 1,
        ..Default::default()
    };
    let (server, _) = server_with(&log, config);
    let conn = server.connect(ClientId::new("c1"), Some("admin".into()));

    server.handle(&conn.client_id, subscribe(1, "users/1")).unwrap();
    assert_eq!(
        conn.recv_timeout(WAIT).unwrap(),
        ServerMessage::Processed {
            request_id: RequestId(1)
        }
    );

    server.handle(&conn.client_id, subscribe(2, "users/2")).unwrap();
    expect_undo(conn.recv_timeout(WAIT).unwrap(), ErrorKind::LimitExceeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_consumer_is_dropped() {
    let log = UserLog::new();
    let config = ServerConfig {
        outbox_capacity: 4,
        ..Default::default()
    };
    let (server, _) = server_with(&log, config);
    let conn = server.connect(ClientId::new("c1"), Some("1".into()));

    server.handle(&conn.client_id, subscribe(1, "users/1")).unwrap();
    assert!(matches!(
        conn.recv_timeout(WAIT).unwrap(),
        ServerMessage::Processed { .. }
    ));

    for i in 0..10 {
        let update = log.set("1", "counter", &i.to_string());
        server.process(&ActionContext::server(), &update.action, &update.meta);
    }

    assert!(!server.is_connected(&conn.client_id));
    assert_eq!(server.stats().live, 0);
}

// --- Misuse ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_client() {
    let log = UserLog::new();
    let (server, _) = server_with(&log, ServerConfig::default());

    let result = server.handle(&ClientId::new("ghost"), subscribe(1, "users/1"));
    assert!(matches!(result, Err(SyncError::UnknownClient(_))));
}

#[test]
fn test_subscribe_outside_runtime() {
    let log = UserLog::new();
    let (server, _) = server_with(&log, ServerConfig::default());
    let conn = server.connect(ClientId::new("c1"), Some("1".into()));

    let result = server.handle(&conn.client_id, subscribe(1, "users/1"));
    assert!(matches!(result, Err(SyncError::NoRuntime)));

    // Unsubscribe needs no runtime.
    server.handle(&conn.client_id, unsubscribe(2, "users/1")).unwrap();
    assert!(conn.recv_timeout(Duration::from_millis(50)).is_ok());
}
