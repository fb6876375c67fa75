//! # Channel Sync
//!
//! Channel subscriptions with access control, since-based resynchronization
//! and per-subscriber filtered fan-out.
//!
//! ## Core Concepts
//!
//! - **Channels**: Named data partitions matched by patterns like `users/:id`
//! - **Subscriptions**: Reference-counted client interest, restored on reconnect
//! - **Since cursors**: The latest distributed timestamp a client has per channel
//! - **Resend**: Mapping a produced action to the channels it belongs to
//! - **Filters**: Per-subscription predicates deciding final delivery
//!
//! ## Example
//!
//! ```ignore
//! use channel_sync::{ChannelServer, Router, ServerConfig, SubscriptionRegistry, RegistryConfig};
//!
//! let mut router = Router::new();
//! router.register("users/:id", UserChannel)?;
//! let server = ChannelServer::new(router, ServerConfig::default());
//! let conn = server.connect(ClientId::new("c1"), Some("u1".into()));
//!
//! let registry = SubscriptionRegistry::new(RegistryConfig::default());
//! registry.on_connect();
//! let handle = registry.acquire("users/14", ChannelParams::new());
//!
//! // Transport glue: forward requests and replies.
//! for request in registry.outgoing().try_iter() {
//!     server.handle(&conn.client_id, request)?;
//! }
//! while let Ok(reply) = conn.try_recv() {
//!     registry.handle_message(reply);
//! }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod timestamp;
pub mod types;

// Re-exports
pub use async_trait::async_trait;
pub use client::{RegistryConfig, SubscriptionHandle, SubscriptionRegistry, SubscriptionState};
pub use error::{ChannelError, ErrorKind, Result, SyncError};
pub use protocol::{ClientMessage, ServerMessage, SubscribeRequest, UnsubscribeRequest};
pub use server::{
    ActionContext, ActionFilter, Channel, ChannelPattern, ChannelServer, ClientConnection,
    Route, RouteMatch, Router, ServerConfig, ServerStats, SubscribeContext,
};
pub use timestamp::{is_earlier, DistributedTimestamp, TimestampClock};
pub use types::*;
