//! Client side of channel subscriptions.
//!
//! One [`SubscriptionRegistry`] belongs to one connection session. It
//! deduplicates interest by channel and params, reference-counts it, and
//! keeps a since cursor per channel so resubscribing after a reconnect only
//! asks for what the client has not seen.
//!
//! # Example
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new(RegistryConfig::default());
//! let outgoing = registry.outgoing();
//! registry.on_connect();
//!
//! let handle = registry.acquire("users/14", ChannelParams::new().with("fields", json!(["name"])));
//! // transport: forward `outgoing` to the server, feed replies back
//! while let Ok(message) = incoming.recv() {
//!     if let Some(envelope) = registry.handle_message(message) {
//!         apply(envelope);
//!     }
//! }
//! registry.release(handle);
//! ```

mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::{RegistryConfig, SubscriptionHandle, SubscriptionState};
