//! Client registry types.

use crate::error::ErrorKind;
use crate::types::{ChannelKey, ChannelParams};

/// Configuration for a subscription registry.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Max queued outgoing requests. A full outbox is treated as a lost
    /// connection.
    /// Default: 256
    pub outbox_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
        }
    }
}

/// Where a subscription is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Subscribe sent (or waiting for a connection), initial load not done.
    Pending,
    /// Server confirmed the subscription after the initial load.
    Loaded,
    /// Server rejected the subscription. Not retried automatically.
    Rejected(ErrorKind),
}

/// A caller's claim on a subscription. Give it back with
/// [`SubscriptionRegistry::release`](super::SubscriptionRegistry::release).
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub(crate) id: u64,
    pub(crate) key: ChannelKey,
}

impl SubscriptionHandle {
    pub fn channel(&self) -> &str {
        &self.key.channel
    }

    pub fn params(&self) -> &ChannelParams {
        &self.key.params
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }
}
