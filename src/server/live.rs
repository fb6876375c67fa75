//! Live subscriptions: channel name -> subscribers with their installed filters.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::types::{Action, ChannelKey, ChannelParams, ClientId, Meta};

use super::channel::ActionFilter;

struct LiveSubscription {
    client_id: ClientId,
    params: ChannelParams,
    filter: Option<ActionFilter>,
}

impl LiveSubscription {
    fn is(&self, client_id: &ClientId, params: &ChannelParams) -> bool {
        &self.client_id == client_id && &self.params == params
    }

    fn accepts(&self, action: &Action, meta: &Meta) -> bool {
        match &self.filter {
            Some(filter) => filter(action, meta),
            None => true,
        }
    }
}

/// Concurrent table of live subscriptions. Inserts and removes happen per
/// subscribe/unsubscribe, iteration per resent action.
#[derive(Default)]
pub(crate) struct LiveTable {
    channels: RwLock<HashMap<String, Vec<LiveSubscription>>>,
}

impl LiveTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Install a subscription. Replaces an existing one with the same key.
    pub(crate) fn insert(&self, client_id: &ClientId, key: &ChannelKey, filter: Option<ActionFilter>) {
        let mut channels = self.channels.write();
        let subs = channels.entry(key.channel.clone()).or_default();
        subs.retain(|sub| !sub.is(client_id, &key.params));
        subs.push(LiveSubscription {
            client_id: client_id.clone(),
            params: key.params.clone(),
            filter,
        });
    }

    /// Remove a subscription and its filter. Returns false if it was not live.
    pub(crate) fn remove(&self, client_id: &ClientId, key: &ChannelKey) -> bool {
        let mut channels = self.channels.write();
        let Some(subs) = channels.get_mut(&key.channel) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|sub| !sub.is(client_id, &key.params));
        let removed = subs.len() < before;
        if subs.is_empty() {
            channels.remove(&key.channel);
        }
        removed
    }

    /// Remove every subscription of a client. Returns how many were removed.
    pub(crate) fn remove_client(&self, client_id: &ClientId) -> usize {
        let mut channels = self.channels.write();
        let mut removed = 0;
        channels.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|sub| &sub.client_id != client_id);
            removed += before - subs.len();
            !subs.is_empty()
        });
        removed
    }

    pub(crate) fn contains(&self, client_id: &ClientId, key: &ChannelKey) -> bool {
        self.channels
            .read()
            .get(&key.channel)
            .map(|subs| subs.iter().any(|sub| sub.is(client_id, &key.params)))
            .unwrap_or(false)
    }

    pub(crate) fn count_for_client(&self, client_id: &ClientId) -> usize {
        self.channels
            .read()
            .values()
            .flatten()
            .filter(|sub| &sub.client_id == client_id)
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.channels.read().values().map(Vec::len).sum()
    }

    /// Clients that should receive an action resent to `targets`, each with
    /// the subset of channels whose filter accepted it.
    pub(crate) fn recipients(
        &self,
        targets: &BTreeSet<String>,
        action: &Action,
        meta: &Meta,
    ) -> BTreeMap<ClientId, BTreeSet<String>> {
        let channels = self.channels.read();
        let mut recipients: BTreeMap<ClientId, BTreeSet<String>> = BTreeMap::new();

        for channel in targets {
            let Some(subs) = channels.get(channel) else {
                continue;
            };
            for sub in subs {
                if sub.accepts(action, meta) {
                    recipients
                        .entry(sub.client_id.clone())
                        .or_default()
                        .insert(channel.clone());
                }
            }
        }

        recipients
    }
}
