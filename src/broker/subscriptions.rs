//! Subscription table: target → ordered set of subscribed clients.
//!
//! Owned exclusively by the broker task. Sets are insertion-ordered so
//! fan-out follows subscription order, and a client subscribed twice is
//! stored once.

use indexmap::{IndexMap, IndexSet};

use crate::protocol::Target;
use crate::transport::ClientId;

/// Subscription table.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    table: IndexMap<Target, IndexSet<ClientId>>,
}

impl Subscriptions {
    /// Subscribe `client` to `target`. Returns `false` if already subscribed.
    pub fn subscribe(&mut self, target: Target, client: ClientId) -> bool {
        self.table.entry(target).or_default().insert(client)
    }

    /// Remove one subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&mut self, target: &Target, client: &ClientId) -> bool {
        let Some(set) = self.table.get_mut(target) else {
            return false;
        };
        let removed = set.shift_remove(client);
        if set.is_empty() {
            self.table.shift_remove(target);
        }
        removed
    }

    /// Remove `client` from every set. Returns how many subscriptions it held.
    pub fn remove_client(&mut self, client: &ClientId) -> usize {
        let mut removed = 0;
        self.table.retain(|_, set| {
            if set.shift_remove(client) {
                removed += 1;
            }
            !set.is_empty()
        });
        removed
    }

    /// Delivery list for a response: `origin` first, then every subscriber
    /// of `target` in subscription order, each at most once.
    pub fn recipients(&self, origin: &ClientId, target: Option<&Target>) -> Vec<ClientId> {
        let mut out = vec![origin.clone()];
        if let Some(set) = target.and_then(|t| self.table.get(t)) {
            out.extend(set.iter().filter(|c| *c != origin).cloned());
        }
        out
    }

    /// Number of targets with at least one subscriber.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.len()
    }
}
