//! AuthorizationCache - who may publish which event type in which environment
//!
//! Fed by subscription resource-lifecycle notifications arriving on a channel,
//! read by every publish request. Per-key atomicity comes from the DashMap
//! entry API; different keys are fully independent.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use eg_common::{SubscriptionChange, SubscriptionNotification};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AuthorizationKey {
    environment: String,
    event_type: String,
}

impl AuthorizationKey {
    fn new(environment: &str, event_type: &str) -> Self {
        Self {
            environment: environment.to_string(),
            event_type: event_type.to_string(),
        }
    }
}

/// Entry invariant: present iff at least one subscription contributes.
#[derive(Debug, Default)]
struct AuthorizationEntry {
    publisher_ids: HashSet<String>,
    subscription_ids: HashSet<String>,
}

/// Concurrent map from (environment, event type) to the publisher ids allowed
/// to emit that type, tracking which subscriptions contributed the grant.
#[derive(Debug, Default)]
pub struct AuthorizationCache {
    entries: DashMap<AuthorizationKey, AuthorizationEntry>,
}

impl AuthorizationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the authoritative publisher id set for (environment, event
    /// type) and records `subscription_id` as a contributor. Re-applying the
    /// same update is a no-op beyond the replace.
    pub fn upsert(
        &self,
        environment: &str,
        event_type: &str,
        subscription_id: &str,
        publisher_ids: HashSet<String>,
    ) {
        let key = AuthorizationKey::new(environment, event_type);
        let mut entry = self.entries.entry(key).or_default();
        entry.publisher_ids = publisher_ids;
        entry.subscription_ids.insert(subscription_id.to_string());
    }

    /// Removes `subscription_id` from the contributor set; once no
    /// subscription contributes, the whole entry is deleted so no dangling
    /// authorization data remains. No-op for unknown keys.
    pub fn remove(&self, environment: &str, event_type: &str, subscription_id: &str) {
        let key = AuthorizationKey::new(environment, event_type);
        if let Entry::Occupied(mut occupied) = self.entries.entry(key) {
            let entry = occupied.get_mut();
            entry.subscription_ids.remove(subscription_id);
            if entry.subscription_ids.is_empty() {
                occupied.remove();
            }
        }
    }

    /// Returns the allowed publisher ids, or an empty set when no entry
    /// exists. Callers treat both identically: no one may publish.
    pub fn lookup(&self, environment: &str, event_type: &str) -> HashSet<String> {
        let key = AuthorizationKey::new(environment, event_type);
        self.entries
            .get(&key)
            .map(|entry| entry.publisher_ids.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Consumes subscription resource-lifecycle notifications from a channel and
/// applies them to the authorization cache, decoupling notification delivery
/// from cache mutation.
pub struct SubscriptionWatcher {
    cache: Arc<AuthorizationCache>,
    default_environment: String,
}

impl SubscriptionWatcher {
    pub fn new(cache: Arc<AuthorizationCache>, default_environment: impl Into<String>) -> Self {
        Self {
            cache,
            default_environment: default_environment.into(),
        }
    }

    /// Runs until the notification channel closes.
    pub async fn run(self, mut notifications: mpsc::Receiver<SubscriptionChange>) {
        while let Some(change) = notifications.recv().await {
            self.apply(change);
        }
        info!("Subscription notification channel closed, watcher stopping");
    }

    pub fn apply(&self, change: SubscriptionChange) {
        match change {
            SubscriptionChange::Added(notification) | SubscriptionChange::Updated(notification) => {
                debug!(
                    subscription_id = %notification.subscription_id,
                    event_type = %notification.event_type,
                    "Applying subscription grant"
                );
                let environment = self.environment_of(&notification);
                self.cache.upsert(
                    &environment,
                    &notification.event_type,
                    &notification.subscription_id,
                    notification.all_publisher_ids(),
                );
            }
            SubscriptionChange::Deleted(notification) => {
                debug!(
                    subscription_id = %notification.subscription_id,
                    event_type = %notification.event_type,
                    "Removing subscription grant"
                );
                let environment = self.environment_of(&notification);
                self.cache.remove(
                    &environment,
                    &notification.event_type,
                    &notification.subscription_id,
                );
            }
        }
    }

    fn environment_of(&self, notification: &SubscriptionNotification) -> String {
        notification
            .environment
            .clone()
            .unwrap_or_else(|| self.default_environment.clone())
    }
}
