//! Topic router: subscriptions, fan-out and retained messages.

use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use log::{debug, trace};
use parking_lot::RwLock;
use quaymq_core::{Publish, QoS};

use crate::session::SessionRegistry;
use crate::subscription::{topic_matches_filter, SubscriptionStore};

pub struct TopicRouter {
    registry: Arc<SessionRegistry>,
    subscriptions: RwLock<SubscriptionStore>,
    retained: RwLock<AHashMap<String, Publish>>,
}

impl TopicRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            subscriptions: RwLock::new(SubscriptionStore::new()),
            retained: RwLock::new(AHashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Route an application message to every matching subscriber.
    ///
    /// Each client receives one copy at `min(publish.qos, granted)` with the
    /// retain flag cleared. Returns the number of copies handed off.
    pub fn publish(&self, publish: &Publish) -> usize {
        if publish.retain {
            self.store_retained(publish);
        }

        // collect first; the registry is never called under the trie lock
        let matches = self.subscriptions.read().match_topic(&publish.topic);
        let mut delivered = 0;
        for subscriber in matches {
            let mut copy = publish.clone();
            copy.qos = publish.qos.min(subscriber.qos);
            copy.retain = false;
            copy.dup = false;
            copy.packet_id = None;
            if self.registry.deliver(&subscriber.client_id, copy) {
                delivered += 1;
            } else {
                trace!("No session for subscriber {}", subscriber.client_id);
            }
        }
        debug!("Routed '{}' to {} subscriber(s)", publish.topic, delivered);
        delivered
    }

    fn store_retained(&self, publish: &Publish) {
        let mut retained = self.retained.write();
        if publish.payload.is_empty() {
            if retained.remove(&publish.topic).is_some() {
                debug!("Cleared retained message on '{}'", publish.topic);
            }
        } else {
            let mut stored = publish.clone();
            stored.dup = false;
            stored.packet_id = None;
            retained.insert(publish.topic.clone(), stored);
        }
    }

    /// Add or replace a subscription and return the retained messages it
    /// matches, ready to send with the retain flag set.
    pub fn subscribe(&self, client_id: &Arc<str>, filter: &str, qos: QoS) -> Vec<Publish> {
        self.subscriptions
            .write()
            .subscribe(filter, client_id.clone(), qos);

        self.retained
            .read()
            .values()
            .filter(|p| topic_matches_filter(&p.topic, filter))
            .map(|p| {
                let mut copy = p.clone();
                copy.qos = p.qos.min(qos);
                copy.retain = true;
                copy
            })
            .collect()
    }

    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        self.subscriptions.write().unsubscribe(filter, client_id)
    }

    /// Drop all subscriptions of a client.
    pub fn remove_client(&self, client_id: &str) -> usize {
        self.subscriptions.write().remove_client(client_id)
    }

    /// Remove stored sessions past their expiry together with their
    /// subscriptions.
    pub fn expire_sessions(&self, now: Instant) -> usize {
        self.registry.expire_offline(now, |client_id| {
            self.remove_client(client_id);
        })
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.read().len()
    }
}
