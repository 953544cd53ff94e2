//! Subscription store with trie-based topic matching.

use std::sync::Arc;

use ahash::AHashMap;
use quaymq_core::QoS;

/// One client's subscription at a trie node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub client_id: Arc<str>,
    /// Granted QoS.
    pub qos: QoS,
}

/// A node in the subscription trie.
#[derive(Debug, Default)]
struct TrieNode {
    /// Subscribers whose filter ends exactly here.
    subscribers: Vec<Subscriber>,
    /// Child nodes by literal topic level.
    children: AHashMap<String, TrieNode>,
    /// Single-level wildcard (+) branch.
    single_wildcard: Option<Box<TrieNode>>,
    /// Subscribers whose filter ends with `#` at this depth.
    multi_wildcard: Vec<Subscriber>,
}

/// Replace any existing entry for the same client. Returns true if one existed.
fn upsert(list: &mut Vec<Subscriber>, subscriber: Subscriber) -> bool {
    if let Some(existing) = list.iter_mut().find(|s| s.client_id == subscriber.client_id) {
        existing.qos = subscriber.qos;
        return true;
    }
    list.push(subscriber);
    false
}

fn remove_from(list: &mut Vec<Subscriber>, client_id: &str) -> bool {
    let before = list.len();
    list.retain(|s| &*s.client_id != client_id);
    list.len() != before
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
            && self.multi_wildcard.is_empty()
            && self.children.is_empty()
            && self.single_wildcard.is_none()
    }

    fn insert(&mut self, levels: &[&str], subscriber: Subscriber) -> bool {
        let Some((&level, rest)) = levels.split_first() else {
            return upsert(&mut self.subscribers, subscriber);
        };

        match level {
            "#" => upsert(&mut self.multi_wildcard, subscriber),
            "+" => self
                .single_wildcard
                .get_or_insert_with(Box::default)
                .insert(rest, subscriber),
            _ => self
                .children
                .entry(level.to_string())
                .or_default()
                .insert(rest, subscriber),
        }
    }

    /// Remove one filter for a client, pruning nodes left empty.
    fn remove(&mut self, levels: &[&str], client_id: &str) -> bool {
        let Some((&level, rest)) = levels.split_first() else {
            return remove_from(&mut self.subscribers, client_id);
        };

        match level {
            "#" => remove_from(&mut self.multi_wildcard, client_id),
            "+" => {
                let Some(child) = self.single_wildcard.as_mut() else {
                    return false;
                };
                let removed = child.remove(rest, client_id);
                if child.is_empty() {
                    self.single_wildcard = None;
                }
                removed
            }
            _ => {
                let Some(child) = self.children.get_mut(level) else {
                    return false;
                };
                let removed = child.remove(rest, client_id);
                if child.is_empty() {
                    self.children.remove(level);
                }
                removed
            }
        }
    }

    fn remove_client(&mut self, client_id: &str) -> usize {
        let mut removed = usize::from(remove_from(&mut self.subscribers, client_id))
            + usize::from(remove_from(&mut self.multi_wildcard, client_id));

        if let Some(child) = self.single_wildcard.as_mut() {
            removed += child.remove_client(client_id);
            if child.is_empty() {
                self.single_wildcard = None;
            }
        }

        self.children.retain(|_, child| {
            removed += child.remove_client(client_id);
            !child.is_empty()
        });
        removed
    }

    fn collect(&self, levels: &[&str], is_root: bool, out: &mut Vec<Subscriber>) {
        // MQTT-4.7.2-1: $ topics never match a filter starting with a wildcard
        let skip_wildcards = is_root && levels.first().is_some_and(|l| l.starts_with('$'));

        if !skip_wildcards {
            // `#` also matches the parent level itself
            out.extend(self.multi_wildcard.iter().cloned());
        }

        let Some((&level, rest)) = levels.split_first() else {
            out.extend(self.subscribers.iter().cloned());
            return;
        };

        if !skip_wildcards {
            if let Some(child) = &self.single_wildcard {
                child.collect(rest, false, out);
            }
        }

        if let Some(child) = self.children.get(level) {
            child.collect(rest, false, out);
        }
    }
}

/// Subscription store using a trie for topic matching.
#[derive(Debug, Default)]
pub struct SubscriptionStore {
    root: TrieNode,
    count: usize,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a client's subscription. Returns true if it replaced
    /// an existing subscription to the same filter.
    pub fn subscribe(&mut self, filter: &str, client_id: Arc<str>, qos: QoS) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        let replaced = self.root.insert(&levels, Subscriber { client_id, qos });
        if !replaced {
            self.count += 1;
        }
        replaced
    }

    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        let removed = self.root.remove(&levels, client_id);
        if removed {
            self.count -= 1;
        }
        removed
    }

    /// Remove every subscription held by a client.
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        let removed = self.root.remove_client(client_id);
        self.count -= removed;
        removed
    }

    /// Subscribers matching `topic`, one entry per client carrying the
    /// highest QoS among that client's overlapping filters.
    pub fn match_topic(&self, topic: &str) -> Vec<Subscriber> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut matches = Vec::new();
        self.root.collect(&levels, true, &mut matches);

        if matches.len() > 1 {
            let mut best: AHashMap<Arc<str>, QoS> = AHashMap::with_capacity(matches.len());
            let mut order = Vec::with_capacity(matches.len());
            for sub in matches {
                match best.get_mut(&sub.client_id) {
                    Some(qos) => *qos = (*qos).max(sub.qos),
                    None => {
                        order.push(sub.client_id.clone());
                        best.insert(sub.client_id, sub.qos);
                    }
                }
            }
            matches = order
                .into_iter()
                .map(|client_id| {
                    let qos = best[&client_id];
                    Subscriber { client_id, qos }
                })
                .collect();
        }
        matches
    }

    /// Number of (client, filter) subscriptions.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Check if a topic name matches a topic filter (which may contain wildcards).
/// Used to pick retained messages for a new subscription.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A filter is valid when wildcards occupy whole levels and `#` is last.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => return false,
            "#" | "+" => {}
            _ if level.contains(['#', '+']) => return false,
            _ => {}
        }
    }
    true
}

/// A topic name used in PUBLISH must be non-empty and wildcard-free.
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['#', '+'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    fn clients(subs: &[Subscriber]) -> Vec<&str> {
        let mut ids: Vec<&str> = subs.iter().map(|s| &*s.client_id).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_exact_match() {
        let mut store = SubscriptionStore::new();
        store.subscribe("sensors/temp", id("a"), QoS::AtMostOnce);

        assert_eq!(clients(&store.match_topic("sensors/temp")), ["a"]);
        assert!(store.match_topic("sensors/humidity").is_empty());
        assert!(store.match_topic("sensors").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut store = SubscriptionStore::new();
        store.subscribe("sport/+/score", id("a"), QoS::AtLeastOnce);

        assert_eq!(store.match_topic("sport/tennis/score").len(), 1);
        assert!(store.match_topic("sport/tennis/player/score").is_empty());
        assert!(store.match_topic("sport/score").is_empty());
    }

    #[test]
    fn test_multi_wildcard_includes_parent() {
        let mut store = SubscriptionStore::new();
        store.subscribe("sport/#", id("a"), QoS::AtMostOnce);

        for topic in ["sport", "sport/tennis", "sport/tennis/score"] {
            assert_eq!(store.match_topic(topic).len(), 1, "{}", topic);
        }
        assert!(store.match_topic("sports").is_empty());
    }

    #[test]
    fn test_dollar_topics_skip_root_wildcards() {
        let mut store = SubscriptionStore::new();
        store.subscribe("#", id("all"), QoS::AtMostOnce);
        store.subscribe("+/info", id("plus"), QoS::AtMostOnce);
        store.subscribe("$SYS/#", id("sys"), QoS::AtMostOnce);

        assert_eq!(clients(&store.match_topic("$SYS/info")), ["sys"]);
        assert_eq!(clients(&store.match_topic("x/info")), ["all", "plus"]);
    }

    #[test]
    fn test_overlapping_filters_deliver_once_at_max_qos() {
        let mut store = SubscriptionStore::new();
        store.subscribe("a/#", id("c1"), QoS::AtMostOnce);
        store.subscribe("a/+", id("c1"), QoS::ExactlyOnce);
        store.subscribe("a/b", id("c2"), QoS::AtLeastOnce);

        let subs = store.match_topic("a/b");
        assert_eq!(subs.len(), 2);
        let c1 = subs.iter().find(|s| &*s.client_id == "c1").unwrap();
        assert_eq!(c1.qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_resubscribe_replaces_qos() {
        let mut store = SubscriptionStore::new();
        assert!(!store.subscribe("t", id("a"), QoS::AtMostOnce));
        assert!(store.subscribe("t", id("a"), QoS::ExactlyOnce));
        assert_eq!(store.len(), 1);
        assert_eq!(store.match_topic("t")[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_unsubscribe_and_remove_client() {
        let mut store = SubscriptionStore::new();
        store.subscribe("sensors/temp", id("a"), QoS::AtMostOnce);
        store.subscribe("sensors/temp", id("b"), QoS::AtMostOnce);
        store.subscribe("sensors/+", id("a"), QoS::AtMostOnce);
        store.subscribe("#", id("a"), QoS::AtMostOnce);
        assert_eq!(store.len(), 4);

        assert!(store.unsubscribe("sensors/temp", "a"));
        assert!(!store.unsubscribe("sensors/temp", "a"));
        assert_eq!(clients(&store.match_topic("sensors/temp")), ["a", "b"]);

        assert_eq!(store.remove_client("a"), 2);
        assert_eq!(clients(&store.match_topic("sensors/temp")), ["b"]);
        assert_eq!(store.len(), 1);

        store.remove_client("b");
        assert!(store.is_empty());
        assert!(store.root.is_empty());
    }

    #[test]
    fn test_topic_matches_filter() {
        assert!(topic_matches_filter("sport/tennis/score", "sport/+/score"));
        assert!(!topic_matches_filter("sport/tennis/player/score", "sport/+/score"));
        assert!(topic_matches_filter("sport", "sport/#"));
        assert!(topic_matches_filter("sport/tennis/score", "sport/#"));
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(!topic_matches_filter("a/b", "a"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(topic_matches_filter("/finance", "+/+"));
        assert!(!topic_matches_filter("$SYS/uptime", "#"));
        assert!(topic_matches_filter("$SYS/uptime", "$SYS/#"));
    }

    #[test]
    fn test_filter_validation() {
        for ok in ["a", "a/b", "+", "#", "a/+/c", "a/#", "+/+", "/"] {
            assert!(is_valid_filter(ok), "{}", ok);
        }
        for bad in ["", "a/#/c", "a#", "a/b+", "#/a", "sport+"] {
            assert!(!is_valid_filter(bad), "{}", bad);
        }
        assert!(is_valid_topic_name("a/b"));
        assert!(!is_valid_topic_name("a/+"));
        assert!(!is_valid_topic_name(""));
    }
}
