//! Topic registry
//!
//! Topics are kept in a trie over `/`-separated path segments. Every topic
//! name is normalised to end in `/` before it reaches the tree, so
//! `sensors/temp` and `sensors/temp/` address the same node. A node exists
//! for every created topic; topics are never garbage collected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use solstice_protocol::QoS;

/// Normalises a topic name to its canonical trailing-`/` form.
#[must_use]
pub fn normalize_topic(name: &str) -> String {
    if name.ends_with('/') {
        name.to_string()
    } else {
        format!("{name}/")
    }
}

/// Normalises a subscription filter, detecting the trailing multi-level
/// wildcard. `a/#` becomes `("a/", true)`; anything else is canonicalised
/// like a topic name. Only the `/#` suffix is treated as a wildcard.
#[must_use]
pub fn normalize_filter(filter: &str) -> (String, bool) {
    if let Some(prefix) = filter.strip_suffix("/#") {
        (format!("{prefix}/"), true)
    } else {
        (normalize_topic(filter), false)
    }
}

/// A granted subscription. One record may be installed under several topics
/// when it came from a wildcard filter; `refs` counts the installs so that
/// removal from one topic does not invalidate the record elsewhere.
#[derive(Debug)]
pub struct Subscription {
    pub client_id: String,
    pub qos: QoS,
    refs: AtomicU32,
}

impl Subscription {
    #[must_use]
    pub fn new(client_id: impl Into<String>, qos: QoS) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.into(),
            qos,
            refs: AtomicU32::new(0),
        })
    }

    /// Number of topics this record is currently installed under.
    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }
}

/// A single topic: its subscriber map and the pre-encoded retained PUBLISH,
/// if any.
#[derive(Debug)]
pub struct Topic {
    pub name: String,
    subscribers: HashMap<String, Arc<Subscription>>,
    pub retained: Option<Bytes>,
}

impl Topic {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: HashMap::new(),
            retained: None,
        }
    }

    /// Installs a subscription, bumping its install count. A client
    /// re-subscribing replaces its previous record.
    pub fn subscribe(&mut self, subscription: Arc<Subscription>) {
        subscription.refs.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = self
            .subscribers
            .insert(subscription.client_id.clone(), subscription)
        {
            old.refs.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Removes a client's subscription. Returns whether one was present.
    pub fn unsubscribe(&mut self, client_id: &str) -> bool {
        match self.subscribers.remove(client_id) {
            Some(subscription) => {
                subscription.refs.fetch_sub(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &Arc<Subscription>> {
        self.subscribers.values()
    }

    #[must_use]
    pub fn subscriber(&self, client_id: &str) -> Option<&Arc<Subscription>> {
        self.subscribers.get(client_id)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    topic: Option<Topic>,
}

impl TrieNode {
    fn visit_topics(&mut self, f: &mut impl FnMut(&mut Topic)) {
        if let Some(ref mut topic) = self.topic {
            f(topic);
        }
        for child in self.children.values_mut() {
            child.visit_topics(f);
        }
    }
}

/// Trie of topics keyed by `/`-separated path segments.
#[derive(Debug, Default)]
pub struct TopicTree {
    root: TrieNode,
}

fn segments(name: &str) -> impl Iterator<Item = &str> {
    name.split('/').filter(|s| !s.is_empty())
}

impl TopicTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Topic> {
        let mut node = &self.root;
        for segment in segments(name) {
            node = node.children.get(segment)?;
        }
        node.topic.as_ref()
    }

    #[must_use]
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Topic> {
        let mut node = &mut self.root;
        for segment in segments(name) {
            node = node.children.get_mut(segment)?;
        }
        node.topic.as_mut()
    }

    /// Looks a topic up, creating it (and any intermediate nodes) if absent.
    pub fn get_or_create(&mut self, name: &str) -> &mut Topic {
        let mut node = &mut self.root;
        for segment in segments(name) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.topic.get_or_insert_with(|| Topic::new(name))
    }

    /// Invokes `f` for every existing topic strictly below `prefix`. The
    /// topic at the prefix itself, if any, is not visited.
    pub fn for_each_descendant(&mut self, prefix: &str, mut f: impl FnMut(&mut Topic)) {
        let mut node = &mut self.root;
        for segment in segments(prefix) {
            match node.children.get_mut(segment) {
                Some(child) => node = child,
                None => return,
            }
        }
        for child in node.children.values_mut() {
            child.visit_topics(&mut f);
        }
    }
}
