// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! In-memory nested document with change notification: two listener
//! channels (atomic and flat), topic-scoped subscriptions, wildcard
//! iteration.
//!
//! `DataCache` itself is a plain struct mutated by `&mut self`, the same
//! shape as the teacher's `SubTrie` in `dispatcher/trie.rs`. [`Cache`] wraps
//! it in a mutex so it can be shared between an embedder's own task and the
//! `SyncEngine` actor — that mutex is the "single logical executor" spec.md
//! §5 asks implementers on parallel runtimes to serialize access through.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::flatten::to_flat_object;
use crate::matcher::{match_path, Bindings};
use crate::topic::{path_to_topic, topic_to_path};
use crate::types::{Path, Tags};

/// A node in the document tree: either an interior map of children or a
/// leaf holding an arbitrary JSON value (arrays included — the flattener
/// treats arrays as opaque leaves too). A node never holds both.
#[derive(Debug, Clone)]
enum Node {
    Leaf(Value),
    Children(BTreeMap<String, Node>),
}

impl Node {
    fn empty_children() -> Self {
        Node::Children(BTreeMap::new())
    }

    fn is_empty_children(&self) -> bool {
        matches!(self, Node::Children(map) if map.is_empty())
    }

    fn to_value(&self) -> Value {
        match self {
            Node::Leaf(value) => value.clone(),
            Node::Children(map) => {
                let mut object = serde_json::Map::new();
                for (key, node) in map {
                    object.insert(key.clone(), node.to_value());
                }
                Value::Object(object)
            }
        }
    }

    fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => {
                let mut children = BTreeMap::new();
                for (key, value) in map {
                    children.insert(key, Node::from_value(value));
                }
                Node::Children(children)
            }
            leaf => Node::Leaf(leaf),
        }
    }
}

type AtomicListener = Arc<dyn Fn(&Path, &Value, &Tags) + Send + Sync>;
type FlatListener = Arc<dyn Fn(&Path, &Value, &Tags) + Send + Sync>;
type PathListener = Arc<dyn Fn(&Value, &str, &Bindings, &Tags) + Send + Sync>;

struct PathSubscription {
    selector: Path,
    callback: PathListener,
}

/// Flat changes produced by a single `update` call: `{topic: leaf}` pairs,
/// in the same shape flat listeners receive.
pub type FlatChanges = BTreeMap<String, Value>;

#[derive(Default)]
pub struct DataCache {
    root: Option<Node>,
    listeners: Vec<AtomicListener>,
    flat_listeners: Vec<FlatListener>,
    path_subscriptions: Vec<PathSubscription>,
    flat_path_subscriptions: Vec<PathSubscription>,
}

impl std::fmt::Debug for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCache")
            .field("root", &self.root)
            .field("listeners", &self.listeners.len())
            .field("flat_listeners", &self.flat_listeners.len())
            .finish()
    }
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an atomic listener: fires once per `update` call with the
    /// single `{topic: value}` entry, `value` possibly a subdocument.
    pub fn subscribe(&mut self, callback: impl Fn(&Path, &Value, &Tags) + Send + Sync + 'static) {
        self.listeners.push(Arc::new(callback));
    }

    /// Register a path-scoped listener: fires for every change whose
    /// concrete path matches `selector`, receiving `(value, topic,
    /// bindings, tags)`.
    pub fn subscribe_path(
        &mut self,
        selector: &Path,
        callback: impl Fn(&Value, &str, &Bindings, &Tags) + Send + Sync + 'static,
    ) {
        self.path_subscriptions.push(PathSubscription {
            selector: selector.clone(),
            callback: Arc::new(callback),
        });
    }

    /// Register a path-scoped listener over the fully-flattened subtree:
    /// one invocation per leaf rather than one per `update` call.
    pub fn subscribe_path_flat(
        &mut self,
        selector: &Path,
        callback: impl Fn(&Value, &str, &Bindings, &Tags) + Send + Sync + 'static,
    ) {
        self.flat_path_subscriptions.push(PathSubscription {
            selector: selector.clone(),
            callback: Arc::new(callback),
        });
    }

    /// Idempotent write. `value == Value::Null` deletes. Returns the flat
    /// changes that were actually applied (empty if the write was a no-op).
    pub fn update(&mut self, path: &Path, value: Value, tags: &Tags) -> FlatChanges {
        if value.is_null() {
            return self.unset(path, tags);
        }

        if self.get(path).as_ref() == Some(&value) {
            return FlatChanges::new();
        }

        self.set_node(path, Node::from_value(value.clone()));
        self.notify(path, &value, tags)
    }

    fn unset(&mut self, path: &Path, tags: &Tags) -> FlatChanges {
        if self.get(path).is_none() {
            return FlatChanges::new();
        }
        self.remove_node(path);
        self.notify(path, &Value::Null, tags)
    }

    fn notify(&mut self, path: &Path, value: &Value, tags: &Tags) -> FlatChanges {
        for listener in &self.listeners {
            listener(path, value, tags);
        }

        let flat = to_flat_object(value);
        let topic_prefix = path_to_topic(path);
        let mut merged = FlatChanges::new();
        for (suffix, leaf) in &flat {
            let topic = if suffix.is_empty() {
                topic_prefix.clone()
            } else {
                format!("{}{}", topic_prefix, suffix)
            };
            merged.insert(topic, leaf.clone());
        }

        for listener in &self.flat_listeners {
            listener(path, value, tags);
        }

        for sub in &self.path_subscriptions {
            if let Some(bindings) = match_path(&sub.selector, path) {
                let topic = path_to_topic(path);
                (sub.callback)(value, &topic, &bindings, tags);
            }
        }

        for sub in &self.flat_path_subscriptions {
            for (topic, leaf) in &merged {
                let leaf_path = topic_to_path(topic);
                if let Some(bindings) = match_path(&sub.selector, &leaf_path) {
                    (sub.callback)(leaf, topic, &bindings, tags);
                }
            }
        }

        merged
    }

    /// Register a plain flat listener (fires once per leaf changed by a
    /// single `update`, merged into the topic prefix).
    pub fn subscribe_flat(&mut self, callback: impl Fn(&Path, &Value, &Tags) + Send + Sync + 'static) {
        self.flat_listeners.push(Arc::new(callback));
    }

    /// Deep-clone the value at `path`, or `None` if nothing is stored there.
    pub fn get(&self, path: &Path) -> Option<Value> {
        self.get_node(path).map(Node::to_value)
    }

    pub fn get_by_topic(&self, topic: &str) -> Option<Value> {
        self.get(&topic_to_path(topic))
    }

    /// Deep-clone the subtree at `path`, then prune children that don't
    /// match `path` itself when it contains wildcards (wildcards honored).
    pub fn filter(&self, selector: &Path) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        self.for_match(selector, |value, topic, _bindings| {
            out.insert(topic.to_string(), value.clone());
        });
        out
    }

    pub fn filter_by_topic(&self, selector: &str) -> BTreeMap<String, Value> {
        self.filter(&topic_to_path(selector))
    }

    /// Iterate all current matches of `selector`, invoking
    /// `cb(value, topic, bindings)`.
    pub fn for_match(&self, selector: &Path, mut cb: impl FnMut(&Value, &str, &Bindings)) {
        self.walk(selector, &mut Vec::new(), self.root.as_ref(), &mut cb);
    }

    pub fn for_path_match(&self, selector: &str, mut cb: impl FnMut(&Value, &str, &Bindings)) {
        self.for_match(&topic_to_path(selector), &mut cb);
    }

    fn walk(
        &self,
        selector: &Path,
        prefix: &mut Path,
        node: Option<&Node>,
        cb: &mut impl FnMut(&Value, &str, &Bindings),
    ) {
        let node = match node {
            Some(node) => node,
            None => return,
        };
        if let Some(bindings) = match_path(selector, prefix) {
            let topic = path_to_topic(prefix);
            cb(&node.to_value(), &topic, &bindings);
            return;
        }
        if let Node::Children(children) = node {
            for (key, child) in children {
                prefix.push(key.clone());
                self.walk(selector, prefix, Some(child), cb);
                prefix.pop();
            }
        }
    }

    fn get_node(&self, path: &Path) -> Option<&Node> {
        let mut node = self.root.as_ref()?;
        for segment in path {
            match node {
                Node::Children(children) => node = children.get(segment)?,
                Node::Leaf(_) => return None,
            }
        }
        Some(node)
    }

    fn set_node(&mut self, path: &Path, value: Node) {
        if path.is_empty() {
            self.root = Some(value);
            return;
        }
        if self.root.is_none() {
            self.root = Some(Node::empty_children());
        }
        let mut node = self.root.as_mut().unwrap();
        for segment in &path[..path.len() - 1] {
            if !matches!(node, Node::Children(_)) {
                *node = Node::empty_children();
            }
            if let Node::Children(children) = node {
                node = children
                    .entry(segment.clone())
                    .or_insert_with(Node::empty_children);
            }
        }
        if let Node::Children(children) = node {
            children.insert(path[path.len() - 1].clone(), value);
        }
    }

    /// Remove the value at `path` and prune any ancestor left holding no
    /// children.
    fn remove_node(&mut self, path: &Path) {
        if path.is_empty() {
            self.root = None;
            return;
        }
        Self::remove_recursive(&mut self.root, path);
    }

    fn remove_recursive(node: &mut Option<Node>, path: &Path) {
        let current = match node {
            Some(n) => n,
            None => return,
        };
        let Node::Children(children) = current else {
            return;
        };
        if path.len() == 1 {
            children.remove(&path[0]);
        } else if let Some(child) = children.get_mut(&path[0]) {
            let mut boxed = Some(std::mem::replace(child, Node::empty_children()));
            Self::remove_recursive(&mut boxed, &path[1..]);
            match boxed {
                Some(updated) if !updated.is_empty_children() => {
                    *children.get_mut(&path[0]).unwrap() = updated;
                }
                _ => {
                    children.remove(&path[0]);
                }
            }
        }
        if children.is_empty() {
            *node = None;
        }
    }
}

/// Cloneable handle to a [`DataCache`]. Locking is held only across a single
/// update/notify pass; listeners are invoked with the lock held, which is
/// what gives the fan-out ordering invariant in spec.md §4.3/§5 its teeth.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Mutex<DataCache>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            inner: Arc::new(Mutex::new(DataCache::new())),
        }
    }

    pub fn update(&self, path: &Path, value: Value, tags: &Tags) -> FlatChanges {
        self.inner.lock().unwrap().update(path, value, tags)
    }

    pub fn update_topic(&self, topic: &str, value: Value, tags: &Tags) -> FlatChanges {
        self.update(&topic_to_path(topic), value, tags)
    }

    pub fn get(&self, path: &Path) -> Option<Value> {
        self.inner.lock().unwrap().get(path)
    }

    pub fn get_by_topic(&self, topic: &str) -> Option<Value> {
        self.inner.lock().unwrap().get_by_topic(topic)
    }

    pub fn filter(&self, selector: &Path) -> BTreeMap<String, Value> {
        self.inner.lock().unwrap().filter(selector)
    }

    pub fn filter_by_topic(&self, selector: &str) -> BTreeMap<String, Value> {
        self.inner.lock().unwrap().filter_by_topic(selector)
    }

    pub fn for_match(&self, selector: &Path, cb: impl FnMut(&Value, &str, &Bindings)) {
        self.inner.lock().unwrap().for_match(selector, cb)
    }

    pub fn for_path_match(&self, selector: &str, cb: impl FnMut(&Value, &str, &Bindings)) {
        self.inner.lock().unwrap().for_path_match(selector, cb)
    }

    pub fn subscribe(&self, callback: impl Fn(&Path, &Value, &Tags) + Send + Sync + 'static) {
        self.inner.lock().unwrap().subscribe(callback)
    }

    pub fn subscribe_flat(&self, callback: impl Fn(&Path, &Value, &Tags) + Send + Sync + 'static) {
        self.inner.lock().unwrap().subscribe_flat(callback)
    }

    pub fn subscribe_path(
        &self,
        selector: &Path,
        callback: impl Fn(&Value, &str, &Bindings, &Tags) + Send + Sync + 'static,
    ) {
        self.inner.lock().unwrap().subscribe_path(selector, callback)
    }

    pub fn subscribe_path_flat(
        &self,
        selector: &Path,
        callback: impl Fn(&Value, &str, &Bindings, &Tags) + Send + Sync + 'static,
    ) {
        self.inner
            .lock()
            .unwrap()
            .subscribe_path_flat(selector, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> Path {
        s.split('/').map(str::to_string).collect()
    }

    #[test]
    fn set_then_get_returns_written_value() {
        let mut cache = DataCache::new();
        cache.update(&path("a/b"), json!(1), &Tags::new());
        assert_eq!(cache.get(&path("a/b")), Some(json!(1)));
    }

    #[test]
    fn null_is_equivalent_to_unset_and_prunes_ancestors() {
        let mut cache = DataCache::new();
        cache.update(&path("a/b"), json!(1), &Tags::new());
        cache.update(&path("a/b"), Value::Null, &Tags::new());
        assert_eq!(cache.get(&path("a/b")), None);
        assert_eq!(cache.get(&path("a")), None);
    }

    #[test]
    fn equal_value_write_is_a_noop() {
        let mut cache = DataCache::new();
        cache.update(&path("a"), json!(1), &Tags::new());
        let changes = cache.update(&path("a"), json!(1), &Tags::new());
        assert!(changes.is_empty());
    }

    #[test]
    fn write_of_undefined_style_missing_value_is_noop() {
        // Rust has no `undefined`; the closest analogue is writing null
        // where nothing exists, which must also be a no-op (not merely
        // equivalent to unset-of-something).
        let mut cache = DataCache::new();
        let changes = cache.update(&path("a/b"), Value::Null, &Tags::new());
        assert!(changes.is_empty());
    }

    #[test]
    fn atomic_listener_fires_before_flat_listener() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let mut cache = DataCache::new();
        let order = Arc::new(AtomicU32::new(0));
        let atomic_seen = Arc::new(AtomicU32::new(0));
        let flat_seen = Arc::new(AtomicU32::new(0));

        {
            let order = order.clone();
            let atomic_seen = atomic_seen.clone();
            cache.subscribe(move |_, _, _| {
                atomic_seen.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            });
        }
        {
            let order = order.clone();
            let flat_seen = flat_seen.clone();
            cache.subscribe_flat(move |_, _, _| {
                flat_seen.store(order.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            });
        }

        cache.update(&path("a"), json!(1), &Tags::new());
        assert!(atomic_seen.load(Ordering::SeqCst) < flat_seen.load(Ordering::SeqCst));
    }

    #[test]
    fn subscribe_path_delivers_named_bindings() {
        let mut cache = DataCache::new();
        let captured: Arc<Mutex<Option<(String, Bindings)>>> = Arc::new(Mutex::new(None));
        let captured2 = captured.clone();
        cache.subscribe_path(&path("+org/+dev/status"), move |value, topic, bindings, _| {
            *captured2.lock().unwrap() = Some((format!("{}={}", topic, value), bindings.clone()));
        });
        cache.update(&path("acme/r1/status"), json!("ok"), &Tags::new());
        let (label, bindings) = captured.lock().unwrap().clone().unwrap();
        assert_eq!(label, "/acme/r1/status=\"ok\"");
        assert_eq!(bindings.get("org"), Some(&"acme".to_string()));
        assert_eq!(bindings.get("dev"), Some(&"r1".to_string()));
    }
}
