// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Convert a nested document to a topic->leaf mapping and back; apply an
//! update modifier; prune empty ancestors.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::topic::encode_segment;

/// Walk `doc`; objects descend, everything else (arrays included) terminates
/// descent and becomes a leaf. Produces `{suffix: leaf}` where `suffix` is
/// `/`-joined percent-encoded path segments rooted at `doc` (empty string if
/// `doc` itself is a leaf). Not idempotent: a key that already contains `/`
/// becomes further encoded if the result is flattened again.
pub fn to_flat_object(doc: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(doc, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            if map.is_empty() {
                // An empty object has no leaves of its own; spec.md's
                // "no empty interior node persists" invariant means this
                // only happens for a freshly-constructed doc never written
                // through DataCache, but toFlatObject must still terminate.
                return;
            }
            for (key, child) in map {
                let child_prefix = format!("{}/{}", prefix, encode_segment(key));
                flatten_into(child, child_prefix, out);
            }
        }
        other => {
            out.insert(prefix, other.clone());
        }
    }
}

/// Apply `modifier` — an ordered list of `(topic, value_or_null)` pairs —
/// to `doc` in order. `None` unsets the topic and prunes empty ancestors;
/// `Some(value)` sets it, creating intermediate objects as needed.
pub fn update_object(doc: &mut Value, modifier: &[(String, Option<Value>)]) {
    for (topic, value) in modifier {
        let path = crate::topic::topic_to_path(topic);
        match value {
            Some(value) => set_path(doc, &path, value.clone()),
            None => unset_path(doc, &path),
        }
    }
}

fn set_path(doc: &mut Value, path: &[String], value: Value) {
    if path.is_empty() {
        *doc = value;
        return;
    }
    if !doc.is_object() {
        *doc = Value::Object(serde_json::Map::new());
    }
    let map = doc.as_object_mut().unwrap();
    let (head, rest) = (&path[0], &path[1..]);
    if rest.is_empty() {
        map.insert(head.clone(), value);
    } else {
        let child = map
            .entry(head.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        set_path(child, rest, value);
    }
}

fn unset_path(doc: &mut Value, path: &[String]) {
    if path.is_empty() {
        *doc = Value::Null;
        return;
    }
    let Some(map) = doc.as_object_mut() else {
        return;
    };
    let (head, rest) = (&path[0], &path[1..]);
    if rest.is_empty() {
        map.remove(head);
    } else if let Some(child) = map.get_mut(head) {
        unset_path(child, rest);
        if matches!(child, Value::Object(m) if m.is_empty()) {
            map.remove(head);
        }
    }
}
