// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Version-namespaced state migration: merge every version of a namespace
//! older than `newVersion`, publish the merged result under `newVersion`,
//! then clear the older namespaces.
//!
//! A migration topic's segments look like `/org/device/@scope/cap/version/sub…`
//! with wildcards allowed anywhere except the version segment itself and
//! anything after it. We identify the version slot as the *last* wildcard
//! segment in the topic: everything after it is a literal suffix path, which
//! matches the schema's "no wildcards after version" rule without hardcoding
//! a fixed segment count.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::Error;
use crate::sync::MqttSync;
use crate::topic::{encode_segment, path_to_topic, topic_to_path, SelectorSegment};
use crate::types::Path;

#[derive(Clone)]
pub struct MigrationDescriptor {
    pub topic: String,
    pub new_version: String,
    pub transform: Option<Arc<dyn Fn(Value) -> Value + Send + Sync>>,
    pub flat: bool,
    pub level: usize,
}

fn is_wildcard_segment(segment: &str) -> bool {
    !matches!(SelectorSegment::parse(segment), SelectorSegment::Literal(_))
}

/// Lenient semver parse: pads missing minor/patch with zeros so a version
/// string that is not fully specified sorts as its minimum possible value.
fn parse_version_lenient(raw: &str) -> semver::Version {
    let parts: Vec<&str> = raw.split('.').collect();
    let padded = match parts.len() {
        1 => format!("{}.0.0", parts[0]),
        2 => format!("{}.{}.0", parts[0], parts[1]),
        _ => raw.to_string(),
    };
    semver::Version::parse(&padded).unwrap_or(semver::Version::new(0, 0, 0))
}

fn navigate_create<'a>(root: &'a mut Value, path: &[String]) -> &'a mut Value {
    let mut current = root;
    for segment in path {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().unwrap();
        current = map.entry(segment.clone()).or_insert(Value::Null);
    }
    current
}

fn get_path_value(root: &Value, path: &[String]) -> Value {
    let mut current = root;
    for segment in path {
        match current.get(segment) {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Recursive last-wins-per-leaf merge: object keys merge key-by-key; any
/// other value (including an array) simply overwrites whatever was there.
fn deep_merge(target: &mut Value, incoming: &Value) {
    match (target.as_object_mut(), incoming.as_object()) {
        (Some(target_map), Some(incoming_map)) => {
            for (key, value) in incoming_map {
                let slot = target_map.entry(key.clone()).or_insert(Value::Null);
                deep_merge(slot, value);
            }
        }
        _ => {
            *target = incoming.clone();
        }
    }
}

pub async fn run_migrations(sync: &MqttSync, items: &[MigrationDescriptor]) -> Result<(), Error> {
    for item in items {
        run_one(sync, item).await?;
    }
    Ok(())
}

async fn run_one(sync: &MqttSync, item: &MigrationDescriptor) -> Result<(), Error> {
    let full_path = topic_to_path(&item.topic);
    let Some(version_index) = full_path.iter().rposition(|seg| is_wildcard_segment(seg)) else {
        return Err(Error::invalid_path(format!(
            "migration topic {} has no version wildcard",
            item.topic
        )));
    };
    let suffix: Path = full_path[version_index + 1..].to_vec();

    if let Err(err) = sync.subscribe(&item.topic).await {
        log::warn!("migration subscribe denied for {}: {}", item.topic, err);
        return Ok(());
    }
    sync.wait_for_heartbeat_once().await?;

    let new_version = parse_version_lenient(&item.new_version);

    let mut by_prefix: BTreeMap<Path, Vec<(semver::Version, Value)>> = BTreeMap::new();
    let mut selector = full_path.clone();
    selector.push("#".to_string());
    for (topic, value) in sync.filter(&selector) {
        let path = topic_to_path(&topic);
        if path.len() <= version_index {
            continue;
        }
        let prefix = path[..version_index].to_vec();
        let version = parse_version_lenient(&path[version_index]);
        if version > new_version {
            continue;
        }
        by_prefix.entry(prefix).or_default().push((version, value));
    }

    let mut cleared: BTreeSet<(Path, String)> = BTreeSet::new();

    for (prefix, mut entries) in by_prefix {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut merged = Value::Object(serde_json::Map::new());
        for (version, value) in &entries {
            if *version != new_version {
                cleared.insert((prefix.clone(), version.to_string()));
            }
            let slot = navigate_create(&mut merged, &suffix);
            deep_merge(slot, value);
        }

        let mut extracted = get_path_value(&merged, &suffix);
        if let Some(transform) = &item.transform {
            extracted = transform(extracted);
        }

        let mut grounded = prefix;
        grounded.push(item.new_version.clone());
        grounded.extend(suffix.clone());
        let grounded_topic = path_to_topic(&grounded);

        if item.flat {
            for (leaf_suffix, leaf) in crate::flatten::to_flat_object(&extracted) {
                let topic = format!("{}{}", grounded_topic, leaf_suffix);
                sync.enqueue_publish(topic, Some(leaf)).await?;
            }
        } else {
            publish_at_level(sync, &grounded_topic, extracted, item.level).await?;
        }
    }

    sync.unsubscribe(&item.topic).await?;
    sync.wait_for_heartbeat_once().await?;

    let prefixes_to_clear: Vec<String> = cleared
        .into_iter()
        .map(|(prefix, old_version)| {
            let mut path = prefix;
            path.push(old_version);
            path.extend(suffix.clone());
            path_to_topic(&path)
        })
        .collect();
    if !prefixes_to_clear.is_empty() {
        sync.clear(&prefixes_to_clear).await?;
    }

    Ok(())
}

fn publish_at_level<'a>(
    sync: &'a MqttSync,
    topic: &'a str,
    value: Value,
    level: usize,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>> {
    Box::pin(async move {
        if level == 0 {
            sync.enqueue_publish(topic.to_string(), Some(value)).await?;
            return Ok(());
        }
        match value.as_object() {
            Some(map) if !map.is_empty() => {
                for (key, child) in map.clone() {
                    let child_topic = format!("{}/{}", topic, encode_segment(&key));
                    publish_at_level(sync, &child_topic, child, level - 1).await?;
                }
                Ok(())
            }
            _ => sync.enqueue_publish(topic.to_string(), Some(value)).await,
        }
    })
}
