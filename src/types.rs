// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::BTreeMap;

use serde_json::Value;

/// An ordered sequence of segment strings; the empty segment never appears
/// except transiently while parsing a leading slash off the wire.
pub type Path = Vec<String>;

/// Opaque mapping threaded from writer to listener. The reserved key
/// `external` marks updates that originated from an inbound broker message.
pub type Tags = BTreeMap<String, Value>;

/// Reserved tag key: marks a cache write as having come from the broker
/// rather than from local application code. Publisher logic ignores writes
/// carrying this tag to avoid echoing its own retained state back out.
pub const EXTERNAL_TAG: &str = "external";

/// Reserved sentinel segment appended to every key stored in the
/// `publishedMessages` mirror, so a value at `/a` and a value at `/a/b` can
/// coexist without one clobbering the other's storage slot.
pub const SENTINEL: &str = "$_";

pub fn tags_external() -> Tags {
    let mut tags = Tags::new();
    tags.insert(EXTERNAL_TAG.to_string(), Value::Bool(true));
    tags
}

pub fn is_external(tags: &Tags) -> bool {
    matches!(tags.get(EXTERNAL_TAG), Some(Value::Bool(true)))
}
