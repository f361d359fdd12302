// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Match a selector path against a concrete path, producing either a
//! mapping of named wildcards to matched segments or no match at all.
//!
//! Generalizes the teacher's `Topic::is_match` (`src/topic.rs`), which only
//! ever answered yes/no, into one that also collects `+NAME` bindings.

use std::collections::BTreeMap;

use crate::topic::SelectorSegment;
use crate::types::Path;

/// Named-wildcard bindings produced by a successful match. An empty map
/// still signals success if the selector had no named wildcards.
pub type Bindings = BTreeMap<String, String>;

/// Segment-by-segment match of `selector` against `topic`. `#` at the tail
/// matches any remaining segments (including zero). `+`/`*` consume exactly
/// one segment; `+NAME` additionally binds it. Returns `None` on mismatch.
pub fn match_path(selector: &Path, topic: &Path) -> Option<Bindings> {
    let mut bindings = Bindings::new();
    let mut topic_iter = topic.iter();

    for (index, raw_segment) in selector.iter().enumerate() {
        match SelectorSegment::parse(raw_segment) {
            SelectorSegment::MultiWildcard => {
                if index != selector.len() - 1 {
                    // Illegal selector (# not last); treat as no match
                    // rather than panicking on a malformed registration.
                    return None;
                }
                return Some(bindings);
            }
            SelectorSegment::SingleWildcard | SelectorSegment::Star => {
                topic_iter.next()?;
            }
            SelectorSegment::NamedWildcard(name) => {
                let segment = topic_iter.next()?;
                bindings.insert(name, segment.clone());
            }
            SelectorSegment::Literal(literal) => {
                let segment = topic_iter.next()?;
                if segment != &literal {
                    return None;
                }
            }
        }
    }

    // No trailing `#`: the topic must be fully consumed too.
    if topic_iter.next().is_some() {
        return None;
    }

    Some(bindings)
}

/// Convenience wrapper matching wire-form strings.
pub fn match_topic(selector: &str, topic: &str) -> Option<Bindings> {
    let selector_path = crate::topic::topic_to_path(selector);
    let topic_path = crate::topic::topic_to_path(topic);
    match_path(&selector_path, &topic_path)
}

/// `true` iff `parent`'s path is a proper prefix of `sub`'s path, i.e. `sub`
/// lives strictly below `parent`.
pub fn is_sub_topic_of(sub: &Path, parent: &Path) -> bool {
    parent.len() < sub.len() && sub[..parent.len()] == parent[..]
}
