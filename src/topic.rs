// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Bidirectional conversion between slash-delimited MQTT topics and path
//! arrays, plus the selector wildcard grammar (`+`, `+name`, `*`, `#`).

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::types::Path;

// `%` and `/` are the only two bytes the wire form needs to escape; encoding
// anything else would make topics that are already legal MQTT segments fail
// to round-trip through `pathToTopic(topicToPath(_))`.
const SEGMENT_ESCAPE: &AsciiSet = &CONTROLS.add(b'%').add(b'/');

/// Percent-escape `%` then `/` in a single path segment (order matters: `/`
/// must not be turned into `%2F` and then have that `%` re-escaped).
pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT_ESCAPE).to_string()
}

/// Inverse of [`encode_segment`].
pub fn decode_segment(segment: &str) -> String {
    percent_decode_str(segment)
        .decode_utf8_lossy()
        .into_owned()
}

/// One segment of a selector path: either a concrete segment or one of the
/// wildcard forms legal only in selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorSegment {
    /// A literal segment to match exactly.
    Literal(String),
    /// `+` — matches exactly one segment, unnamed.
    SingleWildcard,
    /// `+NAME` (length >= 2) — matches one segment, binds it to `NAME`.
    NamedWildcard(String),
    /// `*` — matches exactly one segment, unnamed; distinct grammar from
    /// `+` but equivalent matching behavior. Never collapsed to `+` on the
    /// wire, unlike `+NAME`.
    Star,
    /// `#` — matches zero or more trailing segments. Legal only as the last
    /// segment of a selector.
    MultiWildcard,
}

impl SelectorSegment {
    pub fn parse(segment: &str) -> Self {
        if segment == "+" {
            SelectorSegment::SingleWildcard
        } else if segment == "*" {
            SelectorSegment::Star
        } else if segment == "#" {
            SelectorSegment::MultiWildcard
        } else if segment.len() >= 2 && segment.starts_with('+') {
            SelectorSegment::NamedWildcard(segment[1..].to_string())
        } else {
            SelectorSegment::Literal(segment.to_string())
        }
    }
}

/// Convert a path of concrete segments into wire-form topic: leading slash,
/// each segment percent-escaped, joined by `/`.
pub fn path_to_topic(path: &Path) -> String {
    let mut topic = String::with_capacity(path.len() * 8 + 1);
    for segment in path {
        topic.push('/');
        // `+NAME` selector segments never appear on the wire; emit a bare
        // `+` for them so a selector path can be fed straight to the broker
        // client's subscribe() call.
        match SelectorSegment::parse(segment) {
            SelectorSegment::NamedWildcard(_) => topic.push('+'),
            _ => topic.push_str(&encode_segment(segment)),
        }
    }
    topic
}

/// Convert a wire-form topic into a path of concrete segments: strip the
/// leading slash, strip a trailing slash, percent-decode each segment.
/// Does not interpret `+`/`#` specially — those are selector grammar, not
/// topic grammar; a literal `+` segment on an inbound concrete topic decodes
/// to the single-character string `"+"`.
pub fn topic_to_path(topic: &str) -> Path {
    let trimmed = topic.strip_prefix('/').unwrap_or(topic);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('/').map(decode_segment).collect()
}

/// Normalize a selector to end in `/#` (append it if the caller did not),
/// matching the subscribe/publish registry key convention in spec.md §3.
pub fn normalize_selector(selector: &str) -> String {
    if selector.ends_with("/#") || selector == "#" {
        selector.to_string()
    } else {
        format!("{}/#", selector.trim_end_matches('/'))
    }
}
