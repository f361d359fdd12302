// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Deserializable settings, mirroring the teacher's `Config`/`General`
//! section style: one struct per concern, `#[serde(default = "...")]` on
//! every field. Closures (callbacks, migration transforms) cannot come from
//! a config file, so this is the data-only half of [`crate::sync::SyncConfig`];
//! [`SyncSettings::into_sync_config`] builds the runtime value, and the
//! embedder attaches callbacks and transforms afterward.

use serde::Deserialize;

use crate::migrate::MigrationDescriptor;
use crate::sync::SyncConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct SyncSettings {
    /// Process every inbound message as if retained.
    ///
    /// Default is false.
    #[serde(default)]
    pub ignore_retain: bool,

    /// Drop the first N segments of every inbound topic before processing.
    ///
    /// Default is 0.
    #[serde(default)]
    pub slice_topic: usize,

    /// Heartbeat topic used to gate ordering of reconciliation steps.
    ///
    /// Default is `$SYS/broker/uptime`.
    #[serde(default = "SyncSettings::default_heartbeat_topic")]
    pub heartbeat_topic: String,

    /// Bound on the command channel feeding the sync engine and the
    /// publication queue.
    ///
    /// Default is 64.
    #[serde(default = "SyncSettings::default_channel_capacity")]
    pub channel_capacity: usize,

    /// Version migrations to run at startup, gating `onReady`.
    ///
    /// Default is empty.
    #[serde(default)]
    pub migrate: Vec<MigrationSettings>,
}

impl SyncSettings {
    fn default_heartbeat_topic() -> String {
        "$SYS/broker/uptime".to_string()
    }

    fn default_channel_capacity() -> usize {
        64
    }

    /// Build the runtime [`SyncConfig`]. Callbacks default to `None`; set
    /// them on the returned value before passing it to `MqttSync::spawn`.
    pub fn into_sync_config(self) -> SyncConfig {
        SyncConfig {
            ignore_retain: self.ignore_retain,
            slice_topic: self.slice_topic,
            heartbeat_topic: self.heartbeat_topic,
            channel_capacity: self.channel_capacity,
            migrate: self.migrate.into_iter().map(MigrationSettings::into_descriptor).collect(),
            on_change: None,
            on_ready: None,
            on_heartbeat_granted: None,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            ignore_retain: false,
            slice_topic: 0,
            heartbeat_topic: Self::default_heartbeat_topic(),
            channel_capacity: Self::default_channel_capacity(),
            migrate: Vec::new(),
        }
    }
}

/// Data-only counterpart of [`MigrationDescriptor`]; `transform` is never
/// deserialized, only attached in code via [`MigrationSettings::into_descriptor`]
/// callers that need one should build a [`MigrationDescriptor`] directly instead.
#[derive(Debug, Deserialize, Clone)]
pub struct MigrationSettings {
    pub topic: String,
    pub new_version: String,

    #[serde(default)]
    pub flat: bool,

    #[serde(default)]
    pub level: usize,
}

impl MigrationSettings {
    pub fn into_descriptor(self) -> MigrationDescriptor {
        MigrationDescriptor {
            topic: self.topic,
            new_version: self.new_version,
            transform: None,
            flat: self.flat,
            level: self.level,
        }
    }
}
