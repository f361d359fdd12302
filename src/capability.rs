// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The source models a device capability as a subclass of the sync core
//! (`Capability extends MqttSync`). Rust has no implementation inheritance,
//! so this is composition instead: identity fields alongside a plain
//! [`MqttSync`] handle, with `Deref` to keep call sites unchanged.

use std::ops::Deref;

use crate::sync::MqttSync;

/// A named, versioned capability scoped under a device, wrapping one
/// [`MqttSync`] instance. `scope`/`name`/`version` are identity metadata the
/// capability's owner uses to build its own topic prefixes; this type does
/// not interpret them itself.
#[derive(Clone)]
pub struct Capability {
    pub scope: String,
    pub name: String,
    pub version: String,
    sync: MqttSync,
}

impl Capability {
    pub fn new(scope: impl Into<String>, name: impl Into<String>, version: impl Into<String>, sync: MqttSync) -> Self {
        Capability {
            scope: scope.into(),
            name: name.into(),
            version: version.into(),
            sync,
        }
    }

    pub fn sync(&self) -> &MqttSync {
        &self.sync
    }
}

impl Deref for Capability {
    type Target = MqttSync;

    fn deref(&self) -> &Self::Target {
        &self.sync
    }
}
