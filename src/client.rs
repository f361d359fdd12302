// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The broker collaborator contract (§6): a thin trait the embedder
//! implements over its own MQTT connection. Generalizes the teacher's
//! `AsyncClient`, which wrapped a single concrete `codec`-based wire
//! connection, into an abstraction the sync core is generic over instead of
//! owning.
//!
//! Subscribe is always issued with "receive retained after subscribe"
//! semantics; that is a property of every call here, not a parameter, since
//! this crate never subscribes any other way.

use crate::error::Error;

/// A single inbound broker delivery, handed to [`crate::sync::MqttSync`] by
/// whatever glue code the embedder writes between its client's message event
/// and this crate. Not part of the `MqttClient` trait itself: the core pulls
/// these from a channel rather than the trait pushing them, so the trait
/// stays free of callback registration machinery.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// External collaborator providing subscribe/publish/unsubscribe and a
/// connected flag. QoS follows the broker client's own numbering (0/1/2);
/// a subscribe grant of QoS >= 128 is a denial and must be surfaced as
/// `Err`, not as `Ok` carrying a sentinel value.
///
/// `#[async_trait]` gives every method's future a `Send` bound, which a bare
/// `async fn` in a trait cannot express; without it `SyncEngine`/`QueueEngine`
/// cannot `tokio::spawn` a generic `C: MqttClient`'s futures across threads.
#[async_trait::async_trait]
pub trait MqttClient: Send + Sync + 'static {
    /// Current connection state, queried synchronously.
    fn is_connected(&self) -> bool;

    /// Subscribe `topic` (already normalized, already wildcard-escaped) with
    /// RAP semantics. `Err` means the broker denied the grant.
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<(), Error>;

    /// Publish `payload` to `topic`. An empty `payload` is the wire encoding
    /// of a `null` leaf (clears a retained message when `retain` is set).
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: u8,
    ) -> Result<(), Error>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), Error>;
}
