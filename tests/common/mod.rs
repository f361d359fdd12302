// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! In-process stand-in for the broker collaborator (§6): a single
//! `SharedBroker` fans retained publishes out to every attached
//! `MqttSync` peer and replays matching retained messages on subscribe
//! (RAP), the same way a real MQTT broker would for these tests' purposes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use mqtt_sync::client::MqttClient;
use mqtt_sync::error::{Error, ErrorKind};
use mqtt_sync::matcher::match_topic;
use mqtt_sync::sync::MqttSync;

#[derive(Default)]
pub struct SharedBroker {
    connected: Mutex<bool>,
    published: Mutex<Vec<(String, Vec<u8>, bool, u8)>>,
    retained: Mutex<HashMap<String, Vec<u8>>>,
    peers: Mutex<Vec<MqttSync>>,
}

impl SharedBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(SharedBroker {
            connected: Mutex::new(true),
            ..Default::default()
        })
    }

    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock().unwrap() = connected;
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>, bool, u8)> {
        self.published.lock().unwrap().clone()
    }

    pub fn retained_topics(&self) -> HashSet<String> {
        self.retained.lock().unwrap().keys().cloned().collect()
    }
}

/// One client connection to a [`SharedBroker`]. `attach` wires it up to the
/// [`MqttSync`] instance it serves once that instance exists (chicken/egg:
/// the client is needed to spawn the core, but inbound delivery needs the
/// core's handle).
pub struct PeerClient {
    shared: Arc<SharedBroker>,
    me: OnceLock<MqttSync>,
    deny_subscribe: Mutex<HashSet<String>>,
}

impl PeerClient {
    pub fn new(shared: Arc<SharedBroker>) -> Arc<Self> {
        Arc::new(PeerClient {
            shared,
            me: OnceLock::new(),
            deny_subscribe: Mutex::new(HashSet::new()),
        })
    }

    pub fn attach(self: &Arc<Self>, sync: MqttSync) {
        let _ = self.me.set(sync.clone());
        self.shared.peers.lock().unwrap().push(sync);
    }

    pub fn deny_next_subscribe(&self, topic: &str) {
        self.deny_subscribe.lock().unwrap().insert(topic.to_string());
    }
}

#[async_trait::async_trait]
impl MqttClient for PeerClient {
    fn is_connected(&self) -> bool {
        *self.shared.connected.lock().unwrap()
    }

    async fn subscribe(&self, topic: &str, _qos: u8) -> Result<(), Error> {
        if self.deny_subscribe.lock().unwrap().remove(topic) {
            return Err(Error::subscribe_denied(topic));
        }
        let matches: Vec<(String, Vec<u8>)> = self
            .shared
            .retained
            .lock()
            .unwrap()
            .iter()
            .filter(|(stored_topic, _)| match_topic(topic, stored_topic).is_some())
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();
        if let Some(me) = self.me.get() {
            for (stored_topic, payload) in matches {
                me.deliver_message(stored_topic, payload, true).await;
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool, qos: u8) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::new(ErrorKind::PublishWhileDisconnected, "disconnected"));
        }
        self.shared
            .published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone(), retain, qos));
        if retain {
            let mut retained = self.shared.retained.lock().unwrap();
            if payload.is_empty() {
                retained.remove(topic);
            } else {
                retained.insert(topic.to_string(), payload.clone());
            }
        }
        let peers = self.shared.peers.lock().unwrap().clone();
        for peer in peers {
            peer.deliver_message(topic.to_string(), payload.clone(), retain).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, _topic: &str) -> Result<(), Error> {
        Ok(())
    }
}

/// Spawn an [`MqttSync`] wired to `shared`, returning it along with the
/// client it was spawned with (so tests can flip `set_connected`/assert on
/// `published()` or deny a subscribe before it happens).
pub fn spawn_peer(shared: &Arc<SharedBroker>, config: mqtt_sync::SyncConfig) -> (MqttSync, Arc<PeerClient>) {
    let client = PeerClient::new(shared.clone());
    let sync = MqttSync::spawn(client.clone(), config);
    client.attach(sync.clone());
    (sync, client)
}

/// Publish a heartbeat tick to every peer on `shared` directly, bypassing
/// the broker's own retained-message machinery (the heartbeat topic is
/// handled specially by [`MqttSync`] and never reaches application code).
pub async fn tick_heartbeat(shared: &Arc<SharedBroker>, heartbeat_topic: &str) {
    let peers = shared.peers.lock().unwrap().clone();
    for peer in peers {
        peer.deliver_message(heartbeat_topic.to_string(), b"1".to_vec(), true)
            .await;
    }
}
