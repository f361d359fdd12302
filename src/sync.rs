// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Orchestration core: owns the subscribed/published selector registries,
//! classifies inbound broker messages, drives the heartbeat-gated readiness
//! chain, and forwards local cache writes to the [`crate::queue`].
//!
//! Shaped like the teacher's listener/dispatcher pair (`src/dispatcher.rs`,
//! `src/server_context.rs`): one task owns all mutable state behind an
//! `mpsc` channel of commands; everything else, including inbound broker
//! messages, is just another command variant sent into that same channel so
//! ordering across command kinds is a single FIFO rather than a race between
//! two.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::cache::Cache;
use crate::client::{InboundMessage, MqttClient};
use crate::error::Error;
use crate::flatten::to_flat_object;
use crate::matcher::match_path;
use crate::migrate::MigrationDescriptor;
use crate::queue::PublicationQueue;
use crate::rpc::{RpcHandler, RpcRequestEnvelope, RpcResponseEnvelope};
use crate::topic::{normalize_selector, path_to_topic, topic_to_path};
use crate::types::{is_external, tags_external, Path, Tags, SENTINEL};

/// Runtime construction options. Unlike [`crate::config::SyncSettings`] this
/// carries callbacks, so it is assembled in code rather than deserialized.
pub struct SyncConfig {
    pub ignore_retain: bool,
    pub slice_topic: usize,
    pub heartbeat_topic: String,
    pub channel_capacity: usize,
    pub migrate: Vec<MigrationDescriptor>,
    pub on_change: Option<Arc<dyn Fn(&crate::cache::FlatChanges) + Send + Sync>>,
    pub on_ready: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_heartbeat_granted: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            ignore_retain: false,
            slice_topic: 0,
            heartbeat_topic: "$SYS/broker/uptime".to_string(),
            channel_capacity: 64,
            migrate: Vec::new(),
            on_change: None,
            on_ready: None,
            on_heartbeat_granted: None,
        }
    }
}

#[derive(Debug, Clone)]
struct PublishedSelector {
    selector: Path,
    grounded_len: usize,
    atomic: bool,
}

struct PendingClear {
    selectors: Vec<String>,
    filter: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    reply: oneshot::Sender<Result<usize, Error>>,
}

pub enum SyncCommand {
    Inbound(InboundMessage),
    CacheChanged(Path),
    Subscribe {
        selector: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Publish {
        selector: String,
        atomic: bool,
        reply: oneshot::Sender<Result<bool, Error>>,
    },
    Unsubscribe {
        selector: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Clear {
        prefixes: Vec<String>,
        filter: Arc<dyn Fn(&str) -> bool + Send + Sync>,
        reply: oneshot::Sender<Result<usize, Error>>,
    },
    FinishClear(u64),
    WaitForHeartbeatOnce(oneshot::Sender<()>),
    BeforeDisconnect(oneshot::Sender<()>),
    OnBeforeDisconnect(Arc<dyn Fn() + Send + Sync>),
    Migrate {
        items: Vec<MigrationDescriptor>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    RegisterRpcHandler {
        command: String,
        handler: RpcHandler,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    RegisterRpcCallback {
        topic: String,
        reply_tx: oneshot::Sender<Value>,
        ack: oneshot::Sender<Result<(), Error>>,
    },
    DropRpcCallback(String),
    PublishRaw {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
        qos: u8,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    SubscribeRaw {
        topic: String,
        qos: u8,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    UnsubscribeRaw {
        topic: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    EnqueuePublish {
        topic: String,
        value: Option<Value>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

/// Cloneable handle to a running [`SyncEngine`]. Cache reads/subscriptions
/// go straight through the shared [`Cache`]; everything with broker-side
/// effect is serialized through the engine's command channel.
#[derive(Clone)]
pub struct MqttSync {
    tx: mpsc::Sender<SyncCommand>,
    cache: Cache,
}

impl MqttSync {
    pub fn spawn<C: MqttClient>(client: Arc<C>, config: SyncConfig) -> Self {
        let cache = Cache::new();
        let published = Cache::new();
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let queue = PublicationQueue::spawn(client.clone(), published.clone(), config.channel_capacity);
        let engine = SyncEngine {
            client,
            cache: cache.clone(),
            published,
            queue,
            rx,
            tx: tx.clone(),
            config,
            subscribed_paths: HashSet::new(),
            published_selectors: Vec::new(),
            cache_subscribed_selectors: HashSet::new(),
            received_topics: HashSet::new(),
            heartbeat_waiters: Vec::new(),
            heartbeat_count: 0,
            rpc_request_handlers: HashMap::new(),
            rpc_response_callbacks: HashMap::new(),
            before_disconnect_hooks: Vec::new(),
            pending_clears: HashMap::new(),
            next_clear_id: 0,
        };
        tokio::spawn(engine.run_loop());
        MqttSync { tx, cache }
    }

    /// Feed one broker message into the core. The embedder's own client
    /// "message" event handler should call this for every delivery,
    /// subscribed or not.
    pub async fn deliver_message(&self, topic: impl Into<String>, payload: Vec<u8>, retain: bool) {
        let _ = self
            .tx
            .send(SyncCommand::Inbound(InboundMessage {
                topic: topic.into(),
                payload,
                retain,
            }))
            .await;
    }

    // -- DataCache passthrough: local, untagged writes and reads. --

    pub fn update(&self, path: &Path, value: Value) -> crate::cache::FlatChanges {
        self.cache.update(path, value, &Tags::new())
    }

    pub fn update_topic(&self, topic: &str, value: Value) -> crate::cache::FlatChanges {
        self.update(&topic_to_path(topic), value)
    }

    pub fn get(&self, path: &Path) -> Option<Value> {
        self.cache.get(path)
    }

    pub fn get_by_topic(&self, topic: &str) -> Option<Value> {
        self.cache.get_by_topic(topic)
    }

    pub fn filter(&self, selector: &Path) -> std::collections::BTreeMap<String, Value> {
        self.cache.filter(selector)
    }

    pub fn filter_by_topic(&self, selector: &str) -> std::collections::BTreeMap<String, Value> {
        self.cache.filter_by_topic(selector)
    }

    pub fn for_match(&self, selector: &Path, cb: impl FnMut(&Value, &str, &crate::matcher::Bindings)) {
        self.cache.for_match(selector, cb)
    }

    pub fn for_path_match(&self, selector: &str, cb: impl FnMut(&Value, &str, &crate::matcher::Bindings)) {
        self.cache.for_path_match(selector, cb)
    }

    pub fn subscribe_path(
        &self,
        selector: &Path,
        callback: impl Fn(&Value, &str, &crate::matcher::Bindings, &Tags) + Send + Sync + 'static,
    ) {
        self.cache.subscribe_path(selector, callback)
    }

    pub fn subscribe_path_flat(
        &self,
        selector: &Path,
        callback: impl Fn(&Value, &str, &crate::matcher::Bindings, &Tags) + Send + Sync + 'static,
    ) {
        self.cache.subscribe_path_flat(selector, callback)
    }

    // -- Broker-facing operations, serialized through the engine. --

    pub async fn subscribe(&self, selector: &str) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::Subscribe {
                selector: selector.to_string(),
                reply,
            })
            .await?;
        rx.await?
    }

    /// Returns `false` without doing anything if an identical `(selector,
    /// atomic)` registration already exists.
    pub async fn publish(&self, selector: &str, atomic: bool) -> Result<bool, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::Publish {
                selector: selector.to_string(),
                atomic,
                reply,
            })
            .await?;
        rx.await?
    }

    pub async fn unsubscribe(&self, selector: &str) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::Unsubscribe {
                selector: selector.to_string(),
                reply,
            })
            .await?;
        rx.await?
    }

    pub async fn clear(&self, prefixes: &[String]) -> Result<usize, Error> {
        self.clear_filtered(prefixes, |_| true).await
    }

    pub async fn clear_filtered(
        &self,
        prefixes: &[String],
        filter: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Result<usize, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::Clear {
                prefixes: prefixes.to_vec(),
                filter: Arc::new(filter),
                reply,
            })
            .await?;
        rx.await?
    }

    pub async fn wait_for_heartbeat_once(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SyncCommand::WaitForHeartbeatOnce(reply)).await?;
        rx.await?;
        Ok(())
    }

    pub async fn on_before_disconnect(&self, hook: impl Fn() + Send + Sync + 'static) -> Result<(), Error> {
        self.tx
            .send(SyncCommand::OnBeforeDisconnect(Arc::new(hook)))
            .await?;
        Ok(())
    }

    /// Run all registered before-disconnect hooks in registration order.
    /// The embedder calls this when its broker connection is about to drop.
    pub async fn before_disconnect(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SyncCommand::BeforeDisconnect(reply)).await?;
        rx.await?;
        Ok(())
    }

    /// Run `items` as an ad hoc migration (outside the startup `migrate`
    /// config list). Resolves once every item has completed.
    pub async fn migrate(&self, items: Vec<MigrationDescriptor>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SyncCommand::Migrate { items, reply }).await?;
        rx.await?
    }

    pub(crate) async fn publish_raw(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: u8,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::PublishRaw {
                topic: topic.to_string(),
                payload,
                retain,
                qos,
                reply,
            })
            .await?;
        rx.await?
    }

    pub(crate) async fn subscribe_raw(&self, topic: &str, qos: u8) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::SubscribeRaw {
                topic: topic.to_string(),
                qos,
                reply,
            })
            .await?;
        rx.await?
    }

    pub(crate) async fn unsubscribe_raw(&self, topic: &str) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::UnsubscribeRaw {
                topic: topic.to_string(),
                reply,
            })
            .await?;
        rx.await?
    }

    /// Enqueue a retained write directly, bypassing the selector-based
    /// atomic/flat bookkeeping. Used by the migrator, which already knows
    /// exactly which concrete topics to write.
    pub(crate) async fn enqueue_publish(&self, topic: String, value: Option<Value>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::EnqueuePublish { topic, value, reply })
            .await?;
        rx.await?
    }

    pub(crate) async fn register_rpc_handler(&self, command: &str, handler: RpcHandler) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::RegisterRpcHandler {
                command: command.to_string(),
                handler,
                reply,
            })
            .await?;
        rx.await?
    }

    pub(crate) async fn register_rpc_callback(&self, topic: String) -> Result<oneshot::Receiver<Value>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(SyncCommand::RegisterRpcCallback {
                topic,
                reply_tx,
                ack,
            })
            .await?;
        ack_rx.await??;
        Ok(reply_rx)
    }

    pub(crate) async fn drop_rpc_callback(&self, topic: String) {
        let _ = self.tx.send(SyncCommand::DropRpcCallback(topic)).await;
    }
}

struct SyncEngine<C: MqttClient> {
    client: Arc<C>,
    cache: Cache,
    published: Cache,
    queue: PublicationQueue,
    rx: mpsc::Receiver<SyncCommand>,
    tx: mpsc::Sender<SyncCommand>,
    config: SyncConfig,
    subscribed_paths: HashSet<String>,
    published_selectors: Vec<PublishedSelector>,
    cache_subscribed_selectors: HashSet<String>,
    received_topics: HashSet<String>,
    heartbeat_waiters: Vec<oneshot::Sender<()>>,
    heartbeat_count: u64,
    rpc_request_handlers: HashMap<String, RpcHandler>,
    rpc_response_callbacks: HashMap<String, oneshot::Sender<Value>>,
    before_disconnect_hooks: Vec<Arc<dyn Fn() + Send + Sync>>,
    pending_clears: HashMap<u64, PendingClear>,
    next_clear_id: u64,
}

impl<C: MqttClient> SyncEngine<C> {
    async fn run_loop(mut self) {
        self.boot().await;
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd).await;
        }
    }

    async fn boot(&mut self) {
        let heartbeat_topic = self.config.heartbeat_topic.clone();
        match self.client.subscribe(&heartbeat_topic, 1).await {
            Ok(()) => {
                self.subscribed_paths.insert(heartbeat_topic);
                if let Some(cb) = &self.config.on_heartbeat_granted {
                    cb();
                }
                self.spawn_ready_chain();
            }
            Err(err) => {
                log::warn!("heartbeat subscribe denied: {}", err);
            }
        }
    }

    fn spawn_ready_chain(&mut self) {
        let handle = MqttSync {
            tx: self.tx.clone(),
            cache: self.cache.clone(),
        };
        let migrate_items = self.config.migrate.clone();
        let on_ready = self.config.on_ready.clone();
        tokio::spawn(async move {
            // Gating point: the second heartbeat (the first never wakes a waiter).
            let _ = handle.wait_for_heartbeat_once().await;
            if !migrate_items.is_empty() {
                if let Err(err) = crate::migrate::run_migrations(&handle, &migrate_items).await {
                    log::warn!("startup migration failed: {}", err);
                }
            }
            // One additional heartbeat after the gating point.
            let _ = handle.wait_for_heartbeat_once().await;
            if let Some(cb) = on_ready {
                cb();
            }
        });
    }

    async fn handle(&mut self, cmd: SyncCommand) {
        match cmd {
            SyncCommand::Inbound(msg) => self.handle_inbound(msg).await,
            SyncCommand::CacheChanged(path) => self.handle_cache_changed(path).await,
            SyncCommand::Subscribe { selector, reply } => {
                let _ = reply.send(self.do_subscribe(&selector).await);
            }
            SyncCommand::Publish {
                selector,
                atomic,
                reply,
            } => {
                let _ = reply.send(self.do_publish(&selector, atomic).await);
            }
            SyncCommand::Unsubscribe { selector, reply } => {
                let _ = reply.send(self.do_unsubscribe(&selector).await);
            }
            SyncCommand::Clear {
                prefixes,
                filter,
                reply,
            } => self.begin_clear(prefixes, filter, reply).await,
            SyncCommand::FinishClear(id) => self.finish_clear(id).await,
            SyncCommand::WaitForHeartbeatOnce(reply) => self.heartbeat_waiters.push(reply),
            SyncCommand::BeforeDisconnect(reply) => {
                for hook in &self.before_disconnect_hooks {
                    hook();
                }
                let _ = reply.send(());
            }
            SyncCommand::OnBeforeDisconnect(hook) => self.before_disconnect_hooks.push(hook),
            SyncCommand::Migrate { items, reply } => {
                let handle = MqttSync {
                    tx: self.tx.clone(),
                    cache: self.cache.clone(),
                };
                tokio::spawn(async move {
                    let result = crate::migrate::run_migrations(&handle, &items).await;
                    let _ = reply.send(result);
                });
            }
            SyncCommand::RegisterRpcHandler {
                command,
                handler,
                reply,
            } => {
                let _ = reply.send(self.do_register_rpc(&command, handler).await);
            }
            SyncCommand::RegisterRpcCallback {
                topic,
                reply_tx,
                ack,
            } => {
                let _ = ack.send(self.do_register_rpc_callback(topic, reply_tx).await);
            }
            SyncCommand::DropRpcCallback(topic) => {
                self.rpc_response_callbacks.remove(&topic);
                let _ = self.client.unsubscribe(&topic).await;
                self.subscribed_paths.remove(&topic);
            }
            SyncCommand::PublishRaw {
                topic,
                payload,
                retain,
                qos,
                reply,
            } => {
                let _ = reply.send(self.client.publish(&topic, payload, retain, qos).await);
            }
            SyncCommand::SubscribeRaw { topic, qos, reply } => {
                let result = self.client.subscribe(&topic, qos).await;
                if result.is_ok() {
                    self.subscribed_paths.insert(topic);
                }
                let _ = reply.send(result);
            }
            SyncCommand::UnsubscribeRaw { topic, reply } => {
                let result = self.client.unsubscribe(&topic).await;
                self.subscribed_paths.remove(&topic);
                let _ = reply.send(result);
            }
            SyncCommand::EnqueuePublish { topic, value, reply } => {
                let _ = reply.send(self.queue.enqueue(topic, value).await);
            }
        }
    }

    async fn handle_inbound(&mut self, msg: InboundMessage) {
        if msg.topic == self.config.heartbeat_topic {
            self.handle_heartbeat();
            return;
        }

        self.received_topics.insert(msg.topic.clone());

        let mut logical_path = topic_to_path(&msg.topic);
        if self.config.slice_topic > 0 {
            logical_path = logical_path
                .into_iter()
                .skip(self.config.slice_topic)
                .collect();
        }
        let logical_topic = path_to_topic(&logical_path);

        if let Some(handler) = self.rpc_request_handlers.get(&logical_topic).cloned() {
            self.dispatch_rpc_request(logical_topic, msg.payload, handler);
            return;
        }
        if self.rpc_response_callbacks.contains_key(&logical_topic) {
            self.dispatch_rpc_response(logical_topic, msg.payload).await;
            return;
        }

        if !(msg.retain || self.config.ignore_retain) {
            return;
        }

        let value = match std::str::from_utf8(&msg.payload) {
            Ok("") => Value::Null,
            Ok(text) => serde_json::from_str(text).unwrap_or(Value::Null),
            Err(_) => {
                log::debug!("non-UTF8 payload on {}, ignoring", logical_topic);
                return;
            }
        };

        if self.find_matching_non_atomic_publish(&logical_path) {
            let mut mirror_path = logical_path.clone();
            mirror_path.push(SENTINEL.to_string());
            self.published.update(&mirror_path, value.clone(), &Tags::new());
            self.cache.update(&logical_path, value, &tags_external());
            return;
        }

        if self.has_matching_subscription(&logical_path) {
            let changes = self.cache.update(&logical_path, value, &tags_external());
            if !changes.is_empty() {
                if let Some(cb) = &self.config.on_change {
                    cb(&changes);
                }
            }
        }
    }

    fn handle_heartbeat(&mut self) {
        self.heartbeat_count += 1;
        if self.heartbeat_count > 1 {
            for waiter in self.heartbeat_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn has_matching_subscription(&self, path: &Path) -> bool {
        self.subscribed_paths
            .iter()
            .any(|sel| match_path(&topic_to_path(sel), path).is_some())
    }

    fn find_matching_non_atomic_publish(&self, path: &Path) -> bool {
        self.published_selectors
            .iter()
            .any(|p| !p.atomic && match_path(&p.selector, path).is_some())
    }

    async fn do_subscribe(&mut self, selector: &str) -> Result<(), Error> {
        let normalized = normalize_selector(selector);
        if self.subscribed_paths.contains(&normalized) {
            return Ok(());
        }
        self.client.subscribe(&normalized, 1).await?;
        self.subscribed_paths.insert(normalized);
        Ok(())
    }

    async fn do_unsubscribe(&mut self, selector: &str) -> Result<(), Error> {
        let normalized = normalize_selector(selector);
        self.client.unsubscribe(&normalized).await?;
        self.subscribed_paths.remove(&normalized);
        Ok(())
    }

    /// Registry is keyed by selector alone (spec.md §3's "map keyed by a
    /// normalized selector to options"): re-publishing an already-published
    /// selector with a different `atomic` flag updates that one entry in
    /// place rather than accumulating a second, stale registration that
    /// would otherwise make `handle_cache_changed` run both the old and the
    /// new mode's reconciliation on every subsequent change.
    async fn do_publish(&mut self, selector: &str, atomic: bool) -> Result<bool, Error> {
        let normalized = normalize_selector(selector);

        if let Some(existing) = self
            .published_selectors
            .iter_mut()
            .find(|p| path_to_topic(&p.selector) == normalized)
        {
            if existing.atomic == atomic {
                return Ok(false);
            }
            existing.atomic = atomic;
            if !atomic && !self.subscribed_paths.contains(&normalized) {
                self.client.subscribe(&normalized, 1).await?;
                self.subscribed_paths.insert(normalized.clone());
            }
            return Ok(true);
        }

        let selector_path = topic_to_path(&normalized);
        let grounded_len = selector_path.len().saturating_sub(1);

        if !atomic {
            self.client.subscribe(&normalized, 1).await?;
            self.subscribed_paths.insert(normalized.clone());
        }

        self.published_selectors.push(PublishedSelector {
            selector: selector_path.clone(),
            grounded_len,
            atomic,
        });

        if self.cache_subscribed_selectors.insert(normalized) {
            let tx = self.tx.clone();
            self.cache.subscribe_path(&selector_path, move |_value, topic, _bindings, tags| {
                if is_external(tags) {
                    return;
                }
                let changed_path = topic_to_path(topic);
                let _ = tx.try_send(SyncCommand::CacheChanged(changed_path));
            });
        }

        Ok(true)
    }

    async fn handle_cache_changed(&mut self, changed_path: Path) {
        let selectors: Vec<PublishedSelector> = self
            .published_selectors
            .iter()
            .filter(|p| match_path(&p.selector, &changed_path).is_some())
            .cloned()
            .collect();

        for sel in selectors {
            let grounded_path: Path = changed_path.iter().take(sel.grounded_len).cloned().collect();

            if sel.atomic {
                self.clear_flat_descendants(&grounded_path).await;
                // `cache.get` returns `None` when the grounded path was just
                // deleted; that must reach the queue as a clear (`None`,
                // zero-length wire payload), not as a literal "null" body.
                let value = self.cache.get(&grounded_path);
                let grounded_topic = path_to_topic(&grounded_path);
                let _ = self.queue.enqueue(grounded_topic, value).await;
            } else {
                self.reify_atomic_ancestor(&changed_path, &grounded_path).await;
                let changed_topic = path_to_topic(&changed_path);
                match self.cache.get(&changed_path) {
                    Some(value) => {
                        for (suffix, leaf) in to_flat_object(&value) {
                            let topic = format!("{}{}", changed_topic, suffix);
                            let _ = self.queue.enqueue(topic, Some(leaf)).await;
                        }
                    }
                    None => {
                        let _ = self.queue.enqueue(changed_topic, None).await;
                    }
                }
            }
        }
    }

    /// For an about-to-be-atomic write, clear every finer-grained retained
    /// message our own earlier flat publishes left behind under `grounded_path`.
    ///
    /// Can't get there via `self.published.filter(grounded_path + "#")`:
    /// `match_path` lets a trailing `#` match a zero-length tail, so the
    /// selector matches the grounded node itself (its whole subtree, as one
    /// value keyed at `grounded_path`) before ever descending to the `$_`
    /// leaves underneath. Walk the mirror subtree directly instead.
    async fn clear_flat_descendants(&mut self, grounded_path: &Path) {
        let Some(subtree) = self.published.get(grounded_path) else {
            return;
        };
        let mut leaves = Vec::new();
        let mut prefix = grounded_path.clone();
        collect_sentinel_leaves(&subtree, &mut prefix, &mut leaves);

        for path in leaves {
            if path.len() > grounded_path.len() {
                let real_topic = path_to_topic(&path);
                let _ = self.queue.enqueue(real_topic, None).await;
            }
        }
    }

    /// For an about-to-be-flat write, find the nearest ancestor that still
    /// holds a stale atomic retained object and reify its leaves before the
    /// new value goes out.
    async fn reify_atomic_ancestor(&mut self, changed_path: &Path, grounded_path: &Path) {
        let mut ancestor = changed_path.clone();
        while ancestor.len() > grounded_path.len() {
            ancestor.pop();
            let mut sentinel_path = ancestor.clone();
            sentinel_path.push(SENTINEL.to_string());
            if let Some(old) = self.published.get(&sentinel_path) {
                if old.is_object() {
                    let ancestor_topic = path_to_topic(&ancestor);
                    let _ = self.queue.enqueue(ancestor_topic.clone(), None).await;
                    for (suffix, leaf) in to_flat_object(&old) {
                        let topic = format!("{}{}", ancestor_topic, suffix);
                        let _ = self.queue.enqueue(topic, Some(leaf)).await;
                    }
                    return;
                }
            }
        }
    }

    async fn begin_clear(
        &mut self,
        prefixes: Vec<String>,
        filter: Arc<dyn Fn(&str) -> bool + Send + Sync>,
        reply: oneshot::Sender<Result<usize, Error>>,
    ) {
        let mut selectors = Vec::with_capacity(prefixes.len());
        for prefix in &prefixes {
            let normalized = normalize_selector(prefix);
            if !self.subscribed_paths.contains(&normalized) {
                if let Err(err) = self.client.subscribe(&normalized, 1).await {
                    log::warn!("clear: subscribe {} failed: {}", normalized, err);
                    continue;
                }
                self.subscribed_paths.insert(normalized.clone());
            }
            selectors.push(normalized);
        }

        let id = self.next_clear_id;
        self.next_clear_id += 1;
        self.pending_clears.insert(
            id,
            PendingClear {
                selectors,
                filter,
                reply,
            },
        );

        let tx = self.tx.clone();
        let handle = MqttSync {
            tx: tx.clone(),
            cache: self.cache.clone(),
        };
        tokio::spawn(async move {
            let _ = handle.wait_for_heartbeat_once().await;
            let _ = tx.send(SyncCommand::FinishClear(id)).await;
        });
    }

    async fn finish_clear(&mut self, id: u64) {
        let Some(pending) = self.pending_clears.remove(&id) else {
            return;
        };

        for selector in &pending.selectors {
            let _ = self.client.unsubscribe(selector).await;
            self.subscribed_paths.remove(selector);
        }

        let to_delete: Vec<String> = self
            .received_topics
            .iter()
            .filter(|topic| {
                pending
                    .selectors
                    .iter()
                    .any(|sel| match_path(&topic_to_path(sel), &topic_to_path(topic)).is_some())
            })
            .filter(|topic| (pending.filter)(topic))
            .cloned()
            .collect();

        for topic in &to_delete {
            let _ = self.queue.enqueue(topic.clone(), None).await;
        }

        let _ = pending.reply.send(Ok(to_delete.len()));
    }

    async fn do_register_rpc(&mut self, command: &str, handler: RpcHandler) -> Result<(), Error> {
        let request_topic = format!("{}/request", command.trim_end_matches('/'));
        if self.rpc_request_handlers.contains_key(&request_topic) {
            return Ok(());
        }
        self.client.subscribe(&request_topic, 2).await?;
        self.subscribed_paths.insert(request_topic.clone());
        self.rpc_request_handlers.insert(request_topic, handler);
        Ok(())
    }

    async fn do_register_rpc_callback(
        &mut self,
        topic: String,
        reply_tx: oneshot::Sender<Value>,
    ) -> Result<(), Error> {
        self.client.subscribe(&topic, 2).await?;
        self.subscribed_paths.insert(topic.clone());
        self.rpc_response_callbacks.insert(topic, reply_tx);
        Ok(())
    }

    fn dispatch_rpc_request(&mut self, request_topic: String, payload: Vec<u8>, handler: RpcHandler) {
        let Ok(envelope) = serde_json::from_slice::<RpcRequestEnvelope>(&payload) else {
            return;
        };
        let command = request_topic
            .strip_suffix("/request")
            .unwrap_or(&request_topic)
            .to_string();
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Ok(result) = handler(envelope.args).await {
                let response_topic = format!("{}/response/{}", command, envelope.id);
                let body = serde_json::to_vec(&RpcResponseEnvelope {
                    id: envelope.id,
                    result,
                })
                .unwrap_or_default();
                let _ = client.publish(&response_topic, body, false, 2).await;
            }
            // Handler error: no response is emitted (open question preserved).
        });
    }

    async fn dispatch_rpc_response(&mut self, topic: String, payload: Vec<u8>) {
        let Some(reply) = self.rpc_response_callbacks.remove(&topic) else {
            return;
        };
        let _ = self.client.unsubscribe(&topic).await;
        self.subscribed_paths.remove(&topic);
        if let Ok(envelope) = serde_json::from_slice::<RpcResponseEnvelope>(&payload) {
            let _ = reply.send(envelope.result);
        }
    }
}

/// Recursively collect every path in `value` that ends in the reserved `$_`
/// sentinel, i.e. every concrete topic the mirror actually holds a published
/// value for. `prefix` is mutated as a scratch stack and restored on return.
fn collect_sentinel_leaves(value: &Value, prefix: &mut Path, out: &mut Vec<Path>) {
    let Value::Object(map) = value else {
        return;
    };
    for (key, child) in map {
        if key.as_str() == SENTINEL {
            out.push(prefix.clone());
        } else {
            prefix.push(key.clone());
            collect_sentinel_leaves(child, prefix, out);
            prefix.pop();
        }
    }
}
