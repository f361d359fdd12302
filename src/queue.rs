// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Publication queue: order-preserving dedup of pending writes, drained one
//! at a time against the broker, with retry-on-disconnect and optional
//! leading+trailing throttling of the drain trigger.
//!
//! Shaped like the teacher's `ServerContext::run_loop` (`src/server_context.rs`):
//! a single task owns all mutable state and a `tokio::sync::mpsc` channel is
//! the only way in. Unlike that loop this one also sends itself commands —
//! `Retry` and `ThrottleElapsed` — from timers spawned off the hot path, so a
//! 5-second backoff never blocks newly enqueued writes from being accepted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::Cache;
use crate::client::MqttClient;
use crate::error::Error;
use crate::topic::topic_to_path;
use crate::types::{Tags, SENTINEL};

const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum QueueCommand {
    Enqueue { topic: String, value: Option<Value> },
    SetThrottle(Duration),
    ClearThrottle,
    Retry,
    ThrottleElapsed,
}

/// Cloneable handle to a running [`QueueEngine`].
#[derive(Clone)]
pub struct PublicationQueue {
    tx: mpsc::Sender<QueueCommand>,
}

impl PublicationQueue {
    pub fn spawn<C: MqttClient>(client: Arc<C>, mirror: Cache, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let engine = QueueEngine {
            client,
            mirror,
            rx,
            tx: tx.clone(),
            order: VecDeque::new(),
            pending: HashMap::new(),
            throttle: None,
            in_cooldown: false,
            trailing_pending: false,
            retry_scheduled: false,
        };
        tokio::spawn(engine.run_loop());
        PublicationQueue { tx }
    }

    /// Enqueue `topic` for publish with `value` (`None` clears the retained
    /// message). Replaces any not-yet-drained value already queued for the
    /// same topic without disturbing its position in the drain order.
    pub async fn enqueue(&self, topic: String, value: Option<Value>) -> Result<(), Error> {
        self.tx
            .send(QueueCommand::Enqueue { topic, value })
            .await?;
        Ok(())
    }

    /// Wrap the drain trigger in a leading+trailing throttle: the first
    /// enqueue after a quiet period drains immediately, further enqueues
    /// within `duration` collapse into one trailing drain at its end.
    pub async fn set_throttle(&self, duration: Duration) -> Result<(), Error> {
        self.tx.send(QueueCommand::SetThrottle(duration)).await?;
        Ok(())
    }

    /// Return to draining on every enqueue with no throttling.
    pub async fn clear_throttle(&self) -> Result<(), Error> {
        self.tx.send(QueueCommand::ClearThrottle).await?;
        Ok(())
    }
}

struct QueueEngine<C: MqttClient> {
    client: Arc<C>,
    mirror: Cache,
    rx: mpsc::Receiver<QueueCommand>,
    tx: mpsc::Sender<QueueCommand>,
    order: VecDeque<String>,
    pending: HashMap<String, Option<Value>>,
    throttle: Option<Duration>,
    in_cooldown: bool,
    trailing_pending: bool,
    retry_scheduled: bool,
}

impl<C: MqttClient> QueueEngine<C> {
    async fn run_loop(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd).await;
        }
    }

    async fn handle(&mut self, cmd: QueueCommand) {
        match cmd {
            QueueCommand::Enqueue { topic, value } => {
                self.write_mirror(&topic, &value);
                let is_new = !self.pending.contains_key(&topic);
                self.pending.insert(topic.clone(), value);
                if is_new {
                    self.order.push_back(topic);
                }
                if !self.retry_scheduled {
                    self.trigger_drain().await;
                }
            }
            QueueCommand::SetThrottle(duration) => {
                self.throttle = Some(duration);
            }
            QueueCommand::ClearThrottle => {
                self.throttle = None;
                self.in_cooldown = false;
                self.trailing_pending = false;
            }
            QueueCommand::Retry => {
                self.retry_scheduled = false;
                self.trigger_drain().await;
            }
            QueueCommand::ThrottleElapsed => {
                self.in_cooldown = false;
                if self.trailing_pending {
                    self.trailing_pending = false;
                    self.trigger_drain().await;
                }
            }
        }
    }

    /// Optimistic local write of the value about to be published into the
    /// `publishedMessages` mirror, under the reserved `$_` sentinel so a
    /// value at `/a` and one at `/a/b` never share a storage slot.
    fn write_mirror(&self, topic: &str, value: &Option<Value>) {
        let mut path = topic_to_path(topic);
        path.push(SENTINEL.to_string());
        self.mirror
            .update(&path, value.clone().unwrap_or(Value::Null), &Tags::new());
    }

    async fn trigger_drain(&mut self) {
        let Some(duration) = self.throttle else {
            self.drain_now().await;
            return;
        };
        if self.in_cooldown {
            self.trailing_pending = true;
            return;
        }
        self.in_cooldown = true;
        self.drain_now().await;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(QueueCommand::ThrottleElapsed).await;
        });
    }

    /// Pop and publish entries from the head of the queue until it is empty
    /// or a publish fails, in which case the failing entry stays at the head
    /// and a retry is scheduled rather than removed.
    async fn drain_now(&mut self) {
        while let Some(topic) = self.order.front().cloned() {
            let Some(value) = self.pending.get(&topic).cloned() else {
                // order and pending are always kept in sync; unreachable.
                self.order.pop_front();
                continue;
            };

            if !self.client.is_connected() {
                self.schedule_retry();
                return;
            }

            let payload = match &value {
                Some(v) => serde_json::to_vec(v).unwrap_or_default(),
                None => Vec::new(),
            };

            match self.client.publish(&topic, payload, true, 1).await {
                Ok(()) => {
                    self.order.pop_front();
                    self.pending.remove(&topic);
                }
                Err(_) => {
                    self.schedule_retry();
                    return;
                }
            }
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry_scheduled {
            return;
        }
        self.retry_scheduled = true;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETRY_DELAY).await;
            let _ = tx.send(QueueCommand::Retry).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::RecordingClient;
    use serde_json::json;

    #[tokio::test]
    async fn drains_in_fifo_order() {
        let client = Arc::new(RecordingClient::new_connected());
        let mirror = Cache::new();
        let queue = PublicationQueue::spawn(client.clone(), mirror, 16);

        queue.enqueue("/a".to_string(), Some(json!(1))).await.unwrap();
        queue.enqueue("/b".to_string(), Some(json!(2))).await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let published = client.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "/a");
        assert_eq!(published[1].0, "/b");
    }

    #[tokio::test]
    async fn re_enqueue_before_drain_replaces_value_not_position() {
        let client = Arc::new(RecordingClient::new_disconnected());
        let mirror = Cache::new();
        let queue = PublicationQueue::spawn(client.clone(), mirror, 16);

        queue.enqueue("/a".to_string(), Some(json!(1))).await.unwrap();
        queue.enqueue("/a".to_string(), Some(json!(2))).await.unwrap();
        tokio::task::yield_now().await;

        client.set_connected(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(client.published().is_empty());
    }

    #[tokio::test]
    async fn enqueue_optimistically_writes_mirror() {
        let client = Arc::new(RecordingClient::new_connected());
        let mirror = Cache::new();
        let queue = PublicationQueue::spawn(client.clone(), mirror.clone(), 16);

        queue.enqueue("/a/b".to_string(), Some(json!(7))).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(
            mirror.get(&vec!["a".to_string(), "b".to_string(), SENTINEL.to_string()]),
            Some(json!(7))
        );
    }
}
