// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared event queue (C10): FIFO + blocking-pop, backed by a key-value
//! store in the reference implementation (`inbox/scheduling/event_queue.py`,
//! Redis-backed there). No crate in this workspace's dependency stack talks
//! to Redis, so the queue is specified as a trait with the source's exact
//! `send_event`/`receive_event` timeout semantics; `InMemoryEventQueue`
//! implements it on top of `tokio::sync::Mutex` + `Notify`, standing in for
//! a KV-store-backed deployment.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

/// Blocking-pop timeout semantics:
/// - `Block`: wait until an event is available (source: `timeout=0`).
/// - `Bounded(d)`: wait up to `d`; `None` on expiry (source: `timeout>0`).
/// - `NonBlocking`: return immediately; `None` if empty (source:
///   `timeout=None`, a non-blocking `lpop`).
#[derive(Debug, Clone, Copy)]
pub enum PopTimeout {
    Block,
    Bounded(Duration),
    NonBlocking,
}

#[async_trait]
pub trait EventQueueBackend: Send + Sync {
    fn queue_name(&self) -> &str;

    async fn send_event(&self, event: Value);

    /// Returns `None` if the queue is empty and the timeout policy gave up.
    async fn receive_event(&self, timeout: PopTimeout) -> Option<Value>;
}

/// A single named FIFO queue.
pub struct InMemoryEventQueue {
    name: String,
    items: Mutex<VecDeque<Value>>,
    notify: Notify,
}

impl InMemoryEventQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    async fn try_pop(&self) -> Option<Value> {
        self.items.lock().await.pop_front()
    }
}

#[async_trait]
impl EventQueueBackend for InMemoryEventQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn send_event(&self, mut event: Value) {
        if let Value::Object(ref mut map) = event {
            map.remove("queue_name");
        }
        self.items.lock().await.push_back(event);
        self.notify.notify_one();
    }

    async fn receive_event(&self, timeout: PopTimeout) -> Option<Value> {
        match timeout {
            PopTimeout::NonBlocking => self.try_pop().await,
            PopTimeout::Block => loop {
                if let Some(v) = self.try_pop().await {
                    return Some(v);
                }
                self.notify.notified().await;
            },
            PopTimeout::Bounded(d) => {
                let deadline = tokio::time::Instant::now() + d;
                loop {
                    if let Some(v) = self.try_pop().await {
                        return Some(v);
                    }
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let remaining = deadline - now;
                    tokio::select! {
                        _ = self.notify.notified() => continue,
                        _ = tokio::time::sleep(remaining) => return None,
                    }
                }
            }
        }
    }
}

/// Wraps several named queues and blocks across all of them simultaneously,
/// returning `{queue_name, ...payload}` on whichever produces an event
/// first (`EventQueueGroup` in the source).
pub struct EventQueueGroup {
    queues: Vec<Arc<dyn EventQueueBackend>>,
}

impl EventQueueGroup {
    pub fn new(queues: Vec<Arc<dyn EventQueueBackend>>) -> Self {
        Self { queues }
    }

    pub async fn receive_event(&self, timeout: PopTimeout) -> Option<Value> {
        // Poll in round-robin fashion; under `Block`/`Bounded` semantics we
        // retry until the deadline, notified by any member queue.
        let deadline = match timeout {
            PopTimeout::Bounded(d) => Some(tokio::time::Instant::now() + d),
            _ => None,
        };
        loop {
            for queue in &self.queues {
                if let Some(mut event) = queue.receive_event(PopTimeout::NonBlocking).await {
                    if let Value::Object(ref mut map) = event {
                        map.insert(
                            "queue_name".to_string(),
                            Value::String(queue.queue_name().to_string()),
                        );
                    }
                    return Some(event);
                }
            }
            match timeout {
                PopTimeout::NonBlocking => return None,
                PopTimeout::Block => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                PopTimeout::Bounded(_) => {
                    if tokio::time::Instant::now() >= deadline.unwrap() {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_then_nonblocking_receive() {
        let q = InMemoryEventQueue::new("sync:event_queue:p1");
        q.send_event(json!({"id": 7})).await;
        let got = q.receive_event(PopTimeout::NonBlocking).await.unwrap();
        assert_eq!(got["id"], 7);
    }

    #[tokio::test]
    async fn nonblocking_receive_on_empty_is_none() {
        let q = InMemoryEventQueue::new("empty");
        assert!(q.receive_event(PopTimeout::NonBlocking).await.is_none());
    }

    #[tokio::test]
    async fn bounded_receive_times_out() {
        let q = InMemoryEventQueue::new("empty");
        let got = q
            .receive_event(PopTimeout::Bounded(Duration::from_millis(20)))
            .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn blocking_receive_wakes_on_send() {
        let q = InMemoryEventQueue::new("q");
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.receive_event(PopTimeout::Block).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.send_event(json!({"id": 1})).await;
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got["id"], 1);
    }

    #[tokio::test]
    async fn group_injects_queue_name() {
        let a = InMemoryEventQueue::new("shared");
        let b = InMemoryEventQueue::new("private:p1");
        b.send_event(json!({"id": 3})).await;
        let group = EventQueueGroup::new(vec![a, b]);
        let got = group
            .receive_event(PopTimeout::Bounded(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(got["queue_name"], "private:p1");
        assert_eq!(got["id"], 3);
    }
}
