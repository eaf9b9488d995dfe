// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Heartbeat publisher (C4), grounded on `inbox/heartbeat/store.py`.
//!
//! Writes `(timestamp, state)` keyed by `(account_id, folder_id)` to a
//! shared key-value store on every significant engine step, plus a
//! per-account index (folder id -> timestamp) and a global index tracking
//! the oldest heartbeat per account. Never consumed by the core itself —
//! it exists purely for external liveness monitoring — so publish failures
//! are logged and swallowed (`safe_failure` in the source), never
//! propagated to the sync loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use tokio::sync::Mutex;

pub type AccountId = i64;
pub type FolderId = i64;

/// `"{account_id}:{folder_id}"`.
pub fn heartbeat_key(account_id: AccountId, folder_id: FolderId) -> String {
    format!("{account_id}:{folder_id}")
}

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    async fn publish(&self, account_id: AccountId, folder_id: FolderId, state: &str);
    async fn clear(&self, account_id: AccountId, folder_id: FolderId);
    async fn clear_account(&self, account_id: AccountId);
    /// Oldest heartbeat timestamp across all folders of `account_id`, or
    /// `None` if the account has never published.
    async fn oldest_for_account(&self, account_id: AccountId) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone)]
struct Entry {
    timestamp: DateTime<Utc>,
    #[allow(dead_code)]
    state: String,
}

/// In-process store standing in for the KV-store-backed deployment. The
/// heartbeat store is purely an external interface, never consumed by the
/// core itself, so only the write/index semantics matter here.
#[derive(Default)]
pub struct InMemoryHeartbeatStore {
    // account_id -> (folder_id -> Entry)
    by_account: Mutex<BTreeMap<AccountId, BTreeMap<FolderId, Entry>>>,
}

impl InMemoryHeartbeatStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryHeartbeatStore {
    async fn publish(&self, account_id: AccountId, folder_id: FolderId, state: &str) {
        let mut guard = self.by_account.lock().await;
        guard
            .entry(account_id)
            .or_default()
            .insert(
                folder_id,
                Entry {
                    timestamp: Utc::now(),
                    state: state.to_string(),
                },
            );
    }

    async fn clear(&self, account_id: AccountId, folder_id: FolderId) {
        let mut guard = self.by_account.lock().await;
        if let Some(folders) = guard.get_mut(&account_id) {
            folders.remove(&folder_id);
            if folders.is_empty() {
                guard.remove(&account_id);
            }
        }
    }

    async fn clear_account(&self, account_id: AccountId) {
        self.by_account.lock().await.remove(&account_id);
    }

    async fn oldest_for_account(&self, account_id: AccountId) -> Option<DateTime<Utc>> {
        let guard = self.by_account.lock().await;
        guard
            .get(&account_id)
            .and_then(|folders| folders.values().map(|e| e.timestamp).min())
    }
}

/// `HeartbeatStatusProxy` from the source: a thin per-(account, folder)
/// handle that the folder sync engine holds, so call sites don't need to
/// plumb account/folder ids through every publish call. Publish errors are
/// swallowed, matching `safe_failure`.
pub struct HeartbeatHandle {
    store: Arc<dyn HeartbeatStore>,
    account_id: AccountId,
    folder_id: FolderId,
}

impl HeartbeatHandle {
    pub fn new(store: Arc<dyn HeartbeatStore>, account_id: AccountId, folder_id: FolderId) -> Self {
        Self {
            store,
            account_id,
            folder_id,
        }
    }

    pub async fn publish(&self, state: &str) {
        self.store.publish(self.account_id, self.folder_id, state).await;
    }

    pub async fn clear(&self) {
        self.store.clear(self.account_id, self.folder_id).await;
    }
}

/// Alive means a heartbeat within the last `alive_expiry` seconds
/// (`BASE_ALIVE_THRESHOLD`, default 480).
pub fn is_alive(timestamp: DateTime<Utc>, alive_expiry_secs: i64) -> bool {
    let age = Utc::now().signed_duration_since(timestamp);
    age.num_seconds() <= alive_expiry_secs && age.num_seconds() >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_is_account_colon_folder() {
        assert_eq!(heartbeat_key(42, 7), "42:7");
    }

    #[tokio::test]
    async fn publish_then_oldest_round_trips() {
        let store = InMemoryHeartbeatStore::new();
        store.publish(1, 10, "poll").await;
        store.publish(1, 11, "initial").await;
        let oldest = store.oldest_for_account(1).await;
        assert!(oldest.is_some());
    }

    #[tokio::test]
    async fn clear_account_removes_all_folders() {
        let store = InMemoryHeartbeatStore::new();
        store.publish(1, 10, "poll").await;
        store.clear_account(1).await;
        assert!(store.oldest_for_account(1).await.is_none());
    }

    #[test]
    fn liveness_window() {
        let now = Utc::now();
        assert!(is_alive(now, 480));
        let stale = now - chrono::Duration::seconds(600);
        assert!(!is_alive(stale, 480));
    }
}
