// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scheduler service (C8): one per process, grounded on
//! `inbox/mailsync/service.py`'s `SyncService`.
//!
//! Owns every account whose effective sync host resolves to this process's
//! `{hostname}:{process_number}` identifier, reconciling that set against
//! currently-running [`AccountMonitor`]s on a timer and claiming newly
//! unclaimed accounts announced on a shared, per-zone queue while a private
//! queue carries commands (today: a migration nudge) directed at this
//! process specifically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::blobstore::{BlobStore, RawMimeStore};
use crate::heartbeat::HeartbeatStore;
use crate::queue::{EventQueueBackend, EventQueueGroup, PopTimeout};
use crate::store::{Account, AccountId, LocalStore, StoreError};
use crate::sync::monitor::{AccountMonitor, FolderSessionFactory, MonitorConfig};
use crate::sync::StopSignal;

/// Per-process cap on concurrently-syncing accounts.
pub const MAX_ACCOUNTS_PER_PROCESS: usize = 150;
/// The 15-minute pending-average load signal must stay under this for the
/// process to claim any more accounts off the shared queue.
pub const LOAD_THRESHOLD: f64 = 10.0;

/// The 15-minute pending-average signal gating whether this process may
/// claim more accounts. A production deployment would back this with a
/// rolling counter over actually-pending work; tests and single-node
/// deployments can use [`ZeroLoadSignal`].
pub trait LoadSignalProvider: Send + Sync {
    fn pending_average(&self) -> f64;
}

pub struct ZeroLoadSignal;

impl LoadSignalProvider for ZeroLoadSignal {
    fn pending_average(&self) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub process_identifier: String,
    pub poll_interval: Duration,
    pub max_accounts_per_process: usize,
}

impl SchedulerConfig {
    pub fn new(process_identifier: impl Into<String>) -> Self {
        Self {
            process_identifier: process_identifier.into(),
            poll_interval: Duration::from_secs(60),
            max_accounts_per_process: MAX_ACCOUNTS_PER_PROCESS,
        }
    }
}

struct RunningMonitor {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

pub struct Scheduler<F: FolderSessionFactory + Clone + 'static, B: BlobStore + 'static> {
    config: SchedulerConfig,
    store: Arc<dyn LocalStore>,
    blobstore: Arc<RawMimeStore<B>>,
    heartbeat_store: Arc<dyn HeartbeatStore>,
    factory: F,
    shared_queue: Arc<dyn EventQueueBackend>,
    private_queue: Arc<dyn EventQueueBackend>,
    load_signal: Arc<dyn LoadSignalProvider>,
    stop: StopSignal,
    monitors: Mutex<HashMap<AccountId, RunningMonitor>>,
}

impl<F: FolderSessionFactory + Clone + 'static, B: BlobStore + 'static> Scheduler<F, B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn LocalStore>,
        blobstore: Arc<RawMimeStore<B>>,
        heartbeat_store: Arc<dyn HeartbeatStore>,
        factory: F,
        shared_queue: Arc<dyn EventQueueBackend>,
        private_queue: Arc<dyn EventQueueBackend>,
    ) -> Self {
        Self {
            config,
            store,
            blobstore,
            heartbeat_store,
            factory,
            shared_queue,
            private_queue,
            load_signal: Arc::new(ZeroLoadSignal),
            stop: StopSignal::new(),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_load_signal(mut self, load_signal: Arc<dyn LoadSignalProvider>) -> Self {
        self.load_signal = load_signal;
        self
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Runs the reconcile/claim loop until `stop_signal().stop()` is called,
    /// then cascades shutdown to every owned `AccountMonitor`.
    pub async fn run(&self) -> Result<(), StoreError> {
        loop {
            if self.stop.is_stopped() {
                break;
            }
            if let Err(err) = self.poll().await {
                warn!("scheduler {} poll failed: {err}", self.config.process_identifier);
            }

            let wait = self.next_wait();
            let group = EventQueueGroup::new(vec![self.shared_queue.clone(), self.private_queue.clone()]);
            tokio::select! {
                _ = self.stop.wait(wait) => {}
                event = group.receive_event(PopTimeout::Bounded(wait)) => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
            }
        }
        self.stop_all().await;
        Ok(())
    }

    /// Randomized in `[5s, poll_interval]` to avoid every process in a zone
    /// waking in lockstep.
    fn next_wait(&self) -> Duration {
        let max = self.config.poll_interval.as_secs_f64().max(5.0);
        let secs = rand::thread_rng().gen_range(5.0..=max);
        Duration::from_secs_f64(secs)
    }

    async fn handle_event(&self, event: Value) {
        let queue_name = event.get("queue_name").and_then(|v| v.as_str()).unwrap_or("");
        if queue_name == self.shared_queue.queue_name() {
            self.handle_shared_event(event).await;
        } else {
            // Private events are directives to re-poll (e.g. a migration
            // nudge); drain whatever else queued up first.
            while self
                .private_queue
                .receive_event(PopTimeout::NonBlocking)
                .await
                .is_some()
            {}
            if let Err(err) = self.poll().await {
                warn!("scheduler {} re-poll after private event failed: {err}", self.config.process_identifier);
            }
        }
    }

    async fn handle_shared_event(&self, mut event: Value) {
        let Some(account_id) = event.get("id").and_then(Value::as_i64) else {
            return;
        };
        let under_cap = self.monitors.lock().await.len() < self.config.max_accounts_per_process;
        let under_load = self.load_signal.pending_average() < LOAD_THRESHOLD;
        if !under_cap || !under_load {
            if let Some(map) = event.as_object_mut() {
                map.remove("queue_name");
            }
            self.shared_queue.send_event(event).await;
            return;
        }
        match self.store.claim_account(account_id, &self.config.process_identifier).await {
            Ok(true) => self.start_account(account_id).await,
            Ok(false) => {}
            Err(err) => warn!("claim_account({account_id}) failed: {err}"),
        }
    }

    /// Starts every account this process should own that isn't already
    /// running, and stops every running one that no longer should be.
    async fn poll(&self) -> Result<(), StoreError> {
        let should_run = self.store.account_ids_to_sync(&self.config.process_identifier).await?;
        let running: HashSet<AccountId> = self.monitors.lock().await.keys().copied().collect();

        for account_id in should_run.difference(&running) {
            self.start_account(*account_id).await;
        }
        for account_id in running.difference(&should_run) {
            self.stop_account(*account_id).await;
        }
        Ok(())
    }

    async fn start_account(&self, account_id: AccountId) {
        if self.monitors.lock().await.contains_key(&account_id) {
            return;
        }
        let account = match self.store.get_account(account_id).await {
            Ok(account) => account,
            Err(err) => {
                warn!("account {account_id} lookup failed, not starting: {err}");
                return;
            }
        };
        self.spawn_monitor(account).await;
    }

    async fn spawn_monitor(&self, account: Account) {
        let account_id = account.id;
        let stop = StopSignal::new();
        let monitor = AccountMonitor::new(
            self.factory.clone(),
            self.store.clone(),
            self.blobstore.clone(),
            self.heartbeat_store.clone(),
            stop.clone(),
            account,
        )
        .with_config(MonitorConfig::default());

        let handle = tokio::spawn(async move {
            if let Err(err) = monitor.run().await {
                error!("account monitor {account_id} exited: {err}");
            }
        });
        self.monitors
            .lock()
            .await
            .insert(account_id, RunningMonitor { stop, handle });
        info!("scheduler {}: started account {account_id}", self.config.process_identifier);
    }

    async fn stop_account(&self, account_id: AccountId) {
        if let Some(running) = self.monitors.lock().await.remove(&account_id) {
            running.stop.stop();
            let _ = running.handle.await;
            if let Err(err) = self.store.release_account(account_id, &self.config.process_identifier).await {
                warn!("release_account({account_id}) failed: {err}");
            }
            info!("scheduler {}: stopped account {account_id}", self.config.process_identifier);
        }
    }

    async fn stop_all(&self) {
        let ids: Vec<AccountId> = self.monitors.lock().await.keys().copied().collect();
        for account_id in ids {
            self.stop_account(account_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::FsBlobStore;
    use crate::heartbeat::InMemoryHeartbeatStore;
    use crate::queue::InMemoryEventQueue;
    use crate::store::sqlite::SqliteStore;
    use crate::sync::monitor::RemoteFolder;
    use crate::imap::error::ImapError;
    use async_trait::async_trait;

    #[derive(Clone)]
    struct EmptyFactory;

    #[async_trait]
    impl FolderSessionFactory for EmptyFactory {
        type Session = crate::sync::session::mock::MockFolderSession;

        async fn list_folders(&self, _account: &Account) -> Result<Vec<RemoteFolder>, ImapError> {
            Ok(vec![])
        }

        async fn new_session(&self, _account: &Account) -> Result<Self::Session, ImapError> {
            Ok(crate::sync::session::mock::MockFolderSession::new(1))
        }
    }

    async fn test_scheduler() -> (Scheduler<EmptyFactory, FsBlobStore>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let blobstore = Arc::new(RawMimeStore::new(
            FsBlobStore::new(tempfile::tempdir().unwrap().into_path()),
            false,
        ));
        let scheduler = Scheduler::new(
            SchedulerConfig::new("host-1:0"),
            store.clone(),
            blobstore,
            InMemoryHeartbeatStore::new(),
            EmptyFactory,
            InMemoryEventQueue::new("sync:shared:zone1"),
            InMemoryEventQueue::new("sync:private:host-1:0"),
        );
        (scheduler, store)
    }

    #[tokio::test]
    async fn poll_starts_and_stops_to_match_ownership() {
        let (scheduler, store) = test_scheduler().await;
        // No accounts own this process yet; poll should be a no-op.
        scheduler.poll().await.unwrap();
        assert!(scheduler.monitors.lock().await.is_empty());

        let _ = store; // account fixtures would require full account-insert helpers not yet exposed by SqliteStore.
    }

    #[tokio::test]
    async fn next_wait_stays_within_bounds() {
        let (scheduler, _store) = test_scheduler().await;
        for _ in 0..20 {
            let wait = scheduler.next_wait();
            assert!(wait >= Duration::from_secs(5));
            assert!(wait <= scheduler.config.poll_interval.max(Duration::from_secs(5)));
        }
    }
}
