// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Account sync monitor (C6): one per running account, grounded on
//! `inbox/mailsync/backends/imap/monitor.py`'s `ImapSyncMonitor`.
//!
//! Discovers remote folders, creates/tombstones their local rows, and keeps
//! one [`FolderEngine`](super::folder::FolderEngine) task alive per folder
//! that should sync, re-listing the remote folder set every
//! `refresh_frequency`. Also owns this account's
//! [`DeleteHandler`](super::delete_handler::DeleteHandler) task, since both
//! are scoped to the account's lifetime and must stop together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::blobstore::{BlobStore, RawMimeStore};
use crate::heartbeat::{HeartbeatHandle, HeartbeatStore};
use crate::imap::error::ImapError;
use crate::provider::Provider;
use crate::retry::RetryPolicy;
use crate::store::{Account, FolderId, LocalStore, StoreError};

use super::delete_handler::{DeleteHandler, DeleteHandlerConfig};
use super::folder::{FolderEngine, ThrottleConfig};
use super::session::FolderSession;
use super::StopSignal;

/// A folder as reported by `LIST`, prior to being matched against the
/// locally stored folder set.
#[derive(Debug, Clone)]
pub struct RemoteFolder {
    pub name: String,
    pub canonical_name: Option<String>,
}

/// Produces one [`FolderSession`] per [`FolderEngine`] and lists an
/// account's remote folders, abstracting away how a session is obtained
/// (a live IMAP login in production, an in-memory stand-in in tests) so
/// `AccountMonitor` stays agnostic to connection management.
#[async_trait]
pub trait FolderSessionFactory: Send + Sync {
    type Session: FolderSession + 'static;

    async fn list_folders(&self, account: &Account) -> Result<Vec<RemoteFolder>, ImapError>;
    async fn new_session(&self, account: &Account) -> Result<Self::Session, ImapError>;
}

/// Production factory: opens a fresh IMAP login per call. Grounded on
/// `crispin.py`'s per-connection-pool-checkout session model, simplified
/// here to one connection per folder engine for its lifetime rather than
/// one per engine tick.
#[derive(Debug, Clone, Copy)]
pub struct ImapFolderSessionFactory;

impl ImapFolderSessionFactory {
    async fn connect(
        &self,
        account: &Account,
    ) -> Result<crate::imap::client::ImapClient<crate::imap::session::AsyncImapSessionWrapper>, ImapError> {
        crate::imap::client::ImapClient::connect(
            &account.imap_host,
            account.imap_port,
            &account.imap_user,
            &account.imap_pass,
        )
        .await
    }
}

#[async_trait]
impl FolderSessionFactory for ImapFolderSessionFactory {
    type Session = super::session::ImapClientFolderSession;

    async fn list_folders(&self, account: &Account) -> Result<Vec<RemoteFolder>, ImapError> {
        let client = self.connect(account).await?;
        let names = client.list_folders().await?;
        Ok(names
            .into_iter()
            .map(|name| {
                let canonical_name = if name.eq_ignore_ascii_case("inbox") {
                    Some("inbox".to_string())
                } else {
                    None
                };
                RemoteFolder { name, canonical_name }
            })
            .collect())
    }

    async fn new_session(&self, account: &Account) -> Result<Self::Session, ImapError> {
        let client = self.connect(account).await?;
        Ok(super::session::ImapClientFolderSession::new(Arc::new(client)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub refresh_frequency: Duration,
    pub throttle: ThrottleConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            refresh_frequency: super::constants::DEFAULT_POLL_FREQUENCY,
            throttle: ThrottleConfig::default(),
        }
    }
}

struct RunningFolder {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

pub struct AccountMonitor<F: FolderSessionFactory, B: BlobStore> {
    factory: F,
    store: Arc<dyn LocalStore>,
    blobstore: Arc<RawMimeStore<B>>,
    heartbeat_store: Arc<dyn HeartbeatStore>,
    stop: StopSignal,
    account: Account,
    provider: Provider,
    config: MonitorConfig,
    folders: Mutex<HashMap<FolderId, RunningFolder>>,
}

impl<F: FolderSessionFactory, B: BlobStore + 'static> AccountMonitor<F, B> {
    pub fn new(
        factory: F,
        store: Arc<dyn LocalStore>,
        blobstore: Arc<RawMimeStore<B>>,
        heartbeat_store: Arc<dyn HeartbeatStore>,
        stop: StopSignal,
        account: Account,
    ) -> Self {
        let provider = Provider::from_account_provider(&account.provider);
        Self {
            factory,
            store,
            blobstore,
            heartbeat_store,
            stop,
            account,
            provider,
            config: MonitorConfig::default(),
            folders: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs until `stop()` is called on this monitor's `StopSignal`, then
    /// cascades the stop to every folder engine and the delete handler and
    /// returns once they have all exited.
    pub async fn run(&self) -> Result<(), StoreError> {
        let delete_stop = StopSignal::new();
        let delete_handler = DeleteHandler::new(
            self.store.clone(),
            self.blobstore.clone(),
            delete_stop.clone(),
            self.account.namespace_id,
            DeleteHandlerConfig::default(),
        );
        let delete_task = tokio::spawn(async move {
            if let Err(err) = delete_handler.run().await {
                error!("delete handler exited: {err}");
            }
        });

        loop {
            if self.stop.is_stopped() {
                break;
            }
            if let Err(err) = self.sync_folder_list().await {
                warn!(
                    "account {} folder discovery failed: {err}",
                    self.account.id
                );
            }
            self.reap_finished().await;
            self.stop.wait(self.config.refresh_frequency).await;
        }

        self.stop_all_folders().await;
        delete_stop.stop();
        let _ = delete_task.await;
        Ok(())
    }

    /// Lists the account's remote folders, creates local rows for any that
    /// are new, tombstones local rows for any that disappeared, and makes
    /// sure every folder that should sync has a running engine.
    async fn sync_folder_list(&self) -> Result<(), StoreError> {
        let remote = self
            .factory
            .list_folders(&self.account)
            .await
            .map_err(|err| StoreError::NotFound(format!("folder discovery failed: {err}")))?;
        let remote_names: std::collections::HashSet<&str> =
            remote.iter().map(|f| f.name.as_str()).collect();

        let local = self.store.list_folders(self.account.id).await?;
        for folder in &local {
            if folder.deleted_at.is_none() && !remote_names.contains(folder.name.as_str()) {
                info!(
                    "account {} folder {} no longer present remotely, tombstoning",
                    self.account.id, folder.name
                );
                self.stop_folder(folder.id).await;
                self.store.delete_folder(folder.id).await?;
            }
        }

        for rf in &remote {
            let folder = self
                .store
                .find_or_create_folder(self.account.id, &rf.name, rf.canonical_name.as_deref())
                .await?;
            if folder.sync_should_run && !self.folders.lock().await.contains_key(&folder.id) {
                self.spawn_folder(folder).await;
            }
        }
        Ok(())
    }

    async fn spawn_folder(&self, folder: crate::store::Folder) {
        let factory_session = self.factory.new_session(&self.account).await;
        let session = match factory_session {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    "account {} folder {} session acquisition failed: {err}",
                    self.account.id, folder.name
                );
                return;
            }
        };

        let stop = StopSignal::new();
        let heartbeat = HeartbeatHandle::new(
            self.heartbeat_store.clone(),
            self.account.id,
            folder.id,
        );
        let folder_id = folder.id;
        let mut engine = FolderEngine::new(
            session,
            self.store.clone(),
            self.blobstore.clone(),
            heartbeat,
            stop.clone(),
            self.account.clone(),
            folder,
            self.provider,
        )
        .with_retry_policy(RetryPolicy::default());
        if self.account.throttled {
            engine = engine.with_throttle(self.config.throttle);
        }

        let account_id = self.account.id;
        let handle = tokio::spawn(async move {
            if let Err(err) = engine.run().await {
                error!("folder engine (account {account_id}, folder {folder_id}) exited: {err}");
            }
        });
        self.folders
            .lock()
            .await
            .insert(folder_id, RunningFolder { stop, handle });
    }

    async fn stop_folder(&self, folder_id: FolderId) {
        if let Some(running) = self.folders.lock().await.remove(&folder_id) {
            running.stop.stop();
            let _ = running.handle.await;
        }
    }

    async fn stop_all_folders(&self) {
        let running: Vec<RunningFolder> = self.folders.lock().await.drain().map(|(_, v)| v).collect();
        for folder in &running {
            folder.stop.stop();
        }
        for folder in running {
            let _ = folder.handle.await;
        }
    }

    async fn reap_finished(&self) {
        self.folders.lock().await.retain(|_, running| !running.handle.is_finished());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::FsBlobStore;
    use crate::heartbeat::InMemoryHeartbeatStore;
    use crate::store::sqlite::SqliteStore;
    use crate::store::SyncState;

    struct StaticFactory {
        folders: Vec<RemoteFolder>,
    }

    #[async_trait]
    impl FolderSessionFactory for StaticFactory {
        type Session = crate::sync::session::mock::MockFolderSession;

        async fn list_folders(&self, _account: &Account) -> Result<Vec<RemoteFolder>, ImapError> {
            Ok(self.folders.clone())
        }

        async fn new_session(&self, _account: &Account) -> Result<Self::Session, ImapError> {
            Ok(crate::sync::session::mock::MockFolderSession::new(1))
        }
    }

    fn test_account() -> Account {
        Account {
            id: 1,
            namespace_id: 1,
            email_address: "a@example.com".to_string(),
            provider: "generic".to_string(),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            imap_user: "a@example.com".to_string(),
            imap_pass: "secret".to_string(),
            imap_use_tls: true,
            sync_host: None,
            desired_sync_host: None,
            sync_should_run: true,
            sync_state: SyncState::Running,
            last_error: None,
            throttled: false,
        }
    }

    #[tokio::test]
    async fn sync_folder_list_creates_and_spawns_new_folders() {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let blobstore = Arc::new(RawMimeStore::new(
            FsBlobStore::new(tempfile::tempdir().unwrap().into_path()),
            false,
        ));
        let factory = StaticFactory {
            folders: vec![RemoteFolder {
                name: "INBOX".to_string(),
                canonical_name: Some("inbox".to_string()),
            }],
        };
        let monitor = AccountMonitor::new(
            factory,
            store.clone(),
            blobstore,
            InMemoryHeartbeatStore::new(),
            StopSignal::new(),
            test_account(),
        );

        monitor.sync_folder_list().await.unwrap();
        let folders = store.list_folders(1).await.unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].name, "INBOX");
        assert_eq!(monitor.folders.lock().await.len(), 1);

        monitor.stop_all_folders().await;
    }

    #[tokio::test]
    async fn sync_folder_list_tombstones_vanished_folders() {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let blobstore = Arc::new(RawMimeStore::new(
            FsBlobStore::new(tempfile::tempdir().unwrap().into_path()),
            false,
        ));
        store
            .find_or_create_folder(1, "Archive", None)
            .await
            .unwrap();

        let factory = StaticFactory { folders: vec![] };
        let monitor = AccountMonitor::new(
            factory,
            store.clone(),
            blobstore,
            InMemoryHeartbeatStore::new(),
            StopSignal::new(),
            test_account(),
        );
        monitor.sync_folder_list().await.unwrap();

        let folders = store.list_folders(1).await.unwrap();
        assert!(folders.is_empty());
    }
}
