// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Delete handler (C7): one per namespace, sweeping tombstoned Messages
//! past their grace period into a hard delete, then garbage-collecting the
//! Categories and Threads that delete left orphaned. Grounded on
//! `inbox/transactions/actions.py`'s purge pass and `inbox/util/blockstore.py`'s
//! reference-counted blob cleanup.
//!
//! A Message is tombstoned (`deleted_at` set), not removed, the moment its
//! last `ImapUid` disappears (`remove_deleted_uids`), so a UID that
//! reappears within the grace period before this sweeps it away costs
//! nothing more than a fresh row on redownload. `undelete_message` on
//! [`LocalStore`] exists for that recovery path and for syncback's own
//! undo-delete action; this sweep only ever moves forward.

use std::time::Duration;

use chrono::Utc;
use log::{info, warn};

use crate::blobstore::{BlobStore, RawMimeStore};
use crate::store::{LocalStore, NamespaceId, StoreError};

use super::StopSignal;

/// Grace period before a tombstoned Message is hard-deleted.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(120);
/// Grace period before an emptied Thread is hard-deleted.
pub const DEFAULT_THREAD_TTL: Duration = Duration::from_secs(604_800);
/// Upper bound on how many dangling Messages one sweep pulls at a time.
pub const MAX_FETCH: u32 = 1000;

#[derive(Debug, Clone, Copy)]
pub struct DeleteHandlerConfig {
    pub message_ttl: Duration,
    pub thread_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_fetch: u32,
}

impl Default for DeleteHandlerConfig {
    fn default() -> Self {
        Self {
            message_ttl: DEFAULT_MESSAGE_TTL,
            thread_ttl: DEFAULT_THREAD_TTL,
            sweep_interval: Duration::from_secs(60),
            max_fetch: MAX_FETCH,
        }
    }
}

pub struct DeleteHandler<B: BlobStore> {
    store: std::sync::Arc<dyn LocalStore>,
    blobstore: std::sync::Arc<RawMimeStore<B>>,
    stop: StopSignal,
    namespace_id: NamespaceId,
    config: DeleteHandlerConfig,
}

impl<B: BlobStore> DeleteHandler<B> {
    pub fn new(
        store: std::sync::Arc<dyn LocalStore>,
        blobstore: std::sync::Arc<RawMimeStore<B>>,
        stop: StopSignal,
        namespace_id: NamespaceId,
        config: DeleteHandlerConfig,
    ) -> Self {
        Self {
            store,
            blobstore,
            stop,
            namespace_id,
            config,
        }
    }

    pub async fn run(&self) -> Result<(), StoreError> {
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            if let Err(err) = self.sweep_once().await {
                warn!("delete handler sweep failed for namespace {}: {err}", self.namespace_id);
            }
            self.stop.wait(self.config.sweep_interval).await;
        }
    }

    /// One pass: hard-deletes every Message tombstoned longer than
    /// `message_ttl`, garbage-collects blobs no Message references anymore,
    /// then garbage-collects Categories and Threads left empty.
    pub async fn sweep_once(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.message_ttl).unwrap_or_default();
        let dangling = self
            .store
            .dangling_messages(self.namespace_id, cutoff, self.config.max_fetch)
            .await?;
        if dangling.is_empty() {
            return Ok(());
        }

        let mut hard_deleted = 0u32;
        let mut orphaned_blobs = Vec::new();
        for msg in &dangling {
            if let Some(sha256) = self.store.hard_delete_message(msg.id).await? {
                hard_deleted += 1;
                if !self.store.sha256_still_referenced(self.namespace_id, &sha256).await? {
                    orphaned_blobs.push(sha256);
                }
            }
        }
        if !orphaned_blobs.is_empty() {
            self.blobstore.inner().delete_many(&orphaned_blobs).await.unwrap_or_else(|err| {
                warn!("blobstore gc failed for namespace {}: {err}", self.namespace_id);
            });
        }

        let gc_categories = self.store.gc_deleted_categories(self.namespace_id).await?;
        let thread_cutoff = Utc::now() - chrono::Duration::from_std(self.config.thread_ttl).unwrap_or_default();
        let gc_threads = self.store.gc_deleted_threads(self.namespace_id, thread_cutoff).await?;

        info!(
            "delete handler: namespace={} hard_deleted={hard_deleted} blobs_gc={} categories_gc={gc_categories} threads_gc={gc_threads}",
            self.namespace_id,
            orphaned_blobs.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::FsBlobStore;
    use crate::store::sqlite::SqliteStore;
    use crate::store::{NewMessage, RemoteFlags};

    async fn test_handler() -> (DeleteHandler<FsBlobStore>, std::sync::Arc<SqliteStore>) {
        let store = std::sync::Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let blobstore = std::sync::Arc::new(RawMimeStore::new(
            FsBlobStore::new(tempfile::tempdir().unwrap().into_path()),
            false,
        ));
        let handler = DeleteHandler::new(
            store.clone(),
            blobstore,
            StopSignal::new(),
            1,
            DeleteHandlerConfig {
                message_ttl: Duration::from_secs(0),
                ..Default::default()
            },
        );
        (handler, store)
    }

    #[tokio::test]
    async fn sweep_hard_deletes_tombstoned_messages_past_ttl() {
        let (handler, store) = test_handler().await;
        let folder = store.find_or_create_folder(1, "INBOX", Some("inbox")).await.unwrap();
        let message_id = store
            .create_imap_message(
                1,
                1,
                &folder,
                &NewMessage {
                    uid: 1,
                    data_sha256: "deadbeef".to_string(),
                    subject: Some("hi".to_string()),
                    received_date: None,
                    flags: RemoteFlags::default(),
                },
            )
            .await
            .unwrap();

        let mut uids = std::collections::HashSet::new();
        uids.insert(1u32);
        store.remove_deleted_uids(1, folder.id, &uids).await.unwrap();

        handler.sweep_once().await.unwrap();

        let dangling = store
            .dangling_messages(1, Utc::now(), 100)
            .await
            .unwrap();
        assert!(dangling.iter().all(|m| m.id != message_id));
    }
}
