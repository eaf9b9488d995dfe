// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Folder sync engine (C5): one state machine per (account, folder), grounded
//! on `inbox/mailsync/backends/imap/generic.py`'s `FolderSyncEngine`.
//!
//! The source drives this with a `greenlet` per folder and raises
//! `UidInvalid` as an exception out of `crispin_client.select_folder`'s
//! callback; here the callback is replaced by `FolderSession::select` plus
//! an explicit comparison (`is_uid_invalid`), and `UidInvalid`/
//! `FolderMissing` are ordinary `ImapError` variants matched in `run()`
//! rather than caught.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::blobstore::{BlobStore, RawMimeStore};
use crate::heartbeat::HeartbeatHandle;
use crate::imap::error::ImapError;
use crate::provider::Provider;
use crate::retry::{Outcome, RetryPolicy};
use crate::store::{
    Account, EngineState, Folder, LocalStore, NamespaceId, NewMessage, RemoteFlags, StoreError,
    SyncStatus, Uid,
};

use super::constants;
use super::gmail;
use super::session::{is_uid_invalid, FetchedMessage, FolderSession};
use super::StopSignal;

/// Number of UIDs fetched per `fetch_messages`/`fetch_flags` round trip.
const DOWNLOAD_CHUNK_SIZE: usize = 25;

/// Gmail's All Mail folder only gets inbox-priority-ordered downloading once
/// it crosses this many undownloaded messages.
const LARGE_MAILBOX_THRESHOLD: usize = 1_000_000;

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub count: u32,
    pub wait: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            count: constants::DEFAULT_THROTTLE_COUNT,
            wait: constants::DEFAULT_THROTTLE_WAIT,
        }
    }
}

impl ThrottleConfig {
    /// No throttling: `download_and_persist` never pauses. The default for
    /// accounts whose `throttled` flag isn't set.
    pub fn disabled() -> Self {
        Self { count: 0, wait: Duration::from_secs(0) }
    }
}

enum RefreshDue {
    None,
    Fast,
    Slow,
}

/// Drives one folder through `initial` -> `poll`, handling UIDVALIDITY
/// resyncs, CONDSTORE/flags-refresh polling, and IDLE in between.
pub struct FolderEngine<S: FolderSession, B: BlobStore> {
    session: S,
    store: std::sync::Arc<dyn LocalStore>,
    blobstore: std::sync::Arc<RawMimeStore<B>>,
    heartbeat: HeartbeatHandle,
    stop: StopSignal,
    retry: RetryPolicy,
    throttle: ThrottleConfig,
    account: Account,
    folder: Folder,
    provider: Provider,
    /// In-process only (only the slow cadence is persisted, in
    /// `imap_folder_info.last_slow_refresh`): `None` forces a refresh on
    /// the first poll tick.
    last_fast_refresh: Mutex<Option<Instant>>,
    label_rename: gmail::LabelRenameHandler,
}

impl<S: FolderSession, B: BlobStore> FolderEngine<S, B> {
    pub fn new(
        session: S,
        store: std::sync::Arc<dyn LocalStore>,
        blobstore: std::sync::Arc<RawMimeStore<B>>,
        heartbeat: HeartbeatHandle,
        stop: StopSignal,
        account: Account,
        folder: Folder,
        provider: Provider,
    ) -> Self {
        Self {
            session,
            store,
            blobstore,
            heartbeat,
            stop,
            retry: RetryPolicy::default(),
            throttle: ThrottleConfig::disabled(),
            account,
            folder,
            provider,
            last_fast_refresh: Mutex::new(None),
            label_rename: gmail::LabelRenameHandler::new(),
        }
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn namespace_id(&self) -> NamespaceId {
        self.account.namespace_id
    }

    fn store_err(err: StoreError) -> ImapError {
        ImapError::Internal(err.to_string())
    }

    /// Drives the state machine until `stop()` is called, the folder
    /// transitions to `Finish` (deleted remotely, or UIDVALIDITY resyncs
    /// exhausted), or a non-retryable error surfaces.
    pub async fn run(&self) -> Result<(), ImapError> {
        loop {
            if self.stop.is_stopped() {
                self.heartbeat.publish("stopped").await;
                return Ok(());
            }

            let status = self.store.get_sync_status(self.folder.id).await.map_err(Self::store_err)?;
            if matches!(status.state, EngineState::Finish) {
                return Ok(());
            }
            if !status.sync_should_run {
                self.stop.wait(constants::DEFAULT_POLL_FREQUENCY).await;
                continue;
            }

            let is_initial_like = matches!(
                status.state,
                EngineState::Initial | EngineState::InitialUidInvalid | EngineState::PollUidInvalid
            );
            let label = if is_initial_like { "folder-initial" } else { "folder-poll" };

            let tick_result: Result<(), ImapError> = self
                .retry
                .run(label, || async {
                    let result = if is_initial_like {
                        self.run_initial(&status).await
                    } else {
                        self.run_poll(&status).await
                    };
                    match result {
                        Ok(()) => Outcome::Done(()),
                        Err(e) if e.is_transient() => Outcome::Retry(e),
                        Err(e) => Outcome::Fatal(e),
                    }
                })
                .await;

            match tick_result {
                Ok(()) => {
                    self.store
                        .update_sync_status(
                            self.folder.id,
                            self.account.id,
                            &SyncStatus {
                                folder_id: self.folder.id,
                                state: EngineState::Poll,
                                sync_should_run: true,
                                uidinvalid_count: status.uidinvalid_count,
                            },
                        )
                        .await
                        .map_err(Self::store_err)?;
                }
                Err(ImapError::UidInvalid { stored, remote, .. }) => {
                    warn!(
                        "folder {} UIDVALIDITY changed: stored={stored} remote={remote}",
                        self.folder.name
                    );
                    self.handle_uid_invalid(&status).await?;
                }
                Err(ImapError::HighestModSeqDecreased { stored, remote, .. }) => {
                    warn!(
                        "folder {} HIGHESTMODSEQ decreased: stored={stored} remote={remote}, forcing full resync",
                        self.folder.name
                    );
                    self.handle_uid_invalid(&status).await?;
                }
                Err(ImapError::FolderMissing(msg)) => {
                    info!("folder {} no longer exists remotely: {msg}", self.folder.name);
                    self.store
                        .update_sync_status(
                            self.folder.id,
                            self.account.id,
                            &SyncStatus {
                                folder_id: self.folder.id,
                                state: EngineState::Finish,
                                sync_should_run: false,
                                uidinvalid_count: status.uidinvalid_count,
                            },
                        )
                        .await
                        .map_err(Self::store_err)?;
                    self.heartbeat.clear().await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bounded by `MAX_UIDINVALID_RESYNCS`: past that point the
    /// folder is treated as permanently broken rather than resynced forever.
    async fn handle_uid_invalid(&self, status: &SyncStatus) -> Result<(), ImapError> {
        let new_count = status.uidinvalid_count + 1;
        if new_count > constants::MAX_UIDINVALID_RESYNCS {
            error!(
                "folder {} exceeded {} UIDVALIDITY resyncs, giving up",
                self.folder.name,
                constants::MAX_UIDINVALID_RESYNCS
            );
            self.store
                .update_sync_status(
                    self.folder.id,
                    self.account.id,
                    &SyncStatus {
                        folder_id: self.folder.id,
                        state: EngineState::Finish,
                        sync_should_run: false,
                        uidinvalid_count: new_count,
                    },
                )
                .await
                .map_err(Self::store_err)?;
            return Err(ImapError::FolderMissing(format!(
                "{}: exceeded {} UIDVALIDITY resyncs",
                self.folder.name,
                constants::MAX_UIDINVALID_RESYNCS
            )));
        }
        self.store
            .update_sync_status(
                self.folder.id,
                self.account.id,
                &SyncStatus {
                    folder_id: self.folder.id,
                    state: status.state.to_uidinvalid(),
                    sync_should_run: true,
                    uidinvalid_count: new_count,
                },
            )
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }

    /// Full sync: downloads every remote UID not yet stored locally and
    /// drops any locally-stored UID no longer present remotely. Used both
    /// for a folder's very first sync and every UIDVALIDITY resync, since
    /// a new UIDVALIDITY invalidates every previously-stored UID mapping.
    async fn run_initial(&self, _status: &SyncStatus) -> Result<(), ImapError> {
        let selected = self.select_and_check().await?;
        self.store
            .ensure_folder_info(self.account.id, self.folder.id, selected.uidvalidity, selected.uidnext)
            .await
            .map_err(Self::store_err)?;
        self.heartbeat.publish("initial").await;

        let remote_uids = self.session.all_uids().await?;
        let local_uids = self
            .store
            .local_uids(self.account.id, self.folder.id, None)
            .await
            .map_err(Self::store_err)?;

        let missing: HashSet<Uid> = remote_uids.difference(&local_uids).copied().collect();
        let extra: HashSet<Uid> = local_uids.difference(&remote_uids).copied().collect();

        let ordered = self.prioritize_downloads(missing).await?;
        self.download_and_persist(&ordered).await?;

        if !extra.is_empty() {
            self.store
                .remove_deleted_uids(self.account.id, self.folder.id, &extra)
                .await
                .map_err(Self::store_err)?;
        }

        self.store
            .set_uidvalidity(self.folder.id, selected.uidvalidity, selected.uidnext)
            .await
            .map_err(Self::store_err)?;
        self.store
            .set_highestmodseq(self.folder.id, selected.highest_mod_seq)
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }

    /// Incremental sync: new UIDs since last-seen, a CONDSTORE catch-up or
    /// periodic flags refresh, expunge detection, then IDLE/sleep.
    async fn run_poll(&self, _status: &SyncStatus) -> Result<(), ImapError> {
        let stored_modseq = self
            .store
            .get_folder_info(self.folder.id)
            .await
            .map_err(Self::store_err)?
            .and_then(|info| info.highestmodseq);

        let selected = self.select_and_check().await?;
        self.heartbeat.publish("poll").await;

        if let (Some(stored), Some(remote)) = (stored_modseq, selected.highest_mod_seq) {
            if remote < stored {
                return Err(ImapError::HighestModSeqDecreased {
                    folder: self.folder.name.clone(),
                    stored,
                    remote,
                });
            }
        }

        let lastseenuid = self
            .store
            .lastseenuid(self.account.id, self.folder.id)
            .await
            .map_err(Self::store_err)?;
        if selected.uidnext > lastseenuid + 1 {
            let new_uids = self.session.uids_greater_than(lastseenuid).await?;
            self.download_and_persist(&new_uids).await?;
        }

        match self.refresh_due().await {
            RefreshDue::None => {
                if self.session.capabilities().condstore {
                    // Catch up from the previously-stored high-water mark,
                    // not the value just selected, and only when it has
                    // actually advanced: CHANGEDSINCE with the current
                    // remote value would structurally return nothing.
                    if let Some(stored) = stored_modseq {
                        if selected.highest_mod_seq.map_or(false, |remote| remote > stored) {
                            self.condstore_catch_up(stored).await?;
                        }
                    }
                }
            }
            RefreshDue::Fast => self.full_flags_refresh(false).await?,
            RefreshDue::Slow => self.full_flags_refresh(true).await?,
        }

        self.store
            .set_uidnext(self.folder.id, selected.uidnext)
            .await
            .map_err(Self::store_err)?;
        self.store
            .set_highestmodseq(self.folder.id, selected.highest_mod_seq)
            .await
            .map_err(Self::store_err)?;

        self.wait_for_next_tick().await?;
        Ok(())
    }

    async fn select_and_check(&self) -> Result<super::session::SelectedFolder, ImapError> {
        let info = self.store.get_folder_info(self.folder.id).await.map_err(Self::store_err)?;
        let selected = self.session.select(&self.folder.name).await?;
        if let Some(info) = info {
            if is_uid_invalid(info.uidvalidity, selected.uidvalidity) {
                return Err(ImapError::UidInvalid {
                    folder: self.folder.name.clone(),
                    stored: info.uidvalidity,
                    remote: selected.uidvalidity,
                });
            }
        }
        Ok(selected)
    }

    /// Gmail's All Mail is the only folder that can realistically cross
    /// `LARGE_MAILBOX_THRESHOLD` undownloaded messages; at that scale
    /// downloading oldest-first would starve the Inbox view for weeks, so
    /// Inbox-labeled and last-30-day messages are prioritized.
    async fn prioritize_downloads(&self, missing: HashSet<Uid>) -> Result<Vec<Uid>, ImapError> {
        if !(self.provider.uses_gmail_extensions() && self.folder.role() == "all" && missing.len() >= LARGE_MAILBOX_THRESHOLD)
        {
            let mut ordered: Vec<Uid> = missing.into_iter().collect();
            ordered.sort_unstable();
            return Ok(ordered);
        }

        let inbox_labeled = self.session.uids_with_gmail_label("\\Inbox").await?;
        let since = Utc::now() - chrono::Duration::days(30);
        let recent = self.session.uids_since_internal_date(since).await?;

        let mut priority: Vec<Uid> = missing
            .iter()
            .copied()
            .filter(|u| inbox_labeled.contains(u) || recent.contains(u))
            .collect();
        priority.sort_unstable();
        let priority_set: HashSet<Uid> = priority.iter().copied().collect();

        let mut rest: Vec<Uid> = missing.into_iter().filter(|u| !priority_set.contains(u)).collect();
        rest.sort_unstable();

        info!(
            "folder {}: prioritizing {} of {} missing UIDs (inbox-labeled/last-30-days)",
            self.folder.name,
            priority.len(),
            priority.len() + rest.len()
        );

        priority.extend(rest);
        Ok(priority)
    }

    async fn download_and_persist(&self, uids: &[Uid]) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }
        let mut downloaded: u32 = 0;
        for chunk in uids.chunks(DOWNLOAD_CHUNK_SIZE) {
            if self.stop.is_stopped() {
                return Ok(());
            }
            let fetched = self.session.fetch_messages(chunk).await?;
            for msg in fetched {
                self.persist_message(msg).await?;
                downloaded += 1;
                if self.throttle.count > 0 && downloaded % self.throttle.count == 0 {
                    self.heartbeat.publish("throttled").await;
                    self.stop.wait(self.throttle.wait).await;
                }
            }
        }
        Ok(())
    }

    async fn persist_message(&self, msg: FetchedMessage) -> Result<(), ImapError> {
        let parsed = mail_parser::Message::parse(&msg.raw);
        let subject = parsed.as_ref().and_then(|m| m.subject()).map(|s| s.to_string());
        let in_reply_to = parsed
            .as_ref()
            .and_then(|m| m.header_raw("In-Reply-To"))
            .map(|s| s.trim().to_string());
        let references: Vec<String> = parsed
            .as_ref()
            .and_then(|m| m.header_raw("References"))
            .map(|s| s.split_whitespace().map(|id| id.to_string()).collect())
            .unwrap_or_default();

        let (data_sha256, _len) = self
            .blobstore
            .save_raw_mime(&msg.raw)
            .await
            .map_err(|e| ImapError::Io(e.to_string()))?;

        let new_message = NewMessage {
            uid: msg.uid,
            data_sha256,
            subject: subject.clone(),
            received_date: msg.internal_date,
            flags: RemoteFlags {
                is_seen: msg.is_seen,
                is_flagged: msg.is_flagged,
                labels: msg.labels.clone(),
            },
        };

        let namespace_id = self.namespace_id();
        let message_id = self
            .store
            .create_imap_message(self.account.id, namespace_id, &self.folder, &new_message)
            .await
            .map_err(Self::store_err)?;

        let thread_key = gmail::thread_key_for(
            self.provider,
            msg.gmail_thrid.as_deref(),
            in_reply_to.as_deref(),
            &references,
            subject.as_deref(),
        );
        let thread_id = match &thread_key {
            Some(key) => match self
                .store
                .thread_for_key(namespace_id, key, constants::MAX_THREAD_LENGTH)
                .await
                .map_err(Self::store_err)?
            {
                Some(id) => id,
                None => self
                    .store
                    .create_thread(namespace_id, Some(key), subject.as_deref())
                    .await
                    .map_err(Self::store_err)?,
            },
            None => self
                .store
                .create_thread(namespace_id, None, subject.as_deref())
                .await
                .map_err(Self::store_err)?,
        };
        self.store
            .attach_message_to_thread(message_id, thread_id)
            .await
            .map_err(Self::store_err)?;
        self.store
            .sync_message_categories(namespace_id, message_id, &self.folder, msg.labels.as_ref())
            .await
            .map_err(Self::store_err)?;
        Ok(())
    }

    /// `CHANGEDSINCE` catch-up, applied in `CONDSTORE_FLAGS_REFRESH_BATCH_SIZE`
    /// batches so a burst of remote flag changes can't block new-mail
    /// delivery for long.
    async fn condstore_catch_up(&self, modseq: u64) -> Result<(), ImapError> {
        let changed = self.session.fetch_flags_changed_since(modseq).await?;
        self.apply_flag_batches(changed).await
    }

    async fn full_flags_refresh(&self, is_slow: bool) -> Result<(), ImapError> {
        let remote_uids = self.session.all_uids().await?;
        let local_uids = self
            .store
            .local_uids(self.account.id, self.folder.id, None)
            .await
            .map_err(Self::store_err)?;

        let removed: HashSet<Uid> = local_uids.difference(&remote_uids).copied().collect();
        if !removed.is_empty() {
            self.store
                .remove_deleted_uids(self.account.id, self.folder.id, &removed)
                .await
                .map_err(Self::store_err)?;
        }

        let present: Vec<Uid> = local_uids.intersection(&remote_uids).copied().collect();
        let mut all_flags = Vec::with_capacity(present.len());
        for chunk in present.chunks(DOWNLOAD_CHUNK_SIZE) {
            all_flags.extend(self.session.fetch_flags(chunk).await?);
        }
        self.apply_flag_batches(all_flags).await?;

        *self.last_fast_refresh.lock().await = Some(Instant::now());
        if is_slow {
            self.store
                .set_last_slow_refresh(self.folder.id, Utc::now())
                .await
                .map_err(Self::store_err)?;
        }
        Ok(())
    }

    async fn apply_flag_batches(&self, changed: Vec<super::session::UidFlags>) -> Result<(), ImapError> {
        for batch in changed.chunks(constants::CONDSTORE_FLAGS_REFRESH_BATCH_SIZE as usize) {
            let mut new_flags = std::collections::HashMap::with_capacity(batch.len());
            for f in batch {
                new_flags.insert(
                    f.uid,
                    RemoteFlags {
                        is_seen: f.is_seen,
                        is_flagged: f.is_flagged,
                        labels: f.labels.clone(),
                    },
                );
            }
            self.store
                .update_metadata(self.account.id, self.folder.id, self.folder.role(), &new_flags)
                .await
                .map_err(Self::store_err)?;

            if self.provider.uses_gmail_extensions() {
                self.reconcile_label_changes(batch).await?;
            }
        }
        Ok(())
    }

    /// For each UID carrying a fresh label set, diffs it against the
    /// Category links already recorded for that Message. A clean one-label
    /// swap (the hallmark of a Gmail rename, per `LabelRenameHandler`'s
    /// doc) repoints the existing Category in place; anything else falls
    /// through to `sync_message_categories`'s normal add/remove reconciliation.
    async fn reconcile_label_changes(&self, batch: &[super::session::UidFlags]) -> Result<(), ImapError> {
        let namespace_id = self.namespace_id();
        for f in batch {
            let Some(new_labels) = &f.labels else { continue };
            let Some(message_id) = self
                .store
                .message_id_for_uid(self.account.id, self.folder.id, f.uid)
                .await
                .map_err(Self::store_err)?
            else {
                continue;
            };
            let old_labels = self.store.message_categories(message_id).await.map_err(Self::store_err)?;
            let diff = gmail::diff_labels(&old_labels, new_labels);
            if diff.added.is_empty() && diff.removed.is_empty() {
                continue;
            }
            if diff.added.len() == 1 && diff.removed.len() == 1 {
                let removed = diff.removed.iter().next().expect("len checked above");
                let added = diff.added.iter().next().expect("len checked above");
                self.label_rename
                    .handle_rename(self.store.as_ref(), namespace_id, removed, added)
                    .await
                    .map_err(Self::store_err)?;
            } else {
                self.store
                    .sync_message_categories(namespace_id, message_id, &self.folder, Some(new_labels))
                    .await
                    .map_err(Self::store_err)?;
            }
        }
        Ok(())
    }

    /// Small/medium folders (<= `SLOW_FLAGS_REFRESH_LIMIT` local UIDs) get a
    /// periodic full flags refresh on top of whatever CONDSTORE/UIDNEXT
    /// polling already catches, since IMAP servers vary in how reliably
    /// they report flag changes without it; folders above that size rely on
    /// CONDSTORE alone, or on UIDNEXT-based new-mail detection if the
    /// server doesn't support it.
    async fn refresh_due(&self) -> RefreshDue {
        let local_count = self
            .store
            .local_uids(self.account.id, self.folder.id, None)
            .await
            .map(|s| s.len())
            .unwrap_or(0);

        if local_count <= constants::FAST_FLAGS_REFRESH_LIMIT as usize {
            let last = *self.last_fast_refresh.lock().await;
            let due = match last {
                Some(t) => t.elapsed() >= constants::FAST_REFRESH_INTERVAL,
                None => true,
            };
            if due {
                return RefreshDue::Fast;
            }
        }

        if local_count <= constants::SLOW_FLAGS_REFRESH_LIMIT as usize {
            let info = self.store.get_folder_info(self.folder.id).await.ok().flatten();
            let due = match info.and_then(|i| i.last_slow_refresh) {
                Some(last) => Utc::now().signed_duration_since(last).num_seconds() as u64 >= constants::SLOW_REFRESH_INTERVAL.as_secs(),
                None => true,
            };
            if due {
                return RefreshDue::Slow;
            }
        }

        RefreshDue::None
    }

    /// IDLE on the Inbox when the server supports it; otherwise a jittered
    /// sleep at the provider's poll frequency (10s Inbox, 30s elsewhere).
    async fn wait_for_next_tick(&self) -> Result<(), ImapError> {
        let base_frequency = if self.folder.is_inbox() {
            constants::INBOX_POLL_FREQUENCY
        } else {
            constants::DEFAULT_POLL_FREQUENCY
        };

        if self.folder.is_inbox() && self.session.capabilities().idle {
            self.heartbeat.publish("idle").await;
            self.session.idle(constants::IDLE_WAIT).await?;
            return Ok(());
        }

        self.stop.wait(crate::retry::jitter(base_frequency)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::FsBlobStore;
    use crate::store::sqlite::SqliteStore;
    use crate::store::SyncState;
    use std::sync::Arc;

    use super::super::session::mock::{MockFolderSession, MockMessage};
    use sqlx::Row;

    async fn test_store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap())
    }

    fn test_account(id: i64) -> Account {
        Account {
            id,
            namespace_id: id,
            email_address: "user@example.com".to_string(),
            provider: "generic_imap".to_string(),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            imap_user: "user@example.com".to_string(),
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

    async fn test_engine(
        store: Arc<SqliteStore>,
        session: MockFolderSession,
        account: Account,
        folder: Folder,
    ) -> FolderEngine<MockFolderSession, FsBlobStore> {
        let blobstore = Arc::new(RawMimeStore::new(
            FsBlobStore::new(tempfile::tempdir().unwrap().into_path()),
            false,
        ));
        let heartbeat = HeartbeatHandle::new(crate::heartbeat::InMemoryHeartbeatStore::new(), account.id, folder.id);
        FolderEngine::new(
            session,
            store,
            blobstore,
            heartbeat,
            StopSignal::new(),
            account,
            folder,
            Provider::GenericImap,
        )
    }

    #[tokio::test]
    async fn initial_sync_downloads_all_messages_then_moves_to_poll() {
        let store = test_store().await;
        let account = test_account(1);
        let folder = store
            .find_or_create_folder(account.id, "INBOX", Some("inbox"))
            .await
            .unwrap();

        let session = MockFolderSession::new(100);
        session
            .insert(MockMessage {
                uid: 1,
                raw: b"Subject: hi\r\n\r\nbody".to_vec(),
                is_seen: false,
                ..Default::default()
            })
            .await;
        session
            .insert(MockMessage {
                uid: 2,
                raw: b"Subject: second\r\n\r\nbody2".to_vec(),
                is_seen: true,
                ..Default::default()
            })
            .await;

        let engine = test_engine(store.clone(), session, account.clone(), folder.clone()).await;
        let status = store.get_sync_status(folder.id).await.unwrap();
        assert_eq!(status.state, EngineState::Initial);

        engine.run_initial(&status).await.unwrap();

        let local = store.local_uids(account.id, folder.id, None).await.unwrap();
        assert_eq!(local.len(), 2);
        let info = store.get_folder_info(folder.id).await.unwrap().unwrap();
        assert_eq!(info.uidvalidity, 100);
    }

    #[tokio::test]
    async fn reconcile_label_changes_detects_rename_and_repoints_category() {
        let store = test_store().await;
        let account = test_account(1);
        let folder = store
            .find_or_create_folder(account.id, "INBOX", Some("inbox"))
            .await
            .unwrap();

        let session = MockFolderSession::new(100);
        let blobstore = Arc::new(RawMimeStore::new(
            FsBlobStore::new(tempfile::tempdir().unwrap().into_path()),
            false,
        ));
        let heartbeat = HeartbeatHandle::new(crate::heartbeat::InMemoryHeartbeatStore::new(), account.id, folder.id);
        let engine = FolderEngine::new(
            session,
            store.clone(),
            blobstore,
            heartbeat,
            StopSignal::new(),
            account.clone(),
            folder.clone(),
            Provider::Gmail,
        );

        let old_labels: HashSet<String> = ["Project X".to_string()].into_iter().collect();
        let message_id = store
            .create_imap_message(
                account.id,
                account.namespace_id,
                &folder,
                &NewMessage {
                    uid: 1,
                    data_sha256: "sha-rename".to_string(),
                    subject: None,
                    received_date: None,
                    flags: RemoteFlags { is_seen: false, is_flagged: false, labels: Some(old_labels.clone()) },
                },
            )
            .await
            .unwrap();
        store
            .sync_message_categories(account.namespace_id, message_id, &folder, Some(&old_labels))
            .await
            .unwrap();

        let new_labels: HashSet<String> = ["Project Y".to_string()].into_iter().collect();
        let batch = vec![super::session::UidFlags {
            uid: 1,
            is_seen: false,
            is_flagged: false,
            modseq: None,
            labels: Some(new_labels.clone()),
        }];
        engine.reconcile_label_changes(&batch).await.unwrap();

        let current = store.message_categories(message_id).await.unwrap();
        assert_eq!(current, new_labels);

        let rows = sqlx::query("SELECT COUNT(*) as c FROM categories WHERE namespace_id = ?")
            .bind(account.namespace_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows.get::<i64, _>("c"), 1);
    }

    #[tokio::test]
    async fn select_and_check_flags_uidvalidity_change() {
        let store = test_store().await;
        let account = test_account(1);
        let folder = store
            .find_or_create_folder(account.id, "INBOX", Some("inbox"))
            .await
            .unwrap();
        store.ensure_folder_info(account.id, folder.id, 100, 1).await.unwrap();

        let session = MockFolderSession::new(200);
        let engine = test_engine(store, session, account, folder).await;

        let err = engine.select_and_check().await.unwrap_err();
        assert!(matches!(err, ImapError::UidInvalid { stored: 100, remote: 200, .. }));
    }

    #[tokio::test]
    async fn poll_detects_new_uid_since_lastseenuid() {
        let store = test_store().await;
        let account = test_account(1);
        let folder = store
            .find_or_create_folder(account.id, "INBOX", Some("inbox"))
            .await
            .unwrap();

        let session = MockFolderSession::new(100);
        session
            .insert(MockMessage {
                uid: 1,
                raw: b"Subject: hi\r\n\r\nbody".to_vec(),
                ..Default::default()
            })
            .await;
        let engine = test_engine(store.clone(), session, account.clone(), folder.clone()).await;
        let status = store.get_sync_status(folder.id).await.unwrap();
        engine.run_initial(&status).await.unwrap();

        engine
            .session
            .insert(MockMessage {
                uid: 2,
                raw: b"Subject: later\r\n\r\nbody2".to_vec(),
                ..Default::default()
            })
            .await;

        let status = store.get_sync_status(folder.id).await.unwrap();
        engine.run_poll(&status).await.unwrap();

        let local = store.local_uids(account.id, folder.id, None).await.unwrap();
        assert_eq!(local.len(), 2);
    }

    #[tokio::test]
    async fn handle_uid_invalid_stops_after_max_resyncs() {
        let store = test_store().await;
        let account = test_account(1);
        let folder = store
            .find_or_create_folder(account.id, "INBOX", Some("inbox"))
            .await
            .unwrap();
        let session = MockFolderSession::new(100);
        let engine = test_engine(store.clone(), session, account.clone(), folder.clone()).await;

        let mut status = SyncStatus {
            folder_id: folder.id,
            state: EngineState::Poll,
            sync_should_run: true,
            uidinvalid_count: constants::MAX_UIDINVALID_RESYNCS,
        };
        let err = engine.handle_uid_invalid(&status).await.unwrap_err();
        assert!(matches!(err, ImapError::FolderMissing(_)));
        status = store.get_sync_status(folder.id).await.unwrap();
        assert_eq!(status.state, EngineState::Finish);
        assert!(!status.sync_should_run);
    }
}
