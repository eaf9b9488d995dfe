// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Local store adapter (C3): transactional persistence for accounts,
//! namespaces, folders, messages, and the syncback action log, grounded on
//! `inbox/mailsync/backends/imap/common.py` and the broader `inbox.models`
//! package referenced throughout `generic.py`.

pub mod sqlite;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AccountId = i64;
pub type FolderId = i64;
pub type MessageId = i64;
pub type ThreadId = i64;
pub type NamespaceId = i64;
pub type Uid = u32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Running,
    Invalid,
    Stopped,
    MarkedForDeletion,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Running => "running",
            SyncState::Invalid => "invalid",
            SyncState::Stopped => "stopped",
            SyncState::MarkedForDeletion => "marked_for_deletion",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "invalid" => SyncState::Invalid,
            "stopped" => SyncState::Stopped,
            "marked_for_deletion" => SyncState::MarkedForDeletion,
            _ => SyncState::Running,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub namespace_id: NamespaceId,
    pub email_address: String,
    pub provider: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_user: String,
    pub imap_pass: String,
    pub imap_use_tls: bool,
    pub sync_host: Option<String>,
    pub desired_sync_host: Option<String>,
    pub sync_should_run: bool,
    pub sync_state: SyncState,
    pub last_error: Option<String>,
    pub throttled: bool,
}

#[derive(Debug, Clone)]
pub struct Folder {
    pub id: FolderId,
    pub account_id: AccountId,
    pub name: String,
    pub canonical_name: Option<String>,
    pub sync_should_run: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Folder {
    pub fn is_inbox(&self) -> bool {
        self.canonical_name.as_deref() == Some("inbox")
            || self.name.eq_ignore_ascii_case("inbox")
    }

    pub fn role(&self) -> &str {
        self.canonical_name.as_deref().unwrap_or("none")
    }
}

#[derive(Debug, Clone)]
pub struct ImapFolderInfo {
    pub folder_id: FolderId,
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub highestmodseq: Option<u64>,
    pub last_slow_refresh: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initial,
    InitialUidInvalid,
    Poll,
    PollUidInvalid,
    Finish,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Initial => "initial",
            EngineState::InitialUidInvalid => "initial_uidinvalid",
            EngineState::Poll => "poll",
            EngineState::PollUidInvalid => "poll_uidinvalid",
            EngineState::Finish => "finish",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "initial_uidinvalid" => EngineState::InitialUidInvalid,
            "poll" => EngineState::Poll,
            "poll_uidinvalid" => EngineState::PollUidInvalid,
            "finish" => EngineState::Finish,
            _ => EngineState::Initial,
        }
    }

    /// `_uidinvalid` appended to the current state.
    pub fn to_uidinvalid(self) -> Self {
        match self {
            EngineState::Initial | EngineState::InitialUidInvalid => {
                EngineState::InitialUidInvalid
            }
            _ => EngineState::PollUidInvalid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub folder_id: FolderId,
    pub state: EngineState,
    pub sync_should_run: bool,
    pub uidinvalid_count: u32,
}

/// New-UID flags/labels as observed on the wire, prior to persistence.
#[derive(Debug, Clone, Default)]
pub struct RemoteFlags {
    pub is_seen: bool,
    pub is_flagged: bool,
    /// `None` for non-Gmail providers (no label concept); `Some(set)` for
    /// Gmail, including the empty set (labels explicitly cleared).
    pub labels: Option<HashSet<String>>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub uid: Uid,
    pub data_sha256: String,
    pub subject: Option<String>,
    pub received_date: Option<DateTime<Utc>>,
    pub flags: RemoteFlags,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub namespace_id: NamespaceId,
    pub thread_id: Option<ThreadId>,
    pub data_sha256: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_draft: bool,
    pub version: i64,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// The local store adapter's operation surface. Every implementation must
/// scope a unit of work to a single transaction and chunk long operations,
/// committing each batch (e.g. 200-UID condstore catch-up batches).
#[async_trait]
pub trait LocalStore: Send + Sync {
    // --- Accounts / scheduler support -----------------------------------
    async fn get_account(&self, account_id: AccountId) -> Result<Account, StoreError>;
    async fn list_active_accounts(&self) -> Result<Vec<Account>, StoreError>;
    /// Accounts owned, desired, or unclaimed-and-eligible for
    /// `process_identifier` (excluding accounts mid-release to another
    /// process).
    async fn account_ids_to_sync(&self, process_identifier: &str) -> Result<HashSet<AccountId>, StoreError>;
    async fn account_ids_owned(&self, process_identifier: &str) -> Result<HashSet<AccountId>, StoreError>;
    /// Claims the account under a row lock iff still unclaimed by anyone
    /// else and desired-for or free-for this process. Returns `true` if
    /// claimed.
    async fn claim_account(&self, account_id: AccountId, process_identifier: &str) -> Result<bool, StoreError>;
    /// Releases ownership iff currently owned by `process_identifier`.
    /// Returns `true` if this call actually cleared it.
    async fn release_account(&self, account_id: AccountId, process_identifier: &str) -> Result<bool, StoreError>;
    async fn mark_account_invalid(&self, account_id: AccountId, error: &str) -> Result<(), StoreError>;

    // --- Folders -----------------------------------------------------------
    async fn list_folders(&self, account_id: AccountId) -> Result<Vec<Folder>, StoreError>;
    async fn find_or_create_folder(
        &self,
        account_id: AccountId,
        name: &str,
        canonical_name: Option<&str>,
    ) -> Result<Folder, StoreError>;
    async fn delete_folder(&self, folder_id: FolderId) -> Result<(), StoreError>;
    async fn get_folder_info(&self, folder_id: FolderId) -> Result<Option<ImapFolderInfo>, StoreError>;
    async fn ensure_folder_info(
        &self,
        account_id: AccountId,
        folder_id: FolderId,
        uidvalidity: u32,
        uidnext: u32,
    ) -> Result<ImapFolderInfo, StoreError>;
    async fn set_uidvalidity(&self, folder_id: FolderId, uidvalidity: u32, uidnext: u32) -> Result<(), StoreError>;
    async fn set_uidnext(&self, folder_id: FolderId, uidnext: u32) -> Result<(), StoreError>;
    async fn set_highestmodseq(&self, folder_id: FolderId, highestmodseq: Option<u64>) -> Result<(), StoreError>;
    async fn set_last_slow_refresh(&self, folder_id: FolderId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn get_sync_status(&self, folder_id: FolderId) -> Result<SyncStatus, StoreError>;
    async fn update_sync_status(&self, folder_id: FolderId, account_id: AccountId, status: &SyncStatus) -> Result<(), StoreError>;

    // --- UIDs / messages ----------------------------------------------------
    async fn local_uids(&self, account_id: AccountId, folder_id: FolderId, limit: Option<u32>) -> Result<HashSet<Uid>, StoreError>;
    async fn lastseenuid(&self, account_id: AccountId, folder_id: FolderId) -> Result<Uid, StoreError>;

    /// Creates a Message (deduping on `data_sha256` within the namespace)
    /// plus its owning ImapUid, then recomputes message metadata. Returns
    /// the new ImapUid's row id.
    async fn create_imap_message(
        &self,
        account_id: AccountId,
        namespace_id: NamespaceId,
        folder: &Folder,
        msg: &NewMessage,
    ) -> Result<MessageId, StoreError>;

    /// Applies flag/label changes for the given uids in folder, chunked by
    /// the caller into batches, each committed separately.
    async fn update_metadata(
        &self,
        account_id: AccountId,
        folder_id: FolderId,
        folder_role: &str,
        new_flags: &HashMap<Uid, RemoteFlags>,
    ) -> Result<u32, StoreError>;

    /// Removes UIDs no longer present remotely. Drafts with no remaining
    /// UIDs are hard-deleted synchronously (and their Thread if emptied);
    /// other messages are tombstoned (`deleted_at`) for the Delete handler.
    async fn remove_deleted_uids(&self, account_id: AccountId, folder_id: FolderId, uids: &HashSet<Uid>) -> Result<u32, StoreError>;

    // --- Delete handler (C7) -------------------------------------------------
    async fn dangling_messages(&self, namespace_id: NamespaceId, older_than: DateTime<Utc>, limit: u32) -> Result<Vec<Message>, StoreError>;
    async fn undelete_message(&self, message_id: MessageId) -> Result<(), StoreError>;
    async fn hard_delete_message(&self, message_id: MessageId) -> Result<Option<String>, StoreError>;
    async fn sha256_still_referenced(&self, namespace_id: NamespaceId, sha256: &str) -> Result<bool, StoreError>;
    async fn gc_deleted_categories(&self, namespace_id: NamespaceId) -> Result<u32, StoreError>;
    async fn gc_deleted_threads(&self, namespace_id: NamespaceId, older_than: DateTime<Utc>) -> Result<u32, StoreError>;

    // --- ActionLog / syncback (C9) --------------------------------------------
    async fn pending_namespaces(&self, limit: usize) -> Result<Vec<NamespaceId>, StoreError>;
    async fn pending_action_log(&self, namespace_id: NamespaceId, limit: u32) -> Result<Vec<ActionLogEntry>, StoreError>;
    async fn mark_action_successful(&self, id: i64) -> Result<(), StoreError>;
    async fn mark_action_failed(&self, id: i64) -> Result<(), StoreError>;
    async fn increment_action_retries(&self, id: i64) -> Result<u32, StoreError>;
    async fn had_recent_move_action(&self, namespace_id: NamespaceId, record_id: i64, within_secs: i64) -> Result<bool, StoreError>;
    /// Marks every still-pending action_log entry for `(namespace_id,
    /// record_id)` other than `except_id` as `failed`. Used to cascade a
    /// `create_event` exhaustion onto the rest of that event's queued
    /// actions. Returns the number of entries cascaded.
    async fn cascade_fail_pending_actions(&self, namespace_id: NamespaceId, record_id: i64, except_id: i64) -> Result<u32, StoreError>;
    /// Soft-deletes the local Event row backing a `create_event` action once
    /// its retries are exhausted.
    async fn tombstone_event(&self, event_id: i64) -> Result<(), StoreError>;

    // --- Transactions --------------------------------------------------------
    async fn append_transaction(&self, namespace_id: NamespaceId, object_type: &str, record_id: i64, command: &str) -> Result<(), StoreError>;

    // --- Threads (C5 Gmail/generic threading) --------------------------------
    /// The most recent non-full (`< max_len` messages) Thread for
    /// `thread_key`, if any. `None` means the caller should create a new
    /// Thread (either no Thread shares this key yet, or the most recent one
    /// has reached the bound).
    async fn thread_for_key(&self, namespace_id: NamespaceId, thread_key: &str, max_len: usize) -> Result<Option<ThreadId>, StoreError>;
    async fn create_thread(&self, namespace_id: NamespaceId, thread_key: Option<&str>, subject: Option<&str>) -> Result<ThreadId, StoreError>;
    async fn attach_message_to_thread(&self, message_id: MessageId, thread_id: ThreadId) -> Result<(), StoreError>;

    // --- Categories (derived from folders/labels) ----------------------------
    /// Materializes the Category set a message belongs to: for generic IMAP,
    /// the single category backing `folder`; for Gmail (`labels` is
    /// `Some`), one category per label, replacing whatever set was linked
    /// before.
    async fn sync_message_categories(
        &self,
        namespace_id: NamespaceId,
        message_id: MessageId,
        folder: &Folder,
        labels: Option<&HashSet<String>>,
    ) -> Result<(), StoreError>;

    /// Renames a Category in place (Gmail label rename: the server reports
    /// a rename as a new label applied to the same UIDs, so
    /// `LabelRenameHandler` detects it and repoints the existing Category
    /// row rather than creating a new one and losing its message links).
    async fn rename_category(&self, namespace_id: NamespaceId, old_display_name: &str, new_display_name: &str) -> Result<(), StoreError>;

    /// The non-tombstoned Category display names currently linked to a
    /// message, for diffing against freshly-polled remote labels.
    async fn message_categories(&self, message_id: MessageId) -> Result<HashSet<String>, StoreError>;

    /// The Message a UID currently points at, if the UID is still tracked.
    async fn message_id_for_uid(&self, account_id: AccountId, folder_id: FolderId, uid: Uid) -> Result<Option<MessageId>, StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: i64,
    pub namespace_id: NamespaceId,
    pub account_id: AccountId,
    pub table_name: String,
    pub record_id: i64,
    pub action: String,
    pub extra_args: Option<serde_json::Value>,
    pub status: String,
    pub retries: u32,
    pub discriminator: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
}
