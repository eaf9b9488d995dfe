// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! `sqlx`-backed implementation of [`LocalStore`], generalizing
//! `src/bin/sync.rs`'s single-purpose email cache to the full entity model.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::{Row, Sqlite, SqlitePool, Transaction as SqlxTx};

use super::{
    Account, ActionLogEntry, EngineState, Folder, ImapFolderInfo, LocalStore, Message,
    NamespaceId, NewMessage, RemoteFlags, StoreError, SyncStatus,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            StoreError::Database(sqlx::Error::Migrate(Box::new(e)))
        })?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> Account {
        Account {
            id: row.get("id"),
            namespace_id: row.get("namespace_id"),
            email_address: row.get("email_address"),
            provider: row.get("provider"),
            imap_host: row.get("imap_host"),
            imap_port: row.get::<i64, _>("imap_port") as u16,
            imap_user: row.get("imap_user"),
            imap_pass: row.get("imap_pass"),
            imap_use_tls: row.get("imap_use_tls"),
            sync_host: row.get("sync_host"),
            desired_sync_host: row.get("desired_sync_host"),
            sync_should_run: row.get("sync_should_run"),
            sync_state: super::SyncState::parse(&row.get::<String, _>("sync_state")),
            last_error: row.get("last_error"),
            throttled: row.get("throttled"),
        }
    }

    fn row_to_folder(row: &sqlx::sqlite::SqliteRow) -> Folder {
        Folder {
            id: row.get("id"),
            account_id: row.get("account_id"),
            name: row.get("name"),
            canonical_name: row.get("canonical_name"),
            sync_should_run: row.get("sync_should_run"),
            deleted_at: row.get("deleted_at"),
        }
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get_account(&self, account_id: super::AccountId) -> Result<Account, StoreError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))?;
        Ok(Self::row_to_account(&row))
    }

    async fn list_active_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE sync_should_run = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_account).collect())
    }

    async fn account_ids_to_sync(&self, process_identifier: &str) -> Result<HashSet<super::AccountId>, StoreError> {
        // The three allowed ownership combinations, per service.py's
        // `account_ids_to_sync`. A fourth combination (desired=other,
        // host=me) is deliberately excluded: that account is mid-release to
        // another process and this process must not pick it back up.
        let rows = sqlx::query(
            "SELECT id FROM accounts WHERE sync_should_run = 1 AND (
                (desired_sync_host = ? AND sync_host IS NULL) OR
                (desired_sync_host IS NULL AND sync_host = ?) OR
                (desired_sync_host = ? AND sync_host = ?)
            )",
        )
        .bind(process_identifier)
        .bind(process_identifier)
        .bind(process_identifier)
        .bind(process_identifier)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    async fn account_ids_owned(&self, process_identifier: &str) -> Result<HashSet<super::AccountId>, StoreError> {
        let rows = sqlx::query("SELECT id FROM accounts WHERE sync_host = ?")
            .bind(process_identifier)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    async fn claim_account(&self, account_id: super::AccountId, process_identifier: &str) -> Result<bool, StoreError> {
        let mut tx: SqlxTx<'_, Sqlite> = self.pool.begin().await?;
        // `SELECT ... FOR UPDATE` in the reference implementation; sqlite has
        // no row locks, but a write transaction serializes concurrent claim
        // attempts.
        let row = sqlx::query("SELECT sync_host, desired_sync_host, sync_should_run FROM accounts WHERE id = ?")
            .bind(account_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let sync_should_run: bool = row.get("sync_should_run");
        let sync_host: Option<String> = row.get("sync_host");
        let desired_sync_host: Option<String> = row.get("desired_sync_host");

        if !sync_should_run {
            return Ok(false);
        }
        if let Some(desired) = &desired_sync_host {
            if desired != process_identifier {
                return Ok(false);
            }
        }
        if let Some(owner) = &sync_host {
            if owner != process_identifier {
                return Ok(false);
            }
            // Already owned by us; idempotent no-op success.
            tx.commit().await?;
            return Ok(true);
        }

        sqlx::query("UPDATE accounts SET sync_host = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(process_identifier)
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("claimed account {account_id} for {process_identifier}");
        Ok(true)
    }

    async fn release_account(&self, account_id: super::AccountId, process_identifier: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE accounts SET sync_host = NULL, updated_at = CURRENT_TIMESTAMP WHERE id = ? AND sync_host = ?",
        )
        .bind(account_id)
        .bind(process_identifier)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_account_invalid(&self, account_id: super::AccountId, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE accounts SET sync_state = 'invalid', last_error = ?, sync_should_run = 0, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(error)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_folders(&self, account_id: super::AccountId) -> Result<Vec<Folder>, StoreError> {
        let rows = sqlx::query("SELECT * FROM folders WHERE account_id = ? AND deleted_at IS NULL")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_folder).collect())
    }

    async fn find_or_create_folder(
        &self,
        account_id: super::AccountId,
        name: &str,
        canonical_name: Option<&str>,
    ) -> Result<Folder, StoreError> {
        if let Some(row) = sqlx::query("SELECT * FROM folders WHERE account_id = ? AND name = ?")
            .bind(account_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Self::row_to_folder(&row));
        }
        sqlx::query("INSERT INTO folders (account_id, name, canonical_name) VALUES (?, ?, ?)")
            .bind(account_id)
            .bind(name)
            .bind(canonical_name)
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT * FROM folders WHERE account_id = ? AND name = ?")
            .bind(account_id)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(Self::row_to_folder(&row))
    }

    async fn delete_folder(&self, folder_id: super::FolderId) -> Result<(), StoreError> {
        sqlx::query("UPDATE folders SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_folder_info(&self, folder_id: super::FolderId) -> Result<Option<ImapFolderInfo>, StoreError> {
        let row = sqlx::query("SELECT * FROM imap_folder_info WHERE folder_id = ?")
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ImapFolderInfo {
            folder_id: r.get("folder_id"),
            uidvalidity: r.get::<i64, _>("uidvalidity") as u32,
            uidnext: r.get::<i64, _>("uidnext") as u32,
            highestmodseq: r.get::<Option<i64>, _>("highestmodseq").map(|v| v as u64),
            last_slow_refresh: r.get("last_slow_refresh"),
        }))
    }

    async fn ensure_folder_info(
        &self,
        account_id: super::AccountId,
        folder_id: super::FolderId,
        uidvalidity: u32,
        uidnext: u32,
    ) -> Result<ImapFolderInfo, StoreError> {
        if let Some(info) = self.get_folder_info(folder_id).await? {
            return Ok(info);
        }
        sqlx::query(
            "INSERT INTO imap_folder_info (account_id, folder_id, uidvalidity, uidnext) VALUES (?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(folder_id)
        .bind(uidvalidity as i64)
        .bind(uidnext as i64)
        .execute(&self.pool)
        .await?;
        Ok(ImapFolderInfo {
            folder_id,
            uidvalidity,
            uidnext,
            highestmodseq: None,
            last_slow_refresh: None,
        })
    }

    async fn set_uidvalidity(&self, folder_id: super::FolderId, uidvalidity: u32, uidnext: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE imap_folder_info SET uidvalidity = ?, uidnext = ?, highestmodseq = NULL WHERE folder_id = ?")
            .bind(uidvalidity as i64)
            .bind(uidnext as i64)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_uidnext(&self, folder_id: super::FolderId, uidnext: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE imap_folder_info SET uidnext = ? WHERE folder_id = ?")
            .bind(uidnext as i64)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_highestmodseq(&self, folder_id: super::FolderId, highestmodseq: Option<u64>) -> Result<(), StoreError> {
        sqlx::query("UPDATE imap_folder_info SET highestmodseq = ? WHERE folder_id = ?")
            .bind(highestmodseq.map(|v| v as i64))
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_last_slow_refresh(&self, folder_id: super::FolderId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE imap_folder_info SET last_slow_refresh = ? WHERE folder_id = ?")
            .bind(at)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_sync_status(&self, folder_id: super::FolderId) -> Result<SyncStatus, StoreError> {
        let row = sqlx::query("SELECT * FROM imap_folder_sync_status WHERE folder_id = ?")
            .bind(folder_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => SyncStatus {
                folder_id,
                state: EngineState::parse(&r.get::<String, _>("state")),
                sync_should_run: r.get("sync_should_run"),
                uidinvalid_count: r.get::<i64, _>("uidinvalid_count") as u32,
            },
            None => SyncStatus {
                folder_id,
                state: EngineState::Initial,
                sync_should_run: true,
                uidinvalid_count: 0,
            },
        })
    }

    async fn update_sync_status(&self, folder_id: super::FolderId, account_id: super::AccountId, status: &SyncStatus) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO imap_folder_sync_status (account_id, folder_id, state, sync_should_run, uidinvalid_count, updated_at)
             VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(folder_id) DO UPDATE SET
               state = excluded.state,
               sync_should_run = excluded.sync_should_run,
               uidinvalid_count = excluded.uidinvalid_count,
               updated_at = CURRENT_TIMESTAMP",
        )
        .bind(account_id)
        .bind(folder_id)
        .bind(status.state.as_str())
        .bind(status.sync_should_run)
        .bind(status.uidinvalid_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn local_uids(&self, account_id: super::AccountId, folder_id: super::FolderId, limit: Option<u32>) -> Result<HashSet<super::Uid>, StoreError> {
        let rows = if let Some(limit) = limit {
            sqlx::query("SELECT msg_uid FROM imap_uids WHERE account_id = ? AND folder_id = ? ORDER BY msg_uid DESC LIMIT ?")
                .bind(account_id)
                .bind(folder_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT msg_uid FROM imap_uids WHERE account_id = ? AND folder_id = ?")
                .bind(account_id)
                .bind(folder_id)
                .fetch_all(&self.pool)
                .await?
        };
        Ok(rows.iter().map(|r| r.get::<i64, _>("msg_uid") as u32).collect())
    }

    async fn lastseenuid(&self, account_id: super::AccountId, folder_id: super::FolderId) -> Result<super::Uid, StoreError> {
        let row = sqlx::query("SELECT MAX(msg_uid) as m FROM imap_uids WHERE account_id = ? AND folder_id = ?")
            .bind(account_id)
            .bind(folder_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("m").unwrap_or(0) as u32)
    }

    async fn create_imap_message(
        &self,
        account_id: super::AccountId,
        namespace_id: NamespaceId,
        folder: &Folder,
        msg: &NewMessage,
    ) -> Result<super::MessageId, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Dedup on data_sha256 within the namespace: reuse an existing
        // Message row rather than creating a true duplicate. A tombstoned
        // row with a matching sha256 is resurrected (mirroring
        // `undelete_message`) instead of being skipped, so a UID that
        // reappears for a body already queued for hard-deletion gets its
        // original Message back rather than a brand-new one.
        let existing = sqlx::query("SELECT id, deleted_at FROM messages WHERE namespace_id = ? AND data_sha256 = ? LIMIT 1")
            .bind(namespace_id)
            .bind(&msg.data_sha256)
            .fetch_optional(&mut *tx)
            .await?;

        let message_id: i64 = if let Some(row) = existing {
            let id: i64 = row.get("id");
            let deleted_at: Option<DateTime<Utc>> = row.get("deleted_at");
            if deleted_at.is_some() {
                sqlx::query("UPDATE messages SET deleted_at = NULL WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            id
        } else {
            let result = sqlx::query(
                "INSERT INTO messages (namespace_id, data_sha256, subject, received_date) VALUES (?, ?, ?, ?)",
            )
            .bind(namespace_id)
            .bind(&msg.data_sha256)
            .bind(&msg.subject)
            .bind(msg.received_date)
            .execute(&mut *tx)
            .await?;
            result.last_insert_rowid()
        };

        let labels_json = msg.flags.labels.as_ref().map(|l| {
            serde_json::to_string(&l.iter().collect::<Vec<_>>()).unwrap_or_default()
        });

        sqlx::query(
            "INSERT INTO imap_uids (account_id, folder_id, msg_uid, message_id, is_seen, is_flagged, is_draft, labels)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, folder_id, msg_uid) DO UPDATE SET
               message_id = excluded.message_id,
               is_seen = excluded.is_seen,
               is_flagged = excluded.is_flagged,
               labels = excluded.labels",
        )
        .bind(account_id)
        .bind(folder.id)
        .bind(msg.uid as i64)
        .bind(message_id)
        .bind(msg.flags.is_seen)
        .bind(msg.flags.is_flagged)
        .bind(folder.role() == "drafts" || folder.role() == "all")
        .bind(labels_json)
        .execute(&mut *tx)
        .await?;

        recompute_message_metadata(&mut tx, message_id).await?;
        sqlx::query(
            "INSERT INTO transactions (namespace_id, object_type, record_id, command) VALUES (?, 'message', ?, 'insert')",
        )
        .bind(namespace_id)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message_id)
    }

    async fn update_metadata(
        &self,
        account_id: super::AccountId,
        folder_id: super::FolderId,
        folder_role: &str,
        new_flags: &HashMap<super::Uid, RemoteFlags>,
    ) -> Result<u32, StoreError> {
        if new_flags.is_empty() {
            return Ok(0);
        }
        let mut changed = 0u32;
        // One transaction per caller-supplied batch: the caller already
        // chunked the uids, so each chunk commits atomically as a unit.
        let mut tx = self.pool.begin().await?;
        for (uid, flags) in new_flags {
            let row = sqlx::query(
                "SELECT id, message_id, is_seen, is_flagged, labels FROM imap_uids WHERE account_id = ? AND folder_id = ? AND msg_uid = ?",
            )
            .bind(account_id)
            .bind(folder_id)
            .bind(*uid as i64)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(row) = row else { continue };
            let uid_id: i64 = row.get("id");
            let message_id: i64 = row.get("message_id");
            let old_seen: bool = row.get("is_seen");
            let old_flagged: bool = row.get("is_flagged");
            let old_labels: Option<String> = row.get("labels");

            let mut is_changed = flags.is_seen != old_seen || flags.is_flagged != old_flagged;
            let new_labels_json = flags.labels.as_ref().map(|l| {
                serde_json::to_string(&l.iter().collect::<Vec<_>>()).unwrap_or_default()
            });
            // Label changes always force a metadata recompute (matches the
            // source's asymmetric `changed=True` override for labels).
            if flags.labels.is_some() && new_labels_json != old_labels {
                is_changed = true;
            }

            if !is_changed {
                continue;
            }

            let is_draft = folder_role == "drafts" || folder_role == "all";
            sqlx::query(
                "UPDATE imap_uids SET is_seen = ?, is_flagged = ?, is_draft = ?, labels = COALESCE(?, labels) WHERE id = ?",
            )
            .bind(flags.is_seen)
            .bind(flags.is_flagged)
            .bind(is_draft)
            .bind(new_labels_json)
            .bind(uid_id)
            .execute(&mut *tx)
            .await?;

            recompute_message_metadata(&mut tx, message_id).await?;
            changed += 1;
        }
        tx.commit().await?;
        info!("updated uid metadata: changed={changed} out_of={}", new_flags.len());
        Ok(changed)
    }

    async fn remove_deleted_uids(&self, account_id: super::AccountId, folder_id: super::FolderId, uids: &HashSet<super::Uid>) -> Result<u32, StoreError> {
        if uids.is_empty() {
            return Ok(0);
        }
        let mut deleted = 0u32;
        for uid in uids {
            // One transaction per uid, matching the source's deliberate
            // per-uid commit tradeoff (bulk deletes vs. long-lived sessions).
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query("SELECT id, message_id FROM imap_uids WHERE account_id = ? AND folder_id = ? AND msg_uid = ?")
                .bind(account_id)
                .bind(folder_id)
                .bind(*uid as i64)
                .fetch_optional(&mut *tx)
                .await?;
            let Some(row) = row else {
                tx.commit().await?;
                continue;
            };
            deleted += 1;
            let uid_row_id: i64 = row.get("id");
            let message_id: i64 = row.get("message_id");
            sqlx::query("DELETE FROM imap_uids WHERE id = ?")
                .bind(uid_row_id)
                .execute(&mut *tx)
                .await?;

            let remaining = sqlx::query("SELECT COUNT(*) as c FROM imap_uids WHERE message_id = ?")
                .bind(message_id)
                .fetch_one(&mut *tx)
                .await?
                .get::<i64, _>("c");

            let msg_row = sqlx::query("SELECT is_draft, thread_id FROM messages WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(msg_row) = msg_row {
                let is_draft: bool = msg_row.get("is_draft");
                let thread_id: Option<i64> = msg_row.get("thread_id");
                if remaining == 0 && is_draft {
                    // Synchronous draft deletion (no tombstone window).
                    sqlx::query("DELETE FROM messages WHERE id = ?")
                        .bind(message_id)
                        .execute(&mut *tx)
                        .await?;
                    if let Some(thread_id) = thread_id {
                        let left = sqlx::query("SELECT COUNT(*) as c FROM messages WHERE thread_id = ?")
                            .bind(thread_id)
                            .fetch_one(&mut *tx)
                            .await?
                            .get::<i64, _>("c");
                        if left == 0 {
                            sqlx::query("DELETE FROM threads WHERE id = ?")
                                .bind(thread_id)
                                .execute(&mut *tx)
                                .await?;
                        }
                    }
                } else {
                    recompute_message_metadata(&mut tx, message_id).await?;
                    if remaining == 0 {
                        sqlx::query("UPDATE messages SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?")
                            .bind(message_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
            }
            tx.commit().await?;
        }
        info!("deleted expunged uids: count={deleted}");
        Ok(deleted)
    }

    async fn dangling_messages(&self, namespace_id: NamespaceId, older_than: DateTime<Utc>, limit: u32) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE namespace_id = ? AND deleted_at IS NOT NULL AND deleted_at <= ? LIMIT ?",
        )
        .bind(namespace_id)
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| Message {
                id: r.get("id"),
                namespace_id: r.get("namespace_id"),
                thread_id: r.get("thread_id"),
                data_sha256: r.get("data_sha256"),
                is_read: r.get("is_read"),
                is_starred: r.get("is_starred"),
                is_draft: r.get("is_draft"),
                version: r.get("version"),
                deleted_at: r.get("deleted_at"),
            })
            .collect())
    }

    async fn undelete_message(&self, message_id: super::MessageId) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET deleted_at = NULL WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn hard_delete_message(&self, message_id: super::MessageId) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT data_sha256, thread_id FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else { return Ok(None) };

        // A UID may have reappeared for this message between the sweep's
        // `dangling_messages` read and this delete; re-check for a live
        // ImapUid inside the same transaction rather than hard-deleting a
        // Message that's no longer actually dangling.
        let live_uid_count = sqlx::query("SELECT COUNT(*) as c FROM imap_uids WHERE message_id = ?")
            .bind(message_id)
            .fetch_one(&mut *tx)
            .await?
            .get::<i64, _>("c");
        if live_uid_count > 0 {
            return Ok(None);
        }

        let sha256: String = row.get("data_sha256");
        let thread_id: Option<i64> = row.get("thread_id");

        let freed_categories: Vec<i64> = sqlx::query("SELECT category_id FROM message_categories WHERE message_id = ?")
            .bind(message_id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|r| r.get("category_id"))
            .collect();
        sqlx::query("DELETE FROM message_categories WHERE message_id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        for category_id in freed_categories {
            tombstone_category_if_unreferenced(&mut tx, category_id).await?;
        }

        if let Some(thread_id) = thread_id {
            let remaining = sqlx::query("SELECT * FROM messages WHERE thread_id = ? AND is_draft = 0 ORDER BY received_date ASC")
                .bind(thread_id)
                .fetch_all(&mut *tx)
                .await?;
            if remaining.is_empty() {
                sqlx::query("UPDATE threads SET deleted_at = CURRENT_TIMESTAMP WHERE id = ?")
                    .bind(thread_id)
                    .execute(&mut *tx)
                    .await?;
            } else {
                let first = &remaining[0];
                let last = &remaining[remaining.len() - 1];
                sqlx::query("UPDATE threads SET subject = ?, subjectdate = ?, recentdate = ? WHERE id = ?")
                    .bind(first.get::<Option<String>, _>("subject"))
                    .bind(first.get::<Option<DateTime<Utc>>, _>("received_date"))
                    .bind(last.get::<Option<DateTime<Utc>>, _>("received_date"))
                    .bind(thread_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(Some(sha256))
    }

    async fn sha256_still_referenced(&self, namespace_id: NamespaceId, sha256: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM messages WHERE namespace_id = ? AND data_sha256 = ?")
            .bind(namespace_id)
            .bind(sha256)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("c") > 0)
    }

    async fn gc_deleted_categories(&self, namespace_id: NamespaceId) -> Result<u32, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM categories WHERE namespace_id = ? AND deleted_at IS NOT NULL AND
             (SELECT COUNT(*) FROM message_categories WHERE category_id = categories.id) = 0",
        )
        .bind(namespace_id)
        .fetch_all(&self.pool)
        .await?;
        let count = rows.len() as u32;
        for row in rows {
            let id: i64 = row.get("id");
            sqlx::query("DELETE FROM categories WHERE id = ?").bind(id).execute(&self.pool).await?;
        }
        Ok(count)
    }

    async fn gc_deleted_threads(&self, namespace_id: NamespaceId, older_than: DateTime<Utc>) -> Result<u32, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM threads WHERE namespace_id = ? AND deleted_at IS NOT NULL AND deleted_at <= ? AND
             (SELECT COUNT(*) FROM messages WHERE thread_id = threads.id) = 0",
        )
        .bind(namespace_id)
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        let count = rows.len() as u32;
        for row in rows {
            let id: i64 = row.get("id");
            sqlx::query("DELETE FROM threads WHERE id = ?").bind(id).execute(&self.pool).await?;
        }
        Ok(count)
    }

    async fn pending_namespaces(&self, limit: usize) -> Result<Vec<NamespaceId>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT namespace_id FROM action_log WHERE status = 'pending' AND discriminator = 'generic'",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut ids: Vec<NamespaceId> = rows.iter().map(|r| r.get("namespace_id")).collect();
        if ids.len() > limit {
            use rand::seq::SliceRandom;
            let mut rng = rand::thread_rng();
            ids.shuffle(&mut rng);
            ids.truncate(limit);
        }
        Ok(ids)
    }

    async fn pending_action_log(&self, namespace_id: NamespaceId, limit: u32) -> Result<Vec<ActionLogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM action_log WHERE namespace_id = ? AND status = 'pending' ORDER BY id ASC LIMIT ?",
        )
        .bind(namespace_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ActionLogEntry {
                id: r.get("id"),
                namespace_id: r.get("namespace_id"),
                account_id: r.get("account_id"),
                table_name: r.get("table_name"),
                record_id: r.get("record_id"),
                action: r.get("action"),
                extra_args: r
                    .get::<Option<String>, _>("extra_args")
                    .and_then(|s| serde_json::from_str(&s).ok()),
                status: r.get("status"),
                retries: r.get::<i64, _>("retries") as u32,
                discriminator: r.get("discriminator"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    async fn mark_action_successful(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE action_log SET status = 'successful', updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_action_failed(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE action_log SET status = 'failed', updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_action_retries(&self, id: i64) -> Result<u32, StoreError> {
        sqlx::query("UPDATE action_log SET retries = retries + 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT retries FROM action_log WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("retries") as u32)
    }

    async fn cascade_fail_pending_actions(&self, namespace_id: NamespaceId, record_id: i64, except_id: i64) -> Result<u32, StoreError> {
        let result = sqlx::query(
            "UPDATE action_log SET status = 'failed', updated_at = CURRENT_TIMESTAMP
             WHERE namespace_id = ? AND record_id = ? AND id != ? AND status = 'pending'",
        )
        .bind(namespace_id)
        .bind(record_id)
        .bind(except_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as u32)
    }

    async fn tombstone_event(&self, event_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE events SET deleted_at = CURRENT_TIMESTAMP WHERE id = ? AND deleted_at IS NULL")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn had_recent_move_action(&self, namespace_id: NamespaceId, record_id: i64, within_secs: i64) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT id FROM action_log WHERE namespace_id = ? AND record_id = ? AND action IN ('change_labels','move')
             AND status = 'successful' AND updated_at >= datetime('now', ? || ' seconds') ORDER BY id DESC LIMIT 1",
        )
        .bind(namespace_id)
        .bind(record_id)
        .bind(-within_secs)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn append_transaction(&self, namespace_id: NamespaceId, object_type: &str, record_id: i64, command: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO transactions (namespace_id, object_type, record_id, command) VALUES (?, ?, ?, ?)")
            .bind(namespace_id)
            .bind(object_type)
            .bind(record_id)
            .bind(command)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn thread_for_key(&self, namespace_id: NamespaceId, thread_key: &str, max_len: usize) -> Result<Option<super::ThreadId>, StoreError> {
        let row = sqlx::query(
            "SELECT t.id FROM threads t WHERE t.namespace_id = ? AND t.thread_key = ? AND t.deleted_at IS NULL
             AND (SELECT COUNT(*) FROM messages WHERE thread_id = t.id) < ?
             ORDER BY t.id DESC LIMIT 1",
        )
        .bind(namespace_id)
        .bind(thread_key)
        .bind(max_len as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn create_thread(&self, namespace_id: NamespaceId, thread_key: Option<&str>, subject: Option<&str>) -> Result<super::ThreadId, StoreError> {
        let result = sqlx::query("INSERT INTO threads (namespace_id, thread_key, subject) VALUES (?, ?, ?)")
            .bind(namespace_id)
            .bind(thread_key)
            .bind(subject)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn attach_message_to_thread(&self, message_id: super::MessageId, thread_id: super::ThreadId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET thread_id = ? WHERE id = ?")
            .bind(thread_id)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query("SELECT subject, received_date FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_one(&mut *tx)
            .await?;
        let subject: Option<String> = row.get("subject");
        let received_date: Option<DateTime<Utc>> = row.get("received_date");
        // First message in a Thread sets its subjectdate; every message
        // that lands in it advances recentdate.
        sqlx::query(
            "UPDATE threads SET
                subject = COALESCE(subject, ?),
                subjectdate = COALESCE(subjectdate, ?),
                recentdate = CASE WHEN recentdate IS NULL OR ? > recentdate THEN ? ELSE recentdate END
             WHERE id = ?",
        )
        .bind(&subject)
        .bind(received_date)
        .bind(received_date)
        .bind(received_date)
        .bind(thread_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn sync_message_categories(
        &self,
        namespace_id: NamespaceId,
        message_id: super::MessageId,
        folder: &Folder,
        labels: Option<&HashSet<String>>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let names: Vec<String> = match labels {
            Some(labels) => labels.iter().cloned().collect(),
            None => vec![folder.name.clone()],
        };

        let mut wanted_ids = Vec::with_capacity(names.len());
        for name in &names {
            let canonical = folder.canonical_name.as_deref().filter(|_| labels.is_none());
            let existing = sqlx::query(
                "SELECT id FROM categories WHERE namespace_id = ? AND display_name = ? AND deleted_at IS NULL",
            )
            .bind(namespace_id)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
            let category_id: i64 = if let Some(row) = existing {
                row.get("id")
            } else {
                let result = sqlx::query(
                    "INSERT INTO categories (namespace_id, canonical_name, display_name) VALUES (?, ?, ?)",
                )
                .bind(namespace_id)
                .bind(canonical)
                .bind(name)
                .execute(&mut *tx)
                .await?;
                result.last_insert_rowid()
            };
            wanted_ids.push(category_id);
        }

        let current = sqlx::query("SELECT category_id FROM message_categories WHERE message_id = ?")
            .bind(message_id)
            .fetch_all(&mut *tx)
            .await?;
        let current_ids: HashSet<i64> = current.iter().map(|r| r.get("category_id")).collect();
        let wanted_set: HashSet<i64> = wanted_ids.iter().copied().collect();

        for id in current_ids.difference(&wanted_set) {
            sqlx::query("DELETE FROM message_categories WHERE message_id = ? AND category_id = ?")
                .bind(message_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tombstone_category_if_unreferenced(&mut tx, *id).await?;
        }
        for id in wanted_set.difference(&current_ids) {
            sqlx::query("INSERT OR IGNORE INTO message_categories (message_id, category_id) VALUES (?, ?)")
                .bind(message_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn rename_category(&self, namespace_id: NamespaceId, old_display_name: &str, new_display_name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE categories SET display_name = ? WHERE namespace_id = ? AND display_name = ? AND deleted_at IS NULL",
        )
        .bind(new_display_name)
        .bind(namespace_id)
        .bind(old_display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn message_categories(&self, message_id: super::MessageId) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.display_name FROM message_categories mc \
             JOIN categories c ON c.id = mc.category_id \
             WHERE mc.message_id = ? AND c.deleted_at IS NULL",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("display_name")).collect())
    }

    async fn message_id_for_uid(&self, account_id: super::AccountId, folder_id: super::FolderId, uid: super::Uid) -> Result<Option<super::MessageId>, StoreError> {
        let row = sqlx::query("SELECT message_id FROM imap_uids WHERE account_id = ? AND folder_id = ? AND msg_uid = ?")
            .bind(account_id)
            .bind(folder_id)
            .bind(uid as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("message_id")))
    }
}

/// `update_message_metadata` from `common.py`: recomputes `is_read` /
/// `is_starred` as the OR of all surviving ImapUids' flags.
async fn recompute_message_metadata(tx: &mut SqlxTx<'_, Sqlite>, message_id: i64) -> Result<(), StoreError> {
    let row = sqlx::query(
        "SELECT
            MAX(is_seen) as any_seen,
            MAX(is_flagged) as any_flagged,
            MAX(is_draft) as any_draft
         FROM imap_uids WHERE message_id = ?",
    )
    .bind(message_id)
    .fetch_one(&mut **tx)
    .await?;
    let is_read: bool = row.get::<Option<i64>, _>("any_seen").unwrap_or(0) != 0;
    let is_starred: bool = row.get::<Option<i64>, _>("any_flagged").unwrap_or(0) != 0;
    let is_draft: bool = row.get::<Option<i64>, _>("any_draft").unwrap_or(0) != 0;
    sqlx::query(
        "UPDATE messages SET is_read = ?, is_starred = ?, is_draft = ?, version = version + 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(is_read)
    .bind(is_starred)
    .bind(is_draft)
    .bind(message_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Tombstones a category the moment its last `message_categories` row is
/// removed, mirroring `hard_delete_message`'s thread-emptying check.
/// `gc_deleted_categories` only ever collects categories reachable through
/// here.
async fn tombstone_category_if_unreferenced(tx: &mut SqlxTx<'_, Sqlite>, category_id: i64) -> Result<(), StoreError> {
    let remaining = sqlx::query("SELECT COUNT(*) as c FROM message_categories WHERE category_id = ?")
        .bind(category_id)
        .fetch_one(&mut **tx)
        .await?
        .get::<i64, _>("c");
    if remaining == 0 {
        sqlx::query("UPDATE categories SET deleted_at = CURRENT_TIMESTAMP WHERE id = ? AND deleted_at IS NULL")
            .bind(category_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    async fn seed_account(store: &SqliteStore) -> i64 {
        let result = sqlx::query(
            "INSERT INTO accounts (namespace_id, email_address, provider, imap_host, imap_port, imap_user, imap_pass)
             VALUES (1, 'a@example.com', 'generic', 'imap.example.com', 993, 'a', 'pw')",
        )
        .execute(store.pool())
        .await
        .unwrap();
        result.last_insert_rowid()
    }

    #[tokio::test]
    async fn claim_and_release_account_round_trip() {
        let store = test_store().await;
        let account_id = seed_account(&store).await;
        assert!(store.claim_account(account_id, "host:0").await.unwrap());
        // A different process cannot steal it.
        assert!(!store.claim_account(account_id, "host:1").await.unwrap());
        assert!(store.release_account(account_id, "host:0").await.unwrap());
        assert!(store.claim_account(account_id, "host:1").await.unwrap());
    }

    #[tokio::test]
    async fn find_or_create_folder_is_idempotent() {
        let store = test_store().await;
        let account_id = seed_account(&store).await;
        let f1 = store.find_or_create_folder(account_id, "INBOX", Some("inbox")).await.unwrap();
        let f2 = store.find_or_create_folder(account_id, "INBOX", Some("inbox")).await.unwrap();
        assert_eq!(f1.id, f2.id);
    }

    #[tokio::test]
    async fn create_imap_message_dedupes_on_sha256() {
        let store = test_store().await;
        let account_id = seed_account(&store).await;
        let folder = store.find_or_create_folder(account_id, "INBOX", Some("inbox")).await.unwrap();
        let msg = NewMessage {
            uid: 10,
            data_sha256: "deadbeef".into(),
            subject: Some("hi".into()),
            received_date: None,
            flags: RemoteFlags::default(),
        };
        let first = store.create_imap_message(account_id, 1, &folder, &msg).await.unwrap();

        let folder2 = store.find_or_create_folder(account_id, "Archive", Some("archive")).await.unwrap();
        let msg2 = NewMessage { uid: 11, ..msg.clone() };
        let second = store.create_imap_message(account_id, 1, &folder2, &msg2).await.unwrap();
        assert_eq!(first, second);
    }

    impl Clone for NewMessage {
        fn clone(&self) -> Self {
            NewMessage {
                uid: self.uid,
                data_sha256: self.data_sha256.clone(),
                subject: self.subject.clone(),
                received_date: self.received_date,
                flags: self.flags.clone(),
            }
        }
    }

    #[tokio::test]
    async fn remove_deleted_uids_tombstones_non_draft() {
        let store = test_store().await;
        let account_id = seed_account(&store).await;
        let folder = store.find_or_create_folder(account_id, "INBOX", Some("inbox")).await.unwrap();
        let msg = NewMessage {
            uid: 1,
            data_sha256: "abc123".into(),
            subject: None,
            received_date: None,
            flags: RemoteFlags::default(),
        };
        store.create_imap_message(account_id, 1, &folder, &msg).await.unwrap();
        let mut uids = HashSet::new();
        uids.insert(1u32);
        let removed = store.remove_deleted_uids(account_id, folder.id, &uids).await.unwrap();
        assert_eq!(removed, 1);

        let dangling = store
            .dangling_messages(1, Utc::now() + chrono::Duration::seconds(1), 100)
            .await
            .unwrap();
        assert_eq!(dangling.len(), 1);
        assert!(dangling[0].deleted_at.is_some());
    }

    #[tokio::test]
    async fn create_imap_message_resurrects_tombstoned_sha256_match() {
        let store = test_store().await;
        let account_id = seed_account(&store).await;
        let folder = store.find_or_create_folder(account_id, "INBOX", Some("inbox")).await.unwrap();
        let msg = NewMessage {
            uid: 1,
            data_sha256: "sha-resurrect".into(),
            subject: None,
            received_date: None,
            flags: RemoteFlags::default(),
        };
        let message_id = store.create_imap_message(account_id, 1, &folder, &msg).await.unwrap();
        let mut uids = HashSet::new();
        uids.insert(1u32);
        store.remove_deleted_uids(account_id, folder.id, &uids).await.unwrap();
        let tombstoned = store.dangling_messages(1, Utc::now() + chrono::Duration::seconds(1), 100).await.unwrap();
        assert!(tombstoned.iter().any(|m| m.id == message_id));

        let msg2 = NewMessage { uid: 2, ..msg.clone() };
        let resurrected_id = store.create_imap_message(account_id, 1, &folder, &msg2).await.unwrap();
        assert_eq!(resurrected_id, message_id);
        let still_dangling = store.dangling_messages(1, Utc::now() + chrono::Duration::seconds(1), 100).await.unwrap();
        assert!(!still_dangling.iter().any(|m| m.id == message_id));
    }

    #[tokio::test]
    async fn hard_delete_message_skips_when_uid_reappeared() {
        let store = test_store().await;
        let account_id = seed_account(&store).await;
        let folder = store.find_or_create_folder(account_id, "INBOX", Some("inbox")).await.unwrap();
        let msg = NewMessage {
            uid: 1,
            data_sha256: "sha-live".into(),
            subject: None,
            received_date: None,
            flags: RemoteFlags::default(),
        };
        let message_id = store.create_imap_message(account_id, 1, &folder, &msg).await.unwrap();
        let result = store.hard_delete_message(message_id).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn hard_delete_message_tombstones_unreferenced_category() {
        let store = test_store().await;
        let account_id = seed_account(&store).await;
        let folder = store.find_or_create_folder(account_id, "INBOX", Some("inbox")).await.unwrap();
        let msg = NewMessage {
            uid: 1,
            data_sha256: "sha-cat".into(),
            subject: None,
            received_date: None,
            flags: RemoteFlags::default(),
        };
        let message_id = store.create_imap_message(account_id, 1, &folder, &msg).await.unwrap();
        store.sync_message_categories(1, message_id, &folder, None).await.unwrap();

        let mut uids = HashSet::new();
        uids.insert(1u32);
        store.remove_deleted_uids(account_id, folder.id, &uids).await.unwrap();
        let deleted = store.hard_delete_message(message_id).await.unwrap();
        assert!(deleted.is_some());

        let gc_count = store.gc_deleted_categories(1).await.unwrap();
        assert_eq!(gc_count, 1);
    }

    #[tokio::test]
    async fn cascade_fail_pending_actions_spares_unrelated_records() {
        let store = test_store().await;
        let account_id = seed_account(&store).await;
        let ids: Vec<i64> = futures::future::join_all((0..3).map(|i| {
            let action = if i == 2 { "move" } else { "create_event" };
            let record_id = if i == 2 { 99 } else { 7 };
            sqlx::query(
                "INSERT INTO action_log (namespace_id, account_id, table_name, record_id, action) VALUES (1, ?, 'event', ?, ?)",
            )
            .bind(account_id)
            .bind(record_id)
            .bind(action)
            .execute(store.pool())
        }))
        .await
        .into_iter()
        .map(|r| r.unwrap().last_insert_rowid())
        .collect();

        let cascaded = store.cascade_fail_pending_actions(1, 7, ids[0]).await.unwrap();
        assert_eq!(cascaded, 1);

        let unrelated = store.pending_action_log(1, 10).await.unwrap();
        assert!(unrelated.iter().any(|e| e.id == ids[2]));
    }
}
