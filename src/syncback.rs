// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Syncback processor (C9): applies locally-recorded intent-to-change
//! records to the remote server, grounded on `inbox/transactions/actions.py`.
//!
//! One service instance owns a static set of shards (`syncback_id ->
//! [shard_id, ...]`, filtered to `shard_id % total_processes ==
//! process_number`); each scan samples the pending ActionLog entries of
//! owned namespaces, coalesces same-record entries into
//! [`SyncbackTask`]s, and hands batches to a fixed-size worker pool over a
//! bounded channel, diverging from the source's unbounded queue to honor
//! "bounded" literally.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::{error, warn};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::imap::error::ImapError;
use crate::store::{Account, AccountId, ActionLogEntry, LocalStore, NamespaceId, StoreError, SyncState};
use crate::sync::StopSignal;

pub const ACTION_MAX_NR_OF_RETRIES: u32 = 5;
pub const FETCH_BATCH_SIZE: u32 = 100;
pub const BATCH_SIZE: usize = 20;
pub const MAX_NAMESPACES_PER_SCAN: usize = 500;
pub const MAX_DEDUPLICATION_BATCH_SIZE: u32 = 5000;
pub const DEFAULT_NUM_WORKERS: usize = 500;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const TASK_TIMEOUT_PER_ENTRY: Duration = Duration::from_secs(60);
pub const INVALID_ACCOUNT_GRACE_PERIOD: Duration = Duration::from_secs(2 * 3600);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(120);
pub const RECENT_MOVE_WINDOW_SECS: i64 = 90;

/// A single coalesced unit of work: one or more ActionLog entries on the
/// same `(namespace_id, record_id, action)`, already merged per the rules
/// in [`coalesce_entries`].
#[derive(Debug, Clone)]
pub struct SyncbackTask {
    pub namespace_id: NamespaceId,
    pub account_id: AccountId,
    pub record_id: i64,
    pub action: String,
    pub extra_args: Option<Value>,
    pub action_log_ids: Vec<i64>,
}

struct SyncbackBatchTask {
    account_id: AccountId,
    tasks: Vec<SyncbackTask>,
}

/// Groups `entries` by `(namespace_id, record_id, action)` preserving first-seen
/// order, then merges each group:
/// - `move`/`mark_unread`: one task carrying the latest `extra_args` and
///   every underlying entry id.
/// - `change_labels`: one task carrying the net label delta (an add
///   cancelled by a later remove, and vice versa, drops out entirely).
/// - anything else: kept as individual single-entry tasks.
pub fn coalesce_entries(entries: Vec<ActionLogEntry>) -> Vec<SyncbackTask> {
    let mut order: Vec<(NamespaceId, i64, String)> = Vec::new();
    let mut groups: HashMap<(NamespaceId, i64, String), Vec<ActionLogEntry>> = HashMap::new();
    for entry in entries {
        let key = (entry.namespace_id, entry.record_id, entry.action.clone());
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(entry);
    }

    let mut tasks = Vec::with_capacity(order.len());
    for key in order {
        let group = groups.remove(&key).expect("key was just inserted above");
        let (namespace_id, record_id, action) = key;
        match action.as_str() {
            "move" | "mark_unread" => {
                let account_id = group[0].account_id;
                let action_log_ids = group.iter().map(|e| e.id).collect();
                let extra_args = group.last().and_then(|e| e.extra_args.clone());
                tasks.push(SyncbackTask {
                    namespace_id,
                    account_id,
                    record_id,
                    action,
                    extra_args,
                    action_log_ids,
                });
            }
            "change_labels" => tasks.push(coalesce_change_labels(namespace_id, record_id, group)),
            _ => {
                for entry in group {
                    tasks.push(SyncbackTask {
                        namespace_id,
                        account_id: entry.account_id,
                        record_id,
                        action: action.clone(),
                        extra_args: entry.extra_args,
                        action_log_ids: vec![entry.id],
                    });
                }
            }
        }
    }
    tasks
}

fn coalesce_change_labels(namespace_id: NamespaceId, record_id: i64, group: Vec<ActionLogEntry>) -> SyncbackTask {
    let account_id = group[0].account_id;
    let action_log_ids: Vec<i64> = group.iter().map(|e| e.id).collect();
    let mut delta: HashMap<String, i32> = HashMap::new();
    for entry in &group {
        let Some(args) = &entry.extra_args else { continue };
        if let Some(added) = args.get("added").and_then(Value::as_array) {
            for label in added.iter().filter_map(Value::as_str) {
                *delta.entry(label.to_string()).or_insert(0) += 1;
            }
        }
        if let Some(removed) = args.get("removed").and_then(Value::as_array) {
            for label in removed.iter().filter_map(Value::as_str) {
                *delta.entry(label.to_string()).or_insert(0) -= 1;
            }
        }
    }
    let added: Vec<String> = delta.iter().filter(|(_, d)| **d > 0).map(|(k, _)| k.clone()).collect();
    let removed: Vec<String> = delta.iter().filter(|(_, d)| **d < 0).map(|(k, _)| k.clone()).collect();
    SyncbackTask {
        namespace_id,
        account_id,
        record_id,
        action: "change_labels".to_string(),
        extra_args: Some(serde_json::json!({ "added": added, "removed": removed })),
        action_log_ids,
    }
}

/// Applies one coalesced task to the remote server. `extra_args` is
/// whatever shape the (external) API handler that originally wrote the
/// ActionLog entry chose — this trait doesn't interpret it further.
#[async_trait]
pub trait SyncbackExecutor: Send + Sync {
    async fn execute(&self, account: &Account, task: &SyncbackTask) -> Result<(), ImapError>;
}

/// Dispatches onto the existing `ImapClient` mutation surface
/// (`move_email`, `store_flags`). `change_labels` and the draft/event/
/// folder/label CRUD actions need IMAP operations `AsyncImapOps` does not
/// yet expose (Gmail label STORE items, structured draft/event payloads),
/// so they return an explicit unsupported error rather than silently
/// no-opping.
pub struct ImapSyncbackExecutor;

impl ImapSyncbackExecutor {
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
impl SyncbackExecutor for ImapSyncbackExecutor {
    async fn execute(&self, account: &Account, task: &SyncbackTask) -> Result<(), ImapError> {
        let args = task.extra_args.clone().unwrap_or(Value::Null);
        match task.action.as_str() {
            "move" => {
                let uid = args.get("uid").and_then(Value::as_u64).ok_or_else(|| {
                    ImapError::Internal("move task missing uid".to_string())
                })? as u32;
                let from = args.get("from_folder").and_then(Value::as_str).ok_or_else(|| {
                    ImapError::Internal("move task missing from_folder".to_string())
                })?;
                let to = args.get("to_folder").and_then(Value::as_str).ok_or_else(|| {
                    ImapError::Internal("move task missing to_folder".to_string())
                })?;
                let client = self.connect(account).await?;
                client.move_email(uid, from, to).await
            }
            "mark_unread" | "mark_starred" => {
                let uid = args.get("uid").and_then(Value::as_u64).ok_or_else(|| {
                    ImapError::Internal(format!("{} task missing uid", task.action))
                })? as u32;
                let flag = if task.action == "mark_unread" { "\\Seen" } else { "\\Flagged" };
                let setting = args.get("set").and_then(Value::as_bool).unwrap_or(false);
                let operation = if setting {
                    crate::imap::types::FlagOperation::Remove
                } else {
                    crate::imap::types::FlagOperation::Add
                };
                let client = self.connect(account).await?;
                client.store_flags(&[uid], operation, &[flag.to_string()]).await
            }
            "create_event" => Err(ImapError::Internal(
                "create_event is not supported by this provider (calendar sync is out of scope)".to_string(),
            )),
            other => Err(ImapError::Internal(format!(
                "syncback action '{other}' is not supported by this provider"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncbackConfig {
    pub process_number: i64,
    pub total_processes: i64,
    /// Total number of shards in the deployment; a namespace's shard is
    /// `namespace_id.rem_euclid(total_shards)`.
    pub total_shards: i64,
    pub owned_shards: Vec<i64>,
    pub poll_interval: Duration,
    pub fetch_batch_size: u32,
    pub batch_size: usize,
    pub max_namespaces_per_scan: usize,
    pub num_workers: usize,
    pub queue_capacity: usize,
    pub task_timeout_per_entry: Duration,
    pub invalid_account_grace_period: Duration,
    pub retry_interval: Duration,
}

impl SyncbackConfig {
    /// Resolves which shards this `(syncback_id, process_number)` owns out
    /// of a static `syncback_id -> [shard_id, ...]` assignment map (the
    /// `SyncConfig::syncback_assignments` config knob).
    pub fn from_assignments(
        syncback_id: i64,
        process_number: i64,
        total_processes: i64,
        total_shards: i64,
        assignments: &HashMap<String, Vec<i64>>,
    ) -> Self {
        let owned_shards = assignments
            .get(&syncback_id.to_string())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|shard_id| total_processes <= 0 || shard_id.rem_euclid(total_processes) == process_number)
            .collect();
        Self {
            process_number,
            total_processes,
            total_shards,
            owned_shards,
            poll_interval: Duration::from_secs(1),
            fetch_batch_size: FETCH_BATCH_SIZE,
            batch_size: BATCH_SIZE,
            max_namespaces_per_scan: MAX_NAMESPACES_PER_SCAN,
            num_workers: DEFAULT_NUM_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            task_timeout_per_entry: TASK_TIMEOUT_PER_ENTRY,
            invalid_account_grace_period: INVALID_ACCOUNT_GRACE_PERIOD,
            retry_interval: RETRY_INTERVAL,
        }
    }
}

pub struct SyncbackService<E: SyncbackExecutor + 'static> {
    config: SyncbackConfig,
    store: Arc<dyn LocalStore>,
    executor: E,
    stop: StopSignal,
    account_semaphores: DashMap<AccountId, Arc<Semaphore>>,
    running_ids: Mutex<HashSet<i64>>,
}

impl<E: SyncbackExecutor + 'static> SyncbackService<E> {
    pub fn new(config: SyncbackConfig, store: Arc<dyn LocalStore>, executor: E, stop: StopSignal) -> Self {
        Self {
            config,
            store,
            executor,
            stop,
            account_semaphores: DashMap::new(),
            running_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    fn owns_namespace(&self, namespace_id: NamespaceId) -> bool {
        if self.config.total_shards <= 0 {
            return true;
        }
        let shard = namespace_id.rem_euclid(self.config.total_shards);
        self.config.owned_shards.contains(&shard)
    }

    /// Runs the scan loop until `stop_signal().stop()` is called, draining
    /// the worker pool before returning.
    pub async fn run(self: Arc<Self>) -> Result<(), StoreError> {
        let (tx, rx) = mpsc::channel::<SyncbackBatchTask>(self.config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(self.config.num_workers);
        for _ in 0..self.config.num_workers {
            let service = self.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let batch = rx.lock().await.recv().await;
                    match batch {
                        Some(batch) => service.execute_batch(batch).await,
                        None => break,
                    }
                }
            }));
        }

        loop {
            if self.stop.is_stopped() {
                break;
            }
            if let Err(err) = self.scan_and_dispatch(&tx).await {
                warn!("syncback scan failed: {err}");
            }
            self.stop.wait(self.config.poll_interval).await;
        }

        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }

    async fn scan_and_dispatch(&self, tx: &mpsc::Sender<SyncbackBatchTask>) -> Result<(), StoreError> {
        let namespaces = self.store.pending_namespaces(self.config.max_namespaces_per_scan).await?;
        for namespace_id in namespaces.into_iter().filter(|ns| self.owns_namespace(*ns)) {
            if let Err(err) = self.process_namespace(namespace_id, tx).await {
                warn!("syncback namespace {namespace_id} failed: {err}");
            }
        }
        Ok(())
    }

    async fn process_namespace(
        &self,
        namespace_id: NamespaceId,
        tx: &mpsc::Sender<SyncbackBatchTask>,
    ) -> Result<(), StoreError> {
        let entries = self
            .store
            .pending_action_log(namespace_id, self.config.fetch_batch_size)
            .await?;
        if entries.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let retry_window = chrono::Duration::from_std(self.config.retry_interval).unwrap_or_default();
        if entries.iter().any(|e| e.retries > 0 && now - e.updated_at < retry_window) {
            return Ok(());
        }

        let entries = {
            let running = self.running_ids.lock().await;
            entries.into_iter().filter(|e| !running.contains(&e.id)).collect::<Vec<_>>()
        };
        if entries.is_empty() {
            return Ok(());
        }

        let grace = chrono::Duration::from_std(self.config.invalid_account_grace_period).unwrap_or_default();
        let mut live_entries = Vec::with_capacity(entries.len());
        for entry in entries {
            let account = self.store.get_account(entry.account_id).await?;
            match account.sync_state {
                SyncState::Invalid | SyncState::Stopped => {
                    if now - entry.created_at > grace {
                        self.store.mark_action_failed(entry.id).await?;
                    }
                }
                _ => live_entries.push(entry),
            }
        }
        if live_entries.is_empty() {
            return Ok(());
        }

        let tasks = coalesce_entries(live_entries);
        let mut running = self.running_ids.lock().await;
        for task in &tasks {
            running.extend(task.action_log_ids.iter().copied());
        }
        drop(running);

        for chunk in tasks.chunks(self.config.batch_size) {
            if chunk.is_empty() {
                continue;
            }
            let account_id = chunk[0].account_id;
            let batch = SyncbackBatchTask {
                account_id,
                tasks: chunk.to_vec(),
            };
            if tx.send(batch).await.is_err() {
                warn!("syncback queue closed while dispatching namespace {namespace_id}");
                return Ok(());
            }
        }
        Ok(())
    }

    async fn clear_running(&self, task: &SyncbackTask) {
        let mut running = self.running_ids.lock().await;
        for id in &task.action_log_ids {
            running.remove(id);
        }
    }

    /// One account's batch at a time: the per-account semaphore
    /// serializes batches, tasks within a batch run sequentially, and a
    /// failure aborts the remaining tasks for this account in this batch.
    async fn execute_batch(&self, batch: SyncbackBatchTask) {
        let semaphore = self
            .account_semaphores
            .entry(batch.account_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        let _permit = semaphore.acquire().await.expect("semaphore never closed");

        let account = match self.store.get_account(batch.account_id).await {
            Ok(account) => account,
            Err(err) => {
                warn!("syncback: account {} lookup failed: {err}", batch.account_id);
                for task in &batch.tasks {
                    self.clear_running(task).await;
                }
                return;
            }
        };

        for task in &batch.tasks {
            if self.should_skip_recent_move(task).await {
                self.clear_running(task).await;
                continue;
            }

            let timeout = self.config.task_timeout_per_entry * (task.action_log_ids.len() as u32).max(1);
            let result = tokio::time::timeout(timeout, self.executor.execute(&account, task)).await;
            match result {
                Ok(Ok(())) => {
                    for id in &task.action_log_ids {
                        if let Err(err) = self.store.mark_action_successful(*id).await {
                            warn!("mark_action_successful({id}) failed: {err}");
                        }
                    }
                    self.clear_running(task).await;
                }
                Ok(Err(err)) => {
                    self.fail_or_retry(task, &err.to_string()).await;
                    self.clear_running(task).await;
                    break;
                }
                Err(_elapsed) => {
                    self.fail_or_retry(task, "task timed out").await;
                    self.clear_running(task).await;
                    break;
                }
            }
        }

        for task in &batch.tasks {
            self.clear_running(task).await;
        }
    }

    async fn fail_or_retry(&self, task: &SyncbackTask, reason: &str) {
        warn!(
            "syncback task account={} record={} action={} failed: {reason}",
            task.account_id, task.record_id, task.action
        );
        for id in &task.action_log_ids {
            match self.store.increment_action_retries(*id).await {
                Ok(retries) if retries >= ACTION_MAX_NR_OF_RETRIES => {
                    if let Err(err) = self.store.mark_action_failed(*id).await {
                        error!("mark_action_failed({id}) failed: {err}");
                    }
                    if task.action == "create_event" {
                        self.cascade_fail_event(task, *id).await;
                    }
                }
                Ok(_) => {}
                Err(err) => error!("increment_action_retries({id}) failed: {err}"),
            }
        }
    }

    /// Once a `create_event` action exhausts its retries, every other
    /// pending action queued against that same event is preemptively
    /// failed and the event itself is tombstoned, rather than left to churn
    /// through retries against a record that will never settle.
    async fn cascade_fail_event(&self, task: &SyncbackTask, failed_id: i64) {
        match self
            .store
            .cascade_fail_pending_actions(task.namespace_id, task.record_id, failed_id)
            .await
        {
            Ok(count) if count > 0 => warn!(
                "cascaded {count} pending action(s) to failed for event {} after create_event exhausted retries",
                task.record_id
            ),
            Ok(_) => {}
            Err(err) => error!("cascade_fail_pending_actions(record={}) failed: {err}", task.record_id),
        }
        if let Err(err) = self.store.tombstone_event(task.record_id).await {
            error!("tombstone_event({}) failed: {err}", task.record_id);
        }
    }

    /// `move` actions wait out a 90s window after any `move`/`change_labels`
    /// on the same record succeeded, giving the remote server time to
    /// reflect the prior change before applying the next.
    async fn should_skip_recent_move(&self, task: &SyncbackTask) -> bool {
        if task.action != "move" {
            return false;
        }
        self.store
            .had_recent_move_action(task.namespace_id, task.record_id, RECENT_MOVE_WINDOW_SECS)
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;
    use chrono::DateTime;
    use serde_json::json;
    use sqlx::Row;

    struct FailingExecutor;

    #[async_trait]
    impl SyncbackExecutor for FailingExecutor {
        async fn execute(&self, _account: &Account, _task: &SyncbackTask) -> Result<(), ImapError> {
            Err(ImapError::Internal("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn create_event_exhausted_retries_cascades_and_tombstones() {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        let account_id = sqlx::query(
            "INSERT INTO accounts (namespace_id, email_address, provider, imap_host, imap_port, imap_user, imap_pass)
             VALUES (1, 'a@example.com', 'generic', 'imap.example.com', 993, 'a', 'pw')",
        )
        .execute(store.pool())
        .await
        .unwrap()
        .last_insert_rowid();
        let event_id = sqlx::query("INSERT INTO events (namespace_id) VALUES (1)")
            .execute(store.pool())
            .await
            .unwrap()
            .last_insert_rowid();
        let create_id = sqlx::query(
            "INSERT INTO action_log (namespace_id, account_id, table_name, record_id, action) VALUES (1, ?, 'event', ?, 'create_event')",
        )
        .bind(account_id)
        .bind(event_id)
        .execute(store.pool())
        .await
        .unwrap()
        .last_insert_rowid();
        let sibling_id = sqlx::query(
            "INSERT INTO action_log (namespace_id, account_id, table_name, record_id, action) VALUES (1, ?, 'event', ?, 'change_labels')",
        )
        .bind(account_id)
        .bind(event_id)
        .execute(store.pool())
        .await
        .unwrap()
        .last_insert_rowid();
        let pool = store.pool().clone();

        let store: Arc<dyn LocalStore> = Arc::new(store);
        let service = SyncbackService::new(
            SyncbackConfig::from_assignments(1, 0, 1, 0, &HashMap::new()),
            store,
            FailingExecutor,
            StopSignal::new(),
        );
        let task = SyncbackTask {
            namespace_id: 1,
            account_id,
            record_id: event_id,
            action: "create_event".to_string(),
            extra_args: None,
            action_log_ids: vec![create_id],
        };
        for _ in 0..ACTION_MAX_NR_OF_RETRIES {
            service.fail_or_retry(&task, "boom").await;
        }

        let sibling_status: String = sqlx::query("SELECT status FROM action_log WHERE id = ?")
            .bind(sibling_id)
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("status");
        assert_eq!(sibling_status, "failed");

        let event_deleted_at: Option<DateTime<Utc>> = sqlx::query("SELECT deleted_at FROM events WHERE id = ?")
            .bind(event_id)
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("deleted_at");
        assert!(event_deleted_at.is_some());
    }

    fn entry(id: i64, namespace_id: NamespaceId, record_id: i64, action: &str, extra_args: Option<Value>) -> ActionLogEntry {
        ActionLogEntry {
            id,
            namespace_id,
            account_id: 1,
            table_name: "message".to_string(),
            record_id,
            action: action.to_string(),
            extra_args,
            status: "pending".to_string(),
            retries: 0,
            discriminator: "imapaction".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn coalesces_repeated_move_into_one_task_with_all_ids() {
        let entries = vec![
            entry(1, 1, 42, "move", Some(json!({"to_folder": "Archive"}))),
            entry(2, 1, 42, "move", Some(json!({"to_folder": "Trash"}))),
        ];
        let tasks = coalesce_entries(entries);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].action_log_ids, vec![1, 2]);
        assert_eq!(tasks[0].extra_args, Some(json!({"to_folder": "Trash"})));
    }

    #[test]
    fn change_labels_net_effect_cancels_add_then_remove() {
        let entries = vec![
            entry(1, 1, 7, "change_labels", Some(json!({"added": ["work"], "removed": []}))),
            entry(2, 1, 7, "change_labels", Some(json!({"added": [], "removed": ["work"]}))),
            entry(3, 1, 7, "change_labels", Some(json!({"added": ["urgent"], "removed": []}))),
        ];
        let tasks = coalesce_entries(entries);
        assert_eq!(tasks.len(), 1);
        let args = tasks[0].extra_args.as_ref().unwrap();
        let added: HashSet<String> = args["added"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(added, HashSet::from(["urgent".to_string()]));
        assert!(args["removed"].as_array().unwrap().is_empty());
    }

    #[test]
    fn unrelated_actions_stay_as_individual_tasks() {
        let entries = vec![
            entry(1, 1, 5, "save_draft", None),
            entry(2, 1, 6, "save_draft", None),
        ];
        let tasks = coalesce_entries(entries);
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.action_log_ids.len() == 1));
    }

    #[test]
    fn different_records_do_not_merge() {
        let entries = vec![
            entry(1, 1, 1, "move", Some(json!({"to_folder": "A"}))),
            entry(2, 1, 2, "move", Some(json!({"to_folder": "B"}))),
        ];
        let tasks = coalesce_entries(entries);
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn shard_assignment_filters_by_process_and_total_shards() {
        let mut assignments = HashMap::new();
        assignments.insert("1".to_string(), vec![0, 1, 2, 3]);
        let config = SyncbackConfig::from_assignments(1, 0, 2, 4, &assignments);
        assert_eq!(config.owned_shards, vec![0, 2]);
        let config = SyncbackConfig::from_assignments(1, 1, 2, 4, &assignments);
        assert_eq!(config.owned_shards, vec![1, 3]);
    }
}
