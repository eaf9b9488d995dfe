// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Sync process entrypoint: one process runs a [`Scheduler`] (C8, owning
//! every account assigned to `{hostname}:{process_number}`) and a
//! [`SyncbackService`] (C9, applying this process's shard of pending
//! ActionLog entries) side by side, until SIGINT/SIGTERM.

use std::sync::Arc;

use log::{error, info};
use rustymail::blobstore::{FsBlobStore, RawMimeStore};
use rustymail::config::{process_identifier, Settings};
use rustymail::heartbeat::InMemoryHeartbeatStore;
use rustymail::queue::InMemoryEventQueue;
use rustymail::scheduler::{Scheduler, SchedulerConfig};
use rustymail::store::sqlite::SqliteStore;
use rustymail::sync::monitor::ImapFolderSessionFactory;
use rustymail::sync::StopSignal;
use rustymail::syncback::{ImapSyncbackExecutor, SyncbackConfig, SyncbackService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let settings = Settings::new(None)?;
    let hostname = hostname()?;
    let process_id = process_identifier(&hostname, settings.process_number);
    info!("starting sync process {process_id}");

    let store = Arc::new(SqliteStore::connect(&settings.database_url).await?);
    let blobstore = Arc::new(RawMimeStore::new(
        FsBlobStore::new("data/blobs"),
        settings.sync.compress_raw_mime,
    ));
    let heartbeat_store = InMemoryHeartbeatStore::new();

    let shared_queue = InMemoryEventQueue::new(format!("sync:shared:{}", hostname));
    let private_queue = InMemoryEventQueue::new(format!("sync:private:{process_id}"));

    let mut scheduler_config = SchedulerConfig::new(process_id.clone());
    scheduler_config.max_accounts_per_process = settings.sync.max_accounts_per_process;
    let scheduler = Arc::new(Scheduler::new(
        scheduler_config,
        store.clone(),
        blobstore.clone(),
        heartbeat_store,
        ImapFolderSessionFactory,
        shared_queue,
        private_queue,
    ));

    let syncback_config = SyncbackConfig::from_assignments(
        settings.process_number as i64,
        settings.process_number as i64,
        1,
        1,
        &settings.sync.syncback_assignments,
    );
    let syncback = Arc::new(SyncbackService::new(
        syncback_config,
        store.clone(),
        ImapSyncbackExecutor,
        StopSignal::new(),
    ));

    let scheduler_task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(err) = scheduler.run().await {
                error!("scheduler exited: {err}");
            }
        })
    };
    let syncback_task = {
        let syncback = syncback.clone();
        tokio::spawn(async move {
            if let Err(err) = syncback.run().await {
                error!("syncback service exited: {err}");
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested for {process_id}");
    scheduler.stop_signal().stop();
    syncback.stop_signal().stop();
    let _ = scheduler_task.await;
    let _ = syncback_task.await;
    info!("sync process {process_id} stopped");
    Ok(())
}

fn hostname() -> std::io::Result<String> {
    let mut buf = vec![0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}
