// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Account- and folder-level synchronization engines (C5/C6/C7), grounded on
//! `inbox/mailsync/backends/imap/{generic,monitor,gmail}.py` and
//! `inbox/mailsync/gc.py`.

pub mod delete_handler;
pub mod folder;
pub mod gmail;
pub mod monitor;
pub mod session;

/// Cooperative shutdown signal shared by a Folder engine (C5), its owning
/// Account monitor (C6), and the Delete handler (C7): replaces the source's
/// `should_stop`/`kill_switch`-and-threading.Event pairing with one value
/// type callers can clone cheaply and wait on without polling.
#[derive(Clone)]
pub struct StopSignal {
    stopped: std::sync::Arc<std::sync::atomic::AtomicBool>,
    notify: std::sync::Arc<tokio::sync::Notify>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self {
            stopped: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: std::sync::Arc::new(tokio::sync::Notify::new()),
        }
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Sleeps for `duration`, waking early if `stop()` is called.
    pub async fn wait(&self, duration: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
    }
}

/// Constants lifted verbatim from `generic.py`.
pub mod constants {
    use std::time::Duration;

    pub const IDLE_WAIT: Duration = Duration::from_secs(60);
    pub const DEFAULT_POLL_FREQUENCY: Duration = Duration::from_secs(30);
    pub const INBOX_POLL_FREQUENCY: Duration = Duration::from_secs(10);
    pub const FAST_FLAGS_REFRESH_LIMIT: u32 = 100;
    pub const SLOW_FLAGS_REFRESH_LIMIT: u32 = 2000;
    pub const SLOW_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
    pub const FAST_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
    pub const MAX_UIDINVALID_RESYNCS: u32 = 5;
    pub const CONDSTORE_FLAGS_REFRESH_BATCH_SIZE: u32 = 200;
    pub const MAX_THREAD_LENGTH: usize = 500;
    /// Throttled accounts pause this long after every `THROTTLE_COUNT`
    /// downloads (`THROTTLE_WAIT` config knob, default below).
    pub const DEFAULT_THROTTLE_WAIT: Duration = Duration::from_secs(60);
    pub const DEFAULT_THROTTLE_COUNT: u32 = 200;
    /// How often sleeps/IMAP reads check the "should be killed" signal.
    pub const KILL_POLL_INTERVAL: Duration = Duration::from_millis(200);
}
