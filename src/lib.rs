// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Multi-account IMAP sync core: the folder sync state machine (C5),
//! per-process scheduler (C8), and syncback action log processor (C9),
//! plus their supporting blob store, connection pool, local store, and
//! event queue layers.

pub mod blobstore;
pub mod config;
pub mod connection_pool;
pub mod heartbeat;
pub mod imap;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod syncback;

pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::imap::error::ImapError;
    pub use crate::imap::types::{
        Address, AppendEmailPayload, Email, Envelope, FlagOperation, Flags, Folder, MailboxInfo,
        ModifyFlagsPayload, SearchCriteria,
    };
    pub use crate::imap::session::AsyncImapSessionWrapper;
    pub use crate::store::{Account, LocalStore, StoreError};

    pub use log::{debug, error, info, trace, warn};
    pub use std::sync::Arc;
    pub use thiserror::Error;
    pub use tokio::sync::Mutex as TokioMutex;
    pub use uuid::Uuid;
}
