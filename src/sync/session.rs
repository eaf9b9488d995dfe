// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The IMAP session pool surface (C2) as consumed by the folder sync engine
//! (C5), grounded on `inbox/crispin.py`'s `CrispinClient`/`GmailCrispinClient`
//! split.
//!
//! `connection_pool.rs` already generalizes connection pooling to one pool
//! per account; this trait narrows that pool's capability surface down to
//! exactly the operations the folder engine issues against a *selected*
//! folder, so the state machine in `folder.rs` can be unit-tested against
//! `MockFolderSession` without a live server. The production adapter
//! (`ImapClientFolderSession`) translates these calls onto the existing
//! `ImapClient`/`AsyncImapOps` surface in `crate::imap`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::imap::error::ImapError;
use crate::store::Uid;

/// What this account's session advertises: CONDSTORE and IDLE are optional
/// extensions; `X-GM-EXT-1` is Gmail-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCapabilities {
    pub condstore: bool,
    pub idle: bool,
    pub gmail_ext: bool,
}

/// The subset of a `SELECT` response the engine acts on.
#[derive(Debug, Clone, Copy)]
pub struct SelectedFolder {
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub highest_mod_seq: Option<u64>,
}

/// A freshly-downloaded message as fetched by UID, prior to persistence.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: Uid,
    pub raw: Vec<u8>,
    pub internal_date: Option<DateTime<Utc>>,
    pub is_seen: bool,
    pub is_flagged: bool,
    pub is_draft: bool,
    /// Gmail only: `X-GM-THRID`, used as the thread key.
    pub gmail_thrid: Option<String>,
    /// Gmail only: `X-GM-LABELS`.
    pub labels: Option<HashSet<String>>,
}

/// A UID's flag/label state as observed by a flags-only fetch (slow/fast
/// refresh, or a CONDSTORE `CHANGEDSINCE` catch-up).
#[derive(Debug, Clone)]
pub struct UidFlags {
    pub uid: Uid,
    pub is_seen: bool,
    pub is_flagged: bool,
    pub modseq: Option<u64>,
    pub labels: Option<HashSet<String>>,
}

/// Raised by `select` in place of the source's `uidvalidity_cb` exception,
/// modeled as an explicit result rather than exceptions-for-control-flow.
/// `select` itself never returns this directly —
/// callers compare the returned `SelectedFolder::uidvalidity` against the
/// locally stored value and decide, since the comparison needs store state
/// the session has no access to.
pub fn is_uid_invalid(stored_uidvalidity: u32, remote_uidvalidity: u32) -> bool {
    remote_uidvalidity > stored_uidvalidity
}

/// The C2 surface the folder engine needs against one already-authenticated,
/// per-account session. A production implementation acquires a
/// `SessionHandle` from the account's `ConnectionPool` for the duration of
/// one engine tick and constructs one of these per tick (folders are
/// selected at the start of each handler call, matching the source's
/// `crispin_client.select_folder`).
#[async_trait]
pub trait FolderSession: Send + Sync {
    fn capabilities(&self) -> SessionCapabilities;

    /// `SELECT`s `folder_name`, returning the fields the engine tracks.
    /// Does not itself raise `UidInvalid` — see `is_uid_invalid`.
    async fn select(&self, folder_name: &str) -> Result<SelectedFolder, ImapError>;

    /// Full remote UID set for the selected folder (`UID SEARCH ALL`).
    async fn all_uids(&self) -> Result<HashSet<Uid>, ImapError>;

    /// UIDs strictly greater than `since` (`UID SEARCH UID since+1:*`), used
    /// by `check_uid_changes` once `UIDNEXT` has advanced.
    async fn uids_greater_than(&self, since: Uid) -> Result<Vec<Uid>, ImapError>;

    /// Gmail only: UIDs bearing `label` (`UID SEARCH X-GM-RAW
    /// "label:<label>"` or `X-GM-LABELS`), used both for All-Mail Inbox
    /// prioritization and by the label-rename handler.
    async fn uids_with_gmail_label(&self, label: &str) -> Result<HashSet<Uid>, ImapError>;

    /// `UID SEARCH SINCE <date>`, used to cap the All-Mail inbox-priority
    /// search to the last 30 days for very large mailboxes.
    async fn uids_since_internal_date(&self, since: DateTime<Utc>) -> Result<HashSet<Uid>, ImapError>;

    /// Downloads full messages (flags, internaldate, body, Gmail extensions)
    /// for the given UIDs.
    async fn fetch_messages(&self, uids: &[Uid]) -> Result<Vec<FetchedMessage>, ImapError>;

    /// Flags-only fetch for the given UIDs (slow/fast refresh cadences).
    async fn fetch_flags(&self, uids: &[Uid]) -> Result<Vec<UidFlags>, ImapError>;

    /// CONDSTORE catch-up: `UID FETCH 1:* (FLAGS MODSEQ) (CHANGEDSINCE
    /// modseq)`. Only called when `capabilities().condstore` is true.
    async fn fetch_flags_changed_since(&self, modseq: u64) -> Result<Vec<UidFlags>, ImapError>;

    /// Enters `IDLE` and returns after the server pushes a notification or
    /// `max_wait` elapses, whichever is first. Only called on the Inbox
    /// when `capabilities().idle` is true.
    async fn idle(&self, max_wait: Duration) -> Result<(), ImapError>;
}

/// Production adapter bridging `FolderSession` onto the existing
/// `ImapClient`/`AsyncImapOps` surface in `crate::imap`.
///
/// `imap/session.rs`'s `AsyncImapOps` trait does not yet expose typed
/// CONDSTORE (`MODSEQ`/`CHANGEDSINCE`) or Gmail (`X-GM-LABELS`/`X-GM-THRID`)
/// fetch items, so this adapter reports both capabilities as unsupported;
/// the folder engine already falls back to full flag-refresh polling and
/// generic threading in that case, so sync correctness is
/// preserved at the cost of the CONDSTORE/Gmail fast paths. Adding those
/// typed fetch items to `AsyncImapOps` is the concrete follow-up to lift
/// this adapter to the full capability set.
pub struct ImapClientFolderSession {
    client: std::sync::Arc<crate::imap::client::ImapClient<crate::imap::session::AsyncImapSessionWrapper>>,
}

impl ImapClientFolderSession {
    pub fn new(
        client: std::sync::Arc<crate::imap::client::ImapClient<crate::imap::session::AsyncImapSessionWrapper>>,
    ) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FolderSession for ImapClientFolderSession {
    fn capabilities(&self) -> SessionCapabilities {
        SessionCapabilities {
            condstore: false,
            idle: false,
            gmail_ext: false,
        }
    }

    async fn select(&self, folder_name: &str) -> Result<SelectedFolder, ImapError> {
        let status = self.client.session().select_with_status(folder_name).await?;
        Ok(SelectedFolder {
            uidvalidity: status.uidvalidity,
            uidnext: status.uidnext,
            highest_mod_seq: status.highest_mod_seq,
        })
    }

    async fn all_uids(&self) -> Result<HashSet<Uid>, ImapError> {
        let uids = self
            .client
            .search_emails(&crate::imap::types::SearchCriteria::All.to_string())
            .await?;
        Ok(uids.into_iter().collect())
    }

    async fn uids_greater_than(&self, since: Uid) -> Result<Vec<Uid>, ImapError> {
        let all = self.all_uids().await?;
        let mut v: Vec<Uid> = all.into_iter().filter(|u| *u > since).collect();
        v.sort_unstable();
        Ok(v)
    }

    async fn uids_with_gmail_label(&self, _label: &str) -> Result<HashSet<Uid>, ImapError> {
        Ok(HashSet::new())
    }

    async fn uids_since_internal_date(&self, since: DateTime<Utc>) -> Result<HashSet<Uid>, ImapError> {
        let uids = self
            .client
            .search_emails(&crate::imap::types::SearchCriteria::Since(since).to_string())
            .await?;
        Ok(uids.into_iter().collect())
    }

    async fn fetch_messages(&self, uids: &[Uid]) -> Result<Vec<FetchedMessage>, ImapError> {
        let emails = self.client.fetch_emails(uids).await?;
        Ok(emails
            .into_iter()
            .map(|e| FetchedMessage {
                uid: e.uid,
                raw: e.body.unwrap_or_default(),
                internal_date: e.internal_date,
                is_seen: e.flags.iter().any(|f| f == "\\Seen"),
                is_flagged: e.flags.iter().any(|f| f == "\\Flagged"),
                is_draft: e.flags.iter().any(|f| f == "\\Draft"),
                gmail_thrid: None,
                labels: None,
            })
            .collect())
    }

    async fn fetch_flags(&self, uids: &[Uid]) -> Result<Vec<UidFlags>, ImapError> {
        let emails = self.client.fetch_emails(uids).await?;
        Ok(emails
            .into_iter()
            .map(|e| UidFlags {
                uid: e.uid,
                is_seen: e.flags.iter().any(|f| f == "\\Seen"),
                is_flagged: e.flags.iter().any(|f| f == "\\Flagged"),
                modseq: None,
                labels: None,
            })
            .collect())
    }

    async fn fetch_flags_changed_since(&self, _modseq: u64) -> Result<Vec<UidFlags>, ImapError> {
        Ok(Vec::new())
    }

    async fn idle(&self, max_wait: Duration) -> Result<(), ImapError> {
        tokio::time::sleep(max_wait).await;
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    //! An in-memory `FolderSession` standing in for a live server, letting
    //! `folder.rs`'s state machine be exercised against UID sync, expunge
    //! detection, and UIDVALIDITY resync scenarios without network I/O.

    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, Default)]
    pub struct MockMessage {
        pub uid: Uid,
        pub raw: Vec<u8>,
        pub is_seen: bool,
        pub is_flagged: bool,
        pub is_draft: bool,
        pub gmail_thrid: Option<String>,
        pub labels: Option<HashSet<String>>,
        pub modseq: Option<u64>,
    }

    pub struct MockFolderSession {
        pub capabilities: SessionCapabilities,
        pub uidvalidity: Mutex<u32>,
        pub uidnext: Mutex<u32>,
        pub highest_mod_seq: Mutex<Option<u64>>,
        pub messages: Mutex<HashMap<Uid, MockMessage>>,
    }

    impl MockFolderSession {
        pub fn new(uidvalidity: u32) -> Self {
            Self {
                capabilities: SessionCapabilities::default(),
                uidvalidity: Mutex::new(uidvalidity),
                uidnext: Mutex::new(1),
                highest_mod_seq: Mutex::new(None),
                messages: Mutex::new(HashMap::new()),
            }
        }

        pub async fn insert(&self, msg: MockMessage) {
            let mut uidnext = self.uidnext.lock().await;
            *uidnext = (*uidnext).max(msg.uid + 1);
            self.messages.lock().await.insert(msg.uid, msg);
        }

        pub async fn remove(&self, uid: Uid) {
            self.messages.lock().await.remove(&uid);
        }

        pub async fn set_uidvalidity(&self, uidvalidity: u32) {
            *self.uidvalidity.lock().await = uidvalidity;
        }
    }

    #[async_trait]
    impl FolderSession for MockFolderSession {
        fn capabilities(&self) -> SessionCapabilities {
            self.capabilities
        }

        async fn select(&self, _folder_name: &str) -> Result<SelectedFolder, ImapError> {
            Ok(SelectedFolder {
                uidvalidity: *self.uidvalidity.lock().await,
                uidnext: *self.uidnext.lock().await,
                highest_mod_seq: *self.highest_mod_seq.lock().await,
            })
        }

        async fn all_uids(&self) -> Result<HashSet<Uid>, ImapError> {
            Ok(self.messages.lock().await.keys().copied().collect())
        }

        async fn uids_greater_than(&self, since: Uid) -> Result<Vec<Uid>, ImapError> {
            let mut v: Vec<Uid> = self
                .messages
                .lock()
                .await
                .keys()
                .copied()
                .filter(|u| *u > since)
                .collect();
            v.sort_unstable();
            Ok(v)
        }

        async fn uids_with_gmail_label(&self, label: &str) -> Result<HashSet<Uid>, ImapError> {
            Ok(self
                .messages
                .lock()
                .await
                .values()
                .filter(|m| m.labels.as_ref().is_some_and(|l| l.contains(label)))
                .map(|m| m.uid)
                .collect())
        }

        async fn uids_since_internal_date(&self, _since: DateTime<Utc>) -> Result<HashSet<Uid>, ImapError> {
            self.all_uids().await
        }

        async fn fetch_messages(&self, uids: &[Uid]) -> Result<Vec<FetchedMessage>, ImapError> {
            let messages = self.messages.lock().await;
            Ok(uids
                .iter()
                .filter_map(|u| messages.get(u))
                .map(|m| FetchedMessage {
                    uid: m.uid,
                    raw: m.raw.clone(),
                    internal_date: Some(Utc::now()),
                    is_seen: m.is_seen,
                    is_flagged: m.is_flagged,
                    is_draft: m.is_draft,
                    gmail_thrid: m.gmail_thrid.clone(),
                    labels: m.labels.clone(),
                })
                .collect())
        }

        async fn fetch_flags(&self, uids: &[Uid]) -> Result<Vec<UidFlags>, ImapError> {
            let messages = self.messages.lock().await;
            Ok(uids
                .iter()
                .filter_map(|u| messages.get(u))
                .map(|m| UidFlags {
                    uid: m.uid,
                    is_seen: m.is_seen,
                    is_flagged: m.is_flagged,
                    modseq: m.modseq,
                    labels: m.labels.clone(),
                })
                .collect())
        }

        async fn fetch_flags_changed_since(&self, modseq: u64) -> Result<Vec<UidFlags>, ImapError> {
            let messages = self.messages.lock().await;
            let mut out: Vec<UidFlags> = messages
                .values()
                .filter(|m| m.modseq.is_some_and(|ms| ms > modseq))
                .map(|m| UidFlags {
                    uid: m.uid,
                    is_seen: m.is_seen,
                    is_flagged: m.is_flagged,
                    modseq: m.modseq,
                    labels: m.labels.clone(),
                })
                .collect();
            out.sort_by_key(|f| f.modseq.unwrap_or(0));
            Ok(out)
        }

        async fn idle(&self, _max_wait: Duration) -> Result<(), ImapError> {
            Ok(())
        }
    }
}
