// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gmail-specific threading and label extensions (C5), grounded on
//! `inbox/mailsync/backends/gmail.py` and `inbox/models/backends/gmail.py`.
//!
//! Threading keys a Message to the Thread sharing its conversation: Gmail
//! exposes `X-GM-THRID` directly, so `thread_key_for` just tags it; every
//! other provider falls back to the References/In-Reply-To chain, and
//! failing that, a normalized Subject.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::provider::Provider;
use crate::store::{LocalStore, NamespaceId};

/// The key `folder.rs` looks up/creates a Thread under. `None` means this
/// message starts its own (unthreaded) conversation.
pub fn thread_key_for(
    provider: Provider,
    gmail_thrid: Option<&str>,
    in_reply_to: Option<&str>,
    references: &[String],
    subject: Option<&str>,
) -> Option<String> {
    if provider.uses_gmail_extensions() {
        return gmail_thrid.map(|thrid| format!("gmail:{thrid}"));
    }
    if let Some(root) = references.first().or(in_reply_to.as_ref().copied()) {
        return Some(format!("msgid:{}", root.trim()));
    }
    subject
        .map(normalize_subject)
        .filter(|s| !s.is_empty())
        .map(|s| format!("subject:{s}"))
}

/// Strips repeated `Re:`/`Fwd:`/`Fw:` reply prefixes and surrounding
/// whitespace, then lowercases, so "Re: Re: Hello" and "hello" group
/// together.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.trim_start().to_ascii_lowercase();
        let stripped = if let Some(rest) = lower.strip_prefix("re:") {
            Some(rest)
        } else if let Some(rest) = lower.strip_prefix("fwd:") {
            Some(rest)
        } else if let Some(rest) = lower.strip_prefix("fw:") {
            Some(rest)
        } else {
            None
        };
        match stripped {
            Some(rest) => {
                let consumed = s.trim_start().len() - rest.len();
                s = s.trim_start()[consumed..].trim_start();
            }
            None => break,
        }
    }
    s.to_ascii_lowercase()
}

/// The label changes `folder.rs` must apply to a Message's Category set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDiff {
    pub added: HashSet<String>,
    pub removed: HashSet<String>,
}

pub fn diff_labels(old: &HashSet<String>, new: &HashSet<String>) -> LabelDiff {
    LabelDiff {
        added: new.difference(old).cloned().collect(),
        removed: old.difference(new).cloned().collect(),
    }
}

/// Detects and repairs Gmail label renames. IMAP has no
/// native rename notification, so a rename is observed as every UID that
/// carried `old_name` now carrying `new_name` instead, with `old_name`
/// otherwise vanishing. Repointing the existing Category row (rather than
/// creating a fresh one under the new name) preserves the rows'
/// `message_categories` history. Gated behind a per-account semaphore since
/// a false-positive rename detection is expensive to correct by hand and
/// the source serializes these checks per account.
pub struct LabelRenameHandler {
    semaphore: Arc<Semaphore>,
}

impl Default for LabelRenameHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl LabelRenameHandler {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Renames `old_name` to `new_name` within `namespace_id`, provided no
    /// other rename is already in flight for this account's semaphore slot.
    pub async fn handle_rename(
        &self,
        store: &dyn LocalStore,
        namespace_id: NamespaceId,
        old_name: &str,
        new_name: &str,
    ) -> Result<(), crate::store::StoreError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        store.rename_category(namespace_id, old_name, new_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gmail_uses_thrid_directly() {
        let key = thread_key_for(Provider::Gmail, Some("123456"), None, &[], Some("Hello"));
        assert_eq!(key.as_deref(), Some("gmail:123456"));
    }

    #[test]
    fn generic_prefers_references_over_subject() {
        let refs = vec!["<root@example.com>".to_string()];
        let key = thread_key_for(Provider::GenericImap, None, None, &refs, Some("Hello"));
        assert_eq!(key.as_deref(), Some("msgid:<root@example.com>"));
    }

    #[test]
    fn generic_falls_back_to_normalized_subject() {
        let key = thread_key_for(Provider::GenericImap, None, None, &[], Some("Re: Re: Hello"));
        assert_eq!(key.as_deref(), Some("subject:hello"));
    }

    #[test]
    fn empty_subject_and_no_thread_info_is_unthreaded() {
        let key = thread_key_for(Provider::GenericImap, None, None, &[], None);
        assert_eq!(key, None);
    }

    #[test]
    fn normalizes_mixed_reply_forward_prefixes() {
        assert_eq!(normalize_subject("Fwd: RE: fw: Launch plan"), "launch plan");
        assert_eq!(normalize_subject("Launch plan"), "launch plan");
    }

    #[test]
    fn label_diff_computes_added_and_removed() {
        let old: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let new: HashSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        let diff = diff_labels(&old, &new);
        assert_eq!(diff.added, ["c"].iter().map(|s| s.to_string()).collect());
        assert_eq!(diff.removed, ["a"].iter().map(|s| s.to_string()).collect());
    }
}
