// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A tagged union replacing the reference implementation's dynamic
//! `provider_name` string dispatch to a class map (`monitor_cls_for` in
//! `inbox/mailsync/service.py`, `sync_engine_class` in
//! `inbox/mailsync/backends/imap/monitor.py`). Each variant carries the
//! behavior that used to live in a provider-specific subclass.

/// Folder-name normalization parameters for a generic (non-Gmail) IMAP
/// account: an account may specify a prefix (e.g. `"INBOX."`)
/// and separator (e.g. `"."`); API-visible names drop the prefix and use
/// `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderNaming {
    pub prefix: Option<String>,
    pub separator: char,
}

impl Default for FolderNaming {
    fn default() -> Self {
        Self {
            prefix: None,
            separator: '/',
        }
    }
}

impl FolderNaming {
    /// Converts a remote IMAP mailbox name to the API-visible path.
    pub fn to_display(&self, remote_name: &str) -> String {
        let stripped = match &self.prefix {
            Some(prefix) if remote_name.starts_with(prefix.as_str()) => {
                &remote_name[prefix.len()..]
            }
            _ => remote_name,
        };
        stripped.replace(self.separator, "/")
    }

    /// Reverses `to_display`, producing the name to send over the wire.
    pub fn to_remote(&self, display_name: &str) -> String {
        let swapped = display_name.replace('/', &self.separator.to_string());
        match &self.prefix {
            Some(prefix) => format!("{prefix}{swapped}"),
            None => swapped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Gmail,
    GenericImap,
    Microsoft,
}

impl Provider {
    /// Maps an `Account.provider` string to its variant, defaulting unknown
    /// values to `GenericImap` rather than failing account setup over a
    /// provider the dispatch table hasn't learned yet.
    pub fn from_account_provider(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "gmail" | "google" => Provider::Gmail,
            "microsoft" | "outlook" | "office365" => Provider::Microsoft,
            _ => Provider::GenericImap,
        }
    }

    /// Whether this provider exposes `X-GM-LABELS`/`X-GM-THRID`/`X-GM-MSGID`
    /// and should thread/label messages using them rather than
    /// References/In-Reply-To + subject heuristics.
    pub fn uses_gmail_extensions(self) -> bool {
        matches!(self, Provider::Gmail)
    }

    /// Whether flag/category storage is per-folder (classic IMAP, one
    /// category per message) or per-label (Gmail, many labels per message).
    pub fn category_type(self) -> CategoryType {
        match self {
            Provider::Gmail => CategoryType::Label,
            Provider::GenericImap | Provider::Microsoft => CategoryType::Folder,
        }
    }

    /// The canonical folder role this provider treats as the high-priority
    /// inbox, used for Inbox-only behaviors (10s poll frequency, IDLE,
    /// label-priority downloads).
    pub fn inbox_role(self) -> &'static str {
        "inbox"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryType {
    /// Classic IMAP: a Message belongs to exactly one folder/category.
    Folder,
    /// Gmail: a Message may carry many labels simultaneously.
    Label,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prefix_and_normalizes_separator() {
        let naming = FolderNaming {
            prefix: Some("INBOX.".to_string()),
            separator: '.',
        };
        assert_eq!(naming.to_display("INBOX.Sent.Drafts"), "Sent/Drafts");
        assert_eq!(naming.to_remote("Sent/Drafts"), "INBOX.Sent.Drafts");
    }

    #[test]
    fn no_prefix_is_passthrough_on_default_separator() {
        let naming = FolderNaming::default();
        assert_eq!(naming.to_display("INBOX"), "INBOX");
        assert_eq!(naming.to_remote("INBOX"), "INBOX");
    }

    #[test]
    fn gmail_uses_label_extensions() {
        assert!(Provider::Gmail.uses_gmail_extensions());
        assert!(!Provider::GenericImap.uses_gmail_extensions());
        assert_eq!(Provider::Gmail.category_type(), CategoryType::Label);
        assert_eq!(Provider::GenericImap.category_type(), CategoryType::Folder);
    }
}
