#![allow(unused_imports)]

// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.


// Public Interface for the IMAP module

pub mod atomic;
pub mod client;
pub mod error;
pub mod oauth2;
pub mod session;
pub mod types;
pub mod xoauth2;

// --- Re-exports ---
// Keep these minimal and focused on the public API

pub use client::ImapClient;
pub use error::ImapError;
pub use oauth2::{MicrosoftOAuth2Client, MicrosoftOAuth2Config, OAuth2Error, StoredToken, TokenResponse};
pub use session::{AsyncImapOps, AsyncImapSessionWrapper};
pub use types::{
    Address, Email, Envelope, FlagOperation, Flags, Folder, MailboxInfo, SearchCriteria,
    // Re-export necessary payload types if they are part of the public API
    AppendEmailPayload, ModifyFlagsPayload,
};
pub use xoauth2::XOAuth2Authenticator;

/// Result type for a ready-to-use, authenticated session.
pub type ImapSessionFactoryResult = Result<ImapClient<AsyncImapSessionWrapper>, ImapError>;