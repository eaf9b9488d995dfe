use std::error::Error as StdError;
use thiserror::Error;
use async_imap::error::Error as AsyncImapError;
// imap_types imports removed
use std::fmt;
use async_imap;
use tokio_native_tls;

#[derive(Debug, Error, Clone)]
pub enum ImapError {
    #[error("Connection error: {0}")]
    Connection(String),
    
    #[error("TLS error: {0}")]
    Tls(String),
    
    #[error("Authentication error: {0}")]
    Auth(String),
    
    #[error("Invalid mailbox: {0}")]
    InvalidMailbox(String),
    
    #[error("Folder not found: {0}")]
    FolderNotFound(String),
    
    #[error("Folder already exists: {0}")]
    FolderExists(String),
    
    #[error("Email not found: {0:?}")]
    EmailNotFound(Vec<u32>),
    
    #[error("Envelope not found")]
    EnvelopeNotFound,
    
    #[error("Folder not selected")]
    FolderNotSelected,
    
    #[error("Operation requires folder selection: {0}")]
    RequiresFolderSelection(String),
    
    #[error("Fetch error: {0}")]
    Fetch(String),
    
    #[error("Operation error: {0}")]
    Operation(String),
    
    #[error("Command error: {0}")]
    Command(String),
    
    #[error("Flag error: {0}")]
    Flag(String),
    
    #[error("Invalid search criteria: {0}")]
    InvalidCriteria(String),
    
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Bad response: {0}")]
    BadResponse(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("No message bodies found")]
    NoBodies,

    #[error("No envelope found")]
    NoEnvelope,

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Other error: {0}")]
    Other(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    /// Remote UIDVALIDITY is greater than the value stored for this folder.
    /// Raised by the selector callback passed to `select_folder`; the folder
    /// sync state machine matches on this rather than catching an exception.
    #[error("UIDVALIDITY changed for folder {folder}: stored {stored}, remote {remote}")]
    UidInvalid {
        folder: String,
        stored: u32,
        remote: u32,
    },

    /// The folder no longer exists remotely (`[NONEXISTENT]` / "does not
    /// exist" responses). The folder engine exits cleanly on this.
    #[error("Folder missing: {0}")]
    FolderMissing(String),

    /// Remote HIGHESTMODSEQ is lower than the value stored for this folder
    /// (some servers report this after a restore). Treated the same as a
    /// UIDVALIDITY change: the folder engine forces a full resync rather
    /// than risk missing flag/label changes CONDSTORE catch-up can no
    /// longer account for.
    #[error("HIGHESTMODSEQ decreased for folder {folder}: stored {stored}, remote {remote}")]
    HighestModSeqDecreased {
        folder: String,
        stored: u64,
        remote: u64,
    },

    /// IMAP access has been disabled for this account (e.g. provider-side
    /// app-password revocation). Distinct from `Auth` so the monitor can
    /// mark the account invalid without retrying.
    #[error("IMAP disabled for account: {0}")]
    IMAPDisabled(String),
}

impl ImapError {
    /// Transient errors are retried by the outer retry wrapper; everything
    /// else is surfaced to the caller for explicit handling by the state
    /// machine or monitor.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ImapError::Connection(_)
                | ImapError::Tls(_)
                | ImapError::Timeout(_)
                | ImapError::Io(_)
        )
    }

    /// Marks the whole account invalid and halts sync without retry.
    pub fn is_account_fatal(&self) -> bool {
        matches!(self, ImapError::Validation(_) | ImapError::IMAPDisabled(_))
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(err: async_imap::error::Error) -> Self {
        match err {
            async_imap::error::Error::Parse(e) => ImapError::Parse(e.to_string()),
            async_imap::error::Error::No(msg) => ImapError::Operation(msg),
            async_imap::error::Error::Bad(msg) => ImapError::BadResponse(msg),
            async_imap::error::Error::Io(e) => ImapError::Connection(e.to_string()),
            async_imap::error::Error::Validate(e) => ImapError::Command(e.to_string()),
            _ => ImapError::Unknown(err.to_string()),
        }
    }
}

impl From<tokio_native_tls::native_tls::Error> for ImapError {
    fn from(err: tokio_native_tls::native_tls::Error) -> Self {
        ImapError::Tls(err.to_string())
    }
}

impl From<std::io::Error> for ImapError {
    fn from(err: std::io::Error) -> Self {
        ImapError::Connection(err.to_string())
    }
}

// Removed imap_types flag::ValidationError conversion



