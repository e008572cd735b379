use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("repository unreachable: {0}")]
    #[diagnostic(help("the source may be down; the next scheduled run will try again"))]
    Transport(String),

    #[error("repository rejected access (status {status:?}): {message}")]
    BadAccess { status: Option<u16>, message: String },

    #[error("OAI-PMH feed error: {0}")]
    OaiPmh(String),

    #[error("unexpected repository response: {0}")]
    ReposRead(String),

    #[error("cannot read remote user: {0}")]
    RemoteUserRead(String),

    #[error("experiment document registration failed: {0}")]
    MetsParse(String),

    #[error("missing config file repos-consumer.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid source url: {0}")]
    InvalidSource(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("catalog error: {0}")]
    Catalog(String),
}

impl HarvestError {
    pub fn bad_access(message: impl Into<String>) -> Self {
        HarvestError::BadAccess {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, HarvestError::Transport(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HarvestError::BadAccess { status, .. } => *status,
            _ => None,
        }
    }
}
