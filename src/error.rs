// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SSH connection failed: {0}")]
    Connection(String),

    #[error("Remote command failed (exit {code}): {stderr}")]
    Command { code: i32, stderr: String },

    /// The session itself was disrupted while the job ran, usually an operator
    /// killing the job on the host. Never retried.
    #[error("Remote job was interrupted on the host: {0}")]
    Interrupted(String),

    #[error("A vzdump job is already running on the host, refusing to start another")]
    Busy,

    #[error("No VMs or containers found on the host to back up")]
    NoGuests,

    #[error("vzdump finished but no archive path was discovered in its output")]
    NoArchive,

    #[error("Guest {0} already exists; enable force to replace it or skipExisting to leave it")]
    Conflict(String),

    #[error("Cannot determine restore target from '{0}'")]
    UnresolvedTarget(String),

    #[error("WebDAV negotiation failed, tried: {}", .0.join(", "))]
    Negotiation(Vec<String>),

    #[error("WebDAV request failed: {0}")]
    WebDav(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }

    pub fn webdav(msg: impl Into<String>) -> Self {
        Self::WebDav(msg.into())
    }

    /// Whether a fresh attempt under the retry policy could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Command { .. } | Self::Transfer(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_message_is_distinct_from_command_failure() {
        let interrupted = Error::Interrupted("unexpected control message".into());
        let command = Error::Command { code: 1, stderr: "unexpected control message".into() };
        assert_ne!(interrupted.to_string(), command.to_string());
        assert!(interrupted.to_string().contains("interrupted"));
        assert!(!interrupted.is_retryable());
        assert!(command.is_retryable());
    }

    #[test]
    fn test_negotiation_lists_every_url() {
        let e = Error::Negotiation(vec!["https://a/dav".into(), "https://a/webdav".into()]);
        let msg = e.to_string();
        assert!(msg.contains("https://a/dav"));
        assert!(msg.contains("https://a/webdav"));
    }

    #[test]
    fn test_busy_is_not_retryable() {
        assert!(!Error::Busy.is_retryable());
        assert!(!Error::Conflict("101".into()).is_retryable());
    }
}
