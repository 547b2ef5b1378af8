use snafu::Snafu;

use crate::chat::ChatRef;

/// Errors surfaced by a [`ChatClient`](crate::client::ChatClient) implementation.
///
/// `RateLimited` and `ReferenceExpired` are recoverable and drive the
/// [`RecoveryController`](crate::recovery::RecoveryController). Everything else is
/// treated as a per-message failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    #[snafu(display("Rate limited by the platform, retry in {seconds}s"))]
    RateLimited { seconds: u64 },

    #[snafu(display("Media reference expired"))]
    ReferenceExpired,

    #[snafu(display("Chat not found: {chat}"))]
    ChatNotFound { chat: String },

    #[snafu(display("Download failed: {message}"))]
    Download { message: String },

    #[snafu(display("Upload failed: {message}"))]
    Upload { message: String },

    #[snafu(display("I/O error"))]
    Io {
        #[snafu(source)]
        source: std::io::Error,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<std::io::Error> for ClientError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}

impl From<eyre::Report> for ClientError {
    fn from(e: eyre::Report) -> Self {
        Self::Whatever {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

impl ClientError {
    pub fn rate_limited(seconds: u64) -> Self {
        Self::RateLimited { seconds }
    }

    pub fn chat_not_found(chat: impl Into<String>) -> Self {
        Self::ChatNotFound { chat: chat.into() }
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::Download {
            message: message.into(),
        }
    }

    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Whatever {
            message: message.into(),
            source: None,
        }
    }
}

/// Top-level error returned by [`Service::clone_chat`](crate::service::Service::clone_chat).
///
/// Only failures that make the whole run impossible end up here. Per-message
/// failures are recorded as [`Outcome::Failed`](crate::dispatch::Outcome::Failed).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Could not resolve chat {chat}"))]
    ChatResolution {
        chat: ChatRef,
        #[snafu(source)]
        source: ClientError,
    },

    #[snafu(display("Could not read the origin history"))]
    History {
        #[snafu(source)]
        source: ClientError,
    },

    #[snafu(display("Invalid configuration"))]
    Config {
        #[snafu(source)]
        source: envy::Error,
    },

    #[snafu(display("Could not prepare the download directory"))]
    DownloadDir {
        #[snafu(source)]
        source: std::io::Error,
    },

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<envy::Error> for Error {
    fn from(source: envy::Error) -> Self {
        Self::Config { source }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::DownloadDir { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn chat_resolution(chat: ChatRef, source: ClientError) -> Self {
        Self::ChatResolution { chat, source }
    }

    /// Whether this error aborts the run before any message is touched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChatResolution { .. } | Self::History { .. } | Self::Config { .. }
        )
    }
}
