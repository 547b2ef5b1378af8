//! Boundary to the chat platform.
//!
//! The pipeline never talks to the platform directly. Everything it needs
//! (resolving chats, paging history, copying, re-sending text and media, pinning)
//! goes through a [`ChatClient`], supplied by the caller. Authentication, session
//! persistence and the wire protocol all live behind this trait.

use std::path::{Path, PathBuf};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    chat::{classify_peer_id, Chat, ChatRef, PeerKind},
    error::ClientError,
    message::{FileRef, MediaKind, Message, MessageId, ReplyMarkup},
};

pub mod memory;

/// Parameters of one raw history call.
///
/// The platform answers newest-first with at most `limit` messages, positioned
/// relative to `offset_id` and shifted by `add_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub offset_id: MessageId,
    pub add_offset: i32,
    pub limit: u32,
    pub max_id: MessageId,
    pub min_id: MessageId,
}

/// A message created in the destination chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub chat_id: i64,
    pub id: MessageId,
}

/// Server-side copy of an origin message into the destination chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyRequest {
    pub from_chat_id: i64,
    pub message_id: MessageId,
    /// Text or caption to send, already including any rendered button links
    pub text: Option<String>,
    pub reply_markup: Option<ReplyMarkup>,
    /// Topic (forum thread) to post into
    pub reply_to: Option<MessageId>,
}

/// A fresh text message, sent when a copy of a text message is refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingText {
    /// The origin message this text reproduces
    pub origin_id: MessageId,
    pub text: String,
    pub reply_markup: Option<ReplyMarkup>,
    pub reply_to: Option<MessageId>,
}

/// Result of a direct copy.
///
/// A restricted chat is an expected branch of the dispatch policy, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyResult {
    Sent(RemoteMessage),
    ForwardRestricted,
}

/// Where the bytes of an upload come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadSource {
    /// A file downloaded into the staging area
    Local(PathBuf),
    /// A file the platform already holds
    Remote(FileRef),
}

/// Kind-specific attributes carried over from the original media.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub duration: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub performer: Option<String>,
    pub title: Option<String>,
}

/// A media message to create in the destination chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaUpload {
    /// The origin message this upload reproduces
    pub origin_id: MessageId,
    pub kind: MediaKind,
    pub source: UploadSource,
    pub file_name: Option<String>,
    pub caption: Option<String>,
    pub metadata: MediaMetadata,
    pub reply_to: Option<MessageId>,
}

/// Operations the cloning pipeline needs from the chat platform.
///
/// Implementations report platform-mandated waits as
/// [`ClientError::RateLimited`] and stale media handles as
/// [`ClientError::ReferenceExpired`]; the pipeline recovers from both.
pub trait ChatClient: Send + Sync + 'static {
    /// Resolves a caller-supplied identifier to a chat handle.
    fn resolve_chat<'a>(&'a self, chat: &'a ChatRef) -> BoxFuture<'a, Result<Chat, ClientError>>;

    /// Fetches one chunk of history, newest-first.
    fn fetch_history_chunk<'a>(
        &'a self,
        chat: &'a Chat,
        request: ChunkRequest,
    ) -> BoxFuture<'a, Result<Vec<Message>, ClientError>>;

    /// Downloads the media of `message` to `destination`.
    ///
    /// # Returns
    /// The path actually written, which may differ from `destination` if the
    /// client adjusts the file name.
    fn download_media<'a>(
        &'a self,
        message: &'a Message,
        destination: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, ClientError>>;

    /// Copies a message server-side, reproducing text, caption and markup.
    fn send_direct_copy<'a>(
        &'a self,
        chat: &'a Chat,
        request: CopyRequest,
    ) -> BoxFuture<'a, Result<CopyResult, ClientError>>;

    /// Sends `message` to `chat` as a new, unforwarded text message.
    fn send_text<'a>(
        &'a self,
        chat: &'a Chat,
        message: OutgoingText,
    ) -> BoxFuture<'a, Result<RemoteMessage, ClientError>>;

    /// Creates a media message in `chat`.
    fn send_media<'a>(
        &'a self,
        chat: &'a Chat,
        upload: MediaUpload,
    ) -> BoxFuture<'a, Result<RemoteMessage, ClientError>>;

    fn pin_message<'a>(
        &'a self,
        chat: &'a Chat,
        message_id: MessageId,
    ) -> BoxFuture<'a, Result<(), ClientError>>;

    /// Peer-type inference for raw identifiers.
    ///
    /// Clients whose platform uses a different id convention override this.
    fn classify_peer(&self, id: i64) -> PeerKind {
        classify_peer_id(id)
    }
}
