//! In-memory implementation of the chat platform.
//!
//! Holds chats, their history and media content in memory and records every
//! call made against it. History paging reproduces the platform's semantics
//! (newest-first chunks positioned by `offset_id` + `add_offset`), and faults
//! can be scripted per operation and message. Primarily used for testing and
//! development environments.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use futures_util::future::BoxFuture;

use super::{
    ChatClient, ChunkRequest, CopyRequest, CopyResult, MediaUpload, OutgoingText, RemoteMessage,
    UploadSource,
};
use crate::{
    chat::{Chat, ChatRef},
    error::ClientError,
    message::{Message, MessageId},
};

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Fetch,
    Download,
    Copy,
    Text,
    Upload,
    Pin,
}

/// A scripted failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    RateLimited(u64),
    ReferenceExpired,
    /// Only meaningful for [`Operation::Copy`]
    ForwardRestricted,
    Other(String),
}

/// A recorded call against the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch(ChunkRequest),
    Download {
        message_id: MessageId,
        path: PathBuf,
    },
    Copy {
        chat_id: i64,
        request: CopyRequest,
    },
    Text {
        chat_id: i64,
        message: OutgoingText,
    },
    Upload {
        chat_id: i64,
        upload: MediaUpload,
        /// Size of the local file at upload time
        size: Option<u64>,
    },
    Pin {
        chat_id: i64,
        message_id: MessageId,
    },
}

/// A message created in a destination chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub origin_id: MessageId,
    pub remote: RemoteMessage,
}

#[derive(Default)]
struct State {
    history: HashMap<i64, Vec<Message>>,
    faults: Vec<(Operation, Option<MessageId>, Fault)>,
    calls: Vec<Call>,
    deliveries: HashMap<i64, Vec<Delivery>>,
    next_remote_id: HashMap<i64, MessageId>,
}

/// Thread-safe in-memory chat platform.
#[derive(Clone, Default)]
pub struct InMemoryClient {
    chats: Arc<papaya::HashMap<i64, Chat>>,
    usernames: Arc<papaya::HashMap<String, i64>>,
    content: Arc<papaya::HashMap<String, Bytes>>,
    state: Arc<Mutex<State>>,
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_chat(&self, chat: Chat) -> &Self {
        self.chats.pin().insert(chat.id, chat);
        self
    }

    pub fn add_username(&self, username: impl Into<String>, chat_id: i64) -> &Self {
        self.usernames.pin().insert(username.into(), chat_id);
        self
    }

    /// Appends messages to the history of `chat_id`.
    pub fn push_history(&self, chat_id: i64, messages: impl IntoIterator<Item = Message>) -> &Self {
        let mut state = self.state();
        let history = state.history.entry(chat_id).or_default();
        history.extend(messages);
        history.sort_by_key(|m| m.id);
        history.dedup_by_key(|m| m.id);
        drop(state);
        self
    }

    /// Removes messages from the history of `chat_id`, as a deletion in the chat would.
    pub fn delete_history(&self, chat_id: i64, ids: impl IntoIterator<Item = MessageId>) -> &Self {
        let ids: Vec<MessageId> = ids.into_iter().collect();
        let mut state = self.state();
        if let Some(history) = state.history.get_mut(&chat_id) {
            history.retain(|m| !ids.contains(&m.id));
        }
        drop(state);
        self
    }

    /// Sets the bytes served when a file with this reference is downloaded.
    pub fn set_content(&self, file_ref: impl Into<String>, bytes: impl Into<Bytes>) -> &Self {
        self.content.pin().insert(file_ref.into(), bytes.into());
        self
    }

    /// Scripts a one-shot failure for the next matching call.
    ///
    /// Calls are matched by message id, or by `offset_id` for history fetches.
    /// With `message_id: None` the fault matches any call of that operation.
    pub fn inject(&self, operation: Operation, message_id: Option<MessageId>, fault: Fault) -> &Self {
        self.state().faults.push((operation, message_id, fault));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn fetches(&self) -> Vec<ChunkRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Fetch(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn copies(&self) -> Vec<CopyRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Copy { request, .. } => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn texts(&self) -> Vec<OutgoingText> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Text { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn downloads(&self) -> Vec<(MessageId, PathBuf)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Download { message_id, path } => Some((message_id, path)),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<(MediaUpload, Option<u64>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Upload { upload, size, .. } => Some((upload, size)),
                _ => None,
            })
            .collect()
    }

    pub fn pins(&self) -> Vec<(i64, MessageId)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Pin {
                    chat_id,
                    message_id,
                } => Some((chat_id, message_id)),
                _ => None,
            })
            .collect()
    }

    /// Messages successfully created in `chat_id`, in creation order.
    pub fn deliveries(&self, chat_id: i64) -> Vec<Delivery> {
        self.state()
            .deliveries
            .get(&chat_id)
            .cloned()
            .unwrap_or_default()
    }

    fn take_fault(&self, operation: Operation, message_id: Option<MessageId>) -> Option<Fault> {
        let mut state = self.state();
        let index = state.faults.iter().position(|(op, id, _)| {
            *op == operation && (id.is_none() || message_id.is_none() || *id == message_id)
        })?;
        Some(state.faults.remove(index).2)
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }

    fn deliver(&self, chat_id: i64, origin_id: MessageId) -> RemoteMessage {
        let mut state = self.state();
        let next = state.next_remote_id.entry(chat_id).or_insert(1);
        let remote = RemoteMessage { chat_id, id: *next };
        *next += 1;
        state
            .deliveries
            .entry(chat_id)
            .or_default()
            .push(Delivery { origin_id, remote });
        remote
    }

    fn chunk(&self, chat_id: i64, request: ChunkRequest) -> Vec<Message> {
        let state = self.state();
        let Some(history) = state.history.get(&chat_id) else {
            return Vec::new();
        };

        let newest_first: Vec<&Message> = history
            .iter()
            .rev()
            .filter(|m| request.max_id <= 0 || m.id < request.max_id)
            .filter(|m| request.min_id <= 0 || m.id > request.min_id)
            .collect();

        let position = if request.offset_id == 0 {
            0
        } else {
            newest_first
                .iter()
                .position(|m| m.id < request.offset_id)
                .unwrap_or(newest_first.len())
        };

        let start = position as i64 + request.add_offset as i64;
        let end = (start + request.limit as i64).min(newest_first.len() as i64);
        let start = start.max(0);

        if start >= end {
            return Vec::new();
        }

        newest_first[start as usize..end as usize]
            .iter()
            .map(|m| (*m).clone())
            .collect()
    }
}

impl From<Fault> for ClientError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::RateLimited(seconds) => ClientError::rate_limited(seconds),
            Fault::ReferenceExpired => ClientError::ReferenceExpired,
            Fault::ForwardRestricted => ClientError::other("forward restricted"),
            Fault::Other(message) => ClientError::other(message),
        }
    }
}

impl ChatClient for InMemoryClient {
    fn resolve_chat<'a>(&'a self, chat: &'a ChatRef) -> BoxFuture<'a, Result<Chat, ClientError>> {
        Box::pin(async move {
            let id = match chat {
                ChatRef::Id(id) => *id,
                ChatRef::Username(name) => *self
                    .usernames
                    .pin()
                    .get(name)
                    .ok_or_else(|| ClientError::chat_not_found(chat.to_string()))?,
            };

            self.chats
                .pin()
                .get(&id)
                .cloned()
                .ok_or_else(|| ClientError::chat_not_found(chat.to_string()))
        })
    }

    fn fetch_history_chunk<'a>(
        &'a self,
        chat: &'a Chat,
        request: ChunkRequest,
    ) -> BoxFuture<'a, Result<Vec<Message>, ClientError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.record(Call::Fetch(request));

            if let Some(fault) = self.take_fault(Operation::Fetch, Some(request.offset_id)) {
                return Err(fault.into());
            }

            Ok(self.chunk(chat.id, request))
        })
    }

    fn download_media<'a>(
        &'a self,
        message: &'a Message,
        destination: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, ClientError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.record(Call::Download {
                message_id: message.id,
                path: destination.to_path_buf(),
            });

            if let Some(fault) = self.take_fault(Operation::Download, Some(message.id)) {
                return Err(fault.into());
            }

            let file = message
                .media
                .as_ref()
                .and_then(|media| media.file())
                .ok_or_else(|| ClientError::download(format!("message {} has no file", message.id)))?;

            let bytes = self
                .content
                .pin()
                .get(file.file_ref.as_str())
                .cloned()
                .unwrap_or_else(|| Bytes::from(format!("content of {}", file.file_ref.as_str())));

            tokio::fs::write(destination, &bytes).await?;

            Ok(destination.to_path_buf())
        })
    }

    fn send_direct_copy<'a>(
        &'a self,
        chat: &'a Chat,
        request: CopyRequest,
    ) -> BoxFuture<'a, Result<CopyResult, ClientError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let message_id = request.message_id;
            self.record(Call::Copy {
                chat_id: chat.id,
                request,
            });

            match self.take_fault(Operation::Copy, Some(message_id)) {
                Some(Fault::ForwardRestricted) => return Ok(CopyResult::ForwardRestricted),
                Some(fault) => return Err(fault.into()),
                None => {}
            }

            Ok(CopyResult::Sent(self.deliver(chat.id, message_id)))
        })
    }

    fn send_text<'a>(
        &'a self,
        chat: &'a Chat,
        message: OutgoingText,
    ) -> BoxFuture<'a, Result<RemoteMessage, ClientError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let origin_id = message.origin_id;
            self.record(Call::Text {
                chat_id: chat.id,
                message,
            });

            if let Some(fault) = self.take_fault(Operation::Text, Some(origin_id)) {
                return Err(fault.into());
            }

            Ok(self.deliver(chat.id, origin_id))
        })
    }

    fn send_media<'a>(
        &'a self,
        chat: &'a Chat,
        upload: MediaUpload,
    ) -> BoxFuture<'a, Result<RemoteMessage, ClientError>> {
        Box::pin(async move {
            tokio::task::yield_now().await;

            let size = match &upload.source {
                UploadSource::Local(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
                UploadSource::Remote(_) => None,
            };
            let origin_id = upload.origin_id;
            let is_missing = matches!(upload.source, UploadSource::Local(_)) && size.is_none();

            self.record(Call::Upload {
                chat_id: chat.id,
                upload,
                size,
            });

            if let Some(fault) = self.take_fault(Operation::Upload, Some(origin_id)) {
                return Err(fault.into());
            }

            if is_missing {
                return Err(ClientError::upload("local file does not exist"));
            }

            Ok(self.deliver(chat.id, origin_id))
        })
    }

    fn pin_message<'a>(
        &'a self,
        chat: &'a Chat,
        message_id: MessageId,
    ) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            self.record(Call::Pin {
                chat_id: chat.id,
                message_id,
            });

            match self.take_fault(Operation::Pin, Some(message_id)) {
                Some(fault) => Err(fault.into()),
                None => Ok(()),
            }
        })
    }
}
