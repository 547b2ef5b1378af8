//! Per-message dispatch policy and the uploader.
//!
//! For every dequeued message, [`DispatchPolicy::dispatch`] decides between:
//!
//! 1. skipping it (service messages),
//! 2. downloading its media for re-upload, when protection forbids copying it,
//! 3. copying it server-side, falling back to (2), or to a fresh text message,
//!    if the platform reports the copy as restricted after all.
//!
//! Successful copies and uploads of pinned messages are pinned in the
//! destination. Pin failures are logged and otherwise ignored.

use std::{path::PathBuf, sync::Arc};

use strum::{Display, IntoStaticStr};

use crate::{
    chat::Chat,
    client::{ChatClient, CopyRequest, CopyResult, OutgoingText, RemoteMessage, UploadSource},
    error::ClientError,
    media::{self, StagedEntry},
    message::{Media, Message, MessageId},
    recovery::{Recovery, RecoveryController},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SkipReason {
    Service,
    /// Already has a terminal outcome in this run
    AlreadyProcessed,
    /// Re-fetched while its upload is still pending
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Download,
    Upload,
    /// Copy refused and the message has neither media nor text to re-send
    ForwardRestricted,
    /// Media reference kept expiring past the configured number of refreshes
    ReferenceExpired,
    Remote,
}

/// Result of processing one message.
#[derive(Debug, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    Sent(RemoteMessage),
    Skipped(SkipReason),
    /// Media downloaded; the entry must be handed to the upload stage
    Deferred(StagedEntry),
    Failed(FailureKind),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        self.into()
    }

    /// Whether the message is finished with, so the cursor may pass it.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Deferred(_))
    }
}

/// Turns a call error into a per-message failure, unless it calls for a flush.
///
/// Rate limits never get here: [`RecoveryController::call`] waits them out.
fn fail(err: ClientError, kind: FailureKind) -> Result<Outcome, ClientError> {
    match Recovery::classify(&err) {
        Recovery::Refresh => Err(err),
        Recovery::Wait(_) | Recovery::Skip => {
            tracing::warn!(error = %err, kind = %kind, "Platform call failed");
            Ok(Outcome::Failed(kind))
        }
    }
}

async fn pin_copy<C: ChatClient>(
    client: &C,
    recovery: &RecoveryController,
    destination: &Chat,
    message: &Message,
    remote: RemoteMessage,
) {
    if !message.is_pinned {
        return;
    }

    match recovery
        .call(message.id, || client.pin_message(destination, remote.id))
        .await
    {
        Ok(()) => tracing::debug!(message_id = message.id, remote_id = remote.id, "Pinned copy"),
        Err(e) => tracing::warn!(
            message_id = message.id,
            remote_id = remote.id,
            error = %e,
            "Failed to pin copy"
        ),
    }
}

/// Decides and carries out the transfer of a single message.
#[derive(bon::Builder)]
pub struct DispatchPolicy<C> {
    client: Arc<C>,
    recovery: Arc<RecoveryController>,
    origin: Chat,
    destination: Chat,
    download_dir: PathBuf,
    topic_id: Option<MessageId>,
    #[builder(default = true)]
    inline_button_links: bool,
}

impl<C: ChatClient> DispatchPolicy<C> {
    /// Processes `message`.
    ///
    /// Every failure is mapped to [`Outcome::Failed`] except an expired media
    /// reference, which is returned as an error so the caller can flush.
    pub async fn dispatch(&self, message: Message) -> Result<Outcome, ClientError> {
        if message.is_service {
            return Ok(Outcome::Skipped(SkipReason::Service));
        }

        let protected = self.origin.protected || message.is_protected;
        let downloadable = message
            .media
            .as_ref()
            .is_some_and(Media::requires_download);

        if protected && downloadable {
            return self.download(message).await;
        }

        let request = CopyRequest {
            from_chat_id: self.origin.id,
            message_id: message.id,
            text: message.outgoing_text(self.inline_button_links),
            reply_markup: message.reply_markup.clone(),
            reply_to: self.topic_id,
        };

        let copied = self
            .recovery
            .call(message.id, || {
                self.client
                    .send_direct_copy(&self.destination, request.clone())
            })
            .await;

        match copied {
            Ok(CopyResult::Sent(remote)) => {
                pin_copy(
                    &*self.client,
                    &self.recovery,
                    &self.destination,
                    &message,
                    remote,
                )
                .await;
                Ok(Outcome::Sent(remote))
            }
            Ok(CopyResult::ForwardRestricted) => self.restricted(message).await,
            Err(e) => fail(e, FailureKind::Remote),
        }
    }

    /// The platform refused a copy that the protection flags said was allowed.
    async fn restricted(&self, message: Message) -> Result<Outcome, ClientError> {
        tracing::warn!(
            message_id = message.id,
            "Copy refused as restricted, falling back to re-sending"
        );

        match &message.media {
            Some(media) if media.requires_download() => self.download(message).await,
            Some(Media::Sticker(file)) => {
                let source = UploadSource::Remote(file.file_ref.clone());
                self.send_by_reference(&message, source).await
            }
            _ => match message.outgoing_text(self.inline_button_links) {
                Some(text) => self.send_text(&message, text).await,
                None => Ok(Outcome::Failed(FailureKind::ForwardRestricted)),
            },
        }
    }

    async fn send_text(&self, message: &Message, text: String) -> Result<Outcome, ClientError> {
        let outgoing = OutgoingText {
            origin_id: message.id,
            text,
            reply_markup: message.reply_markup.clone(),
            reply_to: self.topic_id,
        };

        let sent = self
            .recovery
            .call(message.id, || {
                self.client.send_text(&self.destination, outgoing.clone())
            })
            .await;

        match sent {
            Ok(remote) => {
                pin_copy(
                    &*self.client,
                    &self.recovery,
                    &self.destination,
                    message,
                    remote,
                )
                .await;
                Ok(Outcome::Sent(remote))
            }
            Err(e) => fail(e, FailureKind::Remote),
        }
    }

    async fn send_by_reference(
        &self,
        message: &Message,
        source: UploadSource,
    ) -> Result<Outcome, ClientError> {
        let caption = message.outgoing_text(self.inline_button_links);
        let Some(upload) = media::build_upload(message, source, caption, self.topic_id) else {
            return Ok(Outcome::Failed(FailureKind::ForwardRestricted));
        };

        let sent = self
            .recovery
            .call(message.id, || {
                self.client.send_media(&self.destination, upload.clone())
            })
            .await;

        match sent {
            Ok(remote) => {
                pin_copy(
                    &*self.client,
                    &self.recovery,
                    &self.destination,
                    message,
                    remote,
                )
                .await;
                Ok(Outcome::Sent(remote))
            }
            Err(e) => fail(e, FailureKind::Upload),
        }
    }

    async fn download(&self, message: Message) -> Result<Outcome, ClientError> {
        let path = media::staging_path(&self.download_dir, &message);

        let downloaded = self
            .recovery
            .call(message.id, || self.client.download_media(&message, &path))
            .await;

        let downloaded = match downloaded {
            Ok(downloaded) => downloaded,
            Err(e) => {
                // Drop anything the client left behind
                let _ = tokio::fs::remove_file(&path).await;
                return fail(e, FailureKind::Download);
            }
        };

        match media::stage(message, downloaded).await {
            Ok(entry) => Ok(Outcome::Deferred(entry)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to stage download");
                Ok(Outcome::Failed(FailureKind::Download))
            }
        }
    }
}

/// Consumer of staged entries: recreates each one in the destination chat.
#[derive(bon::Builder)]
pub struct Uploader<C> {
    client: Arc<C>,
    recovery: Arc<RecoveryController>,
    destination: Chat,
    topic_id: Option<MessageId>,
    #[builder(default = true)]
    inline_button_links: bool,
}

impl<C: ChatClient> Uploader<C> {
    /// Uploads `entry`. The staged file is deleted when this returns, whatever
    /// the outcome.
    pub async fn upload(&self, entry: StagedEntry) -> Result<Outcome, ClientError> {
        let message = &entry.message;
        let caption = message.outgoing_text(self.inline_button_links);
        let source = UploadSource::Local(entry.path().to_path_buf());

        let Some(upload) = media::build_upload(message, source, caption, self.topic_id) else {
            return Ok(Outcome::Failed(FailureKind::Upload));
        };

        let sent = self
            .recovery
            .call(message.id, || {
                self.client.send_media(&self.destination, upload.clone())
            })
            .await;

        match sent {
            Ok(remote) => {
                pin_copy(
                    &*self.client,
                    &self.recovery,
                    &self.destination,
                    message,
                    remote,
                )
                .await;
                Ok(Outcome::Sent(remote))
            }
            Err(e) => fail(e, FailureKind::Upload),
        }
    }
}
