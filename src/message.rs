//! Message types for the cloning pipeline.
//!
//! Messages are immutable snapshots of origin-chat history. They are created by
//! the fetch stage, flow through exactly one of direct-send or stage-for-upload,
//! and are discarded once their outcome is recorded.
//!
//! # Media
//!
//! Media is a tagged union ([`Media`]) so that every consumer (the dispatch policy,
//! the uploader, extension repair) matches over the full set of kinds at compile
//! time. Only kinds carrying re-uploadable file content ([`Media::requires_download`])
//! ever take the download-then-reupload path.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumDiscriminants, EnumString};

/// Platform identifier of a message. Monotonic within a chat.
pub type MessageId = i32;

/// Opaque remote reference to a file held by the platform.
///
/// References can go stale mid-run; the platform then answers with
/// [`ClientError::ReferenceExpired`](crate::error::ClientError::ReferenceExpired).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef(pub String);

impl FileRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// File content attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_ref: FileRef,
    /// Original file name, when the platform supplied one
    pub file_name: Option<String>,
    /// MIME type reported by the platform
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

impl FileInfo {
    pub fn new(file_ref: impl Into<String>) -> Self {
        Self {
            file_ref: FileRef(file_ref.into()),
            file_name: None,
            mime_type: None,
            size: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }
}

/// Media attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(name(MediaKind))]
#[strum_discriminants(derive(Display, EnumString, Hash, Serialize, Deserialize))]
#[strum_discriminants(strum(serialize_all = "lowercase"))]
#[strum_discriminants(serde(rename_all = "lowercase"))]
pub enum Media {
    Photo(FileInfo),
    Video {
        file: FileInfo,
        duration: u32,
        width: u32,
        height: u32,
    },
    Document(FileInfo),
    Audio {
        file: FileInfo,
        duration: u32,
        performer: Option<String>,
        title: Option<String>,
    },
    Voice {
        file: FileInfo,
        duration: u32,
    },
    Animation {
        file: FileInfo,
        duration: u32,
        width: u32,
        height: u32,
    },
    Sticker(FileInfo),
    Contact {
        phone_number: String,
        first_name: String,
        last_name: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    Poll {
        question: String,
        options: Vec<String>,
    },
}

impl Media {
    pub fn kind(&self) -> MediaKind {
        MediaKind::from(self)
    }

    /// File content backing this media, if any.
    pub fn file(&self) -> Option<&FileInfo> {
        match self {
            Self::Photo(file) | Self::Document(file) | Self::Sticker(file) => Some(file),
            Self::Video { file, .. }
            | Self::Audio { file, .. }
            | Self::Voice { file, .. }
            | Self::Animation { file, .. } => Some(file),
            Self::Contact { .. } | Self::Location { .. } | Self::Poll { .. } => None,
        }
    }

    /// Whether protected content of this kind must be downloaded and re-uploaded.
    ///
    /// Stickers are re-sent by reference; contacts, locations and polls carry no file.
    pub fn requires_download(&self) -> bool {
        match self {
            Self::Photo(_)
            | Self::Video { .. }
            | Self::Document(_)
            | Self::Audio { .. }
            | Self::Voice { .. }
            | Self::Animation { .. } => true,
            Self::Sticker(_) | Self::Contact { .. } | Self::Location { .. } | Self::Poll { .. } => {
                false
            }
        }
    }
}

/// A single inline keyboard button.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub url: Option<String>,
}

impl Button {
    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: Some(url.into()),
        }
    }

    pub fn callback(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            url: None,
        }
    }
}

/// Inline keyboard attached to a message, row by row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyMarkup {
    pub rows: Vec<Vec<Button>>,
}

impl ReplyMarkup {
    pub fn url_buttons(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rows
            .iter()
            .flatten()
            .filter_map(|b| b.url.as_deref().map(|url| (b.text.as_str(), url)))
    }
}

/// Snapshot of one origin-chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier, monotonic within the origin chat
    pub id: MessageId,
    pub date: Option<DateTime<Utc>>,
    /// Message text, or the caption when media is attached
    pub text: Option<String>,
    pub media: Option<Media>,
    pub reply_markup: Option<ReplyMarkup>,
    /// Service messages (joins, title changes, pins) are never cloned
    pub is_service: bool,
    /// Message-level content protection
    pub is_protected: bool,
    pub is_pinned: bool,
}

impl Message {
    pub fn text(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::empty(id)
        }
    }

    pub fn with_media(id: MessageId, media: Media) -> Self {
        Self {
            media: Some(media),
            ..Self::empty(id)
        }
    }

    pub fn service(id: MessageId) -> Self {
        Self {
            is_service: true,
            ..Self::empty(id)
        }
    }

    fn empty(id: MessageId) -> Self {
        Self {
            id,
            date: None,
            text: None,
            media: None,
            reply_markup: None,
            is_service: false,
            is_protected: false,
            is_pinned: false,
        }
    }

    pub fn caption(mut self, caption: impl Into<String>) -> Self {
        self.text = Some(caption.into());
        self
    }

    pub fn protected(mut self) -> Self {
        self.is_protected = true;
        self
    }

    pub fn pinned(mut self) -> Self {
        self.is_pinned = true;
        self
    }

    pub fn markup(mut self, markup: ReplyMarkup) -> Self {
        self.reply_markup = Some(markup);
        self
    }

    /// Text to send with a copy of this message.
    ///
    /// With `inline_links`, URL buttons are appended as markdown link lines since
    /// user accounts cannot attach inline keyboards of their own.
    pub fn outgoing_text(&self, inline_links: bool) -> Option<String> {
        let links = match (&self.reply_markup, inline_links) {
            (Some(markup), true) => markup
                .url_buttons()
                .map(|(label, url)| format!("**[{label}]({url})**"))
                .join("\n"),
            _ => String::new(),
        };

        match (&self.text, links.is_empty()) {
            (Some(text), true) => Some(text.clone()),
            (Some(text), false) => Some(format!("{text}\n{links}")),
            (None, false) => Some(links),
            (None, true) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_names() {
        let video = Media::Video {
            file: FileInfo::new("v1"),
            duration: 3,
            width: 640,
            height: 480,
        };
        assert_eq!(video.kind(), MediaKind::Video);
        assert_eq!(video.kind().to_string(), "video");
        assert_eq!("animation".parse::<MediaKind>().unwrap(), MediaKind::Animation);
    }

    #[test]
    fn test_requires_download() {
        assert!(Media::Photo(FileInfo::new("p")).requires_download());
        assert!(Media::Voice {
            file: FileInfo::new("v"),
            duration: 1
        }
        .requires_download());
        assert!(!Media::Sticker(FileInfo::new("s")).requires_download());
        assert!(!Media::Location {
            latitude: 0.0,
            longitude: 0.0
        }
        .requires_download());
        assert!(Media::Poll {
            question: "?".into(),
            options: vec![]
        }
        .file()
        .is_none());
    }

    #[test]
    fn test_outgoing_text_inlines_url_buttons() {
        let markup = ReplyMarkup {
            rows: vec![
                vec![Button::url("Site", "https://example.org")],
                vec![Button::callback("noop"), Button::url("Docs", "https://docs.example.org")],
            ],
        };
        let message = Message::text(1, "hello").markup(markup);

        assert_eq!(
            message.outgoing_text(true).unwrap(),
            "hello\n**[Site](https://example.org)**\n**[Docs](https://docs.example.org)**"
        );
        assert_eq!(message.outgoing_text(false).unwrap(), "hello");
        assert_eq!(Message::service(2).outgoing_text(true), None);
    }
}
