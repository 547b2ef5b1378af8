//! Staged media files and the uploads built from them.
//!
//! A staged file is owned by a [`TempPath`]: it is deleted when the entry is
//! dropped, whether that happens after an upload, after a failure or because a
//! flush discarded the entry.

use std::{
    io,
    path::{Path, PathBuf},
};

use tempfile::TempPath;
use tokio::io::AsyncReadExt;

use crate::{
    client::{MediaMetadata, MediaUpload, UploadSource},
    message::{Media, MediaKind, Message, MessageId},
};

/// Bytes read from the head of a file when sniffing its type.
const SNIFF_LEN: usize = 64;

/// A message paired with its downloaded media, awaiting upload.
#[derive(Debug)]
pub struct StagedEntry {
    pub message: Message,
    file: TempPath,
}

impl StagedEntry {
    pub fn new(message: Message, file: TempPath) -> Self {
        Self { message, file }
    }

    pub fn id(&self) -> MessageId {
        self.message.id
    }

    pub fn path(&self) -> &Path {
        &self.file
    }
}

/// Where the media of `message` is downloaded to.
///
/// Names are keyed by message id so concurrent downloads never share a path.
pub fn staging_path(dir: &Path, message: &Message) -> PathBuf {
    let original = message
        .media
        .as_ref()
        .and_then(Media::file)
        .and_then(|file| file.file_name.as_deref())
        .map(|name| name.replace(['/', '\\'], "_"))
        .filter(|name| !name.is_empty() && name != "." && name != "..");

    let name = match original {
        Some(name) => format!("message_{}_{name}", message.id),
        None => format!("message_{}_media", message.id),
    };

    dir.join(name)
}

/// Takes ownership of a downloaded file and gives it an extension if it has none.
pub async fn stage(message: Message, downloaded: PathBuf) -> io::Result<StagedEntry> {
    let file = TempPath::try_from_path(downloaded)?;

    let file = if file.extension().is_some() {
        file
    } else {
        repair_extension(file, &message).await?
    };

    Ok(StagedEntry::new(message, file))
}

async fn repair_extension(file: TempPath, message: &Message) -> io::Result<TempPath> {
    let mut head = [0u8; SNIFF_LEN];
    let read = tokio::fs::File::open(&*file).await?.read(&mut head).await?;

    let media = message.media.as_ref();
    let mime = media
        .and_then(Media::file)
        .and_then(|file| file.mime_type.as_deref());
    let kind = media.map(Media::kind).unwrap_or(MediaKind::Document);

    let extension = sniff_extension(&head[..read])
        .or_else(|| mime.and_then(|mime| extension_for_mime(mime, kind)))
        .unwrap_or_else(|| default_extension(kind));

    let renamed = file.with_extension(extension);
    file.persist(&renamed).map_err(|e| e.error)?;

    tracing::debug!(
        message_id = message.id,
        extension,
        path = %renamed.display(),
        "Repaired missing file extension"
    );

    TempPath::try_from_path(renamed)
}

/// Identifies common media containers by their leading bytes.
pub fn sniff_extension(head: &[u8]) -> Option<&'static str> {
    let at = |offset: usize, magic: &[u8]| head.get(offset..offset + magic.len()) == Some(magic);

    if at(0, &[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if at(0, b"\x89PNG\r\n\x1a\n") {
        Some("png")
    } else if at(0, b"GIF87a") || at(0, b"GIF89a") {
        Some("gif")
    } else if at(0, b"RIFF") && at(8, b"WEBP") {
        Some("webp")
    } else if at(0, b"RIFF") && at(8, b"WAVE") {
        Some("wav")
    } else if at(4, b"ftyp") {
        if at(8, b"qt  ") {
            Some("mov")
        } else {
            Some("mp4")
        }
    } else if at(0, &[0x1A, 0x45, 0xDF, 0xA3]) {
        if head.windows(4).any(|w| w == b"webm") {
            Some("webm")
        } else {
            Some("mkv")
        }
    } else if at(0, b"OggS") {
        Some("ogg")
    } else if at(0, b"ID3") || at(0, &[0xFF, 0xFB]) || at(0, &[0xFF, 0xF3]) || at(0, &[0xFF, 0xF2]) {
        Some("mp3")
    } else if at(0, b"%PDF") {
        Some("pdf")
    } else if at(0, b"PK\x03\x04") {
        Some("zip")
    } else {
        None
    }
}

/// Extension registered for `mime`, preferring the usual one for `kind`.
fn extension_for_mime(mime: &str, kind: MediaKind) -> Option<&'static str> {
    let candidates = mime_guess::get_mime_extensions_str(mime)?;
    let preferred = default_extension(kind);

    candidates
        .iter()
        .find(|ext| **ext == preferred)
        .or_else(|| candidates.first())
        .copied()
}

pub fn default_extension(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "jpg",
        MediaKind::Video | MediaKind::Animation => "mp4",
        MediaKind::Audio => "mp3",
        MediaKind::Voice => "ogg",
        MediaKind::Sticker => "webp",
        MediaKind::Document | MediaKind::Contact | MediaKind::Location | MediaKind::Poll => "bin",
    }
}

/// Builds the upload that recreates `message` in the destination chat.
///
/// Returns `None` for media without file content (contacts, locations, polls),
/// which can only be copied.
pub fn build_upload(
    message: &Message,
    source: UploadSource,
    caption: Option<String>,
    reply_to: Option<MessageId>,
) -> Option<MediaUpload> {
    let media = message.media.as_ref()?;

    let (file, metadata) = match media {
        Media::Photo(file) | Media::Document(file) | Media::Sticker(file) => {
            (file, MediaMetadata::default())
        }
        Media::Video {
            file,
            duration,
            width,
            height,
        }
        | Media::Animation {
            file,
            duration,
            width,
            height,
        } => (
            file,
            MediaMetadata {
                duration: Some(*duration),
                width: Some(*width),
                height: Some(*height),
                ..Default::default()
            },
        ),
        Media::Audio {
            file,
            duration,
            performer,
            title,
        } => (
            file,
            MediaMetadata {
                duration: Some(*duration),
                performer: performer.clone(),
                title: title.clone(),
                ..Default::default()
            },
        ),
        Media::Voice { file, duration } => (
            file,
            MediaMetadata {
                duration: Some(*duration),
                ..Default::default()
            },
        ),
        Media::Contact { .. } | Media::Location { .. } | Media::Poll { .. } => return None,
    };

    let file_name = file.file_name.clone().or_else(|| match &source {
        UploadSource::Local(path) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        UploadSource::Remote(_) => None,
    });

    Some(MediaUpload {
        origin_id: message.id,
        kind: media.kind(),
        source,
        file_name,
        caption,
        metadata,
        reply_to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FileInfo;

    #[test]
    fn test_sniff_extension() {
        assert_eq!(sniff_extension(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), Some("jpg"));
        assert_eq!(sniff_extension(b"\x89PNG\r\n\x1a\n...."), Some("png"));
        assert_eq!(sniff_extension(b"GIF89a......"), Some("gif"));
        assert_eq!(sniff_extension(b"RIFF\0\0\0\0WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_extension(b"RIFF\0\0\0\0WAVEfmt "), Some("wav"));
        assert_eq!(sniff_extension(b"\0\0\0\x18ftypisom...."), Some("mp4"));
        assert_eq!(sniff_extension(b"\0\0\0\x14ftypqt  ...."), Some("mov"));
        assert_eq!(sniff_extension(b"\x1a\x45\xdf\xa3\x93\x42\x82\x88webm"), Some("webm"));
        assert_eq!(sniff_extension(b"\x1a\x45\xdf\xa3\x93\x42\x82\x88matroska"), Some("mkv"));
        assert_eq!(sniff_extension(b"OggS\0\x02"), Some("ogg"));
        assert_eq!(sniff_extension(b"ID3\x04\0"), Some("mp3"));
        assert_eq!(sniff_extension(b"%PDF-1.7"), Some("pdf"));
        assert_eq!(sniff_extension(b"PK\x03\x04\x14\0"), Some("zip"));
        assert_eq!(sniff_extension(b"plain text"), None);
        assert_eq!(sniff_extension(b""), None);
    }

    #[test]
    fn test_staging_path_is_keyed_by_id() {
        let dir = Path::new("/tmp/stage");

        let named = Message::with_media(7, Media::Document(FileInfo::new("d").with_name("a/b.pdf")));
        assert_eq!(staging_path(dir, &named), dir.join("message_7_a_b.pdf"));

        let unnamed = Message::with_media(8, Media::Photo(FileInfo::new("p")));
        assert_eq!(staging_path(dir, &unnamed), dir.join("message_8_media"));
    }

    #[tokio::test]
    async fn test_stage_repairs_extension_from_content() {
        let dir = tempfile::tempdir().unwrap();
        let message = Message::with_media(3, Media::Photo(FileInfo::new("p")));
        let path = staging_path(dir.path(), &message);
        tokio::fs::write(&path, b"\x89PNG\r\n\x1a\nrest").await.unwrap();

        let entry = stage(message, path.clone()).await.unwrap();

        assert_eq!(entry.path(), dir.path().join("message_3_media.png"));
        assert!(entry.path().exists());
        assert!(!path.exists());

        let staged = entry.path().to_path_buf();
        drop(entry);
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_stage_falls_back_to_mime_then_kind() {
        let dir = tempfile::tempdir().unwrap();

        let message = Message::with_media(
            4,
            Media::Document(FileInfo::new("d").with_mime_type("application/pdf")),
        );
        let path = staging_path(dir.path(), &message);
        tokio::fs::write(&path, b"not a header").await.unwrap();
        let entry = stage(message, path).await.unwrap();
        assert_eq!(entry.path().extension().unwrap(), "pdf");

        let message = Message::with_media(
            5,
            Media::Voice {
                file: FileInfo::new("v"),
                duration: 2,
            },
        );
        let path = staging_path(dir.path(), &message);
        tokio::fs::write(&path, b"????").await.unwrap();
        let entry = stage(message, path).await.unwrap();
        assert_eq!(entry.path().extension().unwrap(), "ogg");
    }

    #[tokio::test]
    async fn test_stage_keeps_existing_extension() {
        let dir = tempfile::tempdir().unwrap();
        let message = Message::with_media(6, Media::Document(FileInfo::new("d").with_name("notes.txt")));
        let path = staging_path(dir.path(), &message);
        tokio::fs::write(&path, b"%PDF").await.unwrap();

        let entry = stage(message, path.clone()).await.unwrap();
        assert_eq!(entry.path(), path);
        assert!(entry.path().is_absolute());

        drop(entry);
        assert!(!path.exists());
    }

    #[test]
    fn test_build_upload_carries_metadata() {
        let message = Message::with_media(
            9,
            Media::Audio {
                file: FileInfo::new("a").with_name("song.mp3"),
                duration: 180,
                performer: Some("Band".into()),
                title: Some("Song".into()),
            },
        )
        .caption("listen");

        let upload = build_upload(
            &message,
            UploadSource::Local(PathBuf::from("/tmp/message_9_song.mp3")),
            message.outgoing_text(true),
            Some(42),
        )
        .unwrap();

        assert_eq!(upload.origin_id, 9);
        assert_eq!(upload.kind, MediaKind::Audio);
        assert_eq!(upload.file_name.as_deref(), Some("song.mp3"));
        assert_eq!(upload.caption.as_deref(), Some("listen"));
        assert_eq!(upload.metadata.duration, Some(180));
        assert_eq!(upload.metadata.performer.as_deref(), Some("Band"));
        assert_eq!(upload.reply_to, Some(42));

        let video = Message::with_media(
            10,
            Media::Video {
                file: FileInfo::new("v"),
                duration: 5,
                width: 1280,
                height: 720,
            },
        );
        let upload = build_upload(
            &video,
            UploadSource::Local(PathBuf::from("/tmp/message_10_media.mp4")),
            None,
            None,
        )
        .unwrap();
        assert_eq!(upload.file_name.as_deref(), Some("message_10_media.mp4"));
        assert_eq!(upload.metadata.width, Some(1280));
        assert_eq!(upload.metadata.height, Some(720));
    }

    #[test]
    fn test_build_upload_rejects_fileless_media() {
        let poll = Message::with_media(
            11,
            Media::Poll {
                question: "?".into(),
                options: vec!["a".into(), "b".into()],
            },
        );

        assert!(build_upload(&poll, UploadSource::Local(PathBuf::from("/x")), None, None).is_none());
        assert!(build_upload(&Message::text(12, "t"), UploadSource::Local(PathBuf::from("/x")), None, None).is_none());
    }
}
