//! Chat handles and identifiers.
//!
//! A [`ChatRef`] is what the caller hands in (a numeric id or a public
//! username). The client resolves it to a [`Chat`], which carries the
//! chat-level protection flag used by the dispatch policy.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Kind of peer a raw identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    User,
    Channel,
    Chat,
}

/// Marked ids at or below this are channels and supergroups (`-100` followed
/// by a twelve-digit channel id).
const CHANNEL_ID_BOUND: i64 = -1_000_000_000_000;

/// Classifies a raw peer identifier from its sign and range.
///
/// Non-negative ids are users, ids at or below `-10^12` are channels (and
/// supergroups), every other negative id is a basic group chat.
pub fn classify_peer_id(id: i64) -> PeerKind {
    if id >= 0 {
        PeerKind::User
    } else if id <= CHANNEL_ID_BOUND {
        PeerKind::Channel
    } else {
        PeerKind::Chat
    }
}

/// Identifier of a chat as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatRef {
    Id(i64),
    Username(String),
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Username(name) => write!(f, "@{name}"),
        }
    }
}

impl FromStr for ChatRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<i64>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Username(s.trim_start_matches('@').to_owned()),
        })
    }
}

impl From<i64> for ChatRef {
    fn from(id: i64) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for ChatRef {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(chat) => chat,
            Err(never) => match never {},
        }
    }
}

/// A resolved chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    /// Platform identifier of the chat
    pub id: i64,
    /// Display title, if the platform reported one
    pub title: Option<String>,
    /// Peer kind derived from the identifier
    pub kind: PeerKind,
    /// Chat-wide content protection ("no forwards")
    pub protected: bool,
}

impl Chat {
    pub fn new(id: i64, protected: bool) -> Self {
        Self {
            id,
            title: None,
            kind: classify_peer_id(id),
            protected,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn display_name(&self) -> String {
        match &self.title {
            Some(title) => format!("{title} ({})", self.id),
            None => self.id.to_string(),
        }
    }
}

/// Chats are equal when their ids are, regardless of the other fields.
impl PartialEq for Chat {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
