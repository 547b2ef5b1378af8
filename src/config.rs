use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::cursor::Direction;

/// Platform ceiling on messages returned by one history call.
pub const MAX_CHUNK_SIZE: u32 = 100;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub download_dir: Option<PathBuf>,
    pub messages_per_minute: Option<u32>,
    pub initial_tokens: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub chunk_size: Option<u32>,
    pub history_limit: Option<u64>,
    pub reverse: Option<bool>,
    pub queue_capacity: Option<usize>,
    pub max_reference_refreshes: Option<u32>,
    pub inline_button_links: Option<bool>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("CHATCLONER_").from_env::<Self>()?)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("downloads"))
    }

    /// Bucket capacity. Sending is limited to this many calls per minute.
    pub fn messages_per_minute(&self) -> u32 {
        self.messages_per_minute.unwrap_or(20).max(1)
    }

    pub fn initial_tokens(&self) -> u32 {
        self.initial_tokens.unwrap_or(1)
    }

    /// Time for the bucket to regain one token.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(60) / self.messages_per_minute()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(5_000))
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
            .unwrap_or(MAX_CHUNK_SIZE)
            .clamp(1, MAX_CHUNK_SIZE)
    }

    pub fn history_limit(&self) -> Option<u64> {
        self.history_limit.filter(|limit| *limit > 0)
    }

    pub fn direction(&self) -> Direction {
        if self.reverse.unwrap_or(true) {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(200).max(1)
    }

    pub fn max_reference_refreshes(&self) -> u32 {
        self.max_reference_refreshes.unwrap_or(3)
    }

    pub fn inline_button_links(&self) -> bool {
        self.inline_button_links.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.messages_per_minute(), 20);
        assert_eq!(config.refill_interval(), Duration::from_secs(3));
        assert_eq!(config.chunk_size(), 100);
        assert_eq!(config.history_limit(), None);
        assert_eq!(config.direction(), Direction::Reverse);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert!(config.inline_button_links());
    }

    #[test]
    fn test_chunk_size_is_clamped() {
        let config = Config {
            chunk_size: Some(500),
            ..Default::default()
        };
        assert_eq!(config.chunk_size(), MAX_CHUNK_SIZE);

        let config = Config {
            chunk_size: Some(0),
            ..Default::default()
        };
        assert_eq!(config.chunk_size(), 1);
    }

    #[test]
    fn test_load_from_env() {
        let vars = vec![
            ("CHATCLONER_MESSAGES_PER_MINUTE".to_owned(), "30".to_owned()),
            ("CHATCLONER_REVERSE".to_owned(), "false".to_owned()),
            ("CHATCLONER_DOWNLOAD_DIR".to_owned(), "/tmp/clone".to_owned()),
        ];

        let config: Config = envy::prefixed("CHATCLONER_").from_iter(vars).unwrap();

        assert_eq!(config.refill_interval(), Duration::from_secs(2));
        assert_eq!(config.direction(), Direction::Forward);
        assert_eq!(config.download_dir(), PathBuf::from("/tmp/clone"));
    }
}
