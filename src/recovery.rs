//! Failure classification and retry policy for platform calls.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use strum::Display;

use crate::{error::ClientError, message::MessageId, ratelimit::TokenBucket};

/// What to do about a failed platform call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Recovery {
    /// Platform-mandated pause; retry the same call afterwards
    Wait(Duration),
    /// Stale media reference; flush in-flight work and re-fetch
    Refresh,
    /// Give up on this message and move on
    Skip,
}

impl Recovery {
    pub fn classify(err: &ClientError) -> Self {
        match err {
            ClientError::RateLimited { seconds } => Self::Wait(Duration::from_secs(*seconds)),
            ClientError::ReferenceExpired => Self::Refresh,
            _ => Self::Skip,
        }
    }
}

/// Runs platform calls under the rate limiter and the retry policy.
///
/// Shared by the dispatch and upload stages. A rate-limit wait suspends only
/// the stage that issued the call.
#[derive(Debug)]
pub struct RecoveryController {
    limiter: Arc<TokenBucket>,
    max_reference_refreshes: u32,
    refreshes: Mutex<HashMap<MessageId, u32>>,
}

impl RecoveryController {
    pub fn new(limiter: Arc<TokenBucket>, max_reference_refreshes: u32) -> Self {
        Self {
            limiter,
            max_reference_refreshes,
            refreshes: Mutex::new(HashMap::new()),
        }
    }

    /// Issues `op`, taking a token before every attempt and sitting out
    /// platform-mandated waits.
    ///
    /// [`ClientError::RateLimited`] is never returned: the same call is retried
    /// after every wait the platform asks for. Every other error is returned as is.
    pub async fn call<T, F, Fut>(&self, message_id: MessageId, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut waits = 0u32;

        loop {
            self.limiter.acquire().await;

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match Recovery::classify(&err) {
                Recovery::Wait(wait) => {
                    waits += 1;
                    tracing::warn!(
                        message_id,
                        wait_secs = wait.as_secs(),
                        attempt = waits,
                        "Rate limited by the platform, waiting"
                    );
                    tokio::time::sleep(wait).await;
                }
                _ => return Err(err),
            }
        }
    }

    /// Records a flush caused by `message_id`.
    ///
    /// Returns `false` once the message has used up its refreshes, in which
    /// case it should be failed instead.
    pub fn allow_refresh(&self, message_id: MessageId) -> bool {
        let mut refreshes = self
            .refreshes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let count = refreshes.entry(message_id).or_insert(0);
        if *count >= self.max_reference_refreshes {
            return false;
        }
        *count += 1;
        true
    }
}
