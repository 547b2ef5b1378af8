use std::sync::Arc;

use chat::ChatRef;
use client::ChatClient;
use config::Config;
use message::MessageId;
use service::{Service, Summary};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod chat;
pub mod client;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod media;
pub mod message;
pub mod queue;
pub mod ratelimit;
pub mod recovery;
pub mod service;

/// Returns a builder for a single clone run.
///
/// Installs the global log subscriber, loads [`Config`] from `CHATCLONER_*`
/// environment variables and clones `origin` into `destination`.
#[bon::builder(finish_fn = start)]
pub async fn run<C>(
    client: C,
    #[builder(into)] origin: ChatRef,
    #[builder(into)] destination: ChatRef,
    #[builder(default)] start_offset_id: MessageId,
    topic_id: Option<MessageId>,
) -> eyre::Result<Summary>
where
    C: ChatClient,
{
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("CHATCLONER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("CHATCLONER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let service = Service::new(Arc::new(client), config);

    let summary = service
        .clone_chat(&origin, &destination, start_offset_id, topic_id)
        .await?;

    Ok(summary)
}
