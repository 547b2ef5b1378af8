//! Lazy, restartable walk over a chat's history.
//!
//! The platform only offers a newest-first "give me up to `limit` messages
//! around `offset_id`" call. [`HistoryCursor`] turns it into a single stream,
//! optionally oldest-first, that never repeats or skips a message across chunk
//! boundaries.
//!
//! Walking oldest-first works by asking for the `limit` messages *newer* than
//! `offset_id` (a negative `add_offset`) and reversing each chunk on receipt.

use std::{collections::VecDeque, sync::Arc};

use futures_util::{stream::BoxStream, StreamExt};

use crate::{
    chat::Chat,
    client::{ChatClient, ChunkRequest},
    config::MAX_CHUNK_SIZE,
    error::ClientError,
    message::{Message, MessageId},
};

pub struct HistoryCursor<C> {
    client: Arc<C>,
    chat: Chat,
    chunk_size: u32,
}

#[bon::bon]
impl<C: ChatClient> HistoryCursor<C> {
    pub fn new(client: Arc<C>, chat: Chat, chunk_size: u32) -> Self {
        Self {
            client,
            chat,
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
        }
    }

    pub fn chat(&self) -> &Chat {
        &self.chat
    }

    /// Id of the newest message in the chat right now, if there is one.
    pub async fn latest_id(&self) -> Result<Option<MessageId>, ClientError> {
        let request = ChunkRequest {
            offset_id: 0,
            add_offset: 0,
            limit: 1,
            max_id: 0,
            min_id: 0,
        };

        let chunk = self.client.fetch_history_chunk(&self.chat, request).await?;

        Ok(chunk.first().map(|m| m.id))
    }

    /// Streams the history.
    ///
    /// * `start_id`: first boundary. Oldest-first walks yield ids `>= start_id`
    ///   (0 or 1 means from the very beginning), newest-first walks yield ids
    ///   `< start_id` (0 means from the newest message).
    /// * `limit`: total number of messages to yield, unbounded when unset.
    /// * `until`: newest id to consider; later messages are left out.
    #[builder(finish_fn = stream)]
    pub fn iterate(
        &self,
        #[builder(default)] start_id: MessageId,
        #[builder(default)] reverse: bool,
        #[builder(default)] offset: i32,
        limit: Option<u64>,
        until: Option<MessageId>,
    ) -> BoxStream<'static, Result<Message, ClientError>> {
        let offset_id = match (start_id, reverse) {
            (0, true) => 1,
            (id, _) => id,
        };

        let walk = Walk {
            client: self.client.clone(),
            chat: self.chat.clone(),
            chunk_size: self.chunk_size,
            reverse,
            offset,
            offset_id,
            remaining: limit,
            until,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        futures_util::stream::try_unfold(walk, Walk::advance).boxed()
    }
}

struct Walk<C> {
    client: Arc<C>,
    chat: Chat,
    chunk_size: u32,
    reverse: bool,
    offset: i32,
    offset_id: MessageId,
    remaining: Option<u64>,
    until: Option<MessageId>,
    buffer: VecDeque<Message>,
    exhausted: bool,
}

impl<C: ChatClient> Walk<C> {
    async fn advance(mut self) -> Result<Option<(Message, Self)>, ClientError> {
        loop {
            if self.remaining == Some(0) {
                return Ok(None);
            }

            if let Some(message) = self.buffer.pop_front() {
                if self.until.is_some_and(|head| message.id > head) {
                    if self.reverse {
                        // Everything after this is newer still
                        return Ok(None);
                    }
                    continue;
                }

                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Ok(Some((message, self)));
            }

            if self.exhausted {
                return Ok(None);
            }

            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), ClientError> {
        let limit = match self.remaining {
            Some(remaining) => remaining.min(self.chunk_size as u64) as u32,
            None => self.chunk_size,
        };

        let add_offset = if self.reverse {
            -self.offset - limit as i32
        } else {
            self.offset
        };

        let request = ChunkRequest {
            offset_id: self.offset_id,
            add_offset,
            limit,
            max_id: 0,
            min_id: 0,
        };

        let mut chunk = self.client.fetch_history_chunk(&self.chat, request).await?;

        tracing::debug!(
            chat = self.chat.id,
            offset_id = self.offset_id,
            add_offset,
            limit,
            received = chunk.len(),
            "Fetched history chunk"
        );

        if self.reverse {
            chunk.reverse();
        }

        match chunk.last() {
            Some(last) => self.offset_id = last.id + i32::from(self.reverse),
            None => self.exhausted = true,
        }

        self.buffer.extend(chunk);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::TryStreamExt;

    use super::*;
    use crate::client::memory::{Fault, InMemoryClient, Operation};

    fn cursor(n: MessageId, chunk_size: u32) -> (Arc<InMemoryClient>, HistoryCursor<InMemoryClient>) {
        let client = Arc::new(InMemoryClient::new());
        let chat = Chat::new(-1001, false);
        client
            .add_chat(chat.clone())
            .push_history(chat.id, (1..=n).map(|id| Message::text(id, id.to_string())));
        (client.clone(), HistoryCursor::new(client, chat, chunk_size))
    }

    async fn collect(stream: BoxStream<'static, Result<Message, ClientError>>) -> Vec<MessageId> {
        stream
            .map_ok(|m| m.id)
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_reverse_walk_is_ascending_and_complete() {
        let (_, history) = cursor(250, 100);

        let ids = collect(history.iterate().reverse(true).stream()).await;

        assert_eq!(ids, (1..=250).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_forward_walk_is_descending_and_complete() {
        let (_, history) = cursor(250, 100);

        let ids = collect(history.iterate().stream()).await;

        assert_eq!(ids, (1..=250).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let (_, history) = cursor(37, 8);

        let first = collect(history.iterate().start_id(5).reverse(true).stream()).await;
        let second = collect(history.iterate().start_id(5).reverse(true).stream()).await;

        assert_eq!(first, second);
        assert_eq!(first, (5..=37).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_resume_from_cursor() {
        let (_, history) = cursor(30, 7);

        let head: Vec<_> = collect(history.iterate().reverse(true).limit(12).stream()).await;
        assert_eq!(head, (1..=12).collect::<Vec<_>>());

        let tail = collect(history.iterate().start_id(13).reverse(true).stream()).await;
        assert_eq!(tail, (13..=30).collect::<Vec<_>>());

        let older = collect(history.iterate().start_id(10).stream()).await;
        assert_eq!(older, (1..10).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_limit_bounds_chunk_requests() {
        let (client, history) = cursor(500, 100);

        let ids = collect(history.iterate().reverse(true).limit(150).stream()).await;

        assert_eq!(ids.len(), 150);
        let limits: Vec<u32> = client.fetches().iter().map(|r| r.limit).collect();
        assert_eq!(limits, vec![100, 50]);
        assert!(client.fetches().iter().all(|r| r.limit <= MAX_CHUNK_SIZE));
    }

    #[tokio::test]
    async fn test_until_stops_at_snapshot() {
        let (client, history) = cursor(20, 6);
        let head = history.latest_id().await.unwrap();
        assert_eq!(head, Some(20));

        client.push_history(history.chat().id, (21..=25).map(|id| Message::text(id, "late")));

        let ids = collect(history.iterate().reverse(true).maybe_until(head).stream()).await;
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());

        let ids = collect(history.iterate().maybe_until(head).stream()).await;
        assert_eq!(ids, (1..=20).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_history() {
        let (_, history) = cursor(0, 100);

        assert_eq!(history.latest_id().await.unwrap(), None);
        assert!(collect(history.iterate().reverse(true).stream()).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_errors_end_the_stream() {
        let (client, history) = cursor(10, 4);
        let mut stream = history.iterate().reverse(true).stream();

        for expected in 1..=4 {
            assert_eq!(stream.next().await.unwrap().unwrap().id, expected);
        }

        client.inject(Operation::Fetch, None, Fault::RateLimited(3));
        assert!(matches!(
            stream.next().await,
            Some(Err(ClientError::RateLimited { seconds: 3 }))
        ));
        assert!(stream.next().await.is_none());
    }
}
