//! The cloning pipeline.
//!
//! [`Service::clone_chat`] runs three cooperating stages on the calling task:
//!
//! * **fetch** walks the origin history and fills the `pending` queue,
//! * **dispatch** drains `pending`, applies the [`DispatchPolicy`] and owns the
//!   [`Ledger`] of confirmed progress,
//! * **upload** drains the `staged` queue and reports each upload back to
//!   dispatch.
//!
//! When a media reference expires, dispatch flushes both queues and restarts
//! the fetch stage from the ledger's resume point.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    chat::{Chat, ChatRef},
    client::ChatClient,
    config::Config,
    cursor::{Cursor, Direction, Ledger},
    dispatch::{DispatchPolicy, FailureKind, Outcome, SkipReason, Uploader},
    error::{ClientError, Error},
    history::HistoryCursor,
    media::StagedEntry,
    message::{Message, MessageId},
    queue::{Stale, TransferQueue},
    ratelimit::TokenBucket,
    recovery::RecoveryController,
};

/// Result of one clone run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub sent: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Flush-and-resume cycles caused by expired media references
    pub flushes: u64,
    /// Pass this as `start_offset_id` to resume a later run
    pub last_processed_id: MessageId,
    /// The history walk ended on an error instead of reaching the end
    pub fetch_interrupted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tally {
    sent: u64,
    skipped: u64,
    failed: u64,
    flushes: u64,
}

/// Where the fetch stage should (re)start walking.
#[derive(Debug, Clone, Copy)]
struct Restart {
    start_id: MessageId,
    epoch: u64,
}

struct UploadReport {
    message_id: MessageId,
    result: Result<Outcome, ClientError>,
}

pub struct Service<C> {
    client: Arc<C>,
    config: Config,
    limiter: Arc<TokenBucket>,
}

impl<C: ChatClient> Service<C> {
    pub fn new(client: Arc<C>, config: Config) -> Self {
        let limiter = Arc::new(TokenBucket::new(
            config.initial_tokens(),
            config.messages_per_minute(),
            config.refill_interval(),
        ));

        Self {
            client,
            config,
            limiter,
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn resolve(&self, chat: &ChatRef) -> Result<Chat, Error> {
        self.client
            .resolve_chat(chat)
            .await
            .map_err(|source| Error::chat_resolution(chat.clone(), source))
    }

    /// Clones the history of `origin` into `destination`.
    ///
    /// `start_offset_id` is the `last_processed_id` of an earlier run (0 to start
    /// from scratch). With `topic_id`, everything is posted into that forum topic.
    ///
    /// Only failures that prevent the run from starting are returned as errors;
    /// per-message failures are counted in the [`Summary`].
    pub async fn clone_chat(
        &self,
        origin: &ChatRef,
        destination: &ChatRef,
        start_offset_id: MessageId,
        topic_id: Option<MessageId>,
    ) -> Result<Summary, Error> {
        let started_at = Utc::now();

        let origin = self.resolve(origin).await?;
        let destination = self.resolve(destination).await?;

        tracing::info!(
            origin = %origin.display_name(),
            origin_kind = %self.client.classify_peer(origin.id),
            protected = origin.protected,
            destination = %destination.display_name(),
            destination_kind = %self.client.classify_peer(destination.id),
            "Resolved chats"
        );

        let download_dir = self.config.download_dir();
        tokio::fs::create_dir_all(&download_dir).await?;

        let direction = self.config.direction();
        let history = HistoryCursor::new(
            self.client.clone(),
            origin.clone(),
            self.config.chunk_size(),
        );

        let Some(head) = self.snapshot_head(&history).await? else {
            tracing::info!("Origin chat has no messages");
            return Ok(Summary {
                sent: 0,
                skipped: 0,
                failed: 0,
                flushes: 0,
                last_processed_id: start_offset_id,
                fetch_interrupted: false,
                started_at,
                finished_at: Utc::now(),
            });
        };

        tracing::info!(head, start_offset_id, ?direction, "Starting clone");

        let recovery = Arc::new(RecoveryController::new(
            self.limiter.clone(),
            self.config.max_reference_refreshes(),
        ));

        let policy = DispatchPolicy::builder()
            .client(self.client.clone())
            .recovery(recovery.clone())
            .origin(origin)
            .destination(destination.clone())
            .download_dir(download_dir)
            .maybe_topic_id(topic_id)
            .inline_button_links(self.config.inline_button_links())
            .build();

        let uploader = Uploader::builder()
            .client(self.client.clone())
            .recovery(recovery.clone())
            .destination(destination)
            .maybe_topic_id(topic_id)
            .inline_button_links(self.config.inline_button_links())
            .build();

        let pending = TransferQueue::new(
            "pending",
            self.config.queue_capacity(),
            self.config.poll_interval(),
        );
        let staged = TransferQueue::new(
            "staged",
            self.config.queue_capacity(),
            self.config.poll_interval(),
        );

        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let ledger = Ledger::new(start_offset_id, direction);
        let first = Restart {
            start_id: ledger.cursor().resume_id(),
            epoch: pending.epoch(),
        };

        let fetch_interrupted = AtomicBool::new(false);

        let dispatcher = Dispatcher {
            policy,
            recovery,
            ledger,
            pending: &pending,
            staged: &staged,
            restarts: restart_tx,
            fetch_interrupted: &fetch_interrupted,
            tally: Tally::default(),
            fetch_finished: false,
        };

        let ((), (tally, last_processed_id), ()) = tokio::join!(
            self.fetch_stage(&history, &pending, head, first, restart_rx, &fetch_interrupted)
                .instrument(tracing::info_span!("stage", stage = "fetch")),
            dispatcher
                .run(report_rx)
                .instrument(tracing::info_span!("stage", stage = "dispatch")),
            upload_stage(&uploader, &staged, report_tx)
                .instrument(tracing::info_span!("stage", stage = "upload")),
        );

        let summary = Summary {
            sent: tally.sent,
            skipped: tally.skipped,
            failed: tally.failed,
            flushes: tally.flushes,
            last_processed_id,
            fetch_interrupted: fetch_interrupted.load(Ordering::Acquire),
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            sent = summary.sent,
            skipped = summary.skipped,
            failed = summary.failed,
            flushes = summary.flushes,
            last_processed_id = summary.last_processed_id,
            fetch_interrupted = summary.fetch_interrupted,
            "Clone finished"
        );

        Ok(summary)
    }

    /// Newest message id in the origin chat, sitting out rate limits.
    async fn snapshot_head(
        &self,
        history: &HistoryCursor<C>,
    ) -> Result<Option<MessageId>, Error> {
        loop {
            match history.latest_id().await {
                Ok(head) => return Ok(head),
                Err(ClientError::RateLimited { seconds }) => {
                    tracing::warn!(wait_secs = seconds, "Rate limited while reading history head");
                    tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                }
                Err(source) => return Err(Error::History { source }),
            }
        }
    }

    /// Feeds `pending` until the history is exhausted, restarting the walk
    /// whenever dispatch asks for it.
    ///
    /// Before closing `pending`, records in `interrupted` whether the walk
    /// ended on an error instead of reaching the end of the history.
    async fn fetch_stage(
        &self,
        history: &HistoryCursor<C>,
        pending: &TransferQueue<Message>,
        head: MessageId,
        first: Restart,
        mut restarts: mpsc::UnboundedReceiver<Restart>,
        interrupted: &AtomicBool,
    ) {
        let mut budget = FetchBudget::new(self.config.history_limit(), self.config.direction());
        let mut next = Some(first);

        loop {
            let restart = match next.take() {
                Some(restart) => restart,
                None => match restarts.recv().await {
                    Some(restart) => restart,
                    None => break,
                },
            };

            tracing::debug!(start_id = restart.start_id, epoch = restart.epoch, "Walking history");

            tokio::select! {
                biased;
                newer = restarts.recv() => match newer {
                    Some(newer) => next = Some(newer),
                    None => break,
                },
                end = self.walk(history, pending, head, restart, &mut budget) => {
                    if end != WalkEnd::Superseded {
                        interrupted.store(end == WalkEnd::Interrupted, Ordering::Release);
                        let _ = pending.close(restart.epoch);
                    }
                }
            }
        }
    }

    async fn walk(
        &self,
        history: &HistoryCursor<C>,
        pending: &TransferQueue<Message>,
        head: MessageId,
        restart: Restart,
        budget: &mut FetchBudget,
    ) -> WalkEnd {
        let direction = self.config.direction();
        let mut start_id = restart.start_id;

        'walk: loop {
            let mut messages = history
                .iterate()
                .start_id(start_id)
                .reverse(direction.is_reverse())
                .until(head)
                .stream();

            while let Some(item) = messages.next().await {
                let message = match item {
                    Ok(message) => message,
                    Err(ClientError::RateLimited { seconds }) => {
                        tracing::warn!(
                            wait_secs = seconds,
                            resume_from = start_id,
                            "Rate limited while fetching history"
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                        continue 'walk;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, resume_from = start_id, "History fetch failed");
                        return WalkEnd::Interrupted;
                    }
                };

                let id = message.id;

                if !budget.admits(id) {
                    tracing::info!(fetched = budget.fetched, "History limit reached");
                    return WalkEnd::Finished;
                }

                if let Err(Stale(_)) = pending.push(message, restart.epoch).await {
                    return WalkEnd::Superseded;
                }

                budget.record(id);
                start_id = Cursor::new(id, direction).resume_id();
            }

            tracing::info!(fetched = budget.fetched, "History walk complete");
            return WalkEnd::Finished;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkEnd {
    Finished,
    /// A flush retired this walk's epoch
    Superseded,
    Interrupted,
}

/// Counts distinct messages enqueued against the configured history limit.
///
/// Messages replayed after a restart are not counted twice.
#[derive(Debug)]
struct FetchBudget {
    limit: Option<u64>,
    direction: Direction,
    furthest: Option<MessageId>,
    fetched: u64,
}

impl FetchBudget {
    fn new(limit: Option<u64>, direction: Direction) -> Self {
        Self {
            limit,
            direction,
            furthest: None,
            fetched: 0,
        }
    }

    fn is_replay(&self, id: MessageId) -> bool {
        self.furthest
            .is_some_and(|furthest| self.direction.reached(id, furthest))
    }

    fn admits(&self, id: MessageId) -> bool {
        self.is_replay(id) || self.limit.map_or(true, |limit| self.fetched < limit)
    }

    fn record(&mut self, id: MessageId) {
        if !self.is_replay(id) {
            self.fetched += 1;
            self.furthest = Some(id);
        }
    }
}

async fn upload_stage<C: ChatClient>(
    uploader: &Uploader<C>,
    staged: &TransferQueue<StagedEntry>,
    reports: mpsc::UnboundedSender<UploadReport>,
) {
    while let Some(entry) = staged.dequeue().await {
        let message_id = entry.id();
        let result = uploader.upload(entry).await;

        if reports.send(UploadReport { message_id, result }).is_err() {
            break;
        }
    }
}

struct Dispatcher<'q, C> {
    policy: DispatchPolicy<C>,
    recovery: Arc<RecoveryController>,
    ledger: Ledger,
    pending: &'q TransferQueue<Message>,
    staged: &'q TransferQueue<StagedEntry>,
    restarts: mpsc::UnboundedSender<Restart>,
    fetch_interrupted: &'q AtomicBool,
    tally: Tally,
    fetch_finished: bool,
}

impl<C: ChatClient> Dispatcher<'_, C> {
    /// Runs until the fetch stage is done and every staged upload has reported.
    async fn run(mut self, mut reports: mpsc::UnboundedReceiver<UploadReport>) -> (Tally, MessageId) {
        loop {
            if self.fetch_finished && !self.ledger.has_in_flight() {
                break;
            }

            tokio::select! {
                biased;
                Some(report) = reports.recv() => self.on_report(report),
                message = self.pending.dequeue(), if !self.fetch_finished => match message {
                    Some(message) => self.on_message(message).await,
                    None => self.on_history_end(),
                },
                else => break,
            }
        }

        let _ = self.staged.close(self.staged.epoch());

        (self.tally, self.ledger.last_processed_id())
    }

    fn on_history_end(&mut self) {
        self.fetch_finished = true;

        // A complete walk returned every message that still exists
        if !self.fetch_interrupted.load(Ordering::Acquire) {
            self.ledger.release_requeued();
        }
    }

    async fn on_message(&mut self, message: Message) {
        let id = message.id;
        self.ledger.pass(id);

        if self.ledger.is_settled(id) {
            tracing::debug!(message_id = id, reason = %SkipReason::AlreadyProcessed, "Skipping re-fetched message");
            return;
        }
        if self.ledger.is_in_flight(id) {
            tracing::debug!(message_id = id, reason = %SkipReason::InFlight, "Skipping re-fetched message");
            return;
        }

        match self.policy.dispatch(message).await {
            Ok(Outcome::Deferred(entry)) => {
                self.ledger.defer(id);
                tracing::info!(message_id = id, outcome = "deferred", "Media staged for upload");

                if let Err(Stale(entry)) = self.staged.push(entry, self.staged.epoch()).await {
                    drop(entry);
                    self.ledger.abandon([id]);
                }
            }
            Ok(outcome) => self.record(id, outcome),
            Err(err) => self.recover(id, err),
        }
    }

    fn on_report(&mut self, report: UploadReport) {
        match report.result {
            Ok(outcome) => self.record(report.message_id, outcome),
            Err(err) => self.recover(report.message_id, err),
        }
    }

    fn record(&mut self, id: MessageId, outcome: Outcome) {
        if !outcome.is_terminal() {
            return;
        }

        match &outcome {
            Outcome::Sent(remote) => {
                self.tally.sent += 1;
                tracing::info!(message_id = id, remote_id = remote.id, outcome = outcome.label(), "Message sent");
            }
            Outcome::Skipped(reason) => {
                self.tally.skipped += 1;
                tracing::debug!(message_id = id, outcome = outcome.label(), %reason, "Message skipped");
            }
            Outcome::Failed(kind) => {
                self.tally.failed += 1;
                tracing::warn!(message_id = id, outcome = outcome.label(), %kind, "Message failed");
            }
            Outcome::Deferred(_) => {}
        }

        self.ledger.settle(id);
    }

    /// Handles an expired media reference raised while processing `id`.
    fn recover(&mut self, id: MessageId, err: ClientError) {
        if !self.recovery.allow_refresh(id) {
            tracing::warn!(message_id = id, error = %err, "Media reference keeps expiring");
            self.record(id, Outcome::Failed(FailureKind::ReferenceExpired));
            return;
        }

        let discarded_pending = self.pending.flush().len();
        let discarded: Vec<MessageId> = self.staged.flush().iter().map(StagedEntry::id).collect();

        self.ledger.abandon(discarded.iter().copied().chain([id]));
        self.tally.flushes += 1;
        self.fetch_finished = false;

        let restart = Restart {
            start_id: self.ledger.cursor().resume_id(),
            epoch: self.pending.epoch(),
        };

        tracing::warn!(
            message_id = id,
            resume_from = restart.start_id,
            discarded_pending,
            discarded_staged = discarded.len(),
            "Media reference expired, flushing queues"
        );

        if self.restarts.send(restart).is_err() {
            self.fetch_finished = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_counts_distinct_messages() {
        let mut budget = FetchBudget::new(Some(3), Direction::Reverse);

        for id in [1, 2, 3] {
            assert!(budget.admits(id));
            budget.record(id);
        }
        assert!(!budget.admits(4));

        // Replays after a restart are still admitted
        assert!(budget.admits(2));
        budget.record(2);
        assert_eq!(budget.fetched, 3);
    }

    #[test]
    fn test_budget_forward() {
        let mut budget = FetchBudget::new(Some(2), Direction::Forward);

        budget.record(10);
        budget.record(9);
        assert!(!budget.admits(8));
        assert!(budget.admits(10));
    }

    #[test]
    fn test_unlimited_budget() {
        let mut budget = FetchBudget::new(None, Direction::Reverse);
        for id in 1..1000 {
            budget.record(id);
        }
        assert!(budget.admits(1000));
    }

    #[test]
    fn test_summary_serializes() {
        let now = Utc::now();
        let summary = Summary {
            sent: 3,
            skipped: 1,
            failed: 0,
            flushes: 1,
            last_processed_id: 42,
            fetch_interrupted: false,
            started_at: now,
            finished_at: now,
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["last_processed_id"], 42);
        assert_eq!(json["sent"], 3);
    }
}
