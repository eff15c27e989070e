//! Periodic pull of the server's message snapshot into the local cache.
//!
//! Ticks come from a [`Scheduler`] so tests can drive the loop by hand.
//! The loop is owned through a [`SyncHandle`]; stopping or dropping the
//! handle ends the loop, and a fetch that was already in flight is thrown
//! away instead of merged.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, Message},
    error::ClientResult,
    protocol::RemoteMessage,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::{
    events::{emit, ClientEvent, EventSender},
    gateway::RemoteGateway,
    message_store::{MergeOutcome, MessageStore},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Decides when the next sync tick fires.
#[async_trait]
pub trait Scheduler: Send {
    async fn next_tick(&mut self);
}

/// Fires immediately, then every `period`. Late ticks are delayed rather
/// than bunched up.
pub struct IntervalScheduler {
    interval: tokio::time::Interval,
}

impl IntervalScheduler {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Scheduler for IntervalScheduler {
    async fn next_tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Ticks whenever the paired sender is poked; never ticks once every
/// sender is gone.
pub struct ManualScheduler {
    rx: mpsc::UnboundedReceiver<()>,
}

impl ManualScheduler {
    pub fn channel() -> (mpsc::UnboundedSender<()>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn next_tick(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Merged { changed: bool },
    /// Cancelled while the fetch was in flight; nothing was applied.
    Discarded,
}

pub struct SyncLoop {
    gateway: Arc<RemoteGateway>,
    store: Arc<MessageStore>,
    events: EventSender,
    last_sync: watch::Sender<Option<DateTime<Utc>>>,
}

impl SyncLoop {
    pub fn new(gateway: Arc<RemoteGateway>, store: Arc<MessageStore>, events: EventSender) -> Self {
        Self {
            gateway,
            store,
            events,
            last_sync: watch::Sender::new(None),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        self.store.conversation_id()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.borrow()
    }

    pub fn snapshot_path(conversation_id: &ConversationId) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("conversationId", conversation_id.as_str())
            .finish();
        format!("/messages?{query}")
    }

    pub async fn fetch_snapshot(&self) -> ClientResult<Vec<Message>> {
        let conversation_id = self.conversation_id();
        let remote: Vec<RemoteMessage> = self
            .gateway
            .get_json(&Self::snapshot_path(conversation_id))
            .await?;
        Ok(remote
            .into_iter()
            .map(|m| m.into_message(conversation_id))
            .collect())
    }

    /// One fetch-and-merge round.
    ///
    /// Sends confirmed and deletes made while the fetch is in flight are
    /// newer than the snapshot, so the merge leaves them alone.
    pub async fn tick(&self, cancel: &CancellationToken) -> ClientResult<TickOutcome> {
        if cancel.is_cancelled() {
            return Ok(TickOutcome::Discarded);
        }
        let mark = self.store.fetch_mark().await;
        let snapshot = self.fetch_snapshot().await?;
        let received = snapshot.len();

        match self
            .store
            .merge_remote_unless_cancelled(mark, snapshot, cancel)
            .await?
        {
            MergeOutcome::Discarded => {
                debug!(
                    conversation_id = %self.conversation_id(),
                    "sync: loop cancelled during fetch, snapshot discarded"
                );
                Ok(TickOutcome::Discarded)
            }
            MergeOutcome::Applied { changed } => {
                self.last_sync.send_replace(Some(Utc::now()));
                debug!(
                    conversation_id = %self.conversation_id(),
                    received,
                    changed,
                    "sync: snapshot merged"
                );
                if changed {
                    emit(
                        &self.events,
                        ClientEvent::MessagesChanged {
                            conversation_id: self.conversation_id().clone(),
                            messages: self.store.snapshot().await,
                        },
                    );
                }
                Ok(TickOutcome::Merged { changed })
            }
        }
    }

    pub fn spawn<S>(self: Arc<Self>, scheduler: S) -> SyncHandle
    where
        S: Scheduler + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self).run(scheduler, cancel.clone()));
        SyncHandle {
            cancel,
            task: Some(task),
            sync: self,
        }
    }

    async fn run<S: Scheduler>(self: Arc<Self>, mut scheduler: S, cancel: CancellationToken) {
        let conversation_id = self.conversation_id().clone();
        info!(%conversation_id, "sync: loop started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = scheduler.next_tick() => {}
            }

            match self.tick(&cancel).await {
                Ok(TickOutcome::Merged { .. }) => {}
                Ok(TickOutcome::Discarded) => break,
                Err(err) if err.requires_reauth() => {
                    warn!(%conversation_id, %err, "sync: session rejected, stopping loop");
                    emit(&self.events, ClientEvent::SessionExpired);
                    break;
                }
                Err(err) => {
                    warn!(%conversation_id, %err, "sync: tick failed, cache left untouched");
                    emit(
                        &self.events,
                        ClientEvent::SyncFailed {
                            conversation_id: conversation_id.clone(),
                            error: err.to_string(),
                        },
                    );
                }
            }
        }

        info!(%conversation_id, "sync: loop stopped");
    }
}

/// Owner's handle on a running sync loop. Dropping it cancels the loop.
pub struct SyncHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    sync: Arc<SyncLoop>,
}

impl SyncHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.sync.last_sync()
    }

    /// Cancels the loop and waits for the task to wind down.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(%err, "sync: loop task ended abnormally");
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
