use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Author, ConversationId, Message, MessageId, Origin},
    error::{ClientError, ClientResult, ValidationError},
};
use storage::{message_cache_slot, KeyValueStore};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What is persisted in a conversation's cache slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CacheState {
    messages: Vec<Message>,
    /// Server ids removed locally whose deletion no snapshot has shown yet.
    #[serde(default)]
    tombstones: BTreeSet<MessageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Replaced,
    /// The placeholder was gone (deleted before the server answered).
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied { changed: bool },
    Discarded,
}

/// Position in the store's history when a snapshot fetch began.
///
/// Local confirmations and removals made after the mark are newer than
/// anything that snapshot can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchMark(u64);

/// In-memory state guarded by the store lock. Only `cache` is persisted.
#[derive(Debug, Default)]
struct Inner {
    cache: CacheState,
    generation: u64,
    /// Generation at which an id was last confirmed or removed locally.
    touched: HashMap<MessageId, u64>,
}

impl Inner {
    fn touch(&mut self, id: &MessageId) {
        self.generation += 1;
        self.touched.insert(id.clone(), self.generation);
    }

    fn mark(&self) -> FetchMark {
        FetchMark(self.generation)
    }

    fn newer_than(&self, mark: FetchMark) -> HashSet<MessageId> {
        self.touched
            .iter()
            .filter(|(_, generation)| **generation > mark.0)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Merges a server snapshot into the local sequence.
///
/// Server records win for ids present on both sides. Local-only entries
/// survive while they are unconfirmed or listed in `newer`; any other
/// confirmed entry the snapshot no longer lists is gone server-side.
/// Tombstoned ids stay hidden until a snapshot stops listing them, at which
/// point the tombstone is released unless the id is in `newer`.
///
/// `newer` holds ids confirmed or removed locally after the snapshot's
/// fetch began, which the snapshot cannot speak for.
pub fn merge_messages(
    local: &[Message],
    remote: Vec<Message>,
    tombstones: &mut BTreeSet<MessageId>,
    newer: &HashSet<MessageId>,
) -> Vec<Message> {
    let remote_ids: HashSet<MessageId> = remote.iter().map(|m| m.id.clone()).collect();
    tombstones.retain(|id| remote_ids.contains(id) || newer.contains(id));

    let mut remote_order = Vec::with_capacity(remote.len());
    let mut by_id: HashMap<MessageId, Message> = HashMap::with_capacity(remote.len());
    for mut message in remote {
        if tombstones.contains(&message.id) {
            continue;
        }
        message.origin = Origin::Confirmed;
        if by_id.insert(message.id.clone(), message.clone()).is_none() {
            remote_order.push(message.id);
        }
    }

    let mut merged = Vec::with_capacity(local.len() + by_id.len());
    for message in local {
        if let Some(server) = by_id.remove(&message.id) {
            merged.push(server);
        } else if message.is_local_only() || newer.contains(&message.id) {
            merged.push(message.clone());
        }
    }
    for id in remote_order {
        if let Some(server) = by_id.remove(&id) {
            merged.push(server);
        }
    }

    sort_by_created_at(&mut merged);
    merged
}

fn sort_by_created_at(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
}

fn dedupe_by_id(messages: &mut Vec<Message>) {
    let mut seen = HashSet::with_capacity(messages.len());
    messages.retain(|m| seen.insert(m.id.clone()));
}

/// Ordered, deduplicated and persisted cache of one conversation.
///
/// Every mutation builds the next state from a copy, writes it to storage
/// and only then swaps it in, all under one lock. A failed write leaves the
/// previous state in place.
pub struct MessageStore {
    conversation_id: ConversationId,
    slot: String,
    store: Arc<dyn KeyValueStore>,
    state: Mutex<Inner>,
}

impl MessageStore {
    pub async fn load(
        conversation_id: ConversationId,
        store: Arc<dyn KeyValueStore>,
    ) -> ClientResult<Self> {
        let slot = message_cache_slot(conversation_id.as_str());
        let raw = store.load(&slot).await.map_err(ClientError::storage)?;
        let state = match raw {
            None => CacheState::default(),
            Some(raw) => match serde_json::from_str::<CacheState>(&raw) {
                Ok(mut state) => {
                    dedupe_by_id(&mut state.messages);
                    sort_by_created_at(&mut state.messages);
                    state
                }
                Err(err) => {
                    warn!(%conversation_id, %err, "message_store: discarding unreadable cache");
                    CacheState::default()
                }
            },
        };
        debug!(
            %conversation_id,
            cached = state.messages.len(),
            "message_store: loaded"
        );

        Ok(Self {
            conversation_id,
            slot,
            store,
            state: Mutex::new(Inner {
                cache: state,
                ..Inner::default()
            }),
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.state.lock().await.cache.messages.clone()
    }

    pub async fn get(&self, id: &MessageId) -> Option<Message> {
        self.state
            .lock()
            .await
            .cache
            .messages
            .iter()
            .find(|m| &m.id == id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.cache.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn tombstones(&self) -> Vec<MessageId> {
        self.state.lock().await.cache.tombstones.iter().cloned().collect()
    }

    /// Take this before fetching a snapshot and hand it back to
    /// [`merge_fetched`](Self::merge_fetched).
    pub async fn fetch_mark(&self) -> FetchMark {
        self.state.lock().await.mark()
    }

    /// Merges a snapshot fetched just now. Returns whether the cache changed.
    pub async fn merge_remote(&self, server_messages: Vec<Message>) -> ClientResult<bool> {
        let mut guard = self.state.lock().await;
        let mark = guard.mark();
        self.merge_locked(&mut guard, mark, server_messages).await
    }

    /// Merges a snapshot whose fetch began at `mark`.
    pub async fn merge_fetched(
        &self,
        mark: FetchMark,
        server_messages: Vec<Message>,
    ) -> ClientResult<bool> {
        let mut guard = self.state.lock().await;
        self.merge_locked(&mut guard, mark, server_messages).await
    }

    /// Like [`merge_fetched`](Self::merge_fetched), but discards the
    /// snapshot if `cancel` fired before the lock was taken.
    pub async fn merge_remote_unless_cancelled(
        &self,
        mark: FetchMark,
        server_messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> ClientResult<MergeOutcome> {
        let mut guard = self.state.lock().await;
        if cancel.is_cancelled() {
            return Ok(MergeOutcome::Discarded);
        }
        let changed = self.merge_locked(&mut guard, mark, server_messages).await?;
        Ok(MergeOutcome::Applied { changed })
    }

    async fn merge_locked(
        &self,
        inner: &mut Inner,
        mark: FetchMark,
        server_messages: Vec<Message>,
    ) -> ClientResult<bool> {
        let conversation_id = &self.conversation_id;
        let server_messages: Vec<Message> = server_messages
            .into_iter()
            .filter(|m| &m.conversation_id == conversation_id)
            .collect();
        let newer = inner.newer_than(mark);

        let ((), changed) = self
            .commit_locked(&mut inner.cache, |next| {
                let local = std::mem::take(&mut next.messages);
                next.messages =
                    merge_messages(&local, server_messages, &mut next.tombstones, &newer);
            })
            .await?;
        // This snapshot has now spoken for everything touched up to `mark`.
        inner.touched.retain(|_, generation| *generation > mark.0);
        if changed {
            debug!(%conversation_id, "message_store: merged server snapshot");
        }
        Ok(changed)
    }

    /// Appends a pending entry and returns its placeholder id without
    /// waiting on the network.
    pub async fn append_local(&self, content: &str, author: &Author) -> ClientResult<MessageId> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }

        let message = Message {
            id: MessageId::local(),
            conversation_id: self.conversation_id.clone(),
            author_id: author.user_id.clone(),
            author_username: author.username.clone(),
            author_avatar_url: author.avatar_url.clone(),
            content: content.to_string(),
            created_at: Utc::now(),
            origin: Origin::Pending,
        };
        let id = message.id.clone();

        self.commit(|state| {
            state.messages.push(message);
            sort_by_created_at(&mut state.messages);
        })
        .await?;
        Ok(id)
    }

    /// Swaps the placeholder for the server's record, in place.
    pub async fn reconcile(
        &self,
        placeholder_id: &MessageId,
        confirmed: Message,
    ) -> ClientResult<ReconcileOutcome> {
        let mut confirmed = confirmed;
        confirmed.origin = Origin::Confirmed;
        let confirmed_id = confirmed.id.clone();

        let mut guard = self.state.lock().await;
        let (outcome, _) = self
            .commit_locked(&mut guard.cache, |state| {
                let Some(pos) = state.messages.iter().position(|m| &m.id == placeholder_id) else {
                    return ReconcileOutcome::Dropped;
                };

                // A sync tick may already have pulled the confirmed record in.
                match state.messages.iter().position(|m| m.id == confirmed.id) {
                    Some(existing) if existing != pos => {
                        state.messages[existing] = confirmed;
                        state.messages.remove(pos);
                    }
                    _ => state.messages[pos] = confirmed,
                }
                sort_by_created_at(&mut state.messages);
                ReconcileOutcome::Replaced
            })
            .await?;
        if outcome == ReconcileOutcome::Replaced {
            guard.touch(&confirmed_id);
        }
        Ok(outcome)
    }

    /// Removes an entry regardless of origin. Server ids are tombstoned so
    /// a stale snapshot cannot bring them back.
    pub async fn remove_local(&self, id: &MessageId) -> ClientResult<Option<Message>> {
        let mut guard = self.state.lock().await;
        let (removed, _) = self
            .commit_locked(&mut guard.cache, |state| {
                let pos = state.messages.iter().position(|m| &m.id == id)?;
                let removed = state.messages.remove(pos);
                if !removed.id.is_local() {
                    state.tombstones.insert(removed.id.clone());
                }
                Some(removed)
            })
            .await?;
        if removed.is_some() && !id.is_local() {
            guard.touch(id);
        }
        Ok(removed)
    }

    pub async fn set_origin(&self, id: &MessageId, origin: Origin) -> ClientResult<Option<Message>> {
        self.commit(|state| {
            let message = state.messages.iter_mut().find(|m| &m.id == id)?;
            message.origin = origin;
            Some(message.clone())
        })
        .await
    }

    pub async fn mark_failed(&self, id: &MessageId) -> ClientResult<Option<Message>> {
        self.set_origin(id, Origin::Failed).await
    }

    pub async fn mark_pending(&self, id: &MessageId) -> ClientResult<Option<Message>> {
        self.set_origin(id, Origin::Pending).await
    }

    pub async fn tombstone(&self, id: &MessageId) -> ClientResult<()> {
        if id.is_local() {
            return Ok(());
        }
        let mut guard = self.state.lock().await;
        self.commit_locked(&mut guard.cache, |state| {
            state.messages.retain(|m| &m.id != id);
            state.tombstones.insert(id.clone());
        })
        .await?;
        guard.touch(id);
        Ok(())
    }

    pub async fn release_tombstone(&self, id: &MessageId) -> ClientResult<bool> {
        let mut guard = self.state.lock().await;
        let (released, _) = self
            .commit_locked(&mut guard.cache, |state| state.tombstones.remove(id))
            .await?;
        if released {
            guard.touched.remove(id);
        }
        Ok(released)
    }

    async fn commit<R>(&self, mutate: impl FnOnce(&mut CacheState) -> R) -> ClientResult<R> {
        let mut guard = self.state.lock().await;
        let (out, _) = self.commit_locked(&mut guard.cache, mutate).await?;
        Ok(out)
    }

    async fn commit_locked<R>(
        &self,
        state: &mut CacheState,
        mutate: impl FnOnce(&mut CacheState) -> R,
    ) -> ClientResult<(R, bool)> {
        let mut next = state.clone();
        let out = mutate(&mut next);
        if next == *state {
            return Ok((out, false));
        }

        let encoded = serde_json::to_string(&next).map_err(ClientError::storage)?;
        if let Err(err) = self.store.save(&self.slot, &encoded).await {
            let detail = format!("{err:#}");
            warn!(
                conversation_id = %self.conversation_id,
                error = %detail,
                "message_store: persist failed, keeping previous state"
            );
            return Err(ClientError::storage(err));
        }

        *state = next;
        Ok((out, true))
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
