use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Method;
use shared::{
    domain::{ConversationId, Message, MessageId, Origin, Session},
    error::{ClientError, ClientResult, ValidationError},
    protocol::{CreatedMessage, SendMessageRequest},
};
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::{
    events::{emit, ClientEvent, EventSender},
    gateway::RemoteGateway,
    message_store::{MessageStore, ReconcileOutcome},
};

/// Applies sends and deletes to the local cache first, then to the server.
///
/// Send: `Pending -> Confirmed`, or `Pending -> Failed` when the request
/// fails (kept as unsent until [`retry`](Self::retry) or delete).
/// Delete: removed locally at once, then acknowledged by the server on a
/// best-effort basis.
pub struct OptimisticWriter {
    gateway: Arc<RemoteGateway>,
    store: Arc<MessageStore>,
    events: EventSender,
}

impl OptimisticWriter {
    pub fn new(gateway: Arc<RemoteGateway>, store: Arc<MessageStore>, events: EventSender) -> Self {
        Self {
            gateway,
            store,
            events,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        self.store.conversation_id()
    }

    pub async fn send(&self, content: &str) -> ClientResult<Message> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let session = self.gateway.tokens().require_session().await?;

        let placeholder_id = self.store.append_local(content, &session.author()).await?;
        debug!(
            conversation_id = %self.conversation_id(),
            %placeholder_id,
            "writer: pending message appended"
        );
        self.notify_changed().await;

        self.deliver(&placeholder_id, content, &session).await
    }

    /// Sends a `Failed` entry again under the same placeholder id.
    pub async fn retry(&self, placeholder_id: &MessageId) -> ClientResult<Message> {
        let entry = self
            .store
            .get(placeholder_id)
            .await
            .ok_or_else(|| ClientError::UnknownMessage(placeholder_id.clone()))?;
        if entry.origin != Origin::Failed {
            return Err(ValidationError::NotRetryable(placeholder_id.clone()).into());
        }
        let session = self.gateway.tokens().require_session().await?;

        self.store.mark_pending(placeholder_id).await?;
        self.notify_changed().await;
        self.deliver(placeholder_id, &entry.content, &session).await
    }

    async fn deliver(
        &self,
        placeholder_id: &MessageId,
        content: &str,
        session: &Session,
    ) -> ClientResult<Message> {
        let placeholder = self.store.get(placeholder_id).await;
        let request = SendMessageRequest {
            content: content.to_string(),
            user_id: session.user_id.clone(),
            conversation_id: self.conversation_id().clone(),
        };

        let created = match self
            .gateway
            .send_json::<CreatedMessage, _>(Method::POST, "/messages", &request)
            .await
        {
            Ok(created) => created,
            Err(err) => {
                self.record_send_failure(placeholder_id, &err).await;
                return Err(err);
            }
        };

        let mut confirmed = created.into_remote().into_message(self.conversation_id());
        if confirmed.author_username.is_empty() {
            confirmed.author_username = session.username.clone();
        }
        if confirmed.author_avatar_url.is_none() {
            confirmed.author_avatar_url = session.avatar_url.clone();
        }
        if confirmed.created_at == DateTime::<Utc>::default() {
            if let Some(placeholder) = &placeholder {
                confirmed.created_at = placeholder.created_at;
            }
        }

        let outcome = match self.store.reconcile(placeholder_id, confirmed.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.record_unsaved_confirmation(placeholder_id, &confirmed, &err)
                    .await;
                return Err(err);
            }
        };
        match outcome {
            ReconcileOutcome::Replaced => {
                info!(
                    conversation_id = %self.conversation_id(),
                    %placeholder_id,
                    message_id = %confirmed.id,
                    "writer: message confirmed"
                );
                self.notify_changed().await;
            }
            ReconcileOutcome::Dropped => {
                // Deleted locally while the send was in flight.
                info!(
                    %placeholder_id,
                    message_id = %confirmed.id,
                    "writer: placeholder gone before confirmation, deleting server copy"
                );
                self.store.tombstone(&confirmed.id).await?;
                if let Err(err) = self.delete_remote(&confirmed.id).await {
                    warn!(message_id = %confirmed.id, %err, "writer: cleanup delete failed");
                    self.store.release_tombstone(&confirmed.id).await?;
                }
            }
        }
        Ok(confirmed)
    }

    async fn record_send_failure(&self, placeholder_id: &MessageId, err: &ClientError) {
        warn!(
            conversation_id = %self.conversation_id(),
            %placeholder_id,
            %err,
            "writer: send failed, keeping message as unsent"
        );
        match self.store.mark_failed(placeholder_id).await {
            Ok(Some(_)) => self.notify_changed().await,
            Ok(None) => {}
            Err(mark_err) => {
                warn!(%placeholder_id, %mark_err, "writer: failed to flag message as unsent");
            }
        }
        emit(
            &self.events,
            ClientEvent::SendFailed {
                conversation_id: self.conversation_id().clone(),
                placeholder_id: placeholder_id.clone(),
                error: err.to_string(),
            },
        );
        if err.requires_reauth() {
            emit(&self.events, ClientEvent::SessionExpired);
        }
    }

    /// The server accepted the message but the cache could not record it.
    /// The placeholder is dropped rather than left pending, so the next
    /// sync shows the server's copy exactly once.
    async fn record_unsaved_confirmation(
        &self,
        placeholder_id: &MessageId,
        confirmed: &Message,
        err: &ClientError,
    ) {
        warn!(
            conversation_id = %self.conversation_id(),
            %placeholder_id,
            message_id = %confirmed.id,
            %err,
            "writer: confirmation not saved, dropping placeholder"
        );
        match self.store.remove_local(placeholder_id).await {
            Ok(Some(_)) => self.notify_changed().await,
            Ok(None) => {}
            Err(remove_err) => {
                warn!(%placeholder_id, %remove_err, "writer: failed to drop placeholder");
            }
        }
        emit(
            &self.events,
            ClientEvent::SendFailed {
                conversation_id: self.conversation_id().clone(),
                placeholder_id: placeholder_id.clone(),
                error: err.to_string(),
            },
        );
    }

    /// Removes the message from the local view immediately, then asks the
    /// server to delete it.
    ///
    /// If the server call fails the entry stays out of the view and the
    /// error is returned. Its tombstone is released, so the next sync puts
    /// it back if the server still has it.
    pub async fn delete(&self, id: &MessageId) -> ClientResult<()> {
        self.store
            .remove_local(id)
            .await?
            .ok_or_else(|| ClientError::UnknownMessage(id.clone()))?;
        self.notify_changed().await;

        if id.is_local() {
            debug!(message_id = %id, "writer: unsent message removed locally");
            return Ok(());
        }

        match self.delete_remote(id).await {
            Ok(()) => {
                info!(message_id = %id, "writer: delete acknowledged");
                Ok(())
            }
            Err(err) => {
                warn!(message_id = %id, %err, "writer: server delete failed");
                if let Err(release_err) = self.store.release_tombstone(id).await {
                    warn!(message_id = %id, %release_err, "writer: failed to release tombstone");
                }
                emit(
                    &self.events,
                    ClientEvent::DeleteFailed {
                        conversation_id: self.conversation_id().clone(),
                        message_id: id.clone(),
                        error: err.to_string(),
                    },
                );
                if err.requires_reauth() {
                    emit(&self.events, ClientEvent::SessionExpired);
                }
                Err(err)
            }
        }
    }

    async fn delete_remote(&self, id: &MessageId) -> ClientResult<()> {
        let encoded: String = form_urlencoded::byte_serialize(id.as_str().as_bytes()).collect();
        match self
            .gateway
            .request_without_body(Method::DELETE, &format!("/messages/{encoded}"))
            .await
        {
            Ok(_) => Ok(()),
            // Already gone server-side.
            Err(err) if err.status() == Some(404) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn notify_changed(&self) {
        emit(
            &self.events,
            ClientEvent::MessagesChanged {
                conversation_id: self.conversation_id().clone(),
                messages: self.store.snapshot().await,
            },
        );
    }
}

#[cfg(test)]
#[path = "tests/writer_tests.rs"]
mod tests;
