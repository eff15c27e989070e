use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use shared::{
    domain::{ConversationId, Message, MessageId, Session, UserId},
    error::{ClientError, ClientResult},
    protocol::{Credentials, Registration, StatusMessage, UpdateUserRequest, UserRecord, UserUpdate},
};
use storage::{prepare_database_url, KeyValueStore, Storage};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::form_urlencoded;

pub mod config;
pub mod csrf;
pub mod events;
pub mod gateway;
pub mod message_store;
pub mod session;
pub mod sync;
pub mod writer;

pub use config::{load_settings, ClientSettings};
pub use events::ClientEvent;
pub use message_store::MessageStore;
pub use session::TokenManager;
pub use sync::{IntervalScheduler, ManualScheduler, Scheduler, SyncHandle, SyncLoop, TickOutcome};
pub use writer::OptimisticWriter;

use crate::{
    csrf::{CsrfGuard, HttpCsrfSource},
    events::{emit, EventSender},
    gateway::RemoteGateway,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn restore_session(&self) -> ClientResult<Option<Session>>;
    async fn login(&self, username: &str, password: &str) -> ClientResult<Session>;
    async fn register(&self, registration: Registration) -> ClientResult<Session>;
    async fn logout(&self) -> ClientResult<()>;
    async fn current_session(&self) -> Option<Session>;
    async fn open_conversation(&self, conversation_id: ConversationId) -> ClientResult<Conversation>;
    async fn close_conversation(&self);
    async fn get_user(&self, user_id: &UserId) -> ClientResult<UserRecord>;
    async fn update_user(&self, update: UserUpdate) -> ClientResult<StatusMessage>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct ChatClient {
    settings: ClientSettings,
    store: Arc<dyn KeyValueStore>,
    tokens: Arc<TokenManager>,
    gateway: Arc<RemoteGateway>,
    events: EventSender,
    active: Mutex<Option<ActiveConversation>>,
}

struct ActiveConversation {
    id: ConversationId,
    sync: SyncHandle,
}

impl ChatClient {
    /// Opens the sqlite database named in `settings` and builds a client on it.
    pub async fn connect(settings: ClientSettings) -> Result<Arc<Self>> {
        let database_url = prepare_database_url(&settings.database_url)?;
        let storage = Storage::new(&database_url)
            .await
            .with_context(|| format!("failed to open local database {database_url}"))?;
        Self::new(settings, Arc::new(storage))
    }

    pub fn new(settings: ClientSettings, store: Arc<dyn KeyValueStore>) -> Result<Arc<Self>> {
        let base_url = settings.api_base_url()?;
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .context("failed to build http client")?;

        let tokens = Arc::new(TokenManager::new(Arc::clone(&store)));
        let csrf = Arc::new(CsrfGuard::new(Arc::new(HttpCsrfSource::new(
            http.clone(),
            &base_url,
        ))));
        let gateway = Arc::new(RemoteGateway::new(http, &base_url, Arc::clone(&tokens), csrf));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(api_url = %base_url, "client: initialized");
        Ok(Arc::new(Self {
            settings,
            store,
            tokens,
            gateway,
            events,
            active: Mutex::new(None),
        }))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.active.lock().await.as_ref().map(|a| a.id.clone())
    }

    fn after_auth_failure(&self, err: &ClientError) {
        if err.requires_reauth() {
            emit(&self.events, ClientEvent::SessionExpired);
        }
    }
}

#[async_trait]
impl ClientHandle for Arc<ChatClient> {
    async fn restore_session(&self) -> ClientResult<Option<Session>> {
        let session = self.tokens.restore().await?;
        if let Some(session) = &session {
            info!(username = %session.username, "client: session restored");
            emit(
                &self.events,
                ClientEvent::LoggedIn {
                    username: session.username.clone(),
                },
            );
        }
        Ok(session)
    }

    async fn login(&self, username: &str, password: &str) -> ClientResult<Session> {
        let session = self
            .tokens
            .acquire(&self.gateway, &Credentials::new(username, password))
            .await?;
        emit(
            &self.events,
            ClientEvent::LoggedIn {
                username: session.username.clone(),
            },
        );
        Ok(session)
    }

    async fn register(&self, registration: Registration) -> ClientResult<Session> {
        let session = self.tokens.register(&self.gateway, &registration).await?;
        emit(
            &self.events,
            ClientEvent::LoggedIn {
                username: session.username.clone(),
            },
        );
        Ok(session)
    }

    async fn logout(&self) -> ClientResult<()> {
        self.close_conversation().await;
        self.tokens.clear().await?;
        self.gateway.csrf().invalidate().await;
        info!("client: logged out");
        emit(&self.events, ClientEvent::LoggedOut);
        Ok(())
    }

    async fn current_session(&self) -> Option<Session> {
        self.tokens.current().await
    }

    async fn open_conversation(&self, conversation_id: ConversationId) -> ClientResult<Conversation> {
        self.tokens.require_session().await?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!(conversation_id = %previous.id, "client: closing previous conversation");
            previous.sync.shutdown().await;
        }

        let store = Arc::new(
            MessageStore::load(conversation_id.clone(), Arc::clone(&self.store)).await?,
        );
        let writer = Arc::new(OptimisticWriter::new(
            Arc::clone(&self.gateway),
            Arc::clone(&store),
            self.events.clone(),
        ));
        let sync = Arc::new(SyncLoop::new(
            Arc::clone(&self.gateway),
            Arc::clone(&store),
            self.events.clone(),
        ));
        let handle = Arc::clone(&sync).spawn(IntervalScheduler::new(self.settings.poll_interval));
        let cancel = handle.cancellation();

        emit(
            &self.events,
            ClientEvent::MessagesChanged {
                conversation_id: conversation_id.clone(),
                messages: store.snapshot().await,
            },
        );
        info!(%conversation_id, "client: conversation opened");

        *active = Some(ActiveConversation {
            id: conversation_id.clone(),
            sync: handle,
        });

        Ok(Conversation {
            id: conversation_id,
            store,
            writer,
            sync,
            cancel,
        })
    }

    async fn close_conversation(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            previous.sync.shutdown().await;
            info!(conversation_id = %previous.id, "client: conversation closed");
        }
    }

    async fn get_user(&self, user_id: &UserId) -> ClientResult<UserRecord> {
        let encoded: String = form_urlencoded::byte_serialize(user_id.as_str().as_bytes()).collect();
        self.gateway
            .get_json(&format!("/users/{encoded}"))
            .await
            .inspect_err(|err| self.after_auth_failure(err))
    }

    async fn update_user(&self, update: UserUpdate) -> ClientResult<StatusMessage> {
        let session = self.tokens.require_session().await?;
        let request = UpdateUserRequest {
            user_id: session.user_id,
            updated_data: update,
        };
        let status: StatusMessage = self
            .gateway
            .send_json(Method::PUT, "/user", &request)
            .await
            .inspect_err(|err| self.after_auth_failure(err))?;
        info!(user_id = %request.user_id, "client: profile updated");
        Ok(status)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// A view onto one open conversation. Cheap to clone; the sync loop is
/// owned by the client and stops when the conversation is closed.
#[derive(Clone)]
pub struct Conversation {
    id: ConversationId,
    store: Arc<MessageStore>,
    writer: Arc<OptimisticWriter>,
    sync: Arc<SyncLoop>,
    cancel: CancellationToken,
}

impl Conversation {
    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.store.snapshot().await
    }

    pub async fn send(&self, content: &str) -> ClientResult<Message> {
        self.writer.send(content).await
    }

    pub async fn retry(&self, placeholder_id: &MessageId) -> ClientResult<Message> {
        self.writer.retry(placeholder_id).await
    }

    pub async fn delete(&self, id: &MessageId) -> ClientResult<()> {
        self.writer.delete(id).await
    }

    /// Runs one sync round now instead of waiting for the next tick.
    pub async fn refresh(&self) -> ClientResult<TickOutcome> {
        self.sync.tick(&self.cancel).await
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.sync.last_sync()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation").field("id", &self.id).finish()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
