use shared::domain::{ConversationId, Message, MessageId};
use tokio::sync::broadcast;

/// Notifications for the view layer. Nothing here is required for
/// correctness; a client that never subscribes loses nothing but feedback.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    LoggedIn {
        username: String,
    },
    LoggedOut,
    /// The server rejected the session; the user has to log in again.
    SessionExpired,
    MessagesChanged {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    SyncFailed {
        conversation_id: ConversationId,
        error: String,
    },
    SendFailed {
        conversation_id: ConversationId,
        placeholder_id: MessageId,
        error: String,
    },
    DeleteFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
        error: String,
    },
}

pub type EventSender = broadcast::Sender<ClientEvent>;

pub(crate) fn emit(events: &EventSender, event: ClientEvent) {
    let _ = events.send(event);
}
