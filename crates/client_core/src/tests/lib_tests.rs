use std::time::Duration;

use super::*;
use crate::test_support::{MockApi, TEST_PASSWORD, TEST_USERNAME, TEST_USER_ID};
use shared::error::AuthError;
use storage::MemoryStore;
use tokio::time::timeout;

async fn client(api: &MockApi) -> (Arc<ChatClient>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let client = ChatClient::new(api.settings(), store.clone()).expect("client");
    (client, store)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<ClientEvent>, mut accept: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel open");
            if accept(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

#[test]
fn rejects_an_unusable_api_url() {
    let settings = ClientSettings {
        api_url: "not a url".into(),
        ..ClientSettings::default()
    };
    assert!(ChatClient::new(settings, Arc::new(MemoryStore::new())).is_err());
}

#[tokio::test]
async fn connect_opens_sqlite_storage() {
    let api = MockApi::spawn().await;
    let client = ChatClient::connect(api.settings()).await.expect("connect");
    assert!(client.restore_session().await.expect("restore").is_none());
}

#[tokio::test]
async fn login_and_logout_round_trip() {
    let api = MockApi::spawn().await;
    let (client, _) = client(&api).await;
    let mut events = client.subscribe_events();

    let session = client.login(TEST_USERNAME, TEST_PASSWORD).await.expect("login");
    assert_eq!(session.user_id.as_str(), TEST_USER_ID);
    assert!(matches!(
        events.recv().await.expect("event"),
        ClientEvent::LoggedIn { username } if username == TEST_USERNAME
    ));
    assert!(client.current_session().await.is_some());

    client.logout().await.expect("logout");
    assert!(matches!(events.recv().await.expect("event"), ClientEvent::LoggedOut));
    assert!(client.current_session().await.is_none());
    assert_eq!(client.gateway.csrf().cached_token().await, None);
}

#[tokio::test]
async fn session_survives_a_restart() {
    let api = MockApi::spawn().await;
    let (first, store) = client(&api).await;
    first.login(TEST_USERNAME, TEST_PASSWORD).await.expect("login");

    let second = ChatClient::new(api.settings(), store).expect("client");
    let restored = second.restore_session().await.expect("restore").expect("session");
    assert_eq!(restored.username, TEST_USERNAME);
}

#[tokio::test]
async fn opening_a_conversation_requires_a_session() {
    let api = MockApi::spawn().await;
    let (client, _) = client(&api).await;

    let err = client
        .open_conversation(ConversationId::new("conv-1"))
        .await
        .expect_err("logged out");
    assert_eq!(err, ClientError::Auth(AuthError::MissingSession));
}

#[tokio::test]
async fn open_conversation_syncs_and_supports_writes() {
    let api = MockApi::spawn().await;
    api.seed_message("conv-1", "m1", "welcome", "2024-01-01T00:00:01Z").await;
    let (client, _) = client(&api).await;
    client.login(TEST_USERNAME, TEST_PASSWORD).await.expect("login");
    let mut events = client.subscribe_events();

    let conversation = client
        .open_conversation(ConversationId::new("conv-1"))
        .await
        .expect("open");
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::MessagesChanged { messages, .. } if !messages.is_empty())
    })
    .await;
    assert_eq!(conversation.messages().await.len(), 1);
    assert!(conversation.last_sync().is_some());

    let sent = conversation.send("hi bob").await.expect("send");
    assert_eq!(conversation.messages().await.len(), 2);

    conversation.delete(&sent.id).await.expect("delete");
    let outcome = conversation.refresh().await.expect("refresh");
    assert!(matches!(outcome, TickOutcome::Merged { .. }));
    let ids: Vec<String> = conversation
        .messages()
        .await
        .iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, vec!["m1".to_string()]);
}

#[tokio::test]
async fn opening_another_conversation_closes_the_previous_one() {
    let api = MockApi::spawn().await;
    let (client, _) = client(&api).await;
    client.login(TEST_USERNAME, TEST_PASSWORD).await.expect("login");

    let first = client
        .open_conversation(ConversationId::new("conv-1"))
        .await
        .expect("open first");
    let second = client
        .open_conversation(ConversationId::new("conv-2"))
        .await
        .expect("open second");

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(
        client.active_conversation().await,
        Some(ConversationId::new("conv-2"))
    );

    client.close_conversation().await;
    assert!(second.is_closed());
    assert_eq!(client.active_conversation().await, None);
}

#[tokio::test]
async fn logout_stops_the_sync_loop() {
    let api = MockApi::spawn().await;
    let (client, _) = client(&api).await;
    client.login(TEST_USERNAME, TEST_PASSWORD).await.expect("login");
    let conversation = client
        .open_conversation(ConversationId::new("conv-1"))
        .await
        .expect("open");

    client.logout().await.expect("logout");
    assert!(conversation.is_closed());
    assert_eq!(
        conversation.refresh().await.expect("refresh"),
        TickOutcome::Discarded
    );
}

#[tokio::test]
async fn profile_lookup_and_update() {
    let api = MockApi::spawn().await;
    let (client, _) = client(&api).await;
    client.login(TEST_USERNAME, TEST_PASSWORD).await.expect("login");

    let user = client
        .get_user(&UserId::new(TEST_USER_ID))
        .await
        .expect("user");
    assert_eq!(user.username, TEST_USERNAME);

    let status = client
        .update_user(UserUpdate {
            bio: Some("hello".into()),
            ..UserUpdate::default()
        })
        .await
        .expect("update");
    assert_eq!(status.message, "User data updated");

    let updates = api.state.lock().await.profile_updates.clone();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["userId"], TEST_USER_ID);
    assert_eq!(updates[0]["updatedData"], serde_json::json!({ "bio": "hello" }));
}

#[tokio::test]
async fn revoked_session_is_announced() {
    let api = MockApi::spawn().await;
    let (client, _) = client(&api).await;
    client.login(TEST_USERNAME, TEST_PASSWORD).await.expect("login");
    let mut events = client.subscribe_events();
    api.state.lock().await.revoke_sessions = true;

    let err = client
        .get_user(&UserId::new(TEST_USER_ID))
        .await
        .expect_err("revoked");
    assert!(err.requires_reauth());
    wait_for(&mut events, |e| matches!(e, ClientEvent::SessionExpired)).await;
    assert!(client.current_session().await.is_none());
}
