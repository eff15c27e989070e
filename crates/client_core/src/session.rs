use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::Method;
use shared::{
    domain::Session,
    error::{
        AuthError, ClientError, ClientResult, ConflictError, DecodeError, ValidationError,
    },
    protocol::{Credentials, LoginResponse, Registration, StatusMessage, TokenClaims},
};
use storage::{KeyValueStore, AUTH_TOKEN_SLOT};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::gateway::RemoteGateway;

/// Owns the auth token: acquisition, decoding, expiry and persistence.
///
/// The persisted slot is the source of truth; the in-memory session is a
/// decoded copy that is dropped whenever the slot is cleared.
pub struct TokenManager {
    store: Arc<dyn KeyValueStore>,
    session: RwLock<Option<Session>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            session: RwLock::new(None),
        }
    }

    /// Reads the token payload without checking its signature.
    ///
    /// The claims are only used to label the user and to notice expiry
    /// early. The server stays responsible for every authorization
    /// decision.
    pub fn decode(token: &str) -> Result<TokenClaims, DecodeError> {
        let mut segments = token.trim().split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(DecodeError::MalformedToken(
                "expected three dot-separated segments".into(),
            ));
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| DecodeError::MalformedToken(format!("payload is not base64url: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DecodeError::MalformedToken(format!("invalid claims: {e}")))
    }

    pub fn session_from_token(token: &str) -> Result<Session, DecodeError> {
        let claims = Self::decode(token)?;
        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or_else(|| DecodeError::MalformedToken(format!("exp {} out of range", claims.exp)))?;
        Ok(Session {
            token: token.trim().to_string(),
            user_id: claims.id,
            username: claims.user,
            email: claims.email,
            avatar_url: claims.avatar,
            expires_at,
        })
    }

    pub fn is_valid(token: &str) -> bool {
        Self::is_valid_at(token, Utc::now())
    }

    pub fn is_valid_at(token: &str, now: DateTime<Utc>) -> bool {
        Self::session_from_token(token)
            .map(|session| !session.is_expired_at(now))
            .unwrap_or(false)
    }

    pub async fn current(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Loads the persisted token at start-up. Expired or unreadable tokens
    /// are cleared.
    pub async fn restore(&self) -> ClientResult<Option<Session>> {
        match self.bearer().await {
            Ok(Some(_)) => Ok(self.current().await),
            Ok(None) | Err(ClientError::Auth(AuthError::Expired)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Decodes and persists `token`, replacing the current session.
    pub async fn install(&self, token: &str) -> ClientResult<Session> {
        let session = Self::session_from_token(token)?;
        if session.is_expired() {
            return Err(AuthError::Expired.into());
        }

        let mut guard = self.session.write().await;
        self.store
            .save(AUTH_TOKEN_SLOT, &session.token)
            .await
            .map_err(ClientError::storage)?;
        *guard = Some(session.clone());
        Ok(session)
    }

    pub async fn acquire(
        &self,
        gateway: &RemoteGateway,
        credentials: &Credentials,
    ) -> ClientResult<Session> {
        if credentials.username.trim().is_empty() {
            return Err(ValidationError::EmptyField("username").into());
        }
        if credentials.password.is_empty() {
            return Err(ValidationError::EmptyField("password").into());
        }

        // A new login replaces whatever identity was there before.
        self.clear().await?;

        let response: LoginResponse = gateway
            .send_json(Method::POST, "/auth/token", credentials)
            .await
            .map_err(|err| match err {
                ClientError::Auth(_) => AuthError::InvalidCredentials.into(),
                ClientError::Validation(ValidationError::ServerRejected { status, .. })
                    if matches!(status, 400 | 403 | 404) =>
                {
                    AuthError::InvalidCredentials.into()
                }
                other => other,
            })?;

        let Some(token) = response.token.filter(|t| !t.trim().is_empty()) else {
            warn!(username = %credentials.username, "session: login response carried no token");
            return Err(AuthError::InvalidCredentials.into());
        };

        let session = self.install(&token).await?;
        info!(
            user_id = %session.user_id,
            username = %session.username,
            expires_at = %session.expires_at,
            "session: acquired"
        );
        Ok(session)
    }

    /// Creates the account, then logs in with the same credentials.
    pub async fn register(
        &self,
        gateway: &RemoteGateway,
        registration: &Registration,
    ) -> ClientResult<Session> {
        if registration.email.trim().is_empty() {
            return Err(ValidationError::EmptyField("email").into());
        }
        let credentials = registration.credentials();
        if credentials.username.trim().is_empty() {
            return Err(ValidationError::EmptyField("username").into());
        }
        if credentials.password.is_empty() {
            return Err(ValidationError::EmptyField("password").into());
        }

        let confirmation: StatusMessage = gateway
            .send_json(Method::POST, "/auth/register", registration)
            .await
            .map_err(|err| match err {
                ClientError::Validation(ValidationError::ServerRejected { status, message })
                    if status == 409 || message.to_ascii_lowercase().contains("already exists") =>
                {
                    ConflictError::DuplicateUser(message).into()
                }
                other => other,
            })?;
        info!(
            username = %registration.username,
            confirmation = %confirmation.message,
            "session: registered"
        );

        self.acquire(gateway, &credentials).await
    }

    /// The token to attach to the next request, if any.
    ///
    /// An expired session is cleared and reported as [`AuthError::Expired`]
    /// so no request ever leaves with a stale token.
    pub async fn bearer(&self) -> ClientResult<Option<String>> {
        let session = match self.current().await {
            Some(session) => session,
            None => match self.load_persisted().await? {
                Some(session) => session,
                None => return Ok(None),
            },
        };

        if session.is_expired() {
            warn!(
                user_id = %session.user_id,
                expires_at = %session.expires_at,
                "session: token expired, clearing"
            );
            self.clear().await?;
            return Err(AuthError::Expired.into());
        }

        Ok(Some(session.token))
    }

    pub async fn require_session(&self) -> ClientResult<Session> {
        self.bearer()
            .await?
            .ok_or(ClientError::Auth(AuthError::MissingSession))?;
        self.current()
            .await
            .ok_or(ClientError::Auth(AuthError::MissingSession))
    }

    pub async fn clear(&self) -> ClientResult<()> {
        let mut guard = self.session.write().await;
        self.store
            .remove(AUTH_TOKEN_SLOT)
            .await
            .map_err(ClientError::storage)?;
        if guard.take().is_some() {
            info!("session: cleared");
        }
        Ok(())
    }

    async fn load_persisted(&self) -> ClientResult<Option<Session>> {
        let Some(token) = self
            .store
            .load(AUTH_TOKEN_SLOT)
            .await
            .map_err(ClientError::storage)?
        else {
            return Ok(None);
        };

        match Self::session_from_token(&token) {
            Ok(session) => {
                *self.session.write().await = Some(session.clone());
                Ok(Some(session))
            }
            Err(err) => {
                warn!(%err, "session: discarding unreadable persisted token");
                self.clear().await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
