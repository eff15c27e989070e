use std::sync::Arc;

use reqwest::{header::ACCEPT, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use shared::{
    error::{AuthError, ClientError, ClientResult, CsrfError, DecodeError, ValidationError},
    protocol::ErrorBody,
};
use tracing::{debug, warn};
use url::Url;

use crate::{csrf::CsrfGuard, session::TokenManager};

pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Authenticated request wrapper around the remote API.
pub struct RemoteGateway {
    http: Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    csrf: Arc<CsrfGuard>,
}

impl RemoteGateway {
    pub fn new(http: Client, base_url: &Url, tokens: Arc<TokenManager>, csrf: Arc<CsrfGuard>) -> Self {
        Self {
            http,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            tokens,
            csrf,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn csrf(&self) -> &Arc<CsrfGuard> {
        &self.csrf
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Sends one request and classifies the outcome.
    ///
    /// Attaches the bearer token when a session exists and the CSRF token on
    /// every call. A `401` clears the session and is never retried. A
    /// non-JSON success body comes back as `{ "message": <text> }`.
    pub async fn request<B>(&self, method: Method, path: &str, body: Option<&B>) -> ClientResult<Value>
    where
        B: Serialize + ?Sized + Sync,
    {
        let bearer = self.tokens.bearer().await?;
        let csrf_token = self.csrf.ensure_token().await?;

        let mut builder = self
            .http
            .request(method.clone(), self.url_for(path))
            .header(ACCEPT, "application/json")
            .header(CSRF_HEADER, &csrf_token);
        if let Some(token) = &bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        debug!(%method, path, authenticated = bearer.is_some(), "gateway: request");
        let response = builder.send().await.map_err(|err| {
            warn!(%method, path, %err, "gateway: transport failure");
            ClientError::unreachable(err.to_string())
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            warn!(%method, path, %err, "gateway: failed reading response body");
            ClientError::unreachable(err.to_string())
        })?;

        if status.is_success() {
            return Ok(parse_success_body(&text));
        }

        let err = self.classify_failure(status, &text, &csrf_token).await;
        warn!(%method, path, status = status.as_u16(), %err, "gateway: request failed");
        Err(err)
    }

    pub async fn request_without_body(&self, method: Method, path: &str) -> ClientResult<Value> {
        self.request::<()>(method, path, None).await
    }

    pub async fn request_json<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> ClientResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized + Sync,
    {
        let value = self.request(method, path, body).await?;
        decode_value(value)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        self.request_json::<T, ()>(Method::GET, path, None).await
    }

    pub async fn send_json<T, B>(&self, method: Method, path: &str, body: &B) -> ClientResult<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized + Sync,
    {
        self.request_json(method, path, Some(body)).await
    }

    async fn classify_failure(&self, status: StatusCode, text: &str, csrf_token: &str) -> ClientError {
        let message = error_message(status, text);
        match status.as_u16() {
            401 => {
                if let Err(err) = self.tokens.clear().await {
                    warn!(%err, "gateway: failed to clear rejected session");
                }
                AuthError::Expired.into()
            }
            403 if message.to_ascii_lowercase().contains("csrf") => {
                self.csrf.invalidate_stale(csrf_token).await;
                CsrfError::Rejected.into()
            }
            code @ 400..=499 => ValidationError::ServerRejected {
                status: code,
                message,
            }
            .into(),
            code => ClientError::Server {
                status: code,
                message,
            },
        }
    }
}

fn parse_success_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "message": text }))
}

fn error_message(status: StatusCode, text: &str) -> String {
    if let Ok(body) = serde_json::from_str::<ErrorBody>(text) {
        if let Some(message) = body.into_text() {
            return message;
        }
    }
    if !text.trim().is_empty() {
        return text.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

fn decode_value<T: DeserializeOwned>(value: Value) -> ClientResult<T> {
    serde_json::from_value(value)
        .map_err(|e| DecodeError::UnexpectedPayload(e.to_string()).into())
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
