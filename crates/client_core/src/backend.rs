use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{header::ACCEPT, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::UserId,
    error::{ApiError, AuthError, ErrorCode},
    protocol::{AuthChangeEvent, AuthUser, Profile, Session},
};
use storage::Storage;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::{
    config::BackendConfig,
    session_store::{SessionStore, Subscription},
};

/// Sessions expiring within this window are refreshed before use.
const SESSION_EXPIRY_SKEW: Duration = Duration::from_secs(60);
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;
const SINGLE_OBJECT_MEDIA_TYPE: &str = "application/vnd.pgrst.object+json";
const PROFILES_TABLE: &str = "profiles";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("backend unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid backend response for {context}: {message}")]
    Decode { context: String, message: String },
}

impl BackendError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    fn decode(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            context: context.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(|| {
                Utc::now()
                    + chrono::Duration::seconds(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS))
            });
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

/// Typed handle on the hosted backend: auth endpoints, the table API and
/// edge functions. One instance is shared by `Arc` across the application.
pub struct BackendClient {
    http: Client,
    base_url: String,
    anon_key: String,
    connector_function: String,
    storage: Option<Storage>,
    storage_key: String,
    session: RwLock<Option<Session>>,
    restored: OnceCell<()>,
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<AuthChangeEvent>,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            http,
            base_url: config.base_url.as_str().trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            connector_function: config.connector_function.clone(),
            storage: None,
            storage_key: storage::DEFAULT_SESSION_KEY.to_string(),
            session: RwLock::new(None),
            restored: OnceCell::new(),
            refresh_lock: Mutex::new(()),
            events,
        })
    }

    /// Persists sessions through `storage` under `storage_key` so they survive restarts.
    pub fn with_storage(mut self, storage: Storage, storage_key: impl Into<String>) -> Self {
        self.storage = Some(storage);
        self.storage_key = storage_key.into();
        self
    }

    pub fn connector_function(&self) -> &str {
        &self.connector_function
    }

    /// Number of live subscriptions on the auth event stream.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn emit(&self, event: AuthChangeEvent) {
        debug!(kind = ?event.kind, "auth: emitting session change");
        // no receivers is not an error
        let _ = self.events.send(event);
    }

    async fn restore_persisted(&self) {
        self.restored
            .get_or_init(|| async {
                let Some(storage) = &self.storage else {
                    return;
                };
                match storage.load_session(&self.storage_key).await {
                    Ok(Some(session)) => {
                        let mut guard = self.session.write().await;
                        if guard.is_none() {
                            info!(user_id = %session.user.id, "auth: restored persisted session");
                            *guard = Some(session);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "auth: failed to load persisted session"),
                }
            })
            .await;
    }

    async fn store_session(&self, session: Session) {
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.save_session(&self.storage_key, &session).await {
                warn!(error = %err, "auth: failed to persist session");
            }
        }
        *self.session.write().await = Some(session);
    }

    async fn drop_session(&self) {
        if let Some(storage) = &self.storage {
            if let Err(err) = storage.clear_session(&self.storage_key).await {
                warn!(error = %err, "auth: failed to clear persisted session");
            }
        }
        *self.session.write().await = None;
    }

    fn with_api_headers(&self, request: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer.unwrap_or(&self.anon_key))
    }

    async fn token_request<B: Serialize>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> Result<Session, AuthError> {
        let response = self
            .with_api_headers(
                self.http
                    .post(format!("{}/auth/v1/token", self.base_url))
                    .query(&[("grant_type", grant_type)]),
                None,
            )
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(auth_error_from_response(status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::InvalidResponse(err.to_string()))?;
        Ok(token.into_session())
    }

    async fn refresh_session(&self, stale: &Session) -> Result<Option<Session>, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        // another caller may have refreshed or signed out while we waited
        let current = self.session.read().await.clone();
        let Some(current) = current else {
            return Ok(None);
        };
        if current.refresh_token != stale.refresh_token {
            return Ok(Some(current));
        }

        match self
            .token_request(
                "refresh_token",
                &RefreshGrant {
                    refresh_token: &current.refresh_token,
                },
            )
            .await
        {
            Ok(fresh) => {
                info!(user_id = %fresh.user.id, "auth: refreshed session");
                self.store_session(fresh.clone()).await;
                self.emit(AuthChangeEvent::token_refreshed(fresh.clone()));
                Ok(Some(fresh))
            }
            Err(err @ AuthError::Transport(_)) => Err(err),
            Err(err) => {
                warn!(error = %err, "auth: session refresh rejected; signing out locally");
                self.drop_session().await;
                self.emit(AuthChangeEvent::signed_out());
                Err(AuthError::SessionExpired(err.to_string()))
            }
        }
    }

    /// Access token for data requests: the session's when signed in, else the anon key.
    async fn bearer_token(&self) -> Result<String, BackendError> {
        Ok(match self.current_session().await? {
            Some(session) => session.access_token,
            None => self.anon_key.clone(),
        })
    }

    async fn rest_request(
        &self,
        request: RequestBuilder,
        single: bool,
    ) -> Result<Response, BackendError> {
        let token = self.bearer_token().await?;
        let mut request = self.with_api_headers(request, Some(&token));
        if single {
            request = request.header(ACCEPT, SINGLE_OBJECT_MEDIA_TYPE);
        }
        Ok(request.send().await?)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    /// `GET /rest/v1/{table}` with PostgREST filter params.
    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<T>, BackendError> {
        let request = self
            .http
            .get(self.table_url(table))
            .query(&[("select", "*")])
            .query(params);
        let response = self.rest_request(request, false).await?;
        read_json(response, table).await
    }

    /// Single-row read. Zero matching rows is [`BackendError::NotFound`].
    pub async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        params: &[(&str, String)],
    ) -> Result<T, BackendError> {
        let request = self
            .http
            .get(self.table_url(table))
            .query(&[("select", "*")])
            .query(params);
        let response = self.rest_request(request, true).await?;
        read_json(response, table).await
    }

    pub async fn insert<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let request = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(body);
        let response = self.rest_request(request, true).await?;
        read_json(response, table).await
    }

    pub async fn update<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        table: &str,
        params: &[(&str, String)],
        body: &B,
    ) -> Result<T, BackendError> {
        let request = self
            .http
            .patch(self.table_url(table))
            .query(params)
            .header("Prefer", "return=representation")
            .json(body);
        let response = self.rest_request(request, true).await?;
        read_json(response, table).await
    }

    /// Deletes matching rows; deleting nothing is [`BackendError::NotFound`].
    pub async fn delete(&self, table: &str, params: &[(&str, String)]) -> Result<(), BackendError> {
        let request = self
            .http
            .delete(self.table_url(table))
            .query(params)
            .header("Prefer", "return=representation");
        let response = self.rest_request(request, false).await?;
        let removed: Vec<Value> = read_json(response, table).await?;
        if removed.is_empty() {
            return Err(BackendError::NotFound(table.to_string()));
        }
        Ok(())
    }

    /// `POST /functions/v1/{name}`.
    pub async fn invoke_function<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        name: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let request = self
            .http
            .post(format!("{}/functions/v1/{name}", self.base_url))
            .json(body);
        let response = self.rest_request(request, false).await?;
        read_json(response, name).await
    }
}

#[async_trait]
impl SessionStore for BackendClient {
    async fn sign_in_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        self.restore_persisted().await;
        let session = self
            .token_request("password", &PasswordGrant { email, password })
            .await?;
        info!(user_id = %session.user.id, "auth: signed in");
        self.store_session(session.clone()).await;
        self.emit(AuthChangeEvent::signed_in(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.restore_persisted().await;
        let token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.access_token.clone());

        if let Some(token) = token {
            let response = self
                .with_api_headers(
                    self.http.post(format!("{}/auth/v1/logout", self.base_url)),
                    Some(&token),
                )
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            // the backend no longer knows the session: treat as signed out
            let already_gone = matches!(status, StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND);
            if !status.is_success() && !already_gone {
                let body = response.text().await.unwrap_or_default();
                return Err(auth_error_from_response(status, &body));
            }
        }

        self.drop_session().await;
        info!("auth: signed out");
        self.emit(AuthChangeEvent::signed_out());
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        self.restore_persisted().await;
        let snapshot = self.session.read().await.clone();
        let Some(session) = snapshot else {
            return Ok(None);
        };

        let skew = chrono::Duration::from_std(SESSION_EXPIRY_SKEW)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if !session.is_expired_at(Utc::now(), skew) {
            return Ok(Some(session));
        }
        self.refresh_session(&session).await
    }

    async fn fetch_profile(&self, user_id: UserId) -> Result<Option<Profile>, AuthError> {
        match self
            .select_one::<Profile>(PROFILES_TABLE, &[("id", format!("eq.{user_id}"))])
            .await
        {
            Ok(profile) => Ok(Some(profile)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(BackendError::Auth(err)) => Err(err),
            Err(BackendError::Api(err)) => Err(AuthError::Backend(err)),
            Err(BackendError::Transport(err)) => Err(transport_error(err)),
            Err(err) => Err(AuthError::InvalidResponse(err.to_string())),
        }
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }
}

fn transport_error(err: reqwest::Error) -> AuthError {
    AuthError::Transport(err.to_string())
}

fn auth_error_from_response(status: StatusCode, body: &str) -> AuthError {
    let api = ApiError::from_body(status.as_u16(), body);
    let lower = format!("{body} {}", api.message).to_ascii_lowercase();
    if status == StatusCode::BAD_REQUEST
        && (lower.contains("invalid_grant") || lower.contains("invalid login credentials"))
    {
        return AuthError::InvalidCredentials;
    }
    AuthError::Backend(api)
}

async fn read_json<T: DeserializeOwned>(
    response: Response,
    context: &str,
) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let api = ApiError::from_body(status.as_u16(), &body);
        if api.code == ErrorCode::NotFound {
            return Err(BackendError::NotFound(context.to_string()));
        }
        return Err(api.into());
    }
    response
        .json::<T>()
        .await
        .map_err(|err| BackendError::decode(context, err))
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
