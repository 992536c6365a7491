use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::{
    cookie::{CookieStore, Jar},
    header::HeaderValue,
    Client, RequestBuilder, Response, StatusCode,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Conversation, ConversationId, User},
    error::ApiErrorBody,
    rest::{
        AuthResponse, ConversationListResponse, ConversationResponse, CreateConversationRequest,
        LoginRequest, MessagesPage, RegisterRequest,
    },
};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session is not authenticated")]
    Unauthorized,
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),
}

/// Cookie jar shared by the REST client and the socket connector, clearable
/// on logout.
#[derive(Debug, Default)]
pub struct SessionCookies {
    jar: RwLock<Arc<Jar>>,
}

impl SessionCookies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        self.current().add_cookie_str(cookie, url);
    }

    pub fn clear(&self) {
        *self.jar.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Jar::default());
    }

    fn current(&self) -> Arc<Jar> {
        self.jar
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl CookieStore for SessionCookies {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        self.current().set_cookies(cookie_headers, url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.current().cookies(url)
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    async fn me(&self) -> Result<User, ApiError>;
    async fn login(&self, request: LoginRequest) -> Result<User, ApiError>;
    async fn register(&self, request: RegisterRequest) -> Result<User, ApiError>;
    async fn refresh(&self) -> Result<(), ApiError>;
    async fn logout(&self) -> Result<(), ApiError>;
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError>;
    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<Conversation, ApiError>;
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagesPage, ApiError>;
    fn clear_credentials(&self);
}

pub struct HttpChatApi {
    http: Client,
    base: Url,
    cookies: Arc<SessionCookies>,
}

impl HttpChatApi {
    /// `api_root` must end with a slash, e.g. `http://host/api/v1/`.
    pub fn new(api_root: Url, cookies: Arc<SessionCookies>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .cookie_provider(Arc::clone(&cookies))
            .build()?;
        Ok(Self {
            http,
            base: api_root,
            cookies,
        })
    }

    pub fn cookies(&self) -> Arc<SessionCookies> {
        Arc::clone(&self.cookies)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base.join(path)?)
    }

    async fn execute<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = build(&self.http).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("access token rejected, refreshing session");
        if let Err(err) = self.post_refresh().await {
            debug!(error = %err, "session refresh failed");
            return Err(ApiError::Unauthorized);
        }

        let retried = build(&self.http).send().await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        Ok(retried)
    }

    async fn post_refresh(&self) -> Result<(), ApiError> {
        let url = self.endpoint("auth/refresh")?;
        let response = self.http.post(url).send().await?;
        check_status(response).await.map(drop)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn me(&self) -> Result<User, ApiError> {
        let url = self.endpoint("auth/me")?;
        let response = self.execute(|http| http.get(url.clone())).await?;
        decode(response).await
    }

    async fn login(&self, request: LoginRequest) -> Result<User, ApiError> {
        let url = self.endpoint("auth/login")?;
        let response = self.http.post(url).json(&request).send().await?;
        let body: AuthResponse = decode(response).await?;
        Ok(body.user)
    }

    async fn register(&self, request: RegisterRequest) -> Result<User, ApiError> {
        let url = self.endpoint("auth/register")?;
        let response = self.http.post(url).json(&request).send().await?;
        let body: AuthResponse = decode(response).await?;
        Ok(body.user)
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        self.post_refresh().await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        let url = self.endpoint("auth/logout")?;
        let response = self.http.post(url).send().await?;
        check_status(response).await.map(drop)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        let url = self.endpoint("conversations")?;
        let response = self.execute(|http| http.get(url.clone())).await?;
        let body: ConversationListResponse = decode(response).await?;
        Ok(body.conversations.into_iter().map(Conversation::from).collect())
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<Conversation, ApiError> {
        let url = self.endpoint("conversations")?;
        let response = self
            .execute(|http| http.post(url.clone()).json(&request))
            .await?;
        let body: ConversationResponse = decode(response).await?;
        Ok(body.into())
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<MessagesPage, ApiError> {
        let mut url = self.endpoint(&format!("conversations/{conversation_id}/messages"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(cursor) = cursor.filter(|cursor| !cursor.is_empty()) {
                query.append_pair("cursor", cursor);
            }
        }
        let response = self.execute(|http| http.get(url.clone())).await?;
        decode(response).await
    }

    fn clear_credentials(&self) {
        self.cookies.clear();
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }

    let raw = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&raw)
        .ok()
        .and_then(|body| body.reason().map(str::to_owned))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    warn!(status = status.as_u16(), %message, "chat api request failed");
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let response = check_status(response).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
