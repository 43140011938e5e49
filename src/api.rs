//! REST collaborator: conversation list, conversation lookup, paginated
//! history and media upload.
//!
//! Thin HTTP wrapper over the chat backend's `/conversations` resources.
//! Every response arrives in a `{ success, message, data }` envelope; the
//! pure [`parse_envelope`] unwraps it so parsing is testable without a
//! server.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::auth::{TokenProvider, bearer_header};
use crate::config::ChatConfig;
use crate::protocol::{Attachment, Conversation, Message};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Errors from REST calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response.
    #[error("API request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success HTTP status.
    #[error("API response error: status {status}")]
    Status { status: u16, body: String },

    /// The envelope reported `success: false`.
    #[error("API rejected request: {}", .message.as_deref().unwrap_or("no message"))]
    Envelope { message: Option<String> },

    /// The body was not the expected JSON.
    #[error("API response parse failed: {0}")]
    Parse(String),

    /// No bearer token is available.
    #[error("missing bearer token")]
    MissingToken,

    /// The upload collaborator could not store the file.
    #[error("upload failed: {0}")]
    Upload(String),
}

impl ApiError {
    /// True for failures worth retrying unchanged.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Status { status: 429 | 500..=599, .. })
    }

    /// The backend rejected the bearer token; the caller should sign out.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. })
    }
}

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

/// Conversation and history fetches.
#[async_trait::async_trait]
pub trait ChatApi: Send + Sync {
    async fn conversations(&self) -> Result<Vec<Conversation>, ApiError>;

    async fn conversation(&self, conversation_id: &str) -> Result<Conversation, ApiError>;

    /// Start (or look up) the direct conversation with `user_id`.
    async fn create_conversation(&self, user_id: &str) -> Result<Conversation, ApiError>;

    /// One page of history, zero-based.
    async fn messages(&self, conversation_id: &str, page: u32, size: u32) -> Result<MessagePage, ApiError>;
}

/// Turns a local file into a remote attachment that can be sent as message
/// content.
#[async_trait::async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, file_name: &str, content_type: &str, bytes: Vec<u8>) -> Result<Attachment, ApiError>;
}

/// A page of message history.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// False once the oldest page has been returned.
    pub has_more: bool,
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpChatApi {
    pub fn new(config: &ChatConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self, ApiError> {
        Self::with_base_url(config.api_url.clone(), tokens)
    }

    pub fn with_base_url(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Ok(Self { http, base_url, tokens })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, ApiError> {
        let token = self.tokens.bearer_token().ok_or(ApiError::MissingToken)?;
        let response = request.header(reqwest::header::AUTHORIZATION, bearer_header(&token)).send().await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "api: request rejected");
            return Err(ApiError::Status { status: status.as_u16(), body: text });
        }

        parse_envelope(&text)
    }
}

#[async_trait::async_trait]
impl ChatApi for HttpChatApi {
    async fn conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        self.send(self.http.get(self.url("/conversations"))).await
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Conversation, ApiError> {
        self.send(self.http.get(self.url(&format!("/conversations/{conversation_id}")))).await
    }

    async fn create_conversation(&self, user_id: &str) -> Result<Conversation, ApiError> {
        let body = CreateConversation { user_id };
        self.send(self.http.post(self.url("/conversations")).json(&body)).await
    }

    async fn messages(&self, conversation_id: &str, page: u32, size: u32) -> Result<MessagePage, ApiError> {
        let request = self
            .http
            .get(self.url(&format!("/conversations/{conversation_id}/messages")))
            .query(&[("page", page), ("size", size)]);
        let body: PageBody = self.send(request).await?;
        Ok(body.into_page(size))
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversation<'a> {
    user_id: &'a str,
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

/// History pages come either as a paged object or as a bare list.
#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody {
    Paged {
        content: Vec<Message>,
        #[serde(default)]
        last: bool,
    },
    List(Vec<Message>),
}

impl PageBody {
    fn into_page(self, size: u32) -> MessagePage {
        match self {
            Self::Paged { content, last } => MessagePage { messages: content, has_more: !last },
            Self::List(messages) => {
                // A short page is the last one.
                let has_more = u32::try_from(messages.len()).is_ok_and(|n| n >= size && n > 0);
                MessagePage { messages, has_more }
            }
        }
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// Unwrap a `{ success, message, data }` envelope.
pub fn parse_envelope<T: DeserializeOwned>(json: &str) -> Result<T, ApiError> {
    let envelope: Envelope<T> = serde_json::from_str(json).map_err(|e| ApiError::Parse(e.to_string()))?;
    if !envelope.success {
        return Err(ApiError::Envelope { message: envelope.message });
    }
    envelope.data.ok_or_else(|| ApiError::Parse("envelope has no data".into()))
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
