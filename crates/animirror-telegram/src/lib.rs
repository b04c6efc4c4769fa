use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;

const SAVED_CHAT_ID: &str = "me";
const API_ID_HEADER: &str = "x-telegram-api-id";
const API_HASH_HEADER: &str = "x-telegram-api-hash";
const SESSION_HEADER: &str = "x-telegram-session";

#[derive(Debug)]
pub enum TelegramError {
    Http(String),
    Api(String),
    Auth(String),
    Proxy(String),
    InvalidHeader(String),
    Io(std::io::Error),
    InvalidInput(String),
}

impl fmt::Display for TelegramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelegramError::Http(message) => write!(f, "http error: {}", message),
            TelegramError::Api(message) => write!(f, "api error: {}", message),
            TelegramError::Auth(message) => write!(f, "auth failed: {}", message),
            TelegramError::Proxy(message) => write!(f, "invalid proxy: {}", message),
            TelegramError::InvalidHeader(message) => write!(f, "invalid header: {}", message),
            TelegramError::Io(err) => write!(f, "io error: {}", err),
            TelegramError::InvalidInput(message) => write!(f, "invalid input: {}", message),
        }
    }
}

impl std::error::Error for TelegramError {}

impl From<reqwest::Error> for TelegramError {
    fn from(err: reqwest::Error) -> Self {
        TelegramError::Http(err.to_string())
    }
}

impl From<std::io::Error> for TelegramError {
    fn from(err: std::io::Error) -> Self {
        TelegramError::Io(err)
    }
}

#[derive(Debug, Clone)]
pub struct ChatRef {
    pub id: i64,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub file_unique_id: Option<String>,
    pub file_size: Option<i64>,
}

/// The seam to the chat backend. The publish queue only depends on this
/// trait; the shipped implementation holds a user-session credential set
/// and speaks HTTP to an MTProto gateway sidecar.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn resolve_chat(&self, chat_id: &str) -> Result<ChatRef, TelegramError>;

    /// The session's own "saved" pseudo-chat, used as the upload fallback.
    async fn saved_chat(&self) -> Result<ChatRef, TelegramError>;

    async fn send_video(
        &self,
        chat: &ChatRef,
        path: &Path,
        caption: &str,
        buttons: Option<&Value>,
        supports_streaming: bool,
    ) -> Result<SentMessage, TelegramError>;
}

/// Credentials for the user-API session that owns the upload chat. These
/// are the USER_API_* values; a bot token cannot upload into a private
/// user-session chat.
#[derive(Debug, Clone)]
pub struct UserSession {
    pub api_id: i64,
    pub api_hash: String,
    pub session_string: String,
}

pub struct TelegramClient {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramClient {
    /// The client authenticates every call with the session credentials,
    /// attached as headers for the MTProto gateway fronting the real
    /// Telegram user API.
    pub fn new(session: UserSession, proxy_url: Option<&str>) -> Result<Self, TelegramError> {
        if session.api_id <= 0 {
            return Err(TelegramError::InvalidInput(
                "api id must be positive".to_string(),
            ));
        }
        if session.api_hash.trim().is_empty() || session.session_string.trim().is_empty() {
            return Err(TelegramError::InvalidInput(
                "empty api hash or session string".to_string(),
            ));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            API_ID_HEADER,
            HeaderValue::from_str(&session.api_id.to_string())
                .map_err(|_| TelegramError::InvalidHeader(API_ID_HEADER.to_string()))?,
        );
        headers.insert(
            API_HASH_HEADER,
            HeaderValue::from_str(session.api_hash.trim())
                .map_err(|_| TelegramError::InvalidHeader(API_HASH_HEADER.to_string()))?,
        );
        let mut session_value = HeaderValue::from_str(session.session_string.trim())
            .map_err(|_| TelegramError::InvalidHeader(SESSION_HEADER.to_string()))?;
        session_value.set_sensitive(true);
        headers.insert(SESSION_HEADER, session_value);

        let mut builder = reqwest::Client::builder()
            .user_agent("animirror/0.1")
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10));
        if let Some(proxy) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|err| TelegramError::Proxy(err.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: "http://127.0.0.1:8081".to_string(),
        })
    }

    pub fn with_api_base(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn call<T>(&self, request: reqwest::RequestBuilder) -> Result<T, TelegramError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = request.send().await?;
        let status = response.status();
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|err| TelegramError::Api(format!("malformed response: {}", err)))?;
        if !envelope.ok {
            let description = envelope
                .description
                .unwrap_or_else(|| format!("status {}", status));
            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(TelegramError::Auth(description));
            }
            return Err(TelegramError::Api(description));
        }
        envelope
            .result
            .ok_or_else(|| TelegramError::Api("missing result".to_string()))
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn resolve_chat(&self, chat_id: &str) -> Result<ChatRef, TelegramError> {
        if chat_id == SAVED_CHAT_ID {
            return self.saved_chat().await;
        }
        let payload: ChatPayload = self
            .call(
                self.client
                    .post(self.method_url("getChat"))
                    .json(&serde_json::json!({ "chat_id": chat_id })),
            )
            .await?;
        Ok(ChatRef {
            id: payload.id,
            title: payload.title.or(payload.username),
        })
    }

    async fn saved_chat(&self) -> Result<ChatRef, TelegramError> {
        let me: UserPayload = self.call(self.client.get(self.method_url("getMe"))).await?;
        Ok(ChatRef {
            id: me.id,
            title: me.username.or(Some(me.first_name)),
        })
    }

    async fn send_video(
        &self,
        chat: &ChatRef,
        path: &Path,
        caption: &str,
        buttons: Option<&Value>,
        supports_streaming: bool,
    ) -> Result<SentMessage, TelegramError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TelegramError::InvalidInput("invalid video filename".to_string()))?
            .to_string();
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let stream = ReaderStream::new(file);
        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), length)
            .file_name(file_name);

        let mut form = Form::new()
            .text("chat_id", chat.id.to_string())
            .text("caption", caption.to_string())
            .text("supports_streaming", supports_streaming.to_string())
            .part("video", part);
        if let Some(buttons) = buttons {
            form = form.text("reply_markup", buttons.to_string());
        }

        let message: MessagePayload = self
            .call(self.client.post(self.method_url("sendVideo")).multipart(form))
            .await?;

        Ok(SentMessage {
            message_id: message.message_id,
            chat_id: message.chat.id,
            file_unique_id: message
                .video
                .as_ref()
                .and_then(|video| video.file_unique_id.clone()),
            file_size: message.video.as_ref().and_then(|video| video.file_size),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiEnvelope<T> {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatPayload {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: i64,
    first_name: String,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    message_id: i64,
    chat: ChatPayload,
    #[serde(default)]
    video: Option<VideoPayload>,
}

#[derive(Debug, Deserialize)]
struct VideoPayload {
    #[serde(default)]
    file_unique_id: Option<String>,
    #[serde(default)]
    file_size: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_success_payload() {
        let raw = r#"{
            "ok": true,
            "result": {
                "message_id": 42,
                "chat": {"id": -100123, "title": "mirror"},
                "video": {"file_unique_id": "abc", "file_size": 1024}
            }
        }"#;
        let envelope: ApiEnvelope<MessagePayload> = serde_json::from_str(raw).unwrap();
        assert!(envelope.ok);
        let message = envelope.result.unwrap();
        assert_eq!(message.message_id, 42);
        assert_eq!(message.chat.id, -100123);
        assert_eq!(message.video.unwrap().file_unique_id.as_deref(), Some("abc"));
    }

    #[test]
    fn envelope_parses_error_payload() {
        let raw = r#"{"ok": false, "description": "Unauthorized"}"#;
        let envelope: ApiEnvelope<MessagePayload> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.ok);
        assert_eq!(envelope.description.as_deref(), Some("Unauthorized"));
    }

    fn session() -> UserSession {
        UserSession {
            api_id: 12345,
            api_hash: "hash".to_string(),
            session_string: "session".to_string(),
        }
    }

    #[test]
    fn rejects_incomplete_session_credentials() {
        let mut bad = session();
        bad.api_id = 0;
        assert!(matches!(
            TelegramClient::new(bad, None),
            Err(TelegramError::InvalidInput(_))
        ));

        let mut bad = session();
        bad.api_hash = "  ".to_string();
        assert!(matches!(
            TelegramClient::new(bad, None),
            Err(TelegramError::InvalidInput(_))
        ));

        let mut bad = session();
        bad.session_string = String::new();
        assert!(matches!(
            TelegramClient::new(bad, None),
            Err(TelegramError::InvalidInput(_))
        ));
    }

    #[test]
    fn accepts_socks_and_http_proxies() {
        assert!(TelegramClient::new(session(), Some("socks5://127.0.0.1:9050")).is_ok());
        assert!(TelegramClient::new(session(), Some("http://127.0.0.1:3128")).is_ok());
        assert!(matches!(
            TelegramClient::new(session(), Some("not a proxy")),
            Err(TelegramError::Proxy(_))
        ));
    }
}
