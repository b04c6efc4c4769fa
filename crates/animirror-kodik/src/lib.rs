mod limiter;

pub use limiter::RateLimiter;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

const LIST_PATH: &str = "/list";
const PLAYLIST_PATH: &str = "/playlist";
const LIST_TYPES: &str = "anime,anime-serial";
const MAX_PAGE_SIZE: u32 = 100;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);
const ALLOWED_QUALITIES: [u32; 4] = [360, 480, 720, 1080];

#[derive(Debug)]
pub enum KodikError {
    Network(String),
    RateLimited { retry_after: Option<Duration> },
    NotFound(String),
    Protocol(String),
    InvalidInput(String),
}

impl fmt::Display for KodikError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KodikError::Network(message) => write!(f, "network error: {}", message),
            KodikError::RateLimited { retry_after } => match retry_after {
                Some(delay) => write!(f, "rate limited (retry after {:?})", delay),
                None => write!(f, "rate limited"),
            },
            KodikError::NotFound(message) => write!(f, "not found: {}", message),
            KodikError::Protocol(message) => write!(f, "protocol error: {}", message),
            KodikError::InvalidInput(message) => write!(f, "invalid input: {}", message),
        }
    }
}

impl std::error::Error for KodikError {}

impl From<reqwest::Error> for KodikError {
    fn from(err: reqwest::Error) -> Self {
        KodikError::Network(err.to_string())
    }
}

pub type RawItem = Value;

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    results: Vec<RawItem>,
    #[serde(default)]
    next_page: Option<String>,
}

pub struct KodikClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    limiter: RateLimiter,
    retry_attempts: u32,
    retry_base: Duration,
}

impl KodikClient {
    pub fn new(token: Option<String>, rps_limit: u32) -> Result<Self, KodikError> {
        let client = reqwest::Client::builder()
            .user_agent("animirror/0.1")
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: "https://kodikapi.com".to_string(),
            token,
            limiter: RateLimiter::new(rps_limit),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base: DEFAULT_RETRY_BASE,
        })
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, attempts: u32, base: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_base = base;
        self
    }

    /// Pages the full feed. The feed is served sorted by `updated_at desc`;
    /// termination is a missing `next_page` or the `max_pages` cap.
    pub async fn fetch_full_list(
        &self,
        page_size: u32,
        max_pages: Option<u32>,
    ) -> Result<Vec<RawItem>, KodikError> {
        let mut items = Vec::new();
        self.walk_pages(page_size, max_pages, |page| {
            items.extend(page);
            true
        })
        .await?;
        Ok(items)
    }

    /// Delta pull: walks the `updated_at desc` feed and stops at the first
    /// item older than `updated_since`. Items without a parseable timestamp
    /// are skipped but do not end the walk.
    pub async fn fetch_delta(
        &self,
        updated_since: DateTime<Utc>,
        page_size: u32,
        max_pages: Option<u32>,
    ) -> Result<Vec<RawItem>, KodikError> {
        let mut items = Vec::new();
        self.walk_pages(page_size, max_pages, |page| {
            let mut keep_going = true;
            for item in page {
                match item_updated_at(&item) {
                    Some(ts) if ts >= updated_since => items.push(item),
                    Some(_) => {
                        keep_going = false;
                        break;
                    }
                    None => {}
                }
            }
            keep_going
        })
        .await?;
        Ok(items)
    }

    pub async fn get_episode_playlist(
        &self,
        external_ids: &Value,
        translation_id: i64,
        episode_num: i32,
        quality: u32,
    ) -> Result<String, KodikError> {
        if !ALLOWED_QUALITIES.contains(&quality) {
            return Err(KodikError::InvalidInput(format!(
                "unsupported quality: {}",
                quality
            )));
        }
        if translation_id < 0 || episode_num < 1 {
            return Err(KodikError::InvalidInput(
                "translation id and episode number must be positive".to_string(),
            ));
        }
        let (id_value, id_type) = choose_external_id(external_ids).ok_or_else(|| {
            KodikError::NotFound("no external id (shikimori/kinopoisk/imdb)".to_string())
        })?;

        let mut url = self.endpoint(PLAYLIST_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            query.append_pair("id", &id_value);
            query.append_pair("id_type", &id_type);
            query.append_pair("translation_id", &translation_id.to_string());
            query.append_pair("seria", &episode_num.to_string());
            query.append_pair("quality", &quality.to_string());
        }

        let response = self.send_with_retry(url).await?;
        let body = response.text().await?;
        let link = body.trim().trim_matches('"').to_string();
        if link.is_empty() {
            return Err(KodikError::Protocol("empty playlist response".to_string()));
        }
        Ok(link)
    }

    async fn walk_pages<F>(
        &self,
        page_size: u32,
        max_pages: Option<u32>,
        mut visit: F,
    ) -> Result<(), KodikError>
    where
        F: FnMut(Vec<RawItem>) -> bool,
    {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(KodikError::InvalidInput(format!(
                "page size must be within 1..={}",
                MAX_PAGE_SIZE
            )));
        }

        let mut cursor: Option<String> = None;
        let mut pages: u32 = 0;
        loop {
            let url = self.list_url(page_size, cursor.as_deref())?;
            let response = self.send_with_retry(url).await?;
            let page: ListResponse = response
                .json()
                .await
                .map_err(|err| KodikError::Protocol(format!("malformed list body: {}", err)))?;

            pages += 1;
            let next = page.next_page;
            if !visit(page.results) {
                return Ok(());
            }

            let Some(next_page) = next else {
                return Ok(());
            };
            if let Some(cap) = max_pages {
                if pages >= cap {
                    return Ok(());
                }
            }
            cursor = Some(next_cursor(&next_page)?);
        }
    }

    fn list_url(&self, page_size: u32, cursor: Option<&str>) -> Result<Url, KodikError> {
        let mut url = self.endpoint(LIST_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            query.append_pair("limit", &page_size.to_string());
            query.append_pair("types", LIST_TYPES);
            query.append_pair("with_material_data", "true");
            query.append_pair("with_episodes", "true");
            query.append_pair("sort", "updated_at");
            query.append_pair("order", "desc");
            if let Some(cursor) = cursor {
                query.append_pair("next", cursor);
            }
        }
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, KodikError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|err| KodikError::InvalidInput(format!("invalid base url: {}", err)))
    }

    /// Single retry layer for every catalog call: up to `retry_attempts`
    /// tries on timeouts, refused connections, 5xx and 429, with
    /// `retry_base * 2^(attempt-1)` backoff (429 honors Retry-After).
    /// Each attempt pulls one token from the limiter.
    async fn send_with_retry(&self, url: Url) -> Result<reqwest::Response, KodikError> {
        let mut attempt: u32 = 1;
        loop {
            self.limiter.acquire().await;
            let result = self.client.get(url.clone()).send().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let server_backoff = retry_after(&response);
                        if attempt >= self.retry_attempts {
                            return Err(KodikError::RateLimited {
                                retry_after: server_backoff,
                            });
                        }
                        let delay = server_backoff.unwrap_or_else(|| self.backoff(attempt));
                        sleep(delay).await;
                    } else if status == StatusCode::NOT_FOUND {
                        return Err(KodikError::NotFound(url.path().to_string()));
                    } else if status.is_client_error() {
                        return Err(KodikError::Protocol(format!(
                            "unexpected status {} for {}",
                            status,
                            url.path()
                        )));
                    } else {
                        if attempt >= self.retry_attempts {
                            return Err(KodikError::Network(format!(
                                "server error {} for {}",
                                status,
                                url.path()
                            )));
                        }
                        sleep(self.backoff(attempt)).await;
                    }
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    if attempt >= self.retry_attempts {
                        return Err(KodikError::Network(err.to_string()));
                    }
                    sleep(self.backoff(attempt)).await;
                }
                Err(err) => return Err(KodikError::Network(err.to_string())),
            }
            attempt += 1;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn next_cursor(next_page: &str) -> Result<String, KodikError> {
    let url = Url::parse(next_page)
        .map_err(|_| KodikError::Protocol(format!("invalid next_page url: {}", next_page)))?;
    url.query_pairs()
        .find(|(key, _)| key == "next")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(|| KodikError::Protocol("next_page is missing the next cursor".to_string()))
}

/// Picks the external id to query by, preferring shikimori, then kinopoisk,
/// then imdb. Empty and zero values do not count.
pub fn choose_external_id(external_ids: &Value) -> Option<(String, String)> {
    for key in ["shikimori", "kinopoisk", "imdb"] {
        let Some(value) = external_ids.get(key) else {
            continue;
        };
        match value {
            Value::String(text) if !text.trim().is_empty() => {
                return Some((text.trim().to_string(), key.to_string()));
            }
            Value::Number(number) if number.as_i64() != Some(0) => {
                return Some((number.to_string(), key.to_string()));
            }
            _ => {}
        }
    }
    None
}

fn item_updated_at(item: &Value) -> Option<DateTime<Utc>> {
    let raw = item.get("updated_at")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn choose_external_id_prefers_shikimori() {
        let ids = json!({"shikimori": "1", "kinopoisk": "2", "imdb": "tt3"});
        assert_eq!(
            choose_external_id(&ids),
            Some(("1".to_string(), "shikimori".to_string()))
        );
    }

    #[test]
    fn choose_external_id_skips_empty_values() {
        let ids = json!({"shikimori": "", "kinopoisk": 0, "imdb": "tt42"});
        assert_eq!(
            choose_external_id(&ids),
            Some(("tt42".to_string(), "imdb".to_string()))
        );
    }

    #[test]
    fn choose_external_id_accepts_numbers() {
        let ids = json!({"shikimori": 5114});
        assert_eq!(
            choose_external_id(&ids),
            Some(("5114".to_string(), "shikimori".to_string()))
        );
    }

    #[test]
    fn choose_external_id_handles_missing_ids() {
        assert_eq!(choose_external_id(&json!({})), None);
        assert_eq!(choose_external_id(&json!(null)), None);
    }

    #[test]
    fn next_cursor_extracts_query_parameter() {
        let cursor =
            next_cursor("https://kodikapi.com/list?token=x&limit=50&next=abc123").unwrap();
        assert_eq!(cursor, "abc123");
    }

    #[test]
    fn next_cursor_rejects_missing_parameter() {
        let err = next_cursor("https://kodikapi.com/list?token=x").unwrap_err();
        assert!(matches!(err, KodikError::Protocol(_)));
    }

    #[test]
    fn item_updated_at_parses_rfc3339() {
        let item = json!({"updated_at": "2024-03-01T10:00:00Z"});
        assert!(item_updated_at(&item).is_some());
        assert!(item_updated_at(&json!({"updated_at": "nonsense"})).is_none());
        assert!(item_updated_at(&json!({})).is_none());
    }
}
