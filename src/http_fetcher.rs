/**
HTTP adapter for the synchronization cache

Maps cache keys onto REST paths below a base URL: `links:detail:2` becomes
`GET {base}/links/detail/2`, map parameters become query pairs.
*/
use crate::USER_AGENT;
use crate::cache::{CacheKey, FetchError, Fetcher, KeyParam};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

/// Longest server message kept in a `FetchError`
const MAX_ERROR_BODY_CHARS: usize = 1024;

/// Environment variable overriding the default user agent
pub const USER_AGENT_ENV: &str = "LINKSYNC_USER_AGENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl From<WriteMethod> for Method {
    fn from(method: WriteMethod) -> Self {
        match method {
            WriteMethod::Post => Self::POST,
            WriteMethod::Put => Self::PUT,
            WriteMethod::Patch => Self::PATCH,
            WriteMethod::Delete => Self::DELETE,
        }
    }
}

/// A write against the resource a key addresses, optionally below a
/// sub-path (e.g. `DELETE links/2`).
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub method: WriteMethod,
    pub path: Option<String>,
    pub body: Option<Value>,
}

impl WriteRequest {
    #[must_use]
    pub const fn new(method: WriteMethod) -> Self {
        Self {
            method,
            path: None,
            body: None,
        }
    }

    #[must_use]
    pub fn post(body: Value) -> Self {
        Self {
            method: WriteMethod::Post,
            path: None,
            body: Some(body),
        }
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(WriteMethod::Delete).with_path(path)
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    base_url: Url,
}

impl HttpFetcher {
    /// Create a fetcher for `base_url` with the default user agent,
    /// or the one set in `LINKSYNC_USER_AGENT`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the base URL does not parse or the HTTP client
    /// cannot be built
    pub fn new(base_url: &str) -> Result<Self> {
        let user_agent = std::env::var(USER_AGENT_ENV).unwrap_or_else(|_| USER_AGENT.to_string());
        let client = Client::builder().user_agent(user_agent).build()?;
        Self::with_client(client, base_url)
    }

    /// # Errors
    ///
    /// Will return `Err` if the base URL does not parse or cannot carry a path
    pub fn with_client(client: Client, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Custom(format!("invalid base url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Custom(format!("{base_url} cannot be a base url")));
        }
        Ok(Self { client, base_url })
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL addressed by `key`, with `extra` path segments appended.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the base URL cannot carry path segments
    pub fn resource_url(
        &self,
        key: &CacheKey,
        extra: Option<&str>,
    ) -> std::result::Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        let mut query = Vec::new();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                FetchError::Other(format!("{} cannot be a base url", self.base_url))
            })?;
            segments.pop_if_empty().push(key.resource());
            for param in key.params() {
                match param {
                    KeyParam::Map(fields) => query.extend(fields.iter()),
                    KeyParam::Null => {}
                    other => {
                        segments.push(&other.to_string());
                    }
                }
            }
            if let Some(extra) = extra {
                segments.extend(extra.split('/').filter(|s| !s.is_empty()));
            }
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, &value.to_string());
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<String, FetchError> {
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;

        if status == StatusCode::CONFLICT {
            return Err(FetchError::Conflict(truncate(&body)));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
                message: truncate(&body),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    type Value = Value;
    type Payload = WriteRequest;

    async fn read(&self, key: &CacheKey) -> std::result::Result<Value, FetchError> {
        let url = self.resource_url(key, None)?;
        debug!("🌐 GET {}", url);
        let body = self.send(self.client.get(url)).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }

    async fn write(
        &self,
        key: &CacheKey,
        payload: WriteRequest,
    ) -> std::result::Result<Option<Value>, FetchError> {
        let url = self.resource_url(key, payload.path.as_deref())?;
        let method = Method::from(payload.method);
        debug!("🌐 {} {}", method, url);

        let mut request = self.client.request(method, url);
        if let Some(body) = &payload.body {
            request = request.json(body);
        }

        let body = self.send(request).await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[allow(clippy::needless_pass_by_value)]
fn transport(e: reqwest::Error) -> FetchError {
    FetchError::Transport(e.to_string())
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY_CHARS).collect()
}
