//! REST API Client
//!
//! Typed wrappers for the backend's collaborator endpoints: repository
//! browsing, document content, conversations and search.
//!
//! Failed requests map to [`ApiError`]. The error message of an HTTP failure
//! comes from the body's `message` field, then FastAPI's `detail`, and
//! falls back to `HTTP <status>`.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Default REST base URL
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by [`ApiClient`]
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// No response within the request timeout
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Non-success HTTP status
    #[error("{message}")]
    Http {
        /// Status code
        status: u16,
        /// Server-provided message, or `HTTP <status>`
        message: String,
    },

    /// The request never got a response
    #[error("Network error: {0}")]
    Network(String),

    /// The response body did not have the expected shape
    #[error("Invalid response: {0}")]
    Decode(String),

    /// The base URL cannot carry the request path
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Machine-readable error code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "TIMEOUT",
            Self::Http { .. } => "HTTP_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Decode(_) => "INVALID_RESPONSE",
            Self::InvalidUrl(_) => "INVALID_URL",
        }
    }

    /// HTTP status, for [`ApiError::Http`]
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Message carried by an error body
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "detail", "error"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

// ============================================================================
// Resources
// ============================================================================

/// A documented repository
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Repository {
    /// Repository name
    pub name: String,
    /// Number of documentation files
    pub doc_count: u64,
    /// Last sync time
    pub last_updated: Option<String>,
    /// Short description
    pub description: Option<String>,
    /// GitHub URL
    pub url: Option<String>,
}

/// Kind of a tree entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A regular file
    #[default]
    File,
    /// A directory
    Dir,
}

/// One entry of a repository's documentation tree
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeEntry {
    /// Path within the repository
    pub path: String,
    /// File or directory
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Size in bytes
    pub size: Option<u64>,
}

/// Document metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentMetadata {
    /// Last modification time
    pub last_modified: Option<String>,
    /// Last author
    pub author: Option<String>,
}

/// A documentation file with its content
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    /// Repository name
    pub repo: String,
    /// Path within the repository
    pub path: String,
    /// Raw content
    pub content: String,
    /// Metadata
    pub metadata: DocumentMetadata,
}

/// A stored conversation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Conversation {
    /// Conversation id
    pub id: String,
    /// Title
    pub title: Option<String>,
    /// Creation time
    pub created_at: Option<String>,
    /// Last update time
    pub updated_at: Option<String>,
}

/// A stored conversation message
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationMessage {
    /// Message id
    pub id: String,
    /// `user` or `assistant`
    pub role: String,
    /// Text content
    pub content: String,
    /// Creation time
    pub timestamp: Option<String>,
}

/// A search hit
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchResult {
    /// File name
    pub name: String,
    /// Path within the repository
    pub path: String,
    /// Repository name
    #[serde(alias = "repo")]
    pub repository: String,
    /// GitHub URL
    pub url: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

/// REST client settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Backend base URL
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ApiConfig {
    /// Configuration for the given base URL
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Set the request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Backend REST client
#[derive(Clone, Debug)]
pub struct ApiClient {
    base: Url,
    timeout: Duration,
    http: Client,
}

impl ApiClient {
    /// Create a client
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] for an unparseable base URL and
    /// [`ApiError::Network`] when the HTTP client cannot be built.
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let base = Url::parse(config.base_url.trim_end_matches('/'))
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(config.base_url.clone()));
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            base,
            timeout: config.timeout,
            http,
        })
    }

    /// Backend base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// `GET /api/repos`
    pub async fn list_repositories(&self) -> Result<Vec<Repository>, ApiError> {
        self.get(&["api", "repos"]).await
    }

    /// `GET /api/repos/{name}`
    pub async fn get_repository(&self, name: &str) -> Result<Repository, ApiError> {
        self.get(&["api", "repos", name]).await
    }

    /// `GET /api/repos/{name}/tree`
    pub async fn get_tree(&self, repo: &str) -> Result<Vec<TreeEntry>, ApiError> {
        self.get(&["api", "repos", repo, "tree"]).await
    }

    /// `GET /api/repos/{name}/files/{path}`
    pub async fn get_document(&self, repo: &str, path: &str) -> Result<Document, ApiError> {
        let mut segments = vec!["api", "repos", repo, "files"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.get(&segments).await
    }

    /// `GET /api/search?q=&repo=`
    pub async fn search(&self, query: &str, repo: Option<&str>) -> Result<Vec<SearchResult>, ApiError> {
        let mut url = self.url(&["api", "search"])?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            if let Some(repo) = repo {
                pairs.append_pair("repo", repo);
            }
        }
        self.send(self.http.get(url)).await
    }

    /// `GET /api/conversations`
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ApiError> {
        self.get(&["api", "conversations"]).await
    }

    /// `POST /api/conversations`
    pub async fn create_conversation(&self, title: Option<&str>) -> Result<Conversation, ApiError> {
        let mut body = Map::new();
        if let Some(title) = title {
            body.insert("title".into(), Value::String(title.into()));
        }
        let url = self.url(&["api", "conversations"])?;
        self.send(self.http.post(url).json(&body)).await
    }

    /// `GET /api/conversations/{id}`
    pub async fn get_conversation(&self, id: &str) -> Result<Conversation, ApiError> {
        self.get(&["api", "conversations", id]).await
    }

    /// `DELETE /api/conversations/{id}`
    pub async fn delete_conversation(&self, id: &str) -> Result<(), ApiError> {
        let url = self.url(&["api", "conversations", id])?;
        self.execute(self.http.request(Method::DELETE, url)).await?;
        Ok(())
    }

    /// `GET /api/conversations/{id}/messages`
    pub async fn get_messages(&self, id: &str) -> Result<Vec<ConversationMessage>, ApiError> {
        self.get(&["api", "conversations", id, "messages"]).await
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ApiError> {
        let url = self.url(segments)?;
        self.send(self.http.get(url)).await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.execute(request).await?;
        response.json::<T>().await.map_err(|e| self.map_error(&e))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await.map_err(|e| self.map_error(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        tracing::debug!(status = status.as_u16(), message = %message, "API request failed");
        Err(ApiError::Http {
            status: status.as_u16(),
            message,
        })
    }

    fn map_error(&self, err: &reqwest::Error) -> ApiError {
        if err.is_timeout() {
            ApiError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(&ApiConfig::new(server.uri())).unwrap()
    }

    #[tokio::test]
    async fn test_list_repositories() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/repos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "backend-api", "docCount": 12, "lastUpdated": "2024-05-01T10:00:00Z"},
                {"name": "frontend", "docCount": 3, "description": "Web UI"}
            ])))
            .mount(&server)
            .await;

        let repos = client_for(&server).await.list_repositories().await.unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].name, "backend-api");
        assert_eq!(repos[0].doc_count, 12);
        assert_eq!(repos[1].description.as_deref(), Some("Web UI"));
    }

    #[tokio::test]
    async fn test_document_path_keeps_slashes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/repos/backend-api/files/docs/setup.md"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "repo": "backend-api",
                "path": "docs/setup.md",
                "content": "# Setup",
                "metadata": {"lastModified": "2024-05-01", "author": "octocat"}
            })))
            .mount(&server)
            .await;

        let doc = client_for(&server)
            .await
            .get_document("backend-api", "docs/setup.md")
            .await
            .unwrap();
        assert_eq!(doc.content, "# Setup");
        assert_eq!(doc.metadata.author.as_deref(), Some("octocat"));
    }

    #[tokio::test]
    async fn test_tree_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/repos/frontend/tree"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"path": "docs", "type": "dir"},
                {"path": "docs/intro.md", "type": "file", "size": 512}
            ])))
            .mount(&server)
            .await;

        let tree = client_for(&server).await.get_tree("frontend").await.unwrap();
        assert_eq!(tree[0].kind, EntryKind::Dir);
        assert_eq!(tree[1].size, Some(512));
    }

    #[tokio::test]
    async fn test_detail_becomes_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/repos"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"detail": "MCP Server not available"})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).await.list_repositories().await.unwrap_err();
        assert_eq!(
            err,
            ApiError::Http {
                status: 503,
                message: "MCP Server not available".into()
            }
        );
        assert_eq!(err.to_string(), "MCP Server not available");
        assert_eq!(err.code(), "HTTP_ERROR");
    }

    #[tokio::test]
    async fn test_plain_error_body_falls_back_to_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/repos/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.get_repository("missing").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.to_string(), "HTTP 404");
    }

    #[tokio::test]
    async fn test_timeout_has_timeout_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/conversations"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let config = ApiConfig::new(server.uri()).with_timeout(Duration::from_millis(200));
        let err = ApiClient::new(&config)
            .unwrap()
            .list_conversations()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_search_and_conversations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .and(query_param("q", "deploy guide"))
            .and(query_param("repo", "infra"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "deploy.md", "path": "doc/deploy.md", "repository": "infra"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/conversations"))
            .and(body_json(json!({"title": "Deploys"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "conv-9", "title": "Deploys", "createdAt": "2024-05-01T10:00:00Z"
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/conversations/conv-9"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let hits = client.search("deploy guide", Some("infra")).await.unwrap();
        assert_eq!(hits[0].repository, "infra");

        let conv = client.create_conversation(Some("Deploys")).await.unwrap();
        assert_eq!(conv.id, "conv-9");
        client.delete_conversation("conv-9").await.unwrap();
    }

    #[test]
    fn test_invalid_base_url() {
        let err = ApiClient::new(&ApiConfig::new("not a url")).unwrap_err();
        assert_eq!(err.code(), "INVALID_URL");
    }

    #[test]
    fn test_url_segments_are_escaped() {
        let client = ApiClient::new(&ApiConfig::new("http://localhost:8000/")).unwrap();
        let url = client.url(&["api", "repos", "my repo"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/api/repos/my%20repo");
    }
}
