// # HTTP Remote Backend
//
// This crate provides a `RemoteBackend` over a NetBox-style REST API.
//
// ## Responsibilities
//
// - ✅ One HTTP request per backend call (plus follow-up pages for `list`)
// - ✅ Token authentication on every request
// - ✅ Pagination: `list` follows `next` links until exhausted
// - ✅ Status and body mapping into the core error taxonomy
// - ✅ HTTP timeout configured per backend
// - ❌ NO retry logic (a repeated POST is not idempotent; the caller decides)
// - ❌ NO caching (owned by the proxy client's cache layer)
// - ❌ NO confirm gate or dry-run (owned by the proxy executor)
//
// ## Security Requirements
//
// - The API token NEVER appears in logs, errors, or `Debug` output
// - Construction fails fast on an empty token
//
// ## API Shape
//
// - List:   GET    `{base}/api/{domain}/{collection}/?limit=N&<filters>`
//           → `{"count": n, "next": url|null, "results": [...]}`
// - Get:    GET    `{base}/api/{domain}/{collection}/{id}/`
// - Create: POST   `{base}/api/{domain}/{collection}/`
// - Update: PATCH  `{base}/api/{domain}/{collection}/{id}/`
// - Delete: DELETE `{base}/api/{domain}/{collection}/{id}/` → 204

use async_trait::async_trait;
use ipam_core::config::BackendConfig;
use ipam_core::traits::{BackendFactory, CollectionPath, Filters, RemoteBackend};
use ipam_core::{BackendRegistry, Error, Result};
use reqwest::StatusCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Upper bound on followed pages, against a remote that loops its `next` links
const MAX_PAGES: usize = 10_000;

/// Remote backend speaking the REST API over HTTP
///
/// # Example
///
/// ```rust,no_run
/// use ipam_backend_http::HttpBackend;
/// use ipam_core::traits::{CollectionPath, RemoteBackend};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = HttpBackend::new(
///         "https://netbox.example.com",
///         "0123456789abcdef",
///         Duration::from_secs(30),
///         100,
///     )?;
///     let sites = backend
///         .list(&CollectionPath::new("dcim", "sites"), &Default::default())
///         .await?;
///     println!("{} sites", sites.len());
///     Ok(())
/// }
/// ```
pub struct HttpBackend {
    /// Base URL without trailing slash
    base_url: String,

    /// API token
    /// ⚠️ NEVER log this value
    api_token: String,

    /// Page size for list requests
    page_size: usize,

    client: reqwest::Client,
}

// Keeps the API token out of Debug output
impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .field("api_token", &"<REDACTED>")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl HttpBackend {
    /// Create a backend
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the URL does not parse, the token is empty, or
    /// the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        api_token: impl Into<String>,
        timeout: Duration,
        page_size: usize,
    ) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.is_empty() {
            return Err(Error::config("HTTP backend API token cannot be empty"));
        }
        if page_size == 0 {
            return Err(Error::config("HTTP backend page size must be > 0"));
        }

        let parsed = Url::parse(base_url)
            .map_err(|e| Error::config(format!("Invalid backend base URL {}: {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "Backend base URL must use http or https: {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            page_size,
            client,
        })
    }

    fn url(&self, api_path: &str) -> Result<Url> {
        let raw = format!("{}{}", self.base_url, api_path);
        Url::parse(&raw).map_err(|e| Error::config(format!("Invalid request URL {}: {}", raw, e)))
    }

    fn list_url(&self, path: &CollectionPath, filters: &Filters) -> Result<Url> {
        let mut url = self.url(&path.api_path())?;
        {
            let mut query = url.query_pairs_mut();
            if !filters.contains_key("limit") {
                query.append_pair("limit", &self.page_size.to_string());
            }
            for (key, value) in filters {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.api_token))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Send a request and return the parsed body (`Value::Null` for an empty body)
    async fn send(&self, request: reqwest::RequestBuilder, context: &str) -> Result<Value> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::remote(None, format!("{}: HTTP request failed: {}", context, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(map_status(status, &body, context));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::remote(Some(status.as_u16()), format!("{}: failed to read body: {}", context, e)))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::remote(
                Some(status.as_u16()),
                format!("{}: invalid JSON in response: {}", context, e),
            )
        })
    }
}

/// Map a non-success response into the error taxonomy
///
/// The remote reports uniqueness violations as 400 with a body mentioning
/// "already exists" (or a unique constraint); those surface as `Conflict`.
pub fn map_status(status: StatusCode, body: &str, context: &str) -> Error {
    let code = status.as_u16();
    match code {
        400 | 422 => {
            let lowered = body.to_lowercase();
            if lowered.contains("already exists") || lowered.contains("unique") {
                Error::conflict(format!("{}: {}", context, body))
            } else {
                Error::validation(format!("{}: {}", context, body))
            }
        }
        401 | 403 => Error::auth(format!(
            "{}: invalid API token or insufficient permissions (status {})",
            context, code
        )),
        404 => Error::not_found(format!("{}: not found", context)),
        409 => Error::conflict(format!("{}: {}", context, body)),
        429 => Error::remote(Some(code), format!("{}: rate limit exceeded", context)),
        _ => Error::remote(Some(code), format!("{}: {} - {}", context, status, body)),
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn list(&self, path: &CollectionPath, filters: &Filters) -> Result<Vec<Value>> {
        let context = format!("GET {}", path.api_path());
        let mut next = Some(self.list_url(path, filters)?);
        let mut items = Vec::new();
        let mut pages = 0;

        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(Error::remote(
                    None,
                    format!("{}: pagination did not terminate after {} pages", context, MAX_PAGES),
                ));
            }
            tracing::debug!("Listing {} (page {})", path, pages);

            let body = self.send(self.client.get(url.clone()), &context).await?;
            match body {
                // Unpaginated endpoints return a bare array.
                Value::Array(page) => items.extend(page),
                Value::Object(mut envelope) => {
                    match envelope.remove("results") {
                        Some(Value::Array(page)) => items.extend(page),
                        _ => {
                            return Err(Error::remote(
                                None,
                                format!("{}: response has no 'results' array", context),
                            ));
                        }
                    }
                    next = match envelope.get("next").and_then(Value::as_str) {
                        Some(link) => {
                            let link = Url::parse(link).map_err(|e| {
                                Error::remote(None, format!("{}: invalid next link: {}", context, e))
                            })?;
                            (link != url).then_some(link)
                        }
                        None => None,
                    };
                }
                other => {
                    return Err(Error::remote(
                        None,
                        format!("{}: unexpected response body: {}", context, other),
                    ));
                }
            }
        }

        Ok(items)
    }

    async fn get(&self, path: &CollectionPath, id: u64) -> Result<Value> {
        let object_path = path.object_path(id);
        let url = self.url(&object_path)?;
        self.send(self.client.get(url), &format!("GET {}", object_path)).await
    }

    async fn create(&self, path: &CollectionPath, payload: &Value) -> Result<Value> {
        let api_path = path.api_path();
        let url = self.url(&api_path)?;
        tracing::debug!("POST {}", api_path);
        self.send(self.client.post(url).json(payload), &format!("POST {}", api_path))
            .await
    }

    async fn update(&self, path: &CollectionPath, id: u64, payload: &Value) -> Result<Value> {
        let object_path = path.object_path(id);
        let url = self.url(&object_path)?;
        tracing::debug!("PATCH {}", object_path);
        self.send(self.client.patch(url).json(payload), &format!("PATCH {}", object_path))
            .await
    }

    async fn delete(&self, path: &CollectionPath, id: u64) -> Result<()> {
        let object_path = path.object_path(id);
        let url = self.url(&object_path)?;
        tracing::debug!("DELETE {}", object_path);
        self.send(self.client.delete(url), &format!("DELETE {}", object_path))
            .await
            .map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}

/// Factory for creating HTTP backends
pub struct HttpBackendFactory;

impl BackendFactory for HttpBackendFactory {
    fn create(&self, config: &BackendConfig) -> Result<Arc<dyn RemoteBackend>> {
        match config {
            BackendConfig::Http {
                base_url,
                api_token,
                timeout_secs,
                page_size,
            } => Ok(Arc::new(HttpBackend::new(
                base_url,
                api_token.clone(),
                Duration::from_secs(*timeout_secs),
                *page_size,
            )?)),
            other => Err(Error::config(format!(
                "Invalid config type for HttpBackendFactory: {}",
                other.type_name()
            ))),
        }
    }
}

/// Register the HTTP backend with a registry
///
/// # Example
///
/// ```rust
/// use ipam_core::BackendRegistry;
///
/// let registry = BackendRegistry::with_builtins();
/// ipam_backend_http::register(&registry);
/// assert!(registry.has_backend("http"));
/// ```
pub fn register(registry: &BackendRegistry) {
    registry.register_backend("http", Box::new(HttpBackendFactory));
}
