//! Fetch: retrieve raw bytes for a [`Source`] and persist them by content hash.
//!
//! Network access goes through the [`HttpTransport`] seam so the pipeline can
//! be driven by an in-memory transport in tests. [`ReqwestTransport`] is the
//! production implementation.
//!
//! ## Idempotence
//!
//! The previous generation's [`RawDocument`] for a URL supplies `ETag` /
//! `Last-Modified` validators. A `304 Not Modified` or an identical body hash
//! yields [`FetchOutcome::Unchanged`]; the orchestrator treats that as "no new
//! work downstream".

use crate::config::PipelineConfig;
use crate::error::{FetchError, PipelineError};
use crate::model::{DocumentKind, RawDocument, Source};
use crate::pipeline::retry::{with_backoff, RetryPolicy};
use crate::store::ArtifactStore;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_LANGUAGE, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Validators for a conditional GET.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditional {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Conditional {
    fn from_previous(doc: &RawDocument) -> Option<Self> {
        if doc.etag.is_none() && doc.last_modified.is_none() {
            None
        } else {
            Some(Self {
                etag: doc.etag.clone(),
                last_modified: doc.last_modified.clone(),
            })
        }
    }
}

/// A complete HTTP response, any status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        Self {
            status: 200,
            body: body.into(),
            content_type: Some(content_type.to_string()),
            etag: None,
            last_modified: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            content_type: None,
            etag: None,
            last_modified: None,
        }
    }
}

/// Minimal GET capability.
///
/// Implementations return `Ok` for every HTTP response regardless of status
/// and reserve `Err` for requests that produced no response at all.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, conditional: Option<&Conditional>) -> Result<HttpResponse, FetchError>;
}

/// Map a non-success status to the fetch error taxonomy.
pub fn classify_status(url: &str, status: u16) -> Result<(), FetchError> {
    match status {
        200..=299 | 304 => Ok(()),
        403 | 451 => Err(FetchError::Blocked {
            url: url.to_string(),
            reason: format!("HTTP {status}"),
        }),
        _ => Err(FetchError::HttpStatus {
            url: url.to_string(),
            status,
        }),
    }
}

// ── reqwest transport ────────────────────────────────────────────────────────

/// Production transport backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl ReqwestTransport {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout_secs: config.fetch_timeout_secs,
        })
    }

    fn map_error(&self, url: &str, e: reqwest::Error) -> FetchError {
        // Refused or reset connections are retried like timeouts.
        if e.is_timeout() || e.is_connect() {
            FetchError::Timeout {
                url: url.to_string(),
                secs: self.timeout_secs,
            }
        } else {
            FetchError::Blocked {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, conditional: Option<&Conditional>) -> Result<HttpResponse, FetchError> {
        let mut request = self.client.get(url);
        if let Some(c) = conditional {
            if let Some(ref etag) = c.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(ref lm) = c.last_modified {
                request = request.header(IF_MODIFIED_SINCE, lm);
            }
        }

        let response = request.send().await.map_err(|e| self.map_error(url, e))?;
        let status = response.status().as_u16();
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v: &HeaderValue| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_error(url, e))?
            .to_vec();

        Ok(HttpResponse {
            status,
            body,
            content_type,
            etag,
            last_modified,
        })
    }
}

// ── Fetcher ──────────────────────────────────────────────────────────────────

/// Result of fetching one source.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// New or changed content; bytes were stored.
    Fresh(RawDocument),
    /// Same content as the previous generation (304 or identical hash).
    Unchanged(RawDocument),
}

impl FetchOutcome {
    pub fn document(&self) -> &RawDocument {
        match self {
            FetchOutcome::Fresh(d) | FetchOutcome::Unchanged(d) => d,
        }
    }

    pub fn into_document(self) -> RawDocument {
        match self {
            FetchOutcome::Fresh(d) | FetchOutcome::Unchanged(d) => d,
        }
    }
}

/// Retrieves sources and writes their bytes to the document store.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn HttpTransport>,
    store: ArtifactStore,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, store: ArtifactStore, retry: RetryPolicy) -> Self {
        Self {
            transport,
            store,
            retry,
        }
    }

    /// Fetch one source.
    ///
    /// The outer `Result` carries store failures, which are fatal to the run;
    /// the inner one carries the per-item [`FetchError`].
    pub async fn fetch(
        &self,
        source: &Source,
        previous: Option<&RawDocument>,
    ) -> Result<Result<FetchOutcome, FetchError>, PipelineError> {
        // A previous record whose bytes went missing cannot back a 304.
        let previous = match previous {
            Some(p) if self.store.has_document(&p.content_hash).await => Some(p),
            _ => None,
        };
        let conditional = previous.and_then(Conditional::from_previous);

        let (result, retries) = with_backoff(&source.url, self.retry, || {
            let transport = Arc::clone(&self.transport);
            let conditional = conditional.clone();
            let url = source.url.clone();
            async move {
                let response = transport.get(&url, conditional.as_ref()).await?;
                classify_status(&url, response.status)?;
                Ok(response)
            }
        })
        .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => return Ok(Err(e)),
        };

        if response.status == 304 {
            if let Some(prev) = previous {
                debug!("{}: not modified", source.url);
                return Ok(Ok(FetchOutcome::Unchanged(prev.clone())));
            }
            // 304 without a cached copy: nothing usable came back.
            return Ok(Err(FetchError::HttpStatus {
                url: source.url.clone(),
                status: 304,
            }));
        }

        let (hash, written) = self.store.put_document(&response.body).await?;
        let kind = response
            .content_type
            .as_deref()
            .map(|ct| DocumentKind::from_content_type(ct, source.kind))
            .unwrap_or(source.kind);

        let document = RawDocument {
            source: source.clone(),
            content_hash: hash,
            fetched_at: Utc::now(),
            status: response.status,
            content_type: response.content_type,
            byte_len: response.body.len(),
            kind,
            etag: response.etag,
            last_modified: response.last_modified,
        };

        if let Some(prev) = previous.filter(|p| p.content_hash == document.content_hash) {
            debug!("{}: content unchanged ({})", source.url, &document.content_hash[..12]);
            // Keep the fresher validators while reusing the old record's identity.
            let mut unchanged = prev.clone();
            unchanged.etag = document.etag.or(unchanged.etag);
            unchanged.last_modified = document.last_modified.or(unchanged.last_modified);
            return Ok(Ok(FetchOutcome::Unchanged(unchanged)));
        }

        info!(
            "Fetched {} ({} bytes, {}{})",
            source.url,
            document.byte_len,
            if written { "new" } else { "known" },
            if retries > 0 {
                format!(", {retries} retries")
            } else {
                String::new()
            }
        );
        Ok(Ok(FetchOutcome::Fresh(document)))
    }
}
