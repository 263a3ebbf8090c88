//! Content acquisition: fetch a source location and extract structured text.
//!
//! `acquire` never fails. Network, status, content-type and extraction problems
//! are captured as a failed [`Document`] carrying a [`FailureReason`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::ResearchError;
use crate::config::AcquisitionConfig;
use crate::metrics;
use crate::text::{collapse_whitespace, truncate_chars};

/// Opaque identifier of one unit of content, typically a URL.
pub type SourceLocation = String;

const NON_CONTENT_TAGS: &[&str] = &[
    "head", "script", "style", "noscript", "template", "svg", "nav", "header", "footer", "aside",
];
const MAX_REDIRECTS: usize = 5;

static COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("invalid comment regex"));
static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>").expect("invalid title regex"));
static BLOCKS: Lazy<Vec<Regex>> = Lazy::new(|| {
    NON_CONTENT_TAGS
        .iter()
        .map(|tag| {
            Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).expect("invalid block regex")
        })
        .collect()
});
static MAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<main\b[^>]*>(.*)</main\s*>").expect("invalid main regex"));
static ARTICLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<article\b[^>]*>(.*)</article\s*>").expect("invalid article regex")
});
static HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<h[1-6]\b[^>]*>(.*?)</h[1-6]\s*>").expect("invalid heading regex")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("invalid tag regex"));
static NUMERIC_ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&#([xX][0-9a-fA-F]+|[0-9]+);").expect("invalid entity regex")
});
static HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"'#][^"']*)["']"#).expect("invalid href regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    Unreachable,
    NonTextContent,
    EmptyAfterExtraction,
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Unreachable => "unreachable",
            FailureReason::NonTextContent => "non-text-content",
            FailureReason::EmptyAfterExtraction => "empty-after-extraction",
            FailureReason::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcquisitionOutcome {
    Success,
    Failure { reason: FailureReason, detail: String },
}

/// Result of acquiring one source location. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    source: SourceLocation,
    title: Option<String>,
    headings: Vec<String>,
    body: String,
    word_count: usize,
    outcome: AcquisitionOutcome,
}

impl Document {
    /// Build a document from already-extracted parts.
    ///
    /// The body is whitespace-collapsed; an empty body yields an
    /// `empty-after-extraction` failure.
    pub fn from_parts(
        source: impl Into<SourceLocation>,
        title: Option<String>,
        headings: Vec<String>,
        body: &str,
    ) -> Self {
        let source = source.into();
        let body = collapse_whitespace(body);
        let title = title
            .map(|title| collapse_whitespace(&title))
            .filter(|title| !title.is_empty());

        if body.is_empty() {
            return Self {
                source,
                title,
                headings,
                body,
                word_count: 0,
                outcome: AcquisitionOutcome::Failure {
                    reason: FailureReason::EmptyAfterExtraction,
                    detail: "no body text after removing markup".into(),
                },
            };
        }

        Self {
            word_count: body.split_whitespace().count(),
            source,
            title,
            headings,
            body,
            outcome: AcquisitionOutcome::Success,
        }
    }

    pub fn failed(
        source: impl Into<SourceLocation>,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            title: None,
            headings: Vec::new(),
            body: String::new(),
            word_count: 0,
            outcome: AcquisitionOutcome::Failure {
                reason,
                detail: detail.into(),
            },
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Title, falling back to the source location.
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.source)
    }

    pub fn headings(&self) -> &[String] {
        &self.headings
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn word_count(&self) -> usize {
        self.word_count
    }

    pub fn outcome(&self) -> &AcquisitionOutcome {
        &self.outcome
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AcquisitionOutcome::Success)
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.outcome {
            AcquisitionOutcome::Success => None,
            AcquisitionOutcome::Failure { reason, .. } => Some(*reason),
        }
    }
}

/// Raw page returned by a [`PageFetcher`].
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedPage {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            content_type: Some("text/html; charset=utf-8".into()),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Unreachable(String),
    Timeout,
    NonText(String),
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<FetchedPage, FetchError>;
}

/// `reqwest`-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(settings: &AcquisitionConfig) -> Result<Self, ResearchError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .user_agent(settings.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|err| {
                ResearchError::InvalidConfiguration(format!("failed to build HTTP client: {err}"))
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, location: &str) -> Result<FetchedPage, FetchError> {
        let url = Url::parse(location)
            .map_err(|err| FetchError::Unreachable(format!("invalid URL: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::Unreachable(format!(
                "unsupported scheme `{}`",
                url.scheme()
            )));
        }

        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Unreachable(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Unreachable(format!("HTTP {status}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        if let Some(kind) = content_type.as_deref() {
            if !is_textual(kind) {
                return Err(FetchError::NonText(kind.to_string()));
            }
        }

        let body = response.text().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Unreachable(format!("failed to read body: {err}"))
            }
        })?;

        Ok(FetchedPage { content_type, body })
    }
}

fn mime_of(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub(crate) fn is_textual(content_type: &str) -> bool {
    let mime = mime_of(content_type);
    mime.starts_with("text/")
        || mime.ends_with("+xml")
        || mime == "application/xml"
        || mime == "application/json"
}

fn decode_entities(text: &str) -> String {
    let named = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'");
    let numeric = NUMERIC_ENTITY.replace_all(&named, |caps: &Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    numeric.replace("&amp;", "&")
}

/// Strip tags, decode entities, collapse whitespace.
fn clean_fragment(fragment: &str) -> String {
    collapse_whitespace(&decode_entities(&TAG.replace_all(fragment, " ")))
}

/// Turn a fetched page into a [`Document`].
pub(crate) fn extract_document(
    location: &str,
    page: &FetchedPage,
    settings: &AcquisitionConfig,
) -> Document {
    let plain_text = page
        .content_type
        .as_deref()
        .is_some_and(|kind| mime_of(kind) == "text/plain");

    let (title, headings, body) = if plain_text {
        (None, Vec::new(), collapse_whitespace(&page.body))
    } else {
        let html = page.body.as_str();
        let title = TITLE
            .captures(html)
            .map(|caps| clean_fragment(&caps[1]))
            .filter(|title| !title.is_empty());

        let mut cleaned = COMMENT.replace_all(html, " ").into_owned();
        for block in BLOCKS.iter() {
            cleaned = block.replace_all(&cleaned, " ").into_owned();
        }

        let headings: Vec<String> = HEADING
            .captures_iter(&cleaned)
            .map(|caps| clean_fragment(&caps[1]))
            .filter(|heading| !heading.is_empty())
            .take(settings.max_headings)
            .collect();

        let region = MAIN
            .captures(&cleaned)
            .or_else(|| ARTICLE.captures(&cleaned))
            .map(|caps| caps[1].to_string())
            .unwrap_or_else(|| cleaned.clone());

        (title, headings, clean_fragment(&region))
    };

    let body = if body.chars().count() > settings.max_body_chars {
        format!("{}...", truncate_chars(&body, settings.max_body_chars))
    } else {
        body
    };

    Document::from_parts(location, title, headings, &body)
}

/// Same-host links of an HTML page, absolute and fragment-free, in document order.
pub(crate) fn extract_links(base: &str, html: &str, max: usize) -> Vec<SourceLocation> {
    let Ok(base_url) = Url::parse(base) else {
        return Vec::new();
    };
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(base_url.as_str().trim_end_matches('/').to_string());

    HREF.captures_iter(html)
        .filter_map(|caps| base_url.join(caps[1].trim()).ok())
        .filter(|link| matches!(link.scheme(), "http" | "https"))
        .filter(|link| link.host_str() == base_url.host_str())
        .map(|mut link| {
            link.set_fragment(None);
            link.to_string()
        })
        .filter(|link| seen.insert(link.trim_end_matches('/').to_string()))
        .take(max)
        .collect()
}

/// Fetches and extracts source locations, one bounded timeout per source.
pub struct ContentAcquirer {
    fetcher: Arc<dyn PageFetcher>,
    settings: AcquisitionConfig,
}

impl ContentAcquirer {
    pub fn new(fetcher: Arc<dyn PageFetcher>, settings: AcquisitionConfig) -> Self {
        Self { fetcher, settings }
    }

    #[instrument(name = "acquire.source", skip(self))]
    pub async fn acquire(&self, location: &str) -> Document {
        let fetched =
            tokio::time::timeout(self.settings.timeout(), self.fetcher.fetch(location)).await;

        let document = match fetched {
            Err(_) => Document::failed(
                location,
                FailureReason::Timeout,
                format!("no response within {} ms", self.settings.timeout_ms),
            ),
            Ok(Err(FetchError::Timeout)) => {
                Document::failed(location, FailureReason::Timeout, "fetch timed out")
            }
            Ok(Err(FetchError::Unreachable(detail))) => {
                Document::failed(location, FailureReason::Unreachable, detail)
            }
            Ok(Err(FetchError::NonText(kind))) => Document::failed(
                location,
                FailureReason::NonTextContent,
                format!("content type {kind}"),
            ),
            Ok(Ok(page)) => match page.content_type.as_deref() {
                Some(kind) if !is_textual(kind) => Document::failed(
                    location,
                    FailureReason::NonTextContent,
                    format!("content type {kind}"),
                ),
                _ => extract_document(location, &page, &self.settings),
            },
        };

        match document.failure_reason() {
            None => {
                debug!(
                    words = document.word_count(),
                    headings = document.headings().len(),
                    "source acquired"
                );
                metrics::record_acquisition("success");
            }
            Some(reason) => {
                warn!(reason = reason.as_str(), "source acquisition failed");
                metrics::record_acquisition(reason.as_str());
            }
        }

        document
    }

    /// Acquire every location concurrently; output order matches input order.
    pub async fn acquire_all(&self, locations: &[SourceLocation]) -> Vec<Document> {
        let permits = self.settings.max_concurrency.min(locations.len()).max(1);
        let semaphore = Semaphore::new(permits);
        let semaphore = &semaphore;

        let documents = join_all(locations.iter().map(|location| async move {
            let _permit = semaphore.acquire().await.ok();
            self.acquire(location).await
        }))
        .await;

        info!(
            attempted = locations.len(),
            acquired = documents.iter().filter(|doc| doc.is_success()).count(),
            "acquisition complete"
        );
        documents
    }

    /// Same-host links found on `location`, at most `max`.
    pub async fn discover_links(&self, location: &str, max: usize) -> Vec<SourceLocation> {
        if max == 0 {
            return Vec::new();
        }
        match tokio::time::timeout(self.settings.timeout(), self.fetcher.fetch(location)).await {
            Ok(Ok(page)) => extract_links(location, &page.body, max),
            _ => {
                debug!(%location, "link discovery skipped: page unavailable");
                Vec::new()
            }
        }
    }
}
