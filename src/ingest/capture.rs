// src/ingest/capture.rs
//! Manual capture of a single user-supplied URL.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use once_cell::sync::OnceCell;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map};
use url::Url;

use crate::ingest::ensure_metrics_described;
use crate::ingest::error::CaptureError;
use crate::ingest::http::GuardedHttp;
use crate::ingest::normalize::{canonical_url, normalize, ArticleContext, DedupKey};
use crate::ingest::normalize_text;
use crate::ingest::rate_limit::{RateKey, RateLimiter, Throttled};
use crate::ingest::store::{ArticleStore, InsertOutcome};
use crate::ingest::types::{Article, Candidate, OwnerId};

const PAGE_ACCEPT: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.5";
const BODY_BLOCKS: &str = "p, h2, h3, h4, li, blockquote, pre";

/// Best-effort readable fields of an HTML page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub title: Option<String>,
    pub text: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub site_name: Option<String>,
}

fn sel(s: &str) -> Selector {
    Selector::parse(s).unwrap()
}

fn re_title_suffix() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s*[|\-\u{2013}\u{2014}]\s*[^|\-\u{2013}\u{2014}]+$").unwrap())
}

fn meta(doc: &Html, selector: &str) -> Option<String> {
    doc.select(&sel(selector))
        .filter_map(|m| m.value().attr("content"))
        .map(normalize_text)
        .find(|v| !v.is_empty())
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    doc.select(&sel(selector))
        .map(element_text)
        .find(|t| !t.is_empty())
}

fn page_title(doc: &Html) -> Option<String> {
    if let Some(t) = meta(doc, r#"meta[property="og:title"]"#) {
        return Some(t);
    }
    if let Some(t) = first_text(doc, "title") {
        let trimmed = re_title_suffix().replace(&t, "").trim().to_string();
        return Some(if trimmed.is_empty() { t } else { trimmed });
    }
    first_text(doc, "h1")
}

fn body_text(doc: &Html) -> Option<String> {
    let blocks = sel(BODY_BLOCKS);
    for container in ["article", "main", "body"] {
        let Some(root) = doc.select(&sel(container)).next() else {
            continue;
        };
        let parts: Vec<String> = root
            .select(&blocks)
            .map(element_text)
            .filter(|t| !t.is_empty())
            .collect();
        if !parts.is_empty() {
            return Some(parts.join("\n\n"));
        }
    }
    None
}

fn parse_page_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        })
}

/// Pull title, readable text and metadata out of an HTML document.
pub fn extract(html: &str) -> Extracted {
    let doc = Html::parse_document(html);
    Extracted {
        title: page_title(&doc),
        text: body_text(&doc),
        author: meta(&doc, r#"meta[name="author"]"#)
            .or_else(|| meta(&doc, r#"meta[property="article:author"]"#)),
        published_at: meta(&doc, r#"meta[property="article:published_time"]"#)
            .as_deref()
            .and_then(parse_page_date)
            .or_else(|| {
                doc.select(&sel("time[datetime]"))
                    .filter_map(|t| t.value().attr("datetime"))
                    .find_map(parse_page_date)
            }),
        site_name: meta(&doc, r#"meta[property="og:site_name"]"#),
    }
}

/// Host without a leading `www.`.
pub fn display_domain(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

pub struct Capturer {
    http: GuardedHttp,
    store: Arc<dyn ArticleStore>,
    limiter: RateLimiter,
}

impl Capturer {
    /// `limiter` gates captures per owner; share the pipeline's to keep one
    /// throttle state per process.
    pub fn new(http: GuardedHttp, store: Arc<dyn ArticleStore>, limiter: RateLimiter) -> Self {
        Self {
            http,
            store,
            limiter,
        }
    }

    /// Like [`Capturer::capture`], abandoned with `Cancelled` once
    /// `deadline` passes.
    pub async fn capture_with_deadline(
        &self,
        url: &str,
        owner: &OwnerId,
        deadline: Duration,
    ) -> Result<Article, CaptureError> {
        tokio::time::timeout(deadline, self.capture(url, owner))
            .await
            .unwrap_or(Err(CaptureError::Cancelled))
    }

    /// Fetch `url` through the guard and store it for `owner` with no
    /// source reference.
    pub async fn capture(&self, url: &str, owner: &OwnerId) -> Result<Article, CaptureError> {
        ensure_metrics_described();
        let res = self.capture_inner(url, owner).await;
        match &res {
            Ok(a) => {
                counter!("ingest_articles_added_total").increment(1);
                tracing::info!(target: "ingest", article_id = %a.id, url = %a.url, "article captured");
            }
            Err(CaptureError::Duplicate { .. }) => {
                tracing::info!(target: "ingest", url, "capture skipped, already stored");
            }
            Err(e) => {
                tracing::warn!(target: "ingest", url, error = %e, "capture failed");
            }
        }
        res
    }

    async fn capture_inner(&self, url: &str, owner: &OwnerId) -> Result<Article, CaptureError> {
        let canonical = canonical_url(url).map_err(|e| CaptureError::InvalidTarget {
            reason: e.to_string(),
        })?;
        let parsed = Url::parse(&canonical).map_err(|e| CaptureError::InvalidTarget {
            reason: e.to_string(),
        })?;

        if self
            .store
            .find_article(owner, &canonical)
            .await
            .map_err(|source| CaptureError::Persistence { source })?
            .is_some()
        {
            return Err(CaptureError::Duplicate { url: canonical });
        }

        // Dropped on cancellation, which hands the slot back.
        let permit = match self.limiter.allow(&RateKey::Capture(owner.clone())) {
            Ok(p) => p,
            Err(Throttled { retry_after }) => {
                counter!("ingest_rate_limited_total").increment(1);
                return Err(CaptureError::Throttled { retry_after });
            }
        };
        let fetched = self.http.get(&canonical, PAGE_ACCEPT).await;
        permit.commit();
        let page = fetched?;
        let extracted = extract(&page.body);
        let Some(title) = extracted.title else {
            return Err(CaptureError::Extraction {
                reason: "could not extract a title from the page".into(),
            });
        };

        let domain = display_domain(&parsed);
        let mut metadata = Map::new();
        metadata.insert("manual_capture".into(), json!(true));
        metadata.insert("sitename".into(), json!(extracted.site_name));
        metadata.insert("domain".into(), json!(domain));

        let candidate = Candidate {
            title: Some(title),
            url: Some(canonical.clone()),
            author: extracted.author,
            published_at: extracted.published_at,
            content: extracted.text,
            tags: vec!["manual".into(), domain],
            metadata,
        };
        let ctx = ArticleContext {
            owner: owner.clone(),
            ..Default::default()
        };
        let article = normalize(candidate, &ctx, Utc::now()).map_err(|e| {
            CaptureError::Extraction {
                reason: e.to_string(),
            }
        })?;
        let fp = DedupKey::of(&article).fingerprint();

        match self.store.insert_article(article).await {
            Ok(InsertOutcome::Inserted(a)) => Ok(a),
            Ok(InsertOutcome::Duplicate) => {
                tracing::debug!(target: "ingest", key = %fp, "capture lost insert race");
                Err(CaptureError::Duplicate { url: canonical })
            }
            Err(source) => Err(CaptureError::Persistence { source }),
        }
    }
}
