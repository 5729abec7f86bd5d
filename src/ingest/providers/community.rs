// src/ingest/providers/community.rs
//! Community discussion feeds (subreddit listings via the public JSON API).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use url::Url;

use crate::ingest::config::CommunityConfig;
use crate::ingest::error::{FetchError, ParseSnafu};
use crate::ingest::http::GuardedHttp;
use crate::ingest::providers::SourceFetcher;
use crate::ingest::rate_limit::{RateKey, RateLimiter};
use crate::ingest::truncate_chars;
use crate::ingest::types::{Candidate, Source, SourceKind};

const MAX_COMMENT_CHARS: usize = 500;

fn re_name() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{3,21}$").unwrap())
}

/// Accepts `name`, `r/name`, `/r/name` or a full community URL and returns
/// the bare lowercase name, provided it satisfies the platform naming rule
/// (3-21 characters, ASCII letters, digits, underscore).
pub fn normalize_community_name(target: &str) -> Result<String, FetchError> {
    let raw = target.trim();
    let path = if raw.starts_with("http://") || raw.starts_with("https://") {
        let url = Url::parse(raw).map_err(|e| FetchError::InvalidTarget {
            reason: format!("community URL '{raw}': {e}"),
        })?;
        let mut segs = url.path_segments().into_iter().flatten();
        match (segs.next(), segs.next()) {
            (Some("r"), Some(name)) => name.to_string(),
            _ => {
                return Err(FetchError::InvalidTarget {
                    reason: format!("'{raw}' is not a community URL"),
                })
            }
        }
    } else {
        let p = raw.trim_start_matches('/');
        let p = p
            .strip_prefix("r/")
            .or_else(|| p.strip_prefix("R/"))
            .unwrap_or(p);
        p.trim_end_matches('/').to_string()
    };

    if re_name().is_match(&path) {
        Ok(path.to_ascii_lowercase())
    } else {
        Err(FetchError::InvalidTarget {
            reason: format!(
                "invalid community name '{path}': expected 3-21 letters, digits or underscores"
            ),
        })
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Thing>,
}

#[derive(Debug, Deserialize)]
struct Thing {
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Post {
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub selftext: String,
    pub author: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: u64,
    pub created_utc: Option<f64>,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub stickied: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub body: Option<String>,
    pub author: Option<String>,
    #[serde(default)]
    pub score: i64,
}

fn things<T: for<'de> Deserialize<'de>>(listing: Listing, kind: &str) -> Vec<T> {
    listing
        .data
        .children
        .into_iter()
        .filter(|t| t.kind == kind)
        .filter_map(|t| serde_json::from_value(t.data).ok())
        .collect()
}

/// Posts of a listing, stickied ones removed.
pub fn parse_posts(body: &str) -> Result<Vec<Post>, FetchError> {
    let listing: Listing = serde_json::from_str(body).map_err(|e| {
        ParseSnafu {
            what: "community listing",
            reason: e.to_string(),
        }
        .build()
    })?;
    Ok(things::<Post>(listing, "t3")
        .into_iter()
        .filter(|p| !p.stickied)
        .collect())
}

/// Top `max` comments of a comment page, best score first.
pub fn parse_comments(body: &str, max: usize) -> Result<Vec<Comment>, FetchError> {
    // [post listing, comment listing]
    let pages: Vec<Listing> = serde_json::from_str(body).map_err(|e| {
        ParseSnafu {
            what: "comment page",
            reason: e.to_string(),
        }
        .build()
    })?;
    let Some(listing) = pages.into_iter().nth(1) else {
        return Ok(Vec::new());
    };
    let mut comments: Vec<Comment> = things::<Comment>(listing, "t1")
        .into_iter()
        .filter(|c| {
            c.body.as_deref().is_some_and(|b| !b.is_empty())
                && c.author.as_deref().is_some_and(|a| !a.is_empty())
        })
        .collect();
    comments.sort_by(|a, b| b.score.cmp(&a.score));
    comments.truncate(max);
    Ok(comments)
}

/// Self text followed by a quoted "Top Comments" block.
pub fn build_content(selftext: &str, comments: &[Comment]) -> String {
    let mut out = String::new();
    let selftext = selftext.trim();
    if !selftext.is_empty() {
        out.push_str(selftext);
    }
    if !comments.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n---\n");
        }
        out.push_str("**Top Comments:**\n");
        for c in comments {
            let body = truncate_chars(c.body.as_deref().unwrap_or_default(), MAX_COMMENT_CHARS);
            let author = c.author.as_deref().unwrap_or("[deleted]");
            out.push_str(&format!("\n> {body}\n> - u/{author} ({} points)\n", c.score));
        }
    }
    out
}

/// Map a post and its comments to a candidate.
pub fn post_to_candidate(
    post: &Post,
    comments: &[Comment],
    community: &str,
    category: Option<&str>,
) -> Candidate {
    let author = post.author.as_deref().unwrap_or("[deleted]");
    let url = (!post.permalink.is_empty()).then(|| format!("https://reddit.com{}", post.permalink));
    let content = build_content(&post.selftext, comments);

    let mut tags = vec![format!("r/{community}")];
    if let Some(cat) = category {
        tags.push(cat.to_lowercase());
    }

    let mut metadata = Map::new();
    metadata.insert(
        "reddit".into(),
        json!({
            "score": post.score,
            "num_comments": post.num_comments,
            "author": author,
            "permalink": post.permalink,
            "subreddit": community,
            "is_self": post.is_self,
            "post_id": post.id,
        }),
    );

    Candidate {
        title: post.title.clone(),
        url,
        author: Some(format!("u/{author}")),
        published_at: post
            .created_utc
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0)),
        content: (!content.is_empty()).then_some(content),
        tags,
        metadata,
    }
}

pub struct CommunityFetcher {
    http: GuardedHttp,
    limiter: RateLimiter,
    cfg: CommunityConfig,
}

impl CommunityFetcher {
    pub fn new(http: GuardedHttp, limiter: RateLimiter, cfg: CommunityConfig) -> Self {
        let http = http.with_user_agent(cfg.user_agent.clone());
        Self { http, limiter, cfg }
    }

    fn base(&self) -> &str {
        self.cfg.base_url.trim_end_matches('/')
    }

    async fn get_json(&self, url: &str) -> Result<String, FetchError> {
        self.limiter
            .pace(&RateKey::Requests(SourceKind::Community))
            .await;
        Ok(self.http.get(url, "application/json").await?.body)
    }

    async fn fetch_comments(&self, community: &str, post_id: &str) -> Vec<Comment> {
        let url = format!(
            "{}/r/{community}/comments/{post_id}.json?limit={}&sort=top",
            self.base(),
            self.cfg.max_comments
        );
        match self.get_json(&url).await {
            Ok(body) => parse_comments(&body, self.cfg.max_comments).unwrap_or_else(|e| {
                tracing::debug!(target: "ingest", post_id, error = %e, "comment page unreadable");
                Vec::new()
            }),
            Err(e) => {
                tracing::debug!(target: "ingest", post_id, error = %e, "comment fetch failed");
                Vec::new()
            }
        }
    }

    async fn fetch_listing(&self, source: &Source) -> Result<Vec<Candidate>, FetchError> {
        let community = normalize_community_name(&source.target)?;
        let url = format!(
            "{}/r/{community}/hot.json?limit={}",
            self.base(),
            self.cfg.max_posts
        );
        let body = self.get_json(&url).await.inspect_err(|e| {
            if let Some(status) = e.status() {
                tracing::warn!(target: "ingest", community = %community, status, "community listing refused");
            }
        })?;
        let posts = parse_posts(&body)?;

        let mut out = Vec::with_capacity(posts.len());
        for post in posts.iter().take(self.cfg.max_posts) {
            let comments = match post.id.as_deref() {
                Some(id) if post.num_comments > 0 && self.cfg.max_comments > 0 => {
                    self.fetch_comments(&community, id).await
                }
                _ => Vec::new(),
            };
            out.push(post_to_candidate(
                post,
                &comments,
                &community,
                source.category.as_deref(),
            ));
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceFetcher for CommunityFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Community
    }

    fn check_target(&self, target: &str) -> Result<(), FetchError> {
        normalize_community_name(target).map(|_| ())
    }

    async fn fetch(&self, source: &Source) -> Result<Vec<Candidate>, FetchError> {
        let budget = self.cfg.max_fetch_time();
        match tokio::time::timeout(budget, self.fetch_listing(source)).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Timeout {
                secs: budget.as_secs(),
            }),
        }
    }
}
