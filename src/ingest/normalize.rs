// src/ingest/normalize.rs
//! Candidate -> article mapping and the dedup boundary.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::{Map, Value};
use snafu::Snafu;
use url::Url;

use crate::ingest::error::StoreError;
use crate::ingest::store::{ArticleStore, InsertOutcome};
use crate::ingest::types::{Article, Candidate, NewArticle, OwnerId, SourceId};
use crate::ingest::{clip_chars, normalize_text, truncate_chars};

pub const MAX_TITLE_CHARS: usize = 500;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_CONTENT_CHARS: usize = 50_000;
pub const MAX_AUTHOR_CHARS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum EntryRejected {
    #[snafu(display("entry has no title"))]
    MissingTitle,
    #[snafu(display("entry has no URL"))]
    MissingUrl,
    #[snafu(display("entry URL '{url}' is unusable: {reason}"))]
    BadUrl { url: String, reason: String },
}

/// The (owner, canonical URL) pair articles are unique on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupKey<'a> {
    pub owner: &'a OwnerId,
    pub url: &'a str,
}

impl<'a> DedupKey<'a> {
    pub fn of(article: &'a NewArticle) -> Self {
        Self {
            owner: &article.owner,
            url: &article.url,
        }
    }

    /// Short anonymized form for logs.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.owner.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.url.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(12);
        for b in digest.iter().take(6) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

/// Fields every article of one fetch shares.
#[derive(Debug, Clone, Default)]
pub struct ArticleContext {
    pub owner: OwnerId,
    pub source_id: Option<SourceId>,
    pub base_tags: Vec<String>,
    pub base_metadata: Map<String, Value>,
}

/// Parse, drop the fragment, require http(s) and a host.
pub fn canonical_url(raw: &str) -> Result<String, EntryRejected> {
    let raw = raw.trim();
    let bad = |reason: &str| EntryRejected::BadUrl {
        url: clip_chars(raw, 200),
        reason: reason.to_string(),
    };
    let mut url = Url::parse(raw).map_err(|e| bad(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(bad("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(bad("no host"));
    }
    url.set_fragment(None);
    let s = String::from(url);
    if s.len() > MAX_URL_LEN {
        return Err(bad("longer than 2048 characters"));
    }
    Ok(s)
}

/// Trimmed, lowercased, non-empty, first occurrence kept.
pub fn dedup_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for t in tags {
        let t = t.as_ref().trim().to_lowercase();
        if !t.is_empty() && !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

/// Merge `new` into `base`; on conflicting keys the new value wins.
pub fn merge_metadata(base: &mut Map<String, Value>, new: Map<String, Value>) {
    for (k, v) in new {
        base.insert(k, v);
    }
}

fn re_hspace() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"[^\S\n]+").unwrap())
}

fn re_blank_lines() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap())
}

fn re_markup() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b.*?</(script|style)\s*>|</?[A-Za-z][^>]*>").unwrap()
    })
}

/// Body cleanup that keeps line structure: markup stripped, entities
/// decoded, runs of spaces collapsed, at most one blank line in a row.
pub fn clean_body(s: &str) -> String {
    let stripped = re_markup().replace_all(s, "");
    let decoded = html_escape::decode_html_entities(&stripped);
    let lines: Vec<&str> = decoded.split('\n').collect();
    let joined = lines
        .iter()
        .map(|l| re_hspace().replace_all(l, " ").trim().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    re_blank_lines()
        .replace_all(&joined, "\n\n")
        .trim()
        .to_string()
}

/// Map a candidate onto the article shape.
pub fn normalize(
    candidate: Candidate,
    ctx: &ArticleContext,
    now: DateTime<Utc>,
) -> Result<NewArticle, EntryRejected> {
    let title = candidate
        .title
        .as_deref()
        .map(normalize_text)
        .filter(|t| !t.is_empty())
        .ok_or(EntryRejected::MissingTitle)?;
    let raw_url = candidate
        .url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or(EntryRejected::MissingUrl)?;
    let url = canonical_url(raw_url)?;

    let content = candidate
        .content
        .as_deref()
        .map(clean_body)
        .filter(|c| !c.is_empty())
        .map(|c| truncate_chars(&c, MAX_CONTENT_CHARS));
    let author = candidate
        .author
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| clip_chars(a, MAX_AUTHOR_CHARS));

    let tags = dedup_tags(ctx.base_tags.iter().chain(candidate.tags.iter()));
    let mut metadata = ctx.base_metadata.clone();
    merge_metadata(&mut metadata, candidate.metadata);

    Ok(NewArticle {
        owner: ctx.owner.clone(),
        source_id: ctx.source_id.clone(),
        title: clip_chars(&title, MAX_TITLE_CHARS),
        url,
        content,
        author,
        published_at: candidate.published_at,
        captured_at: now,
        tags,
        metadata,
    })
}

/// Three-way result of handing an article to the store.
#[derive(Debug)]
pub enum Persisted {
    Inserted(Article),
    Duplicate,
    Failed(StoreError),
}

pub async fn persist(store: &dyn ArticleStore, article: NewArticle) -> Persisted {
    let fp = DedupKey::of(&article).fingerprint();
    match store.insert_article(article).await {
        Ok(InsertOutcome::Inserted(a)) => {
            tracing::trace!(target: "ingest", key = %fp, article_id = %a.id, "article stored");
            Persisted::Inserted(a)
        }
        Ok(InsertOutcome::Duplicate) => {
            tracing::trace!(target: "ingest", key = %fp, "duplicate skipped");
            Persisted::Duplicate
        }
        Err(e) => {
            tracing::warn!(target: "ingest", key = %fp, error = %e, "article insert failed");
            Persisted::Failed(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::store::MemoryStore;
    use serde_json::json;

    fn ctx() -> ArticleContext {
        let mut base_metadata = Map::new();
        base_metadata.insert("origin".into(), json!("feed"));
        base_metadata.insert("lang".into(), json!("en"));
        ArticleContext {
            owner: "u1".into(),
            source_id: Some("s1".into()),
            base_tags: vec!["Tech".into()],
            base_metadata,
        }
    }

    fn candidate() -> Candidate {
        let mut metadata = Map::new();
        metadata.insert("lang".into(), json!("fr"));
        Candidate {
            title: Some("  A   title ".into()),
            url: Some("HTTPS://Example.COM/path?q=1#section".into()),
            author: Some("   ".into()),
            content: Some("<p>One&amp;two</p>\n\n\n\n<p>three   four</p>".into()),
            tags: vec!["tech".into(), " News ".into(), "".into()],
            metadata,
            ..Default::default()
        }
    }

    #[test]
    fn candidate_is_mapped_to_canonical_shape() {
        let now = Utc::now();
        let a = normalize(candidate(), &ctx(), now).unwrap();
        assert_eq!(a.title, "A title");
        assert_eq!(a.url, "https://example.com/path?q=1");
        assert_eq!(a.author, None);
        assert_eq!(a.content.as_deref(), Some("One&two\n\nthree four"));
        assert_eq!(a.tags, vec!["tech".to_string(), "news".to_string()]);
        assert_eq!(a.metadata["lang"], "fr");
        assert_eq!(a.metadata["origin"], "feed");
        assert_eq!(a.captured_at, now);
        assert_eq!(a.source_id.as_ref().map(|s| s.as_str()), Some("s1"));
    }

    #[test]
    fn required_fields_and_limits() {
        let mut c = candidate();
        c.title = Some("<b></b>".into());
        assert_eq!(
            normalize(c, &ctx(), Utc::now()).unwrap_err(),
            EntryRejected::MissingTitle
        );

        let mut c = candidate();
        c.url = None;
        assert_eq!(
            normalize(c, &ctx(), Utc::now()).unwrap_err(),
            EntryRejected::MissingUrl
        );

        let mut c = candidate();
        c.url = Some("javascript:alert(1)".into());
        assert!(matches!(
            normalize(c, &ctx(), Utc::now()),
            Err(EntryRejected::BadUrl { .. })
        ));

        let mut c = candidate();
        c.title = Some("t".repeat(800));
        c.content = Some("x".repeat(60_000));
        c.author = Some("a".repeat(300));
        let a = normalize(c, &ctx(), Utc::now()).unwrap();
        assert_eq!(a.title.chars().count(), MAX_TITLE_CHARS);
        assert_eq!(a.author.unwrap().chars().count(), MAX_AUTHOR_CHARS);
        let content = a.content.unwrap();
        assert!(content.ends_with("..."));
        assert_eq!(content.chars().count(), MAX_CONTENT_CHARS + 3);

        let long = format!("https://example.com/{}", "p".repeat(2100));
        assert!(canonical_url(&long).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let owner = OwnerId::from("u1");
        let k = DedupKey {
            owner: &owner,
            url: "https://example.com/a",
        };
        assert_eq!(k.fingerprint().len(), 12);
        assert_eq!(k.fingerprint(), k.fingerprint());
        let other = DedupKey {
            owner: &owner,
            url: "https://example.com/b",
        };
        assert_ne!(k.fingerprint(), other.fingerprint());
    }

    #[tokio::test]
    async fn persist_reports_three_way_outcome() {
        let store = MemoryStore::new();
        let a = normalize(candidate(), &ctx(), Utc::now()).unwrap();
        assert!(matches!(
            persist(&store, a.clone()).await,
            Persisted::Inserted(_)
        ));
        assert!(matches!(persist(&store, a).await, Persisted::Duplicate));
    }
}
