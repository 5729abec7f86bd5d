// src/ingest/types.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identity of a configured source, assigned by the registry.
    SourceId
);
string_id!(
    /// The account that owns sources and articles.
    OwnerId
);
string_id!(
    /// Identity of a stored article, assigned by the store.
    ArticleId
);

/// Protocol of a source. Selects the fetcher variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// RSS 2.0 / Atom feed addressed by URL.
    #[serde(alias = "rss")]
    Syndication,
    /// Community discussion feed addressed by community name.
    #[serde(alias = "reddit")]
    Community,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Syndication => "syndication",
            SourceKind::Community => "community",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured source. Owned by the registry; the pipeline only reads it
/// and reports back the last-fetch timestamp and last error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub owner: OwnerId,
    pub kind: SourceKind,
    /// Feed URL for syndication sources, community name for community sources.
    pub target: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub last_fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Raw entry produced by a fetcher, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub title: Option<String>,
    pub url: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// A normalized article ready to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewArticle {
    pub owner: OwnerId,
    pub source_id: Option<SourceId>,
    pub title: String,
    /// Canonical URL; together with `owner` this is the dedup key.
    pub url: String,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl NewArticle {
    pub fn into_article(self, id: ArticleId) -> Article {
        Article {
            id,
            owner: self.owner,
            source_id: self.source_id,
            title: self.title,
            url: self.url,
            content: self.content,
            author: self.author,
            published_at: self.published_at,
            captured_at: self.captured_at,
            tags: self.tags,
            metadata: self.metadata,
        }
    }
}

/// A stored article. Never updated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub owner: OwnerId,
    pub source_id: Option<SourceId>,
    pub title: String,
    pub url: String,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}
