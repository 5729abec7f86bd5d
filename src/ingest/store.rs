// src/ingest/store.rs
//! Seams to the external source registry and article store, plus in-memory
//! implementations used by the binary and the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ingest::error::StoreError;
use crate::ingest::types::{Article, ArticleId, NewArticle, OwnerId, Source, SourceId};

/// Result of an insert. A duplicate is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Article),
    Duplicate,
}

#[async_trait]
pub trait SourceRegistry: Send + Sync {
    /// Active sources across all owners.
    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError>;

    async fn source(&self, id: &SourceId) -> Result<Option<Source>, StoreError>;

    /// Record a finished fetch. `error` replaces the last-error marker;
    /// `None` clears it.
    async fn update_last_fetched(
        &self,
        id: &SourceId,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Insert unless (owner, url) already exists. Implementations must
    /// enforce that uniqueness themselves; callers may race.
    async fn insert_article(&self, article: NewArticle) -> Result<InsertOutcome, StoreError>;

    async fn find_article(&self, owner: &OwnerId, url: &str)
        -> Result<Option<Article>, StoreError>;
}

fn poisoned(what: &str) -> StoreError {
    StoreError::Unavailable {
        reason: format!("{what} lock poisoned"),
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    sources: RwLock<BTreeMap<SourceId, Source>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: impl IntoIterator<Item = Source>) -> Self {
        let reg = Self::new();
        for s in sources {
            reg.upsert(s);
        }
        reg
    }

    pub fn upsert(&self, source: Source) {
        let mut map = self.sources.write().unwrap_or_else(|p| p.into_inner());
        map.insert(source.id.clone(), source);
    }

    /// Current copy of one source, for inspection.
    pub fn get(&self, id: &SourceId) -> Option<Source> {
        let map = self.sources.read().unwrap_or_else(|p| p.into_inner());
        map.get(id).cloned()
    }
}

#[async_trait]
impl SourceRegistry for MemoryRegistry {
    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError> {
        let map = self.sources.read().map_err(|_| poisoned("registry"))?;
        Ok(map.values().filter(|s| s.active).cloned().collect())
    }

    async fn source(&self, id: &SourceId) -> Result<Option<Source>, StoreError> {
        let map = self.sources.read().map_err(|_| poisoned("registry"))?;
        Ok(map.get(id).cloned())
    }

    async fn update_last_fetched(
        &self,
        id: &SourceId,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut map = self.sources.write().map_err(|_| poisoned("registry"))?;
        let src = map
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownSource { id: id.clone() })?;
        src.last_fetched_at = Some(at);
        src.last_error = error;
        Ok(())
    }
}

#[derive(Default)]
struct Articles {
    by_key: HashMap<(OwnerId, String), Article>,
    next_id: u64,
}

/// Article store keeping the (owner, url) uniqueness check and the insert
/// under one lock, the in-memory counterpart of a unique index.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Articles>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|a| a.by_key.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored articles ordered by id.
    pub fn snapshot(&self) -> Vec<Article> {
        let Ok(a) = self.inner.lock() else {
            return Vec::new();
        };
        let mut v: Vec<Article> = a.by_key.values().cloned().collect();
        v.sort_by_key(|x| x.id.0.parse::<u64>().unwrap_or(u64::MAX));
        v
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn insert_article(&self, article: NewArticle) -> Result<InsertOutcome, StoreError> {
        let mut a = self.inner.lock().map_err(|_| poisoned("article store"))?;
        let key = (article.owner.clone(), article.url.clone());
        if a.by_key.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        a.next_id += 1;
        let stored = article.into_article(ArticleId(a.next_id.to_string()));
        a.by_key.insert(key, stored.clone());
        Ok(InsertOutcome::Inserted(stored))
    }

    async fn find_article(
        &self,
        owner: &OwnerId,
        url: &str,
    ) -> Result<Option<Article>, StoreError> {
        let a = self.inner.lock().map_err(|_| poisoned("article store"))?;
        Ok(a.by_key.get(&(owner.clone(), url.to_string())).cloned())
    }
}
