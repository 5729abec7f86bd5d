// src/ingest/providers/mod.rs
pub mod community;
pub mod syndication;

use std::sync::Arc;

use async_trait::async_trait;

use crate::ingest::error::FetchError;
use crate::ingest::types::{Candidate, Source, SourceKind};

/// Produces candidate entries for one kind of source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Cheap, offline validation of the source target (URL syntax,
    /// community name rules). Runs before any rate-limit slot is taken.
    fn check_target(&self, target: &str) -> Result<(), FetchError>;

    /// Fetch candidates in feed order.
    async fn fetch(&self, source: &Source) -> Result<Vec<Candidate>, FetchError>;
}

/// One fetcher per source kind, chosen once at dispatch.
#[derive(Clone)]
pub struct FetcherSet {
    syndication: Arc<dyn SourceFetcher>,
    community: Arc<dyn SourceFetcher>,
}

impl FetcherSet {
    pub fn new(syndication: Arc<dyn SourceFetcher>, community: Arc<dyn SourceFetcher>) -> Self {
        Self {
            syndication,
            community,
        }
    }

    pub fn for_kind(&self, kind: SourceKind) -> &Arc<dyn SourceFetcher> {
        match kind {
            SourceKind::Syndication => &self.syndication,
            SourceKind::Community => &self.community,
        }
    }
}
