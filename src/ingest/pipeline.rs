// src/ingest/pipeline.rs
//! Fetch orchestrator: bulk and single-source runs.
//!
//! Per source the stages run strictly in order (target check, rate-limit
//! admission, fetch, normalize, persist, registry update). Across sources
//! runs are concurrent up to `concurrency`. A failure is recorded in that
//! source's outcome and never reaches its siblings; only an unusable
//! registry fails a whole run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Serialize;

use crate::ingest::config::IngestConfig;
use crate::ingest::ensure_metrics_described;
use crate::ingest::error::{ErrorKind, FetchError, PipelineError};
use crate::ingest::guard::SsrfGuard;
use crate::ingest::normalize::{normalize, persist, ArticleContext, Persisted};
use crate::ingest::providers::community::CommunityFetcher;
use crate::ingest::providers::syndication::SyndicationFetcher;
use crate::ingest::providers::FetcherSet;
use crate::ingest::rate_limit::{RateKey, RateLimiter, Throttled};
use crate::ingest::store::{ArticleStore, SourceRegistry};
use crate::ingest::types::{Source, SourceId, SourceKind};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed { kind: ErrorKind, reason: String },
    /// Denied by the rate limiter; nothing was fetched.
    Throttled { retry_after_ms: u64 },
    /// Deadline hit or caller went away; last-fetch left untouched.
    Cancelled,
}

impl OutcomeStatus {
    fn label(&self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::Failed { .. } => "failed",
            OutcomeStatus::Throttled { .. } => "throttled",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceOutcome {
    pub source_id: SourceId,
    pub source_name: String,
    pub kind: SourceKind,
    #[serde(flatten)]
    pub status: OutcomeStatus,
    /// Candidates returned by the fetcher.
    pub fetched: usize,
    pub added: usize,
    pub duplicates: usize,
    /// Candidates dropped by normalization (no title, unusable URL).
    pub rejected: usize,
}

impl SourceOutcome {
    fn new(source: &Source, status: OutcomeStatus) -> Self {
        Self {
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            kind: source.kind,
            status,
            fetched: 0,
            added: 0,
            duplicates: 0,
            rejected: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}

/// Aggregate result of one `run_all`. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Throttled or cancelled.
    pub skipped: usize,
    pub total_added: usize,
    pub total_duplicates: usize,
    pub duration_ms: u64,
    pub outcomes: Vec<SourceOutcome>,
}

impl FetchReport {
    pub fn from_outcomes(outcomes: Vec<SourceOutcome>, elapsed: Duration) -> Self {
        let mut r = FetchReport {
            attempted: outcomes.len(),
            duration_ms: elapsed.as_millis() as u64,
            ..Default::default()
        };
        for o in &outcomes {
            match o.status {
                OutcomeStatus::Succeeded => r.succeeded += 1,
                OutcomeStatus::Failed { .. } => r.failed += 1,
                OutcomeStatus::Throttled { .. } | OutcomeStatus::Cancelled => r.skipped += 1,
            }
            r.total_added += o.added;
            r.total_duplicates += o.duplicates;
        }
        r.outcomes = outcomes;
        r
    }

    pub fn outcome(&self, id: &SourceId) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| &o.source_id == id)
    }
}

pub struct Pipeline {
    registry: Arc<dyn SourceRegistry>,
    store: Arc<dyn ArticleStore>,
    fetchers: FetcherSet,
    limiter: RateLimiter,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(
        cfg: &IngestConfig,
        registry: Arc<dyn SourceRegistry>,
        store: Arc<dyn ArticleStore>,
    ) -> Self {
        let guard = Arc::new(SsrfGuard::new(cfg.guard.clone()));
        Self::with_guard(cfg, guard, registry, store)
    }

    /// Wire the standard fetchers around an existing guard.
    pub fn with_guard(
        cfg: &IngestConfig,
        guard: Arc<SsrfGuard>,
        registry: Arc<dyn SourceRegistry>,
        store: Arc<dyn ArticleStore>,
    ) -> Self {
        let limiter = RateLimiter::new(cfg.rate_policy());
        let http = cfg.http_client(guard);
        let fetchers = FetcherSet::new(
            Arc::new(SyndicationFetcher::new(
                http.clone(),
                limiter.clone(),
                cfg.max_entries,
            )),
            Arc::new(CommunityFetcher::new(
                http,
                limiter.clone(),
                cfg.community.clone(),
            )),
        );
        Self::from_parts(registry, store, fetchers, limiter, cfg.concurrency)
    }

    pub fn from_parts(
        registry: Arc<dyn SourceRegistry>,
        store: Arc<dyn ArticleStore>,
        fetchers: FetcherSet,
        limiter: RateLimiter,
        concurrency: usize,
    ) -> Self {
        Self {
            registry,
            store,
            fetchers,
            limiter,
            concurrency: concurrency.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<dyn SourceRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ArticleStore> {
        &self.store
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Fetch every active source. Always yields a report unless the
    /// registry itself cannot be read.
    pub async fn run_all(&self) -> Result<FetchReport, PipelineError> {
        ensure_metrics_described();
        let t0 = Instant::now();
        let sources = self
            .registry
            .list_active_sources()
            .await
            .map_err(|source| PipelineError::Registry { source })?;
        tracing::info!(target: "ingest", sources = sources.len(), "fetch run started");

        let outcomes: Vec<SourceOutcome> = stream::iter(sources)
            .map(|s| self.run_source(s))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let report = FetchReport::from_outcomes(outcomes, t0.elapsed());
        gauge!("ingest_pipeline_last_run_ts").set(Utc::now().timestamp() as f64);
        tracing::info!(
            target: "ingest",
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            added = report.total_added,
            duplicates = report.total_duplicates,
            duration_ms = report.duration_ms,
            "fetch run finished"
        );
        Ok(report)
    }

    /// Fetch one source now, still subject to rate limiting and the guard.
    /// Runs regardless of the source's active flag. When `deadline` elapses
    /// the attempt is dropped: its rate-limit admission is released and the
    /// registry is not touched.
    pub async fn run_one(
        &self,
        id: &SourceId,
        deadline: Option<Duration>,
    ) -> Result<SourceOutcome, PipelineError> {
        ensure_metrics_described();
        let source = self
            .registry
            .source(id)
            .await
            .map_err(|source| PipelineError::Registry { source })?
            .ok_or_else(|| PipelineError::SourceNotFound { id: id.clone() })?;

        let Some(limit) = deadline else {
            return Ok(self.run_source(source).await);
        };
        match tokio::time::timeout(limit, self.run_source(source.clone())).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                tracing::warn!(
                    target: "ingest",
                    source_id = %source.id,
                    deadline_ms = limit.as_millis() as u64,
                    "single-source fetch cancelled"
                );
                counter!("ingest_sources_total", "outcome" => "cancelled").increment(1);
                Ok(SourceOutcome::new(&source, OutcomeStatus::Cancelled))
            }
        }
    }

    async fn run_source(&self, source: Source) -> SourceOutcome {
        let t0 = Instant::now();
        let fetcher = self.fetchers.for_kind(source.kind);

        if let Err(e) = fetcher.check_target(&source.target) {
            let outcome = self.failed(&source, &e);
            self.record_fetch(&source, Some(e.to_string())).await;
            return self.finish(outcome, t0);
        }

        let permit = match self.limiter.allow(&RateKey::source(&source.id, source.kind)) {
            Ok(p) => p,
            Err(Throttled { retry_after }) => {
                counter!("ingest_rate_limited_total").increment(1);
                tracing::debug!(
                    target: "ingest",
                    source_id = %source.id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "source throttled"
                );
                let status = OutcomeStatus::Throttled {
                    retry_after_ms: retry_after.as_millis() as u64,
                };
                return self.finish(SourceOutcome::new(&source, status), t0);
            }
        };

        let candidates = match fetcher.fetch(&source).await {
            Ok(c) => c,
            Err(e) => {
                permit.commit();
                let outcome = self.failed(&source, &e);
                self.record_fetch(&source, Some(e.to_string())).await;
                return self.finish(outcome, t0);
            }
        };

        let mut outcome = SourceOutcome::new(&source, OutcomeStatus::Succeeded);
        outcome.fetched = candidates.len();
        let ctx = ArticleContext {
            owner: source.owner.clone(),
            source_id: Some(source.id.clone()),
            ..Default::default()
        };
        let now = Utc::now();

        for candidate in candidates {
            let article = match normalize(candidate, &ctx, now) {
                Ok(a) => a,
                Err(reason) => {
                    tracing::debug!(target: "ingest", source_id = %source.id, %reason, "entry rejected");
                    outcome.rejected += 1;
                    continue;
                }
            };
            match persist(self.store.as_ref(), article).await {
                Persisted::Inserted(_) => outcome.added += 1,
                Persisted::Duplicate => outcome.duplicates += 1,
                Persisted::Failed(e) => {
                    outcome.status = OutcomeStatus::Failed {
                        kind: ErrorKind::Persistence,
                        reason: e.to_string(),
                    };
                    break;
                }
            }
        }

        permit.commit();
        let error = match &outcome.status {
            OutcomeStatus::Failed { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        self.record_fetch(&source, error).await;
        self.finish(outcome, t0)
    }

    fn failed(&self, source: &Source, e: &FetchError) -> SourceOutcome {
        SourceOutcome::new(
            source,
            OutcomeStatus::Failed {
                kind: e.kind(),
                reason: e.to_string(),
            },
        )
    }

    async fn record_fetch(&self, source: &Source, error: Option<String>) {
        if let Err(e) = self
            .registry
            .update_last_fetched(&source.id, Utc::now(), error)
            .await
        {
            tracing::warn!(target: "ingest", source_id = %source.id, error = %e, "could not record last fetch");
        }
    }

    fn finish(&self, outcome: SourceOutcome, t0: Instant) -> SourceOutcome {
        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_fetch_ms").record(ms);
        counter!("ingest_sources_total", "outcome" => outcome.status.label()).increment(1);
        counter!("ingest_articles_added_total").increment(outcome.added as u64);
        counter!("ingest_articles_duplicate_total").increment(outcome.duplicates as u64);

        match &outcome.status {
            OutcomeStatus::Failed { kind, reason } => tracing::warn!(
                target: "ingest",
                source_id = %outcome.source_id,
                kind = %outcome.kind,
                error_kind = ?kind,
                reason = %reason,
                added = outcome.added,
                "source fetch failed"
            ),
            _ => tracing::info!(
                target: "ingest",
                source_id = %outcome.source_id,
                kind = %outcome.kind,
                status = outcome.status.label(),
                fetched = outcome.fetched,
                added = outcome.added,
                duplicates = outcome.duplicates,
                rejected = outcome.rejected,
                "source fetch done"
            ),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::providers::SourceFetcher;
    use crate::ingest::rate_limit::RatePolicy;
    use crate::ingest::store::{MemoryRegistry, MemoryStore};
    use crate::ingest::types::Candidate;
    use async_trait::async_trait;

    struct FixedFetcher {
        kind: SourceKind,
    }

    #[async_trait]
    impl SourceFetcher for FixedFetcher {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn check_target(&self, target: &str) -> Result<(), FetchError> {
            if target == "bad" {
                return Err(FetchError::InvalidTarget {
                    reason: "bad target".into(),
                });
            }
            Ok(())
        }

        async fn fetch(&self, source: &Source) -> Result<Vec<Candidate>, FetchError> {
            Ok(vec![
                Candidate {
                    title: Some("one".into()),
                    url: Some(format!("https://example.com/{}/1", source.id)),
                    ..Default::default()
                },
                Candidate {
                    title: Some("one again".into()),
                    url: Some(format!("https://example.com/{}/1#dup", source.id)),
                    ..Default::default()
                },
                Candidate {
                    title: None,
                    url: Some("https://example.com/untitled".into()),
                    ..Default::default()
                },
            ])
        }
    }

    fn source(id: &str, target: &str) -> Source {
        Source {
            id: id.into(),
            owner: "u1".into(),
            kind: SourceKind::Syndication,
            target: target.into(),
            name: id.into(),
            category: None,
            active: true,
            last_fetched_at: None,
            last_error: None,
        }
    }

    fn pipeline(reg: Arc<MemoryRegistry>, store: Arc<MemoryStore>) -> Pipeline {
        let fetchers = FetcherSet::new(
            Arc::new(FixedFetcher {
                kind: SourceKind::Syndication,
            }),
            Arc::new(FixedFetcher {
                kind: SourceKind::Community,
            }),
        );
        Pipeline::from_parts(reg, store, fetchers, RateLimiter::new(RatePolicy::default()), 4)
    }

    #[tokio::test]
    async fn counts_added_duplicates_and_rejected() {
        let reg = Arc::new(MemoryRegistry::with_sources([source("a", "https://x")]));
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(reg.clone(), store.clone());

        let report = p.run_all().await.unwrap();
        let o = report.outcome(&"a".into()).unwrap();
        assert!(o.is_success());
        assert_eq!((o.fetched, o.added, o.duplicates, o.rejected), (3, 1, 1, 1));
        assert_eq!(report.total_added, 1);
        assert_eq!(store.len(), 1);
        assert!(reg.get(&"a".into()).unwrap().last_fetched_at.is_some());
    }

    #[tokio::test]
    async fn invalid_target_is_a_validation_failure_with_marker() {
        let reg = Arc::new(MemoryRegistry::with_sources([source("a", "bad")]));
        let p = pipeline(reg.clone(), Arc::new(MemoryStore::new()));

        let o = p.run_one(&"a".into(), None).await.unwrap();
        assert!(matches!(
            o.status,
            OutcomeStatus::Failed {
                kind: ErrorKind::Validation,
                ..
            }
        ));
        let s = reg.get(&"a".into()).unwrap();
        assert!(s.last_fetched_at.is_some());
        assert_eq!(s.last_error.as_deref(), Some("invalid source target: bad target"));
    }

    #[tokio::test]
    async fn repeat_within_interval_is_throttled() {
        let reg = Arc::new(MemoryRegistry::with_sources([source("a", "https://x")]));
        let p = pipeline(reg, Arc::new(MemoryStore::new()));

        assert!(p.run_one(&"a".into(), None).await.unwrap().is_success());
        let again = p.run_one(&"a".into(), None).await.unwrap();
        assert!(matches!(again.status, OutcomeStatus::Throttled { .. }));

        let report = p.run_all().await.unwrap();
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn unknown_source_is_reported() {
        let p = pipeline(Arc::new(MemoryRegistry::new()), Arc::new(MemoryStore::new()));
        let err = p.run_one(&"nope".into(), None).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceNotFound { .. }));
    }

    #[test]
    fn outcome_serializes_flat_status() {
        let o = SourceOutcome::new(
            &source("a", "https://x"),
            OutcomeStatus::Throttled {
                retry_after_ms: 1500,
            },
        );
        let v = serde_json::to_value(&o).unwrap();
        assert_eq!(v["status"], "throttled");
        assert_eq!(v["retry_after_ms"], 1500);
        assert_eq!(v["source_id"], "a");
    }
}
