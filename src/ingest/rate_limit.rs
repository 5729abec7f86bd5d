// src/ingest/rate_limit.rs
//! Per-source fetch throttling and per-kind request spacing.
//!
//! `allow` checks and stamps in one critical section, so two concurrent
//! callers for the same key can never both get through. The returned
//! [`Permit`] holds the stamp; dropping it without `commit` puts the previous
//! stamp back, which is how an attempt that was cancelled or never reached
//! the network gives its slot back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use crate::ingest::types::{OwnerId, SourceId, SourceKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    /// Minimum interval between fetches of one source.
    Source { id: SourceId, kind: SourceKind },
    /// Spacing between individual outbound requests of a kind.
    Requests(SourceKind),
    /// Manual captures of one owner.
    Capture(OwnerId),
}

impl RateKey {
    pub fn source(id: &SourceId, kind: SourceKind) -> Self {
        RateKey::Source {
            id: id.clone(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KindLimits {
    pub min_fetch_interval_secs: u64,
    pub request_spacing_ms: u64,
}

impl Default for KindLimits {
    fn default() -> Self {
        Self {
            min_fetch_interval_secs: 300,
            request_spacing_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub syndication: KindLimits,
    pub community: KindLimits,
    /// Minimum spacing between two captures of the same owner.
    pub capture_interval_ms: u64,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            syndication: KindLimits::default(),
            community: KindLimits {
                min_fetch_interval_secs: 600,
                request_spacing_ms: 1000,
            },
            capture_interval_ms: 3000,
        }
    }
}

impl RatePolicy {
    pub fn interval_for(&self, key: &RateKey) -> Duration {
        match key {
            RateKey::Source { kind, .. } => {
                Duration::from_secs(self.limits(*kind).min_fetch_interval_secs)
            }
            RateKey::Requests(kind) => Duration::from_millis(self.limits(*kind).request_spacing_ms),
            RateKey::Capture(_) => Duration::from_millis(self.capture_interval_ms),
        }
    }

    fn limits(&self, kind: SourceKind) -> KindLimits {
        match kind {
            SourceKind::Syndication => self.syndication,
            SourceKind::Community => self.community,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
    pub retry_after: Duration,
}

type Stamps = Arc<Mutex<HashMap<RateKey, Instant>>>;

#[derive(Clone, Default)]
pub struct RateLimiter {
    policy: RatePolicy,
    stamps: Stamps,
}

impl RateLimiter {
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            stamps: Arc::default(),
        }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Admit `key` now or report how long until it would be admitted.
    pub fn allow(&self, key: &RateKey) -> Result<Permit, Throttled> {
        let interval = self.policy.interval_for(key);
        let now = Instant::now();
        let mut stamps = self.stamps.lock().unwrap_or_else(|p| p.into_inner());
        let previous = stamps.get(key).copied();
        if let Some(last) = previous {
            let ready_at = last + interval;
            if !interval.is_zero() && ready_at > now {
                return Err(Throttled {
                    retry_after: ready_at - now,
                });
            }
        }
        stamps.insert(key.clone(), now);
        Ok(Permit {
            stamps: Arc::clone(&self.stamps),
            key: key.clone(),
            stamp: now,
            previous,
            committed: false,
        })
    }

    /// Wait until `key` is admitted, then consume the slot.
    pub async fn pace(&self, key: &RateKey) {
        loop {
            match self.allow(key) {
                Ok(permit) => {
                    permit.commit();
                    return;
                }
                Err(Throttled { retry_after }) => {
                    tracing::trace!(target: "ingest", ?key, ?retry_after, "pacing request");
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }
}

/// A reserved slot for one key. See the module docs for rollback rules.
#[must_use = "dropping a permit without commit releases the slot"]
pub struct Permit {
    stamps: Stamps,
    key: RateKey,
    stamp: Instant,
    previous: Option<Instant>,
    committed: bool,
}

impl Permit {
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut stamps = self.stamps.lock().unwrap_or_else(|p| p.into_inner());
        // Only undo our own stamp; a later permit may have replaced it.
        if stamps.get(&self.key) == Some(&self.stamp) {
            match self.previous {
                Some(prev) => {
                    stamps.insert(self.key.clone(), prev);
                }
                None => {
                    stamps.remove(&self.key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RateKey {
        RateKey::source(&SourceId::from("s1"), SourceKind::Syndication)
    }

    #[tokio::test(start_paused = true)]
    async fn second_attempt_within_interval_is_throttled() {
        let rl = RateLimiter::new(RatePolicy::default());
        rl.allow(&key()).unwrap().commit();

        tokio::time::advance(Duration::from_secs(100)).await;
        let t = rl.allow(&key()).err().unwrap();
        assert_eq!(t.retry_after, Duration::from_secs(200));

        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(rl.allow(&key()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn uncommitted_permit_releases_its_slot() {
        let rl = RateLimiter::new(RatePolicy::default());
        {
            let _p = rl.allow(&key()).unwrap();
            assert!(rl.allow(&key()).is_err());
        }
        rl.allow(&key()).unwrap().commit();
        assert!(rl.allow(&key()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_restores_the_previous_stamp() {
        let rl = RateLimiter::new(RatePolicy::default());
        rl.allow(&key()).unwrap().commit();
        tokio::time::advance(Duration::from_secs(300)).await;
        drop(rl.allow(&key()).unwrap());
        // Back to the first stamp, which is exactly one interval old.
        assert!(rl.allow(&key()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn pace_spaces_requests() {
        let rl = RateLimiter::new(RatePolicy::default());
        let k = RateKey::Requests(SourceKind::Community);
        let start = Instant::now();
        rl.pace(&k).await;
        rl.pace(&k).await;
        rl.pace(&k).await;
        assert!(start.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn capture_slots_are_per_owner() {
        let rl = RateLimiter::new(RatePolicy::default());
        let a = RateKey::Capture("a".into());
        rl.allow(&a).unwrap().commit();
        let t = rl.allow(&a).err().unwrap();
        assert_eq!(t.retry_after, Duration::from_millis(3000));
        rl.allow(&RateKey::Capture("b".into())).unwrap().commit();
    }

    #[tokio::test]
    async fn zero_interval_never_throttles() {
        let rl = RateLimiter::new(RatePolicy::default());
        let k = RateKey::Requests(SourceKind::Syndication);
        rl.allow(&k).unwrap().commit();
        rl.allow(&k).unwrap().commit();
    }
}
