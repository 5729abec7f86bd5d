// src/ingest/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};

use crate::ingest::error::ErrorKind;
use crate::ingest::guard::{GuardPolicy, SsrfGuard};
use crate::ingest::http::{GuardedHttp, DEFAULT_USER_AGENT};
use crate::ingest::rate_limit::{KindLimits, RatePolicy};
use crate::ingest::types::Source;

const ENV_PATH: &str = "INGEST_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/ingest.toml";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("reading {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("parsing {}: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("invalid ingest config: {reason}"))]
    Invalid { reason: String },
    #[snafu(display("{ENV_PATH} points to non-existent path {}", path.display()))]
    MissingEnvPath { path: PathBuf },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Settings of the community fetcher, `[community]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommunityConfig {
    pub min_fetch_interval_secs: u64,
    pub request_spacing_ms: u64,
    pub base_url: String,
    pub max_posts: usize,
    pub max_comments: usize,
    pub user_agent: String,
    /// Bound on one whole community fetch: listing plus comment pages.
    pub max_fetch_secs: u64,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            min_fetch_interval_secs: 600,
            request_spacing_ms: 1000,
            base_url: "https://www.reddit.com".into(),
            max_posts: 25,
            max_comments: 5,
            user_agent: DEFAULT_USER_AGENT.into(),
            max_fetch_secs: 120,
        }
    }
}

impl CommunityConfig {
    pub fn max_fetch_time(&self) -> Duration {
        Duration::from_secs(self.max_fetch_secs)
    }

    pub fn limits(&self) -> KindLimits {
        KindLimits {
            min_fetch_interval_secs: self.min_fetch_interval_secs,
            request_spacing_ms: self.request_spacing_ms,
        }
    }
}

/// Startup configuration of the ingest pipeline. Read once, never reloaded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Sources fetched in parallel within one run.
    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    /// Entries kept per syndication fetch.
    pub max_entries: usize,
    pub max_body_bytes: usize,
    pub max_redirects: usize,
    pub schedule_interval_secs: u64,
    /// Minimum spacing between manual captures of one owner.
    pub capture_min_interval_ms: u64,
    pub guard: GuardPolicy,
    pub syndication: KindLimits,
    pub community: CommunityConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            fetch_timeout_secs: 30,
            max_entries: 100,
            max_body_bytes: 5 * 1024 * 1024,
            max_redirects: 5,
            schedule_interval_secs: 3600,
            capture_min_interval_ms: 3000,
            guard: GuardPolicy::default(),
            syndication: KindLimits {
                min_fetch_interval_secs: 300,
                request_spacing_ms: 0,
            },
            community: CommunityConfig::default(),
        }
    }
}

impl IngestConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    /// Guarded HTTP client with this config's timeout and size limits.
    pub fn http_client(&self, guard: Arc<SsrfGuard>) -> GuardedHttp {
        GuardedHttp::new(
            guard,
            self.fetch_timeout(),
            self.max_redirects,
            self.max_body_bytes,
        )
    }

    pub fn rate_policy(&self) -> RatePolicy {
        RatePolicy {
            syndication: self.syndication,
            community: self.community.limits(),
            capture_interval_ms: self.capture_min_interval_ms,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.concurrency > 0,
            InvalidSnafu {
                reason: "concurrency must be at least 1"
            }
        );
        ensure!(
            self.fetch_timeout_secs > 0,
            InvalidSnafu {
                reason: "fetch_timeout_secs must be at least 1"
            }
        );
        ensure!(
            self.community.max_fetch_secs > 0,
            InvalidSnafu {
                reason: "community.max_fetch_secs must be at least 1"
            }
        );
        ensure!(
            self.schedule_interval_secs > 0,
            InvalidSnafu {
                reason: "schedule_interval_secs must be at least 1"
            }
        );
        ensure!(
            !self.guard.allowed_schemes.is_empty(),
            InvalidSnafu {
                reason: "guard.allowed_schemes is empty"
            }
        );
        Ok(())
    }
}

/// Parse and validate an ingest config from a TOML string.
pub fn parse_config(s: &str, origin: &Path) -> Result<IngestConfig, ConfigError> {
    let cfg: IngestConfig = toml::from_str(s).context(ParseSnafu { path: origin })?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config_from(path: &Path) -> Result<IngestConfig, ConfigError> {
    let content = fs::read_to_string(path).context(ReadSnafu { path })?;
    parse_config(&content, path)
}

/// Load config using env var + fallbacks:
/// 1) $INGEST_CONFIG_PATH
/// 2) config/ingest.toml
/// 3) built-in defaults
pub fn load_config_default() -> Result<IngestConfig, ConfigError> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        ensure!(pb.exists(), MissingEnvPathSnafu { path: pb });
        return load_config_from(&pb);
    }
    let p = PathBuf::from(DEFAULT_PATH);
    if p.exists() {
        return load_config_from(&p);
    }
    Ok(IngestConfig::default())
}

/// Seed list for the in-memory registry: `[[sources]]` entries.
pub fn load_sources_from(path: &Path) -> Result<Vec<Source>, ConfigError> {
    #[derive(Deserialize)]
    struct SourcesFile {
        #[serde(default)]
        sources: Vec<Source>,
    }
    let content = fs::read_to_string(path).context(ReadSnafu { path })?;
    let file: SourcesFile = toml::from_str(&content).context(ParseSnafu { path })?;
    Ok(file.sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn partial_tables_keep_per_kind_defaults() {
        let cfg = parse_config(
            r#"
concurrency = 4

[community]
max_posts = 10
"#,
            Path::new("inline"),
        )
        .unwrap();
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.max_entries, 100);
        assert_eq!(cfg.community.max_posts, 10);
        assert_eq!(cfg.community.request_spacing_ms, 1000);
        assert_eq!(cfg.rate_policy().syndication.min_fetch_interval_secs, 300);
        assert!(cfg.guard.blocked_ports.contains(&6379));
    }

    #[test]
    fn bad_cidr_and_zero_concurrency_are_rejected() {
        let err = parse_config(
            r#"
[guard]
blocked_ranges = ["10.0.0.0/33"]
"#,
            Path::new("inline"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");

        let err = parse_config("concurrency = 0", Path::new("inline")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_PATH);

        let cfg = load_config_default().unwrap();
        assert_eq!(cfg.concurrency, 8);

        let p = tmp.path().join("custom.toml");
        fs::write(&p, "max_entries = 7").unwrap();
        env::set_var(ENV_PATH, p.display().to_string());
        assert_eq!(load_config_default().unwrap().max_entries, 7);

        env::set_var(ENV_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(matches!(
            load_config_default(),
            Err(ConfigError::MissingEnvPath { .. })
        ));
        env::remove_var(ENV_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
