// src/ingest/guard.rs
//! SSRF guard: every outbound fetch target is parsed, checked against the
//! blocked host/port/address policy, resolved once, and pinned to the
//! validated address set.
//!
//! An attempt moves through: parse -> scheme -> host -> port -> resolve ->
//! address check -> pinned. Any step may end it with a [`GuardRejection`].
//! The resulting [`PinnedTarget`] is the only thing the HTTP layer will
//! connect to; it never re-resolves the host name.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use metrics::counter;
use serde::Deserialize;
use snafu::Snafu;
use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum GuardRejection {
    #[snafu(display("invalid URL: {reason}"))]
    InvalidUrl { reason: String },
    #[snafu(display("scheme '{scheme}' is not allowed"))]
    SchemeNotAllowed { scheme: String },
    #[snafu(display("URL has no host"))]
    MissingHost,
    #[snafu(display("host '{host}' is blocked"))]
    BlockedHost { host: String },
    #[snafu(display("port {port} is blocked"))]
    BlockedPort { port: u16 },
    #[snafu(display("'{host}' resolves to blocked address {addr}"))]
    BlockedAddress { host: String, addr: IpAddr },
    #[snafu(display("could not resolve '{host}': {reason}"))]
    Unresolvable { host: String, reason: String },
}

impl GuardRejection {
    /// True when the target itself is malformed rather than pointing
    /// somewhere forbidden.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            GuardRejection::InvalidUrl { .. }
                | GuardRejection::SchemeNotAllowed { .. }
                | GuardRejection::MissingHost
        )
    }
}

/// Host name resolution used by the guard. Swappable so tests can simulate
/// DNS answers that change between lookups.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// What the guard refuses. Loaded from the `[guard]` config table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardPolicy {
    pub allowed_schemes: Vec<String>,
    pub blocked_ranges: Vec<IpNet>,
    pub blocked_hosts: Vec<String>,
    /// Substrings that block any host containing them (cloud metadata).
    pub blocked_host_patterns: Vec<String>,
    pub blocked_ports: Vec<u16>,
}

const DEFAULT_BLOCKED_RANGES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "0.0.0.0/8",
    "100.64.0.0/10",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "::1/128",
    "64:ff9b:1::/48",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["http".into(), "https".into()],
            blocked_ranges: DEFAULT_BLOCKED_RANGES
                .iter()
                .filter_map(|r| r.parse().ok())
                .collect(),
            blocked_hosts: [
                "localhost",
                "localhost.localdomain",
                "metadata.google.internal",
                "metadata",
                "instance-data",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            blocked_host_patterns: ["169.254.169.254", "metadata.google", "metadata.azure"]
                .into_iter()
                .map(String::from)
                .collect(),
            blocked_ports: vec![22, 23, 25, 445, 3306, 5432, 6379, 27017, 8006],
        }
    }
}

impl GuardPolicy {
    pub fn is_blocked_ip(&self, ip: IpAddr) -> bool {
        // ::ffff:a.b.c.d must be judged as a.b.c.d
        let ip = ip.to_canonical();
        let hit = |ip: IpAddr| self.blocked_ranges.iter().any(|net| net.contains(&ip));
        hit(ip) || nat64_embedded(ip).is_some_and(hit)
    }

    fn is_blocked_host(&self, host: &str) -> bool {
        self.blocked_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
            || self
                .blocked_host_patterns
                .iter()
                .any(|p| host.contains(&p.to_ascii_lowercase()))
    }

    fn allows_scheme(&self, scheme: &str) -> bool {
        self.allowed_schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(scheme))
    }
}

/// IPv4 address carried by a well-known-prefix NAT64 address
/// (`64:ff9b::/96`); a NAT64 gateway forwards to it.
fn nat64_embedded(ip: IpAddr) -> Option<IpAddr> {
    let IpAddr::V6(v6) = ip else {
        return None;
    };
    let o = v6.octets();
    (o[..12] == [0x00, 0x64, 0xff, 0x9b, 0, 0, 0, 0, 0, 0, 0, 0])
        .then(|| IpAddr::V4(Ipv4Addr::new(o[12], o[13], o[14], o[15])))
}

/// A validated fetch target together with the addresses that were proven
/// safe. Connections for this target must go to one of `addrs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedTarget {
    url: Url,
    host: String,
    addrs: Vec<SocketAddr>,
}

impl PinnedTarget {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Host name to override in the HTTP client's resolver; `None` when the
    /// URL already names a literal address.
    pub fn domain(&self) -> Option<&str> {
        self.url.domain()
    }
}

pub struct SsrfGuard {
    policy: GuardPolicy,
    resolver: Arc<dyn Resolver>,
}

impl SsrfGuard {
    pub fn new(policy: GuardPolicy) -> Self {
        Self::with_resolver(policy, Arc::new(SystemResolver))
    }

    pub fn with_resolver(policy: GuardPolicy, resolver: Arc<dyn Resolver>) -> Self {
        Self { policy, resolver }
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    /// Validate `raw` and pin its resolved addresses. Rejections are logged
    /// and counted here so every caller gets the same treatment.
    pub async fn validate(&self, raw: &str) -> Result<PinnedTarget, GuardRejection> {
        let res = self.check(raw).await;
        if let Err(rejection) = &res {
            tracing::warn!(target: "ssrf", url = raw, reason = %rejection, "fetch target rejected");
            counter!("ingest_ssrf_rejected_total").increment(1);
        }
        res
    }

    async fn check(&self, raw: &str) -> Result<PinnedTarget, GuardRejection> {
        let url = Url::parse(raw.trim()).map_err(|e| GuardRejection::InvalidUrl {
            reason: e.to_string(),
        })?;

        if !self.policy.allows_scheme(url.scheme()) {
            return Err(GuardRejection::SchemeNotAllowed {
                scheme: url.scheme().to_string(),
            });
        }

        let host = url.host().ok_or(GuardRejection::MissingHost)?.to_owned();

        if let Some(port) = url.port() {
            if self.policy.blocked_ports.contains(&port) {
                return Err(GuardRejection::BlockedPort { port });
            }
        }
        let port = url
            .port_or_known_default()
            .ok_or(GuardRejection::MissingHost)?;

        let (host_str, ips) = match host {
            Host::Ipv4(v4) => (v4.to_string(), vec![IpAddr::V4(v4)]),
            Host::Ipv6(v6) => (v6.to_string(), vec![IpAddr::V6(v6)]),
            Host::Domain(name) => {
                let name = name.trim_end_matches('.').to_ascii_lowercase();
                if name.is_empty() {
                    return Err(GuardRejection::MissingHost);
                }
                if self.policy.is_blocked_host(&name) {
                    return Err(GuardRejection::BlockedHost { host: name });
                }
                let ips = self.resolver.resolve(&name).await.map_err(|e| {
                    GuardRejection::Unresolvable {
                        host: name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                (name, ips)
            }
        };

        if ips.is_empty() {
            return Err(GuardRejection::Unresolvable {
                host: host_str,
                reason: "no addresses".into(),
            });
        }

        // Every answer must be safe, not just the first one.
        let mut addrs: Vec<SocketAddr> = Vec::with_capacity(ips.len());
        for ip in ips {
            if self.policy.is_blocked_ip(ip) {
                return Err(GuardRejection::BlockedAddress {
                    host: host_str,
                    addr: ip,
                });
            }
            let sa = SocketAddr::new(ip, port);
            if !addrs.contains(&sa) {
                addrs.push(sa);
            }
        }

        Ok(PinnedTarget {
            url,
            host: host_str,
            addrs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubResolver {
        answers: Mutex<HashMap<String, Vec<IpAddr>>>,
    }

    impl StubResolver {
        fn with(entries: &[(&str, &[&str])]) -> Arc<Self> {
            let answers = entries
                .iter()
                .map(|(h, ips)| {
                    (
                        h.to_string(),
                        ips.iter().map(|ip| ip.parse().unwrap()).collect(),
                    )
                })
                .collect();
            Arc::new(Self {
                answers: Mutex::new(answers),
            })
        }
    }

    #[async_trait]
    impl Resolver for StubResolver {
        async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
            self.answers
                .lock()
                .unwrap()
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn guard(entries: &[(&str, &[&str])]) -> SsrfGuard {
        SsrfGuard::with_resolver(GuardPolicy::default(), StubResolver::with(entries))
    }

    #[tokio::test]
    async fn public_host_is_pinned_to_resolved_addresses() {
        let g = guard(&[("news.example.com", &["93.184.216.34", "2606:2800:220:1::"])]);
        let t = g
            .validate("https://news.example.com/feed.xml")
            .await
            .unwrap();
        assert_eq!(t.host(), "news.example.com");
        assert_eq!(t.domain(), Some("news.example.com"));
        assert_eq!(
            t.addrs(),
            &[
                "93.184.216.34:443".parse::<SocketAddr>().unwrap(),
                "[2606:2800:220:1::]:443".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn any_private_answer_rejects_the_host() {
        let g = guard(&[("mixed.example.com", &["93.184.216.34", "10.1.2.3"])]);
        let err = g.validate("http://mixed.example.com/").await.unwrap_err();
        assert!(matches!(err, GuardRejection::BlockedAddress { .. }));
    }

    #[tokio::test]
    async fn loopback_link_local_and_metadata_are_rejected() {
        let g = guard(&[
            ("loop.example.com", &["127.0.0.1"]),
            ("ll.example.com", &["fe80::1"]),
        ]);
        for url in [
            "http://loop.example.com/",
            "http://ll.example.com/",
            "http://169.254.169.254/latest/meta-data/",
            "http://[::1]:8080/",
            "http://[::ffff:127.0.0.1]/",
            "http://192.168.1.10/",
            "http://2130706433/",
        ] {
            assert!(g.validate(url).await.is_err(), "{url} should be rejected");
        }
    }

    #[tokio::test]
    async fn schemes_hosts_and_ports_are_checked_before_resolution() {
        let g = guard(&[("example.com", &["93.184.216.34"])]);
        assert!(matches!(
            g.validate("file:///etc/passwd").await,
            Err(GuardRejection::SchemeNotAllowed { .. })
        ));
        assert!(matches!(
            g.validate("gopher://example.com/").await,
            Err(GuardRejection::SchemeNotAllowed { .. })
        ));
        assert!(matches!(
            g.validate("http://LOCALHOST./").await,
            Err(GuardRejection::BlockedHost { .. })
        ));
        assert!(matches!(
            g.validate("http://metadata.google.internal/computeMetadata/v1/").await,
            Err(GuardRejection::BlockedHost { .. })
        ));
        assert!(matches!(
            g.validate("http://example.com:6379/").await,
            Err(GuardRejection::BlockedPort { port: 6379 })
        ));
        assert!(matches!(
            g.validate("not a url").await,
            Err(GuardRejection::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn unresolvable_hosts_are_rejected() {
        let g = guard(&[]);
        let err = g.validate("https://nowhere.invalid/").await.unwrap_err();
        assert!(matches!(err, GuardRejection::Unresolvable { .. }));
        assert!(!err.is_malformed());
    }

    #[test]
    fn default_policy_covers_common_private_ranges() {
        let p = GuardPolicy::default();
        for ip in ["10.0.0.1", "172.31.255.255", "100.64.0.1", "0.0.0.0", "fd00::1"] {
            assert!(p.is_blocked_ip(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["8.8.8.8", "172.32.0.1", "2001:4860:4860::8888"] {
            assert!(!p.is_blocked_ip(ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn translated_ipv6_forms_are_judged_by_their_ipv4() {
        let p = GuardPolicy::default();
        for ip in ["::ffff:127.0.0.1", "64:ff9b::a00:1", "64:ff9b::a9fe:a9fe", "64:ff9b:1::1"] {
            assert!(p.is_blocked_ip(ip.parse().unwrap()), "{ip}");
        }
        // Public IPv4 reached through the well-known NAT64 prefix.
        assert!(!p.is_blocked_ip("64:ff9b::808:808".parse().unwrap()));
    }

    #[tokio::test]
    async fn nat64_name_to_private_ipv4_is_rejected() {
        let g = guard(&[("nat64.example", &["64:ff9b::a00:1"])]);
        assert!(matches!(
            g.validate("https://nat64.example/feed").await,
            Err(GuardRejection::BlockedAddress { .. })
        ));
    }
}
