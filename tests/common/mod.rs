// tests/common/mod.rs
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use argos_ingest::ingest::guard::{GuardPolicy, Resolver};
use argos_ingest::ingest::types::{Source, SourceKind};
use async_trait::async_trait;
use axum::Router;

/// Serve `router` on an ephemeral loopback port.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Default policy minus loopback, so tests can reach their own servers.
/// 10.0.0.0/8 stays blocked and stands in for "internal".
pub fn loopback_policy() -> GuardPolicy {
    let mut p = GuardPolicy::default();
    p.blocked_ranges
        .retain(|net| !net.contains(&IpAddr::from([127, 0, 0, 1])));
    p
}

/// Resolver whose answers are scripted per host. Each lookup consumes the
/// next answer; the last one repeats.
#[derive(Default)]
pub struct ScriptedResolver {
    answers: Mutex<HashMap<String, Vec<Vec<IpAddr>>>>,
    calls: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(self: &Arc<Self>, host: &str, answers: &[&[&str]]) -> Arc<Self> {
        let parsed = answers
            .iter()
            .map(|a| a.iter().map(|ip| ip.parse().unwrap()).collect())
            .collect();
        self.answers.lock().unwrap().insert(host.to_string(), parsed);
        Arc::clone(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().unwrap();
        let Some(list) = answers.get_mut(host) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown host"));
        };
        if list.len() > 1 {
            Ok(list.remove(0))
        } else {
            Ok(list.first().cloned().unwrap_or_default())
        }
    }
}

pub fn source(id: &str, kind: SourceKind, target: &str) -> Source {
    Source {
        id: id.into(),
        owner: "owner-1".into(),
        kind,
        target: target.into(),
        name: format!("source {id}"),
        category: Some("Tech".into()),
        active: true,
        last_fetched_at: None,
        last_error: None,
    }
}

pub fn rss(items: impl IntoIterator<Item = (String, String)>) -> String {
    let mut xml = String::from(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>t</title>"#);
    for (title, link) in items {
        xml.push_str(&format!(
            "<item><title>{title}</title><link>{link}</link><description>about {title}</description></item>"
        ));
    }
    xml.push_str("</channel></rss>");
    xml
}
