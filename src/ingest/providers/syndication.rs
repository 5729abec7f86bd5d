// src/ingest/providers/syndication.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::de::from_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;
use url::Url;

use crate::ingest::error::{FetchError, ParseSnafu};
use crate::ingest::http::GuardedHttp;
use crate::ingest::providers::SourceFetcher;
use crate::ingest::rate_limit::{RateKey, RateLimiter};
use crate::ingest::types::{Candidate, Source, SourceKind};
use crate::ingest::{normalize_text, scrub_html_entities_for_xml};

const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.9, */*;q=0.5";

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<TextNode>,
    description: Option<String>,
    #[serde(rename = "encoded", alias = "content:encoded")]
    encoded: Option<String>,
    #[serde(rename = "creator", alias = "dc:creator")]
    creator: Option<String>,
    author: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<TextNode>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    author: Option<AtomPerson>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<TextNode>,
    content: Option<TextNode>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomPerson {
    name: Option<String>,
}

/// Element whose attributes (`type="html"`, `isPermaLink`) are ignored.
#[derive(Debug, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    text: String,
}

/// A raw entry common to both formats, before cleaning.
struct RawEntry {
    title: Option<String>,
    link: Option<String>,
    author: Option<String>,
    published: Option<String>,
    body: Option<String>,
}

impl From<Item> for RawEntry {
    fn from(it: Item) -> Self {
        let link = it.link.filter(|l| !l.trim().is_empty()).or_else(|| {
            it.guid
                .map(|g| g.text)
                .filter(|g| g.starts_with("http://") || g.starts_with("https://"))
        });
        RawEntry {
            title: it.title,
            link,
            author: it.creator.or(it.author),
            published: it.pub_date,
            body: non_empty(it.encoded).or_else(|| non_empty(it.description)),
        }
    }
}

impl From<AtomEntry> for RawEntry {
    fn from(e: AtomEntry) -> Self {
        let link = e
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .or_else(|| e.links.first())
            .and_then(|l| l.href.clone());
        RawEntry {
            title: e.title.map(|t| t.text),
            link,
            author: e.author.and_then(|a| a.name),
            published: e.published.or(e.updated),
            body: non_empty(e.content.map(|c| c.text))
                .or_else(|| non_empty(e.summary.map(|s| s.text))),
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

/// Local name of the document's root element.
fn root_element(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

fn parse_entries(xml: &str) -> Result<Vec<RawEntry>, FetchError> {
    let rss_err = match from_str::<Rss>(xml) {
        Ok(rss) => return Ok(rss.channel.items.into_iter().map(RawEntry::from).collect()),
        Err(e) => e.to_string(),
    };
    let atom_err = match root_element(xml).as_deref() {
        Some("feed") => match from_str::<AtomFeed>(xml) {
            Ok(feed) => return Ok(feed.entries.into_iter().map(RawEntry::from).collect()),
            Err(e) => e.to_string(),
        },
        Some(other) => format!("root element is <{other}>, not <feed>"),
        None => "no root element".to_string(),
    };
    ParseSnafu {
        what: "feed",
        reason: format!("rss: {rss_err}; atom: {atom_err}"),
    }
    .fail()
}

/// Parse a feed published time (RFC 2822 for RSS, RFC 3339 for Atom).
pub fn parse_feed_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    let parsed = OffsetDateTime::parse(s, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(s, &Rfc3339))
        .ok()
        .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), dt.nanosecond()));
    parsed.or_else(|| {
        // Legacy zone names ("EST", "PDT") the strict parser refuses.
        DateTime::parse_from_rfc2822(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Parse RSS 2.0 or Atom into at most `max_entries` candidates, in feed order.
pub fn parse_feed(xml: &str, max_entries: usize) -> Result<Vec<Candidate>, FetchError> {
    let t0 = std::time::Instant::now();
    let cleaned = scrub_html_entities_for_xml(xml);
    let entries = parse_entries(&cleaned)?;
    let total = entries.len();

    let out: Vec<Candidate> = entries
        .into_iter()
        .take(max_entries)
        .map(|e| Candidate {
            title: e.title.map(|t| normalize_text(&t)),
            url: e.link.map(|l| l.trim().to_string()),
            author: e.author.map(|a| normalize_text(&a)),
            published_at: e.published.as_deref().and_then(parse_feed_date),
            content: e.body.map(|b| normalize_text(&b)),
            ..Default::default()
        })
        .collect();

    tracing::debug!(
        target: "ingest",
        entries = total,
        kept = out.len(),
        parse_ms = t0.elapsed().as_secs_f64() * 1_000.0,
        "feed parsed"
    );
    Ok(out)
}

pub struct SyndicationFetcher {
    http: GuardedHttp,
    limiter: RateLimiter,
    max_entries: usize,
}

impl SyndicationFetcher {
    pub fn new(http: GuardedHttp, limiter: RateLimiter, max_entries: usize) -> Self {
        Self {
            http,
            limiter,
            max_entries,
        }
    }
}

#[async_trait]
impl SourceFetcher for SyndicationFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Syndication
    }

    fn check_target(&self, target: &str) -> Result<(), FetchError> {
        let allowed = &self.http.guard().policy().allowed_schemes;
        match Url::parse(target.trim()) {
            Ok(u) if !allowed.iter().any(|s| s.eq_ignore_ascii_case(u.scheme())) => {
                Err(FetchError::InvalidTarget {
                    reason: format!("feed URL '{target}' uses scheme '{}'", u.scheme()),
                })
            }
            Ok(u) if u.host_str().is_some() => Ok(()),
            Ok(_) => Err(FetchError::InvalidTarget {
                reason: format!("feed URL '{target}' has no host"),
            }),
            Err(e) => Err(FetchError::InvalidTarget {
                reason: format!("feed URL '{target}': {e}"),
            }),
        }
    }

    async fn fetch(&self, source: &Source) -> Result<Vec<Candidate>, FetchError> {
        self.limiter
            .pace(&RateKey::Requests(SourceKind::Syndication))
            .await;
        let page = self.http.get(source.target.trim(), FEED_ACCEPT).await?;
        let mut candidates = parse_feed(&page.body, self.max_entries)?;
        if let Some(cat) = source.category.as_deref() {
            for c in &mut candidates {
                c.tags.push(cat.to_lowercase());
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Example</title>
    <item>
      <title>First &amp; foremost</title>
      <link>https://example.com/a</link>
      <description>&lt;p&gt;Short&nbsp;summary&lt;/p&gt;</description>
      <content:encoded><![CDATA[<p>Full <b>body</b> text</p>]]></content:encoded>
      <dc:creator>Jane Doe</dc:creator>
      <pubDate>Tue, 10 Jun 2025 14:30:00 +0000</pubDate>
    </item>
    <item>
      <title>Second</title>
      <guid isPermaLink="true">https://example.com/b</guid>
      <description>Only a summary</description>
    </item>
    <item>
      <link>https://example.com/untitled</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom example</title>
  <entry>
    <title type="html">Atom &lt;em&gt;entry&lt;/em&gt;</title>
    <link rel="self" href="https://example.org/self"/>
    <link rel="alternate" href="https://example.org/post"/>
    <author><name>Sam</name></author>
    <updated>2025-06-11T08:00:00Z</updated>
    <summary>Summary text</summary>
  </entry>
</feed>"#;

    #[test]
    fn rss_prefers_full_content_and_reads_creator() {
        let out = parse_feed(RSS, 100).unwrap();
        assert_eq!(out.len(), 3);
        let a = &out[0];
        assert_eq!(a.title.as_deref(), Some("First & foremost"));
        assert_eq!(a.url.as_deref(), Some("https://example.com/a"));
        assert_eq!(a.content.as_deref(), Some("Full body text"));
        assert_eq!(a.author.as_deref(), Some("Jane Doe"));
        assert_eq!(
            a.published_at,
            Some(Utc.with_ymd_and_hms(2025, 6, 10, 14, 30, 0).unwrap())
        );
        assert_eq!(out[1].url.as_deref(), Some("https://example.com/b"));
        assert_eq!(out[1].content.as_deref(), Some("Only a summary"));
        assert!(out[2].title.is_none());
    }

    #[test]
    fn atom_uses_alternate_link_and_updated_time() {
        let out = parse_feed(ATOM, 100).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title.as_deref(), Some("Atom entry"));
        assert_eq!(out[0].url.as_deref(), Some("https://example.org/post"));
        assert_eq!(out[0].author.as_deref(), Some("Sam"));
        assert_eq!(out[0].content.as_deref(), Some("Summary text"));
        assert_eq!(
            out[0].published_at,
            Some(Utc.with_ymd_and_hms(2025, 6, 11, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn entry_cap_is_applied() {
        let mut xml = String::from("<rss><channel>");
        for i in 0..250 {
            xml.push_str(&format!(
                "<item><title>t{i}</title><link>https://example.com/{i}</link></item>"
            ));
        }
        xml.push_str("</channel></rss>");
        let out = parse_feed(&xml, 100).unwrap();
        assert_eq!(out.len(), 100);
        assert_eq!(out[99].title.as_deref(), Some("t99"));
    }

    #[test]
    fn non_feed_documents_report_both_causes() {
        let err = parse_feed("<html><body>nope</body></html>", 100).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("rss:"), "{msg}");
        assert!(msg.contains("atom:"), "{msg}");
    }

    #[test]
    fn dates_accept_both_formats() {
        assert!(parse_feed_date("Wed, 02 Oct 2002 13:00:00 GMT").is_some());
        assert!(parse_feed_date("2002-10-02T15:00:00+02:00").is_some());
        assert!(parse_feed_date("yesterday").is_none());
    }
}
