// src/ingest/mod.rs
pub mod capture;
pub mod config;
pub mod error;
pub mod guard;
pub mod http;
pub mod normalize;
pub mod pipeline;
pub mod providers;
pub mod rate_limit;
pub mod scheduler;
pub mod store;
pub mod types;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;
use regex::Regex;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_sources_total",
            "Source fetch attempts by outcome (succeeded/failed/throttled/cancelled)."
        );
        describe_counter!(
            "ingest_articles_added_total",
            "Articles inserted by fetch runs and manual capture."
        );
        describe_counter!(
            "ingest_articles_duplicate_total",
            "Candidates skipped because (owner, url) already existed."
        );
        describe_counter!(
            "ingest_ssrf_rejected_total",
            "Outbound fetch targets refused by the SSRF guard."
        );
        describe_counter!(
            "ingest_rate_limited_total",
            "Source fetches denied by the rate limiter."
        );
        describe_counter!("ingest_runs_total", "Scheduled fetch runs started.");
        describe_histogram!("ingest_fetch_ms", "Per-source fetch time in milliseconds.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when ingest pipeline last ran."
        );
    });
}

fn re_tags() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(script|style)\b.*?</(script|style)\s*>|</?[^>]+>").unwrap())
}

fn re_ws() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Normalize text: strip markup, decode entities, collapse whitespace, trim.
pub fn normalize_text(s: &str) -> String {
    // Tags first so an encoded "&lt;b&gt;" survives as literal text.
    let stripped = re_tags().replace_all(s, " ");
    let decoded = html_escape::decode_html_entities(&stripped);
    re_ws().replace_all(&decoded, " ").trim().to_string()
}

/// Cap `s` at `max` characters, appending `...` when anything was cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Cap `s` at `max` characters without a marker.
pub fn clip_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Replace HTML-only named entities that XML parsers reject.
pub(crate) fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", "&#160;")
        .replace("&ndash;", "&#8211;")
        .replace("&mdash;", "&#8212;")
        .replace("&ldquo;", "&#8220;")
        .replace("&rdquo;", "&#8221;")
        .replace("&lsquo;", "&#8216;")
        .replace("&rsquo;", "&#8217;")
        .replace("&hellip;", "&#8230;")
        .replace("&copy;", "&#169;")
}
