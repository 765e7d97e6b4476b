//! Failure-reason normalization
//!
//! Raw verification errors embed addresses and URLs, which makes every
//! failure unique. Scrubbing collapses them into a small set of stable
//! reasons suitable for counting.

use once_cell::sync::Lazy;
use regex::Regex;

const MAX_REASON_LEN: usize = 120;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s)>\]]+").expect("url regex"));

static ADDR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}:\d{1,5}\b").expect("addr regex")
});

static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ip regex"));

static HOST_PORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[a-zA-Z][a-zA-Z0-9.-]*\.[a-zA-Z]{2,}:\d{1,5}\b").expect("host regex")
});

static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

/// Collapse a raw failure message into a stable, countable reason.
pub fn normalize(raw: &str) -> String {
    let scrubbed = URL_RE.replace_all(raw, "<url>");
    let scrubbed = ADDR_RE.replace_all(&scrubbed, "<addr>");
    let scrubbed = IP_RE.replace_all(&scrubbed, "<ip>");
    let scrubbed = HOST_PORT_RE.replace_all(&scrubbed, "<host>");

    let collapsed = WS_RE.replace_all(scrubbed.trim(), " ");
    let mut reason = collapsed.into_owned();
    if reason.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    if reason.is_empty() {
        "unknown".to_string()
    } else {
        reason
    }
}
