//! Collaborator seams for the verification lifecycle
//!
//! The probe actor is generic over three collaborators: a `Checker` that
//! verifies one proxy, `Source`s that produce candidates, and a `Stats` sink
//! that counts per-source outcomes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CheckError, Result};
use crate::models::ProxyId;
use crate::pool::{HyperOutbound, Outbound, ProxyRequest};

/// Identifies where a candidate proxy came from.
pub type SourceId = u32;

/// Reserved source for the probe's own reverification loop.
pub const REVERIFY_SOURCE: SourceId = 0;

/// Verifies that one proxy actually works, reporting its round-trip time.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, proxy: ProxyId) -> std::result::Result<Duration, CheckError>;
}

/// Default checker: fetches a known URL through the candidate proxy and
/// treats any successful response as proof of life.
pub struct HttpChecker {
    url: String,
    outbound: HyperOutbound,
}

impl HttpChecker {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            outbound: HyperOutbound::new(timeout, timeout),
        }
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn check(&self, proxy: ProxyId) -> std::result::Result<Duration, CheckError> {
        let request =
            ProxyRequest::get(&self.url).map_err(|e| CheckError::permanent(e.to_string()))?;

        let started = Instant::now();
        let response = self.outbound.call(proxy, &request).await.map_err(|e| {
            if e.is_timeout() {
                CheckError::timeout()
            } else {
                CheckError::permanent(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(CheckError::permanent(format!(
                "check returned status {}",
                response.status()
            )));
        }
        Ok(started.elapsed())
    }
}

/// A producer of candidate proxies, polled on its own cadence.
#[async_trait]
pub trait Source: Send + Sync {
    fn id(&self) -> SourceId;
    /// How often [`fetch`](Source::fetch) should be called.
    fn frequency(&self) -> Duration;
    async fn fetch(&self) -> Result<Vec<ProxyId>>;
}

/// Per-source outcome counters.
pub trait Stats: Send + Sync {
    fn scheduled(&self, source: SourceId);
    fn ignored(&self, source: SourceId);
    fn found(&self, source: SourceId);
    fn failed(&self, source: SourceId);
    /// Flag a source's fetch/verify cycle as in flight.
    fn set_running(&self, source: SourceId, running: bool);
    fn is_running(&self, source: SourceId) -> bool;
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    ignored: AtomicU64,
    found: AtomicU64,
    failed: AtomicU64,
    running: AtomicBool,
}

/// Point-in-time view of one source's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub scheduled: u64,
    pub ignored: u64,
    pub found: u64,
    pub failed: u64,
}

/// In-memory [`Stats`] implementation.
#[derive(Default)]
pub struct MemoryStats {
    sources: DashMap<SourceId, Counters>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, source: SourceId, pick: impl Fn(&Counters) -> &AtomicU64) {
        let entry = self.sources.entry(source).or_default();
        pick(&entry).fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every source's counters.
    pub fn snapshot(&self) -> HashMap<SourceId, SourceCounts> {
        self.sources
            .iter()
            .map(|kv| {
                (
                    *kv.key(),
                    SourceCounts {
                        scheduled: kv.scheduled.load(Ordering::Relaxed),
                        ignored: kv.ignored.load(Ordering::Relaxed),
                        found: kv.found.load(Ordering::Relaxed),
                        failed: kv.failed.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }
}

impl Stats for MemoryStats {
    fn scheduled(&self, source: SourceId) {
        self.bump(source, |c| &c.scheduled);
    }

    fn ignored(&self, source: SourceId) {
        self.bump(source, |c| &c.ignored);
    }

    fn found(&self, source: SourceId) {
        self.bump(source, |c| &c.found);
    }

    fn failed(&self, source: SourceId) {
        self.bump(source, |c| &c.failed);
    }

    fn set_running(&self, source: SourceId, running: bool) {
        let entry = self.sources.entry(source).or_default();
        entry.running.store(running, Ordering::Relaxed);
    }

    fn is_running(&self, source: SourceId) -> bool {
        self.sources
            .get(&source)
            .map(|c| c.running.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}
