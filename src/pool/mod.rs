//! Rotating proxy pool router
//!
//! The pool partitions its entries across shard actors keyed by the stable
//! bucket of each proxy identifier. Routing acquires a serial from the single
//! generator (the throttle point), then walks shards starting at
//! `serial % shard_count`, advancing one shard per attempt. Outbound calls run
//! on a fixed set of executors fed from one shared work queue.

mod outbound;
mod serial;
mod shard;
mod sort;

pub use outbound::{HyperOutbound, Outbound, ProxyRequest};
pub use serial::{LeakyBucket, SerialGenerator};
pub use shard::{
    ShardHandle, ShardReply, ShardSettings, HEADER_ATTEMPT, HEADER_OFFERED, HEADER_SERIAL,
    HEADER_SUCCEEDED, HEADER_THROUGH_PROXY, MAX_ATTEMPTS_PER_SERIAL,
};
pub use sort::{DefaultOrder, SnapshotOrder};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashSet;
use futures::future::join_all;
use http_body_util::Full;
use hyper::Response;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::clock::{system_clock, SharedClock};
use crate::config::PoolConfig;
use crate::error::{CarouselError, Result, POOL_EXHAUSTED_STATUS};
use crate::models::{Entry, EvictionThresholds, ProxyId};
use crate::persist::{noop_heartbeat, Heartbeat};
use shard::{ExecutorJob, ShardCommand};

/// Entries faster than this qualify for the fast sample.
const FAST_SPEED: Duration = Duration::from_secs(1);

/// Builder for [`Pool`].
pub struct PoolBuilder {
    shard_count: usize,
    executors: usize,
    offer_limit: u64,
    short_sleep: Duration,
    eviction: EvictionThresholds,
    serial_delay: Duration,
    pressure_threshold: u64,
    pressure_pause: Duration,
    clock: SharedClock,
    outbound: Arc<dyn Outbound>,
    heartbeat: Heartbeat,
    order: Arc<dyn SnapshotOrder>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            shard_count: 32,
            executors: 16,
            offer_limit: 3,
            short_sleep: Duration::from_secs(300),
            eviction: EvictionThresholds::default(),
            serial_delay: Duration::ZERO,
            pressure_threshold: 128,
            pressure_pause: Duration::from_secs(60),
            clock: system_clock(),
            outbound: Arc::new(HyperOutbound::default()),
            heartbeat: noop_heartbeat(),
            order: Arc::new(DefaultOrder),
        }
    }
}

impl PoolBuilder {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self::default()
            .shard_count(config.shard_count)
            .executors(config.executors)
            .offer_limit(config.offer_limit)
            .short_sleep(config.short_sleep)
            .eviction(config.eviction)
            .serial_delay(config.serial_delay)
            .pressure_threshold(config.pressure_threshold)
            .pressure_pause(config.pressure_pause)
    }

    pub fn shard_count(mut self, n: usize) -> Self {
        self.shard_count = n.max(1);
        self
    }

    pub fn executors(mut self, n: usize) -> Self {
        self.executors = n.max(1);
        self
    }

    pub fn offer_limit(mut self, limit: u64) -> Self {
        self.offer_limit = limit;
        self
    }

    pub fn short_sleep(mut self, sleep: Duration) -> Self {
        self.short_sleep = sleep;
        self
    }

    pub fn eviction(mut self, thresholds: EvictionThresholds) -> Self {
        self.eviction = thresholds;
        self
    }

    pub fn serial_delay(mut self, delay: Duration) -> Self {
        self.serial_delay = delay;
        self
    }

    pub fn pressure_threshold(mut self, threshold: u64) -> Self {
        self.pressure_threshold = threshold;
        self
    }

    pub fn pressure_pause(mut self, pause: Duration) -> Self {
        self.pressure_pause = pause;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn outbound(mut self, outbound: Arc<dyn Outbound>) -> Self {
        self.outbound = outbound;
        self
    }

    pub fn heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn order(mut self, order: Arc<dyn SnapshotOrder>) -> Self {
        self.order = order;
        self
    }

    /// Spawn the shard actors, executors, serial generator and throttle.
    pub fn build(self) -> Pool {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (bucket, paused_rx) =
            LeakyBucket::spawn(self.pressure_threshold, self.pressure_pause, shutdown_rx.clone());
        let serial = SerialGenerator::spawn(self.serial_delay, paused_rx, shutdown_rx.clone());

        let (work_tx, work_rx) = mpsc::channel::<ExecutorJob>(self.executors);
        let work_rx = Arc::new(Mutex::new(work_rx));
        for _ in 0..self.executors {
            tokio::spawn(executor(
                self.outbound.clone(),
                work_rx.clone(),
                shutdown_rx.clone(),
            ));
        }

        let settings = ShardSettings {
            offer_limit: self.offer_limit,
            short_sleep: self.short_sleep,
            eviction: self.eviction,
            maintenance_interval: Duration::from_secs(60),
        };
        let shards = (0..self.shard_count)
            .map(|index| {
                ShardHandle::spawn(
                    index,
                    settings.clone(),
                    self.clock.clone(),
                    work_tx.clone(),
                    self.heartbeat.clone(),
                    shutdown_rx.clone(),
                )
            })
            .collect();

        info!(
            shards = self.shard_count,
            executors = self.executors,
            "pool started"
        );

        Pool {
            shards,
            serial,
            bucket,
            seen: Arc::new(DashSet::new()),
            order: self.order,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }
}

async fn executor(
    outbound: Arc<dyn Outbound>,
    work_rx: Arc<Mutex<mpsc::Receiver<ExecutorJob>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            job = async { work_rx.lock().await.recv().await } => job,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };
        let Some(job) = job else { return };

        let result = outbound.call(job.proxy, &job.request).await;
        let cmd = ShardCommand::Outcome {
            proxy: job.proxy,
            serial: job.serial,
            attempt: job.attempt,
            result,
            reply: job.reply,
        };
        // A closed shard mailbox only means that shard is gone.
        let _ = job.outcome_tx.send(cmd).await;
    }
}

/// Cloneable handle to the whole routing engine.
#[derive(Clone)]
pub struct Pool {
    shards: Vec<ShardHandle>,
    serial: SerialGenerator,
    bucket: LeakyBucket,
    /// Identifiers the probe has already handed to the pool; used for
    /// schedule dedup.
    seen: Arc<DashSet<ProxyId>>,
    order: Arc<dyn SnapshotOrder>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Pool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, id: ProxyId) -> &ShardHandle {
        &self.shards[id.bucket(self.shards.len())]
    }

    /// Route a buffered request through the pool.
    ///
    /// Blocks on serial acquisition (the throttle point), then walks shards
    /// one attempt at a time. Exhaustion answers (552) raise throttle
    /// pressure and are retried on the next shard until every shard has been
    /// offered the request once; the last 552 is then returned as-is.
    pub async fn round_trip(&self, request: ProxyRequest) -> Result<Response<Full<Bytes>>> {
        let serial = self.serial.next().await?;
        let shard_count = self.shards.len() as u64;

        let mut attempt: u64 = 0;
        let mut exhausted: u64 = 0;
        loop {
            let shard = &self.shards[((serial + attempt) % shard_count) as usize];
            match shard.route(request.clone(), serial, attempt).await? {
                ShardReply::Response(resp) if resp.status().as_u16() == POOL_EXHAUSTED_STATUS => {
                    self.bucket.pressure();
                    exhausted += 1;
                    if exhausted >= shard_count {
                        debug!(serial, attempt, "every shard exhausted");
                        return Ok(resp);
                    }
                    attempt += 1;
                }
                ShardReply::Response(resp) => return Ok(resp),
                ShardReply::Retry => attempt += 1,
            }
        }
    }

    /// Insert or refresh an entry, placing it on its home shard.
    pub async fn add(&self, entry: Entry) -> Result<()> {
        self.seen.insert(entry.id);
        self.shard_for(entry.id).add(entry).await
    }

    /// Remove an entry entirely. Also forgets that the proxy was ever seen,
    /// so the probe may verify and re-add it later.
    pub async fn remove(&self, id: ProxyId) -> Result<bool> {
        self.seen.remove(&id);
        self.shard_for(id).remove(id).await
    }

    /// Explicitly clear quarantine on one entry.
    pub async fn reanimate(&self, id: ProxyId) -> Result<bool> {
        self.shard_for(id).reanimate(id).await
    }

    pub fn is_seen(&self, id: ProxyId) -> bool {
        self.seen.contains(&id)
    }

    pub fn mark_seen(&self, id: ProxyId) {
        self.seen.insert(id);
    }

    /// Collect identifiers evicted by shard maintenance since the last call,
    /// clearing their seen marks so the probe can rediscover them.
    pub async fn drain_evicted(&self) -> Result<Vec<ProxyId>> {
        let mut all = Vec::new();
        for shard in &self.shards {
            all.extend(shard.drain_evicted().await?);
        }
        for id in &all {
            self.seen.remove(id);
        }
        Ok(all)
    }

    /// Combined, ordered snapshot of every shard.
    pub async fn snapshot(&self) -> Result<Vec<Entry>> {
        let parts = join_all(self.shards.iter().map(|s| s.snapshot())).await;
        let mut entries = Vec::new();
        for part in parts {
            entries.extend(part?);
        }
        self.order.sort(&mut entries);
        Ok(entries)
    }

    /// Entries fast enough for latency-sensitive callers.
    pub async fn fast_entries(&self) -> Result<Vec<Entry>> {
        let mut entries = self.snapshot().await?;
        entries.retain(|e| e.speed < FAST_SPEED);
        Ok(entries)
    }

    /// Up to `n` randomly chosen fast entries. Errors with `PoolExhausted`
    /// when no entry qualifies.
    pub async fn sample_fast(&self, n: usize) -> Result<Vec<Entry>> {
        let entries = self.fast_entries().await?;
        if entries.is_empty() {
            return Err(CarouselError::PoolExhausted);
        }
        let mut rng = rand::thread_rng();
        Ok(entries.choose_multiple(&mut rng, n).cloned().collect())
    }

    /// Encode the current entries for persistence.
    pub async fn serialize(&self) -> Result<Vec<u8>> {
        let entries = self.snapshot().await?;
        bincode::serialize(&entries)
            .map_err(|e| CarouselError::Persistence(format!("encode failed: {}", e)))
    }

    /// Restore entries from an earlier [`serialize`](Pool::serialize) call.
    ///
    /// Each entry goes to the shard its bucket names under the current shard
    /// count, so snapshots survive reconfiguration. Returns the number of
    /// entries restored.
    pub async fn deserialize(&self, bytes: &[u8]) -> Result<usize> {
        let entries: Vec<Entry> = bincode::deserialize(bytes)
            .map_err(|e| CarouselError::Persistence(format!("decode failed: {}", e)))?;
        let count = entries.len();
        for entry in entries {
            self.seen.insert(entry.id);
            self.shard_for(entry.id).add(entry).await?;
        }
        info!(count, "pool snapshot restored");
        Ok(count)
    }

    /// Signal every pool task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
