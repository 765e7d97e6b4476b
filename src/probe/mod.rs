//! Verification lifecycle engine
//!
//! A single-threaded actor owns every lifecycle map: the reverify backlog,
//! the blacklist, per-proxy source attribution and the append-only failure
//! reason list. Candidates arrive via `schedule`, verification runs on a
//! fixed worker pool calling the external `Checker`, and verdicts flow back
//! to the actor on a dedicated channel. Successes are promoted into the
//! pool; timeouts re-enter a bounded reverify loop; everything else is
//! blacklisted under a normalized, deduplicated reason.

mod reasons;

pub use reasons::normalize;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::clock::{system_clock, SharedClock};
use crate::collab::{Checker, Source, SourceId, Stats, REVERIFY_SOURCE};
use crate::config::ProbeConfig;
use crate::error::{CarouselError, Result};
use crate::models::{Entry, ProxyId};
use crate::persist::{noop_heartbeat, Heartbeat};
use crate::pool::Pool;

/// Reverify bookkeeping for one proxy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReverifyState {
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
}

/// Exported lifecycle state; what `serialize` writes and `snapshot` returns.
/// The reason→index inverted map is rebuilt on restore from `failures`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeSnapshot {
    pub last_reverified: HashMap<ProxyId, ReverifyState>,
    /// Blacklisted proxy → index into `failures`.
    pub blacklist: HashMap<ProxyId, u32>,
    /// Which sources ever offered each proxy, kept even for ignored and
    /// blacklisted ones.
    pub seen_sources: HashMap<ProxyId, BTreeSet<SourceId>>,
    /// Append-only normalized failure reasons; position is the stable index.
    pub failures: Vec<String>,
}

struct VerifyJob {
    proxy: ProxyId,
    source: SourceId,
    attempt: u32,
}

enum Verdict {
    Found {
        proxy: ProxyId,
        source: SourceId,
        speed: Duration,
    },
    Timeout {
        proxy: ProxyId,
        source: SourceId,
        attempt: u32,
    },
    Failed {
        proxy: ProxyId,
        source: SourceId,
        reason: String,
    },
}

enum ProbeCommand {
    Schedule {
        proxy: ProxyId,
        source: SourceId,
        attempt: u32,
    },
    Snapshot(oneshot::Sender<ProbeSnapshot>),
    Delete(ProxyId, oneshot::Sender<bool>),
    Reanimate(ProxyId, oneshot::Sender<bool>),
    Restore(ProbeSnapshot, oneshot::Sender<()>),
    /// Run a reverify pass immediately instead of waiting for the timer.
    Reverify(oneshot::Sender<()>),
}

/// Builder for [`Probe`].
pub struct ProbeBuilder {
    pool: Pool,
    checker: Arc<dyn Checker>,
    stats: Arc<dyn Stats>,
    clock: SharedClock,
    heartbeat: Heartbeat,
    workers: usize,
    mailbox: usize,
    reverify_base: Duration,
    reverify_jitter: Duration,
    reverify_deadline: Duration,
    max_reverifies: u32,
    check_timeout: Duration,
}

impl ProbeBuilder {
    pub fn new(pool: Pool, checker: Arc<dyn Checker>, stats: Arc<dyn Stats>) -> Self {
        Self {
            pool,
            checker,
            stats,
            clock: system_clock(),
            heartbeat: noop_heartbeat(),
            workers: 16,
            mailbox: 64,
            reverify_base: Duration::from_secs(1800),
            reverify_jitter: Duration::from_secs(500),
            reverify_deadline: Duration::from_secs(3600),
            max_reverifies: 5,
            check_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(
        config: &ProbeConfig,
        pool: Pool,
        checker: Arc<dyn Checker>,
        stats: Arc<dyn Stats>,
    ) -> Self {
        let mut builder = Self::new(pool, checker, stats);
        builder.workers = config.workers;
        builder.mailbox = config.mailbox;
        builder.reverify_base = config.reverify_base;
        builder.reverify_jitter = config.reverify_jitter;
        builder.reverify_deadline = config.reverify_deadline;
        builder.max_reverifies = config.max_reverifies;
        builder.check_timeout = config.check_timeout;
        builder
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn mailbox(mut self, n: usize) -> Self {
        self.mailbox = n.max(1);
        self
    }

    pub fn reverify_base(mut self, base: Duration) -> Self {
        self.reverify_base = base;
        self
    }

    pub fn reverify_deadline(mut self, deadline: Duration) -> Self {
        self.reverify_deadline = deadline;
        self
    }

    pub fn max_reverifies(mut self, max: u32) -> Self {
        self.max_reverifies = max;
        self
    }

    /// Spawn the lifecycle actor and its verification workers.
    pub fn build(self) -> Probe {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(self.mailbox);

        // Workers block on the verdict channel once it fills, so the actor
        // must keep draining verdicts whenever it hands out jobs; see
        // `ProbeState::dispatch`.
        let (verify_tx, verify_rx) = mpsc::channel::<VerifyJob>(self.workers);
        let (verdict_tx, verdict_rx) = mpsc::channel::<Verdict>(self.workers);

        let verify_rx = Arc::new(Mutex::new(verify_rx));
        for _ in 0..self.workers {
            tokio::spawn(worker(
                self.checker.clone(),
                verify_rx.clone(),
                verdict_tx.clone(),
                self.check_timeout,
                shutdown_rx.clone(),
            ));
        }

        let state = ProbeState {
            snapshot: ProbeSnapshot::default(),
            failure_index: HashMap::new(),
            pool: self.pool,
            stats: self.stats.clone(),
            clock: self.clock,
            heartbeat: self.heartbeat,
            verify_tx,
            reverify_deadline: self.reverify_deadline,
            max_reverifies: self.max_reverifies,
            pending_reverifies: 0,
        };
        tokio::spawn(run(
            state,
            cmd_rx,
            verdict_rx,
            self.reverify_base,
            self.reverify_jitter,
            shutdown_rx.clone(),
        ));

        info!(workers = self.workers, "probe started");

        Probe {
            tx: cmd_tx,
            stats: self.stats,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }
}

/// Cloneable handle to the verification lifecycle actor.
#[derive(Clone)]
pub struct Probe {
    tx: mpsc::Sender<ProbeCommand>,
    stats: Arc<dyn Stats>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Probe {
    /// Offer a candidate proxy from a source. Blocks while the mailbox is
    /// full, backpressuring the producer.
    pub async fn schedule(&self, proxy: ProxyId, source: SourceId) -> Result<()> {
        self.tx
            .send(ProbeCommand::Schedule {
                proxy,
                source,
                attempt: 0,
            })
            .await
            .map_err(|_| CarouselError::ChannelClosed("probe"))
    }

    /// Point-in-time consistent lifecycle snapshot.
    pub async fn snapshot(&self) -> Result<ProbeSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ProbeCommand::Snapshot(tx))
            .await
            .map_err(|_| CarouselError::ChannelClosed("probe"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("probe reply"))
    }

    /// Drop one proxy's blacklist/reverify state so it can be verified again.
    pub async fn delete(&self, proxy: ProxyId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ProbeCommand::Delete(proxy, tx))
            .await
            .map_err(|_| CarouselError::ChannelClosed("probe"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("probe reply"))
    }

    /// Remove one proxy from the blacklist, making it verifiable again while
    /// keeping its source attribution and failure history.
    pub async fn reanimate(&self, proxy: ProxyId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ProbeCommand::Reanimate(proxy, tx))
            .await
            .map_err(|_| CarouselError::ChannelClosed("probe"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("probe reply"))
    }

    /// Force a reverify pass now; used operationally and by tests.
    pub async fn trigger_reverify(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ProbeCommand::Reverify(tx))
            .await
            .map_err(|_| CarouselError::ChannelClosed("probe"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("probe reply"))
    }

    /// Encode the lifecycle snapshot for persistence.
    pub async fn serialize(&self) -> Result<Vec<u8>> {
        let snapshot = self.snapshot().await?;
        bincode::serialize(&snapshot)
            .map_err(|e| CarouselError::Persistence(format!("encode failed: {}", e)))
    }

    /// Restore lifecycle state from an earlier [`serialize`](Probe::serialize)
    /// call. The reason index map is rebuilt from the failure list.
    pub async fn deserialize(&self, bytes: &[u8]) -> Result<()> {
        let snapshot: ProbeSnapshot = bincode::deserialize(bytes)
            .map_err(|e| CarouselError::Persistence(format!("decode failed: {}", e)))?;
        self.restore(snapshot).await
    }

    /// Replace lifecycle state with a previously captured snapshot.
    pub async fn restore(&self, snapshot: ProbeSnapshot) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ProbeCommand::Restore(snapshot, tx))
            .await
            .map_err(|_| CarouselError::ChannelClosed("probe"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("probe reply"))
    }

    /// Spawn one pump task per source, feeding candidates into `schedule` at
    /// each source's own cadence. Tasks stop on probe shutdown.
    pub fn run_sources(&self, sources: Vec<Arc<dyn Source>>) {
        for source in sources {
            let probe = self.clone();
            let stats = self.stats.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    stats.set_running(source.id(), true);
                    match source.fetch().await {
                        Ok(candidates) => {
                            for proxy in candidates {
                                if probe.schedule(proxy, source.id()).await.is_err() {
                                    stats.set_running(source.id(), false);
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(source = source.id(), error = %e, "source fetch failed");
                        }
                    }
                    stats.set_running(source.id(), false);

                    tokio::select! {
                        _ = tokio::time::sleep(source.frequency()) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    }

    /// Signal the actor, workers and source pumps to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn worker(
    checker: Arc<dyn Checker>,
    verify_rx: Arc<Mutex<mpsc::Receiver<VerifyJob>>>,
    verdict_tx: mpsc::Sender<Verdict>,
    check_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // Outer guard for checkers that ignore their own deadline.
    let hard_timeout = check_timeout.saturating_mul(2);

    loop {
        let job = tokio::select! {
            job = async { verify_rx.lock().await.recv().await } => job,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };
        let Some(job) = job else { return };

        let verdict = match timeout(hard_timeout, checker.check(job.proxy)).await {
            Err(_) => Verdict::Timeout {
                proxy: job.proxy,
                source: job.source,
                attempt: job.attempt,
            },
            Ok(Ok(speed)) => Verdict::Found {
                proxy: job.proxy,
                source: job.source,
                speed,
            },
            Ok(Err(e)) if e.is_temporary() => Verdict::Timeout {
                proxy: job.proxy,
                source: job.source,
                attempt: job.attempt,
            },
            Ok(Err(e)) => Verdict::Failed {
                proxy: job.proxy,
                source: job.source,
                reason: e.message,
            },
        };

        if verdict_tx.send(verdict).await.is_err() {
            return;
        }
    }
}

struct ProbeState {
    snapshot: ProbeSnapshot,
    /// Inverted reason→index map; rebuilt from `snapshot.failures` on restore.
    failure_index: HashMap<String, u32>,
    pool: Pool,
    stats: Arc<dyn Stats>,
    clock: SharedClock,
    heartbeat: Heartbeat,
    verify_tx: mpsc::Sender<VerifyJob>,
    reverify_deadline: Duration,
    max_reverifies: u32,
    /// Reverify resubmissions dispatched but not yet answered; the running
    /// flag for [`REVERIFY_SOURCE`] stays up until this drains to zero.
    pending_reverifies: usize,
}

/// What the actor loop woke up for. Command and timer handling also drain
/// the verdict receiver, so the select resolves to an event first and the
/// receiver is borrowed again afterwards.
enum Event {
    Command(ProbeCommand),
    Verdict(Verdict),
    ReverifyDue,
    ShutdownChanged,
    Closed,
}

async fn run(
    mut state: ProbeState,
    mut cmd_rx: mpsc::Receiver<ProbeCommand>,
    mut verdict_rx: mpsc::Receiver<Verdict>,
    reverify_base: Duration,
    reverify_jitter: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let sleep = sleep_until(Instant::now() + with_jitter(reverify_base, reverify_jitter));
    tokio::pin!(sleep);

    loop {
        let event = tokio::select! {
            cmd = cmd_rx.recv() => cmd.map(Event::Command).unwrap_or(Event::Closed),
            verdict = verdict_rx.recv() => verdict.map(Event::Verdict).unwrap_or(Event::Closed),
            () = &mut sleep => Event::ReverifyDue,
            _ = shutdown.changed() => Event::ShutdownChanged,
        };

        match event {
            Event::Command(cmd) => state.handle_command(cmd, &mut verdict_rx).await,
            Event::Verdict(verdict) => state.handle_verdict(verdict).await,
            Event::ReverifyDue => {
                state.reverify_pass(&mut verdict_rx).await;
                sleep.as_mut().reset(Instant::now() + with_jitter(reverify_base, reverify_jitter));
            }
            Event::ShutdownChanged => {
                if *shutdown.borrow() {
                    debug!("probe shutting down");
                    break;
                }
            }
            Event::Closed => break,
        }
    }
}

fn with_jitter(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter.as_millis() as u64))
}

impl ProbeState {
    async fn handle_command(&mut self, cmd: ProbeCommand, verdict_rx: &mut mpsc::Receiver<Verdict>) {
        match cmd {
            ProbeCommand::Schedule {
                proxy,
                source,
                attempt,
            } => self.handle_schedule(proxy, source, attempt, verdict_rx).await,
            ProbeCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot.clone());
            }
            ProbeCommand::Delete(proxy, reply) => {
                let removed = self.snapshot.blacklist.remove(&proxy).is_some()
                    | self.snapshot.last_reverified.remove(&proxy).is_some();
                if removed {
                    (self.heartbeat)();
                }
                let _ = reply.send(removed);
            }
            ProbeCommand::Reanimate(proxy, reply) => {
                let removed = self.snapshot.blacklist.remove(&proxy).is_some();
                if removed {
                    (self.heartbeat)();
                }
                let _ = reply.send(removed);
            }
            ProbeCommand::Restore(snapshot, reply) => {
                self.failure_index = snapshot
                    .failures
                    .iter()
                    .enumerate()
                    .map(|(i, reason)| (reason.clone(), i as u32))
                    .collect();
                info!(
                    blacklisted = snapshot.blacklist.len(),
                    reverifying = snapshot.last_reverified.len(),
                    "probe snapshot restored"
                );
                self.snapshot = snapshot;
                let _ = reply.send(());
            }
            ProbeCommand::Reverify(reply) => {
                self.reverify_pass(verdict_rx).await;
                let _ = reply.send(());
            }
        }
    }

    /// Dedup rules, applied in strict order. Source attribution is recorded
    /// for every non-empty identifier, ignored or not.
    async fn handle_schedule(
        &mut self,
        proxy: ProxyId,
        source: SourceId,
        attempt: u32,
        verdict_rx: &mut mpsc::Receiver<Verdict>,
    ) {
        if !proxy.is_valid() {
            self.stats.ignored(source);
            return;
        }

        self.snapshot
            .seen_sources
            .entry(proxy)
            .or_default()
            .insert(source);

        if self.snapshot.blacklist.contains_key(&proxy) {
            // Stale reverify bookkeeping serves no purpose once blacklisted.
            self.snapshot.last_reverified.remove(&proxy);
            self.stats.ignored(source);
            return;
        }

        if attempt == 0
            && source != REVERIFY_SOURCE
            && self.snapshot.last_reverified.contains_key(&proxy)
        {
            // The reverify loop already owns this proxy.
            self.stats.ignored(source);
            return;
        }

        if self.pool.is_seen(proxy) {
            self.stats.ignored(source);
            return;
        }

        self.stats.scheduled(source);
        self.dispatch(
            VerifyJob {
                proxy,
                source,
                attempt,
            },
            verdict_rx,
        )
        .await;
    }

    /// Hand a job to the verification queue without wedging the actor. When
    /// the queue is full the workers are saturated and may themselves be
    /// blocked sending verdicts back, so a slot only frees up if verdicts
    /// keep getting drained here.
    async fn dispatch(&mut self, job: VerifyJob, verdict_rx: &mut mpsc::Receiver<Verdict>) {
        let source = job.source;
        let mut job = job;
        loop {
            match self.verify_tx.try_send(job) {
                Ok(()) => {
                    if source == REVERIFY_SOURCE {
                        self.pending_reverifies += 1;
                    }
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("verification queue closed");
                    return;
                }
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    job = returned;
                    match verdict_rx.recv().await {
                        Some(verdict) => self.handle_verdict(verdict).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle_verdict(&mut self, verdict: Verdict) {
        let now = self.clock.now();
        let source = match &verdict {
            Verdict::Found { source, .. }
            | Verdict::Timeout { source, .. }
            | Verdict::Failed { source, .. } => *source,
        };
        match verdict {
            Verdict::Found {
                proxy,
                source,
                speed,
            } => {
                self.snapshot.last_reverified.remove(&proxy);
                self.stats.found(source);
                debug!(%proxy, speed_ms = speed.as_millis() as u64, "proxy verified");
                if let Err(e) = self.pool.add(Entry::new(proxy, now, speed)).await {
                    warn!(%proxy, error = %e, "failed to promote proxy");
                }
            }
            Verdict::Timeout {
                proxy,
                source,
                attempt,
            } => {
                self.stats.failed(source);
                self.snapshot.last_reverified.insert(
                    proxy,
                    ReverifyState {
                        attempt: attempt + 1,
                        deadline: now + chrono_duration(self.reverify_deadline),
                    },
                );
            }
            Verdict::Failed {
                proxy,
                source,
                reason,
            } => {
                self.stats.failed(source);
                self.snapshot.last_reverified.remove(&proxy);
                let normalized = normalize(&reason);
                self.blacklist(proxy, normalized);
            }
        }
        if source == REVERIFY_SOURCE && self.pending_reverifies > 0 {
            self.pending_reverifies -= 1;
            if self.pending_reverifies == 0 {
                self.stats.set_running(REVERIFY_SOURCE, false);
            }
        }
        (self.heartbeat)();
    }

    /// Record a normalized failure reason, reusing the first-seen index.
    fn blacklist(&mut self, proxy: ProxyId, reason: String) {
        let index = match self.failure_index.get(&reason) {
            Some(&index) => index,
            None => {
                let index = self.snapshot.failures.len() as u32;
                self.snapshot.failures.push(reason.clone());
                self.failure_index.insert(reason, index);
                index
            }
        };
        self.snapshot.blacklist.insert(proxy, index);
    }

    /// Resubmit every proxy whose reverify deadline has passed; proxies over
    /// the attempt budget are force-blacklisted instead.
    ///
    /// The running flag is raised for the whole lifetime of a pass: it stays
    /// up until every resubmitted check has reported back, so a timer firing
    /// while checks are still in flight skips the pass instead of stacking
    /// another one on top.
    async fn reverify_pass(&mut self, verdict_rx: &mut mpsc::Receiver<Verdict>) {
        if self.stats.is_running(REVERIFY_SOURCE) {
            debug!("previous reverify pass still in flight, skipping");
            return;
        }
        self.stats.set_running(REVERIFY_SOURCE, true);

        let now = self.clock.now();
        let due: Vec<(ProxyId, u32)> = self
            .snapshot
            .last_reverified
            .iter()
            .filter(|(_, st)| st.deadline <= now)
            .map(|(proxy, st)| (*proxy, st.attempt))
            .collect();

        let mut resubmitted = 0usize;
        let mut exceeded = 0usize;
        for (proxy, attempt) in due {
            if attempt >= self.max_reverifies {
                self.snapshot.last_reverified.remove(&proxy);
                self.blacklist(
                    proxy,
                    format!("exceeded {} reverifies", self.max_reverifies),
                );
                (self.heartbeat)();
                exceeded += 1;
            } else {
                // Push the deadline out so the next pass cannot resubmit
                // the same proxy while this check is in flight.
                if let Some(st) = self.snapshot.last_reverified.get_mut(&proxy) {
                    st.deadline = now + chrono_duration(self.reverify_deadline);
                }
                self.handle_schedule(proxy, REVERIFY_SOURCE, attempt.max(1), verdict_rx)
                    .await;
                resubmitted += 1;
            }
        }

        if resubmitted > 0 || exceeded > 0 {
            info!(resubmitted, exceeded, "reverify pass complete");
        }
        // Verdicts for resubmitted checks clear the flag; a pass that
        // dispatched nothing clears it immediately.
        if self.pending_reverifies == 0 {
            self.stats.set_running(REVERIFY_SOURCE, false);
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use dashmap::DashMap;
    use std::net::Ipv4Addr;

    use crate::clock::{Clock, ManualClock};
    use crate::collab::MemoryStats;
    use crate::error::CheckError;
    use crate::models::Protocol;

    /// Checker with per-proxy programmable outcomes.
    #[derive(Default)]
    struct ScriptedChecker {
        outcomes: DashMap<ProxyId, std::result::Result<Duration, CheckError>>,
    }

    impl ScriptedChecker {
        fn ok(&self, proxy: ProxyId, speed: Duration) {
            self.outcomes.insert(proxy, Ok(speed));
        }

        fn fail(&self, proxy: ProxyId, error: CheckError) {
            self.outcomes.insert(proxy, Err(error));
        }
    }

    #[async_trait]
    impl Checker for ScriptedChecker {
        async fn check(&self, proxy: ProxyId) -> std::result::Result<Duration, CheckError> {
            match self.outcomes.get(&proxy) {
                Some(outcome) => outcome.value().clone(),
                None => Err(CheckError::permanent("no script for proxy")),
            }
        }
    }

    struct Harness {
        pool: Pool,
        probe: Probe,
        checker: Arc<ScriptedChecker>,
        stats: Arc<MemoryStats>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap(),
        ));
        let pool = Pool::builder()
            .shard_count(2)
            .executors(1)
            .clock(clock.clone())
            .build();
        let checker = Arc::new(ScriptedChecker::default());
        let stats = Arc::new(MemoryStats::new());
        let probe = ProbeBuilder::new(pool.clone(), checker.clone(), stats.clone())
            .clock(clock.clone())
            .workers(2)
            .reverify_base(Duration::from_secs(3600))
            .build();
        Harness {
            pool,
            probe,
            checker,
            stats,
            clock,
        }
    }

    fn test_id(octet: u8) -> ProxyId {
        ProxyId::new(Ipv4Addr::new(10, 0, 0, octet), 8080, Protocol::Http)
    }

    async fn wait_for<F>(mut cond: F)
    where
        F: FnMut() -> bool,
    {
        timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_snapshot<F>(probe: &Probe, mut cond: F) -> ProbeSnapshot
    where
        F: FnMut(&ProbeSnapshot) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = probe.snapshot().await.unwrap();
                if cond(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("snapshot condition not reached in time")
    }

    #[tokio::test]
    async fn test_success_promotes_into_pool() {
        let h = harness();
        let proxy = test_id(1);
        h.checker.ok(proxy, Duration::from_millis(10));

        h.probe.schedule(proxy, 1).await.unwrap();
        wait_for(|| h.pool.is_seen(proxy)).await;

        let entries = h.pool.snapshot().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, proxy);
        assert_eq!(entries[0].speed, Duration::from_millis(10));

        wait_for(|| h.stats.snapshot().get(&1).map(|c| c.found) == Some(1)).await;
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_permanent_failure_blacklists_with_normalized_reason() {
        let h = harness();
        let proxy = test_id(2);
        h.checker
            .fail(proxy, CheckError::permanent("bad gateway from 10.0.0.2:8080"));

        h.probe.schedule(proxy, 2).await.unwrap();
        let snapshot =
            wait_for_snapshot(&h.probe, |s| s.blacklist.contains_key(&proxy)).await;

        let index = snapshot.blacklist[&proxy] as usize;
        assert_eq!(snapshot.failures[index], "bad gateway from <addr>");
        assert!(!h.pool.is_seen(proxy));
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_same_reason_reuses_first_seen_index() {
        let h = harness();
        h.checker
            .fail(test_id(3), CheckError::permanent("bad gateway"));
        h.checker
            .fail(test_id(4), CheckError::permanent("bad gateway"));

        h.probe.schedule(test_id(3), 1).await.unwrap();
        h.probe.schedule(test_id(4), 1).await.unwrap();

        let snapshot = wait_for_snapshot(&h.probe, |s| s.blacklist.len() == 2).await;
        assert_eq!(snapshot.failures.len(), 1);
        assert_eq!(snapshot.blacklist[&test_id(3)], snapshot.blacklist[&test_id(4)]);
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_timeout_enters_reverify_backlog() {
        let h = harness();
        let proxy = test_id(5);
        h.checker.fail(proxy, CheckError::timeout());

        h.probe.schedule(proxy, 1).await.unwrap();
        let snapshot =
            wait_for_snapshot(&h.probe, |s| s.last_reverified.contains_key(&proxy)).await;

        let st = snapshot.last_reverified[&proxy];
        assert_eq!(st.attempt, 1);
        assert_eq!(st.deadline, h.clock.now() + chrono::Duration::hours(1));
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_exceeding_reverify_budget_blacklists() {
        let h = harness();
        let proxy = test_id(6);
        h.checker.fail(proxy, CheckError::timeout());

        h.probe.schedule(proxy, 1).await.unwrap();
        wait_for_snapshot(&h.probe, |s| {
            s.last_reverified.get(&proxy).map(|st| st.attempt) == Some(1)
        })
        .await;

        // Each pass resubmits; each resubmission times out again.
        for expected in 2..=5u32 {
            h.clock.advance(chrono::Duration::hours(2));
            h.probe.trigger_reverify().await.unwrap();
            wait_for_snapshot(&h.probe, |s| {
                s.last_reverified.get(&proxy).map(|st| st.attempt) == Some(expected)
            })
            .await;
        }

        // Attempt budget exhausted: the next pass force-blacklists.
        h.clock.advance(chrono::Duration::hours(2));
        h.probe.trigger_reverify().await.unwrap();
        let snapshot =
            wait_for_snapshot(&h.probe, |s| s.blacklist.contains_key(&proxy)).await;

        let index = snapshot.blacklist[&proxy] as usize;
        assert_eq!(snapshot.failures[index], "exceeded 5 reverifies");
        assert!(!snapshot.last_reverified.contains_key(&proxy));
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_reverify_pass_survives_backlog_larger_than_worker_buffers() {
        let h = harness();

        // Far more due proxies than the two workers and their channel
        // buffers can hold at once; the actor has to keep absorbing
        // verdicts while it resubmits.
        let backlog: Vec<ProxyId> = (1..=12).map(test_id).collect();
        for &proxy in &backlog {
            h.checker.fail(proxy, CheckError::timeout());
            h.probe.schedule(proxy, 1).await.unwrap();
        }
        wait_for_snapshot(&h.probe, |s| {
            s.last_reverified.len() == backlog.len()
                && s.last_reverified.values().all(|st| st.attempt == 1)
        })
        .await;

        h.clock.advance(chrono::Duration::hours(2));
        timeout(Duration::from_secs(5), h.probe.trigger_reverify())
            .await
            .expect("reverify pass stalled")
            .unwrap();

        wait_for_snapshot(&h.probe, |s| {
            s.last_reverified.len() == backlog.len()
                && s.last_reverified.values().all(|st| st.attempt == 2)
        })
        .await;
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_reverify_pass_skipped_while_previous_still_running() {
        let h = harness();
        let proxy = test_id(15);
        h.checker.fail(proxy, CheckError::timeout());

        h.probe.schedule(proxy, 1).await.unwrap();
        wait_for_snapshot(&h.probe, |s| {
            s.last_reverified.get(&proxy).map(|st| st.attempt) == Some(1)
        })
        .await;

        // A pass still marked running gates the next one entirely.
        h.stats.set_running(REVERIFY_SOURCE, true);
        h.clock.advance(chrono::Duration::hours(2));
        h.probe.trigger_reverify().await.unwrap();
        let snapshot = h.probe.snapshot().await.unwrap();
        assert_eq!(snapshot.last_reverified[&proxy].attempt, 1);

        // Cleared, the pass resubmits; the flag drops again once the
        // resubmitted check reports back.
        h.stats.set_running(REVERIFY_SOURCE, false);
        h.probe.trigger_reverify().await.unwrap();
        wait_for_snapshot(&h.probe, |s| {
            s.last_reverified.get(&proxy).map(|st| st.attempt) == Some(2)
        })
        .await;
        wait_for(|| !h.stats.is_running(REVERIFY_SOURCE)).await;
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_schedule_dedup_rules() {
        let h = harness();

        // Empty identifier: ignored without attribution.
        h.probe.schedule(ProxyId::NONE, 1).await.unwrap();

        // Already promoted: ignored, but attribution recorded.
        let promoted = test_id(7);
        h.pool.mark_seen(promoted);
        h.probe.schedule(promoted, 1).await.unwrap();
        h.probe.schedule(promoted, 2).await.unwrap();

        let snapshot = wait_for_snapshot(&h.probe, |s| {
            s.seen_sources.get(&promoted).map(|s| s.len()) == Some(2)
        })
        .await;
        assert!(!snapshot.seen_sources.contains_key(&ProxyId::NONE));
        assert_eq!(
            snapshot.seen_sources[&promoted],
            BTreeSet::from([1, 2])
        );
        assert!(!snapshot.blacklist.contains_key(&promoted));

        wait_for(|| h.stats.snapshot().get(&1).map(|c| c.ignored) == Some(2)).await;
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_blacklisted_schedule_clears_stale_reverify_state() {
        let h = harness();
        let proxy = test_id(8);
        h.checker.fail(proxy, CheckError::permanent("refused"));

        h.probe.schedule(proxy, 1).await.unwrap();
        wait_for_snapshot(&h.probe, |s| s.blacklist.contains_key(&proxy)).await;

        // Simulate stale reverify bookkeeping via a restored snapshot.
        let mut snapshot = h.probe.snapshot().await.unwrap();
        snapshot.last_reverified.insert(
            proxy,
            ReverifyState {
                attempt: 2,
                deadline: h.clock.now(),
            },
        );
        let bytes = bincode::serialize(&snapshot).unwrap();
        h.probe.deserialize(&bytes).await.unwrap();

        h.probe.schedule(proxy, 3).await.unwrap();
        let snapshot = wait_for_snapshot(&h.probe, |s| {
            !s.last_reverified.contains_key(&proxy)
        })
        .await;
        assert!(snapshot.blacklist.contains_key(&proxy));
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_fresh_schedule_ignored_mid_reverify() {
        let h = harness();
        let proxy = test_id(9);
        h.checker.fail(proxy, CheckError::timeout());

        h.probe.schedule(proxy, 1).await.unwrap();
        wait_for_snapshot(&h.probe, |s| s.last_reverified.contains_key(&proxy)).await;

        // Fresh schedule from an ordinary source while reverify owns it.
        h.probe.schedule(proxy, 2).await.unwrap();
        let snapshot = wait_for_snapshot(&h.probe, |s| {
            s.seen_sources.get(&proxy).map(|s| s.len()) == Some(2)
        })
        .await;
        assert_eq!(snapshot.last_reverified[&proxy].attempt, 1);
        wait_for(|| h.stats.snapshot().get(&2).map(|c| c.ignored) == Some(1)).await;
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_serialize_roundtrip_rebuilds_reason_index() {
        let h = harness();
        h.checker
            .fail(test_id(10), CheckError::permanent("bad gateway"));
        h.probe.schedule(test_id(10), 1).await.unwrap();
        wait_for_snapshot(&h.probe, |s| s.blacklist.len() == 1).await;

        let bytes = h.probe.serialize().await.unwrap();
        h.probe.shutdown();

        let h2 = harness();
        h2.probe.deserialize(&bytes).await.unwrap();

        // A new proxy failing with the same reason must reuse the restored
        // index instead of appending a duplicate.
        h2.checker
            .fail(test_id(11), CheckError::permanent("bad gateway"));
        h2.probe.schedule(test_id(11), 1).await.unwrap();
        let snapshot = wait_for_snapshot(&h2.probe, |s| s.blacklist.len() == 2).await;
        assert_eq!(snapshot.failures, vec!["bad gateway".to_string()]);
        h2.probe.shutdown();
        h2.pool.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_delete_clears_lifecycle_state() {
        let h = harness();
        let proxy = test_id(12);
        h.checker.fail(proxy, CheckError::permanent("refused"));

        h.probe.schedule(proxy, 1).await.unwrap();
        wait_for_snapshot(&h.probe, |s| s.blacklist.contains_key(&proxy)).await;

        assert!(h.probe.delete(proxy).await.unwrap());
        let snapshot = h.probe.snapshot().await.unwrap();
        assert!(!snapshot.blacklist.contains_key(&proxy));

        // Second delete is a no-op.
        assert!(!h.probe.delete(proxy).await.unwrap());
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_reanimate_makes_blacklisted_proxy_verifiable() {
        let h = harness();
        let proxy = test_id(14);
        h.checker.fail(proxy, CheckError::permanent("refused"));

        h.probe.schedule(proxy, 1).await.unwrap();
        wait_for_snapshot(&h.probe, |s| s.blacklist.contains_key(&proxy)).await;

        assert!(h.probe.reanimate(proxy).await.unwrap());
        let snapshot = h.probe.snapshot().await.unwrap();
        assert!(!snapshot.blacklist.contains_key(&proxy));
        // Attribution and failure history survive reanimation.
        assert!(snapshot.seen_sources.contains_key(&proxy));
        assert_eq!(snapshot.failures.len(), 1);

        // Verifiable again: a fresh schedule now reaches the checker.
        h.checker.ok(proxy, Duration::from_millis(15));
        h.probe.schedule(proxy, 1).await.unwrap();
        wait_for(|| h.pool.is_seen(proxy)).await;
        h.probe.shutdown();
        h.pool.shutdown();
    }

    #[tokio::test]
    async fn test_run_sources_feeds_schedule() {
        struct OneShotSource {
            proxies: Vec<ProxyId>,
        }

        #[async_trait]
        impl Source for OneShotSource {
            fn id(&self) -> SourceId {
                7
            }

            fn frequency(&self) -> Duration {
                Duration::from_secs(3600)
            }

            async fn fetch(&self) -> Result<Vec<ProxyId>> {
                Ok(self.proxies.clone())
            }
        }

        let h = harness();
        h.checker.ok(test_id(13), Duration::from_millis(20));
        let source: Arc<dyn Source> = Arc::new(OneShotSource {
            proxies: vec![test_id(13)],
        });
        h.probe.run_sources(vec![source]);

        wait_for(|| h.pool.is_seen(test_id(13))).await;
        let snapshot = h.probe.snapshot().await.unwrap();
        assert_eq!(snapshot.seen_sources[&test_id(13)], BTreeSet::from([7]));
        h.probe.shutdown();
        h.pool.shutdown();
    }
}
