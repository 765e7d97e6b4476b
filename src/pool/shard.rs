//! Shard actor: single-threaded partition of the pool
//!
//! Each shard owns a disjoint set of entries and serializes every state
//! change through a typed command mailbox. Selection, health transitions and
//! the eviction sweep all happen on the shard's own task; the only thing that
//! leaves it is the outbound call, which runs on the pool-wide executors.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::error::{CarouselError, Result, POOL_EXHAUSTED_STATUS};
use crate::models::{Entry, EvictionThresholds, ProxyId};
use crate::persist::Heartbeat;
use crate::pool::outbound::ProxyRequest;

/// Attempts a single serial may burn before the shard answers with a
/// terminal 429.
pub const MAX_ATTEMPTS_PER_SERIAL: u64 = 10;

const SHARD_MAILBOX: usize = 256;

pub const HEADER_THROUGH_PROXY: &str = "x-through-proxy";
pub const HEADER_ATTEMPT: &str = "x-attempt";
pub const HEADER_OFFERED: &str = "x-offered";
pub const HEADER_SUCCEEDED: &str = "x-succeeded";
pub const HEADER_SERIAL: &str = "x-serial";

/// Per-shard tuning knobs.
#[derive(Debug, Clone)]
pub struct ShardSettings {
    pub offer_limit: u64,
    pub short_sleep: Duration,
    pub eviction: EvictionThresholds,
    pub maintenance_interval: Duration,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            offer_limit: 3,
            short_sleep: Duration::from_secs(300),
            eviction: EvictionThresholds::default(),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// What a shard hands back for one routing attempt.
#[derive(Debug)]
pub enum ShardReply {
    /// A real upstream response, or a synthesized in-band 552/429.
    Response(Response<Full<Bytes>>),
    /// Empty outcome: the router should try another shard.
    Retry,
}

pub(crate) struct RouteJob {
    pub request: ProxyRequest,
    pub serial: u64,
    pub attempt: u64,
    pub reply: oneshot::Sender<ShardReply>,
}

/// Unit of work consumed by the pool-wide executors.
pub(crate) struct ExecutorJob {
    pub proxy: ProxyId,
    pub request: ProxyRequest,
    pub serial: u64,
    pub attempt: u64,
    pub reply: oneshot::Sender<ShardReply>,
    /// Route the outcome back to the owning shard.
    pub outcome_tx: mpsc::Sender<ShardCommand>,
}

/// Fat command record: the shard's only interface.
pub(crate) enum ShardCommand {
    Add(Entry),
    Remove(ProxyId, oneshot::Sender<bool>),
    Route(RouteJob),
    Outcome {
        proxy: ProxyId,
        serial: u64,
        attempt: u64,
        result: Result<Response<Full<Bytes>>>,
        reply: oneshot::Sender<ShardReply>,
    },
    Snapshot(oneshot::Sender<Vec<Entry>>),
    Reanimate(ProxyId, oneshot::Sender<bool>),
    Drain(oneshot::Sender<Vec<ProxyId>>),
}

/// Handle to one shard actor.
#[derive(Clone)]
pub struct ShardHandle {
    tx: mpsc::Sender<ShardCommand>,
}

impl ShardHandle {
    pub(crate) fn spawn(
        index: usize,
        settings: ShardSettings,
        clock: SharedClock,
        work_tx: mpsc::Sender<ExecutorJob>,
        heartbeat: Heartbeat,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(SHARD_MAILBOX);
        let state = ShardState {
            index,
            settings,
            clock,
            work_tx,
            self_tx: tx.clone(),
            heartbeat,
            shutdown: shutdown.clone(),
            entries: Vec::new(),
            evicted: Vec::new(),
        };
        tokio::spawn(run(state, rx, shutdown));
        Self { tx }
    }

    pub async fn add(&self, entry: Entry) -> Result<()> {
        self.tx
            .send(ShardCommand::Add(entry))
            .await
            .map_err(|_| CarouselError::ChannelClosed("shard"))
    }

    pub async fn remove(&self, id: ProxyId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ShardCommand::Remove(id, tx))
            .await
            .map_err(|_| CarouselError::ChannelClosed("shard"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("shard reply"))
    }

    pub(crate) async fn route(
        &self,
        request: ProxyRequest,
        serial: u64,
        attempt: u64,
    ) -> Result<ShardReply> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ShardCommand::Route(RouteJob {
                request,
                serial,
                attempt,
                reply: tx,
            }))
            .await
            .map_err(|_| CarouselError::ChannelClosed("shard"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("shard reply"))
    }

    pub async fn snapshot(&self) -> Result<Vec<Entry>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ShardCommand::Snapshot(tx))
            .await
            .map_err(|_| CarouselError::ChannelClosed("shard"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("shard reply"))
    }

    pub async fn reanimate(&self, id: ProxyId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ShardCommand::Reanimate(id, tx))
            .await
            .map_err(|_| CarouselError::ChannelClosed("shard"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("shard reply"))
    }

    /// Drain the outbox of identifiers evicted since the last call.
    pub async fn drain_evicted(&self) -> Result<Vec<ProxyId>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ShardCommand::Drain(tx))
            .await
            .map_err(|_| CarouselError::ChannelClosed("shard"))?;
        rx.await
            .map_err(|_| CarouselError::ChannelClosed("shard reply"))
    }
}

struct ShardState {
    index: usize,
    settings: ShardSettings,
    clock: SharedClock,
    work_tx: mpsc::Sender<ExecutorJob>,
    self_tx: mpsc::Sender<ShardCommand>,
    heartbeat: Heartbeat,
    shutdown: watch::Receiver<bool>,
    entries: Vec<Entry>,
    evicted: Vec<ProxyId>,
}

async fn run(
    mut state: ShardState,
    mut rx: mpsc::Receiver<ShardCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(state.settings.maintenance_interval);
    tick.tick().await; // Skip immediate tick

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                state.handle(cmd);
            }
            _ = tick.tick() => {
                state.maintenance();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(shard = state.index, "shard shutting down");
                    break;
                }
            }
        }
    }
}

impl ShardState {
    fn handle(&mut self, cmd: ShardCommand) {
        match cmd {
            ShardCommand::Add(entry) => self.handle_add(entry),
            ShardCommand::Remove(id, reply) => {
                let _ = reply.send(self.handle_remove(id));
            }
            ShardCommand::Route(job) => self.handle_route(job),
            ShardCommand::Outcome {
                proxy,
                serial,
                attempt,
                result,
                reply,
            } => self.handle_outcome(proxy, serial, attempt, result, reply),
            ShardCommand::Snapshot(reply) => {
                let _ = reply.send(self.entries.clone());
            }
            ShardCommand::Reanimate(id, reply) => {
                let _ = reply.send(self.handle_reanimate(id));
            }
            ShardCommand::Drain(reply) => {
                let _ = reply.send(std::mem::take(&mut self.evicted));
            }
        }
    }

    fn handle_add(&mut self, entry: Entry) {
        let now = self.clock.now();
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                existing.seen += 1;
                existing.speed = entry.speed;
                existing.last_seen = now;
                existing.ok = true;
                existing.reanimate_after = None;
            }
            None => self.entries.push(entry),
        }
        (self.heartbeat)();
    }

    fn handle_remove(&mut self, id: ProxyId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            (self.heartbeat)();
        }
        removed
    }

    fn handle_reanimate(&mut self, id: ProxyId) -> bool {
        let now = self.clock.now();
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.reanimate(now);
                (self.heartbeat)();
                true
            }
            None => false,
        }
    }

    fn handle_route(&mut self, job: RouteJob) {
        let Some(proxy) = self.first_available() else {
            let _ = job
                .reply
                .send(ShardReply::Response(exhausted_response(job.serial, job.attempt)));
            return;
        };

        let exec = ExecutorJob {
            proxy,
            request: job.request,
            serial: job.serial,
            attempt: job.attempt,
            reply: job.reply,
            outcome_tx: self.self_tx.clone(),
        };

        // Dispatch through a detached task so a full work queue never stalls
        // the mailbox loop; the task is bounded by shutdown.
        let work_tx = self.work_tx.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = work_tx.send(exec) => {
                    if res.is_err() {
                        debug!("work queue closed while dispatching");
                    }
                }
                _ = shutdown.changed() => {}
            }
        });
    }

    /// Pick a uniformly random offset and scan forward from there. The scan
    /// runs to the end of the partition only; entries before the offset wait
    /// for a later call. This no-wrap behavior is long-standing and kept
    /// as-is.
    fn first_available(&mut self) -> Option<ProxyId> {
        if self.entries.is_empty() {
            return None;
        }
        let now = self.clock.now();
        let offer_limit = self.settings.offer_limit;
        let start = rand::thread_rng().gen_range(0..self.entries.len());
        for entry in self.entries[start..].iter_mut() {
            if !entry.consider_skip(now, offer_limit) {
                return Some(entry.id);
            }
        }
        None
    }

    fn handle_outcome(
        &mut self,
        proxy: ProxyId,
        serial: u64,
        attempt: u64,
        result: Result<Response<Full<Bytes>>>,
        reply: oneshot::Sender<ShardReply>,
    ) {
        let now = self.clock.now();

        // Any transport error or status >= 400 counts as failure.
        let failure = match result {
            Ok(resp) if resp.status().as_u16() < 400 => {
                if let Some(entry) = self.entries.iter_mut().find(|e| e.id == proxy) {
                    entry.mark_success(now);
                    let resp = stamp_headers(resp, entry, serial, attempt);
                    (self.heartbeat)();
                    let _ = reply.send(ShardReply::Response(resp));
                } else {
                    // Entry evicted while the call was in flight; the
                    // response is still good.
                    let _ = reply.send(ShardReply::Response(resp));
                }
                return;
            }
            Ok(resp) => (
                CarouselError::TransientProxyFailure(format!("upstream status {}", resp.status()))
                    .to_string(),
                false,
            ),
            Err(e) => {
                let timed_out = e.is_timeout();
                (e.to_string(), timed_out)
            }
        };
        let (text, timed_out) = failure;

        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == proxy) {
            entry.mark_failure(now, timed_out, self.settings.short_sleep);
            (self.heartbeat)();
        }

        if attempt + 1 >= MAX_ATTEMPTS_PER_SERIAL {
            warn!(
                shard = self.index,
                serial, attempt, %text, "serial exhausted its attempt budget"
            );
            let _ = reply.send(ShardReply::Response(attempts_exhausted_response(
                serial, attempt, &text,
            )));
        } else {
            let _ = reply.send(ShardReply::Retry);
        }
    }

    /// Minute sweep: restore expired quarantines, evict hopeless entries,
    /// park heavy-timeout survivors for the longer sleep.
    fn maintenance(&mut self) {
        let now = self.clock.now();
        let thresholds = self.settings.eviction;
        let mut changed = false;

        for entry in &mut self.entries {
            if let Some(deadline) = entry.reanimate_after {
                if deadline <= now {
                    entry.reanimate(now);
                    changed = true;
                }
            }
        }

        let mut kept = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            if entry.should_evict(&thresholds) {
                debug!(shard = self.index, proxy = %entry.id, "evicting entry");
                self.evicted.push(entry.id);
                changed = true;
            } else {
                if entry.ok && entry.timeouts >= thresholds.timeouts && entry.reanimate_after.is_none()
                {
                    entry.ok = false;
                    entry.reanimate_after =
                        Some(now + chrono::Duration::from_std(thresholds.longer_sleep)
                            .unwrap_or_else(|_| chrono::Duration::seconds(0)));
                    changed = true;
                }
                kept.push(entry);
            }
        }
        self.entries = kept;

        if changed {
            (self.heartbeat)();
        }
    }
}

fn exhausted_response(serial: u64, attempt: u64) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::from_u16(POOL_EXHAUSTED_STATUS).unwrap())
        .header(HEADER_SERIAL, serial)
        .header(HEADER_ATTEMPT, attempt)
        .body(Full::new(Bytes::from_static(b"pool exhausted")))
        .unwrap()
}

fn attempts_exhausted_response(serial: u64, attempt: u64, text: &str) -> Response<Full<Bytes>> {
    let body = format!(
        "{}: {}",
        CarouselError::AllAttemptsFailed {
            serial,
            attempts: attempt + 1,
        },
        text
    );
    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header(HEADER_SERIAL, serial)
        .header(HEADER_ATTEMPT, attempt)
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn stamp_headers(
    mut resp: Response<Full<Bytes>>,
    entry: &Entry,
    serial: u64,
    attempt: u64,
) -> Response<Full<Bytes>> {
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&entry.id.url()) {
        headers.insert(HEADER_THROUGH_PROXY, v);
    }
    headers.insert(HEADER_ATTEMPT, HeaderValue::from(attempt));
    headers.insert(HEADER_OFFERED, HeaderValue::from(entry.offered));
    headers.insert(HEADER_SUCCEEDED, HeaderValue::from(entry.succeed));
    headers.insert(HEADER_SERIAL, HeaderValue::from(serial));
    resp
}
