//! Per-proxy health record and admission decision
//!
//! An `Entry` tracks everything the pool knows about one live proxy: health
//! flags, quarantine state, cumulative counters and per-hour offer/success
//! buckets used for intra-day circuit breaking.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::ProxyId;

/// Timeouts tolerated before a never-succeeding entry is parked indefinitely.
const MAX_TIMEOUTS_WITHOUT_SUCCESS: u64 = 12;

/// Extra slack past the top of the next hour when the hourly circuit breaker
/// trips.
const HOUR_BREAKER_SLACK: chrono::Duration = chrono::Duration::minutes(5);

/// Permanent-removal thresholds applied during shard maintenance sweeps.
#[derive(Debug, Clone, Copy)]
pub struct EvictionThresholds {
    /// Timeout count past which a never-succeeding entry is evicted.
    pub timeouts: u64,
    /// Failure count threshold. Carried for configuration compatibility; the
    /// eviction decision itself only uses timeouts and reanimations.
    pub failures: u64,
    /// Reanimation count past which an entry is evicted regardless of health.
    pub reanimations: u64,
    /// Quarantine applied to heavy-timeout entries that are kept because they
    /// have succeeded at least once.
    pub longer_sleep: Duration,
}

impl Default for EvictionThresholds {
    fn default() -> Self {
        Self {
            timeouts: 30,
            failures: 30,
            reanimations: 10,
            longer_sleep: Duration::from_secs(3600),
        }
    }
}

/// Health record for one proxy in the pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: ProxyId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Quarantine deadline. `None` means not quarantined; an entry can also be
    /// parked indefinitely (`ok == false` with no deadline), which only an
    /// explicit reanimation clears.
    pub reanimate_after: Option<DateTime<Utc>>,
    pub ok: bool,
    /// Measured round-trip during verification.
    pub speed: Duration,
    /// Times the probe reported this proxy as alive.
    pub seen: u64,
    pub timeouts: u64,
    pub offered: u64,
    pub succeed: u64,
    pub reanimated: u64,
    /// Offers per wall-clock hour, for the hourly circuit breaker.
    pub hour_offered: [u64; 24],
    /// Successes per wall-clock hour.
    pub hour_succeed: [u64; 24],
}

impl Entry {
    pub fn new(id: ProxyId, now: DateTime<Utc>, speed: Duration) -> Self {
        Self {
            id,
            first_seen: now,
            last_seen: now,
            reanimate_after: None,
            ok: true,
            speed,
            seen: 1,
            timeouts: 0,
            offered: 0,
            succeed: 0,
            reanimated: 0,
            hour_offered: [0; 24],
            hour_succeed: [0; 24],
        }
    }

    /// Admission decision, called once per candidate before routing.
    ///
    /// Returns `true` when the entry must be skipped. The `offered` counters
    /// are only touched on the admit path; every skip path leaves them alone.
    pub fn consider_skip(&mut self, now: DateTime<Utc>, offer_limit: u64) -> bool {
        if let Some(deadline) = self.reanimate_after {
            if deadline > now {
                return true;
            }
            // Quarantine expired: restore the entry and fall through to the
            // usual admission checks.
            self.reanimate_after = None;
            self.reanimated += 1;
            self.ok = true;
        }

        if !self.ok {
            // Indefinitely parked (or drifted state); only explicit
            // reanimation brings it back.
            return true;
        }

        let hour = now.hour() as usize;
        if self.hour_offered[hour] > offer_limit && self.hour_succeed[hour] == 0 {
            self.ok = false;
            self.reanimate_after = Some(top_of_next_hour(now) + HOUR_BREAKER_SLACK);
            return true;
        }

        if self.timeouts > MAX_TIMEOUTS_WITHOUT_SUCCESS && self.succeed == 0 {
            self.ok = false;
            self.reanimate_after = None;
            return true;
        }

        self.offered += 1;
        self.hour_offered[hour] += 1;
        false
    }

    /// Record a successful routed request.
    ///
    /// `succeed` never exceeds `offered`; drift is self-healed by clamping to
    /// the offered counts.
    pub fn mark_success(&mut self, now: DateTime<Utc>) {
        let hour = now.hour() as usize;
        self.succeed += 1;
        self.hour_succeed[hour] += 1;
        if self.succeed > self.offered {
            self.succeed = self.offered;
        }
        if self.hour_succeed[hour] > self.hour_offered[hour] {
            self.hour_succeed[hour] = self.hour_offered[hour];
        }
        self.ok = true;
        self.last_seen = now;
    }

    /// Record a failed routed request and quarantine briefly.
    pub fn mark_failure(&mut self, now: DateTime<Utc>, timed_out: bool, short_sleep: Duration) {
        self.ok = false;
        self.reanimate_after = Some(now + chrono_duration(short_sleep));
        if timed_out {
            self.timeouts += 1;
        }
    }

    /// Permanent-removal decision for maintenance sweeps.
    pub fn should_evict(&self, thresholds: &EvictionThresholds) -> bool {
        if self.reanimated >= thresholds.reanimations {
            return true;
        }
        if self.timeouts >= thresholds.timeouts && self.succeed == 0 {
            return true;
        }
        false
    }

    /// Explicitly clear quarantine and restore the entry.
    pub fn reanimate(&mut self, now: DateTime<Utc>) {
        self.reanimate_after = None;
        self.ok = true;
        self.reanimated += 1;
        self.last_seen = now;
    }

    pub fn is_quarantined(&self, now: DateTime<Utc>) -> bool {
        match self.reanimate_after {
            Some(deadline) => deadline > now,
            None => !self.ok,
        }
    }
}

fn top_of_next_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    truncated + chrono::Duration::hours(1)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(0))
}
