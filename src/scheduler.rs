//! Interval scheduler: per-sensor downsampling.
//!
//! Sensors push at their own cadence; the scheduler keeps at most one reading
//! per sampling interval for each sensor identity. The interval comes from a
//! global mode (testing or normal) that can be switched while running.
//!
//! Deciding and committing are separate steps. [`IntervalScheduler::admit`]
//! only evaluates; [`IntervalScheduler::confirm`] advances `last_accepted_at`
//! once the reading has been stored, so a failed write never makes a later
//! redelivery of the same reading look stale.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Reading, SensorIdentity};

// ---

/// Global sampling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    Testing,
    Normal,
}

impl SamplingMode {
    // ---
    fn as_u8(self) -> u8 {
        match self {
            SamplingMode::Testing => 0,
            SamplingMode::Normal => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => SamplingMode::Testing,
            _ => SamplingMode::Normal,
        }
    }
}

impl fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingMode::Testing => f.write_str("testing"),
            SamplingMode::Normal => f.write_str("normal"),
        }
    }
}

impl FromStr for SamplingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "testing" | "test" => Ok(SamplingMode::Testing),
            "normal" => Ok(SamplingMode::Normal),
            other => Err(format!("unknown sampling mode '{other}' (expected testing|normal)")),
        }
    }
}

/// Interval lengths for both modes, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    // ---
    pub testing_secs: u64,
    pub normal_secs: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            testing_secs: 10,
            normal_secs: 1800,
        }
    }
}

impl Intervals {
    pub fn for_mode(&self, mode: SamplingMode) -> u64 {
        match mode {
            SamplingMode::Testing => self.testing_secs,
            SamplingMode::Normal => self.normal_secs,
        }
    }
}

/// Scheduler verdict for one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Defer,
}

/// Per-identity policy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingPolicyState {
    // ---
    pub current_interval_seconds: u64,
    pub last_accepted_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct IntervalScheduler {
    // ---
    intervals: Intervals,
    mode: AtomicU8,
    states: Mutex<HashMap<i64, SamplingPolicyState>>,
}

impl IntervalScheduler {
    // ---
    pub fn new(intervals: Intervals, mode: SamplingMode) -> Self {
        // ---
        Self {
            intervals,
            mode: AtomicU8::new(mode.as_u8()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> SamplingMode {
        SamplingMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn intervals(&self) -> Intervals {
        self.intervals
    }

    /// Switch the global mode. Applies to the next reading evaluated for
    /// each identity; stored readings are untouched.
    pub fn set_mode(&self, mode: SamplingMode) -> SamplingMode {
        // ---
        let previous = SamplingMode::from_u8(self.mode.swap(mode.as_u8(), Ordering::AcqRel));
        if previous != mode {
            tracing::info!(
                from = %previous,
                to = %mode,
                interval_secs = self.intervals.for_mode(mode),
                "sampling mode switched"
            );
        }
        previous
    }

    /// Evaluate a reading without committing it.
    pub fn admit(&self, identity: &SensorIdentity, reading: &Reading) -> Decision {
        // ---
        let interval = self.intervals.for_mode(self.mode());
        let mut states = self.lock();
        let state = states.entry(identity.key).or_insert(SamplingPolicyState {
            current_interval_seconds: interval,
            last_accepted_at: None,
        });
        state.current_interval_seconds = interval;

        let Some(last) = state.last_accepted_at else {
            return Decision::Admit;
        };

        let delta = (reading.observed_at - last).num_seconds();
        if delta >= 0 && delta as u64 >= interval {
            Decision::Admit
        } else {
            Decision::Defer
        }
    }

    /// Record that `observed_at` was durably stored for `identity`.
    ///
    /// Never moves `last_accepted_at` backwards.
    pub fn confirm(&self, identity: &SensorIdentity, observed_at: DateTime<Utc>) {
        // ---
        let interval = self.intervals.for_mode(self.mode());
        let mut states = self.lock();
        let state = states.entry(identity.key).or_insert(SamplingPolicyState {
            current_interval_seconds: interval,
            last_accepted_at: None,
        });
        if state.last_accepted_at.map_or(true, |last| observed_at > last) {
            state.last_accepted_at = Some(observed_at);
        }
    }

    /// Seed `last_accepted_at` from storage, e.g. at startup.
    pub fn hydrate<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (i64, DateTime<Utc>)>,
    {
        // ---
        let interval = self.intervals.for_mode(self.mode());
        let mut states = self.lock();
        for (key, last) in entries {
            states.insert(
                key,
                SamplingPolicyState {
                    current_interval_seconds: interval,
                    last_accepted_at: Some(last),
                },
            );
        }
    }

    /// Forget all per-identity state.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn state_of(&self, identity: &SensorIdentity) -> Option<SamplingPolicyState> {
        self.lock().get(&identity.key).copied()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, SamplingPolicyState>> {
        // A panic while holding this lock cannot leave a half-written entry.
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
