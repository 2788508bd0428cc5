//! Per-instance aggregation state
//!
//! One `AggregatorState` per configured derived sensor. It owns the running
//! extremum, the set of contributing sources, and the bookkeeping that gets
//! persisted across restarts. All mutation goes through the instance's
//! coordinator task, so nothing here is locked.

use {
    crate::scheduler::ResetPolicy,
    crate::tracker::{Mode, ValueTracker},
    serde::{Deserialize, Serialize},
    std::collections::HashSet,
    std::time::{SystemTime, UNIX_EPOCH},
};

/// Persistable record for one instance, keyed by the instance name in the
/// state document. `mode`, `source_ids` and `reset_policy` are stored so a
/// restore can detect that the configuration changed underneath the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub extremum: Option<f64>,
    pub extremum_source: Option<String>,
    pub last_value: Option<f64>,
    pub last_source: Option<String>,
    pub unit: Option<String>,
    pub last_reset_at: i64,
    pub mode: Mode,
    pub source_ids: Vec<String>,
    pub reset_policy: ResetPolicy,
}

pub struct AggregatorState {
    name: String,
    tracker: ValueTracker,
    source_ids: HashSet<String>,
    reset_policy: ResetPolicy,
    round_digits: i32,
    last_reset_at: i64,
    /// Source that last moved the extremum
    extremum_source: Option<String>,
    /// Most recent valid sample, whether or not it moved the extremum
    last_value: Option<f64>,
    last_source: Option<String>,
    /// Unit adopted from the first sample that carried one
    unit: Option<String>,
    /// Latched when a sample carries a conflicting unit; the derived value
    /// reads as unknown until restart
    unit_mismatch: bool,
}

impl AggregatorState {
    pub fn new(
        name: String,
        mode: Mode,
        source_ids: HashSet<String>,
        reset_policy: ResetPolicy,
        round_digits: i32,
        created_at: i64,
    ) -> Self {
        Self {
            name,
            tracker: ValueTracker::new(mode),
            source_ids,
            reset_policy,
            round_digits,
            last_reset_at: created_at,
            extremum_source: None,
            last_value: None,
            last_source: None,
            unit: None,
            unit_mismatch: false,
        }
    }

    /// Apply one sample in stream order.
    ///
    /// Samples from sources outside this instance's set are dropped silently.
    /// Returns true when the extremum moved.
    pub fn apply_sample(&mut self, source_id: &str, value: f64, unit: Option<&str>) -> bool {
        if !self.source_ids.contains(source_id) {
            log::debug!("[{}] ignoring sample from unwatched source {}", self.name, source_id);
            return false;
        }

        if let Some(sample_unit) = unit {
            match &self.unit {
                None => self.unit = Some(sample_unit.to_string()),
                Some(adopted) if adopted != sample_unit => {
                    if !self.unit_mismatch {
                        log::warn!(
                            "[{}] unit mismatch: adopted '{}', got '{}' from {}; value unavailable",
                            self.name, adopted, sample_unit, source_id
                        );
                    }
                    self.unit_mismatch = true;
                    return false;
                }
                _ => {}
            }
        }

        let value = round_to(value, self.round_digits);
        self.last_value = Some(value);
        self.last_source = Some(source_id.to_string());

        let changed = self.tracker.update(value);
        if changed {
            self.extremum_source = Some(source_id.to_string());
        }
        changed
    }

    /// Start a new period at `at`. The derived value is absent until the
    /// next sample; `last_value`/`last_source` keep describing the most
    /// recent sample seen.
    pub fn apply_reset(&mut self, at: i64) {
        self.tracker.reset();
        self.extremum_source = None;
        self.last_reset_at = at;
    }

    /// The published derived value. Unknown while no sample has arrived this
    /// period, and while the unit mismatch latch is set.
    pub fn current_value(&self) -> Option<f64> {
        if self.unit_mismatch {
            None
        } else {
            self.tracker.value()
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let mut source_ids: Vec<String> = self.source_ids.iter().cloned().collect();
        source_ids.sort();
        InstanceSnapshot {
            extremum: self.tracker.value(),
            extremum_source: self.extremum_source.clone(),
            last_value: self.last_value,
            last_source: self.last_source.clone(),
            unit: self.unit.clone(),
            last_reset_at: self.last_reset_at,
            mode: self.tracker.mode(),
            source_ids,
            reset_policy: self.reset_policy,
        }
    }

    /// Rehydrate from a persisted record.
    ///
    /// The record must match the configured `mode`, `source_ids` and
    /// `reset_policy`; otherwise the persisted extremum is discarded and the
    /// instance starts fresh with a warning.
    pub fn restore(&mut self, snapshot: InstanceSnapshot) {
        let stored_sources: HashSet<String> = snapshot.source_ids.iter().cloned().collect();
        if snapshot.mode != self.tracker.mode()
            || stored_sources != self.source_ids
            || snapshot.reset_policy != self.reset_policy
        {
            log::warn!(
                "[{}] persisted state does not match configuration, starting fresh",
                self.name
            );
            return;
        }

        self.tracker.seed(snapshot.extremum);
        self.extremum_source = snapshot.extremum_source;
        self.last_value = snapshot.last_value;
        self.last_source = snapshot.last_source;
        self.unit = snapshot.unit;
        self.last_reset_at = snapshot.last_reset_at;
        log::info!(
            "[{}] restored persisted state (value: {:?})",
            self.name,
            self.current_value()
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.tracker.mode()
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset_policy
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn extremum_source(&self) -> Option<&str> {
        self.extremum_source.as_deref()
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    pub fn last_source(&self) -> Option<&str> {
        self.last_source.as_deref()
    }

    pub fn last_reset_at(&self) -> i64 {
        self.last_reset_at
    }

    pub fn count_sensors(&self) -> usize {
        self.source_ids.len()
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Helper to get current Unix timestamp
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
