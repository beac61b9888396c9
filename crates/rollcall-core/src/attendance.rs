//! Attendance events and cooldown-window deduplication.

use crate::matcher::UNKNOWN_LABEL;
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default minimum gap between two attendance events for the same person.
pub const DEFAULT_COOLDOWN_SECS: u64 = 300;

/// A recognized person at an instant. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceEvent {
    label: String,
    timestamp: DateTime<Local>,
}

impl AttendanceEvent {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// The `(label, date, time)` triple a durable store keys on.
    pub fn record(&self) -> AttendanceRecord {
        AttendanceRecord {
            label: self.label.clone(),
            date: self.timestamp.date_naive(),
            time: self.timestamp.time(),
        }
    }
}

/// Calendar projection of an attendance event, in local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub label: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

/// Durable append/query storage for attendance, keyed by `(label, date)`.
pub trait AttendanceStore {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Whether a record for `label` already exists on `date`.
    fn contains(&self, label: &str, date: NaiveDate) -> Result<bool, Self::Error>;

    fn append(&mut self, record: &AttendanceRecord) -> Result<(), Self::Error>;

    /// Records for one date, or all records when `date` is `None`, newest first.
    fn list(&self, date: Option<NaiveDate>) -> Result<Vec<AttendanceRecord>, Self::Error>;
}

/// Result of [`persist`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Written,
    /// The store already had a record for this label on this date.
    AlreadyRecorded,
}

/// Write `record` unless the store already holds one for the same label and date.
///
/// This check is independent of the in-memory cooldown, so restarting the
/// process does not produce a second record for the same day.
pub fn persist<S>(store: &mut S, record: &AttendanceRecord) -> Result<Persisted, S::Error>
where
    S: AttendanceStore + ?Sized,
{
    if store.contains(&record.label, record.date)? {
        tracing::debug!(label = %record.label, date = %record.date, "attendance already recorded today");
        return Ok(Persisted::AlreadyRecorded);
    }
    store.append(record)?;
    tracing::info!(label = %record.label, date = %record.date, time = %record.time, "attendance recorded");
    Ok(Persisted::Written)
}

/// Per-label cooldown state machine.
///
/// A label is *eligible* when it has never fired or its last event is more
/// than `cooldown` old; otherwise it is *suppressed*. Only resolved
/// identities are tracked.
#[derive(Debug)]
pub struct AttendanceDeduplicator {
    cooldown: Duration,
    last_emitted: HashMap<String, DateTime<Local>>,
}

impl AttendanceDeduplicator {
    pub fn new(cooldown: std::time::Duration) -> Self {
        Self {
            cooldown: Duration::from_std(cooldown).unwrap_or(Duration::MAX),
            last_emitted: HashMap::new(),
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(std::time::Duration::from_secs(secs))
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Emit an event for `label` at `now` if the label is eligible.
    ///
    /// Returns `None` while suppressed and for the "Unknown" label.
    pub fn record_if_due(&mut self, label: &str, now: DateTime<Local>) -> Option<AttendanceEvent> {
        if label == UNKNOWN_LABEL {
            return None;
        }

        if let Some(&last) = self.last_emitted.get(label) {
            let elapsed = now.signed_duration_since(last);
            if elapsed <= self.cooldown {
                tracing::trace!(label, elapsed_secs = elapsed.num_seconds(), "attendance suppressed");
                return None;
            }
        }

        self.last_emitted.insert(label.to_string(), now);
        Some(AttendanceEvent {
            label: label.to_string(),
            timestamp: now,
        })
    }

    /// Time of the most recent event emitted for `label`.
    pub fn last_emitted(&self, label: &str) -> Option<DateTime<Local>> {
        self.last_emitted.get(label).copied()
    }
}

impl Default for AttendanceDeduplicator {
    fn default() -> Self {
        Self::from_secs(DEFAULT_COOLDOWN_SECS)
    }
}

/// `Vec`-backed store, for replaying a run without a database.
#[derive(Debug, Default)]
pub struct MemoryAttendanceStore {
    records: Vec<AttendanceRecord>,
}

impl MemoryAttendanceStore {
    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }
}

impl AttendanceStore for MemoryAttendanceStore {
    type Error = std::convert::Infallible;

    fn contains(&self, label: &str, date: NaiveDate) -> Result<bool, Self::Error> {
        Ok(self.records.iter().any(|r| r.label == label && r.date == date))
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<(), Self::Error> {
        self.records.push(record.clone());
        Ok(())
    }

    fn list(&self, date: Option<NaiveDate>) -> Result<Vec<AttendanceRecord>, Self::Error> {
        let mut out: Vec<_> = self
            .records
            .iter()
            .filter(|r| date.map_or(true, |d| r.date == d))
            .cloned()
            .collect();
        out.sort_by(|a, b| (b.date, b.time).cmp(&(a.date, a.time)));
        Ok(out)
    }
}
