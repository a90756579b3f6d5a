//! Attendance ledger for one session.
//!
//! Every gallery identity starts `Absent`. The first recognition moves it to
//! `Present` or `Late` depending on the cutoff; both are terminal, so later
//! recognitions leave the record untouched.

use crate::clock::Clock;
use crate::gallery::Gallery;
use crate::types::Identity;
use chrono::{NaiveDate, NaiveTime};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Display / export format for arrival times.
pub const ARRIVAL_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Absent,
    Present,
    Late,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Absent => "absent",
            StatusKind::Present => "present",
            StatusKind::Late => "late",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attendance state; an arrival time exists exactly when it is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Absent,
    Present { at: NaiveTime },
    Late { at: NaiveTime },
}

impl AttendanceStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            AttendanceStatus::Absent => StatusKind::Absent,
            AttendanceStatus::Present { .. } => StatusKind::Present,
            AttendanceStatus::Late { .. } => StatusKind::Late,
        }
    }

    pub fn arrival(&self) -> Option<NaiveTime> {
        match self {
            AttendanceStatus::Absent => None,
            AttendanceStatus::Present { at } | AttendanceStatus::Late { at } => Some(*at),
        }
    }

    pub fn is_recorded(&self) -> bool {
        !matches!(self, AttendanceStatus::Absent)
    }

    /// Arrival formatted as `HH:MM:SS`, empty while absent.
    pub fn arrival_text(&self) -> String {
        self.arrival()
            .map(|t| t.format(ARRIVAL_FORMAT).to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceRecord {
    pub identity: Identity,
    pub status: AttendanceStatus,
}

/// Emitted once, when an identity leaves `Absent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub identity: Identity,
    pub status: StatusKind,
    pub at: NaiveTime,
}

/// What [`AttendanceLedger::record`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Transitioned(TransitionEvent),
    /// Already present or late; nothing changed.
    AlreadyRecorded(AttendanceStatus),
    /// The identity is not part of this session.
    NotEnrolled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub absent: usize,
    pub present: usize,
    pub late: usize,
}

impl LedgerSummary {
    fn of(records: &[AttendanceRecord]) -> Self {
        records.iter().fold(Self::default(), |mut acc, r| {
            match r.status.kind() {
                StatusKind::Absent => acc.absent += 1,
                StatusKind::Present => acc.present += 1,
                StatusKind::Late => acc.late += 1,
            }
            acc
        })
    }
}

/// Per-identity attendance state for one session.
///
/// Mutation needs `&mut self`, so the check-then-transition sequence in
/// [`record`](Self::record) can never interleave with another writer.
#[derive(Debug, Clone)]
pub struct AttendanceLedger {
    records: Vec<AttendanceRecord>,
    index: HashMap<Identity, usize>,
    cutoff: NaiveTime,
}

impl AttendanceLedger {
    /// Start a ledger with every distinct identity absent, in first-seen order.
    pub fn new<I>(identities: I, cutoff: NaiveTime) -> Self
    where
        I: IntoIterator<Item = Identity>,
    {
        let mut records = Vec::new();
        let mut index = HashMap::new();
        for identity in identities {
            if index.contains_key(&identity) {
                continue;
            }
            index.insert(identity.clone(), records.len());
            records.push(AttendanceRecord {
                identity,
                status: AttendanceStatus::Absent,
            });
        }
        Self {
            records,
            index,
            cutoff,
        }
    }

    pub fn from_gallery(gallery: &Gallery, cutoff: NaiveTime) -> Self {
        Self::new(gallery.identities().iter().cloned(), cutoff)
    }

    pub fn cutoff(&self) -> NaiveTime {
        self.cutoff
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&AttendanceRecord> {
        self.index.get(identity).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    /// Apply a recognition of `identity`.
    ///
    /// The clock is read only when the identity is still absent; arriving at
    /// exactly the cutoff counts as present.
    pub fn record<C: Clock + ?Sized>(&mut self, identity: &str, clock: &C) -> RecordOutcome {
        let Some(&i) = self.index.get(identity) else {
            return RecordOutcome::NotEnrolled;
        };
        let record = &mut self.records[i];

        if record.status.is_recorded() {
            return RecordOutcome::AlreadyRecorded(record.status);
        }

        let at = clock.now();
        record.status = if at <= self.cutoff {
            AttendanceStatus::Present { at }
        } else {
            AttendanceStatus::Late { at }
        };

        let event = TransitionEvent {
            identity: record.identity.clone(),
            status: record.status.kind(),
            at,
        };
        tracing::info!(
            identity = %event.identity,
            status = %event.status,
            at = %at.format(ARRIVAL_FORMAT),
            "attendance recorded"
        );
        RecordOutcome::Transitioned(event)
    }

    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary::of(&self.records)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            records: self.records.clone(),
            cutoff: self.cutoff,
        }
    }
}

/// Immutable copy of the ledger, handed to renderers and export sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub records: Vec<AttendanceRecord>,
    pub cutoff: NaiveTime,
}

impl LedgerSnapshot {
    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary::of(&self.records)
    }

    /// One export row per identity, in ledger order, for the given day.
    pub fn export_rows(&self, date: NaiveDate) -> Vec<ExportRow> {
        self.records
            .iter()
            .map(|r| ExportRow {
                date,
                name: r.identity.clone(),
                arrival: r.status.arrival(),
                status: r.status.kind(),
            })
            .collect()
    }
}

/// (date, name, arrival time, status), the shape handed to export sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportRow {
    pub date: NaiveDate,
    pub name: Identity,
    #[serde(serialize_with = "serialize_arrival")]
    pub arrival: Option<NaiveTime>,
    pub status: StatusKind,
}

impl ExportRow {
    pub fn arrival_text(&self) -> String {
        self.arrival
            .map(|t| t.format(ARRIVAL_FORMAT).to_string())
            .unwrap_or_default()
    }
}

fn serialize_arrival<S: Serializer>(arrival: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
    match arrival {
        Some(t) => s.collect_str(&t.format(ARRIVAL_FORMAT)),
        None => s.serialize_str(""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn ledger() -> AttendanceLedger {
        AttendanceLedger::new(["Alice", "Bob", "Alice"].map(Identity::from), hms(7, 30, 0))
    }

    #[test]
    fn test_new_ledger_all_absent_and_deduplicated() {
        let l = ledger();
        assert_eq!(l.len(), 2);
        for r in l.records() {
            assert_eq!(r.status, AttendanceStatus::Absent);
            assert_eq!(r.status.arrival_text(), "");
        }
        assert_eq!(l.summary(), LedgerSummary { absent: 2, present: 0, late: 0 });
    }

    #[test]
    fn test_before_cutoff_is_present() {
        let mut l = ledger();
        let clock = FixedClock::new(hms(7, 29, 59));
        let outcome = l.record("Alice", &clock);

        assert_eq!(
            outcome,
            RecordOutcome::Transitioned(TransitionEvent {
                identity: "Alice".into(),
                status: StatusKind::Present,
                at: hms(7, 29, 59),
            })
        );
        assert_eq!(l.get("Alice").unwrap().status.arrival_text(), "07:29:59");
    }

    #[test]
    fn test_exactly_cutoff_is_present() {
        let mut l = ledger();
        l.record("Alice", &FixedClock::new(hms(7, 30, 0)));
        assert_eq!(l.get("Alice").unwrap().status.kind(), StatusKind::Present);
    }

    #[test]
    fn test_after_cutoff_is_late() {
        let mut l = ledger();
        l.record("Bob", &FixedClock::new(hms(7, 30, 1)));
        assert_eq!(l.get("Bob").unwrap().status, AttendanceStatus::Late { at: hms(7, 30, 1) });
    }

    #[test]
    fn test_second_recognition_is_noop() {
        let mut l = ledger();
        let clock = FixedClock::new(hms(7, 29, 59));
        l.record("Alice", &clock);

        clock.set(hms(9, 0, 0));
        for _ in 0..5 {
            let outcome = l.record("Alice", &clock);
            assert_eq!(
                outcome,
                RecordOutcome::AlreadyRecorded(AttendanceStatus::Present { at: hms(7, 29, 59) })
            );
        }
        assert_eq!(l.get("Alice").unwrap().status.arrival_text(), "07:29:59");
        assert_eq!(l.summary(), LedgerSummary { absent: 1, present: 1, late: 0 });
    }

    #[test]
    fn test_unknown_identity_not_enrolled() {
        let mut l = ledger();
        assert_eq!(l.record("Mallory", &FixedClock::new(hms(7, 0, 0))), RecordOutcome::NotEnrolled);
        assert_eq!(l.summary().absent, 2);
    }

    #[test]
    fn test_export_rows() {
        let mut l = ledger();
        l.record("Bob", &FixedClock::new(hms(8, 5, 9)));
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let rows = l.snapshot().export_rows(date);

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.date == date));
        assert_eq!(rows[0].name.as_str(), "Alice");
        assert_eq!(rows[0].status, StatusKind::Absent);
        assert_eq!(rows[0].arrival_text(), "");
        assert_eq!(rows[1].status, StatusKind::Late);
        assert_eq!(rows[1].arrival_text(), "08:05:09");
    }

    #[test]
    fn test_export_row_serializes_arrival_as_text() {
        let row = ExportRow {
            date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            name: "Alice".into(),
            arrival: Some(NaiveTime::from_hms_milli_opt(7, 1, 2, 500).unwrap()),
            status: StatusKind::Present,
        };
        let v = serde_json::to_value(&row).unwrap();
        assert_eq!(v["arrival"], "07:01:02");
        assert_eq!(v["status"], "present");
        assert_eq!(v["date"], "2026-10-19");
    }
}
