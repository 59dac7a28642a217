//! Time-windowed request history.
//!
//! The ledger is a plain data structure: it stores completed
//! [`RequestRecord`]s plus in-flight reservations and answers window queries
//! by timestamp. Locking is the owner's responsibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

/// Records older than this are pruned.
pub const LEDGER_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Logical class of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestCategory {
    Search,
    Profile,
    PostDetail,
    Generic,
}

impl RequestCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestCategory::Search => "search",
            RequestCategory::Profile => "profile",
            RequestCategory::PostDetail => "post_detail",
            RequestCategory::Generic => "generic",
        }
    }
}

impl fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completed request. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub timestamp: DateTime<Utc>,
    pub category: RequestCategory,
    pub success: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    scheduled_at: DateTime<Utc>,
    category: RequestCategory,
}

/// Handle for a slot reserved ahead of execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(u64);

#[derive(Debug, Default)]
pub struct RequestLedger {
    records: VecDeque<RequestRecord>,
    pending: HashMap<ReservationId, PendingEntry>,
    next_id: u64,
    last_request: Option<DateTime<Utc>>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops completed records older than [`LEDGER_RETENTION`].
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - chrono::Duration::seconds(LEDGER_RETENTION.as_secs() as i64);
        self.records.retain(|record| record.timestamp > horizon);
    }

    /// Number of completed and in-flight requests stamped after `since`.
    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        let completed = self
            .records
            .iter()
            .filter(|record| record.timestamp > since)
            .count();
        let in_flight = self
            .pending
            .values()
            .filter(|entry| entry.scheduled_at > since)
            .count();
        completed + in_flight
    }

    /// Earliest timestamp after `since`, across completed and in-flight requests.
    ///
    /// Completion order is not timestamp order, so this scans instead of
    /// peeking at the front of the queue.
    pub fn oldest_since(&self, since: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let completed = self
            .records
            .iter()
            .map(|record| record.timestamp)
            .filter(|ts| *ts > since);
        let in_flight = self
            .pending
            .values()
            .map(|entry| entry.scheduled_at)
            .filter(|ts| *ts > since);
        completed.chain(in_flight).min()
    }

    pub fn last_request(&self) -> Option<DateTime<Utc>> {
        self.last_request
    }

    /// Claims a slot for a request that will start at `scheduled_at`.
    pub fn reserve(&mut self, category: RequestCategory, scheduled_at: DateTime<Utc>) -> ReservationId {
        let id = ReservationId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.pending.insert(id, PendingEntry { scheduled_at, category });
        self.last_request = Some(match self.last_request {
            Some(prev) if prev > scheduled_at => prev,
            _ => scheduled_at,
        });
        id
    }

    /// Converts a reservation into a completed record.
    ///
    /// Unknown ids are ignored so a double completion cannot append twice.
    pub fn complete(
        &mut self,
        id: ReservationId,
        started_at: DateTime<Utc>,
        success: bool,
        duration: Duration,
    ) -> Option<RequestRecord> {
        let entry = self.pending.remove(&id)?;
        let record = RequestRecord {
            timestamp: started_at,
            category: entry.category,
            success,
            duration,
        };
        self.records.push_back(record.clone());
        Some(record)
    }

    /// Appends an already completed record.
    pub fn push(&mut self, record: RequestRecord) {
        self.last_request = Some(match self.last_request {
            Some(prev) if prev > record.timestamp => prev,
            _ => record.timestamp,
        });
        self.records.push_back(record);
    }

    pub fn records(&self) -> impl Iterator<Item = &RequestRecord> {
        self.records.iter()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn record(ts: DateTime<Utc>) -> RequestRecord {
        RequestRecord {
            timestamp: ts,
            category: RequestCategory::Search,
            success: true,
            duration: Duration::from_millis(120),
        }
    }

    #[test]
    fn windows_use_timestamps_not_insertion_order() {
        let mut ledger = RequestLedger::new();
        ledger.push(record(at(50)));
        ledger.push(record(at(10)));
        ledger.push(record(at(30)));

        assert_eq!(ledger.count_since(at(20)), 2);
        assert_eq!(ledger.oldest_since(at(0)), Some(at(10)));
        assert_eq!(ledger.oldest_since(at(20)), Some(at(30)));
        assert_eq!(ledger.last_request(), Some(at(50)));
    }

    #[test]
    fn reservations_count_until_completed() {
        let mut ledger = RequestLedger::new();
        let id = ledger.reserve(RequestCategory::Profile, at(5));
        assert_eq!(ledger.count_since(at(0)), 1);
        assert_eq!(ledger.pending(), 1);

        let stored = ledger
            .complete(id, at(6), false, Duration::from_millis(40))
            .expect("record");
        assert_eq!(stored.category, RequestCategory::Profile);
        assert!(!stored.success);
        assert_eq!(ledger.pending(), 0);
        assert_eq!(ledger.count_since(at(0)), 1);
        assert!(ledger.complete(id, at(7), true, Duration::ZERO).is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn prunes_after_a_day() {
        let mut ledger = RequestLedger::new();
        ledger.push(record(at(0)));
        ledger.push(record(at(3600)));
        ledger.prune(at(24 * 3600 + 1));
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.is_empty());
    }
}
