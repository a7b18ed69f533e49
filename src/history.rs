//! Bounded, keyed store of network request records.
//!
//! Records are addressable only by request id.  Lifecycle events merge
//! field-wise into the record for their id; capacity pressure evicts the
//! least-recently-started records; queries return a sorted snapshot and
//! never mutate the store.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::{
    NetworkEventType, NetworkRequestRecord, RequestId, SortDirection, SortField, SortSpec,
    SortUpdate,
};
use crate::rlog;

/// Default record ceiling.  The source this relay replaces shipped two
/// copy-pasted ceilings (100 for the inline viewer, 1000 for the dedicated
/// monitor); capacity is a constructor parameter here and this is the single
/// documented default.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

struct StoredRecord {
    record: NetworkRequestRecord,
    /// Insertion order, used as the deterministic tie-breaker for both
    /// eviction and query sorting.
    seq: u64,
}

/// Bounded network request history with a process-wide default sort order.
pub struct NetworkHistory {
    capacity: usize,
    records: HashMap<RequestId, StoredRecord>,
    sort: SortSpec,
    next_seq: u64,
}

impl NetworkHistory {
    pub fn new(capacity: usize) -> Self {
        NetworkHistory {
            capacity,
            records: HashMap::new(),
            sort: SortSpec::default(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The sort spec unqualified queries use.
    pub fn sort_spec(&self) -> SortSpec {
        self.sort
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Apply one `NETWORK_EVENT` to the store.
    ///
    /// `data` must carry an `id` (except for `CLEAR_NETWORK_HISTORY`);
    /// events without one are dropped with a diagnostic log.  A completion
    /// event for an unseen id inserts a fresh record rather than being lost,
    /// which keeps history coherent under connection replay.
    pub fn record_event(&mut self, event_type: NetworkEventType, data: Value) {
        if event_type == NetworkEventType::ClearNetworkHistory {
            self.clear();
            return;
        }

        if data.get("id").is_none() {
            rlog!("history: dropping {event_type:?} event without id");
            return;
        }
        let update: NetworkRequestRecord = match serde_json::from_value(data) {
            Ok(record) => record,
            Err(error) => {
                rlog!("history: dropping malformed {event_type:?} event: {error}");
                return;
            }
        };

        let id = update.id.clone();
        match event_type {
            NetworkEventType::RequestStarted => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.records.insert(id, StoredRecord { record: update, seq });
            }
            _ => {
                if let Some(existing) = self.records.get_mut(&id) {
                    existing.record.merge_from(update);
                } else {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.records.insert(id, StoredRecord { record: update, seq });
                }
            }
        }

        self.evict_over_capacity();
    }

    /// Reconfigure the default sort order.  Components absent from `update`
    /// keep their current value.
    pub fn set_sort_order(&mut self, update: SortUpdate) {
        if let Some(field) = update.field {
            self.sort.field = field;
        }
        if let Some(direction) = update.direction {
            self.sort.direction = direction;
        }
    }

    /// Sorted snapshot of all current records.  `None` uses the configured
    /// default spec.  Pure read.
    pub fn query(&self, sort: Option<SortSpec>) -> Vec<NetworkRequestRecord> {
        let spec = sort.unwrap_or(self.sort);
        let mut stored: Vec<&StoredRecord> = self.records.values().collect();
        stored.sort_by(|a, b| {
            let ordering = compare_by_field(&a.record, &b.record, spec.field);
            let ordering = match spec.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            ordering.then_with(|| a.seq.cmp(&b.seq))
        });
        stored.into_iter().map(|s| s.record.clone()).collect()
    }

    /// Evict least-recently-started records until at or under capacity.
    /// Eviction never selects by id, only by `startTime` (missing compares
    /// as zero), ties by insertion order.
    fn evict_over_capacity(&mut self) {
        while self.records.len() > self.capacity {
            let oldest = self
                .records
                .iter()
                .min_by(|(_, a), (_, b)| {
                    start_time_of(&a.record)
                        .total_cmp(&start_time_of(&b.record))
                        .then_with(|| a.seq.cmp(&b.seq))
                })
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    rlog!("history: evicting request {}", crate::logging::req_id(&id.to_string()));
                    self.records.remove(&id);
                }
                None => break,
            }
        }
    }
}

impl Default for NetworkHistory {
    fn default() -> Self {
        NetworkHistory::new(DEFAULT_HISTORY_CAPACITY)
    }
}

fn start_time_of(record: &NetworkRequestRecord) -> f64 {
    record.start_time.unwrap_or(0.0)
}

/// Compare two records on one field: numeric comparison when the field is
/// numeric, lexicographic otherwise; a missing value compares as zero/empty.
fn compare_by_field(a: &NetworkRequestRecord, b: &NetworkRequestRecord, field: SortField) -> Ordering {
    match field {
        SortField::Status => numeric(a.status.map(f64::from), b.status.map(f64::from)),
        SortField::StartTime => numeric(a.start_time, b.start_time),
        SortField::EndTime => numeric(a.end_time, b.end_time),
        SortField::Id => match (&a.id, &b.id) {
            (RequestId::Number(x), RequestId::Number(y)) => x.cmp(y),
            (x, y) => x.to_string().cmp(&y.to_string()),
        },
        SortField::Method => string(a.method.as_deref(), b.method.as_deref()),
        SortField::Url => string(a.url.as_deref(), b.url.as_deref()),
    }
}

fn numeric(a: Option<f64>, b: Option<f64>) -> Ordering {
    a.unwrap_or(0.0).total_cmp(&b.unwrap_or(0.0))
}

fn string(a: Option<&str>, b: Option<&str>) -> Ordering {
    a.unwrap_or("").cmp(b.unwrap_or(""))
}
