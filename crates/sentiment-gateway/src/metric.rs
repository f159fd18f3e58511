use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::ledger::AccountId;

/// Who a response was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Caller {
    Account(AccountId),
    /// No key, or a key that did not resolve.
    Anonymous,
}

type MinuteCounts = HashMap<u64, HashMap<u16, u64>>;

/// Per-minute response status counts for each caller.
#[derive(Default)]
pub struct Metrics {
    counts: Mutex<HashMap<Caller, MinuteCounts>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, caller: Caller, status: u16) {
        self.record_at(caller, status, SystemTime::now());
    }

    pub fn record_at(&self, caller: Caller, status: u16, at: SystemTime) {
        let minute = minute_bucket(at);
        let mut counts = match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *counts
            .entry(caller)
            .or_default()
            .entry(minute)
            .or_default()
            .entry(status)
            .or_insert(0) += 1;
    }

    /// Counts for one caller, keyed by minute then status.
    pub fn snapshot(&self, caller: Caller) -> MinuteCounts {
        let counts = match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        counts.get(&caller).cloned().unwrap_or_default()
    }

    /// Counts for one caller summed over all minutes.
    pub fn totals(&self, caller: Caller) -> HashMap<u16, u64> {
        let mut totals = HashMap::new();
        for per_status in self.snapshot(caller).values() {
            for (status, count) in per_status {
                *totals.entry(*status).or_insert(0) += count;
            }
        }
        totals
    }
}

fn minute_bucket(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        / 60
}
