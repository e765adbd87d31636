//! Per-wallet activity records and liveness classification.

use chrono::{DateTime, Utc};
use stalker_types::{ActivityState, WalletStatus};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Liveness is a pure function of the time since the last accepted event.
pub fn classify(last_activity: Option<Instant>, now: Instant, threshold: Duration) -> ActivityState {
    match last_activity {
        Some(t) if now.saturating_duration_since(t) < threshold => ActivityState::Active,
        _ => ActivityState::Idle,
    }
}

/// Human readable age used by the dashboard ("12s ago", "4m ago", "2h ago")
pub fn format_age(age: Duration) -> String {
    let secs = age.as_secs();
    if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}

#[derive(Debug, Clone)]
pub struct ActivityRecord {
    /// Monotonic time of the last accepted event, used for classification
    pub last_activity: Option<Instant>,
    /// Wall-clock time of the same event, for display only
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_tx_identifier: Option<String>,
    pub observed_count: u64,
    /// Classification as of the last event or sweep
    state: ActivityState,
}

impl ActivityRecord {
    fn new() -> Self {
        Self {
            last_activity: None,
            last_activity_at: None,
            last_tx_identifier: None,
            observed_count: 0,
            state: ActivityState::Idle,
        }
    }
}

/// Activity records for every watched wallet on one chain.
pub struct ActivityTracker {
    threshold: Duration,
    records: HashMap<String, ActivityRecord>,
}

impl ActivityTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            records: HashMap::new(),
        }
    }

    /// Start tracking a newly watched wallet (no activity yet).
    pub fn track(&mut self, wallet: &str) {
        self.records
            .entry(wallet.to_string())
            .or_insert_with(ActivityRecord::new);
    }

    pub fn remove(&mut self, wallet: &str) {
        self.records.remove(wallet);
    }

    pub fn get(&self, wallet: &str) -> Option<&ActivityRecord> {
        self.records.get(wallet)
    }

    /// Record an accepted (non-duplicate) event and return the new state.
    pub fn record_activity(
        &mut self,
        wallet: &str,
        tx_identifier: &str,
        now: Instant,
        observed_at: DateTime<Utc>,
    ) -> ActivityState {
        let record = self
            .records
            .entry(wallet.to_string())
            .or_insert_with(ActivityRecord::new);
        record.last_activity = Some(now);
        record.last_activity_at = Some(observed_at);
        record.last_tx_identifier = Some(tx_identifier.to_string());
        record.observed_count += 1;
        record.state = classify(record.last_activity, now, self.threshold);
        record.state
    }

    pub fn classify(&self, wallet: &str, now: Instant) -> ActivityState {
        classify(
            self.records.get(wallet).and_then(|r| r.last_activity),
            now,
            self.threshold,
        )
    }

    /// Re-evaluate every wallet and return those that went idle since the
    /// previous evaluation.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let mut went_idle = Vec::new();
        for (wallet, record) in self.records.iter_mut() {
            let state = classify(record.last_activity, now, self.threshold);
            if record.state == ActivityState::Active && state == ActivityState::Idle {
                went_idle.push(wallet.clone());
            }
            record.state = state;
        }
        went_idle
    }

    /// Status view of every tracked wallet, for `status` replies.
    pub fn snapshot(&self, now: Instant) -> BTreeMap<String, WalletStatus> {
        self.records
            .iter()
            .map(|(wallet, record)| {
                let last_activity = match record.last_activity {
                    Some(t) => format_age(now.saturating_duration_since(t)),
                    None => "Never".to_string(),
                };
                let status = WalletStatus {
                    state: classify(record.last_activity, now, self.threshold),
                    last_activity,
                    last_activity_timestamp: record.last_activity_at.map(|t| t.to_rfc3339()),
                    last_tx_identifier: record.last_tx_identifier.clone(),
                    observed_count: record.observed_count,
                };
                (wallet.clone(), status)
            })
            .collect()
    }
}
