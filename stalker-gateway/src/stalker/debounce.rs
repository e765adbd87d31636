//! Per-wallet duplicate suppression.
//!
//! A single transaction can surface as several upstream frames (one per log
//! entry touching the wallet). Each wallet keeps a bounded recency set of the
//! transaction identifiers it has already emitted, so at most one outbound
//! event is produced per distinct transaction while memory stays capped.

use std::collections::{HashMap, HashSet, VecDeque};

/// Fixed-capacity FIFO set: ring of identifiers plus a membership index.
#[derive(Debug)]
struct RecentSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl RecentSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert `id`, returning false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct DebounceCache {
    capacity: usize,
    wallets: HashMap<String, RecentSet>,
}

impl DebounceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            wallets: HashMap::new(),
        }
    }

    /// Returns true the first time `tx_identifier` is seen for `wallet`.
    pub fn accept(&mut self, wallet: &str, tx_identifier: &str) -> bool {
        let capacity = self.capacity;
        self.wallets
            .entry(wallet.to_string())
            .or_insert_with(|| RecentSet::new(capacity))
            .insert(tx_identifier)
    }

    /// Drop all remembered identifiers for a wallet that is no longer watched.
    pub fn remove(&mut self, wallet: &str) {
        self.wallets.remove(wallet);
    }

    /// Number of identifiers currently remembered for a wallet
    pub fn tracked(&self, wallet: &str) -> usize {
        self.wallets.get(wallet).map(|s| s.len()).unwrap_or(0)
    }
}
