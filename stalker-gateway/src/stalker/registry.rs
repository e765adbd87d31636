//! Reference-counted watch registry for one chain.
//!
//! The registry is the source of truth for "what should be subscribed right
//! now". It is owned by the chain worker task, which serializes every
//! mutation, so client commands can never interleave with a reconnect replay.

use crate::upstream::SubscriptionHandle;
use std::collections::{BTreeSet, HashMap};

/// Result of registering one more watcher for a wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// First watcher: the caller must issue an upstream subscribe
    Added,
    /// Wallet was already watched; no upstream call needed
    AlreadyWatched { watchers: usize },
}

/// Result of releasing one watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwatchOutcome {
    /// Last watcher gone; the live handle (if any) must be unsubscribed
    Released { handle: Option<SubscriptionHandle> },
    StillWatched { watchers: usize },
    NotWatched,
}

#[derive(Debug)]
struct WatchEntry {
    watchers: usize,
    /// Handle on the current upstream link; `None` while disconnected or
    /// before the subscribe ack arrives
    handle: Option<SubscriptionHandle>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    wallets: HashMap<String, WatchEntry>,
    by_handle: HashMap<SubscriptionHandle, String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, wallet: &str) -> WatchOutcome {
        match self.wallets.get_mut(wallet) {
            Some(entry) => {
                entry.watchers += 1;
                WatchOutcome::AlreadyWatched {
                    watchers: entry.watchers,
                }
            }
            None => {
                self.wallets.insert(
                    wallet.to_string(),
                    WatchEntry {
                        watchers: 1,
                        handle: None,
                    },
                );
                WatchOutcome::Added
            }
        }
    }

    /// Undo an `Added` watch whose upstream subscribe was rejected.
    pub fn rollback(&mut self, wallet: &str) {
        if let Some(entry) = self.wallets.remove(wallet) {
            if let Some(handle) = entry.handle {
                self.by_handle.remove(&handle);
            }
        }
    }

    pub fn unwatch(&mut self, wallet: &str) -> UnwatchOutcome {
        let Some(entry) = self.wallets.get_mut(wallet) else {
            return UnwatchOutcome::NotWatched;
        };
        if entry.watchers > 1 {
            entry.watchers -= 1;
            return UnwatchOutcome::StillWatched {
                watchers: entry.watchers,
            };
        }
        let handle = self.wallets.remove(wallet).and_then(|e| e.handle);
        if let Some(h) = &handle {
            self.by_handle.remove(h);
        }
        UnwatchOutcome::Released { handle }
    }

    /// Attach the handle acknowledged by the current link. Returns false if
    /// the wallet is no longer watched.
    pub fn bind(&mut self, wallet: &str, handle: SubscriptionHandle) -> bool {
        let Some(entry) = self.wallets.get_mut(wallet) else {
            return false;
        };
        if let Some(old) = entry.handle.replace(handle.clone()) {
            self.by_handle.remove(&old);
        }
        self.by_handle.insert(handle, wallet.to_string());
        true
    }

    /// Invalidate every handle; called as soon as the link is lost.
    pub fn clear_handles(&mut self) {
        for entry in self.wallets.values_mut() {
            entry.handle = None;
        }
        self.by_handle.clear();
    }

    pub fn handle(&self, wallet: &str) -> Option<&SubscriptionHandle> {
        self.wallets.get(wallet).and_then(|e| e.handle.as_ref())
    }

    pub fn wallet_for_handle(&self, handle: &SubscriptionHandle) -> Option<&str> {
        self.by_handle.get(handle).map(|w| w.as_str())
    }

    pub fn contains(&self, wallet: &str) -> bool {
        self.wallets.contains_key(wallet)
    }

    pub fn list_watched(&self) -> BTreeSet<String> {
        self.wallets.keys().cloned().collect()
    }

    /// Wallets watched but without a live handle (to be replayed)
    pub fn unsubscribed(&self) -> Vec<String> {
        let mut wallets: Vec<String> = self
            .wallets
            .iter()
            .filter(|(_, e)| e.handle.is_none())
            .map(|(w, _)| w.clone())
            .collect();
        wallets.sort();
        wallets
    }

    /// Every live (wallet, handle) pair
    pub fn live_handles(&self) -> Vec<(String, SubscriptionHandle)> {
        self.wallets
            .iter()
            .filter_map(|(w, e)| e.handle.clone().map(|h| (w.clone(), h)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}
