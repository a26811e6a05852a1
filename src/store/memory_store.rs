//! In-process counter store.
//!
//! Each window lives behind its own `DashMap` shard lock, which makes
//! check-and-record atomic within one process. State is not shared between
//! instances.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{CounterStore, StoreError, WindowKey, WindowOutcome, WindowSnapshot, WindowUsage};
use crate::core::classifier::PolicyTable;
use crate::core::window::{evaluate, window_start, WindowDecision};
use crate::models::{BanRecord, PolicyCategory};
use crate::utils::now_ts;

#[derive(Debug, Default)]
struct WindowState {
    entries: VecDeque<f64>,
    burst_used: u64,
    burst_expires_at: f64,
}

impl WindowState {
    fn trim(&mut self, window_seconds: u64, now: f64) -> u64 {
        let start = window_start(now, window_seconds);
        let before = self.entries.len();
        self.entries.retain(|ts| *ts > start);
        if self.burst_used > 0 && self.burst_expires_at <= now {
            self.burst_used = 0;
        }
        (before - self.entries.len()) as u64
    }

    fn count_since(&self, window_seconds: u64, now: f64) -> u64 {
        let start = window_start(now, window_seconds);
        self.entries.iter().filter(|ts| **ts > start).count() as u64
    }

    fn oldest(&self) -> Option<f64> {
        self.entries.iter().copied().reduce(f64::min)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.burst_used == 0
    }
}

fn trim_log(log: &mut VecDeque<f64>, window_seconds: u64, now: f64) -> u64 {
    let start = window_start(now, window_seconds);
    let before = log.len();
    log.retain(|ts| *ts > start);
    (before - log.len()) as u64
}

/// Counter store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<WindowKey, WindowState>,
    hits: DashMap<String, VecDeque<f64>>,
    bans: DashMap<String, BanRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Purge lapsed windows, hit logs and bans every `every`.
    ///
    /// Nothing else evicts identities that stop sending traffic, so a memory
    /// backed deployment runs this for as long as the server is up.
    pub fn spawn_sweeper(
        store: Arc<Self>,
        max_window_seconds: u64,
        every: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.purge_expired(max_window_seconds, now_ts()).await {
                    Ok(0) => {}
                    Ok(removed) => debug!("Sweep removed {} expired entries", removed),
                    Err(err) => warn!("Memory store sweep failed: {}", err),
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn check_and_record(
        &self,
        key: &WindowKey,
        policy: &PolicyCategory,
        now: f64,
    ) -> Result<WindowOutcome, StoreError> {
        let mut state = self.windows.entry(key.clone()).or_default();
        state.trim(policy.window_seconds, now);

        let current = state.entries.len() as u64;
        let oldest = state.oldest();

        match evaluate(current, state.burst_used, policy) {
            WindowDecision::Deny => Ok(WindowOutcome {
                admitted: false,
                current,
                burst_used: state.burst_used,
                oldest,
            }),
            WindowDecision::Admit { uses_burst } => {
                state.entries.push_back(now);
                if uses_burst {
                    state.burst_used += 1;
                    state.burst_expires_at = now + policy.window_seconds as f64;
                }
                Ok(WindowOutcome {
                    admitted: true,
                    current,
                    burst_used: state.burst_used,
                    oldest: oldest.or(Some(now)),
                })
            }
        }
    }

    async fn window_usage(
        &self,
        key: &WindowKey,
        window_seconds: u64,
        now: f64,
    ) -> Result<WindowUsage, StoreError> {
        let Some(mut state) = self.windows.get_mut(key) else {
            return Ok(WindowUsage::default());
        };
        state.trim(window_seconds, now);
        Ok(WindowUsage {
            current: state.entries.len() as u64,
            burst_used: state.burst_used,
            oldest: state.oldest(),
        })
    }

    async fn reset_window(&self, key: &WindowKey) -> Result<bool, StoreError> {
        Ok(self
            .windows
            .remove(key)
            .map(|(_, state)| !state.is_empty())
            .unwrap_or(false))
    }

    async fn record_hit(
        &self,
        identity: &str,
        window_seconds: u64,
        now: f64,
    ) -> Result<u64, StoreError> {
        let mut log = self.hits.entry(identity.to_string()).or_default();
        log.push_back(now);
        trim_log(&mut log, window_seconds, now);
        Ok(log.len() as u64)
    }

    async fn hit_count(
        &self,
        identity: &str,
        window_seconds: u64,
        now: f64,
    ) -> Result<u64, StoreError> {
        let Some(mut log) = self.hits.get_mut(identity) else {
            return Ok(0);
        };
        trim_log(&mut log, window_seconds, now);
        Ok(log.len() as u64)
    }

    async fn put_ban(&self, record: &BanRecord) -> Result<(), StoreError> {
        self.bans.insert(record.identity.clone(), record.clone());
        Ok(())
    }

    async fn get_ban(&self, identity: &str, now: f64) -> Result<Option<BanRecord>, StoreError> {
        self.bans.remove_if(identity, |_, record| !record.is_active(now));
        Ok(self.bans.get(identity).map(|record| record.clone()))
    }

    async fn delete_ban(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.bans.remove(identity).is_some())
    }

    async fn active_windows(
        &self,
        policies: &PolicyTable,
        now: f64,
    ) -> Result<Vec<WindowSnapshot>, StoreError> {
        Ok(self
            .windows
            .iter()
            .filter_map(|entry| {
                let window_seconds = policies.resolve(&entry.key().category).window_seconds;
                let count = entry.count_since(window_seconds, now);
                (count > 0).then(|| WindowSnapshot {
                    key: entry.key().clone(),
                    count,
                })
            })
            .collect())
    }

    async fn ban_count(&self, now: f64) -> Result<u64, StoreError> {
        Ok(self
            .bans
            .iter()
            .filter(|entry| entry.is_active(now))
            .count() as u64)
    }

    async fn purge_expired(&self, max_window_seconds: u64, now: f64) -> Result<u64, StoreError> {
        let mut removed = 0;

        for mut entry in self.windows.iter_mut() {
            removed += entry.trim(max_window_seconds, now);
        }
        self.windows.retain(|_, state| !state.is_empty());

        for mut entry in self.hits.iter_mut() {
            removed += trim_log(&mut entry, max_window_seconds, now);
        }
        self.hits.retain(|_, log| !log.is_empty());

        let before = self.bans.len();
        self.bans.retain(|_, record| record.is_active(now));
        removed += (before - self.bans.len()) as u64;

        Ok(removed)
    }
}
