use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use log::{debug, warn};
use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::EngineConfig;
use crate::messages::ApplyOutcome;

const LOCK_PROFILE_WARN_MS: u128 = 500;
const LOCK_PROFILE_COOLDOWN_MS: i64 = 1000;
static LOCK_LOG_LAST_MS: Lazy<DashMap<&'static str, i64>> = Lazy::new(DashMap::new);

fn should_emit_lock_log(label: &'static str) -> bool {
    let now = crate::now_epoch_ms();
    if let Some(mut last) = LOCK_LOG_LAST_MS.get_mut(label) {
        if now - *last < LOCK_PROFILE_COOLDOWN_MS {
            return false;
        }
        *last = now;
        true
    } else {
        LOCK_LOG_LAST_MS.insert(label, now);
        true
    }
}

pub struct ProfiledMutexGuard {
    label: &'static str,
    wait_ms: u128,
    acquired_at: Instant,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ProfiledMutexGuard {
    fn drop(&mut self) {
        let hold_ms = self.acquired_at.elapsed().as_millis();
        if (self.wait_ms >= LOCK_PROFILE_WARN_MS || hold_ms >= LOCK_PROFILE_WARN_MS)
            && should_emit_lock_log(self.label)
        {
            warn!(
                "[lock] label={} wait_ms={} hold_ms={}",
                self.label, self.wait_ms, hold_ms
            );
        }
    }
}

/// Counters exposed as a JSON read model; no metrics layer behind them.
#[derive(Default)]
pub struct EngineCounters {
    pub bids_received: AtomicU64,
    pub bids_resolved: AtomicU64,
    pub bids_rejected: AtomicU64,
    pub messages_duplicate: AtomicU64,
    pub escrow_locks: AtomicU64,
    pub escrow_releases: AtomicU64,
    pub escrow_refunds: AtomicU64,
    pub tallies_computed: AtomicU64,
    pub tallies_reused: AtomicU64,
    pub votes_recorded: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "bids": {
                "received": self.bids_received.load(Ordering::Relaxed),
                "resolved": self.bids_resolved.load(Ordering::Relaxed),
                "rejected": self.bids_rejected.load(Ordering::Relaxed),
            },
            "messages": {
                "duplicate": self.messages_duplicate.load(Ordering::Relaxed),
            },
            "escrow": {
                "locks": self.escrow_locks.load(Ordering::Relaxed),
                "releases": self.escrow_releases.load(Ordering::Relaxed),
                "refunds": self.escrow_refunds.load(Ordering::Relaxed),
            },
            "tally": {
                "computed": self.tallies_computed.load(Ordering::Relaxed),
                "reused": self.tallies_reused.load(Ordering::Relaxed),
                "votes": self.votes_recorded.load(Ordering::Relaxed),
            },
        })
    }
}

#[derive(Debug, Clone)]
struct AppliedEntry {
    outcome: ApplyOutcome,
    recorded_at_ms: i64,
}

/// Shared engine state: sharded serialization locks and the in-process
/// applied-message cache in front of the MessageStore journal.
pub struct MarketState {
    cfg: EngineConfig,
    chain_mutexes: Vec<Arc<Mutex<()>>>,
    tally_mutexes: Vec<Arc<Mutex<()>>>,
    // Separate shard vector from chain_mutexes: message locks are held
    // across dispatch, which takes chain locks underneath.
    message_mutexes: Vec<Arc<Mutex<()>>>,
    applied: DashMap<String, AppliedEntry>,
    pub counters: EngineCounters,
}

impl MarketState {
    pub fn new(cfg: EngineConfig) -> Self {
        let chain_mutexes = (0..cfg.chain_lock_shards.max(1))
            .map(|_| Arc::new(Mutex::new(())))
            .collect();
        let tally_mutexes = (0..cfg.tally_lock_shards.max(1))
            .map(|_| Arc::new(Mutex::new(())))
            .collect();
        let message_mutexes = (0..cfg.chain_lock_shards.max(1))
            .map(|_| Arc::new(Mutex::new(())))
            .collect();
        Self {
            cfg,
            chain_mutexes,
            tally_mutexes,
            message_mutexes,
            applied: DashMap::new(),
            counters: EngineCounters::default(),
        }
    }

    fn shard_index(key: i64, shard_count: usize) -> usize {
        if shard_count == 0 {
            return 0;
        }
        (key.unsigned_abs() as usize) % shard_count
    }

    /// Serializes mutation of one bid chain: concurrent resolutions of the
    /// same root BID line up here before the store's conditional write.
    pub async fn lock_chain(&self, root_bid_id: i64) -> ProfiledMutexGuard {
        let idx = Self::shard_index(root_bid_id, self.chain_mutexes.len());
        let wait_started = Instant::now();
        let guard = self.chain_mutexes[idx].clone().lock_owned().await;
        ProfiledMutexGuard {
            label: "state.lock_chain",
            wait_ms: wait_started.elapsed().as_millis(),
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    /// Serializes tally computation per (proposal, snapshot block) key;
    /// different keys proceed in parallel modulo shard collisions.
    pub async fn lock_tally(&self, proposal_id: i64, block: i64) -> ProfiledMutexGuard {
        let key = proposal_id.wrapping_mul(1_000_003).wrapping_add(block);
        let idx = Self::shard_index(key, self.tally_mutexes.len());
        let wait_started = Instant::now();
        let guard = self.tally_mutexes[idx].clone().lock_owned().await;
        ProfiledMutexGuard {
            label: "state.lock_tally",
            wait_ms: wait_started.elapsed().as_millis(),
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    /// Serializes application of one msgid so concurrent deliveries of
    /// the same message line up instead of racing the journal.
    pub async fn lock_message(&self, msgid: &str) -> ProfiledMutexGuard {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        msgid.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.message_mutexes.len();
        let wait_started = Instant::now();
        let guard = self.message_mutexes[idx].clone().lock_owned().await;
        ProfiledMutexGuard {
            label: "state.lock_message",
            wait_ms: wait_started.elapsed().as_millis(),
            acquired_at: Instant::now(),
            _guard: guard,
        }
    }

    pub fn cached_outcome(&self, msgid: &str) -> Option<ApplyOutcome> {
        self.applied.get(msgid).map(|e| e.outcome.clone())
    }

    pub fn cache_outcome(&self, msgid: &str, outcome: &ApplyOutcome) {
        self.applied.insert(
            msgid.to_string(),
            AppliedEntry { outcome: outcome.clone(), recorded_at_ms: crate::now_epoch_ms() },
        );
    }

    /// Drops cache entries older than the configured TTL; the durable
    /// journal in the store is unaffected.
    pub fn prune_applied_cache(&self) -> usize {
        let cutoff = crate::now_epoch_ms() - self.cfg.applied_ttl_ms;
        let stale: Vec<String> = self
            .applied
            .iter()
            .filter_map(|kv| {
                if kv.value().recorded_at_ms < cutoff {
                    Some(kv.key().clone())
                } else {
                    None
                }
            })
            .collect();
        let n = stale.len();
        for k in stale {
            self.applied.remove(&k);
        }
        n
    }

    pub fn search_page_max(&self) -> usize {
        self.cfg.search_page_max
    }
}

/// Periodic sweep of the applied-message cache.
pub fn spawn_applied_cache_pruner(
    state: Arc<MarketState>,
    every: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let pruned = state.prune_applied_cache();
            if pruned > 0 {
                debug!("[state] pruned applied cache entries={}", pruned);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_ttl(ttl_ms: i64) -> MarketState {
        MarketState::new(EngineConfig { applied_ttl_ms: ttl_ms, ..EngineConfig::default() })
    }

    #[test]
    fn cached_outcomes_round_trip() {
        let state = state_with_ttl(60_000);
        let outcome = ApplyOutcome::BidOpened { bid_id: 7 };
        assert!(state.cached_outcome("m1").is_none());
        state.cache_outcome("m1", &outcome);
        assert_eq!(state.cached_outcome("m1"), Some(outcome));
    }

    #[test]
    fn prune_respects_the_ttl() {
        let fresh = state_with_ttl(60_000);
        fresh.cache_outcome("m1", &ApplyOutcome::BidOpened { bid_id: 1 });
        assert_eq!(fresh.prune_applied_cache(), 0);
        assert!(fresh.cached_outcome("m1").is_some());

        // A negative TTL puts the cutoff in the future; everything is stale.
        let stale = state_with_ttl(-1);
        stale.cache_outcome("m1", &ApplyOutcome::BidOpened { bid_id: 1 });
        assert_eq!(stale.prune_applied_cache(), 1);
        assert!(stale.cached_outcome("m1").is_none());
    }
}
