//! Fixed-size slot table implementing the connection census.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{LimitsError, Result};
use crate::limits::{Census, CensusEntry, Clock, SystemClock};

/// Errors that can occur in scoreboard operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScoreboardError {
    #[error("all {0} worker slots are busy")]
    Full(usize),
}

/// Upper bounds on worker slots, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreboardConfig {
    /// Number of server processes (outer dimension)
    #[serde(default = "default_server_limit")]
    pub server_limit: u32,
    /// Number of threads per server (inner dimension)
    #[serde(default = "default_thread_limit")]
    pub thread_limit: u32,
    /// Seconds a slot may stay occupied before it is reclaimed, 0 to never
    /// reclaim
    #[serde(default = "default_slot_ttl_secs")]
    pub slot_ttl_secs: u64,
}

impl Default for ScoreboardConfig {
    fn default() -> Self {
        Self {
            server_limit: default_server_limit(),
            thread_limit: default_thread_limit(),
            slot_ttl_secs: default_slot_ttl_secs(),
        }
    }
}

fn default_server_limit() -> u32 {
    16
}

fn default_thread_limit() -> u32 {
    64
}

fn default_slot_ttl_secs() -> u64 {
    600
}

impl ScoreboardConfig {
    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.server_limit as usize * self.thread_limit as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_limit == 0 || self.thread_limit == 0 {
            return Err(LimitsError::Config(format!(
                "scoreboard bounds must be at least 1 (server_limit: {}, thread_limit: {})",
                self.server_limit, self.thread_limit
            )));
        }
        Ok(())
    }
}

/// Handle to one occupancy of a slot.
///
/// The generation changes every time the slot is handed out, so a handle
/// from an earlier occupancy cannot release a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub server: u32,
    pub thread: u32,
    pub generation: u64,
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.server, self.thread, self.generation)
    }
}

#[derive(Debug, Clone)]
struct Occupant {
    entry: CensusEntry,
    occupied_at: u64,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    occupant: Option<Occupant>,
    // Zero until the first occupancy
    generation: u64,
}

/// The table of worker slots.
///
/// Slots are handed out in server-major order, which is also the order the
/// census is reported in. A slot held longer than `slot_ttl_secs` no longer
/// counts and is reused by the next `occupy`.
pub struct Scoreboard {
    config: ScoreboardConfig,
    clock: Arc<dyn Clock>,
    slots: RwLock<Vec<Slot>>,
}

impl Scoreboard {
    /// Create an empty scoreboard with the given bounds.
    pub fn new(config: ScoreboardConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ScoreboardConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            slots: RwLock::new(vec![Slot::default(); config.capacity()]),
        })
    }

    pub fn config(&self) -> ScoreboardConfig {
        self.config
    }

    /// Mark the first idle or expired slot as serving `client_address` for
    /// `virtual_host`.
    pub fn occupy(
        &self,
        client_address: &str,
        virtual_host: &str,
    ) -> std::result::Result<SlotId, ScoreboardError> {
        let now = self.clock.now();
        let mut slots = self.slots.write();
        let free = slots.iter().position(|slot| match &slot.occupant {
            None => true,
            Some(occupant) => self.is_expired(occupant, now),
        });
        let Some(index) = free else {
            warn!(capacity = slots.len(), "Scoreboard full");
            return Err(ScoreboardError::Full(slots.len()));
        };

        let slot = &mut slots[index];
        if let Some(stale) = slot.occupant.take() {
            warn!(
                slot = %self.slot_id(index, slot.generation),
                client = %stale.entry.client_address,
                vhost = %stale.entry.virtual_host,
                age_secs = now.saturating_sub(stale.occupied_at),
                "Reclaiming expired slot"
            );
        }

        slot.generation = slot.generation.wrapping_add(1);
        slot.occupant = Some(Occupant {
            entry: CensusEntry::new(client_address, virtual_host),
            occupied_at: now,
        });

        let id = self.slot_id(index, slot.generation);
        debug!(slot = %id, client = client_address, vhost = virtual_host, "Slot occupied");
        Ok(id)
    }

    /// Return a slot to the idle state.
    ///
    /// Returns `false` if the slot does not exist, is idle, or has been handed
    /// out again since `slot` was issued.
    pub fn release(&self, slot: SlotId) -> bool {
        let Some(index) = self.index(slot) else {
            return false;
        };

        let mut slots = self.slots.write();
        let current = &mut slots[index];
        if current.generation != slot.generation || current.occupant.is_none() {
            debug!(slot = %slot, current_generation = current.generation, "Slot not held by this handle");
            return false;
        }

        current.occupant = None;
        debug!(slot = %slot, "Slot released");
        true
    }

    /// Number of busy, unexpired slots.
    pub fn busy(&self) -> usize {
        let now = self.clock.now();
        self.slots
            .read()
            .iter()
            .filter_map(|slot| slot.occupant.as_ref())
            .filter(|occupant| !self.is_expired(occupant, now))
            .count()
    }

    fn is_expired(&self, occupant: &Occupant, now: u64) -> bool {
        self.config.slot_ttl_secs > 0
            && now.saturating_sub(occupant.occupied_at) > self.config.slot_ttl_secs
    }

    fn slot_id(&self, index: usize, generation: u64) -> SlotId {
        let threads = self.config.thread_limit as usize;
        SlotId {
            server: (index / threads) as u32,
            thread: (index % threads) as u32,
            generation,
        }
    }

    fn index(&self, slot: SlotId) -> Option<usize> {
        if slot.server >= self.config.server_limit || slot.thread >= self.config.thread_limit {
            return None;
        }
        Some(slot.server as usize * self.config.thread_limit as usize + slot.thread as usize)
    }
}

impl Census for Scoreboard {
    fn snapshot(&self) -> Vec<CensusEntry> {
        let now = self.clock.now();
        self.slots
            .read()
            .iter()
            .filter_map(|slot| slot.occupant.as_ref())
            .filter(|occupant| !self.is_expired(occupant, now))
            .map(|occupant| occupant.entry.clone())
            .collect()
    }
}

impl fmt::Debug for Scoreboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scoreboard")
            .field("config", &self.config)
            .field("busy", &self.busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn new(now: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(now)))
        }

        fn set(&self, now: u64) {
            self.0.store(now, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn board(server_limit: u32, thread_limit: u32) -> Scoreboard {
        Scoreboard::new(ScoreboardConfig {
            server_limit,
            thread_limit,
            ..ScoreboardConfig::default()
        })
        .unwrap()
    }

    fn board_with_ttl(thread_limit: u32, slot_ttl_secs: u64, clock: Arc<ManualClock>) -> Scoreboard {
        Scoreboard::with_clock(
            ScoreboardConfig {
                server_limit: 1,
                thread_limit,
                slot_ttl_secs,
            },
            clock,
        )
        .unwrap()
    }

    fn position(slot: SlotId) -> (u32, u32) {
        (slot.server, slot.thread)
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let config = ScoreboardConfig {
            server_limit: 2,
            thread_limit: 0,
            ..ScoreboardConfig::default()
        };
        assert!(Scoreboard::new(config).is_err());
    }

    #[test]
    fn test_occupy_in_server_major_order() {
        let board = board(2, 2);

        let ids: Vec<(u32, u32)> = (0..4)
            .map(|i| position(board.occupy(&format!("10.0.0.{}", i), "vhost").unwrap()))
            .collect();

        assert_eq!(ids, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(board.busy(), 4);
    }

    #[test]
    fn test_full_scoreboard() {
        let board = board(1, 2);
        board.occupy("a", "v").unwrap();
        board.occupy("b", "v").unwrap();

        assert_eq!(board.occupy("c", "v"), Err(ScoreboardError::Full(2)));
    }

    #[test]
    fn test_release_and_reuse() {
        let board = board(1, 3);
        board.occupy("a", "v").unwrap();
        let second = board.occupy("b", "v").unwrap();
        board.occupy("c", "v").unwrap();

        assert!(board.release(second));
        assert!(!board.release(second));
        assert_eq!(board.busy(), 2);

        // The freed slot is handed out again under a new generation
        let reused = board.occupy("d", "v").unwrap();
        assert_eq!(position(reused), position(second));
        assert_eq!(reused.generation, second.generation + 1);
    }

    #[test]
    fn test_stale_release_after_reuse_is_ignored() {
        let board = board(1, 4);
        let first = board.occupy("10.0.0.1", "v").unwrap();
        assert!(board.release(first));

        let second = board.occupy("10.0.0.2", "v").unwrap();
        assert_eq!(position(second), position(first));

        // A late duplicate release for the first occupancy must not free the second
        assert!(!board.release(first));
        assert_eq!(board.snapshot(), vec![CensusEntry::new("10.0.0.2", "v")]);
        assert!(board.release(second));
    }

    #[test]
    fn test_release_unissued_generation() {
        let board = board(1, 1);
        let slot = board.occupy("a", "v").unwrap();

        assert!(!board.release(SlotId {
            generation: 0,
            ..slot
        }));
        assert_eq!(board.busy(), 1);
    }

    #[test]
    fn test_release_out_of_range() {
        let board = board(1, 1);
        assert!(!board.release(SlotId {
            server: 0,
            thread: 5,
            generation: 1
        }));
        assert!(!board.release(SlotId {
            server: 3,
            thread: 0,
            generation: 1
        }));
    }

    #[test]
    fn test_snapshot_skips_idle_slots() {
        let board = board(2, 2);
        let first = board.occupy("10.0.0.1", "a").unwrap();
        board.occupy("10.0.0.2", "b").unwrap();
        board.occupy("10.0.0.3", "c").unwrap();
        board.release(first);

        let snapshot = board.snapshot();
        assert_eq!(
            snapshot,
            vec![
                CensusEntry::new("10.0.0.2", "b"),
                CensusEntry::new("10.0.0.3", "c"),
            ]
        );
    }

    #[test]
    fn test_empty_snapshot() {
        assert!(board(4, 4).snapshot().is_empty());
    }

    #[test]
    fn test_expired_slot_leaves_census() {
        let clock = ManualClock::new(1_000);
        let board = board_with_ttl(2, 30, clock.clone());
        board.occupy("10.0.0.1", "v").unwrap();

        clock.set(1_030);
        assert_eq!(board.busy(), 1);

        clock.set(1_031);
        assert_eq!(board.busy(), 0);
        assert!(board.snapshot().is_empty());
    }

    #[test]
    fn test_expired_slot_is_reclaimed() {
        let clock = ManualClock::new(1_000);
        let board = board_with_ttl(1, 30, clock.clone());
        let abandoned = board.occupy("10.0.0.1", "v").unwrap();
        assert_eq!(board.occupy("10.0.0.2", "v"), Err(ScoreboardError::Full(1)));

        clock.set(1_100);
        let reclaimed = board.occupy("10.0.0.2", "v").unwrap();
        assert_eq!(position(reclaimed), position(abandoned));
        assert_eq!(board.snapshot(), vec![CensusEntry::new("10.0.0.2", "v")]);

        // The abandoned handle can no longer release the reclaimed slot
        assert!(!board.release(abandoned));
        assert_eq!(board.busy(), 1);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let clock = ManualClock::new(0);
        let board = board_with_ttl(1, 0, clock.clone());
        board.occupy("10.0.0.1", "v").unwrap();

        clock.set(u64::MAX);
        assert_eq!(board.busy(), 1);
        assert_eq!(board.occupy("10.0.0.2", "v"), Err(ScoreboardError::Full(1)));
    }
}
