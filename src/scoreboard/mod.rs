//! In-process worker scoreboard.
//!
//! The scoreboard is a fixed grid of worker slots, `server_limit` rows of
//! `thread_limit` slots each. Every request that is being served occupies one
//! slot, recording the client address and virtual host it serves. The
//! admission engine reads it through the [`Census`](crate::limits::Census)
//! trait.
//!
//! Slots whose release never arrives expire after `slot_ttl_secs`.

mod board;

pub use board::{Scoreboard, ScoreboardConfig, ScoreboardError, SlotId};
