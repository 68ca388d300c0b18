//! Endpoint selection strategies

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// How the registry picks among the callable endpoints of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Advance a per-action cursor; stable under concurrent callers.
    #[default]
    RoundRobin,
    /// Uniform random pick.
    Random,
}

impl Strategy {
    /// Pick an index into a candidate list of `len` endpoints. The cursor
    /// belongs to the action map and is only consulted for round-robin.
    pub fn select(&self, len: usize, cursor: &AtomicUsize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match self {
            Strategy::RoundRobin => Some(cursor.fetch_add(1, Ordering::Relaxed) % len),
            Strategy::Random => Some(rand::thread_rng().gen_range(0..len)),
        }
    }
}
