//! Identifiers for sessions and jobs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use ulid::Ulid;

/// Unique identifier for a scheduling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Ulid);

impl SessionId {
    /// Generate a new SessionId
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier of a single job.
///
/// Ids are handed out by a [`JobIdCounter`] in strictly increasing order and
/// are never reused within the counter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Session-owned source of job ids.
///
/// Clones share the same underlying counter, so every clone handed to a
/// worker keeps allocating from one sequence.
#[derive(Debug, Clone, Default)]
pub struct JobIdCounter(Arc<AtomicU64>);

impl JobIdCounter {
    /// Create a counter whose first id is 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> JobId {
        JobId(self.0.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids allocated so far.
    pub fn allocated(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
