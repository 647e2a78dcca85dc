//! Session budget management.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{ExecutionError, Result};

/// A slice of session time handed to one job.
///
/// Grants are move-only: giving one back to [`BudgetManager::release`]
/// consumes it, so a grant can be released at most once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an unreleased grant keeps its seconds out of the session budget"]
pub struct BudgetGrant {
    id: u64,
    seconds: u64,
}

impl BudgetGrant {
    /// Grant id, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Seconds reserved by this grant.
    pub fn seconds(&self) -> u64 {
        self.seconds
    }
}

/// Tracks the remaining session time.
///
/// Reservation and release go through atomic read-modify-write operations,
/// so concurrent workers can neither overdraw the budget nor lose updates.
#[derive(Debug)]
pub struct BudgetManager {
    total: u64,
    remaining: AtomicU64,
    next_grant: AtomicU64,
}

impl BudgetManager {
    /// Create a manager holding `total_secs` of session time.
    pub fn new(total_secs: u64) -> Self {
        Self {
            total: total_secs,
            remaining: AtomicU64::new(total_secs),
            next_grant: AtomicU64::new(0),
        }
    }

    /// Configured session total.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Seconds not currently reserved or consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Seconds reserved or consumed so far.
    pub fn spent(&self) -> u64 {
        self.total - self.remaining()
    }

    /// Reserve `seconds`, failing if more than the remainder is requested.
    pub fn reserve(&self, seconds: u64) -> Result<BudgetGrant> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |rem| rem.checked_sub(seconds))
            .map(|before| {
                let id = self.next_grant.fetch_add(1, Ordering::Relaxed);
                debug!("Granted {}s (grant {}), {}s left", seconds, id, before - seconds);
                BudgetGrant { id, seconds }
            })
            .map_err(|remaining| ExecutionError::BudgetExhausted {
                requested: seconds,
                remaining,
            })
    }

    /// Return `unused` seconds of `grant` to the session.
    ///
    /// Releasing more than the grant holds is an invariant violation.
    pub fn release(&self, grant: BudgetGrant, unused: u64) -> Result<()> {
        if unused > grant.seconds {
            return Err(ExecutionError::BudgetOverRelease {
                grant: grant.id,
                reserved: grant.seconds,
                unused,
            });
        }
        if unused > 0 {
            self.remaining.fetch_add(unused, Ordering::SeqCst);
        }
        debug!("Grant {} returned {}s of {}s", grant.id, unused, grant.seconds);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_and_release() {
        let budget = BudgetManager::new(120);
        let grant = budget.reserve(60).unwrap();
        assert_eq!(grant.seconds(), 60);
        assert_eq!(budget.remaining(), 60);

        budget.release(grant, 20).unwrap();
        assert_eq!(budget.remaining(), 80);
        assert_eq!(budget.spent(), 40);
    }

    #[test]
    fn test_reserve_more_than_remaining_fails() {
        let budget = BudgetManager::new(50);
        match budget.reserve(60) {
            Err(ExecutionError::BudgetExhausted { requested, remaining }) => {
                assert_eq!(requested, 60);
                assert_eq!(remaining, 50);
            }
            other => panic!("expected BudgetExhausted, got {:?}", other),
        }
        assert_eq!(budget.remaining(), 50);
    }

    #[test]
    fn test_over_release_is_rejected() {
        let budget = BudgetManager::new(100);
        let grant = budget.reserve(10).unwrap();
        assert!(matches!(
            budget.release(grant, 11),
            Err(ExecutionError::BudgetOverRelease { reserved: 10, unused: 11, .. })
        ));
        assert_eq!(budget.remaining(), 90);
    }

    #[test]
    fn test_remaining_stays_within_bounds() {
        let budget = BudgetManager::new(500);
        let mut outstanding = Vec::new();
        let mut seed: u64 = 0x2545_f491;

        for _ in 0..2000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let amount = (seed >> 33) % 97;
            if seed & 1 == 0 {
                if let Ok(grant) = budget.reserve(amount) {
                    outstanding.push(grant);
                }
            } else if let Some(grant) = outstanding.pop() {
                let unused = amount % (grant.seconds() + 1);
                budget.release(grant, unused).unwrap();
            }
            assert!(budget.remaining() <= budget.total());
        }

        for grant in outstanding {
            let full = grant.seconds();
            budget.release(grant, full).unwrap();
        }
        assert!(budget.remaining() <= 500);
    }

    #[test]
    fn test_concurrent_reservations_never_overdraw() {
        let budget = Arc::new(BudgetManager::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = budget.clone();
                std::thread::spawn(move || {
                    let mut granted = 0;
                    while let Ok(grant) = budget.reserve(7) {
                        granted += grant.seconds();
                    }
                    granted
                })
            })
            .collect();

        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 994);
        assert_eq!(budget.remaining(), 6);
    }
}
