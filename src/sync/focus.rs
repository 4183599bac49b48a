//! Once-per-focus latch for auto-sync triggers.

use std::sync::atomic::{AtomicBool, Ordering};

/// Latch ensuring an auto-sync runs at most once per screen-focus lifecycle.
///
/// UI layers call [`FocusGuard::try_begin`] when a screen gains focus and
/// sync only when it returns `true`; re-renders without an actual re-entry
/// get `false`. [`FocusGuard::reset`] on blur re-arms the latch.
#[derive(Debug, Default)]
pub struct FocusGuard {
    engaged: AtomicBool,
}

impl FocusGuard {
    /// Creates a disarmed guard.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            engaged: AtomicBool::new(false),
        }
    }

    /// Attempts to claim this focus cycle. Returns `true` exactly once
    /// between resets, including under concurrent callers.
    pub fn try_begin(&self) -> bool {
        self.engaged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Re-arms the guard; called when the screen loses focus.
    pub fn reset(&self) {
        self.engaged.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_claims_once_per_cycle() {
        let guard = FocusGuard::new();
        assert!(guard.try_begin());
        assert!(!guard.try_begin());

        guard.reset();
        assert!(guard.try_begin());
    }

    #[test]
    fn test_concurrent_claims_yield_one_winner() {
        let guard = Arc::new(FocusGuard::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.try_begin())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|claimed| *claimed)
            .count();
        assert_eq!(winners, 1);
    }
}
