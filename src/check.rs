//! Contract checks, version stamps and the debug-only reentrancy guard.
//!
//! Checked builds (feature `checked`, on by default) turn contract
//! violations into `Err` values. Unchecked builds reduce them to
//! `debug_assert!`; release builds then skip the check entirely and rely
//! on slice bounds for memory safety, so misuse yields an unspecified item
//! or a panic.

#[cfg(debug_assertions)]
use core::cell::Cell;
use core::marker::PhantomData;

/// Return `Err($err)` from the enclosing function when `$cond` is false
/// in checked builds; debug-assert it otherwise.
macro_rules! contract {
    ($cond:expr, $err:expr) => {
        if cfg!(feature = "checked") {
            if !$cond {
                return Err($err);
            }
        } else {
            debug_assert!($cond, "contract violated: {}", $err);
        }
    };
}

/// Per-container mutation counter. Positions capture the current stamp and
/// are rejected once the container has been structurally modified.
#[derive(Debug, Default, Clone)]
pub struct Version {
    stamp: u64,
}

impl Version {
    pub const fn new() -> Self {
        Self { stamp: 0 }
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.stamp
    }

    #[inline]
    pub fn bump(&mut self) {
        self.stamp = self.stamp.wrapping_add(1);
    }
}

/// Per-instance reentrancy tracker. Structural entry points take
/// `let _g = self.reentrancy.enter();` so a user callback (hash, equality,
/// ordering, item constructor) that re-enters the same container through a
/// raw pointer panics in debug builds instead of observing a half-merged
/// segment stack. Release builds compile this to nothing.
#[derive(Debug)]
pub struct DebugReentrancy {
    #[cfg(debug_assertions)]
    depth: Cell<u32>,
    // Keep !Send + !Sync in line with single-threaded design.
    _nosend: PhantomData<*mut ()>,
}

impl DebugReentrancy {
    pub const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            depth: Cell::new(0),
            _nosend: PhantomData,
        }
    }

    /// Enter a guarded section. In debug builds, panics if already entered.
    #[inline]
    pub fn enter(&self) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            let d = self.depth.get();
            assert!(d == 0, "reentrancy detected: nested entry into container");
            self.depth.set(d + 1);
            ReentrancyGuard { owner: self }
        }

        #[cfg(not(debug_assertions))]
        {
            ReentrancyGuard { _z: PhantomData }
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DebugReentrancy {
    // A clone is a fresh container; it never inherits an open section.
    fn clone(&self) -> Self {
        Self::new()
    }
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _z: PhantomData<&'a ()>,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let d = self.owner.depth.get();
            debug_assert!(d > 0);
            self.owner.depth.set(d - 1);
        }
    }
}
