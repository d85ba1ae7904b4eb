//! Tree-wide latch with three compatibility modes.
//!
//! | held \ requested | S   | SX  | X   |
//! |------------------|-----|-----|-----|
//! | S                | yes | yes | no  |
//! | SX               | yes | no  | no  |
//! | X                | no  | no  | no  |
//!
//! S readers descend concurrently. SX reserves the right to restructure
//! while readers drain; at most one SX holder exists at a time. X stops
//! everything and is what the structural operations run under.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LatchState {
    shared: usize,
    sx_held: bool,
    x_held: bool,
}

/// One latch per index, guarding its structure as a whole.
#[derive(Debug, Default)]
pub struct TreeLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl TreeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared mode, for plain descents.
    pub fn lock_s(&self) -> SLatchGuard<'_> {
        let mut state = self.state.lock();
        while state.x_held {
            self.cond.wait(&mut state);
        }
        state.shared += 1;
        SLatchGuard { latch: self }
    }

    /// Shared-exclusive mode: structural intent, readers still allowed.
    pub fn lock_sx(&self) -> SxLatchGuard<'_> {
        let mut state = self.state.lock();
        while state.x_held || state.sx_held {
            self.cond.wait(&mut state);
        }
        state.sx_held = true;
        SxLatchGuard { latch: self }
    }

    /// Exclusive mode: sole access to the tree structure.
    pub fn lock_x(&self) -> XLatchGuard<'_> {
        let mut state = self.state.lock();
        while state.x_held || state.sx_held || state.shared > 0 {
            self.cond.wait(&mut state);
        }
        state.x_held = true;
        XLatchGuard { latch: self }
    }

    pub fn try_lock_x(&self) -> Option<XLatchGuard<'_>> {
        let mut state = self.state.lock();
        if state.x_held || state.sx_held || state.shared > 0 {
            return None;
        }
        state.x_held = true;
        Some(XLatchGuard { latch: self })
    }
}

/// Shared access to the tree structure.
#[must_use]
pub struct SLatchGuard<'a> {
    latch: &'a TreeLatch,
}

impl Drop for SLatchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.latch.state.lock();
        debug_assert!(state.shared > 0);
        state.shared -= 1;
        drop(state);
        self.latch.cond.notify_all();
    }
}

/// Structural-intent access; excludes other SX and X holders.
#[must_use]
pub struct SxLatchGuard<'a> {
    latch: &'a TreeLatch,
}

impl<'a> SxLatchGuard<'a> {
    /// Wait for readers to drain and take full exclusion. The SX hold is
    /// consumed.
    pub fn upgrade(self) -> XLatchGuard<'a> {
        let latch = self.latch;
        {
            let mut state = latch.state.lock();
            debug_assert!(state.sx_held);
            while state.shared > 0 {
                latch.cond.wait(&mut state);
            }
            state.sx_held = false;
            state.x_held = true;
        }
        std::mem::forget(self);
        XLatchGuard { latch }
    }
}

impl Drop for SxLatchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.latch.state.lock();
        debug_assert!(state.sx_held);
        state.sx_held = false;
        drop(state);
        self.latch.cond.notify_all();
    }
}

/// Exclusive access; proof of the right to restructure the tree.
#[must_use]
pub struct XLatchGuard<'a> {
    latch: &'a TreeLatch,
}

impl Drop for XLatchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.latch.state.lock();
        debug_assert!(state.x_held);
        state.x_held = false;
        drop(state);
        self.latch.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_shared_latches_coexist() {
        let latch = TreeLatch::new();
        let g1 = latch.lock_s();
        let g2 = latch.lock_s();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn test_sx_allows_shared() {
        let latch = TreeLatch::new();
        let sx = latch.lock_sx();
        let s = latch.lock_s();
        drop(s);
        drop(sx);
    }

    #[test]
    fn test_x_excludes_shared() {
        let latch = Arc::new(TreeLatch::new());
        let x = latch.lock_x();

        assert!(latch.try_lock_x().is_none());

        let latch2 = Arc::clone(&latch);
        let acquired = Arc::new(AtomicBool::new(false));
        let acquired2 = Arc::clone(&acquired);
        let handle = thread::spawn(move || {
            let _s = latch2.lock_s();
            acquired2.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(x);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sx_upgrade_waits_for_readers() {
        let latch = Arc::new(TreeLatch::new());
        let sx = latch.lock_sx();
        let s = latch.lock_s();

        let upgraded = Arc::new(AtomicBool::new(false));
        let latch2 = Arc::clone(&latch);
        let upgraded2 = Arc::clone(&upgraded);

        // Move the SX guard's latch reference into the thread via Arc.
        drop(sx);
        let handle = thread::spawn(move || {
            let sx = latch2.lock_sx();
            let _x = sx.upgrade();
            upgraded2.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!upgraded.load(Ordering::SeqCst));

        drop(s);
        handle.join().unwrap();
        assert!(upgraded.load(Ordering::SeqCst));
    }

    #[test]
    fn test_two_sx_exclude_each_other() {
        let latch = Arc::new(TreeLatch::new());
        let sx = latch.lock_sx();

        let latch2 = Arc::clone(&latch);
        let acquired = Arc::new(AtomicBool::new(false));
        let acquired2 = Arc::clone(&acquired);
        let handle = thread::spawn(move || {
            let _sx2 = latch2.lock_sx();
            acquired2.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(sx);
        handle.join().unwrap();
    }
}
