// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Monotonic tick counter with blocking waits.
//!
//! A tick only moves forward. The common case of an already-reached tick is
//! a single atomic load with no lock and no allocation; only threads that
//! actually have to sleep touch the waiter lock.
//!
//! Sleeping waiters block on a condvar owned by the counter, which only
//! `advance_to` signals, and only after the value has moved. Waking always
//! re-reads the atomic, so the value stays the sole source of truth.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

/// A monotonically increasing 64-bit counter that threads can wait on.
pub struct TickCounter {
    value: AtomicU64,
    /// Number of sleeping waiters. Guards `wake` against lost notifications.
    sleepers: Mutex<usize>,
    wake: Condvar,
}

impl TickCounter {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            sleepers: Mutex::new(0),
            wake: Condvar::new(),
        }
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Whether the counter has reached `target`.
    #[inline]
    pub fn reached(&self, target: u64) -> bool {
        self.get() >= target
    }

    /// Raise the counter to at least `tick` and wake every waiter.
    /// Returns the resulting value. Lower values are ignored.
    pub fn advance_to(&self, tick: u64) -> u64 {
        let previous = self.value.fetch_max(tick, Ordering::AcqRel);
        if tick > previous {
            log::trace!("tick advanced {} -> {}", previous, tick);
            let sleepers = self.sleepers.lock();
            if *sleepers > 0 {
                self.wake.notify_all();
            }
        }
        previous.max(tick)
    }

    /// Block until the counter reaches `target`.
    pub fn wait_for(&self, target: u64) {
        if self.reached(target) {
            return;
        }
        let mut sleepers = self.sleepers.lock();
        *sleepers += 1;
        while !self.reached(target) {
            self.wake.wait(&mut sleepers);
        }
        *sleepers -= 1;
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_advance_is_monotonic() {
        let tick = TickCounter::new(0);
        assert_eq!(tick.advance_to(5), 5);
        assert_eq!(tick.advance_to(3), 5);
        assert_eq!(tick.get(), 5);
        assert!(tick.reached(5));
        assert!(!tick.reached(6));
    }

    #[test]
    fn test_wait_already_reached() {
        let tick = TickCounter::new(7);
        tick.wait_for(0);
        tick.wait_for(7);
    }

    #[test]
    fn test_reached_wait_takes_no_lock() {
        let tick = TickCounter::new(4);
        let _sleepers = tick.sleepers.lock();
        tick.wait_for(4);
        assert_eq!(tick.advance_to(2), 4);
    }

    #[test]
    fn test_wait_then_advance() {
        let tick = Arc::new(TickCounter::new(0));
        let waiter = {
            let tick = tick.clone();
            thread::spawn(move || {
                tick.wait_for(3);
                tick.get()
            })
        };

        thread::sleep(Duration::from_millis(20));
        tick.advance_to(1);
        tick.advance_to(2);
        thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        tick.advance_to(3);

        assert!(waiter.join().unwrap() >= 3);
    }

    #[test]
    fn test_many_waiters_woken() {
        let tick = Arc::new(TickCounter::new(0));
        let waiters: Vec<_> = (1..=4)
            .map(|target| {
                let tick = tick.clone();
                thread::spawn(move || tick.wait_for(target))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        tick.advance_to(10);
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }
}
