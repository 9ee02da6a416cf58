// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmbus contributors
//
// Fixed-capacity timer callback pool.
//
// A handle packs (slot index, descriptor) into one u64. The descriptor is
// bumped every time a slot is reused, so a callback dispatched after its
// timer was destroyed carries a stale descriptor and is recognised and
// ignored instead of firing into freed state.

use std::time::{Duration, Instant};

/// Packed timer identity: `(index << 32) | descriptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

impl TimerHandle {
    fn new(index: u32, descriptor: u32) -> Self {
        Self(((index as u64) << 32) | descriptor as u64)
    }

    pub fn index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn descriptor(self) -> u32 {
        self.0 as u32
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct TimerSlot {
    /// Bumped on every registration and cancellation.
    descriptor: u32,
    active: bool,
    period: Duration,
    next_due: Instant,
    callback: Option<Box<dyn FnMut() + Send>>,
}

/// A pool of periodic callbacks with a fixed slot count, driven by an
/// owner's thread calling [`tick`].
pub struct TimerPool {
    slots: Vec<TimerSlot>,
}

impl TimerPool {
    pub fn new(capacity: usize, now: Instant) -> Self {
        let slots = (0..capacity)
            .map(|_| TimerSlot {
                descriptor: 0,
                active: false,
                period: Duration::ZERO,
                next_due: now,
                callback: None,
            })
            .collect();
        Self { slots }
    }

    /// Register a periodic callback. First fire is one period from `now`.
    /// Returns `None` when every slot is taken.
    pub fn register(
        &mut self,
        period: Duration,
        now: Instant,
        callback: Box<dyn FnMut() + Send>,
    ) -> Option<TimerHandle> {
        let index = self.slots.iter().position(|s| !s.active)?;
        let slot = &mut self.slots[index];
        slot.descriptor = slot.descriptor.wrapping_add(1);
        slot.active = true;
        slot.period = period;
        slot.next_due = now + period;
        slot.callback = Some(callback);
        Some(TimerHandle::new(index as u32, slot.descriptor))
    }

    /// Cancel a timer. A stale handle (slot already reused or cancelled) is
    /// ignored and reported as `false`.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let index = handle.index() as usize;
        match self.slots.get_mut(index) {
            Some(slot) if slot.active && slot.descriptor == handle.descriptor() => {
                slot.active = false;
                slot.descriptor = slot.descriptor.wrapping_add(1);
                slot.callback = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a handle still addresses a live timer.
    pub fn is_live(&self, handle: TimerHandle) -> bool {
        self.slots
            .get(handle.index() as usize)
            .map(|s| s.active && s.descriptor == handle.descriptor())
            .unwrap_or(false)
    }

    /// Dispatch every due callback and re-arm it. Returns the number of
    /// callbacks fired. A callback whose descriptor went stale between
    /// being collected and being dispatched is skipped.
    pub fn tick(&mut self, now: Instant) -> usize {
        let due: Vec<(usize, u32)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active && s.next_due <= now)
            .map(|(i, s)| (i, s.descriptor))
            .collect();

        let mut fired = 0;
        for (index, descriptor) in due {
            let slot = &mut self.slots[index];
            if !slot.active || slot.descriptor != descriptor {
                continue; // destroyed (or reused) since collection
            }
            slot.next_due = now + slot.period;
            // Take the callback out so it may cancel or register timers
            // through a re-entrant pool borrow-free.
            if let Some(mut cb) = slot.callback.take() {
                cb();
                let slot = &mut self.slots[index];
                if slot.active && slot.descriptor == descriptor {
                    slot.callback = Some(cb);
                }
                fired += 1;
            }
        }
        fired
    }

    /// Number of active timers.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.active).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_on_schedule() {
        let t0 = Instant::now();
        let mut pool = TimerPool::new(4, t0);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        pool.register(
            Duration::from_millis(10),
            t0,
            Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .expect("slot");

        assert_eq!(pool.tick(t0 + Duration::from_millis(5)), 0);
        assert_eq!(pool.tick(t0 + Duration::from_millis(10)), 1);
        assert_eq!(pool.tick(t0 + Duration::from_millis(15)), 0);
        assert_eq!(pool.tick(t0 + Duration::from_millis(20)), 1);
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn stale_handle_is_ignored() {
        let t0 = Instant::now();
        let mut pool = TimerPool::new(1, t0);
        let h1 = pool
            .register(Duration::from_millis(1), t0, Box::new(|| {}))
            .unwrap();
        assert!(pool.cancel(h1));
        assert!(!pool.cancel(h1)); // second cancel is stale

        // Slot reuse bumps the descriptor; the old handle must not match.
        let h2 = pool
            .register(Duration::from_millis(1), t0, Box::new(|| {}))
            .unwrap();
        assert_eq!(h1.index(), h2.index());
        assert_ne!(h1.descriptor(), h2.descriptor());
        assert!(!pool.is_live(h1));
        assert!(pool.is_live(h2));
    }

    #[test]
    fn capacity_is_bounded() {
        let t0 = Instant::now();
        let mut pool = TimerPool::new(2, t0);
        assert!(pool.register(Duration::from_secs(1), t0, Box::new(|| {})).is_some());
        assert!(pool.register(Duration::from_secs(1), t0, Box::new(|| {})).is_some());
        assert!(pool.register(Duration::from_secs(1), t0, Box::new(|| {})).is_none());
    }

    #[test]
    fn cancelled_timer_stops_firing() {
        let t0 = Instant::now();
        let mut pool = TimerPool::new(1, t0);
        let h = pool
            .register(Duration::from_millis(1), t0, Box::new(|| {}))
            .unwrap();
        assert_eq!(pool.tick(t0 + Duration::from_millis(1)), 1);
        assert!(pool.cancel(h));
        assert_eq!(pool.tick(t0 + Duration::from_millis(2)), 0);
    }
}
