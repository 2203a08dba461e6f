//! Timer wheel (component C3, spec.md §3 "Timer Wheel Entry" / §4.3).
//!
//! A fixed array of slots rather than the original's pointer-linked list (§9):
//! handles are indices, so cancellation and expiry never need `unsafe` pointer
//! bookkeeping. Walked once per second by the Timer Task (see `client::Client::run_ticker`).

use crate::queue::Command;

/// A single armed countdown, owned by one interface.
#[derive(Copy, Clone, Debug)]
struct WheelEntry {
    if_id: u32,
    countdown_secs: u32,
    on_expiry: Command,
}

/// Fixed-capacity timer wheel. `N` bounds the number of simultaneously armed timers -
/// in practice at most one per managed interface (T1, T2 or lease-expiry), so `N` is
/// normally sized the same as `MAX_IFACES`.
pub struct TimerWheel<const N: usize> {
    slots: [Option<WheelEntry>; N],
}

/// Opaque handle into the wheel, stored by the owning `InterfaceRecord::timer_handle`.
pub type TimerHandle = usize;

impl<const N: usize> TimerWheel<N> {
    pub const fn new() -> Self {
        Self {
            slots: [None; N],
        }
    }

    /// Arms a new countdown, returning its handle. `PoolEmpty` if the wheel is full.
    pub fn arm(&mut self, if_id: u32, countdown_secs: u32, on_expiry: Command) -> Option<TimerHandle> {
        let (idx, slot) = self.slots.iter_mut().enumerate().find(|(_, s)| s.is_none())?;

        *slot = Some(WheelEntry {
            if_id,
            countdown_secs: countdown_secs.max(1),
            on_expiry,
        });

        Some(idx)
    }

    /// Cancels `handle`; a no-op if it isn't armed (spec.md §4.3: "safe to call on a
    /// non-armed record").
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(slot) = self.slots.get_mut(handle) {
            *slot = None;
        }
    }

    /// Invariant P8: after releasing an interface, no timer entry it owns remains armed.
    pub fn cancel_all_for(&mut self, if_id: u32) {
        for slot in self.slots.iter_mut() {
            if slot.map(|e| e.if_id) == Some(if_id) {
                *slot = None;
            }
        }
    }

    /// One wheel tick (called once per second by the Timer Task): decrements every
    /// armed entry, unlinks and returns the commands for any that just reached zero.
    /// Entries expiring on the same tick are returned in slot (insertion) order - spec.md
    /// §4.3 explicitly leaves cross-interface expiry order as implementation-defined.
    pub fn tick<const M: usize>(&mut self) -> heapless::Vec<Command, M> {
        let mut expired = heapless::Vec::new();

        for slot in self.slots.iter_mut() {
            if let Some(entry) = slot {
                entry.countdown_secs = entry.countdown_secs.saturating_sub(1);

                if entry.countdown_secs == 0 {
                    // Drop silently once the scratch buffer is full: M should be sized
                    // to N by callers, so this only triggers under a pathological tick
                    // (all N timers expiring in the same second) larger than M allows.
                    let _ = expired.push(entry.on_expiry);
                    *slot = None;
                }
            }
        }

        expired
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.slots.get(handle).map(|s| s.is_some()).unwrap_or(false)
    }
}

impl<const N: usize> Default for TimerWheel<N> {
    fn default() -> Self {
        Self::new()
    }
}
