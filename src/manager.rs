//! DHCP manager convenience layer, recovered from `dhcp-c_mgr.c` (SPEC_FULL.md §7).
//!
//! A thin wrapper around [`crate::client::Client`] for callers who don't want to poll
//! `check_status` on their own cadence: [`Manager::poll_once`] compares the last-seen
//! status per interface against the current one, invokes a callback on every
//! transition, and records it into a bounded per-interface history. It calls the same
//! public `Client` API an application would; it has no wire-format or dispatch role.

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::HistoryBuffer;

use crate::client::Client;
use crate::error::Error;
use crate::iface::LeaseStatus;

/// One recorded `lease_status` transition for an interface.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Transition {
    pub if_id: u32,
    pub status: LeaseStatus,
    pub error: Option<Error>,
}

/// Bounded per-interface transition log plus the status last observed, so
/// [`Manager::poll_once`] only reports a callback on an actual change. `N` matches the
/// `Client`'s own `MAX_IFACES`; `H` bounds how many past transitions are kept per slot.
struct Slot<const H: usize> {
    if_id: u32,
    last_status: LeaseStatus,
    history: HistoryBuffer<Transition, H>,
}

/// Managed-mode wrapper (SPEC_FULL.md §7 supplement). Doesn't own a `Client`; the
/// caller still runs `Client::run` itself and calls `Manager::poll_once` on its own
/// schedule (e.g. from the same ticker loop, or a slower one).
pub struct Manager<'c, 'q, M, S, A, I, IF, C, R, const N: usize, const P: usize, const CAP: usize, const H: usize>
where
    M: RawMutex,
{
    client: &'c Client<'q, M, S, A, I, IF, C, R, N, P, CAP>,
    slots: [Option<Slot<H>>; N],
}

impl<'c, 'q, M, S, A, I, IF, C, R, const N: usize, const P: usize, const CAP: usize, const H: usize>
    Manager<'c, 'q, M, S, A, I, IF, C, R, N, P, CAP, H>
where
    M: RawMutex,
{
    pub fn new(client: &'c Client<'q, M, S, A, I, IF, C, R, N, P, CAP>) -> Self {
        Self {
            client,
            slots: [const { None }; N],
        }
    }

    /// Starts tracking `if_id`'s transitions. A no-op if it's already tracked.
    pub fn track(&mut self, if_id: u32) {
        if self.slots.iter().flatten().any(|s| s.if_id == if_id) {
            return;
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(Slot {
                if_id,
                last_status: LeaseStatus::None,
                history: HistoryBuffer::new(),
            });
        }
    }

    pub fn untrack(&mut self, if_id: u32) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.as_ref().map(|s| s.if_id) == Some(if_id))
        {
            *slot = None;
        }
    }

    /// Last few transitions recorded for `if_id`, oldest first.
    pub fn history(&self, if_id: u32) -> impl Iterator<Item = &Transition> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.if_id == if_id)
            .into_iter()
            .flat_map(|s| s.history.oldest_ordered())
    }

    /// Checks every tracked interface's current status and invokes `on_transition` for
    /// each one whose status changed since the last call. Never blocks on the
    /// Dispatcher: built entirely on `Client::check_status`'s lock-free read path.
    pub fn poll_once(&mut self, mut on_transition: impl FnMut(Transition)) {
        for slot in self.slots.iter_mut().flatten() {
            let Ok((status, error)) = self.client.check_status(slot.if_id) else {
                continue;
            };

            if status == slot.last_status {
                continue;
            }

            slot.last_status = status;
            let transition = Transition {
                if_id: slot.if_id,
                status,
                error,
            };
            slot.history.write(transition);
            on_transition(transition);
        }
    }
}
