//! Address conflict probe (component C6, spec.md §4.6).
//!
//! ARP-based "is this address already in use" check used both before accepting a
//! DHCPACK's offered address and before claiming a link-local candidate (§4.7.b).
//! Polls the ARP cache after sending a probe rather than blocking on a single reply,
//! since the `Arp` collaborator has no "wait for a reply" primitive of its own.

use log::warn;
use no_std_net::Ipv4Addr;

use crate::error::Error;
use crate::transport::{Arp, Clock};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProbeOutcome {
    Free,
    Used([u8; 6]),
    /// An ARP error made the probe's outcome unknowable (§4.6/§9); treated the same as
    /// `Free` by callers rather than aborting the negotiation or link-local attempt.
    Inconclusive,
}

fn elapsed_ms<C: Clock>(clock: &C, start_ticks: u32) -> u32 {
    let ticks = clock.now_ticks().wrapping_sub(start_ticks);
    ((ticks as u64) * 1000 / clock.ticks_per_second().max(1) as u64) as u32
}

/// Sends an ARP probe for `target` and polls the cache every `poll_interval_ms` until
/// either a resolved entry appears or `wait_ms` elapses. An ARP error at either step is
/// reported as `Inconclusive` rather than propagated, per §4.6/§9: a broken ARP
/// collaborator shouldn't itself block address acquisition.
pub async fn probe<A, C>(
    arp: &mut A,
    clock: &C,
    if_id: u32,
    target: Ipv4Addr,
    wait_ms: u32,
    poll_interval_ms: u32,
) -> ProbeOutcome
where
    A: Arp,
    C: Clock,
{
    if arp.probe(if_id, target).await.is_err() {
        warn!("{}", Error::AddrValidateInconclusive);
        return ProbeOutcome::Inconclusive;
    }

    let start = clock.now_ticks();

    loop {
        match arp.cache_lookup(if_id, target).await {
            Ok(Some(mac)) => return ProbeOutcome::Used(mac),
            Ok(None) => {}
            Err(_) => {
                warn!("{}", Error::AddrValidateInconclusive);
                return ProbeOutcome::Inconclusive;
            }
        }

        let elapsed = elapsed_ms(clock, start);
        if elapsed >= wait_ms {
            return ProbeOutcome::Free;
        }

        clock.sleep_ms(poll_interval_ms.min(wait_ms - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    struct SteppingClock(RefCell<u32>);

    impl Clock for SteppingClock {
        fn now_ticks(&self) -> u32 {
            let mut t = self.0.borrow_mut();
            *t += 1;
            *t
        }

        fn ticks_per_second(&self) -> u32 {
            1000
        }

        async fn sleep_ms(&self, _ms: u32) {}
    }

    struct FakeArp {
        resolves_after_polls: u32,
        polls: RefCell<u32>,
        owner: [u8; 6],
    }

    impl Arp for FakeArp {
        type Error = ();

        async fn probe(&mut self, _if_id: u32, _target: Ipv4Addr) -> Result<(), ()> {
            Ok(())
        }

        async fn cache_lookup(
            &mut self,
            _if_id: u32,
            _target: Ipv4Addr,
        ) -> Result<Option<[u8; 6]>, ()> {
            let mut polls = self.polls.borrow_mut();
            *polls += 1;
            if *polls >= self.resolves_after_polls {
                Ok(Some(self.owner))
            } else {
                Ok(None)
            }
        }

        async fn gratuitous(&mut self, _if_id: u32, _addr: Ipv4Addr) -> Result<(), ()> {
            Ok(())
        }
    }

    #[test]
    fn reports_used_once_the_cache_resolves() {
        let mut arp = FakeArp {
            resolves_after_polls: 3,
            polls: RefCell::new(0),
            owner: [1, 2, 3, 4, 5, 6],
        };
        let clock = SteppingClock(RefCell::new(0));

        let outcome = embassy_futures::block_on(probe(
            &mut arp,
            &clock,
            1,
            Ipv4Addr::new(169, 254, 10, 1),
            1000,
            10,
        ));

        assert_eq!(outcome, ProbeOutcome::Used([1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn reports_free_once_the_wait_elapses_unresolved() {
        let mut arp = FakeArp {
            resolves_after_polls: u32::MAX,
            polls: RefCell::new(0),
            owner: [0; 6],
        };
        let clock = SteppingClock(RefCell::new(0));

        let outcome = embassy_futures::block_on(probe(
            &mut arp,
            &clock,
            1,
            Ipv4Addr::new(169, 254, 10, 1),
            50,
            10,
        ));

        assert_eq!(outcome, ProbeOutcome::Free);
    }

    struct FailingArp;

    impl Arp for FailingArp {
        type Error = ();

        async fn probe(&mut self, _if_id: u32, _target: Ipv4Addr) -> Result<(), ()> {
            Err(())
        }

        async fn cache_lookup(
            &mut self,
            _if_id: u32,
            _target: Ipv4Addr,
        ) -> Result<Option<[u8; 6]>, ()> {
            Ok(None)
        }

        async fn gratuitous(&mut self, _if_id: u32, _addr: Ipv4Addr) -> Result<(), ()> {
            Ok(())
        }
    }

    #[test]
    fn an_arp_error_is_inconclusive_not_a_failure() {
        let mut arp = FailingArp;
        let clock = SteppingClock(RefCell::new(0));

        let outcome = embassy_futures::block_on(probe(
            &mut arp,
            &clock,
            1,
            Ipv4Addr::new(169, 254, 10, 1),
            1000,
            10,
        ));

        assert_eq!(outcome, ProbeOutcome::Inconclusive);
    }
}
