//! RFC 3927 link-local fallback, reduced per spec.md §4.7.b.
//!
//! Picks a candidate in 169.254.1.0-169.254.254.255, probes it with [`crate::probe::probe`],
//! and on a conflict picks another; after `LL_MAX_CONFLICTS` consecutive conflicts it backs
//! off for `LL_RATE_LIMIT_INTERVAL_SECS` before continuing (RFC 3927 §2.2.1's rate limit,
//! simplified to a flat cooldown rather than a sliding window). Once free, the address is
//! claimed with `LL_ANNOUNCE_NUM` gratuitous ARP announcements spaced `LL_ANNOUNCE_INTERVAL_SECS`
//! apart.

use no_std_net::Ipv4Addr;
use rand_core::RngCore;

use crate::config::{
    LL_ANNOUNCE_INTERVAL_SECS, LL_ANNOUNCE_NUM, LL_MAX_CONFLICTS, LL_PROBE_WAIT_SECS,
    LL_RANGE_END, LL_RANGE_START, LL_RATE_LIMIT_INTERVAL_SECS,
};
use crate::error::{Error, TransportError};
use crate::probe::{probe, ProbeOutcome};
use crate::transport::{Arp, Clock};

const PROBE_POLL_INTERVAL_MS: u32 = 100;

fn candidate(rng: &mut impl RngCore) -> Ipv4Addr {
    let span = LL_RANGE_END - LL_RANGE_START + 1;
    let offset = rng.next_u32() % span;
    (LL_RANGE_START + offset).to_be_bytes().into()
}

/// Selects and claims a link-local address, retrying up to `max_retries` candidates.
pub async fn acquire<A, C, R>(
    arp: &mut A,
    clock: &C,
    rng: &mut R,
    if_id: u32,
    max_retries: u8,
) -> Result<Ipv4Addr, TransportError<A::Error>>
where
    A: Arp,
    C: Clock,
    R: RngCore,
{
    let mut conflicts: u8 = 0;

    for _ in 0..=max_retries {
        let addr = candidate(rng);

        let outcome = probe(
            arp,
            clock,
            if_id,
            addr,
            LL_PROBE_WAIT_SECS * 1000,
            PROBE_POLL_INTERVAL_MS,
        )
        .await;

        match outcome {
            ProbeOutcome::Used(_) => {
                conflicts += 1;
                if conflicts >= LL_MAX_CONFLICTS {
                    clock.sleep_ms(LL_RATE_LIMIT_INTERVAL_SECS * 1000).await;
                    conflicts = 0;
                }
            }
            ProbeOutcome::Free | ProbeOutcome::Inconclusive => {
                announce(arp, clock, if_id, addr).await.map_err(TransportError::Io)?;
                return Ok(addr);
            }
        }
    }

    Err(TransportError::Core(Error::LocalLinkFailed))
}

async fn announce<A, C>(arp: &mut A, clock: &C, if_id: u32, addr: Ipv4Addr) -> Result<(), A::Error>
where
    A: Arp,
    C: Clock,
{
    for i in 0..LL_ANNOUNCE_NUM {
        arp.gratuitous(if_id, addr).await?;
        if i + 1 < LL_ANNOUNCE_NUM {
            clock.sleep_ms(LL_ANNOUNCE_INTERVAL_SECS * 1000).await;
        }
    }

    clock.sleep_ms(crate::config::LL_ANNOUNCE_WAIT_SECS * 1000).await;
    Ok(())
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

    struct FakeRng(u32);

    impl RngCore for FakeRng {
        fn next_u32(&mut self) -> u32 {
            self.0
        }

        fn next_u64(&mut self) -> u64 {
            self.0 as u64
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    struct FakeArp {
        conflicts_left: RefCell<u8>,
        gratuitous_sent: RefCell<u8>,
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
            let mut left = self.conflicts_left.borrow_mut();
            if *left > 0 {
                *left -= 1;
                Ok(Some([9; 6]))
            } else {
                Ok(None)
            }
        }

        async fn gratuitous(&mut self, _if_id: u32, _addr: Ipv4Addr) -> Result<(), ()> {
            *self.gratuitous_sent.borrow_mut() += 1;
            Ok(())
        }
    }

    #[test]
    fn candidate_stays_inside_the_reduced_range() {
        let mut rng = FakeRng(u32::MAX);
        let addr = candidate(&mut rng);
        let octets = addr.octets();
        assert_eq!(octets[0], 169);
        assert_eq!(octets[1], 254);
        assert_ne!(octets[2], 0);
        assert_ne!(octets[2], 255);
    }

    #[test]
    fn retries_past_a_conflict_then_announces() {
        let mut arp = FakeArp {
            conflicts_left: RefCell::new(1),
            gratuitous_sent: RefCell::new(0),
        };
        let clock = SteppingClock(RefCell::new(0));
        let mut rng = FakeRng(7);

        let addr = embassy_futures::block_on(acquire(&mut arp, &clock, &mut rng, 1, 3)).unwrap();

        assert_eq!(addr.octets()[0], 169);
        assert_eq!(*arp.gratuitous_sent.borrow(), LL_ANNOUNCE_NUM);
    }

    #[test]
    fn gives_up_after_exhausting_retries() {
        let mut arp = FakeArp {
            conflicts_left: RefCell::new(u8::MAX),
            gratuitous_sent: RefCell::new(0),
        };
        let clock = SteppingClock(RefCell::new(0));
        let mut rng = FakeRng(3);

        let err = embassy_futures::block_on(acquire(&mut arp, &clock, &mut rng, 1, 1))
            .unwrap_err();

        assert_eq!(err, TransportError::Core(Error::LocalLinkFailed));
    }
}
