//! Retransmission engine (component C5, spec.md §4.5).
//!
//! Send-and-wait: each attempt waits a fixed `rx_timeout_ms` window for a matching
//! reply, filtering every received datagram through [`Packet::is_for_us`] plus a
//! caller-supplied acceptance predicate so stray replies (wrong xid, wrong host, wrong
//! message type) are discarded without aborting the wait. A timed-out attempt sleeps a
//! separate, growing backoff (`INITIAL_BACKOFF_MS` doubling up to `MAX_BACKOFF_MS`,
//! ±10% jitter) before the next retransmission - the receive window itself never grows.
//! The receive queue is shrunk for the duration of each attempt's wait and restored
//! before the next retransmission (§4.5, §9).

use no_std_net::SocketAddrV4;
use rand_core::RngCore;

use crate::config::{INITIAL_BACKOFF_MS, MAX_BACKOFF_MS};
use crate::error::{Error, TransportError};
use crate::transport::{Clock, Sockets};
use crate::wire::Packet;

/// Milliseconds elapsed since `start_ticks`, correcting for one `u32` wraparound.
fn elapsed_ms<C: Clock>(clock: &C, start_ticks: u32) -> u32 {
    let ticks = clock.now_ticks().wrapping_sub(start_ticks);
    ((ticks as u64) * 1000 / clock.ticks_per_second().max(1) as u64) as u32
}

/// Applies up to ±10% jitter to `base_ms` (spec.md §4.5).
fn jittered(rng: &mut impl RngCore, base_ms: u32) -> u32 {
    let span = base_ms / 5;
    if span == 0 {
        return base_ms;
    }

    let delta = (rng.next_u32() % (span + 1)) as i64 - (span as i64 / 2);
    (base_ms as i64 + delta).max(1) as u32
}

/// Sends `datagram` and waits up to `rx_timeout_ms` for a matching reply, retransmitting
/// on a growing backoff up to `max_retries` times. `accept` filters decoded packets
/// beyond the mandatory `is_for_us(mac, xid)` check (e.g. "is this an OFFER or a NAK").
///
/// Returns the byte length of the accepted reply inside `recv_buf` on success, or
/// `on_exhausted` (spec.md distinguishes `NoOffer` for DISCOVER from `RxTimeout` for
/// REQUEST) once retries run out without a matching reply.
#[allow(clippy::too_many_arguments)]
pub async fn send_and_wait<'buf, S, C, R>(
    sockets: &mut S,
    clock: &C,
    rng: &mut R,
    if_id: u32,
    dst: SocketAddrV4,
    datagram: &[u8],
    recv_buf: &'buf mut [u8],
    mac: [u8; 6],
    xid: u32,
    rx_timeout_ms: u32,
    max_retries: u8,
    on_exhausted: Error,
    accept: impl Fn(&Packet<'_>) -> bool,
) -> Result<usize, TransportError<S::Error>>
where
    S: Sockets,
    C: Clock,
    R: RngCore,
{
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    for attempt in 0..=max_retries {
        sockets
            .send_to(if_id, dst, datagram)
            .await
            .map_err(TransportError::Io)?;

        sockets.shrink_rxq(if_id).await.map_err(TransportError::Io)?;
        let outcome =
            wait_for_match(sockets, clock, recv_buf, if_id, &mac, xid, rx_timeout_ms, &accept).await;
        sockets.restore_rxq(if_id).await.map_err(TransportError::Io)?;

        match outcome? {
            Some(len) => return Ok(len),
            None => {
                if attempt == max_retries {
                    return Err(TransportError::Core(on_exhausted));
                }
                clock.sleep_ms(jittered(rng, backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }

    Err(TransportError::Core(on_exhausted))
}

/// Drains datagrams for up to `wait_ms`, discarding anything that isn't `is_for_us` or
/// fails `accept`, returning the first one that passes both.
async fn wait_for_match<'buf, S, C>(
    sockets: &mut S,
    clock: &C,
    recv_buf: &'buf mut [u8],
    if_id: u32,
    mac: &[u8; 6],
    xid: u32,
    wait_ms: u32,
    accept: &impl Fn(&Packet<'_>) -> bool,
) -> Result<Option<usize>, TransportError<S::Error>>
where
    S: Sockets,
    C: Clock,
{
    let start = clock.now_ticks();

    loop {
        let elapsed = elapsed_ms(clock, start);
        let remaining = wait_ms.saturating_sub(elapsed);
        if remaining == 0 {
            return Ok(None);
        }

        let len = match sockets
            .recv_from(if_id, recv_buf, remaining)
            .await
            .map_err(TransportError::Io)?
        {
            Some(len) => len,
            None => return Ok(None),
        };

        let matched = match Packet::decode(&recv_buf[..len]) {
            Ok(packet) => packet.is_for_us(mac, xid) && accept(&packet),
            Err(_) => false,
        };

        if matched {
            return Ok(Some(len));
        }
    }
}
