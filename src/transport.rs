//! External collaborator contracts (spec.md §1 "out of scope" / §6).
//!
//! The client core never talks to a socket, an ARP cache or the IPv4 stack
//! directly - it is generic over narrow traits, the same shape the teacher
//! uses for its own transport dependency (`edge_nal::{UdpReceive, UdpSend}`).
//! A host integration implements these against its real UDP stack, ARP
//! table and IP configuration API; the `sim` module (feature `std`)
//! implements them in-memory for this crate's own tests.

use no_std_net::{Ipv4Addr, SocketAddrV4};

/// Per-interface UDP transport (§6: `open_udp`, `bind_iface`, `bind`, `sendto`, `recvfrom`,
/// `set_rxq_size`, `close`).
pub trait Sockets {
    type Error;

    /// Opens and binds a UDP socket for `if_id` to `local`. `local` is `0.0.0.0:68` except
    /// while RENEWING, where it is bound to the current `ciaddr`.
    async fn open(&mut self, if_id: u32, local: SocketAddrV4) -> Result<(), Self::Error>;

    async fn send_to(&mut self, if_id: u32, dst: SocketAddrV4, data: &[u8])
        -> Result<(), Self::Error>;

    /// Receives one datagram, waiting at most `timeout_ms`. Returns `Ok(None)` on a
    /// clean timeout (no datagram arrived) so callers can distinguish it from an error.
    async fn recv_from(
        &mut self,
        if_id: u32,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<Option<usize>, Self::Error>;

    /// §4.5/§9: shrink the receive queue to its minimum during a backoff sleep so a
    /// broadcast OFFER flood can't exhaust memory while nobody is reading. A transport
    /// whose socket layer already bounds queues per-socket may no-op both of these (§9).
    async fn shrink_rxq(&mut self, _if_id: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn restore_rxq(&mut self, _if_id: u32) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn close(&mut self, if_id: u32) -> Result<(), Self::Error>;
}

/// ARP collaborator (§6: `probe`, `cache_lookup`, `gratuitous`).
pub trait Arp {
    type Error;

    /// Sends an ARP probe (sender IP `0.0.0.0`, target IP `target`) for `if_id`.
    async fn probe(&mut self, if_id: u32, target: Ipv4Addr) -> Result<(), Self::Error>;

    /// Consults the ARP cache; `Some` means a resolved entry exists for `target`.
    async fn cache_lookup(
        &mut self,
        if_id: u32,
        target: Ipv4Addr,
    ) -> Result<Option<[u8; 6]>, Self::Error>;

    /// Sends `count` gratuitous ARP announcements for `addr` on `if_id`.
    async fn gratuitous(&mut self, if_id: u32, addr: Ipv4Addr) -> Result<(), Self::Error>;
}

/// IPv4 stack collaborator (§6: `begin_dynamic`, `set_dynamic_addr`, `remove_all`, `is_enabled`).
pub trait IpConfig {
    type Error;

    /// Removes any existing addresses on `if_id`, preparing it for dynamic configuration.
    async fn begin_dynamic(&mut self, if_id: u32) -> Result<(), Self::Error>;

    async fn set_dynamic_addr(
        &mut self,
        if_id: u32,
        addr: Ipv4Addr,
        mask: Option<Ipv4Addr>,
        gateway: Option<Ipv4Addr>,
    ) -> Result<(), Self::Error>;

    async fn remove_all(&mut self, if_id: u32) -> Result<(), Self::Error>;

    async fn is_enabled(&mut self, if_id: u32) -> Result<bool, Self::Error>;
}

/// Interface collaborator (§6: `get_hw_addr`).
pub trait Interfaces {
    type Error;

    async fn hw_addr(&mut self, if_id: u32) -> Result<[u8; 6], Self::Error>;
}

/// Monotonic time source (§6: `now_ticks`, `ticks_per_second`, `elapsed_secs`) plus sleep.
///
/// Ticks are a plain `u32`, as spec.md §6 specifies (`now_ticks() -> u32`), with the
/// single wraparound correction applied inside `elapsed_secs`. Concrete clients derive
/// this from `embassy_time::Instant`; the `sim` module uses a virtual clock so tests
/// don't sleep in real time.
pub trait Clock {
    fn now_ticks(&self) -> u32;

    fn ticks_per_second(&self) -> u32;

    /// Elapsed whole seconds between two tick readings, correcting for one `u32` wraparound.
    fn elapsed_secs(&self, start: u32, stop: u32) -> u32 {
        let ticks = stop.wrapping_sub(start);
        ticks / self.ticks_per_second()
    }

    async fn sleep_ms(&self, ms: u32);
}
