//! In-memory fakes of the four transport collaborators plus a virtual [`Clock`], for this
//! crate's own integration tests. `std`-gated only; mirrors the teacher's own `#[cfg(test)]`
//! in-memory fakes (`edge-http::io::test`'s `SliceRead`/`SliceWrite`) rather than being part
//! of the public contract.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};

use no_std_net::{Ipv4Addr, SocketAddrV4};

use crate::transport::{Arp, Clock, Interfaces, IpConfig, Sockets};

/// Virtual clock: `sleep_ms` advances the tick counter directly instead of actually
/// sleeping, so a whole lease lifecycle (backoff, T1/T2, lease expiry) runs in a test
/// process in microseconds of wall-clock time.
#[derive(Default)]
pub struct SimClock {
    ticks: RefCell<u32>,
}

impl Clock for SimClock {
    fn now_ticks(&self) -> u32 {
        *self.ticks.borrow()
    }

    fn ticks_per_second(&self) -> u32 {
        1000
    }

    async fn sleep_ms(&self, ms: u32) {
        *self.ticks.borrow_mut() += ms;
    }
}

/// A configured IPv4 address on a simulated interface.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ConfiguredAddr {
    pub addr: Ipv4Addr,
    pub mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
}

/// In-memory UDP transport. Datagrams queued with [`SimSockets::push_inbound`] are what
/// `recv_from` hands back; everything passed to `send_to` is recorded for assertions
/// rather than actually delivered anywhere (tests that need a request/reply exchange
/// push the simulated server's reply in after inspecting what was sent).
#[derive(Default)]
pub struct SimSockets {
    inbound: RefCell<HashMap<u32, VecDeque<heapless::Vec<u8, 600>>>>,
    sent: RefCell<Vec<(u32, SocketAddrV4, heapless::Vec<u8, 600>)>>,
    bound: RefCell<HashMap<u32, SocketAddrV4>>,
}

impl SimSockets {
    pub fn push_inbound(&self, if_id: u32, datagram: &[u8]) {
        let mut buf: heapless::Vec<u8, 600> = heapless::Vec::new();
        buf.extend_from_slice(datagram).expect("datagram fits the sim buffer");
        self.inbound.borrow_mut().entry(if_id).or_default().push_back(buf);
    }

    pub fn sent_count(&self, if_id: u32) -> usize {
        self.sent.borrow().iter().filter(|(id, ..)| *id == if_id).count()
    }

    pub fn last_sent(&self, if_id: u32) -> Option<heapless::Vec<u8, 600>> {
        self.sent.borrow().iter().rev().find(|(id, ..)| *id == if_id).map(|(_, _, d)| d.clone())
    }

    pub fn bound_addr(&self, if_id: u32) -> Option<SocketAddrV4> {
        self.bound.borrow().get(&if_id).copied()
    }
}

impl Sockets for SimSockets {
    type Error = ();

    async fn open(&mut self, if_id: u32, local: SocketAddrV4) -> Result<(), ()> {
        self.bound.borrow_mut().insert(if_id, local);
        Ok(())
    }

    async fn send_to(&mut self, if_id: u32, dst: SocketAddrV4, data: &[u8]) -> Result<(), ()> {
        let mut buf: heapless::Vec<u8, 600> = heapless::Vec::new();
        buf.extend_from_slice(data).map_err(|_| ())?;
        self.sent.borrow_mut().push((if_id, dst, buf));
        Ok(())
    }

    async fn recv_from(
        &mut self,
        if_id: u32,
        buf: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<Option<usize>, ()> {
        let Some(datagram) = self
            .inbound
            .borrow_mut()
            .get_mut(&if_id)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };

        if datagram.len() > buf.len() {
            return Err(());
        }
        buf[..datagram.len()].copy_from_slice(&datagram);
        Ok(Some(datagram.len()))
    }

    async fn close(&mut self, if_id: u32) -> Result<(), ()> {
        self.bound.borrow_mut().remove(&if_id);
        self.inbound.borrow_mut().remove(&if_id);
        Ok(())
    }
}

/// In-memory ARP table: `owners` models every address currently claimed on the
/// simulated network, independent of `if_id` (as a real shared-medium ARP cache would be).
#[derive(Default)]
pub struct SimArp {
    owners: RefCell<HashMap<Ipv4Addr, [u8; 6]>>,
    gratuitous_sent: RefCell<HashMap<(u32, Ipv4Addr), u32>>,
}

impl SimArp {
    pub fn claim(&self, addr: Ipv4Addr, mac: [u8; 6]) {
        self.owners.borrow_mut().insert(addr, mac);
    }

    pub fn gratuitous_count(&self, if_id: u32, addr: Ipv4Addr) -> u32 {
        *self.gratuitous_sent.borrow().get(&(if_id, addr)).unwrap_or(&0)
    }
}

impl Arp for SimArp {
    type Error = ();

    async fn probe(&mut self, _if_id: u32, _target: Ipv4Addr) -> Result<(), ()> {
        Ok(())
    }

    async fn cache_lookup(&mut self, _if_id: u32, target: Ipv4Addr) -> Result<Option<[u8; 6]>, ()> {
        Ok(self.owners.borrow().get(&target).copied())
    }

    async fn gratuitous(&mut self, if_id: u32, addr: Ipv4Addr) -> Result<(), ()> {
        *self.gratuitous_sent.borrow_mut().entry((if_id, addr)).or_insert(0) += 1;
        self.owners.borrow_mut().insert(addr, [if_id as u8; 6]);
        Ok(())
    }
}

/// In-memory IPv4 stack: tracks the one configured address per interface, plus which
/// interfaces are administratively disabled (all are enabled by default, independent of
/// whether an address is configured yet - `is_enabled` is checked before acquisition).
#[derive(Default)]
pub struct SimIpConfig {
    configured: RefCell<HashMap<u32, ConfiguredAddr>>,
    disabled: RefCell<HashSet<u32>>,
}

impl SimIpConfig {
    pub fn configured(&self, if_id: u32) -> Option<ConfiguredAddr> {
        self.configured.borrow().get(&if_id).copied()
    }

    pub fn disable(&self, if_id: u32) {
        self.disabled.borrow_mut().insert(if_id);
    }
}

impl IpConfig for SimIpConfig {
    type Error = ();

    async fn begin_dynamic(&mut self, if_id: u32) -> Result<(), ()> {
        self.configured.borrow_mut().remove(&if_id);
        Ok(())
    }

    async fn set_dynamic_addr(
        &mut self,
        if_id: u32,
        addr: Ipv4Addr,
        mask: Option<Ipv4Addr>,
        gateway: Option<Ipv4Addr>,
    ) -> Result<(), ()> {
        self.configured.borrow_mut().insert(if_id, ConfiguredAddr { addr, mask, gateway });
        Ok(())
    }

    async fn remove_all(&mut self, if_id: u32) -> Result<(), ()> {
        self.configured.borrow_mut().remove(&if_id);
        Ok(())
    }

    async fn is_enabled(&mut self, if_id: u32) -> Result<bool, ()> {
        Ok(!self.disabled.borrow().contains(&if_id))
    }
}

/// Fixed hardware-address table, seeded at construction.
pub struct SimInterfaces {
    hw_addrs: HashMap<u32, [u8; 6]>,
}

impl SimInterfaces {
    pub fn new(hw_addrs: impl IntoIterator<Item = (u32, [u8; 6])>) -> Self {
        Self {
            hw_addrs: hw_addrs.into_iter().collect(),
        }
    }
}

impl Interfaces for SimInterfaces {
    type Error = ();

    async fn hw_addr(&mut self, if_id: u32) -> Result<[u8; 6], ()> {
        self.hw_addrs.get(&if_id).copied().ok_or(())
    }
}
