//! Per-interface lease state (component C2, spec.md §3/§4.2).

use core::sync::atomic::{AtomicU8, Ordering};

use no_std_net::Ipv4Addr;

use crate::error::Error;
use crate::wire::{Packet, Settings, RECOMMENDED_BUF_LEN};

/// Per-interface lease state machine states (spec.md §3).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    None,
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
    InitReboot,
    LocalLink,
    Stopping,
}

/// Observable lease status (spec.md §3), atomically published so `check_status` can
/// read it without the global lock.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum LeaseStatus {
    None = 0,
    InProgress = 1,
    Cfgd = 2,
    CfgdNoTimer = 3,
    CfgdLocalLink = 4,
    Failed = 5,
}

impl LeaseStatus {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::InProgress,
            2 => Self::Cfgd,
            3 => Self::CfgdNoTimer,
            4 => Self::CfgdLocalLink,
            5 => Self::Failed,
            _ => Self::None,
        }
    }
}

/// `last_error` sentinel meaning "no error recorded".
const NO_ERROR: u8 = 0xFF;

/// One entry in the process-wide interface set (spec.md §3 "Interface Record").
pub struct InterfaceRecord<const P: usize> {
    pub if_id: u32,
    pub state: State,
    lease_status: AtomicU8,
    last_error: AtomicU8,
    pub hw_addr: [u8; 6],
    pub xid_base: u32,
    pub xid: u32,
    pub server_id: Option<Ipv4Addr>,
    pub req_params: heapless::Vec<u8, P>,
    pub nego_started_at: Option<u32>,
    pub lease_secs: Option<u32>,
    pub t1_secs: Option<u32>,
    pub t2_secs: Option<u32>,
    pub timer_handle: Option<usize>,
    last_msg_buf: heapless::Vec<u8, RECOMMENDED_BUF_LEN>,
    last_settings: Option<Settings>,
}

impl<const P: usize> InterfaceRecord<P> {
    pub fn new(if_id: u32, hw_addr: [u8; 6], req_params: &[u8]) -> Self {
        // spec's transaction_id_base = hw[3]<<24 | hw[4]<<16 | hw[5]<<8.
        let xid_base = u32::from_be_bytes([hw_addr[3], hw_addr[4], hw_addr[5], 0]);

        let mut params = heapless::Vec::new();
        for &p in req_params.iter().take(P) {
            let _ = params.push(p);
        }

        Self {
            if_id,
            state: State::None,
            lease_status: AtomicU8::new(LeaseStatus::None as u8),
            last_error: AtomicU8::new(NO_ERROR),
            hw_addr,
            xid_base,
            xid: xid_base,
            server_id: None,
            req_params: params,
            nego_started_at: None,
            lease_secs: None,
            t1_secs: None,
            t2_secs: None,
            timer_handle: None,
            last_msg_buf: heapless::Vec::new(),
            last_settings: None,
        }
    }

    /// Invariant I5: xid changes between any two transmissions that are not bit-identical
    /// retransmits of the same logical request.
    pub fn next_xid(&mut self) -> u32 {
        self.xid = self.xid.wrapping_add(1);
        self.xid
    }

    pub fn lease_status(&self) -> LeaseStatus {
        LeaseStatus::from_u8(self.lease_status.load(Ordering::Acquire))
    }

    pub fn set_lease_status(&self, status: LeaseStatus) {
        self.lease_status.store(status as u8, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<Error> {
        let v = self.last_error.load(Ordering::Acquire);
        if v == NO_ERROR {
            None
        } else {
            Error::from_u8(v)
        }
    }

    pub fn set_last_error(&self, err: Error) {
        self.last_error.store(err as u8, Ordering::Release);
    }

    pub fn accept_msg(&mut self, packet: &Packet<'_>, raw: &[u8]) -> bool {
        self.last_msg_buf.clear();
        if self.last_msg_buf.extend_from_slice(raw).is_err() {
            return false;
        }

        self.last_settings = Some(packet.into());
        true
    }

    pub fn last_settings(&self) -> Option<&Settings> {
        self.last_settings.as_ref()
    }

    pub fn last_msg(&self) -> Option<Packet<'_>> {
        if self.last_msg_buf.is_empty() {
            None
        } else {
            Packet::decode(&self.last_msg_buf).ok()
        }
    }

    pub fn forget_lease(&mut self) {
        self.server_id = None;
        self.lease_secs = None;
        self.t1_secs = None;
        self.t2_secs = None;
        self.timer_handle = None;
        self.last_msg_buf.clear();
        self.last_settings = None;
    }
}

/// Fixed-capacity set of interface records (spec.md §4.2: "Records live in a process-wide
/// set whose size is fixed at configuration time"). `N` is `MAX_IFACES`, `P` is
/// `PARAM_REQ_TBL_SIZE`.
pub struct InterfaceTable<const N: usize, const P: usize> {
    slots: [Option<InterfaceRecord<P>>; N],
}

impl<const N: usize, const P: usize> InterfaceTable<N, P> {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; N],
        }
    }

    /// Invariant I4: only one record per `if_id`. Fails with `PoolEmpty` if the table has
    /// no free slot, or if `if_id` is already present.
    pub fn acquire(&mut self, if_id: u32, hw_addr: [u8; 6], req_params: &[u8]) -> Result<(), Error> {
        if self.slots.iter().flatten().any(|r| r.if_id == if_id) {
            return Err(Error::InterfaceNotManaged);
        }

        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(Error::PoolEmpty)?;

        *slot = Some(InterfaceRecord::new(if_id, hw_addr, req_params));
        Ok(())
    }

    pub fn lookup(&self, if_id: u32) -> Option<&InterfaceRecord<P>> {
        self.slots.iter().flatten().find(|r| r.if_id == if_id)
    }

    pub fn lookup_mut(&mut self, if_id: u32) -> Option<&mut InterfaceRecord<P>> {
        self.slots.iter_mut().flatten().find(|r| r.if_id == if_id)
    }

    pub fn release(&mut self, if_id: u32) {
        if let Some(slot) = self.slots.iter_mut().find(|s| {
            s.as_ref().map(|r| r.if_id) == Some(if_id)
        }) {
            *slot = None;
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InterfaceRecord<P>> {
        self.slots.iter_mut().flatten()
    }
}

impl<const N: usize, const P: usize> Default for InterfaceTable<N, P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release_frees_the_slot() {
        let mut table: InterfaceTable<2, 4> = InterfaceTable::new();

        table.acquire(1, [0, 1, 2, 3, 4, 5], &[]).unwrap();
        assert!(table.lookup(1).is_some());

        assert_eq!(
            table.acquire(1, [0, 1, 2, 3, 4, 5], &[]).unwrap_err(),
            Error::InterfaceNotManaged
        );

        table.release(1);
        assert!(table.lookup(1).is_none());

        // The slot is reusable once released.
        table.acquire(1, [0, 1, 2, 3, 4, 5], &[]).unwrap();
        assert!(table.lookup(1).is_some());
    }

    #[test]
    fn acquire_fails_when_pool_is_exhausted() {
        let mut table: InterfaceTable<1, 4> = InterfaceTable::new();

        table.acquire(1, [0; 6], &[]).unwrap();
        assert_eq!(
            table.acquire(2, [0; 6], &[]).unwrap_err(),
            Error::PoolEmpty
        );
    }

    #[test]
    fn xid_base_is_the_low_three_mac_octets_shifted_up_one() {
        let mut table: InterfaceTable<1, 4> = InterfaceTable::new();
        table.acquire(7, [0xAA, 0xBB, 0x11, 0x22, 0x33, 0x44], &[]).unwrap();

        let record = table.lookup(7).unwrap();
        assert_eq!(record.xid_base, 0x2233_4400);
        assert_eq!(record.xid, record.xid_base);
        assert_eq!(record.hw_addr, [0xAA, 0xBB, 0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn xid_strictly_increases_across_exchanges() {
        let mut table: InterfaceTable<1, 4> = InterfaceTable::new();
        table.acquire(1, [0; 6], &[]).unwrap();

        let record = table.lookup_mut(1).unwrap();
        let first = record.next_xid();
        let second = record.next_xid();
        assert!(second > first);
    }
}
