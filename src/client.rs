//! State machine / Dispatcher (component C7, spec.md §4.7).
//!
//! Two logical tasks share one global [`Mutex`]-guarded [`Inner`]: the Dispatcher, which
//! blocks on the [`CommandQueue`] and holds the lock across whatever blocking I/O a
//! transition needs, and the Ticker, which wakes once a second, walks the [`TimerWheel`]
//! under the same lock, and re-posts any expired entry as a fresh command. `Client::run`
//! composes both with `select`, the same shape `edge-mdns::io::Mdns::run` uses to race its
//! broadcast and respond loops.
//!
//! `check_status` never takes the lock: each managed interface publishes its
//! `lease_status`/`last_error` into a parallel array of plain atomics so a caller can poll
//! it even while the Dispatcher is blocked deep inside a retransmission's backoff sleep.

use core::pin::pin;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use no_std_net::{Ipv4Addr, SocketAddrV4};
use rand_core::RngCore;

use crate::config::Config;
use crate::error::{Error, TransportError};
use crate::iface::{InterfaceTable, LeaseStatus, State};
use crate::linklocal;
use crate::probe::{self, ProbeOutcome};
use crate::queue::{Command, CommandKind, CommandQueue};
use crate::retransmit::send_and_wait;
use crate::timer::TimerWheel;
use crate::transport::{Arp, Clock, Interfaces, IpConfig, Sockets};
use crate::wire::{MessageType, Packet, RequestBuilder, Settings, RECOMMENDED_BUF_LEN};

/// `if_id` sentinel meaning "this status slot is not currently assigned".
const UNASSIGNED: u32 = u32::MAX;

struct StatusCell {
    if_id: AtomicU32,
    lease_status: AtomicU8,
    last_error: AtomicU8,
}

impl StatusCell {
    const fn new() -> Self {
        Self {
            if_id: AtomicU32::new(UNASSIGNED),
            lease_status: AtomicU8::new(LeaseStatus::None as u8),
            last_error: AtomicU8::new(0xFF),
        }
    }
}

struct Inner<S, A, I, IF, R, const N: usize, const P: usize> {
    table: InterfaceTable<N, P>,
    wheel: TimerWheel<N>,
    sockets: S,
    arp: A,
    ipcfg: I,
    ifaces: IF,
    rng: R,
}

/// Ties together every external collaborator (spec.md §6) with the fixed-capacity
/// interface/timer pools behind one global lock, mirroring `dhcp-c.h`'s single
/// process-wide client instance.
pub struct Client<'q, M, S, A, I, IF, C, R, const N: usize, const P: usize, const CAP: usize>
where
    M: RawMutex,
{
    inner: Mutex<M, Inner<S, A, I, IF, R, N, P>>,
    clock: C,
    queue: &'q CommandQueue<M, CAP>,
    config: Config,
    status: [StatusCell; N],
}

impl<'q, M, S, A, I, IF, C, R, const N: usize, const P: usize, const CAP: usize>
    Client<'q, M, S, A, I, IF, C, R, N, P, CAP>
where
    M: RawMutex,
    S: Sockets,
    A: Arp<Error = S::Error>,
    I: IpConfig<Error = S::Error>,
    IF: Interfaces<Error = S::Error>,
    C: Clock,
    R: RngCore,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sockets: S,
        arp: A,
        ipcfg: I,
        ifaces: IF,
        rng: R,
        clock: C,
        queue: &'q CommandQueue<M, CAP>,
        config: Config,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                table: InterfaceTable::new(),
                wheel: TimerWheel::new(),
                sockets,
                arp,
                ipcfg,
                ifaces,
                rng,
            }),
            clock,
            queue,
            config,
            status: [const { StatusCell::new() }; N],
        }
    }

    /// Begins managing `if_id`: fetches its hardware address, reserves an interface
    /// record, and queues a `Start` command for the Dispatcher. Invariant I4 (one record
    /// per `if_id`) and I2 (pool exhaustion surfaces as `PoolEmpty`) are enforced here.
    pub async fn start(&self, if_id: u32, extra_req_params: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        let hw_addr = inner
            .ifaces
            .hw_addr(if_id)
            .await
            .map_err(|_| Error::HwAddrInvalid)?;

        inner.table.acquire(if_id, hw_addr, extra_req_params)?;
        if let Some(record) = inner.table.lookup_mut(if_id) {
            record.state = State::Init;
        }

        drop(inner);

        self.claim_status(if_id);
        self.publish(if_id, LeaseStatus::InProgress, None);

        self.queue.post(Command {
            if_id,
            kind: CommandKind::Start,
        })
    }

    /// Tears down `if_id`: cancels its timers, releases the lease and interface record.
    /// Invariant P8 (no dangling timer after release) is enforced by `cancel_all_for`.
    pub async fn stop(&self, if_id: u32) -> Result<(), Error> {
        self.queue.post(Command {
            if_id,
            kind: CommandKind::Stop,
        })
    }

    /// Lock-free status read (spec.md §7's "check_status must not block on the dispatcher").
    pub fn check_status(&self, if_id: u32) -> Result<(LeaseStatus, Option<Error>), Error> {
        let cell = self
            .status
            .iter()
            .find(|c| c.if_id.load(Ordering::Acquire) == if_id)
            .ok_or(Error::InterfaceNotManaged)?;

        let status = LeaseStatus::from_u8(cell.lease_status.load(Ordering::Acquire));
        let raw_err = cell.last_error.load(Ordering::Acquire);
        let err = if raw_err == 0xFF { None } else { Error::from_u8(raw_err) };

        Ok((status, err))
    }

    /// Copies the raw option payload of `code` from the last accepted lease message
    /// (spec.md §7 `get_option`). `OptionAbsent` if the interface has no lease, or the
    /// option wasn't present in the last message; `OptionBufferTooSmall` if `out` can't
    /// hold it.
    pub async fn get_option(&self, if_id: u32, code: u8, out: &mut [u8]) -> Result<usize, Error> {
        let inner = self.inner.lock().await;
        let record = inner.table.lookup(if_id).ok_or(Error::InterfaceNotManaged)?;
        let packet = record.last_msg().ok_or(Error::InterfaceNotConfigured)?;

        let data = packet.options().find_raw(code).ok_or(Error::OptionAbsent)?;
        if data.len() > out.len() {
            return Err(Error::OptionBufferTooSmall);
        }

        out[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    /// Runs the Dispatcher and Ticker tasks until either returns (they don't, barring a
    /// collaborator error it can't recover from).
    pub async fn run(&self) -> Result<(), TransportError<S::Error>> {
        let mut dispatcher = pin!(self.run_dispatcher());
        let mut ticker = pin!(self.run_ticker());

        match select(&mut dispatcher, &mut ticker).await {
            Either::First(r) => r,
            Either::Second(r) => r,
        }
    }

    async fn run_dispatcher(&self) -> Result<(), TransportError<S::Error>> {
        loop {
            let cmd = self.queue.wait().await;
            self.dispatch(cmd).await?;
        }
    }

    async fn run_ticker(&self) -> Result<(), TransportError<S::Error>> {
        loop {
            self.clock.sleep_ms(1_000).await;

            let expired: heapless::Vec<Command, N> = {
                let mut inner = self.inner.lock().await;
                inner.wheel.tick()
            };

            for cmd in expired {
                // QueueFull here means the Dispatcher is badly backlogged; dropping the
                // re-fired timer event is preferable to blocking the Ticker indefinitely.
                let _ = self.queue.post(cmd);
            }
        }
    }

    fn claim_status(&self, if_id: u32) {
        if self.status.iter().any(|c| c.if_id.load(Ordering::Acquire) == if_id) {
            return;
        }
        if let Some(cell) = self
            .status
            .iter()
            .find(|c| c.if_id.load(Ordering::Acquire) == UNASSIGNED)
        {
            cell.lease_status.store(LeaseStatus::None as u8, Ordering::Release);
            cell.last_error.store(0xFF, Ordering::Release);
            cell.if_id.store(if_id, Ordering::Release);
        }
    }

    fn release_status(&self, if_id: u32) {
        if let Some(cell) = self.status.iter().find(|c| c.if_id.load(Ordering::Acquire) == if_id) {
            cell.if_id.store(UNASSIGNED, Ordering::Release);
        }
    }

    fn publish(&self, if_id: u32, status: LeaseStatus, err: Option<Error>) {
        if let Some(cell) = self.status.iter().find(|c| c.if_id.load(Ordering::Acquire) == if_id) {
            cell.lease_status.store(status as u8, Ordering::Release);
            cell.last_error
                .store(err.map(|e| e as u8).unwrap_or(0xFF), Ordering::Release);
        }
    }

    async fn dispatch(&self, cmd: Command) -> Result<(), TransportError<S::Error>> {
        match cmd.kind {
            CommandKind::Start => self.handle_start(cmd.if_id).await,
            CommandKind::T1Expired => self.handle_t1(cmd.if_id).await,
            CommandKind::T2Expired => self.handle_t2(cmd.if_id).await,
            CommandKind::LeaseExpired => self.handle_lease_expired(cmd.if_id).await,
            CommandKind::Stop => self.handle_stop(cmd.if_id).await,
        }
    }

    /// INIT -> SELECTING -> REQUESTING -> BOUND, with a RFC 3927 fallback to LOCAL_LINK
    /// when no server answers (spec.md §4.7.b) and a DECLINE-and-retry loop if address
    /// validation finds the offered address already in use (§4.6).
    async fn handle_start(&self, if_id: u32) -> Result<(), TransportError<S::Error>> {
        let mut inner = self.inner.lock().await;

        if !inner.ipcfg.is_enabled(if_id).await.map_err(TransportError::Io)? {
            self.fail(&mut inner, if_id, State::Stopping, Error::InterfaceInvalid);
            return Ok(());
        }

        let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.client_port);
        inner.sockets.open(if_id, local).await.map_err(TransportError::Io)?;

        let negotiated = self.negotiate(&mut inner, if_id).await;

        match negotiated {
            Ok(settings) => self.enter_bound(&mut inner, if_id, settings).await?,
            Err(TransportError::Core(Error::NoOffer)) if self.config.local_link_enabled => {
                drop_record_timers(&mut inner, if_id);

                match linklocal::acquire(
                    &mut inner.arp,
                    &self.clock,
                    &mut inner.rng,
                    if_id,
                    self.config.local_link_max_retry,
                )
                .await
                {
                    Ok(addr) => {
                        inner
                            .ipcfg
                            .begin_dynamic(if_id)
                            .await
                            .map_err(TransportError::Io)?;
                        inner
                            .ipcfg
                            .set_dynamic_addr(if_id, addr, Some(Ipv4Addr::new(255, 255, 0, 0)), None)
                            .await
                            .map_err(TransportError::Io)?;

                        if let Some(record) = inner.table.lookup_mut(if_id) {
                            record.state = State::LocalLink;
                        }
                        self.publish(if_id, LeaseStatus::CfgdLocalLink, None);
                    }
                    Err(err) => {
                        self.fail(&mut inner, if_id, State::Stopping, core_error(err));
                    }
                }
            }
            Err(err) => self.fail(&mut inner, if_id, State::Init, core_error(err)),
        }

        Ok(())
    }

    /// INIT handler step 4 (§4.7): loops up to `Config::nego_retries` DISCOVER/REQUEST
    /// cycles. A NAK or an ARP-confirmed address conflict delays `NEGO_RETRY_DELAY_MS`
    /// and retries rather than failing the interface; only an exhausted retry budget
    /// returns an error to `handle_start`.
    async fn negotiate(
        &self,
        inner: &mut Inner<S, A, I, IF, R, N, P>,
        if_id: u32,
    ) -> Result<Settings, TransportError<S::Error>> {
        let mut last_err = TransportError::Core(Error::NoOffer);

        for attempt in 0..=self.config.nego_retries {
            match self.negotiate_once(inner, if_id).await {
                Ok(settings) => return Ok(settings),
                Err(err @ TransportError::Core(Error::NakReceived | Error::AddrInUse)) => {
                    last_err = err;
                    if attempt < self.config.nego_retries {
                        self.clock.sleep_ms(crate::config::NEGO_RETRY_DELAY_MS).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err)
    }

    /// Runs the DISCOVER/OFFER/REQUEST/ACK exchange once, ARP-validating the offered
    /// address when `addr_validate_enabled` (§4.6), and returns the accepted lease's
    /// [`Settings`]. A USED outcome sends DECLINE and returns `Error::AddrInUse` so
    /// `negotiate`'s retry loop restarts the cycle; FREE and INCONCLUSIVE both proceed.
    async fn negotiate_once(
        &self,
        inner: &mut Inner<S, A, I, IF, R, N, P>,
        if_id: u32,
    ) -> Result<Settings, TransportError<S::Error>> {
        let record = inner
            .table
            .lookup_mut(if_id)
            .ok_or(TransportError::Core(Error::InterfaceNotManaged))?;

        record.state = State::Selecting;
        let mac = record.hw_addr;
        let xid = record.next_xid();
        let req_params: heapless::Vec<u8, P> = record.req_params.clone();

        let rb = RequestBuilder {
            xid,
            secs: 0,
            mac,
            our_ip: None,
            broadcast: self.config.broadcast_bit_enabled,
        };

        let mut tx_buf = [0u8; RECOMMENDED_BUF_LEN];
        let discover = rb
            .discover(None, &req_params, &mut tx_buf)
            .map_err(|e| TransportError::Core(e.into()))?;

        let dst = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.config.server_port);
        let mut rx_buf = [0u8; RECOMMENDED_BUF_LEN];

        let len = send_and_wait(
            &mut inner.sockets,
            &self.clock,
            &mut inner.rng,
            if_id,
            dst,
            discover,
            &mut rx_buf,
            mac,
            xid,
            self.config.rx_inactivity_ms,
            self.config.discover_retries,
            Error::NoOffer,
            |p| p.message_type() == Some(MessageType::Offer),
        )
        .await?;

        let offer = Packet::decode(&rx_buf[..len]).map_err(|e| TransportError::Core(e.into()))?;
        let offer_settings: Settings = (&offer).into();

        let req_xid = {
            let record = inner
                .table
                .lookup_mut(if_id)
                .ok_or(TransportError::Core(Error::InterfaceNotManaged))?;
            record.state = State::Requesting;
            record.next_xid()
        };

        let rb = RequestBuilder {
            xid: req_xid,
            secs: 0,
            mac,
            our_ip: None,
            broadcast: self.config.broadcast_bit_enabled,
        };

        let mut tx_buf = [0u8; RECOMMENDED_BUF_LEN];
        let server_id = offer_settings.server_id.ok_or(TransportError::Core(Error::InvalidMsg))?;
        let request = rb
            .request_selecting(offer_settings.ip, server_id, None, &req_params, &mut tx_buf)
            .map_err(|e| TransportError::Core(e.into()))?;

        let mut rx_buf2 = [0u8; RECOMMENDED_BUF_LEN];
        let len = send_and_wait(
            &mut inner.sockets,
            &self.clock,
            &mut inner.rng,
            if_id,
            dst,
            request,
            &mut rx_buf2,
            mac,
            req_xid,
            self.config.rx_inactivity_ms,
            self.config.request_retries,
            Error::RxTimeout,
            |p| matches!(p.message_type(), Some(MessageType::Ack) | Some(MessageType::Nak)),
        )
        .await?;

        let reply = Packet::decode(&rx_buf2[..len]).map_err(|e| TransportError::Core(e.into()))?;

        if reply.message_type() == Some(MessageType::Nak) {
            return Err(TransportError::Core(Error::NakReceived));
        }

        let settings: Settings = (&reply).into();

        if self.config.addr_validate_enabled {
            let outcome = probe::probe(&mut inner.arp, &self.clock, if_id, settings.ip, 1_000, 100).await;

            if let ProbeOutcome::Used(_) = outcome {
                self.decline(inner, if_id, &settings).await?;
                return Err(TransportError::Core(Error::AddrInUse));
            }
        }

        if let Some(record) = inner.table.lookup_mut(if_id) {
            record.accept_msg(&reply, &rx_buf2[..len]);
        }

        Ok(settings)
    }

    /// Hands the negotiated address to the IPv4 stack and arms the T1/lease timers
    /// (§4.7.a). Address validation already happened inside `negotiate_once`.
    async fn enter_bound(
        &self,
        inner: &mut Inner<S, A, I, IF, R, N, P>,
        if_id: u32,
        settings: Settings,
    ) -> Result<(), TransportError<S::Error>> {
        inner
            .ipcfg
            .begin_dynamic(if_id)
            .await
            .map_err(TransportError::Io)?;
        inner
            .ipcfg
            .set_dynamic_addr(if_id, settings.ip, settings.subnet, settings.gateway)
            .await
            .map_err(TransportError::Io)?;

        let lease_secs = settings.lease_secs.unwrap_or(crate::config::INFINITE_LEASE);
        let t1_secs = settings.t1_secs.unwrap_or(lease_secs / 2);
        let t2_secs = settings.t2_secs.unwrap_or(lease_secs * 7 / 8);

        let status = if lease_secs == crate::config::INFINITE_LEASE {
            LeaseStatus::CfgdNoTimer
        } else {
            LeaseStatus::Cfgd
        };

        if let Some(record) = inner.table.lookup_mut(if_id) {
            record.state = State::Bound;
            record.server_id = settings.server_id;
            record.lease_secs = Some(lease_secs);
            record.t1_secs = Some(t1_secs);
            record.t2_secs = Some(t2_secs);

            if lease_secs != crate::config::INFINITE_LEASE {
                record.timer_handle = inner.wheel.arm(
                    if_id,
                    t1_secs,
                    Command {
                        if_id,
                        kind: CommandKind::T1Expired,
                    },
                );
            }
        }

        self.publish(if_id, status, None);
        Ok(())
    }

    async fn decline(
        &self,
        inner: &mut Inner<S, A, I, IF, R, N, P>,
        if_id: u32,
        settings: &Settings,
    ) -> Result<(), TransportError<S::Error>> {
        let Some(record) = inner.table.lookup_mut(if_id) else {
            return Ok(());
        };
        let mac = record.hw_addr;
        let xid = record.next_xid();
        let Some(server_id) = settings.server_id else {
            return Ok(());
        };

        let rb = RequestBuilder {
            xid,
            secs: 0,
            mac,
            our_ip: None,
            broadcast: true,
        };
        let mut buf = [0u8; RECOMMENDED_BUF_LEN];
        let datagram = rb
            .decline(settings.ip, server_id, &mut buf)
            .map_err(|e| TransportError::Core(e.into()))?;

        let dst = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.config.server_port);
        inner
            .sockets
            .send_to(if_id, dst, datagram)
            .await
            .map_err(TransportError::Io)
    }

    /// T1 expiry (§4.7.c): unicasts a REQUEST straight to the lease's server. A NAK or an
    /// exhausted retry budget falls through to REBINDING rather than failing outright.
    async fn handle_t1(&self, if_id: u32) -> Result<(), TransportError<S::Error>> {
        let mut inner = self.inner.lock().await;

        let server_id = {
            let Some(record) = inner.table.lookup_mut(if_id) else {
                return Ok(());
            };
            let Some(server_id) = record.server_id else {
                return Ok(());
            };
            record.state = State::Renewing;
            server_id
        };

        let renewed = self.renew_or_rebind(&mut inner, if_id, Some(server_id)).await;
        self.finish_renewal(&mut inner, if_id, renewed, CommandKind::T2Expired).await
    }

    /// T2 expiry / renewal fallback (§4.7.c): broadcasts the REQUEST so any server on the
    /// link can answer. A NAK or exhausted retries forgets the lease and restarts at INIT.
    async fn handle_t2(&self, if_id: u32) -> Result<(), TransportError<S::Error>> {
        let mut inner = self.inner.lock().await;

        if inner.table.lookup(if_id).is_none() {
            return Ok(());
        }
        if let Some(record) = inner.table.lookup_mut(if_id) {
            record.state = State::Rebinding;
        }

        let rebound = self.renew_or_rebind(&mut inner, if_id, None).await;
        self.finish_renewal(&mut inner, if_id, rebound, CommandKind::LeaseExpired).await
    }

    async fn renew_or_rebind(
        &self,
        inner: &mut Inner<S, A, I, IF, R, N, P>,
        if_id: u32,
        server_id: Option<Ipv4Addr>,
    ) -> Result<Settings, TransportError<S::Error>> {
        let (ip, mac, xid, req_params) = {
            let record = inner
                .table
                .lookup_mut(if_id)
                .ok_or(TransportError::Core(Error::InterfaceNotManaged))?;

            let ip = record
                .last_settings()
                .map(|s| s.ip)
                .ok_or(TransportError::Core(Error::InterfaceNotConfigured))?;
            let mac = record.hw_addr;
            let xid = record.next_xid();
            let req_params: heapless::Vec<u8, P> = record.req_params.clone();
            (ip, mac, xid, req_params)
        };

        let local = SocketAddrV4::new(ip, self.config.client_port);
        inner.sockets.open(if_id, local).await.map_err(TransportError::Io)?;

        let rb = RequestBuilder {
            xid,
            secs: 0,
            mac,
            our_ip: Some(ip),
            broadcast: server_id.is_none() && self.config.broadcast_bit_enabled,
        };

        let mut tx_buf = [0u8; RECOMMENDED_BUF_LEN];
        let request = rb
            .request_renewing(None, &req_params, &mut tx_buf)
            .map_err(|e| TransportError::Core(e.into()))?;

        let dst_ip = server_id.unwrap_or(Ipv4Addr::BROADCAST);
        let dst = SocketAddrV4::new(dst_ip, self.config.server_port);

        let mut rx_buf = [0u8; RECOMMENDED_BUF_LEN];
        let len = send_and_wait(
            &mut inner.sockets,
            &self.clock,
            &mut inner.rng,
            if_id,
            dst,
            request,
            &mut rx_buf,
            mac,
            xid,
            self.config.rx_inactivity_ms,
            self.config.nego_retries,
            Error::RxTimeout,
            |p| matches!(p.message_type(), Some(MessageType::Ack) | Some(MessageType::Nak)),
        )
        .await?;

        let reply = Packet::decode(&rx_buf[..len]).map_err(|e| TransportError::Core(e.into()))?;
        if reply.message_type() == Some(MessageType::Nak) {
            return Err(TransportError::Core(Error::NakReceived));
        }

        if let Some(record) = inner.table.lookup_mut(if_id) {
            record.accept_msg(&reply, &rx_buf[..len]);
        }

        Ok((&reply).into())
    }

    /// Shared tail of T1/T2 handling: on success, re-arm the next timer from the
    /// (possibly shortened, per §4.7.c's `MIN_RETX_TIME_SECS` floor) extended lease; on
    /// failure, fall through to `next_on_failure` rather than declaring the interface dead.
    async fn finish_renewal(
        &self,
        inner: &mut Inner<S, A, I, IF, R, N, P>,
        if_id: u32,
        result: Result<Settings, TransportError<S::Error>>,
        next_on_failure: CommandKind,
    ) -> Result<(), TransportError<S::Error>> {
        match result {
            Ok(settings) => {
                let lease_secs = settings.lease_secs.unwrap_or(crate::config::INFINITE_LEASE);
                let t1_secs = settings
                    .t1_secs
                    .unwrap_or(lease_secs / 2)
                    .max(crate::config::MIN_RETX_TIME_SECS);

                if let Some(record) = inner.table.lookup_mut(if_id) {
                    record.state = State::Bound;
                    record.lease_secs = Some(lease_secs);
                    if lease_secs != crate::config::INFINITE_LEASE {
                        record.timer_handle = inner.wheel.arm(
                            if_id,
                            t1_secs,
                            Command {
                                if_id,
                                kind: CommandKind::T1Expired,
                            },
                        );
                    }
                }
                self.publish(if_id, LeaseStatus::Cfgd, None);
                Ok(())
            }
            Err(TransportError::Core(Error::NakReceived)) | Err(TransportError::Core(Error::RxTimeout)) => {
                if next_on_failure == CommandKind::LeaseExpired {
                    self.handle_lease_expired(if_id).await
                } else {
                    if let Some(record) = inner.table.lookup_mut(if_id) {
                        record.timer_handle = inner.wheel.arm(
                            if_id,
                            crate::config::MIN_RETX_TIME_SECS,
                            Command {
                                if_id,
                                kind: next_on_failure,
                            },
                        );
                    }
                    Ok(())
                }
            }
            Err(other) => {
                self.fail(inner, if_id, State::Init, core_error(other));
                Ok(())
            }
        }
    }

    /// Lease hard-expiry, or an exhausted REBINDING phase: forgets the lease, releases
    /// the configured address, and restarts the acquisition cycle from INIT.
    async fn handle_lease_expired(&self, if_id: u32) -> Result<(), TransportError<S::Error>> {
        {
            let mut inner = self.inner.lock().await;
            inner.ipcfg.remove_all(if_id).await.map_err(TransportError::Io)?;

            if let Some(record) = inner.table.lookup_mut(if_id) {
                record.forget_lease();
                record.state = State::Init;
            }
            drop_record_timers(&mut inner, if_id);
        }

        self.publish(if_id, LeaseStatus::InProgress, None);
        self.handle_start(if_id).await
    }

    async fn handle_stop(&self, if_id: u32) -> Result<(), TransportError<S::Error>> {
        let mut inner = self.inner.lock().await;

        drop_record_timers(&mut inner, if_id);
        let _ = inner.sockets.close(if_id).await;
        let _ = inner.ipcfg.remove_all(if_id).await;

        if let Some(record) = inner.table.lookup_mut(if_id) {
            record.state = State::Stopping;
        }
        inner.table.release(if_id);

        drop(inner);
        self.release_status(if_id);
        Ok(())
    }

    fn fail(&self, inner: &mut Inner<S, A, I, IF, R, N, P>, if_id: u32, state: State, err: Error) {
        if let Some(record) = inner.table.lookup_mut(if_id) {
            record.state = state;
        }
        self.publish(if_id, LeaseStatus::Failed, Some(err));
    }
}

fn drop_record_timers<S, A, I, IF, R, const N: usize, const P: usize>(
    inner: &mut Inner<S, A, I, IF, R, N, P>,
    if_id: u32,
) {
    inner.wheel.cancel_all_for(if_id);
    if let Some(record) = inner.table.lookup_mut(if_id) {
        record.timer_handle = None;
    }
}

fn core_error<E>(err: TransportError<E>) -> Error {
    match err {
        TransportError::Core(e) => e,
        TransportError::Io(_) => Error::TxFailed,
    }
}

/// Exercises the dispatcher against the `sim` in-memory fakes, covering the
/// acquisition/renewal/expiry scenarios spec.md §8 walks through end to end rather than
/// one component at a time. Requires the `std` feature, same as `sim` itself.
#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    use crate::sim::{SimArp, SimClock, SimIpConfig, SimInterfaces, SimSockets};
    use crate::wire::{code, MIN_DECODED_LEN, MIN_ENCODED_LEN};

    const MAC: [u8; 6] = [0, 0, 0, 0, 0, 1];

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

    type TestClient<'q> = Client<
        'q,
        NoopRawMutex,
        SimSockets,
        SimArp,
        SimIpConfig,
        SimInterfaces,
        SimClock,
        FakeRng,
        2,
        4,
        8,
    >;

    fn make(queue: &CommandQueue<NoopRawMutex, 8>, config: Config) -> TestClient<'_> {
        Client::new(
            SimSockets::default(),
            SimArp::default(),
            SimIpConfig::default(),
            SimInterfaces::new([(1, MAC)]),
            FakeRng(0),
            SimClock::default(),
            queue,
            config,
        )
    }

    /// Builds a BOOT_REPLY datagram by reusing the request encoder's header layout (the
    /// trick `retransmit.rs`'s own tests use) and splicing in the reply's `yiaddr` and
    /// options.
    fn server_reply(
        xid: u32,
        yiaddr: Ipv4Addr,
        msg_type: MessageType,
        opts: &[(u8, &[u8])],
    ) -> heapless::Vec<u8, 600> {
        let rb = RequestBuilder {
            xid,
            secs: 0,
            mac: MAC,
            our_ip: None,
            broadcast: true,
        };
        let mut buf = [0u8; 600];
        let out = rb.discover(None, &[], &mut buf).unwrap();

        let mut v: heapless::Vec<u8, 600> = heapless::Vec::new();
        v.extend_from_slice(&out[..MIN_DECODED_LEN]).unwrap();
        v[0] = 2; // BOOT_REPLY
        v[16..20].copy_from_slice(&yiaddr.octets());

        v.push(code::DHCP_MESSAGE_TYPE).unwrap();
        v.push(1).unwrap();
        v.push(msg_type as u8).unwrap();

        for (c, data) in opts {
            v.push(*c).unwrap();
            v.push(data.len() as u8).unwrap();
            v.extend_from_slice(data).unwrap();
        }
        v.push(code::END).unwrap();
        while v.len() < MIN_ENCODED_LEN {
            v.push(code::PAD).unwrap();
        }
        v
    }

    /// S1: the full DISCOVER/OFFER/REQUEST/ACK cycle, asserting both the published
    /// status and the options `get_option` exposes, plus the T1 timer armed at 300s.
    #[test]
    fn happy_path_reaches_bound_with_options_and_t1_armed() {
        let queue: CommandQueue<NoopRawMutex, 8> = CommandQueue::new();
        let client = make(&queue, Config::default());

        let offered_ip = Ipv4Addr::new(192, 168, 1, 50);
        let server_id = Ipv4Addr::new(192, 168, 1, 1);
        let server_id_b = server_id.octets();
        let router_b = Ipv4Addr::new(192, 168, 1, 1).octets();
        let subnet_b = Ipv4Addr::new(255, 255, 255, 0).octets();
        let dns_b = Ipv4Addr::new(8, 8, 8, 8).octets();
        let lease_b = 600u32.to_be_bytes();
        let t1_b = 300u32.to_be_bytes();
        let t2_b = 525u32.to_be_bytes();

        embassy_futures::block_on(async {
            client.start(1, &[]).await.unwrap();
            let cmd = client.queue.wait().await;
            assert_eq!(cmd.kind, CommandKind::Start);

            {
                let inner = client.inner.lock().await;
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        257,
                        offered_ip,
                        MessageType::Offer,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        258,
                        offered_ip,
                        MessageType::Ack,
                        &[
                            (code::SERVER_IDENTIFIER, &server_id_b),
                            (code::IP_ADDRESS_LEASE_TIME, &lease_b),
                            (code::RENEWAL_TIME_VALUE, &t1_b),
                            (code::REBINDING_TIME_VALUE, &t2_b),
                            (code::ROUTER, &router_b),
                            (code::SUBNET_MASK, &subnet_b),
                            (code::DOMAIN_NAME_SERVER, &dns_b),
                        ],
                    ),
                );
            }

            client.dispatch(cmd).await.unwrap();
        });

        let (status, err) = client.check_status(1).unwrap();
        assert_eq!(status, LeaseStatus::Cfgd);
        assert_eq!(err, None);

        let mut router_out = [0u8; 4];
        let len = embassy_futures::block_on(client.get_option(1, code::ROUTER, &mut router_out))
            .unwrap();
        assert_eq!(&router_out[..len], &router_b);

        let inner = embassy_futures::block_on(client.inner.lock());
        let record = inner.table.lookup(1).unwrap();
        assert_eq!(record.t1_secs, Some(300));
        assert!(inner.wheel.is_armed(record.timer_handle.unwrap()));
        assert_eq!(inner.ipcfg.configured(1).map(|c| c.addr), Some(offered_ip));
    }

    /// S2: every negotiation attempt is NAK'd; once `nego_retries` is exhausted the
    /// interface fails with the last NAK rather than retrying forever.
    #[test]
    fn nak_exhausts_retries_then_fails() {
        let queue: CommandQueue<NoopRawMutex, 8> = CommandQueue::new();
        let config = Config {
            nego_retries: 1,
            local_link_enabled: false,
            ..Config::default()
        };
        let client = make(&queue, config);

        let offered_ip = Ipv4Addr::new(192, 168, 1, 50);
        let server_id = Ipv4Addr::new(192, 168, 1, 1);
        let server_id_b = server_id.octets();

        embassy_futures::block_on(async {
            client.start(1, &[]).await.unwrap();
            let cmd = client.queue.wait().await;

            {
                let inner = client.inner.lock().await;
                // First attempt: xid 257/258.
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        257,
                        offered_ip,
                        MessageType::Offer,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        258,
                        offered_ip,
                        MessageType::Nak,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                // Second (final) attempt: xid 259/260.
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        259,
                        offered_ip,
                        MessageType::Offer,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        260,
                        offered_ip,
                        MessageType::Nak,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
            }

            client.dispatch(cmd).await.unwrap();
        });

        let (status, err) = client.check_status(1).unwrap();
        assert_eq!(status, LeaseStatus::Failed);
        assert_eq!(err, Some(Error::NakReceived));
    }

    /// S3: the first offered address is already claimed on the link. The probe reports
    /// it USED, a DECLINE goes out, and negotiation restarts and lands on a free one.
    #[test]
    fn address_conflict_sends_decline_and_retries_to_a_free_address() {
        let queue: CommandQueue<NoopRawMutex, 8> = CommandQueue::new();
        let config = Config {
            nego_retries: 1,
            local_link_enabled: false,
            ..Config::default()
        };
        let client = make(&queue, config);

        let conflicted_ip = Ipv4Addr::new(192, 168, 1, 50);
        let free_ip = Ipv4Addr::new(192, 168, 1, 51);
        let server_id = Ipv4Addr::new(192, 168, 1, 1);
        let server_id_b = server_id.octets();
        let lease_b = 600u32.to_be_bytes();

        embassy_futures::block_on(async {
            client.start(1, &[]).await.unwrap();
            let cmd = client.queue.wait().await;

            {
                let inner = client.inner.lock().await;
                inner.arp.claim(conflicted_ip, [9; 6]);

                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        257,
                        conflicted_ip,
                        MessageType::Offer,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        258,
                        conflicted_ip,
                        MessageType::Ack,
                        &[
                            (code::SERVER_IDENTIFIER, &server_id_b),
                            (code::IP_ADDRESS_LEASE_TIME, &lease_b),
                        ],
                    ),
                );
                // decline() itself consumes xid 259, so the retried cycle starts at 260.
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        260,
                        free_ip,
                        MessageType::Offer,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        261,
                        free_ip,
                        MessageType::Ack,
                        &[
                            (code::SERVER_IDENTIFIER, &server_id_b),
                            (code::IP_ADDRESS_LEASE_TIME, &lease_b),
                        ],
                    ),
                );
            }

            client.dispatch(cmd).await.unwrap();
        });

        let (status, _) = client.check_status(1).unwrap();
        assert_eq!(status, LeaseStatus::Cfgd);

        let inner = embassy_futures::block_on(client.inner.lock());
        assert_eq!(inner.ipcfg.configured(1).map(|c| c.addr), Some(free_ip));
        // DISCOVER, REQUEST, DECLINE, DISCOVER, REQUEST.
        assert_eq!(inner.sockets.sent_count(1), 5);
    }

    /// S4: T1 fires and the server renews the lease; the next T1 timer is rearmed.
    #[test]
    fn t1_renewal_succeeds_and_rearms_the_timer() {
        let queue: CommandQueue<NoopRawMutex, 8> = CommandQueue::new();
        let client = make(&queue, Config::default());

        let offered_ip = Ipv4Addr::new(192, 168, 1, 50);
        let server_id = Ipv4Addr::new(192, 168, 1, 1);
        let server_id_b = server_id.octets();
        let lease_b = 600u32.to_be_bytes();
        let t1_b = 300u32.to_be_bytes();

        embassy_futures::block_on(async {
            client.start(1, &[]).await.unwrap();
            let cmd = client.queue.wait().await;
            {
                let inner = client.inner.lock().await;
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        257,
                        offered_ip,
                        MessageType::Offer,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        258,
                        offered_ip,
                        MessageType::Ack,
                        &[
                            (code::SERVER_IDENTIFIER, &server_id_b),
                            (code::IP_ADDRESS_LEASE_TIME, &lease_b),
                            (code::RENEWAL_TIME_VALUE, &t1_b),
                        ],
                    ),
                );
            }
            client.dispatch(cmd).await.unwrap();

            {
                let inner = client.inner.lock().await;
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        259,
                        offered_ip,
                        MessageType::Ack,
                        &[
                            (code::SERVER_IDENTIFIER, &server_id_b),
                            (code::IP_ADDRESS_LEASE_TIME, &lease_b),
                            (code::RENEWAL_TIME_VALUE, &t1_b),
                        ],
                    ),
                );
            }
            client.handle_t1(1).await.unwrap();
        });

        let (status, _) = client.check_status(1).unwrap();
        assert_eq!(status, LeaseStatus::Cfgd);

        let inner = embassy_futures::block_on(client.inner.lock());
        let record = inner.table.lookup(1).unwrap();
        assert!(inner.wheel.is_armed(record.timer_handle.unwrap()));
    }

    /// S5: T1's renewal gets no reply at all; the timer falls through to T2, which
    /// rebinds successfully via a broadcast REQUEST.
    #[test]
    fn renewal_silence_falls_through_to_a_successful_rebind() {
        let queue: CommandQueue<NoopRawMutex, 8> = CommandQueue::new();
        let client = make(&queue, Config::default());

        let offered_ip = Ipv4Addr::new(192, 168, 1, 50);
        let server_id = Ipv4Addr::new(192, 168, 1, 1);
        let server_id_b = server_id.octets();
        let lease_b = 600u32.to_be_bytes();
        let t1_b = 300u32.to_be_bytes();

        embassy_futures::block_on(async {
            client.start(1, &[]).await.unwrap();
            let cmd = client.queue.wait().await;
            {
                let inner = client.inner.lock().await;
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        257,
                        offered_ip,
                        MessageType::Offer,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        258,
                        offered_ip,
                        MessageType::Ack,
                        &[
                            (code::SERVER_IDENTIFIER, &server_id_b),
                            (code::IP_ADDRESS_LEASE_TIME, &lease_b),
                            (code::RENEWAL_TIME_VALUE, &t1_b),
                        ],
                    ),
                );
            }
            client.dispatch(cmd).await.unwrap();

            // T1 fires; nothing answers, so renew_or_rebind exhausts its retries.
            client.handle_t1(1).await.unwrap();

            // T2 fires; xid 260 (259 was consumed by the silent T1 attempt).
            {
                let inner = client.inner.lock().await;
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        260,
                        offered_ip,
                        MessageType::Ack,
                        &[
                            (code::SERVER_IDENTIFIER, &server_id_b),
                            (code::IP_ADDRESS_LEASE_TIME, &lease_b),
                            (code::RENEWAL_TIME_VALUE, &t1_b),
                        ],
                    ),
                );
            }
            client.handle_t2(1).await.unwrap();
        });

        let (status, _) = client.check_status(1).unwrap();
        assert_eq!(status, LeaseStatus::Cfgd);
    }

    /// S6: the lease hard-expires with no server reachable; with link-local disabled,
    /// restarting from INIT exhausts DISCOVER and fails, having released the address.
    #[test]
    fn lease_expiry_releases_the_address_and_restarts_to_failed_without_local_link() {
        let queue: CommandQueue<NoopRawMutex, 8> = CommandQueue::new();
        let config = Config {
            local_link_enabled: false,
            ..Config::default()
        };
        let client = make(&queue, config);

        let offered_ip = Ipv4Addr::new(192, 168, 1, 50);
        let server_id = Ipv4Addr::new(192, 168, 1, 1);
        let server_id_b = server_id.octets();
        let lease_b = 600u32.to_be_bytes();

        embassy_futures::block_on(async {
            client.start(1, &[]).await.unwrap();
            let cmd = client.queue.wait().await;
            {
                let inner = client.inner.lock().await;
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        257,
                        offered_ip,
                        MessageType::Offer,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        258,
                        offered_ip,
                        MessageType::Ack,
                        &[
                            (code::SERVER_IDENTIFIER, &server_id_b),
                            (code::IP_ADDRESS_LEASE_TIME, &lease_b),
                        ],
                    ),
                );
            }
            client.dispatch(cmd).await.unwrap();

            client.handle_lease_expired(1).await.unwrap();
        });

        let (status, err) = client.check_status(1).unwrap();
        assert_eq!(status, LeaseStatus::Failed);
        assert_eq!(err, Some(Error::NoOffer));

        let inner = embassy_futures::block_on(client.inner.lock());
        assert!(inner.ipcfg.configured(1).is_none());
    }

    /// S7: an ACK with no IP_ADDRESS_LEASE_TIME option at all means an infinite lease -
    /// configured, but with no T1 timer armed.
    #[test]
    fn infinite_lease_configures_without_arming_a_timer() {
        let queue: CommandQueue<NoopRawMutex, 8> = CommandQueue::new();
        let client = make(&queue, Config::default());

        let offered_ip = Ipv4Addr::new(192, 168, 1, 50);
        let server_id = Ipv4Addr::new(192, 168, 1, 1);
        let server_id_b = server_id.octets();

        embassy_futures::block_on(async {
            client.start(1, &[]).await.unwrap();
            let cmd = client.queue.wait().await;
            {
                let inner = client.inner.lock().await;
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        257,
                        offered_ip,
                        MessageType::Offer,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
                inner.sockets.push_inbound(
                    1,
                    &server_reply(
                        258,
                        offered_ip,
                        MessageType::Ack,
                        &[(code::SERVER_IDENTIFIER, &server_id_b)],
                    ),
                );
            }
            client.dispatch(cmd).await.unwrap();
        });

        let (status, _) = client.check_status(1).unwrap();
        assert_eq!(status, LeaseStatus::CfgdNoTimer);

        let inner = embassy_futures::block_on(client.inner.lock());
        let record = inner.table.lookup(1).unwrap();
        assert!(record.timer_handle.is_none());
    }
}
