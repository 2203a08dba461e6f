//! Runtime configuration (§6 "Configuration"), fixed at init.
//!
//! `MAX_IFACES` / `PARAM_REQ_TBL_SIZE` stay const generics on [`crate::client::Client`] /
//! [`crate::iface::InterfaceTable`] (compile-time capacity), following the teacher's
//! `Server<const N: usize>` convention in `server.rs`. Everything else that's merely
//! "configurable at init, not per-request" lives here.

#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub nego_retries: u8,
    pub discover_retries: u8,
    pub request_retries: u8,
    pub rx_inactivity_ms: u32,
    pub addr_validate_enabled: bool,
    pub local_link_enabled: bool,
    pub local_link_max_retry: u8,
    pub broadcast_bit_enabled: bool,
    pub client_port: u16,
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nego_retries: 3,
            discover_retries: 3,
            request_retries: 3,
            rx_inactivity_ms: 5_000,
            addr_validate_enabled: true,
            local_link_enabled: true,
            local_link_max_retry: 3,
            broadcast_bit_enabled: true,
            client_port: 68,
            server_port: 67,
        }
    }
}

/// Backoff schedule (§4.5): `delay(0) = INITIAL_BACKOFF_MS`, capped at `MAX_BACKOFF_MS`.
pub const INITIAL_BACKOFF_MS: u32 = 4_000;
pub const MAX_BACKOFF_MS: u32 = 64_000;

/// §4.7 INIT handler step 4: delay before retrying a NAK'd or declined negotiation.
pub const NEGO_RETRY_DELAY_MS: u32 = 10_000;

/// §4.7.c: floor below which a shortened renewal/rebind timer collapses into the next phase.
pub const MIN_RETX_TIME_SECS: u32 = 300;

/// §4.7.b link-local constants (RFC 3927, reduced).
pub const LL_PROBE_WAIT_SECS: u32 = 1;
pub const LL_ANNOUNCE_WAIT_SECS: u32 = 2;
pub const LL_ANNOUNCE_NUM: u8 = 2;
pub const LL_ANNOUNCE_INTERVAL_SECS: u32 = 2;
pub const LL_MAX_CONFLICTS: u8 = 10;
pub const LL_RATE_LIMIT_INTERVAL_SECS: u32 = 60;
pub const LL_RANGE_START: u32 = u32::from_be_bytes([169, 254, 1, 0]);
pub const LL_RANGE_END: u32 = u32::from_be_bytes([169, 254, 254, 255]);

/// Sentinel for an infinite lease (option 51 value `0xFFFFFFFF`).
pub const INFINITE_LEASE: u32 = 0xFFFF_FFFF;
