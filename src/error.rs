use core::fmt;

/// Error taxonomy surfaced by the client core.
///
/// Grouped the way spec.md §7 groups them (usage / resource / protocol /
/// infrastructure), plus the two post-success notes that are not failures
/// but annotate a successful `lease_status`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Error {
    // --- Usage errors ---
    NullPointer = 0,
    NotInitialized = 1,
    InterfaceInvalid = 2,
    InterfaceNotManaged = 3,
    InterfaceNotConfigured = 4,
    ParamReqTableTooSmall = 5,
    OptionBufferTooSmall = 6,
    OptionAbsent = 7,

    // --- Resource errors ---
    PoolEmpty = 8,
    QueueFull = 9,

    // --- Protocol errors ---
    NakReceived = 10,
    InvalidMsg = 11,
    RxTimeout = 12,
    RxOverflow = 13,
    TxFailed = 14,
    NoOffer = 15,

    // --- Infrastructure errors ---
    SocketInitFailed = 16,
    HwAddrInvalid = 17,
    AddrValidateInconclusive = 18,
    AddrInUse = 19,
    LocalLinkFailed = 20,
    ConfigFailed = 21,
}

impl Error {
    const MAX_DISCRIMINANT: u8 = 21;

    /// Inverse of the implicit `as u8` cast, for the atomic `last_error` publication in
    /// [`crate::iface::InterfaceRecord`]. Returns `None` for any value that isn't one of
    /// this enum's own discriminants.
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        if v > Self::MAX_DISCRIMINANT {
            return None;
        }

        // All variants are fieldless with explicit, contiguous-from-zero discriminants,
        // so this is just `Self::VARIANTS[v]` without needing a proc-macro to generate it.
        const TABLE: [Error; (Error::MAX_DISCRIMINANT + 1) as usize] = [
            Error::NullPointer,
            Error::NotInitialized,
            Error::InterfaceInvalid,
            Error::InterfaceNotManaged,
            Error::InterfaceNotConfigured,
            Error::ParamReqTableTooSmall,
            Error::OptionBufferTooSmall,
            Error::OptionAbsent,
            Error::PoolEmpty,
            Error::QueueFull,
            Error::NakReceived,
            Error::InvalidMsg,
            Error::RxTimeout,
            Error::RxOverflow,
            Error::TxFailed,
            Error::NoOffer,
            Error::SocketInitFailed,
            Error::HwAddrInvalid,
            Error::AddrValidateInconclusive,
            Error::AddrInUse,
            Error::LocalLinkFailed,
            Error::ConfigFailed,
        ];

        Some(TABLE[v as usize])
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NullPointer => "null pointer",
            Self::NotInitialized => "client not initialized",
            Self::InterfaceInvalid => "interface invalid or disabled",
            Self::InterfaceNotManaged => "interface is not managed by this client",
            Self::InterfaceNotConfigured => "interface has no configured lease",
            Self::ParamReqTableTooSmall => "requested parameter table too small",
            Self::OptionBufferTooSmall => "caller-supplied option buffer too small",
            Self::OptionAbsent => "requested option absent from last lease",
            Self::PoolEmpty => "a fixed-size pool (interface/message/command/timer) is exhausted",
            Self::QueueFull => "command queue is full",
            Self::NakReceived => "server sent NAK",
            Self::InvalidMsg => "malformed DHCP message",
            Self::RxTimeout => "no reply received before the timeout",
            Self::RxOverflow => "receive buffer too small for the datagram",
            Self::TxFailed => "failed to transmit a DHCP message",
            Self::NoOffer => "no DHCPOFFER received after exhausting retries",
            Self::SocketInitFailed => "failed to open or bind the UDP socket",
            Self::HwAddrInvalid => "could not fetch a hardware address for the interface",
            Self::AddrValidateInconclusive => "ARP probe could not establish whether the address is free",
            Self::AddrInUse => "offered or candidate address is already in use",
            Self::LocalLinkFailed => "link-local address selection failed",
            Self::ConfigFailed => "the IPv4 stack rejected the address configuration",
        };

        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Wraps a transport-supplied error alongside the core's own [`Error`], the same
/// shape as the teacher's `io::Error<E>` / `MdnsIoError<E>`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransportError<E> {
    Core(Error),
    Io(E),
}

impl<E> From<Error> for TransportError<E> {
    fn from(value: Error) -> Self {
        Self::Core(value)
    }
}

impl<E> From<crate::wire::Error> for TransportError<E> {
    fn from(value: crate::wire::Error) -> Self {
        Self::Core(value.into())
    }
}

impl<E> fmt::Display for TransportError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "transport I/O error: {err}"),
        }
    }
}

#[cfg(feature = "std")]
impl<E> std::error::Error for TransportError<E> where E: std::error::Error {}
