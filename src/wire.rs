//! RFC 2131 BOOTP/DHCP wire codec (component C1).
//!
//! Adapted from `edge-dhcp`'s packet/option codec. Two differences from the
//! teacher, both explicit invariants of this spec rather than incidental:
//! encoded datagrams are padded to >= 300 octets (not 272 - this client
//! targets wired/Wi-Fi MTUs, not the teacher's smaller embedded frame
//! budget), and decode rejects anything shorter than 240 octets (fixed
//! header + magic cookie) before it even looks for options.

use core::str::Utf8Error;

use no_std_net::Ipv4Addr;

use num_enum::TryFromPrimitive;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    DataUnderflow,
    InvalidUtf8Str,
    InvalidMessageType,
    MissingCookie,
    InvalidHlen,
    BufferOverflow,
    TooShort,
}

impl From<Utf8Error> for Error {
    fn from(_: Utf8Error) -> Self {
        Self::InvalidUtf8Str
    }
}

impl From<Error> for crate::error::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::BufferOverflow => crate::error::Error::OptionBufferTooSmall,
            _ => crate::error::Error::InvalidMsg,
        }
    }
}

/// Minimum encoded datagram size (§4.1, §6): header + cookie + options padded to this size.
pub const MIN_ENCODED_LEN: usize = 300;

/// Minimum decodable datagram size (§4.1): fixed header (236 bytes) + magic cookie (4 bytes).
pub const MIN_DECODED_LEN: usize = 240;

/// Recommended send/receive buffer size (§3 "Wire Message (raw >= 576 bytes...)").
pub const RECOMMENDED_BUF_LEN: usize = 576;

#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

/// DHCP message codes (option 53) §6.
pub mod code {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const TIME_OFFSET: u8 = 2;
    pub const DOMAIN_NAME_SERVER: u8 = 6;
    pub const HOST_NAME: u8 = 12;
    pub const REQUESTED_IP_ADDRESS: u8 = 50;
    pub const IP_ADDRESS_LEASE_TIME: u8 = 51;
    pub const DHCP_MESSAGE_TYPE: u8 = 53;
    pub const SERVER_IDENTIFIER: u8 = 54;
    pub const PARAMETER_REQUEST_LIST: u8 = 55;
    pub const MESSAGE: u8 = 56;
    pub const RENEWAL_TIME_VALUE: u8 = 58;
    pub const REBINDING_TIME_VALUE: u8 = 59;
    pub const END: u8 = 255;
}

/// The system-default parameter-request codes merged into every outgoing
/// PARAMETER_REQUEST_LIST, per §4.1's encode contract.
pub const DEFAULT_PARAMS: [u8; 4] = [
    code::SUBNET_MASK,
    code::ROUTER,
    code::DOMAIN_NAME_SERVER,
    code::TIME_OFFSET,
];

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DhcpOption<'a> {
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(&'a [u8]),
    RequestedIpAddress(Ipv4Addr),
    HostName(&'a str),
    Router(Ipv4Addr),
    DomainNameServer(Ipv4Addrs<'a>),
    IpAddressLeaseTime(u32),
    RenewalTimeValue(u32),
    RebindingTimeValue(u32),
    SubnetMask(Ipv4Addr),
    Message(&'a str),
    Unrecognized(u8, &'a [u8]),
}

impl<'a> DhcpOption<'a> {
    pub const fn code(&self) -> u8 {
        match self {
            Self::MessageType(_) => code::DHCP_MESSAGE_TYPE,
            Self::ServerIdentifier(_) => code::SERVER_IDENTIFIER,
            Self::ParameterRequestList(_) => code::PARAMETER_REQUEST_LIST,
            Self::RequestedIpAddress(_) => code::REQUESTED_IP_ADDRESS,
            Self::HostName(_) => code::HOST_NAME,
            Self::Router(_) => code::ROUTER,
            Self::DomainNameServer(_) => code::DOMAIN_NAME_SERVER,
            Self::IpAddressLeaseTime(_) => code::IP_ADDRESS_LEASE_TIME,
            Self::RenewalTimeValue(_) => code::RENEWAL_TIME_VALUE,
            Self::RebindingTimeValue(_) => code::REBINDING_TIME_VALUE,
            Self::SubnetMask(_) => code::SUBNET_MASK,
            Self::Message(_) => code::MESSAGE,
            Self::Unrecognized(c, _) => *c,
        }
    }

    fn data(&self, mut f: impl FnMut(&[u8]) -> Result<(), Error>) -> Result<(), Error> {
        match self {
            Self::MessageType(mt) => f(&[*mt as u8]),
            Self::ServerIdentifier(addr) => f(&addr.octets()),
            Self::ParameterRequestList(prl) => f(prl),
            Self::RequestedIpAddress(addr) => f(&addr.octets()),
            Self::HostName(name) => f(name.as_bytes()),
            Self::Router(addr) => f(&addr.octets()),
            Self::DomainNameServer(addrs) => {
                for addr in addrs.iter() {
                    f(&addr.octets())?;
                }
                Ok(())
            }
            Self::IpAddressLeaseTime(secs) => f(&secs.to_be_bytes()),
            Self::RenewalTimeValue(secs) => f(&secs.to_be_bytes()),
            Self::RebindingTimeValue(secs) => f(&secs.to_be_bytes()),
            Self::SubnetMask(mask) => f(&mask.octets()),
            Self::Message(msg) => f(msg.as_bytes()),
            Self::Unrecognized(_, data) => f(data),
        }
    }

    fn encode(&self, out: &mut BytesOut) -> Result<(), Error> {
        out.byte(self.code())?;

        // Two-pass: compute length first (data() never fails for these variants once
        // length is known to fit an option (<= 255 bytes), then write code+len+data.
        let mut len = 0usize;
        self.data(|d| {
            len += d.len();
            Ok(())
        })?;

        out.byte(len as u8)?;
        self.data(|d| out.push(d).map(|_| ()))
    }

    fn decode<'o>(bytes: &mut BytesIn<'o>) -> Result<Option<DhcpOption<'o>>, Error> {
        let code = bytes.byte()?;
        if code == code::END {
            return Ok(None);
        }
        if code == code::PAD {
            return Ok(Some(DhcpOption::Unrecognized(code::PAD, &[])));
        }

        let len = bytes.byte()? as usize;
        let mut inner = BytesIn::new(bytes.slice(len)?);

        let option = match code {
            code::DHCP_MESSAGE_TYPE => DhcpOption::MessageType(
                MessageType::try_from_primitive(inner.remaining_byte()?)
                    .map_err(|_| Error::InvalidMessageType)?,
            ),
            code::SERVER_IDENTIFIER => DhcpOption::ServerIdentifier(inner.remaining_arr()?.into()),
            code::PARAMETER_REQUEST_LIST => DhcpOption::ParameterRequestList(inner.remaining()),
            code::REQUESTED_IP_ADDRESS => {
                DhcpOption::RequestedIpAddress(inner.remaining_arr()?.into())
            }
            code::HOST_NAME => DhcpOption::HostName(core::str::from_utf8(inner.remaining())?),
            code::ROUTER => DhcpOption::Router(inner.remaining_arr()?.into()),
            code::DOMAIN_NAME_SERVER => {
                DhcpOption::DomainNameServer(Ipv4Addrs(inner.remaining()))
            }
            code::IP_ADDRESS_LEASE_TIME => {
                DhcpOption::IpAddressLeaseTime(u32::from_be_bytes(inner.remaining_arr()?))
            }
            code::RENEWAL_TIME_VALUE => {
                DhcpOption::RenewalTimeValue(u32::from_be_bytes(inner.remaining_arr()?))
            }
            code::REBINDING_TIME_VALUE => {
                DhcpOption::RebindingTimeValue(u32::from_be_bytes(inner.remaining_arr()?))
            }
            code::SUBNET_MASK => DhcpOption::SubnetMask(inner.remaining_arr()?.into()),
            code::MESSAGE => DhcpOption::Message(core::str::from_utf8(inner.remaining())?),
            _ => DhcpOption::Unrecognized(code, inner.remaining()),
        };

        Ok(Some(option))
    }
}

/// A run of IPv4 addresses packed 4 bytes apiece (ROUTER/DNS option values can list more
/// than one address; this client only ever reads the first one or two, per §6).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Ipv4Addrs<'a>(&'a [u8]);

impl<'a> Ipv4Addrs<'a> {
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + 'a {
        let data = self.0;
        (0..data.len() / 4).map(move |i| {
            let octets: [u8; 4] = data[i * 4..i * 4 + 4].try_into().unwrap();
            octets.into()
        })
    }
}

/// Iterator over the TLV option stream of a decoded packet.
pub struct Options<'a>(&'a [u8]);

impl<'a> Options<'a> {
    pub fn iter(&self) -> OptionsIter<'a> {
        OptionsIter(BytesIn::new(self.0))
    }

    /// Raw option payload for an arbitrary code, independent of whether `DhcpOption`
    /// has a typed variant for it (used by `Client::get_option`'s pass-through lookup).
    pub fn find_raw(&self, code: u8) -> Option<&'a [u8]> {
        let mut bytes = BytesIn::new(self.0);

        while !bytes.is_empty() {
            let c = bytes.byte().ok()?;
            if c == code::END {
                return None;
            }
            if c == code::PAD {
                continue;
            }

            let len = bytes.byte().ok()? as usize;
            let data = bytes.slice(len).ok()?;

            if c == code {
                return Some(data);
            }
        }

        None
    }
}

pub struct OptionsIter<'a>(BytesIn<'a>);

impl<'a> Iterator for OptionsIter<'a> {
    type Item = DhcpOption<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.0.is_empty() {
                return None;
            }

            match DhcpOption::decode(&mut self.0) {
                Ok(Some(DhcpOption::Unrecognized(code::PAD, _))) => continue,
                Ok(Some(opt)) => return Some(opt),
                _ => return None,
            }
        }
    }
}

/// DHCP/BOOTP message, header fields plus a borrowed options TLV stream.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Packet<'a> {
    pub reply: bool,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub broadcast: bool,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    options_buf: &'a [u8],
}

impl<'a> Packet<'a> {
    const COOKIE: [u8; 4] = [99, 130, 83, 99];
    const BOOT_REQUEST: u8 = 1;
    const BOOT_REPLY: u8 = 2;
    const SNAME_AND_FILE: usize = 64 + 128;

    pub fn options(&self) -> Options<'a> {
        Options(self.options_buf)
    }

    pub fn is_for_us(&self, mac: &[u8; 6], xid: u32) -> bool {
        const TRAILING_ZEROS: [u8; 10] = [0; 10];

        self.reply
            && self.xid == xid
            && self.chaddr[0..6] == *mac
            && self.chaddr[6..16] == TRAILING_ZEROS
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options().iter().find_map(|opt| {
            if let DhcpOption::MessageType(mt) = opt {
                Some(mt)
            } else {
                None
            }
        })
    }

    pub fn decode(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < MIN_DECODED_LEN {
            return Err(Error::TooShort);
        }

        let mut bytes = BytesIn::new(data);

        let reply = {
            let reply = bytes.byte()? == Self::BOOT_REPLY;
            let _htype = bytes.byte()?;
            let hlen = bytes.byte()?;
            if hlen != 6 {
                return Err(Error::InvalidHlen);
            }
            reply
        };

        let hops = bytes.byte()?;
        let xid = u32::from_be_bytes(bytes.arr()?);
        let secs = u16::from_be_bytes(bytes.arr()?);
        let broadcast = u16::from_be_bytes(bytes.arr()?) & 0x8000 != 0;
        let ciaddr = bytes.arr::<4>()?.into();
        let yiaddr = bytes.arr::<4>()?.into();
        let siaddr = bytes.arr::<4>()?.into();
        let giaddr = bytes.arr::<4>()?.into();
        let chaddr = bytes.arr()?;

        for _ in 0..Self::SNAME_AND_FILE {
            bytes.byte()?;
        }

        if bytes.arr::<4>()? != Self::COOKIE {
            return Err(Error::MissingCookie);
        }

        Ok(Self {
            reply,
            hops,
            xid,
            secs,
            broadcast,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            options_buf: bytes.remaining(),
        })
    }
}

/// Builds outgoing BOOTP requests from this client's point of view (§4.1 encode contract).
pub struct RequestBuilder {
    pub xid: u32,
    pub secs: u16,
    pub mac: [u8; 6],
    /// `ciaddr`/`yiaddr`, present only while renewing/rebinding/releasing (has an IP already).
    pub our_ip: Option<Ipv4Addr>,
    /// Set when the interface isn't IP-configured yet - forces the BROADCAST flag.
    pub broadcast: bool,
}

impl RequestBuilder {
    #[allow(clippy::too_many_arguments)]
    fn encode<'o>(
        &self,
        mt: MessageType,
        requested_ip: Option<Ipv4Addr>,
        server_id: Option<Ipv4Addr>,
        host_name: Option<&str>,
        extra_params: &[u8],
        buf: &'o mut [u8],
    ) -> Result<&'o [u8], Error> {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&self.mac);

        let mut bytes = BytesOut::new(buf);

        bytes
            .byte(Packet::BOOT_REQUEST)?
            .byte(1)?
            .byte(6)?
            .byte(0)?
            .push(&self.xid.to_be_bytes())?
            .push(&self.secs.to_be_bytes())?
            .push(&(if self.broadcast { 0x8000u16 } else { 0 }).to_be_bytes())?
            .push(&self.our_ip.unwrap_or(Ipv4Addr::UNSPECIFIED).octets())?
            .push(&Ipv4Addr::UNSPECIFIED.octets())? // yiaddr: unused in client->server direction
            .push(&Ipv4Addr::UNSPECIFIED.octets())? // siaddr
            .push(&Ipv4Addr::UNSPECIFIED.octets())? // giaddr
            .push(&chaddr)?;

        for _ in 0..Packet::SNAME_AND_FILE {
            bytes.byte(0)?;
        }

        bytes.push(&Packet::COOKIE)?;

        bytes.byte(code::DHCP_MESSAGE_TYPE)?.byte(1)?.byte(mt as u8)?;

        if let Some(ip) = requested_ip {
            bytes
                .byte(code::REQUESTED_IP_ADDRESS)?
                .byte(4)?
                .push(&ip.octets())?;
        }

        if let Some(ip) = server_id {
            bytes
                .byte(code::SERVER_IDENTIFIER)?
                .byte(4)?
                .push(&ip.octets())?;
        }

        if let Some(name) = host_name {
            let name = &name.as_bytes()[..name.len().min(255)];
            bytes.byte(code::HOST_NAME)?.byte(name.len() as u8)?.push(name)?;
        }

        if matches!(mt, MessageType::Discover | MessageType::Request) {
            let total = DEFAULT_PARAMS.len() + extra_params.len();
            let total = total.min(255);
            bytes.byte(code::PARAMETER_REQUEST_LIST)?.byte(total as u8)?;

            let mut written = 0usize;
            for &c in DEFAULT_PARAMS.iter().chain(extra_params.iter()) {
                if written == total {
                    break;
                }
                bytes.byte(c)?;
                written += 1;
            }
        }

        bytes.byte(code::END)?;

        while bytes.len() < MIN_ENCODED_LEN {
            bytes.byte(code::PAD)?;
        }

        let len = bytes.len();
        Ok(&buf[..len])
    }

    pub fn discover<'o>(
        &self,
        host_name: Option<&str>,
        extra_params: &[u8],
        buf: &'o mut [u8],
    ) -> Result<&'o [u8], Error> {
        self.encode(MessageType::Discover, None, None, host_name, extra_params, buf)
    }

    pub fn request_selecting<'o>(
        &self,
        requested_ip: Ipv4Addr,
        server_id: Ipv4Addr,
        host_name: Option<&str>,
        extra_params: &[u8],
        buf: &'o mut [u8],
    ) -> Result<&'o [u8], Error> {
        self.encode(
            MessageType::Request,
            Some(requested_ip),
            Some(server_id),
            host_name,
            extra_params,
            buf,
        )
    }

    pub fn request_init_reboot<'o>(
        &self,
        requested_ip: Ipv4Addr,
        host_name: Option<&str>,
        extra_params: &[u8],
        buf: &'o mut [u8],
    ) -> Result<&'o [u8], Error> {
        self.encode(
            MessageType::Request,
            Some(requested_ip),
            None,
            host_name,
            extra_params,
            buf,
        )
    }

    /// RENEWING/REBINDING request: `ciaddr` carries the address, no REQUESTED_IP_ADDRESS option.
    pub fn request_renewing<'o>(
        &self,
        host_name: Option<&str>,
        extra_params: &[u8],
        buf: &'o mut [u8],
    ) -> Result<&'o [u8], Error> {
        self.encode(MessageType::Request, None, None, host_name, extra_params, buf)
    }

    pub fn decline<'o>(
        &self,
        requested_ip: Ipv4Addr,
        server_id: Ipv4Addr,
        buf: &'o mut [u8],
    ) -> Result<&'o [u8], Error> {
        self.encode(
            MessageType::Decline,
            Some(requested_ip),
            Some(server_id),
            None,
            &[],
            buf,
        )
    }

    pub fn release<'o>(
        &self,
        server_id: Ipv4Addr,
        buf: &'o mut [u8],
    ) -> Result<&'o [u8], Error> {
        self.encode(MessageType::Release, None, Some(server_id), None, &[], buf)
    }
}

/// The subset of a server reply this client cares about (distilled from the options iterator
/// on first decode, as the teacher's `Settings` does for its simpler set of fields).
#[derive(Clone, Debug)]
pub struct Settings {
    pub ip: Ipv4Addr,
    pub server_id: Option<Ipv4Addr>,
    pub lease_secs: Option<u32>,
    pub t1_secs: Option<u32>,
    pub t2_secs: Option<u32>,
    pub gateway: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Addr>,
    pub dns1: Option<Ipv4Addr>,
    pub dns2: Option<Ipv4Addr>,
}

impl<'a> From<&Packet<'a>> for Settings {
    fn from(packet: &Packet<'a>) -> Self {
        let dns = packet.options().iter().find_map(|opt| {
            if let DhcpOption::DomainNameServer(addrs) = opt {
                Some(addrs)
            } else {
                None
            }
        });

        Self {
            ip: packet.yiaddr,
            server_id: packet.options().iter().find_map(|opt| {
                if let DhcpOption::ServerIdentifier(ip) = opt {
                    Some(ip)
                } else {
                    None
                }
            }),
            lease_secs: packet.options().iter().find_map(|opt| {
                if let DhcpOption::IpAddressLeaseTime(secs) = opt {
                    Some(secs)
                } else {
                    None
                }
            }),
            t1_secs: packet.options().iter().find_map(|opt| {
                if let DhcpOption::RenewalTimeValue(secs) = opt {
                    Some(secs)
                } else {
                    None
                }
            }),
            t2_secs: packet.options().iter().find_map(|opt| {
                if let DhcpOption::RebindingTimeValue(secs) = opt {
                    Some(secs)
                } else {
                    None
                }
            }),
            gateway: packet.options().iter().find_map(|opt| {
                if let DhcpOption::Router(ip) = opt {
                    Some(ip)
                } else {
                    None
                }
            }),
            subnet: packet.options().iter().find_map(|opt| {
                if let DhcpOption::SubnetMask(mask) = opt {
                    Some(mask)
                } else {
                    None
                }
            }),
            dns1: dns.and_then(|addrs| addrs.iter().next()),
            dns2: dns.and_then(|addrs| addrs.iter().nth(1)),
        }
    }
}

struct BytesIn<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BytesIn<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8, Error> {
        self.arr::<1>().map(|a| a[0])
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if len > self.data.len().saturating_sub(self.offset) {
            Err(Error::DataUnderflow)
        } else {
            let data = &self.data[self.offset..self.offset + len];
            self.offset += len;
            Ok(data)
        }
    }

    fn arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let slice = self.slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn remaining(&mut self) -> &'a [u8] {
        let data = &self.data[self.offset..];
        self.offset = self.data.len();
        data
    }

    fn remaining_byte(&mut self) -> Result<u8, Error> {
        Ok(self.remaining_arr::<1>()?[0])
    }

    fn remaining_arr<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.data.len() - self.offset < N {
            Err(Error::DataUnderflow)
        } else {
            self.arr::<N>()
        }
    }
}

struct BytesOut<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl<'a> BytesOut<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn len(&self) -> usize {
        self.offset
    }

    fn byte(&mut self, data: u8) -> Result<&mut Self, Error> {
        self.push(&[data])
    }

    fn push(&mut self, data: &[u8]) -> Result<&mut Self, Error> {
        if data.len() > self.buf.len().saturating_sub(self.offset) {
            Err(Error::BufferOverflow)
        } else {
            self.buf[self.offset..self.offset + data.len()].copy_from_slice(data);
            self.offset += data.len();
            Ok(self)
        }
    }
}
