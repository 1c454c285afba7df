//! Endpoint addresses and name resolution.
//!
//! An [`Address`] pairs an IP endpoint with the socket kind and protocol it
//! is meant for, and converts to and from the raw `sockaddr` forms the
//! kernel wants. Resolution goes through `getaddrinfo`; names that do not
//! resolve yield an empty list rather than an error.

use std::ffi::CString;
use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Address family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn to_raw(self) -> libc::c_int {
        match self {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        }
    }
}

/// Caller preference when resolving a name that may have both v4 and v6
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyPref {
    Any,
    V4,
    V6,
}

impl FamilyPref {
    fn to_raw(self) -> libc::c_int {
        match self {
            FamilyPref::Any => libc::AF_UNSPEC,
            FamilyPref::V4 => libc::AF_INET,
            FamilyPref::V6 => libc::AF_INET6,
        }
    }

    fn admits(self, family: Family) -> bool {
        match self {
            FamilyPref::Any => true,
            FamilyPref::V4 => family == Family::V4,
            FamilyPref::V6 => family == Family::V6,
        }
    }
}

/// Transport flavor the address is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl SocketKind {
    pub(crate) fn to_raw(self) -> libc::c_int {
        match self {
            SocketKind::Stream => libc::SOCK_STREAM,
            SocketKind::Datagram => libc::SOCK_DGRAM,
        }
    }
}

/// An IPv4 or IPv6 endpoint plus the socket kind and protocol number it
/// initializes. Cheap to copy; the family and the raw byte length always
/// agree by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    ip: IpAddr,
    port: u16,
    kind: SocketKind,
    protocol: i32,
}

impl Address {
    /// A TCP stream endpoint.
    pub fn stream(ip: IpAddr, port: u16) -> Self {
        Address {
            ip,
            port,
            kind: SocketKind::Stream,
            protocol: libc::IPPROTO_TCP,
        }
    }

    /// A UDP datagram endpoint.
    pub fn datagram(ip: IpAddr, port: u16) -> Self {
        Address {
            ip,
            port,
            kind: SocketKind::Datagram,
            protocol: libc::IPPROTO_UDP,
        }
    }

    pub fn family(&self) -> Family {
        match self.ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    /// The raw address bytes (4 for v4, 16 for v6) in network order.
    pub fn raw_bytes(&self) -> ([u8; 16], usize) {
        let mut bytes = [0u8; 16];
        match self.ip {
            IpAddr::V4(v4) => {
                bytes[..4].copy_from_slice(&v4.octets());
                (bytes, 4)
            }
            IpAddr::V6(v6) => {
                bytes.copy_from_slice(&v6.octets());
                (bytes, 16)
            }
        }
    }

    /// Encode into a `sockaddr_storage` suitable for bind/connect.
    pub fn to_raw(&self) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match self.ip {
            IpAddr::V4(v4) => {
                let sa = &mut storage as *mut _ as *mut libc::sockaddr_in;
                unsafe {
                    (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sa).sin_port = self.port.to_be();
                    (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            IpAddr::V6(v6) => {
                let sa = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                unsafe {
                    (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sa).sin6_port = self.port.to_be();
                    (*sa).sin6_addr.s6_addr = v6.octets();
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        (storage, len as libc::socklen_t)
    }

    /// Decode a kernel-filled `sockaddr_storage` (from accept, getsockname,
    /// getaddrinfo) back into an `Address`.
    pub fn from_raw(
        storage: &libc::sockaddr_storage,
        len: libc::socklen_t,
        kind: SocketKind,
        protocol: i32,
    ) -> Result<Self> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                if (len as usize) < mem::size_of::<libc::sockaddr_in>() {
                    return Err(Error::InvalidArgument);
                }
                let sa = storage as *const _ as *const libc::sockaddr_in;
                let (addr, port) = unsafe {
                    (
                        Ipv4Addr::from((*sa).sin_addr.s_addr.to_ne_bytes()),
                        u16::from_be((*sa).sin_port),
                    )
                };
                Ok(Address {
                    ip: IpAddr::V4(addr),
                    port,
                    kind,
                    protocol,
                })
            }
            libc::AF_INET6 => {
                if (len as usize) < mem::size_of::<libc::sockaddr_in6>() {
                    return Err(Error::InvalidArgument);
                }
                let sa = storage as *const _ as *const libc::sockaddr_in6;
                let (addr, port) = unsafe {
                    (
                        Ipv6Addr::from((*sa).sin6_addr.s6_addr),
                        u16::from_be((*sa).sin6_port),
                    )
                };
                Ok(Address {
                    ip: IpAddr::V6(addr),
                    port,
                    kind,
                    protocol,
                })
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        Address::stream(sa.ip(), sa.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let sa: SocketAddr = s.parse().map_err(|_| Error::InvalidArgument)?;
        Ok(Address::from(sa))
    }
}

/// Resolve a host name (or literal address) into stream endpoints.
///
/// Literal addresses skip the resolver. Names that do not resolve produce an
/// empty list, never an error.
pub fn resolve(host: &str, port: u16, pref: FamilyPref) -> Vec<Address> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        let addr = Address::stream(ip, port);
        return if pref.admits(addr.family()) {
            vec![addr]
        } else {
            Vec::new()
        };
    }

    let Ok(c_host) = CString::new(host) else {
        return Vec::new();
    };

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = pref.to_raw();
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(c_host.as_ptr(), ptr::null(), &hints, &mut list) };
    if rc != 0 {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut cur = list;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        if !ai.ai_addr.is_null() {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let copy_len =
                (ai.ai_addrlen as usize).min(mem::size_of::<libc::sockaddr_storage>());
            unsafe {
                ptr::copy_nonoverlapping(
                    ai.ai_addr as *const u8,
                    &mut storage as *mut _ as *mut u8,
                    copy_len,
                );
            }
            if let Ok(mut addr) = Address::from_raw(
                &storage,
                ai.ai_addrlen,
                SocketKind::Stream,
                libc::IPPROTO_TCP,
            ) {
                addr.port = port;
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(list) };
    out
}

/// Resolve a host against a URL scheme instead of a numeric port.
/// Unknown schemes yield an empty list.
pub fn resolve_scheme(host: &str, scheme: &str, pref: FamilyPref) -> Vec<Address> {
    match scheme_port(scheme) {
        Some(port) => resolve(host, port, pref),
        None => Vec::new(),
    }
}

/// Default port for a well-known URL scheme.
pub fn scheme_port(scheme: &str) -> Option<u16> {
    let port = match scheme {
        "ftp" => 21,
        "ssh" => 22,
        "telnet" => 23,
        "smtp" => 25,
        "dns" => 53,
        "http" | "ws" => 80,
        "nntp" => 119,
        "imap" => 143,
        "ldap" => 389,
        "https" | "wss" => 443,
        "smtps" => 465,
        "rtsp" => 554,
        "ldaps" => 636,
        "dnss" => 853,
        "imaps" => 993,
        "sip" => 5060,
        "sips" => 5061,
        "xmpp" => 5222,
        _ => return None,
    };
    Some(port)
}
