//! Raw CARP sockets.
//!
//! One socket per (interface, family): bound to the device, joined to the
//! CARP group on that interface, TTL / hop limit 255, multicast loopback
//! disabled so a host never hears itself.
//!
//! Advertisements leave with the backing address as source: `IP_MULTICAST_IF`
//! for IPv4, an `IPV6_PKTINFO` control message for IPv6.

use carp::{CARP_MULTICAST_ADDR_V4, CARP_MULTICAST_ADDR_V6, CARP_PROTOCOL, CARP_TTL, Family};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, SockAddr, Socket, Type};
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;

const RECV_BUFFER: usize = 1500;

/// A packet read off a CARP socket, IP header removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: IpAddr,
    /// Only known for IPv4, where the kernel hands us the IP header
    pub ttl: Option<u8>,
    pub payload: Vec<u8>,
}

/// CARP socket for one interface and address family
pub struct CarpSocket {
    fd: AsyncFd<Socket>,
    interface: String,
    index: u32,
    family: Family,
}

impl CarpSocket {
    /// Open the socket and join the CARP group on `interface`.
    ///
    /// Requires CAP_NET_RAW. Must be called inside a tokio runtime.
    pub fn open(interface: &str, family: Family) -> io::Result<Self> {
        let index = interface_index(interface)?;
        let domain = match family {
            Family::Inet => Domain::IPV4,
            Family::Inet6 => Domain::IPV6,
        };

        let socket = Socket::new(
            domain,
            Type::RAW,
            Some(Protocol::from(i32::from(CARP_PROTOCOL))),
        )?;
        socket.set_nonblocking(true)?;
        socket.bind_device(Some(interface.as_bytes()))?;

        let fd = socket.as_raw_fd();
        let hops = libc::c_int::from(CARP_TTL);
        match family {
            Family::Inet => {
                setsockopt(fd, libc::IPPROTO_IP, libc::IP_TTL, &hops)?;
                setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, &hops)?;
                setsockopt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, &0)?;
            }
            Family::Inet6 => {
                setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, &hops)?;
                setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, &hops)?;
                setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, &0)?;
            }
        }
        membership(&socket, family, index, true)?;

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            interface: interface.to_string(),
            index,
            family,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Send an encoded advertisement from `source` to the family's CARP group.
    pub fn send(&self, payload: &[u8], source: IpAddr) -> io::Result<()> {
        let group = SockAddr::from(SocketAddr::new(self.family.group(), 0));
        let socket = self.fd.get_ref();
        let sent = match (self.family, source) {
            (Family::Inet, IpAddr::V4(source)) => {
                let mreq = multicast_if_v4(source, self.index);
                setsockopt(socket.as_raw_fd(), libc::IPPROTO_IP, libc::IP_MULTICAST_IF, &mreq)?;
                socket.send_to(payload, &group)?
            }
            (Family::Inet6, IpAddr::V6(source)) => {
                send_with_pktinfo(socket.as_raw_fd(), payload, &group, pktinfo_v6(source, self.index))?
            }
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("source {source} does not match {} socket", self.family),
                ));
            }
        };
        if sent != payload.len() {
            return Err(io::Error::new(ErrorKind::WriteZero, "short write"));
        }
        Ok(())
    }

    /// Wait for the next datagram.
    pub async fn recv(&self) -> io::Result<Datagram> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUFFER];
                let (len, from) = inner.get_ref().recv_from(&mut buf)?;
                // recv_from initialised the first `len` bytes
                let data: Vec<u8> = buf[..len]
                    .iter()
                    .map(|b| unsafe { b.assume_init() })
                    .collect();
                Ok((data, from))
            });

            match result {
                Ok(Ok((data, from))) => return self.datagram(data, &from),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    fn datagram(&self, data: Vec<u8>, from: &SockAddr) -> io::Result<Datagram> {
        match self.family {
            Family::Inet => strip_ipv4_header(&data),
            Family::Inet6 => {
                let source = from
                    .as_socket()
                    .map(|addr| addr.ip())
                    .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "invalid source address"))?;
                Ok(Datagram {
                    source,
                    ttl: None,
                    payload: data,
                })
            }
        }
    }
}

impl Drop for CarpSocket {
    fn drop(&mut self) {
        let _ = membership(self.fd.get_ref(), self.family, self.index, false);
    }
}

/// Join or leave the CARP group of `family` on interface `index`.
fn membership(socket: &Socket, family: Family, index: u32, join: bool) -> io::Result<()> {
    match family {
        Family::Inet => {
            let group = InterfaceIndexOrAddress::Index(index);
            if join {
                socket.join_multicast_v4_n(&CARP_MULTICAST_ADDR_V4, &group)
            } else {
                socket.leave_multicast_v4_n(&CARP_MULTICAST_ADDR_V4, &group)
            }
        }
        Family::Inet6 => {
            if join {
                socket.join_multicast_v6(&CARP_MULTICAST_ADDR_V6, index)
            } else {
                socket.leave_multicast_v6(&CARP_MULTICAST_ADDR_V6, index)
            }
        }
    }
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (value as *const T).cast::<libc::c_void>(),
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `IP_MULTICAST_IF` argument selecting both the outgoing interface and the
/// source address of multicast sends.
fn multicast_if_v4(source: Ipv4Addr, index: u32) -> libc::ip_mreqn {
    libc::ip_mreqn {
        imr_multiaddr: libc::in_addr { s_addr: 0 },
        imr_address: libc::in_addr {
            s_addr: u32::from_ne_bytes(source.octets()),
        },
        imr_ifindex: index as libc::c_int,
    }
}

fn pktinfo_v6(source: Ipv6Addr, index: u32) -> libc::in6_pktinfo {
    libc::in6_pktinfo {
        ipi6_addr: libc::in6_addr {
            s6_addr: source.octets(),
        },
        ipi6_ifindex: index as _,
    }
}

/// sendmsg(2) with one `IPV6_PKTINFO` control message.
fn send_with_pktinfo(
    fd: RawFd,
    payload: &[u8],
    to: &SockAddr,
    info: libc::in6_pktinfo,
) -> io::Result<usize> {
    let info_len = std::mem::size_of::<libc::in6_pktinfo>() as u32;
    // u64 keeps the buffer aligned for cmsghdr
    let mut control = [0u64; 8];
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let sent = unsafe {
        let mut msg: libc::msghdr = std::mem::zeroed();
        msg.msg_name = to.as_ptr() as *mut libc::c_void;
        msg.msg_namelen = to.len();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = libc::CMSG_SPACE(info_len) as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(ErrorKind::Other, "control buffer too small"));
        }
        (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
        (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
        (*cmsg).cmsg_len = libc::CMSG_LEN(info_len) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::in6_pktinfo>(), info);

        libc::sendmsg(fd, &msg, 0)
    };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

/// Split a raw IPv4 packet into source, TTL and protocol payload.
pub fn strip_ipv4_header(packet: &[u8]) -> io::Result<Datagram> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return Err(io::Error::new(ErrorKind::InvalidData, "not an IPv4 packet"));
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < 20 || packet.len() < header_len {
        return Err(io::Error::new(ErrorKind::InvalidData, "truncated IPv4 header"));
    }

    let source = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    Ok(Datagram {
        source: IpAddr::V4(source),
        ttl: Some(packet[8]),
        payload: packet[header_len..].to_vec(),
    })
}

/// Get the interface index for a given interface name
pub fn interface_index(name: &str) -> io::Result<u32> {
    use std::ffi::CString;

    let c_name = CString::new(name).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        Err(io::Error::new(
            ErrorKind::NotFound,
            format!("Interface {} not found", name),
        ))
    } else {
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_packet(ttl: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x45, 0, 0, 0, 0, 0, 0, 0, ttl, CARP_PROTOCOL, 0, 0];
        packet.extend_from_slice(&[10, 0, 0, 7]);
        packet.extend_from_slice(&[224, 0, 0, 18]);
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_interface_index() {
        assert!(interface_index("lo").unwrap() > 0);
        assert!(interface_index("nonexistent99").is_err());
        assert!(interface_index("bad\0name").is_err());
    }

    #[test]
    fn test_strip_ipv4_header() {
        let datagram = strip_ipv4_header(&ipv4_packet(255, &[1, 2, 3])).unwrap();
        assert_eq!(datagram.source, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(datagram.ttl, Some(255));
        assert_eq!(datagram.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_strip_ipv4_header_with_options() {
        let mut packet = ipv4_packet(64, &[]);
        packet[0] = 0x46;
        packet.extend_from_slice(&[0, 0, 0, 0, 9, 9]);
        let datagram = strip_ipv4_header(&packet).unwrap();
        assert_eq!(datagram.ttl, Some(64));
        assert_eq!(datagram.payload, vec![9, 9]);
    }

    #[test]
    fn test_strip_rejects_garbage() {
        assert!(strip_ipv4_header(&[0x45; 10]).is_err());
        assert!(strip_ipv4_header(&ipv4_packet(255, &[])[..19]).is_err());

        let mut v6 = ipv4_packet(255, &[]);
        v6[0] = 0x60;
        assert!(strip_ipv4_header(&v6).is_err());

        let mut long_header = ipv4_packet(255, &[]);
        long_header[0] = 0x4F;
        assert!(strip_ipv4_header(&long_header).is_err());
    }

    #[test]
    fn test_multicast_if_carries_source() {
        let mreq = multicast_if_v4(Ipv4Addr::new(10, 0, 0, 2), 3);
        assert_eq!(mreq.imr_address.s_addr.to_ne_bytes(), [10, 0, 0, 2]);
        assert_eq!(mreq.imr_ifindex, 3);
    }

    #[test]
    fn test_pktinfo_carries_source() {
        let source: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let info = pktinfo_v6(source, 7);
        assert_eq!(info.ipi6_addr.s6_addr, source.octets());
        assert_eq!(info.ipi6_ifindex, 7);
    }

    #[tokio::test]
    async fn test_send_rejects_foreign_source_family() {
        // Needs CAP_NET_RAW to open the socket at all.
        let Ok(socket) = CarpSocket::open("lo", Family::Inet) else {
            return;
        };
        let err = socket
            .send(&[0; 36], "::1".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_open_without_privileges_does_not_panic() {
        // Needs CAP_NET_RAW; only check that failure is reported cleanly.
        let _ = CarpSocket::open("lo", Family::Inet);
        let _ = CarpSocket::open("lo", Family::Inet6);
    }
}
