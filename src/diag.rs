use std::convert::TryInto;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;
use anyhow::{anyhow, Result};
use libc::{c_int, c_void, sockaddr, sockaddr_nl, socklen_t, timeval};
use log::{debug, trace};
use tokio::sync::mpsc::Sender;
use crate::data::{canonical, Family, Socket};

const NETLINK_SOCK_DIAG:   c_int = 4;
const SOCK_DIAG_BY_FAMILY: u16   = 20;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE:  u16 = 3;

const NLM_F_REQUEST: u16 = 0x001;
const NLM_F_DUMP:    u16 = 0x300;

const NLMSG_HDRLEN:  usize = 16;
const REQUEST_LEN:   usize = 56;
const DIAG_MSG_LEN:  usize = 72;

const ALL_STATES: u32 = 0xfff;
const RECV_BUF:   usize = 32 * 1024;

pub struct DiagSocket {
    fd:  RawFd,
    seq: u32,
}

impl DiagSocket {
    pub fn open() -> Result<Self> {
        let kind = libc::SOCK_RAW | libc::SOCK_CLOEXEC;
        let fd = unsafe { libc::socket(libc::AF_NETLINK, kind, NETLINK_SOCK_DIAG) };
        if fd < 0 {
            return Err(anyhow!("netlink socket: {}", io::Error::last_os_error()));
        }

        let socket = Self { fd, seq: 0 };
        socket.timeout(Duration::from_secs(5))?;
        Ok(socket)
    }

    pub fn dump(&mut self, family: Family) -> Result<Vec<Socket>> {
        self.seq = self.seq.wrapping_add(1);
        self.send(&request(family, self.seq))?;

        let mut buf     = vec![0u8; RECV_BUF];
        let mut sockets = Vec::new();

        loop {
            let n = self.recv(&mut buf)?;
            if n == 0 {
                return Err(anyhow!("netlink socket closed"));
            }
            if decode(&buf[..n], &mut sockets)? {
                break;
            }
        }

        trace!("tcp_diag {:?} dump returned {} sockets", family, sockets.len());

        Ok(sockets)
    }

    fn send(&self, msg: &[u8]) -> Result<()> {
        let mut addr: sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;

        let n = unsafe {
            libc::sendto(
                self.fd,
                msg.as_ptr() as *const c_void,
                msg.len(),
                0,
                &addr as *const sockaddr_nl as *const sockaddr,
                mem::size_of::<sockaddr_nl>() as socklen_t,
            )
        };

        match n {
            n if n < 0 => Err(anyhow!("netlink send: {}", io::Error::last_os_error())),
            n if n as usize != msg.len() => Err(anyhow!("netlink short send: {}", n)),
            _ => Ok(()),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe {
            libc::recv(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0)
        };

        if n < 0 {
            return Err(anyhow!("netlink recv: {}", io::Error::last_os_error()));
        }

        Ok(n as usize)
    }

    fn timeout(&self, timeout: Duration) -> Result<()> {
        let tv = timeval {
            tv_sec:  timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const timeval as *const c_void,
                mem::size_of::<timeval>() as socklen_t,
            )
        };

        if rc < 0 {
            return Err(anyhow!("netlink setsockopt: {}", io::Error::last_os_error()));
        }

        Ok(())
    }
}

impl Drop for DiagSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

pub fn poll(period: Duration, tx: Sender<Socket>) -> Result<()> {
    let mut socket = DiagSocket::open()?;

    loop {
        for family in [Family::V4, Family::V6] {
            for s in socket.dump(family)? {
                if tx.blocking_send(s).is_err() {
                    debug!("socket queue closed");
                    return Ok(());
                }
            }
        }
        thread::sleep(period);
    }
}

/// Encodes an `nlmsghdr` followed by an `inet_diag_req_v2` asking for every
/// TCP socket of one address family. Netlink headers are host-endian.
pub fn request(family: Family, seq: u32) -> Vec<u8> {
    let len = NLMSG_HDRLEN + REQUEST_LEN;
    let mut msg = Vec::with_capacity(len);

    msg.extend_from_slice(&(len as u32).to_ne_bytes());
    msg.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes());
    msg.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());

    msg.push(family_code(family));
    msg.push(libc::IPPROTO_TCP as u8);
    msg.push(0);
    msg.push(0);
    msg.extend_from_slice(&ALL_STATES.to_ne_bytes());
    msg.resize(len, 0);

    msg
}

pub fn decode(buf: &[u8], sockets: &mut Vec<Socket>) -> Result<bool> {
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let len  = u32_at(buf, offset)? as usize;
        let kind = u16_at(buf, offset + 4)?;

        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return Err(anyhow!("truncated netlink message: {} bytes", len));
        }

        let payload = &buf[offset + NLMSG_HDRLEN..offset + len];

        match kind {
            NLMSG_DONE  => return Ok(true),
            NLMSG_ERROR => {
                let errno = i32::from_ne_bytes(field(payload, 0)?);
                if errno != 0 {
                    let err = io::Error::from_raw_os_error(-errno);
                    return Err(anyhow!("tcp_diag request failed: {}", err));
                }
            }
            SOCK_DIAG_BY_FAMILY => {
                let socket = message(payload)?;
                if socket.inode != 0 {
                    sockets.push(socket);
                }
            }
            other => debug!("ignoring netlink message type {}", other),
        }

        offset += align(len);
    }

    Ok(false)
}

fn message(payload: &[u8]) -> Result<Socket> {
    if payload.len() < DIAG_MSG_LEN {
        return Err(anyhow!("short inet_diag_msg: {} bytes", payload.len()));
    }

    let family = match payload[0] as c_int {
        libc::AF_INET  => Family::V4,
        libc::AF_INET6 => Family::V6,
        other => return Err(anyhow!("unknown address family {}", other)),
    };

    let sport = u16::from_be_bytes(field(payload, 4)?);
    let dport = u16::from_be_bytes(field(payload, 6)?);
    let src   = address(family, field(payload, 8)?);
    let dst   = address(family, field(payload, 24)?);

    Ok(Socket {
        src:       SocketAddr::new(src, sport),
        dst:       SocketAddr::new(dst, dport),
        uid:       u32::from_ne_bytes(field(payload, 64)?),
        inode:     u64::from(u32::from_ne_bytes(field(payload, 68)?)),
        container: None,
    })
}

fn address(family: Family, octets: [u8; 16]) -> IpAddr {
    match family {
        Family::V4 => Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]).into(),
        Family::V6 => canonical(Ipv6Addr::from(octets).into()),
    }
}

fn family_code(family: Family) -> u8 {
    match family {
        Family::V4 => libc::AF_INET as u8,
        Family::V6 => libc::AF_INET6 as u8,
    }
}

fn field<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    let bytes = buf.get(offset..offset + N).ok_or_else(|| {
        anyhow!("field at {} out of bounds", offset)
    })?;
    Ok(bytes.try_into()?)
}

fn u32_at(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_ne_bytes(field(buf, offset)?))
}

fn u16_at(buf: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_ne_bytes(field(buf, offset)?))
}

fn align(len: usize) -> usize {
    (len + 3) & !3
}
