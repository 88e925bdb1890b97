use std::{
    io, mem,
    net::{IpAddr, SocketAddr},
    os::unix::io::{AsRawFd, RawFd},
};

use anyhow::{anyhow, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;

/// ICMPv4 echo socket. A raw socket sees whole IP packets and needs
/// CAP_NET_RAW; a datagram ("ping") socket only sees the ICMP message and
/// gets the TTL from a control message.
pub struct ICMPSocket {
    socket: Socket,
    raw: bool,
}

impl ICMPSocket {
    pub fn new(privileged: bool) -> io::Result<ICMPSocket> {
        let kind = if privileged { Type::RAW } else { Type::DGRAM };
        let socket = Socket::new(Domain::IPV4, kind, Some(Protocol::ICMPV4))?;
        socket.set_nonblocking(true)?;
        if !privileged {
            enable_recv_ttl(&socket)?;
        }
        Ok(ICMPSocket {
            socket,
            raw: privileged,
        })
    }

    pub fn bind_device(self, bind_interface: &str) -> io::Result<ICMPSocket> {
        Ok(ICMPSocket {
            socket: bind_to_device(self.socket, bind_interface)?,
            raw: self.raw,
        })
    }

    /// Sets TTL and TOS on outgoing packets and restricts the socket to
    /// replies from `dst_addr`.
    pub fn configure(
        &self,
        ttl: u32,
        traffic_class: u8,
        dst_addr: IpAddr,
    ) -> io::Result<()> {
        self.socket.set_ttl(ttl)?;
        self.socket.set_tos(u32::from(traffic_class))?;
        self.socket.connect(&SocketAddr::new(dst_addr, 0).into())?;
        Ok(())
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }
    pub fn get_ref(&self) -> &Socket {
        &self.socket
    }
}

impl AsRawFd for ICMPSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

pub struct AsyncICMPSocket {
    inner: AsyncFd<ICMPSocket>,
}

impl AsyncICMPSocket {
    pub fn new(socket: ICMPSocket) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    pub fn is_raw(&self) -> bool {
        self.inner.get_ref().is_raw()
    }

    pub async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().get_ref().send(packet)) {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }

    /// Reads one datagram into `buf`. Returns its length and, for datagram
    /// sockets, the TTL the kernel reported for it.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<u8>)> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard
                .try_io(|inner| recv_with_ttl(inner.get_ref().get_ref(), buf))
            {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }
}

fn enable_recv_ttl(socket: &Socket) -> io::Result<()> {
    let on: libc::c_int = 1;
    // Safety: `on` outlives the call and the length matches its type
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_RECVTTL,
            (&on as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recv_with_ttl(socket: &Socket, buf: &mut [u8]) -> io::Result<(usize, Option<u8>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = [0u64; 8];
    // Safety: an all-zero msghdr is a valid empty header
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = mem::size_of_val(&control) as _;

    // Safety: every pointer in `msg` refers to a live local buffer
    let len = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ttl = None;
    // Safety: the kernel filled `control` with `msg_controllen` bytes of
    // well formed cmsg headers
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP
                && (*cmsg).cmsg_type == libc::IP_TTL
            {
                let value = std::ptr::read_unaligned(
                    libc::CMSG_DATA(cmsg) as *const libc::c_int,
                );
                ttl = u8::try_from(value).ok();
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok((len as usize, ttl))
}

pub fn bind_to_device(
    socket: Socket,
    bind_interface: &str,
) -> Result<Socket, std::io::Error> {
    // Socket2 bind_device does not have nice error types, so we have to handle
    // the libc errors. In case, we get an error when binding, map it into a
    // more friendly std::io::Error
    if let Err(err) = socket.bind_device(Some(bind_interface.as_bytes())) {
        return if matches!(err.raw_os_error(), Some(libc::ENODEV)) {
            let error_msg = format!(
                "error binding to device (`{}`): {}",
                bind_interface, err
            );
            Err(std::io::Error::new(std::io::ErrorKind::Other, error_msg))
        } else {
            let error_msg = format!("unexpected error binding device: {}", err);
            Err(std::io::Error::new(std::io::ErrorKind::Other, error_msg))
        };
    }

    Ok(socket)
}

// Get the IP address of an interface. Also serves as a check that the
// interface exists before anything is bound to it.
pub fn interface_to_ipaddr(interface: &str) -> Result<IpAddr> {
    let interfaces = pnet_datalink::interfaces();
    let interface = interfaces
        .into_iter()
        .find(|iface| iface.name == interface)
        .ok_or_else(|| anyhow!("interface not found"))?;

    let ipaddr = interface
        .ips
        .into_iter()
        .find(|ip| ip.is_ipv4() || ip.is_ipv6())
        .ok_or_else(|| anyhow!("interface has no IPv4 or IPv6 address"))?;

    Ok(ipaddr.ip())
}
