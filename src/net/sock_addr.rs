use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

/// Storage large enough for either address family.
#[derive(Clone, Copy)]
pub(crate) union RawAddr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

/// A C socket address together with the length the kernel should look at.
pub(crate) struct CSockAddr {
    addr: RawAddr,
    pub len: libc::socklen_t,
}

impl CSockAddr {
    /// Zeroed storage for the kernel to fill in, as for `getsockname(2)`.
    pub fn empty() -> Self {
        Self {
            addr: unsafe { std::mem::zeroed() },
            len: std::mem::size_of::<RawAddr>() as _,
        }
    }

    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.addr as *const _ as *const _
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.addr as *mut _ as *mut _
    }
}

impl From<SocketAddr> for CSockAddr {
    fn from(value: SocketAddr) -> Self {
        let mut addr: RawAddr = unsafe { std::mem::zeroed() };

        match value {
            SocketAddr::V4(a) => {
                addr.v4.sin_family = libc::AF_INET as _;
                addr.v4.sin_addr.s_addr = u32::from(*a.ip()).to_be();
                addr.v4.sin_port = a.port().to_be();

                Self {
                    addr,
                    len: std::mem::size_of::<libc::sockaddr_in>() as _,
                }
            }
            SocketAddr::V6(a) => {
                addr.v6.sin6_family = libc::AF_INET6 as _;
                addr.v6.sin6_addr.s6_addr = a.ip().octets();
                addr.v6.sin6_port = a.port().to_be();
                addr.v6.sin6_flowinfo = a.flowinfo();
                addr.v6.sin6_scope_id = a.scope_id();

                Self {
                    addr,
                    len: std::mem::size_of::<libc::sockaddr_in6>() as _,
                }
            }
        }
    }
}

impl TryFrom<&CSockAddr> for SocketAddr {
    type Error = io::Error;

    fn try_from(value: &CSockAddr) -> Result<Self, Self::Error> {
        // The family tag sits at the same offset in both layouts.
        let family = unsafe { value.addr.v4.sin_family } as libc::c_int;

        match family {
            libc::AF_INET => unsafe {
                let v4 = value.addr.v4;
                Ok(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr)),
                    u16::from_be(v4.sin_port),
                )))
            },
            libc::AF_INET6 => unsafe {
                let v6 = value.addr.v6;
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(v6.sin6_addr.s6_addr),
                    u16::from_be(v6.sin6_port),
                    v6.sin6_flowinfo,
                    v6.sin6_scope_id,
                )))
            },
            _ => Err(io::ErrorKind::InvalidData.into()),
        }
    }
}
