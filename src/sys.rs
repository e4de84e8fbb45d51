//! Thin wrappers around the raw syscalls the loop drives.
//!
//! Everything descriptor-shaped in the library goes through this module: socket creation and
//! shuffling, scatter-gather writes, ancillary-data transfers, inotify, and the one-shot
//! readiness probe. Errors are translated to the portable set right here, so the state machines
//! above never see a raw errno.

use std::ffi::{CString, OsStr};
use std::io::IoSlice;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::error::{Error, Result};

fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(Error::last_os())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> Result<usize> {
    if ret < 0 {
        Err(Error::last_os())
    } else {
        Ok(ret as usize)
    }
}

/// A nonblocking, close-on-exec stream socket of the given family.
pub fn socket_stream(family: libc::c_int) -> Result<OwnedFd> {
    let fd = cvt(unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A connected pair of nonblocking stream sockets. Used both for stdio plumbing towards children
/// and for tests that need a loopback-free byte pipe.
pub fn socketpair_stream() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    cvt(unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Duplicate a descriptor so the copy lands at or above `min`. Keeping every source above the
/// child's descriptor table avoids dup2 collisions while the table is wired up.
pub fn dup_cloexec_above(fd: RawFd, min: RawFd) -> Result<OwnedFd> {
    let dup = cvt(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

/// Open the null device, read-write. The child side of an ignored stdio slot gets this.
pub fn open_devnull() -> Result<OwnedFd> {
    let fd = cvt(unsafe { libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn addr_into_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        },
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        },
    }
}

fn addr_from_storage(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        },
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        },
        _ => None,
    }
}

fn unix_sockaddr(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(Error::Inval);
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

pub fn bind_inet(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let (storage, len) = addr_into_storage(addr);
    cvt(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
    Ok(())
}

pub fn bind_unix(fd: RawFd, path: &Path) -> Result<()> {
    let (addr, len) = unix_sockaddr(path)?;
    cvt(unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) })?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: i32) -> Result<()> {
    cvt(unsafe { libc::listen(fd, backlog) })?;
    Ok(())
}

/// Accept one connection; the returned socket is nonblocking and close-on-exec.
pub fn accept(fd: RawFd) -> Result<OwnedFd> {
    let conn = cvt(unsafe {
        libc::accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(conn) })
}

/// Start a nonblocking connect. `Ok(true)` means the connection is already established,
/// `Ok(false)` that it is in flight and completion arrives as writability.
pub fn connect_inet(fd: RawFd, addr: &SocketAddr) -> Result<bool> {
    let (storage, len) = addr_into_storage(addr);
    connect_result(unsafe {
        libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
    })
}

pub fn connect_unix(fd: RawFd, path: &Path) -> Result<bool> {
    let (addr, len) = unix_sockaddr(path)?;
    connect_result(unsafe { libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) })
}

fn connect_result(ret: libc::c_int) -> Result<bool> {
    if ret == 0 {
        return Ok(true);
    }
    match nix::errno::Errno::last() {
        nix::errno::Errno::EINPROGRESS | nix::errno::Errno::EAGAIN => Ok(false),
        errno => Err(Error::from_errno(errno)),
    }
}

/// The delayed status of a nonblocking connect, read from SO_ERROR.
pub fn take_socket_error(fd: RawFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    if err == 0 {
        Ok(())
    } else {
        Err(Error::from_errno(nix::errno::Errno::from_raw(err)))
    }
}

fn setsockopt_int(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> Result<()> {
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

pub fn set_reuseaddr(fd: RawFd) -> Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

pub fn set_nodelay(fd: RawFd, enable: bool) -> Result<()> {
    setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int)
}

pub fn set_keepalive(fd: RawFd, enable: bool, delay_secs: u32) -> Result<()> {
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enable as libc::c_int)?;
    if enable && delay_secs > 0 {
        setsockopt_int(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            delay_secs as libc::c_int,
        )?;
    }
    Ok(())
}

/// The locally bound address of an internet socket.
pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    addr_from_storage(&storage).ok_or(Error::Inval)
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
}

/// Scatter-gather write of whatever portion the kernel takes right now.
pub fn writev(fd: RawFd, bufs: &[IoSlice]) -> Result<usize> {
    let count = bufs.len().min(libc::c_int::MAX as usize) as libc::c_int;
    cvt_size(unsafe { libc::writev(fd, bufs.as_ptr().cast::<libc::iovec>(), count) })
}

pub fn shutdown_write(fd: RawFd) -> Result<()> {
    cvt(unsafe { libc::shutdown(fd, libc::SHUT_WR) })?;
    Ok(())
}

/// One `poll(2)` round on a single descriptor. Returns the revents mask; a zero mask means the
/// timeout ran out. This backs the slow poll path and the readiness probe of the fast one.
pub fn poll_once(fd: RawFd, events: libc::c_short, timeout_ms: libc::c_int) -> Result<libc::c_short> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            match nix::errno::Errno::last() {
                nix::errno::Errno::EINTR => continue,
                errno => return Err(Error::from_errno(errno)),
            }
        }
        return Ok(if ret == 0 { 0 } else { pfd.revents });
    }
}

/// Send bytes, optionally attaching one descriptor as SCM_RIGHTS ancillary data.
pub fn send_with_fd(fd: RawFd, data: &[u8], pass: Option<RawFd>) -> Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; space];
    if let Some(pass_fd) = pass {
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = space as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), pass_fd);
        }
    }

    cvt_size(unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) })
}

/// Receive bytes, collecting any descriptors that arrived as ancillary data.
pub fn recv_with_fds(fd: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // Room for a handful of descriptors per message; senders in this library attach one.
    let space = unsafe { libc::CMSG_SPACE((8 * mem::size_of::<RawFd>()) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; space];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let n = cvt_size(unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) })?;

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = payload / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(std::ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(n)
}

/// A nonblocking, close-on-exec inotify instance.
pub fn inotify_init() -> Result<OwnedFd> {
    let fd = cvt(unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn inotify_add_watch(fd: RawFd, path: &Path, mask: u32) -> Result<libc::c_int> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Inval)?;
    cvt(unsafe { libc::inotify_add_watch(fd, c_path.as_ptr(), mask) })
}

/// What kind of thing hides behind this descriptor. Follows the platform heuristics: an anonymous
/// UNIX-domain socket reports as a named pipe, not as unknown.
pub fn guess_fd_kind(fd: RawFd) -> crate::HandleKind {
    use crate::HandleKind;

    if fd < 0 {
        return HandleKind::Unknown;
    }
    if unsafe { libc::isatty(fd) } == 1 {
        return HandleKind::Tty;
    }
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return HandleKind::Unknown;
    }
    match stat.st_mode & libc::S_IFMT {
        libc::S_IFREG | libc::S_IFBLK | libc::S_IFCHR => HandleKind::File,
        libc::S_IFIFO => HandleKind::NamedPipe,
        libc::S_IFSOCK => {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let ret = unsafe {
                libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
            };
            if ret != 0 {
                return HandleKind::Unknown;
            }
            let mut ty: libc::c_int = 0;
            let mut ty_len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_TYPE,
                    &mut ty as *mut _ as *mut libc::c_void,
                    &mut ty_len,
                );
            }
            match storage.ss_family as libc::c_int {
                // Some systems hand back an empty address for anonymous UNIX sockets; those are
                // still pipes, not unknowns.
                libc::AF_UNIX | libc::AF_UNSPEC => HandleKind::NamedPipe,
                _ if ty == libc::SOCK_DGRAM => HandleKind::Udp,
                _ => HandleKind::Tcp,
            }
        },
        _ => HandleKind::Unknown,
    }
}

/// Pretend the path is an `OsStr` of bytes; inotify names arrive like this.
pub fn os_str_from_bytes(bytes: &[u8]) -> &OsStr {
    OsStr::from_bytes(bytes)
}
