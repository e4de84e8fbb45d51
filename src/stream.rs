//! Byte streams: TCP sockets and named pipes.
//!
//! Both kinds share one state machine. A stream goes through bind/listen/accept on the server
//! side or connect on the client side, and once connected carries ordered reads and writes.
//! Reads are pull-armed (`read_start` keeps delivering until `EOF`, an error, or `read_stop`);
//! writes are queued requests that complete in submission order with partial writes handled
//! internally. Shutdown sends FIN once the write queue drains.
//!
//! Named pipes are UNIX-domain sockets. A pipe created in IPC mode may additionally carry a
//! descriptor alongside its bytes, using ancillary data.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use log::trace;

use crate::core::{
    Completion, HandleImp, Scope, BOUND, CLOSING, CONNECTION, IPC, LISTENING, READABLE, READING,
    READ_EOF, SHUT, SHUTTING, WRITABLE,
};
use crate::error::{Error, Result};
use crate::poller::{InterestMask, WatcherId};
use crate::sys;
use crate::{Handle, HandleKind, Loop, RequestId};

/// Callback of a listening stream; fires once per incoming connection, which is then adopted
/// with [accept](struct.Loop.html#method.accept).
pub type ConnectionCb = Box<dyn FnMut(&mut Scope, Result<()>)>;
/// Completion of a connect request.
pub type ConnectCb = Box<dyn FnOnce(&mut Scope, Result<()>)>;
/// Completion of a write request; fires only when the whole request drained or failed.
pub type WriteCb = Box<dyn FnOnce(&mut Scope, Result<()>)>;
/// Completion of a shutdown request.
pub type ShutdownCb = Box<dyn FnOnce(&mut Scope, Result<()>)>;
/// Supplies a read buffer of (at least) the suggested size. Returning an empty buffer makes the
/// read fail with `Nomem`.
pub type AllocCb = Box<dyn FnMut(&mut Scope, usize) -> Vec<u8>>;
/// Delivers read data. `Ok(n)` with the buffer truncated to `n` bytes, `Ok(0)` for "nothing to
/// read right now", `Err(Eof)` at end of stream, any other error after translation.
pub type ReadCb = Box<dyn FnMut(&mut Scope, Result<usize>, Vec<u8>)>;

const READ_CHUNK: usize = 64 * 1024;

struct WriteReq {
    bufs: Vec<Vec<u8>>,
    buf_idx: usize,
    offset: usize,
    send_fd: Option<OwnedFd>,
    cb: WriteCb,
}

impl WriteReq {
    fn remaining(&self) -> usize {
        let mut total = 0;
        for (i, buf) in self.bufs.iter().enumerate().skip(self.buf_idx) {
            total += buf.len();
            if i == self.buf_idx {
                total -= self.offset;
            }
        }
        total
    }

    /// Account `n` freshly written bytes; true once the whole request is on the wire.
    fn advance(&mut self, mut n: usize) -> bool {
        if self.buf_idx >= self.bufs.len() {
            return true;
        }
        while n > 0 {
            let left = self.bufs[self.buf_idx].len() - self.offset;
            if n < left {
                self.offset += n;
                return false;
            }
            n -= left;
            self.buf_idx += 1;
            self.offset = 0;
            if self.buf_idx == self.bufs.len() {
                return true;
            }
        }
        self.buf_idx == self.bufs.len()
    }
}

enum FinishedReq {
    Write(WriteCb),
    Shutdown(ShutdownCb),
    Connect(ConnectCb),
}

pub(crate) struct StreamImp {
    io: Option<OwnedFd>,
    watcher: Option<WatcherId>,
    connection_cb: Option<ConnectionCb>,
    accept_queue: VecDeque<OwnedFd>,
    connect_cb: Option<ConnectCb>,
    alloc_cb: Option<AllocCb>,
    read_cb: Option<ReadCb>,
    write_queue: VecDeque<WriteReq>,
    write_queue_size: usize,
    shutdown_cb: Option<ShutdownCb>,
    /// Requests that completed but whose callbacks still wait for the completion phase.
    finished: VecDeque<(FinishedReq, Result<()>)>,
    /// Descriptors received over an IPC pipe, waiting for the user to collect them.
    pending_fds: VecDeque<OwnedFd>,
}

impl StreamImp {
    fn new() -> Self {
        StreamImp {
            io: None,
            watcher: None,
            connection_cb: None,
            accept_queue: VecDeque::new(),
            connect_cb: None,
            alloc_cb: None,
            read_cb: None,
            write_queue: VecDeque::new(),
            write_queue_size: 0,
            shutdown_cb: None,
            finished: VecDeque::new(),
            pending_fds: VecDeque::new(),
        }
    }

    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.io.as_ref().map(|fd| fd.as_raw_fd())
    }
}

fn stream_mut(lp: &mut Loop, h: Handle) -> &mut StreamImp {
    match &mut lp.handles[h.id].imp {
        HandleImp::Stream(s) => s,
        _ => unreachable!(),
    }
}

fn stream_ref(lp: &Loop, h: Handle) -> &StreamImp {
    match &lp.handles[h.id].imp {
        HandleImp::Stream(s) => s,
        _ => unreachable!(),
    }
}

fn checked_stream(lp: &Loop, h: Handle) -> &StreamImp {
    assert!(
        lp.handles.valid_gen(h.id, h.generation),
        "operation on a dead handle"
    );
    let slot = &lp.handles[h.id];
    assert!(
        matches!(slot.kind, HandleKind::Tcp | HandleKind::NamedPipe),
        "operation on a {:?} handle",
        slot.kind
    );
    match &slot.imp {
        HandleImp::Stream(s) => s,
        _ => unreachable!(),
    }
}

/// What the poller should currently watch for this stream.
fn desired_interest(lp: &Loop, h: Handle) -> InterestMask {
    let flags = lp.handles[h.id].flags;
    let imp = stream_ref(lp, h);
    let mut mask = InterestMask::NONE;
    if flags & (READING | LISTENING) != 0 {
        mask = mask.union(InterestMask::READ);
    }
    if imp.connect_cb.is_some() || !imp.write_queue.is_empty() {
        mask = mask.union(InterestMask::WRITE);
    }
    mask
}

fn sync_poller(lp: &mut Loop, h: Handle) {
    let mask = desired_interest(lp, h);
    let watcher = stream_ref(lp, h).watcher;
    if let Some(id) = watcher {
        lp.poller.update(id, mask);
    }
}

/// Recompute whether the stream is doing something the loop must wait for.
fn sync_active(lp: &mut Loop, h: Handle) {
    let flags = lp.handles[h.id].flags;
    let imp = stream_ref(lp, h);
    let busy = flags & (READING | LISTENING) != 0
        || imp.connect_cb.is_some()
        || !imp.write_queue.is_empty()
        || !imp.finished.is_empty()
        || (flags & SHUTTING != 0 && flags & SHUT == 0);
    if busy {
        lp.handle_start(h);
    } else {
        lp.handle_stop(h);
    }
}

/// Give the stream its descriptor and hook it into the poller.
fn open_fd(lp: &mut Loop, h: Handle, fd: OwnedFd, flags: u32) -> Result<()> {
    let raw = fd.as_raw_fd();
    let watcher = lp.poller.add(raw, h, InterestMask::NONE)?;
    let imp = stream_mut(lp, h);
    assert!(imp.io.is_none(), "stream already has a descriptor");
    imp.io = Some(fd);
    imp.watcher = Some(watcher);
    lp.handles[h.id].flags |= flags;
    Ok(())
}

impl Loop {
    /// Create a TCP stream handle.
    pub fn tcp_init(&mut self) -> Result<Handle> {
        Ok(self.handle_init(HandleKind::Tcp, HandleImp::Stream(StreamImp::new())))
    }

    /// Create a named-pipe handle. In IPC mode the pipe can carry descriptors between
    /// processes next to its bytes.
    pub fn pipe_init(&mut self, ipc: bool) -> Result<Handle> {
        let h = self.handle_init(HandleKind::NamedPipe, HandleImp::Stream(StreamImp::new()));
        if ipc {
            self.handles[h.id].flags |= IPC;
        }
        Ok(h)
    }

    /// Adopt an existing descriptor into a pipe handle. The descriptor is switched to
    /// nonblocking mode.
    pub fn pipe_open(&mut self, h: Handle, fd: OwnedFd) -> Result<()> {
        self.checked_slot(h, HandleKind::NamedPipe);
        if self.handles[h.id].flags & CLOSING != 0 {
            return Err(Error::Inval);
        }
        sys::set_nonblocking(fd.as_raw_fd())?;
        open_fd(self, h, fd, READABLE | WRITABLE | CONNECTION)
    }

    /// Bind a TCP handle to an address. Sets `SO_REUSEADDR` the way servers expect.
    pub fn tcp_bind(&mut self, h: Handle, addr: SocketAddr) -> Result<()> {
        self.checked_slot(h, HandleKind::Tcp);
        if self.handles[h.id].flags & (CLOSING | BOUND) != 0 {
            return Err(Error::Inval);
        }
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        if stream_ref(self, h).io.is_none() {
            let fd = sys::socket_stream(family)?;
            open_fd(self, h, fd, 0)?;
        }
        let fd = stream_ref(self, h).fd().unwrap();
        sys::set_reuseaddr(fd)?;
        sys::bind_inet(fd, &addr)?;
        self.handles[h.id].flags |= BOUND;
        Ok(())
    }

    /// Bind a pipe handle to a filesystem path.
    pub fn pipe_bind(&mut self, h: Handle, path: &Path) -> Result<()> {
        self.checked_slot(h, HandleKind::NamedPipe);
        if self.handles[h.id].flags & (CLOSING | BOUND) != 0 {
            return Err(Error::Inval);
        }
        if stream_ref(self, h).io.is_none() {
            let fd = sys::socket_stream(libc::AF_UNIX)?;
            open_fd(self, h, fd, 0)?;
        }
        let fd = stream_ref(self, h).fd().unwrap();
        sys::bind_unix(fd, path)?;
        self.handles[h.id].flags |= BOUND;
        Ok(())
    }

    /// The locally bound address of a TCP handle.
    pub fn tcp_getsockname(&self, h: Handle) -> Result<SocketAddr> {
        let imp = checked_stream(self, h);
        match imp.fd() {
            Some(fd) => sys::local_addr(fd),
            None => Err(Error::Badf),
        }
    }

    /// Enable or disable Nagle's algorithm.
    pub fn tcp_nodelay(&mut self, h: Handle, enable: bool) -> Result<()> {
        self.checked_slot(h, HandleKind::Tcp);
        match stream_ref(self, h).fd() {
            Some(fd) => sys::set_nodelay(fd, enable),
            None => Err(Error::Badf),
        }
    }

    /// Enable or disable TCP keep-alive probing.
    pub fn tcp_keepalive(&mut self, h: Handle, enable: bool, delay_secs: u32) -> Result<()> {
        self.checked_slot(h, HandleKind::Tcp);
        match stream_ref(self, h).fd() {
            Some(fd) => sys::set_keepalive(fd, enable, delay_secs),
            None => Err(Error::Badf),
        }
    }

    /// Start accepting connections. The callback fires once per connection ready to be adopted
    /// with [accept](#method.accept).
    pub fn listen<F>(&mut self, h: Handle, backlog: i32, cb: F) -> Result<()>
    where
        F: FnMut(&mut Scope, Result<()>) + 'static,
    {
        checked_stream(self, h);
        let flags = self.handles[h.id].flags;
        if flags & CLOSING != 0 || flags & BOUND == 0 {
            return Err(Error::Inval);
        }
        let fd = stream_ref(self, h).fd().ok_or(Error::Badf)?;
        sys::listen(fd, backlog.max(1))?;
        self.handles[h.id].flags |= LISTENING;
        stream_mut(self, h).connection_cb = Some(Box::new(cb));
        sync_poller(self, h);
        sync_active(self, h);
        Ok(())
    }

    /// Adopt one pending connection from a listening stream into a fresh handle of the same
    /// kind. Reports `Again` when nothing is waiting.
    pub fn accept(&mut self, server: Handle, client: Handle) -> Result<()> {
        checked_stream(self, server);
        checked_stream(self, client);
        let conn = match stream_mut(self, server).accept_queue.pop_front() {
            Some(fd) => fd,
            None => return Err(Error::Again),
        };
        open_fd(self, client, conn, READABLE | WRITABLE | CONNECTION)
    }

    /// Connect a TCP handle. The callback fires with the outcome; on success the stream is
    /// readable and writable.
    pub fn tcp_connect<F>(&mut self, h: Handle, addr: SocketAddr, cb: F) -> Result<RequestId>
    where
        F: FnOnce(&mut Scope, Result<()>) + 'static,
    {
        self.checked_slot(h, HandleKind::Tcp);
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        self.stream_connect(h, family, cb, |fd| sys::connect_inet(fd, &addr))
    }

    /// Connect a pipe handle to a bound path.
    pub fn pipe_connect<F>(&mut self, h: Handle, path: &Path, cb: F) -> Result<RequestId>
    where
        F: FnOnce(&mut Scope, Result<()>) + 'static,
    {
        self.checked_slot(h, HandleKind::NamedPipe);
        let path = path.to_path_buf();
        self.stream_connect(h, libc::AF_UNIX, cb, move |fd| sys::connect_unix(fd, &path))
    }

    fn stream_connect<F, C>(&mut self, h: Handle, family: libc::c_int, cb: F, connect: C) -> Result<RequestId>
    where
        F: FnOnce(&mut Scope, Result<()>) + 'static,
        C: FnOnce(RawFd) -> Result<bool>,
    {
        let flags = self.handles[h.id].flags;
        if flags & CLOSING != 0 || flags & (CONNECTION | LISTENING) != 0 {
            return Err(Error::Inval);
        }
        if stream_ref(self, h).connect_cb.is_some() {
            return Err(Error::Busy);
        }
        if stream_ref(self, h).io.is_none() {
            let fd = sys::socket_stream(family)?;
            open_fd(self, h, fd, 0)?;
        }
        let fd = stream_ref(self, h).fd().unwrap();
        let established = connect(fd)?;
        let id = self.next_request_id();
        stream_mut(self, h).connect_cb = Some(Box::new(cb));
        self.active_reqs += 1;
        if established {
            // Completed synchronously; deliver through the ordinary completion phase anyway so
            // callback ordering stays uniform.
            self.pending.push_back(Completion::Io {
                handle: h,
                readable: false,
                writable: true,
                hangup: false,
            });
        }
        sync_poller(self, h);
        sync_active(self, h);
        Ok(RequestId(id))
    }

    /// Arm reading. `alloc` supplies each buffer just before the data is pulled, `read` gets the
    /// outcome. After `Err(Eof)` or another error nothing more is delivered until `read_start`
    /// is called again.
    pub fn read_start<A, R>(&mut self, h: Handle, alloc: A, read: R) -> Result<()>
    where
        A: FnMut(&mut Scope, usize) -> Vec<u8> + 'static,
        R: FnMut(&mut Scope, Result<usize>, Vec<u8>) + 'static,
    {
        checked_stream(self, h);
        let flags = self.handles[h.id].flags;
        if flags & CLOSING != 0 {
            return Err(Error::Inval);
        }
        if flags & READABLE == 0 {
            return Err(Error::NotConn);
        }
        let imp = stream_mut(self, h);
        imp.alloc_cb = Some(Box::new(alloc));
        imp.read_cb = Some(Box::new(read));
        self.handles[h.id].flags |= READING;
        self.handles[h.id].flags &= !READ_EOF;
        sync_poller(self, h);
        sync_active(self, h);
        // Data may already be waiting; probe instead of hoping for an edge.
        self.pending.push_back(Completion::Io {
            handle: h,
            readable: true,
            writable: false,
            hangup: false,
        });
        Ok(())
    }

    /// Disarm reading. Idempotent; queued but undelivered data stays in the socket.
    pub fn read_stop(&mut self, h: Handle) {
        checked_stream(self, h);
        self.handles[h.id].flags &= !READING;
        sync_poller(self, h);
        sync_active(self, h);
    }

    /// Queue a write of the given buffers. The callback fires once the whole request is on the
    /// wire or the stream failed; callbacks fire in submission order.
    pub fn write<F>(&mut self, h: Handle, bufs: Vec<Vec<u8>>, cb: F) -> Result<RequestId>
    where
        F: FnOnce(&mut Scope, Result<()>) + 'static,
    {
        self.write_maybe_fd(h, bufs, None, cb)
    }

    /// Like [write](#method.write), but additionally passes a descriptor over an IPC pipe.
    pub fn pipe_write_fd<F>(
        &mut self,
        h: Handle,
        bufs: Vec<Vec<u8>>,
        fd: OwnedFd,
        cb: F,
    ) -> Result<RequestId>
    where
        F: FnOnce(&mut Scope, Result<()>) + 'static,
    {
        self.checked_slot(h, HandleKind::NamedPipe);
        if self.handles[h.id].flags & IPC == 0 {
            return Err(Error::Notsup);
        }
        self.write_maybe_fd(h, bufs, Some(fd), cb)
    }

    fn write_maybe_fd<F>(
        &mut self,
        h: Handle,
        bufs: Vec<Vec<u8>>,
        send_fd: Option<OwnedFd>,
        cb: F,
    ) -> Result<RequestId>
    where
        F: FnOnce(&mut Scope, Result<()>) + 'static,
    {
        checked_stream(self, h);
        let flags = self.handles[h.id].flags;
        if flags & CLOSING != 0 {
            return Err(Error::Inval);
        }
        if flags & SHUTTING != 0 {
            return Err(Error::Shutdown);
        }
        if flags & WRITABLE == 0 {
            return Err(Error::Pipe);
        }
        if bufs.iter().all(|b| b.is_empty()) && send_fd.is_none() {
            return Err(Error::Inval);
        }
        let id = self.next_request_id();
        let size: usize = bufs.iter().map(|b| b.len()).sum();
        let imp = stream_mut(self, h);
        let was_empty = imp.write_queue.is_empty();
        imp.write_queue.push_back(WriteReq {
            bufs,
            buf_idx: 0,
            offset: 0,
            send_fd,
            cb: Box::new(cb),
        });
        imp.write_queue_size += size;
        self.active_reqs += 1;
        if was_empty {
            // No order to preserve, try the kernel right away
            flush_writes(self, h);
            if !stream_ref(self, h).finished.is_empty() {
                self.pending.push_back(Completion::Io {
                    handle: h,
                    readable: false,
                    writable: true,
                    hangup: false,
                });
            }
        }
        sync_poller(self, h);
        sync_active(self, h);
        Ok(RequestId(id))
    }

    /// Bytes queued for writing but not yet accepted by the kernel. The backpressure signal.
    pub fn write_queue_size(&self, h: Handle) -> usize {
        checked_stream(self, h).write_queue_size
    }

    /// How many descriptors arrived over this IPC pipe and wait to be collected.
    pub fn pipe_pending_count(&self, h: Handle) -> usize {
        checked_stream(self, h).pending_fds.len()
    }

    /// Collect one received descriptor.
    pub fn pipe_recv_fd(&mut self, h: Handle) -> Result<OwnedFd> {
        self.checked_slot(h, HandleKind::NamedPipe);
        stream_mut(self, h).pending_fds.pop_front().ok_or(Error::Again)
    }

    /// Send FIN once the write queue drains. Reads may still deliver data and the final `Eof`.
    pub fn shutdown<F>(&mut self, h: Handle, cb: F) -> Result<RequestId>
    where
        F: FnOnce(&mut Scope, Result<()>) + 'static,
    {
        checked_stream(self, h);
        let flags = self.handles[h.id].flags;
        if flags & CLOSING != 0 || flags & WRITABLE == 0 {
            return Err(Error::NotConn);
        }
        if flags & (SHUTTING | SHUT) != 0 {
            return Err(Error::Shutdown);
        }
        let id = self.next_request_id();
        self.handles[h.id].flags |= SHUTTING;
        stream_mut(self, h).shutdown_cb = Some(Box::new(cb));
        self.active_reqs += 1;
        if stream_ref(self, h).write_queue.is_empty() {
            perform_shutdown(self, h);
            self.pending.push_back(Completion::Io {
                handle: h,
                readable: false,
                writable: true,
                hangup: false,
            });
        }
        sync_active(self, h);
        Ok(RequestId(id))
    }
}

fn perform_shutdown(lp: &mut Loop, h: Handle) {
    let fd = stream_ref(lp, h).fd();
    let status = match fd {
        Some(fd) => sys::shutdown_write(fd),
        None => Err(Error::Badf),
    };
    lp.handles[h.id].flags |= SHUT;
    let imp = stream_mut(lp, h);
    if let Some(cb) = imp.shutdown_cb.take() {
        imp.finished.push_back((FinishedReq::Shutdown(cb), status));
    }
}

/// Push queued writes into the kernel until it refuses or the queue empties.
fn flush_writes(lp: &mut Loop, h: Handle) {
    loop {
        let fd = match stream_ref(lp, h).fd() {
            Some(fd) => fd,
            None => return,
        };
        let imp = stream_mut(lp, h);
        let req = match imp.write_queue.front_mut() {
            Some(req) => req,
            None => break,
        };

        let outcome = if let Some(pass) = req.send_fd.as_ref() {
            // The descriptor travels with the first chunk of payload
            let chunk: &[u8] = req
                .bufs
                .get(req.buf_idx)
                .map(|b| &b[req.offset..])
                .unwrap_or(&[]);
            let chunk = if chunk.is_empty() { &b"\0"[..] } else { chunk };
            sys::send_with_fd(fd, chunk, Some(pass.as_raw_fd()))
        } else {
            let mut slices: Vec<IoSlice> = Vec::with_capacity(req.bufs.len() - req.buf_idx);
            for (i, buf) in req.bufs.iter().enumerate().skip(req.buf_idx) {
                let start = if i == req.buf_idx { req.offset } else { 0 };
                if start < buf.len() {
                    slices.push(IoSlice::new(&buf[start..]));
                }
            }
            if slices.is_empty() {
                Ok(0)
            } else {
                sys::writev(fd, &slices)
            }
        };

        match outcome {
            Ok(n) => {
                req.send_fd = None;
                let done = req.advance(n) || req.remaining() == 0;
                imp.write_queue_size -= n.min(imp.write_queue_size);
                if done {
                    let req = imp.write_queue.pop_front().unwrap();
                    imp.finished.push_back((FinishedReq::Write(req.cb), Ok(())));
                }
            },
            Err(Error::Again) => break,
            Err(e) => {
                // A failed stream fails every queued request, in order
                imp.write_queue_size = 0;
                while let Some(req) = imp.write_queue.pop_front() {
                    imp.finished.push_back((FinishedReq::Write(req.cb), Err(e)));
                }
                break;
            },
        }
    }

    // FIN waits for the queue to drain completely
    let flags = lp.handles[h.id].flags;
    if flags & SHUTTING != 0 && flags & SHUT == 0 && stream_ref(lp, h).write_queue.is_empty() {
        perform_shutdown(lp, h);
    }
}

/// Fire the callbacks of everything that finished, first in first out.
fn dispatch_finished(lp: &mut Loop, h: Handle) {
    loop {
        if !lp.handles.valid_gen(h.id, h.generation) {
            return;
        }
        let entry = stream_mut(lp, h).finished.pop_front();
        let (req, status) = match entry {
            Some(e) => e,
            None => break,
        };
        lp.active_reqs -= 1;
        let mut scope = Scope {
            lp: &mut *lp,
            handle: h,
        };
        match req {
            FinishedReq::Write(cb) => cb(&mut scope, status),
            FinishedReq::Shutdown(cb) => cb(&mut scope, status),
            FinishedReq::Connect(cb) => cb(&mut scope, status),
        }
    }
    if lp.handles.valid_gen(h.id, h.generation) {
        sync_active(lp, h);
    }
}

fn finish_connect(lp: &mut Loop, h: Handle) {
    let fd = stream_ref(lp, h).fd().unwrap();
    let status = sys::take_socket_error(fd);
    if status.is_ok() {
        lp.handles[h.id].flags |= READABLE | WRITABLE | CONNECTION;
    }
    let imp = stream_mut(lp, h);
    if let Some(cb) = imp.connect_cb.take() {
        imp.finished.push_back((FinishedReq::Connect(cb), status));
    }
    sync_poller(lp, h);
}

fn accept_incoming(lp: &mut Loop, h: Handle) {
    loop {
        let fd = match stream_ref(lp, h).fd() {
            Some(fd) => fd,
            None => return,
        };
        match sys::accept(fd) {
            Ok(conn) => {
                stream_mut(lp, h).accept_queue.push_back(conn);
                invoke_connection_cb(lp, h, Ok(()));
                if !lp.handles.valid_gen(h.id, h.generation)
                    || lp.handles[h.id].flags & LISTENING == 0
                {
                    return;
                }
            },
            Err(Error::Again) => return,
            Err(e) => {
                invoke_connection_cb(lp, h, Err(e));
                return;
            },
        }
    }
}

fn invoke_connection_cb(lp: &mut Loop, h: Handle, status: Result<()>) {
    let cb = stream_mut(lp, h).connection_cb.take();
    if let Some(mut cb) = cb {
        {
            let mut scope = Scope {
                lp: &mut *lp,
                handle: h,
            };
            cb(&mut scope, status);
        }
        if lp.handles.valid_gen(h.id, h.generation) {
            let imp = stream_mut(lp, h);
            if imp.connection_cb.is_none() {
                imp.connection_cb = Some(cb);
            }
        }
    }
}

/// The read pump: alloc, pull, deliver, until the kernel runs dry or the user stops us.
fn pump_reads(lp: &mut Loop, h: Handle) {
    let ipc = lp.handles[h.id].flags & IPC != 0;
    loop {
        if !lp.handles.valid_gen(h.id, h.generation) {
            return;
        }
        let flags = lp.handles[h.id].flags;
        if flags & READING == 0 || flags & CLOSING != 0 {
            return;
        }
        let (alloc, read_cb) = {
            let imp = stream_mut(lp, h);
            (imp.alloc_cb.take(), imp.read_cb.take())
        };
        let (mut alloc, mut read_cb) = match (alloc, read_cb) {
            (Some(a), Some(r)) => (a, r),
            _ => return, // Another callback down the stack still owns them
        };

        let mut buf = {
            let mut scope = Scope {
                lp: &mut *lp,
                handle: h,
            };
            alloc(&mut scope, READ_CHUNK)
        };

        let mut deliver = |lp: &mut Loop, result: Result<usize>, buf: Vec<u8>| {
            let mut scope = Scope {
                lp: &mut *lp,
                handle: h,
            };
            read_cb(&mut scope, result, buf);
        };

        let mut stop = true;
        if !lp.handles.valid_gen(h.id, h.generation) {
            return;
        } else if buf.is_empty() {
            lp.handles[h.id].flags &= !READING;
            deliver(lp, Err(Error::Nomem), buf);
        } else {
            let fd = stream_ref(lp, h).fd();
            let outcome = match fd {
                Some(fd) if ipc => {
                    let mut fds = Vec::new();
                    let r = sys::recv_with_fds(fd, &mut buf, &mut fds);
                    if !fds.is_empty() {
                        stream_mut(lp, h).pending_fds.extend(fds);
                    }
                    r
                },
                Some(fd) => sys::read(fd, &mut buf),
                None => Err(Error::Badf),
            };
            match outcome {
                Ok(0) => {
                    // End of stream; no more callbacks until read_start is called again
                    lp.handles[h.id].flags |= READ_EOF;
                    lp.handles[h.id].flags &= !READING;
                    buf.truncate(0);
                    deliver(lp, Err(Error::Eof), buf);
                },
                Ok(n) => {
                    buf.truncate(n);
                    deliver(lp, Ok(n), buf);
                    stop = false;
                },
                Err(Error::Again) => {
                    buf.truncate(0);
                    deliver(lp, Ok(0), buf);
                },
                Err(e) => {
                    lp.handles[h.id].flags &= !READING;
                    buf.truncate(0);
                    deliver(lp, Err(e), buf);
                },
            }
        }

        // Hand the callbacks back unless the user re-armed with new ones meanwhile
        if lp.handles.valid_gen(h.id, h.generation) {
            let imp = stream_mut(lp, h);
            if imp.alloc_cb.is_none() {
                imp.alloc_cb = Some(alloc);
            }
            if imp.read_cb.is_none() {
                imp.read_cb = Some(read_cb);
            }
            if stop {
                sync_poller(lp, h);
                sync_active(lp, h);
                return;
            }
        } else {
            return;
        }
    }
}

/// One readiness report for this stream, dispatched from the completion phase.
pub(crate) fn process_io(lp: &mut Loop, h: Handle, readable: bool, writable: bool, _hangup: bool) {
    trace!("stream {:?} io: r={} w={}", h, readable, writable);
    if writable || readable {
        if stream_ref(lp, h).connect_cb.is_some() {
            finish_connect(lp, h);
        }
    }
    if writable && lp.handles.valid_gen(h.id, h.generation) {
        flush_writes(lp, h);
    }
    if lp.handles.valid_gen(h.id, h.generation) {
        dispatch_finished(lp, h);
    }
    if readable && lp.handles.valid_gen(h.id, h.generation) {
        if lp.handles[h.id].flags & LISTENING != 0 {
            accept_incoming(lp, h);
        } else if lp.handles[h.id].flags & READING != 0 {
            pump_reads(lp, h);
        }
    }
    if lp.handles.valid_gen(h.id, h.generation) && lp.handles[h.id].flags & CLOSING == 0 {
        sync_poller(lp, h);
        sync_active(lp, h);
    }
}

/// Close-time teardown: cancel outstanding requests without firing their callbacks, drop the
/// descriptor, finalize in the endgame.
pub(crate) fn close(lp: &mut Loop, h: Handle) {
    let watcher = stream_mut(lp, h).watcher.take();
    if let Some(id) = watcher {
        lp.poller.remove(id);
    }
    let imp = stream_mut(lp, h);
    let mut canceled = 0u32;
    if imp.connect_cb.take().is_some() {
        canceled += 1;
    }
    canceled += imp.write_queue.len() as u32;
    imp.write_queue.clear();
    imp.write_queue_size = 0;
    canceled += imp.finished.len() as u32;
    imp.finished.clear();
    if imp.shutdown_cb.take().is_some() {
        canceled += 1;
    }
    imp.accept_queue.clear();
    imp.pending_fds.clear();
    imp.alloc_cb = None;
    imp.read_cb = None;
    imp.connection_cb = None;
    imp.io = None; // Drops, closing the descriptor
    lp.active_reqs -= canceled;
    lp.handles[h.id].flags &= !(READING | LISTENING | SHUTTING);
    lp.handle_stop(h);
    lp.mark_closing(h);
    lp.want_endgame(h);
}
