use std::collections::{HashMap, VecDeque};
use std::mem;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use linked_hash_map::LinkedHashMap;
use log::{debug, trace};
use mio::Waker;
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use threadpool::ThreadPool;

use crate::error::{Error, Result};
use crate::fs_event::FsEventImp;
use crate::heap::{TimerEntry, TimerHeap};
use crate::poll::PollImp;
use crate::poller::{IoEvent, Poller};
use crate::process::{ChildExit, ProcessImp};
use crate::recycler::Recycler;
use crate::registry;
use crate::stream::StreamImp;
use crate::{Handle, HandleKind, RequestId};

/// How long a call to [run](struct.Loop.html#method.run) keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep iterating while the loop is alive or until somebody calls `stop`.
    Default,
    /// One full iteration; block in the poller at most once.
    Once,
    /// One full iteration without blocking, regardless of handle state.
    NoWait,
}

// Handle flag bits. The first group is shared by every kind, the rest belong to streams and
// poll handles.
pub(crate) const CLOSING: u32 = 0x0000_0001;
pub(crate) const CLOSED: u32 = 0x0000_0002;
pub(crate) const ACTIVE: u32 = 0x0000_0004;
pub(crate) const HAS_REF: u32 = 0x0000_0008;
pub(crate) const INTERNAL: u32 = 0x0000_0010;
pub(crate) const ENDGAME_QUEUED: u32 = 0x0000_0020;
pub(crate) const LISTENING: u32 = 0x0000_0040;
pub(crate) const CONNECTION: u32 = 0x0000_0080;
pub(crate) const SHUTTING: u32 = 0x0000_0100;
pub(crate) const SHUT: u32 = 0x0000_0200;
pub(crate) const READ_EOF: u32 = 0x0000_0400;
pub(crate) const READING: u32 = 0x0000_0800;
pub(crate) const BOUND: u32 = 0x0000_1000;
pub(crate) const READABLE: u32 = 0x0000_2000;
pub(crate) const WRITABLE: u32 = 0x0000_4000;
pub(crate) const IPC: u32 = 0x0000_8000;
pub(crate) const POLL_SLOW: u32 = 0x0001_0000;

/// Callback invoked when a handle finished closing.
pub type CloseCb = Box<dyn FnMut(&mut Scope)>;
/// Callback of a fired timer.
pub type TimerCb = Box<dyn FnMut(&mut Scope)>;
/// Callback of an idle, prepare or check hook.
pub type HookCb = Box<dyn FnMut(&mut Scope)>;
/// Callback of an async handle; runs on the loop thread, possibly coalescing several sends.
pub type AsyncCb = Box<dyn FnMut(&mut Scope)>;
/// Callback of a signal handle.
pub type SignalCb = Box<dyn FnMut(&mut Scope, Signal)>;

pub(crate) struct TimerImp {
    pub(crate) repeat: Duration,
    pub(crate) cb: Option<TimerCb>,
}

pub(crate) struct HookImp {
    pub(crate) cb: Option<HookCb>,
}

pub(crate) struct AsyncImp {
    pub(crate) cb: Option<AsyncCb>,
    pub(crate) shared: Arc<AsyncShared>,
}

pub(crate) struct SignalImp {
    pub(crate) signum: Option<Signal>,
    pub(crate) cb: Option<SignalCb>,
}

/// Per-kind payload of a handle slot.
pub(crate) enum HandleImp {
    Timer(TimerImp),
    Hook(HookImp),
    Async(AsyncImp),
    Signal(SignalImp),
    Stream(StreamImp),
    Poll(PollImp),
    Process(ProcessImp),
    FsEvent(FsEventImp),
}

pub(crate) struct HandleSlot {
    pub(crate) kind: HandleKind,
    pub(crate) flags: u32,
    pub(crate) close_cb: Option<CloseCb>,
    pub(crate) imp: HandleImp,
}

/// One entry of the pending-completion queue. Everything the poller, the signal descriptor, the
/// reaper and the worker pool produce funnels through here and is dispatched, first in first
/// delivered, in the completion phase of the iteration.
pub(crate) enum Completion {
    Io {
        handle: Handle,
        readable: bool,
        writable: bool,
        hangup: bool,
    },
    Async(Handle),
    Signal {
        handle: Handle,
        signal: Signal,
    },
    ProcessExit {
        handle: Handle,
        exit: ChildExit,
    },
    PollResult {
        handle: Handle,
        slot: usize,
        result: Result<u8>,
    },
}

const ASYNC_LIVE: u8 = 0;
const ASYNC_HANDLE_CLOSED: u8 = 1;
const ASYNC_LOOP_GONE: u8 = 2;

pub(crate) struct AsyncShared {
    pending: AtomicBool,
    state: AtomicU8,
    waker: Arc<Waker>,
}

/// A thread-safe way to fire an async handle.
///
/// This is the only object in the library that may leave the loop thread (apart from work
/// submitted to the pool). Multiple sends coalesce: the handle's callback runs at least once
/// after the last send, and at most once per send.
///
/// # Examples
///
/// ```no_run
/// use zmij::{Loop, RunMode};
///
/// let mut lp = Loop::new().unwrap();
/// let async_h = lp
///     .async_init(|scope| {
///         let h = scope.current();
///         scope.close(h, None);
///     })
///     .unwrap();
/// let sender = lp.async_sender(async_h).unwrap();
/// std::thread::spawn(move || {
///     sender.send().unwrap();
/// });
/// lp.run(RunMode::Default);
/// ```
#[derive(Clone)]
pub struct AsyncSender {
    shared: Arc<AsyncShared>,
}

impl AsyncSender {
    /// Wake the loop and schedule the async handle's callback.
    pub fn send(&self) -> Result<()> {
        match self.shared.state.load(Ordering::Acquire) {
            ASYNC_LIVE => (),
            ASYNC_HANDLE_CLOSED => return Err(Error::Missing),
            _ => return Err(Error::LoopGone),
        }
        if !self.shared.pending.swap(true, Ordering::AcqRel) {
            self.shared.waker.wake().map_err(|_| Error::LoopGone)?;
        }
        Ok(())
    }
}

const WORK_QUEUED: u8 = 0;
const WORK_RUNNING: u8 = 1;
const WORK_DONE: u8 = 2;
const WORK_CANCELED: u8 = 3;

/// What happens on the loop thread once a work item is done.
pub(crate) enum AfterWork {
    User(Box<dyn FnOnce(&mut Scope, Result<()>)>),
    SlowPoll { handle: Handle, slot: usize },
}

pub(crate) type DoneQueue = Arc<Mutex<VecDeque<(u64, Result<u8>)>>>;

/// Posts the outcome of a work item back to the loop, even when the work panics.
pub(crate) struct DoneGuard {
    id: u64,
    queue: DoneQueue,
    sender: AsyncSender,
    posted: bool,
}

impl DoneGuard {
    pub(crate) fn new(id: u64, queue: DoneQueue, sender: AsyncSender) -> Self {
        DoneGuard {
            id,
            queue,
            sender,
            posted: false,
        }
    }

    pub(crate) fn post(&mut self, outcome: Result<u8>) {
        self.posted = true;
        self.queue.lock().unwrap().push_back((self.id, outcome));
        let _ = self.sender.send();
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if !self.posted {
            // The work panicked before producing a result; the requestor still gets an answer.
            self.queue
                .lock()
                .unwrap()
                .push_back((self.id, Err(Error::BackgroundPanicked)));
            let _ = self.sender.send();
        }
    }
}

lazy_static! {
    /// Threads available to `queue_work` unless configured explicitly, from the environment.
    static ref DEFAULT_POOL_SIZE: usize = std::env::var("ZMIJ_THREADPOOL_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .map(|n| n.clamp(1, 128))
        .unwrap_or(4);
}

/// The event loop itself.
///
/// One loop owns all its handles; user code refers to them through [Handle](struct.Handle.html)
/// tokens and drives everything through methods of this type. Callbacks receive a
/// [Scope](struct.Scope.html), which dereferences to the loop, so the whole API stays available
/// from inside a callback, including closing the very handle that is being called.
pub struct Loop {
    pub(crate) poller: Poller,
    pub(crate) handles: Recycler<HandleSlot>,
    /// Cached monotonic time, refreshed once per phase border rather than per call.
    now: Instant,
    pub(crate) active_handles: u32,
    pub(crate) active_reqs: u32,
    stop_flag: bool,
    timer_heap: TimerHeap,
    timer_counter: u64,
    pub(crate) pending: VecDeque<Completion>,
    endgame: VecDeque<Handle>,
    idle_handles: LinkedHashMap<Handle, ()>,
    prepare_handles: LinkedHashMap<Handle, ()>,
    check_handles: LinkedHashMap<Handle, ()>,
    async_handles: LinkedHashMap<Handle, ()>,
    signal_recipients: HashMap<i32, LinkedHashMap<Handle, ()>>,
    signal_mask: SigSet,
    signal_fd: SignalFd,
    pub(crate) children: HashMap<libc::pid_t, Handle>,
    pool: Option<ThreadPool>,
    pool_size: usize,
    pub(crate) wq_done: DoneQueue,
    pub(crate) work_after: HashMap<u64, AfterWork>,
    work_states: HashMap<u64, Arc<AtomicU8>>,
    next_request: u64,
    wq_async: Handle,
    registry_id: u64,
}

impl Loop {
    /// Create a new loop.
    ///
    /// The loop is empty, holds no handles, but is otherwise ready: the poller exists, the
    /// signal descriptor is hooked up and the internal wakeup handle for the worker pool is in
    /// place (unreferenced, so an idle pool never keeps the loop running).
    pub fn new() -> Result<Self> {
        let mut poller = Poller::new()?;
        let signal_mask = SigSet::empty();
        let signal_fd = SignalFd::with_flags(&signal_mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
            .map_err(Error::from)?;
        poller.register_signal_fd(signal_fd.as_raw_fd())?;
        let registry_id = registry::register(poller.waker());

        let mut lp = Loop {
            poller,
            handles: Recycler::new(),
            now: Instant::now(),
            active_handles: 0,
            active_reqs: 0,
            stop_flag: false,
            timer_heap: TimerHeap::new(),
            timer_counter: 0,
            pending: VecDeque::new(),
            endgame: VecDeque::new(),
            idle_handles: LinkedHashMap::new(),
            prepare_handles: LinkedHashMap::new(),
            check_handles: LinkedHashMap::new(),
            async_handles: LinkedHashMap::new(),
            signal_recipients: HashMap::new(),
            signal_mask,
            signal_fd,
            children: HashMap::new(),
            pool: None,
            pool_size: *DEFAULT_POOL_SIZE,
            wq_done: Arc::new(Mutex::new(VecDeque::new())),
            work_after: HashMap::new(),
            work_states: HashMap::new(),
            next_request: 0,
            wq_async: Handle {
                id: usize::MAX,
                generation: u64::MAX,
            },
            registry_id,
        };

        // The worker pool reports back through an ordinary async handle that never keeps the
        // loop alive on its own.
        let wq_async = lp.async_init(|scope| scope.lp.drain_work())?;
        lp.handles[wq_async.id].flags |= INTERNAL;
        lp.unref_handle(wq_async);
        lp.wq_async = wq_async;
        Ok(lp)
    }

    // ---- time ----

    /// The cached monotonic time of the current iteration.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Refresh the cached time immediately.
    pub fn update_time(&mut self) {
        self.now = Instant::now();
    }

    // ---- liveness ----

    /// Does the loop still have anything to wait for?
    pub fn alive(&self) -> bool {
        self.active_handles > 0 || self.active_reqs > 0 || !self.endgame.is_empty()
    }

    /// How many handles live in the loop, internal ones included.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Visit every handle currently known to the loop.
    pub fn walk<F: FnMut(Handle, HandleKind)>(&self, mut f: F) {
        for (idx, slot) in self.handles.iter() {
            let handle = Handle {
                id: idx,
                generation: self.handles.generation(idx),
            };
            f(handle, slot.kind);
        }
    }

    /// How long the poller would be allowed to sleep if an iteration started now.
    pub fn backend_timeout(&self) -> Option<Duration> {
        if self.stop_flag {
            return Some(Duration::ZERO);
        }
        if self.active_handles == 0 && self.active_reqs == 0 {
            return Some(Duration::ZERO);
        }
        if !self.pending.is_empty() || !self.endgame.is_empty() || !self.idle_handles.is_empty() {
            return Some(Duration::ZERO);
        }
        match self.timer_heap.peek() {
            None => None,
            Some(entry) => Some(entry.when.saturating_duration_since(self.now)),
        }
    }

    /// Ask the loop to wind down. Consulted at the top of each iteration; the current callback
    /// finishes undisturbed.
    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    // ---- the iteration ----

    /// Run the loop.
    ///
    /// One iteration is strictly phased: refresh time, fire due timers, dispatch queued
    /// completions, run idle then prepare hooks, block in the poller, run check hooks, finalize
    /// closing handles. `Default` iterates while the loop is alive, `Once` makes a single pass
    /// (blocking at most once), `NoWait` makes a single pass without blocking at all.
    ///
    /// Returns whether the loop is still alive, i.e. whether another `run` would have work to
    /// wait for.
    pub fn run(&mut self, mode: RunMode) -> bool {
        let mut alive = self.alive();
        if !alive {
            self.update_time();
        }

        while alive && !self.stop_flag {
            self.update_time();
            self.run_timers();
            let ran_pending = self.run_pending();
            self.run_hooks(HandleKind::Idle);
            self.run_hooks(HandleKind::Prepare);

            let timeout = if (mode == RunMode::Once && !ran_pending) || mode == RunMode::Default {
                self.backend_timeout()
            } else {
                Some(Duration::ZERO)
            };
            self.poll_phase(timeout);

            self.run_hooks(HandleKind::Check);
            self.run_endgames();

            if mode == RunMode::Once {
                // A single pass promises forward progress: the poller may have slept through a
                // deadline, so give the timers one more chance before returning.
                self.run_timers();
            }

            alive = self.alive();
            if mode != RunMode::Default {
                break;
            }
        }

        if self.stop_flag {
            self.stop_flag = false;
        }
        alive
    }

    fn poll_phase(&mut self, timeout: Option<Duration>) {
        let mut sink = Vec::new();
        let outcome = self.poller.wait(timeout, &mut sink);
        self.update_time();
        for ev in sink {
            self.push_io_completion(ev);
        }
        if outcome.signal {
            self.drain_signals();
        }
        if outcome.woke {
            self.scan_asyncs();
        }
    }

    fn push_io_completion(&mut self, ev: IoEvent) {
        self.pending.push_back(Completion::Io {
            handle: ev.handle,
            readable: ev.readable,
            writable: ev.writable,
            hangup: ev.hangup,
        });
    }

    fn run_timers(&mut self) {
        // Timers started from inside a timer callback must wait for a later iteration, so the
        // due set is snapshotted first.
        let mut due = Vec::new();
        while let Some(entry) = self.timer_heap.peek() {
            if entry.when <= self.now {
                due.push(self.timer_heap.pop().unwrap());
            } else {
                break;
            }
        }
        for entry in due {
            let h = entry.handle;
            if !self.handles.valid_gen(h.id, h.generation) {
                continue;
            }
            self.handle_stop(h);
            let repeat = match &self.handles[h.id].imp {
                HandleImp::Timer(t) => t.repeat,
                _ => unreachable!(),
            };
            if repeat > Duration::ZERO {
                // Re-arm relative to the current time, not the previous deadline.
                self.timer_schedule(h, self.now + repeat);
            }
            self.invoke_timer_cb(h);
        }
    }

    fn run_pending(&mut self) -> bool {
        let batch = mem::take(&mut self.pending);
        let ran = !batch.is_empty();
        for completion in batch {
            self.dispatch_completion(completion);
        }
        ran
    }

    fn dispatch_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Io {
                handle,
                readable,
                writable,
                hangup,
            } => {
                if !self.handles.valid_gen(handle.id, handle.generation) {
                    return;
                }
                if self.handles[handle.id].flags & CLOSING != 0 {
                    return;
                }
                match self.handles[handle.id].kind {
                    HandleKind::Tcp | HandleKind::NamedPipe => {
                        crate::stream::process_io(self, handle, readable, writable, hangup)
                    },
                    HandleKind::Poll => crate::poll::process_io(self, handle, readable, writable, hangup),
                    HandleKind::FsEvent => crate::fs_event::process_io(self, handle),
                    _ => (),
                }
            },
            Completion::Async(handle) => {
                if !self.handles.valid_gen(handle.id, handle.generation) {
                    return;
                }
                if self.handles[handle.id].flags & CLOSING != 0 {
                    return;
                }
                self.invoke_async_cb(handle);
            },
            Completion::Signal { handle, signal } => {
                if !self.handles.valid_gen(handle.id, handle.generation) {
                    return;
                }
                if self.handles[handle.id].flags & CLOSING != 0 {
                    return;
                }
                self.invoke_signal_cb(handle, signal);
            },
            Completion::ProcessExit { handle, exit } => {
                if !self.handles.valid_gen(handle.id, handle.generation) {
                    return;
                }
                crate::process::process_exit(self, handle, exit);
            },
            Completion::PollResult { handle, slot, result } => {
                if !self.handles.valid_gen(handle.id, handle.generation) {
                    return;
                }
                crate::poll::process_poll_result(self, handle, slot, result);
            },
        }
    }

    fn run_hooks(&mut self, kind: HandleKind) {
        // Single pass over the hooks registered when the phase starts; hooks added from inside a
        // callback wait for the next iteration.
        let snapshot: Vec<Handle> = self.hook_list(kind).keys().cloned().collect();
        for h in snapshot {
            if !self.handles.valid_gen(h.id, h.generation) {
                continue;
            }
            if self.handles[h.id].flags & CLOSING != 0 {
                continue;
            }
            if !self.hook_list(kind).contains_key(&h) {
                continue; // Stopped by an earlier callback this same phase
            }
            self.invoke_hook_cb(h);
        }
    }

    fn run_endgames(&mut self) {
        while let Some(h) = self.endgame.pop_front() {
            assert!(self.handles.valid_gen(h.id, h.generation));
            let slot = &mut self.handles[h.id];
            assert!(slot.flags & CLOSING != 0);
            assert!(slot.flags & CLOSED == 0);
            slot.flags |= CLOSED;
            let cb = slot.close_cb.take();
            trace!("finalizing {:?} ({:?})", h, slot.kind);
            if let Some(mut cb) = cb {
                let mut scope = Scope { lp: &mut *self, handle: h };
                cb(&mut scope);
            }
            self.handles.release(h.id);
        }
    }

    // ---- handle basics ----

    pub(crate) fn handle_init(&mut self, kind: HandleKind, imp: HandleImp) -> Handle {
        let (id, generation) = self.handles.store(HandleSlot {
            kind,
            flags: HAS_REF,
            close_cb: None,
            imp,
        });
        trace!("init {:?} handle as {}", kind, id);
        Handle { id, generation }
    }

    pub(crate) fn checked_slot(&self, h: Handle, kind: HandleKind) -> &HandleSlot {
        assert!(
            self.handles.valid_gen(h.id, h.generation),
            "operation on a dead handle"
        );
        let slot = &self.handles[h.id];
        assert!(slot.kind == kind, "operation on a {:?} handle", slot.kind);
        slot
    }

    pub(crate) fn checked_slot_mut(&mut self, h: Handle, kind: HandleKind) -> &mut HandleSlot {
        assert!(
            self.handles.valid_gen(h.id, h.generation),
            "operation on a dead handle"
        );
        let slot = &mut self.handles[h.id];
        assert!(slot.kind == kind, "operation on a {:?} handle", slot.kind);
        slot
    }

    /// Does this token refer to a live handle of this loop?
    pub fn is_valid(&self, h: Handle) -> bool {
        self.handles.valid_gen(h.id, h.generation)
    }

    /// Is the handle doing something the loop needs to wait for?
    pub fn is_active(&self, h: Handle) -> bool {
        self.is_valid(h) && {
            let flags = self.handles[h.id].flags;
            flags & ACTIVE != 0 && flags & CLOSING == 0
        }
    }

    /// Has `close` been called on the handle (or has it finished closing entirely)?
    pub fn is_closing(&self, h: Handle) -> bool {
        if !self.is_valid(h) {
            return true;
        }
        self.handles[h.id].flags & (CLOSING | CLOSED) != 0
    }

    /// The kind of a live handle.
    pub fn kind_of(&self, h: Handle) -> Result<HandleKind> {
        if !self.is_valid(h) {
            return Err(Error::Missing);
        }
        Ok(self.handles[h.id].kind)
    }

    /// The descriptor behind a handle, for kinds that have one.
    pub fn handle_fd(&self, h: Handle) -> Result<RawFd> {
        if !self.is_valid(h) {
            return Err(Error::Badf);
        }
        let slot = &self.handles[h.id];
        if slot.flags & (CLOSING | CLOSED) != 0 {
            return Err(Error::Badf);
        }
        match &slot.imp {
            HandleImp::Stream(s) => s.fd().ok_or(Error::Badf),
            HandleImp::Poll(p) => Ok(p.fd()),
            HandleImp::FsEvent(f) => f.fd().ok_or(Error::Badf),
            _ => Err(Error::Inval),
        }
    }

    pub(crate) fn handle_start(&mut self, h: Handle) {
        let slot = &mut self.handles[h.id];
        if slot.flags & (ACTIVE | CLOSING) != 0 {
            return;
        }
        slot.flags |= ACTIVE;
        if slot.flags & HAS_REF != 0 {
            self.active_handles += 1;
        }
    }

    pub(crate) fn handle_stop(&mut self, h: Handle) {
        let slot = &mut self.handles[h.id];
        if slot.flags & ACTIVE == 0 {
            return;
        }
        slot.flags &= !ACTIVE;
        if slot.flags & HAS_REF != 0 {
            self.active_handles -= 1;
        }
    }

    /// Make the handle count towards loop liveness again (the default).
    pub fn ref_handle(&mut self, h: Handle) {
        assert!(self.is_valid(h), "operation on a dead handle");
        let slot = &mut self.handles[h.id];
        if slot.flags & HAS_REF != 0 {
            return;
        }
        slot.flags |= HAS_REF;
        if slot.flags & CLOSING != 0 {
            return;
        }
        if slot.flags & ACTIVE != 0 {
            self.active_handles += 1;
        }
    }

    /// Stop the handle from keeping the loop alive, without touching its I/O state.
    pub fn unref_handle(&mut self, h: Handle) {
        assert!(self.is_valid(h), "operation on a dead handle");
        let slot = &mut self.handles[h.id];
        if slot.flags & HAS_REF == 0 {
            return;
        }
        slot.flags &= !HAS_REF;
        if slot.flags & CLOSING != 0 {
            return;
        }
        if slot.flags & ACTIVE != 0 {
            self.active_handles -= 1;
        }
    }

    /// Does the handle currently count towards loop liveness?
    pub fn has_ref(&self, h: Handle) -> bool {
        self.is_valid(h) && self.handles[h.id].flags & HAS_REF != 0
    }

    pub(crate) fn mark_closing(&mut self, h: Handle) {
        let slot = &mut self.handles[h.id];
        assert!(slot.flags & (CLOSING | CLOSED) == 0, "handle closed twice");
        slot.flags |= CLOSING;
    }

    pub(crate) fn want_endgame(&mut self, h: Handle) {
        let slot = &mut self.handles[h.id];
        if slot.flags & ENDGAME_QUEUED == 0 {
            slot.flags |= ENDGAME_QUEUED;
            self.endgame.push_back(h);
        }
    }

    /// Close a handle.
    ///
    /// Must be called exactly once per handle; a second close is a programming error and
    /// asserts. Type-specific teardown (stopping the timer, closing the descriptor, canceling
    /// outstanding requests) happens immediately; the close callback fires in the endgame phase
    /// of the current (or, if called outside `run`, the next) iteration, after which the token
    /// goes stale. Requests still in flight on the handle are released without their callbacks.
    pub fn close(&mut self, h: Handle, cb: Option<CloseCb>) {
        assert!(
            self.handles.valid_gen(h.id, h.generation),
            "close of a dead handle"
        );
        debug!("closing {:?} ({:?})", h, self.handles[h.id].kind);
        self.handles[h.id].close_cb = cb;
        match self.handles[h.id].kind {
            HandleKind::Timer => {
                self.timer_stop(h);
                self.mark_closing(h);
                self.want_endgame(h);
            },
            HandleKind::Idle | HandleKind::Prepare | HandleKind::Check => {
                self.hook_stop(h);
                self.mark_closing(h);
                self.want_endgame(h);
            },
            HandleKind::Async => {
                let shared = match &self.handles[h.id].imp {
                    HandleImp::Async(a) => Arc::clone(&a.shared),
                    _ => unreachable!(),
                };
                shared.state.store(ASYNC_HANDLE_CLOSED, Ordering::Release);
                self.async_handles.remove(&h);
                self.handle_stop(h);
                self.mark_closing(h);
                self.want_endgame(h);
            },
            HandleKind::Signal => {
                self.signal_stop(h);
                self.mark_closing(h);
                self.want_endgame(h);
            },
            HandleKind::Tcp | HandleKind::NamedPipe => crate::stream::close(self, h),
            HandleKind::Poll => crate::poll::close(self, h),
            HandleKind::Process => crate::process::close(self, h),
            HandleKind::FsEvent => crate::fs_event::close(self, h),
            other => panic!("close of an unsupported {:?} handle", other),
        }
    }

    // ---- timers ----

    /// Create a timer handle.
    pub fn timer_init(&mut self) -> Result<Handle> {
        Ok(self.handle_init(
            HandleKind::Timer,
            HandleImp::Timer(TimerImp {
                repeat: Duration::ZERO,
                cb: None,
            }),
        ))
    }

    /// Arm the timer to fire once after `timeout`, and then, if `repeat` is nonzero, every
    /// `repeat` after that (measured from the fire time, not the previous deadline). Restarting
    /// a running timer is allowed and reschedules it.
    pub fn timer_start<F>(&mut self, h: Handle, timeout: Duration, repeat: Duration, cb: F) -> Result<()>
    where
        F: FnMut(&mut Scope) + 'static,
    {
        let slot = self.checked_slot_mut(h, HandleKind::Timer);
        if slot.flags & CLOSING != 0 {
            return Err(Error::Inval);
        }
        match &mut slot.imp {
            HandleImp::Timer(t) => {
                t.repeat = repeat;
                t.cb = Some(Box::new(cb));
            },
            _ => unreachable!(),
        }
        self.timer_heap.remove(h);
        let when = self.now + timeout;
        self.timer_schedule(h, when);
        self.handle_start(h);
        Ok(())
    }

    fn timer_schedule(&mut self, h: Handle, when: Instant) {
        let seq = self.timer_counter;
        self.timer_counter += 1;
        self.timer_heap.push(TimerEntry { when, seq, handle: h });
        self.handle_start(h);
    }

    /// Disarm the timer. A stopped timer keeps its callback and repeat value.
    pub fn timer_stop(&mut self, h: Handle) {
        self.checked_slot(h, HandleKind::Timer);
        self.timer_heap.remove(h);
        self.handle_stop(h);
    }

    /// Restart the timer using its repeat value as the timeout. Errors with
    /// [Inval](enum.Error.html) when the timer never had a repeat.
    pub fn timer_again(&mut self, h: Handle) -> Result<()> {
        let slot = self.checked_slot(h, HandleKind::Timer);
        let repeat = match &slot.imp {
            HandleImp::Timer(t) => t.repeat,
            _ => unreachable!(),
        };
        if repeat == Duration::ZERO {
            return Err(Error::Inval);
        }
        self.timer_heap.remove(h);
        self.handle_stop(h);
        let when = self.now + repeat;
        self.timer_schedule(h, when);
        Ok(())
    }

    /// Change the repeat interval; takes effect after the next fire.
    pub fn timer_set_repeat(&mut self, h: Handle, repeat: Duration) {
        match &mut self.checked_slot_mut(h, HandleKind::Timer).imp {
            HandleImp::Timer(t) => t.repeat = repeat,
            _ => unreachable!(),
        }
    }

    /// The current repeat interval.
    pub fn timer_repeat(&self, h: Handle) -> Duration {
        match &self.checked_slot(h, HandleKind::Timer).imp {
            HandleImp::Timer(t) => t.repeat,
            _ => unreachable!(),
        }
    }

    fn invoke_timer_cb(&mut self, h: Handle) {
        let cb = match &mut self.handles[h.id].imp {
            HandleImp::Timer(t) => t.cb.take(),
            _ => unreachable!(),
        };
        if let Some(mut cb) = cb {
            {
                let mut scope = Scope { lp: &mut *self, handle: h };
                cb(&mut scope);
            }
            if self.handles.valid_gen(h.id, h.generation) {
                if let HandleImp::Timer(t) = &mut self.handles[h.id].imp {
                    if t.cb.is_none() {
                        t.cb = Some(cb);
                    }
                }
            }
        }
    }

    // ---- idle / prepare / check hooks ----

    /// Create an idle handle. Its callback runs every iteration before the poll phase, and its
    /// mere existence keeps the poller from blocking.
    pub fn idle_init(&mut self) -> Result<Handle> {
        Ok(self.handle_init(HandleKind::Idle, HandleImp::Hook(HookImp { cb: None })))
    }

    /// Create a prepare handle. Its callback runs right before each poll phase.
    pub fn prepare_init(&mut self) -> Result<Handle> {
        Ok(self.handle_init(HandleKind::Prepare, HandleImp::Hook(HookImp { cb: None })))
    }

    /// Create a check handle. Its callback runs right after each poll phase.
    pub fn check_init(&mut self) -> Result<Handle> {
        Ok(self.handle_init(HandleKind::Check, HandleImp::Hook(HookImp { cb: None })))
    }

    fn hook_list(&self, kind: HandleKind) -> &LinkedHashMap<Handle, ()> {
        match kind {
            HandleKind::Idle => &self.idle_handles,
            HandleKind::Prepare => &self.prepare_handles,
            HandleKind::Check => &self.check_handles,
            _ => unreachable!(),
        }
    }

    fn hook_list_mut(&mut self, kind: HandleKind) -> &mut LinkedHashMap<Handle, ()> {
        match kind {
            HandleKind::Idle => &mut self.idle_handles,
            HandleKind::Prepare => &mut self.prepare_handles,
            HandleKind::Check => &mut self.check_handles,
            _ => unreachable!(),
        }
    }

    /// Arm an idle handle. Equivalent to [hook_start](#method.hook_start) with a kind check.
    pub fn idle_start<F>(&mut self, h: Handle, cb: F) -> Result<()>
    where
        F: FnMut(&mut Scope) + 'static,
    {
        self.checked_slot(h, HandleKind::Idle);
        self.hook_start(h, cb)
    }

    /// Disarm an idle handle.
    pub fn idle_stop(&mut self, h: Handle) {
        self.checked_slot(h, HandleKind::Idle);
        self.hook_stop(h);
    }

    /// Arm a prepare handle.
    pub fn prepare_start<F>(&mut self, h: Handle, cb: F) -> Result<()>
    where
        F: FnMut(&mut Scope) + 'static,
    {
        self.checked_slot(h, HandleKind::Prepare);
        self.hook_start(h, cb)
    }

    /// Disarm a prepare handle.
    pub fn prepare_stop(&mut self, h: Handle) {
        self.checked_slot(h, HandleKind::Prepare);
        self.hook_stop(h);
    }

    /// Arm a check handle.
    pub fn check_start<F>(&mut self, h: Handle, cb: F) -> Result<()>
    where
        F: FnMut(&mut Scope) + 'static,
    {
        self.checked_slot(h, HandleKind::Check);
        self.hook_start(h, cb)
    }

    /// Disarm a check handle.
    pub fn check_stop(&mut self, h: Handle) {
        self.checked_slot(h, HandleKind::Check);
        self.hook_stop(h);
    }

    /// Arm an idle, prepare or check handle. Starting an already started hook only replaces the
    /// callback.
    pub fn hook_start<F>(&mut self, h: Handle, cb: F) -> Result<()>
    where
        F: FnMut(&mut Scope) + 'static,
    {
        assert!(self.is_valid(h), "operation on a dead handle");
        let kind = self.handles[h.id].kind;
        assert!(
            matches!(kind, HandleKind::Idle | HandleKind::Prepare | HandleKind::Check),
            "operation on a {:?} handle",
            kind
        );
        if self.handles[h.id].flags & CLOSING != 0 {
            return Err(Error::Inval);
        }
        match &mut self.handles[h.id].imp {
            HandleImp::Hook(hook) => hook.cb = Some(Box::new(cb)),
            _ => unreachable!(),
        }
        self.hook_list_mut(kind).insert(h, ());
        self.handle_start(h);
        Ok(())
    }

    /// Disarm a hook. Idempotent.
    pub fn hook_stop(&mut self, h: Handle) {
        assert!(self.is_valid(h), "operation on a dead handle");
        let kind = self.handles[h.id].kind;
        assert!(
            matches!(kind, HandleKind::Idle | HandleKind::Prepare | HandleKind::Check),
            "operation on a {:?} handle",
            kind
        );
        self.hook_list_mut(kind).remove(&h);
        self.handle_stop(h);
    }

    fn invoke_hook_cb(&mut self, h: Handle) {
        let cb = match &mut self.handles[h.id].imp {
            HandleImp::Hook(hook) => hook.cb.take(),
            _ => unreachable!(),
        };
        if let Some(mut cb) = cb {
            {
                let mut scope = Scope { lp: &mut *self, handle: h };
                cb(&mut scope);
            }
            if self.handles.valid_gen(h.id, h.generation) {
                if let HandleImp::Hook(hook) = &mut self.handles[h.id].imp {
                    if hook.cb.is_none() {
                        hook.cb = Some(cb);
                    }
                }
            }
        }
    }

    // ---- async handles ----

    /// Create an async handle. The callback runs on the loop thread whenever some thread fired
    /// the matching [AsyncSender](struct.AsyncSender.html); bursts of sends may coalesce into a
    /// single callback. The handle is active from the start.
    pub fn async_init<F>(&mut self, cb: F) -> Result<Handle>
    where
        F: FnMut(&mut Scope) + 'static,
    {
        let shared = Arc::new(AsyncShared {
            pending: AtomicBool::new(false),
            state: AtomicU8::new(ASYNC_LIVE),
            waker: self.poller.waker(),
        });
        let h = self.handle_init(
            HandleKind::Async,
            HandleImp::Async(AsyncImp {
                cb: Some(Box::new(cb)),
                shared,
            }),
        );
        self.async_handles.insert(h, ());
        self.handle_start(h);
        Ok(h)
    }

    /// A cloneable, thread-safe sender firing the given async handle.
    pub fn async_sender(&self, h: Handle) -> Result<AsyncSender> {
        if !self.is_valid(h) {
            return Err(Error::Missing);
        }
        match &self.handles[h.id].imp {
            HandleImp::Async(a) => Ok(AsyncSender {
                shared: Arc::clone(&a.shared),
            }),
            _ => Err(Error::Inval),
        }
    }

    fn scan_asyncs(&mut self) {
        let snapshot: Vec<Handle> = self.async_handles.keys().cloned().collect();
        for h in snapshot {
            if !self.handles.valid_gen(h.id, h.generation) {
                continue;
            }
            let fired = match &self.handles[h.id].imp {
                HandleImp::Async(a) => a.shared.pending.swap(false, Ordering::AcqRel),
                _ => unreachable!(),
            };
            if fired {
                self.pending.push_back(Completion::Async(h));
            }
        }
    }

    fn invoke_async_cb(&mut self, h: Handle) {
        let cb = match &mut self.handles[h.id].imp {
            HandleImp::Async(a) => a.cb.take(),
            _ => unreachable!(),
        };
        if let Some(mut cb) = cb {
            {
                let mut scope = Scope { lp: &mut *self, handle: h };
                cb(&mut scope);
            }
            if self.handles.valid_gen(h.id, h.generation) {
                if let HandleImp::Async(a) = &mut self.handles[h.id].imp {
                    if a.cb.is_none() {
                        a.cb = Some(cb);
                    }
                }
            }
        }
    }

    // ---- signals ----

    /// Create a signal handle.
    pub fn signal_init(&mut self) -> Result<Handle> {
        Ok(self.handle_init(
            HandleKind::Signal,
            HandleImp::Signal(SignalImp {
                signum: None,
                cb: None,
            }),
        ))
    }

    /// Watch for a signal. The signal is masked in this thread and routed through the loop's
    /// signal descriptor; several handles may watch the same signal and each gets told.
    ///
    /// Signals merge when several arrive before they are handled: a callback means *at least
    /// one* was delivered.
    pub fn signal_start<F>(&mut self, h: Handle, signal: Signal, cb: F) -> Result<()>
    where
        F: FnMut(&mut Scope, Signal) + 'static,
    {
        {
            let slot = self.checked_slot(h, HandleKind::Signal);
            if slot.flags & CLOSING != 0 {
                return Err(Error::Inval);
            }
        }
        let old = match &mut self.handles[h.id].imp {
            HandleImp::Signal(s) => {
                let old = s.signum.replace(signal);
                s.cb = Some(Box::new(cb));
                old
            },
            _ => unreachable!(),
        };
        if let Some(old) = old {
            // Re-targeting: leave the old recipient set first
            if old != signal {
                if let Some(set) = self.signal_recipients.get_mut(&(old as i32)) {
                    set.remove(&h);
                }
            }
        }
        self.signal_enable(signal)?;
        self.signal_recipients
            .entry(signal as i32)
            .or_insert_with(LinkedHashMap::new)
            .insert(h, ());
        self.handle_start(h);
        Ok(())
    }

    /// Stop watching. The signal stays masked; another handle may still want it and unmasking is
    /// explicit through [signal_disable](#method.signal_disable).
    pub fn signal_stop(&mut self, h: Handle) {
        assert!(self.is_valid(h), "operation on a dead handle");
        let signum = match &mut self.handles[h.id].imp {
            HandleImp::Signal(s) => s.signum.take(),
            _ => panic!("operation on a {:?} handle", self.handles[h.id].kind),
        };
        if let Some(signal) = signum {
            if let Some(set) = self.signal_recipients.get_mut(&(signal as i32)) {
                set.remove(&h);
            }
        }
        self.handle_stop(h);
    }

    /// Let the loop receive the given signal (in addition to any others it already handles).
    ///
    /// The signal gets masked from normal delivery in this thread. For process-level signals the
    /// mask should cover every thread; creating the loop and enabling signals before spawning
    /// any threads is the reliable way to get that, since threads inherit the mask.
    pub fn signal_enable(&mut self, signal: Signal) -> Result<()> {
        if self.signal_mask.contains(signal) {
            return Ok(());
        }
        self.signal_mask.add(signal);
        self.signal_mask.thread_block().map_err(Error::from)?;
        self.signal_fd.set_mask(&self.signal_mask).map_err(Error::from)?;
        Ok(())
    }

    /// Stop receiving the given signal and unmask it again.
    pub fn signal_disable(&mut self, signal: Signal) -> Result<()> {
        if !self.signal_mask.contains(signal) {
            return Ok(());
        }
        self.signal_mask.remove(signal);
        self.signal_fd.set_mask(&self.signal_mask).map_err(Error::from)?;
        let mut unmask = SigSet::empty();
        unmask.add(signal);
        unmask.thread_unblock().map_err(Error::from)?;
        Ok(())
    }

    fn drain_signals(&mut self) {
        loop {
            match self.signal_fd.read_signal() {
                Ok(None) => break,
                Ok(Some(siginfo)) => {
                    let signal = match Signal::try_from(siginfo.ssi_signo as i32) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    if signal == Signal::SIGCHLD {
                        self.gather_children();
                    }
                    if let Some(recipients) = self.signal_recipients.get(&(signal as i32)) {
                        let targets: Vec<Handle> = recipients.keys().cloned().collect();
                        for handle in targets {
                            self.pending.push_back(Completion::Signal { handle, signal });
                        }
                    }
                },
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    log::warn!("signalfd read failed: {}", e);
                    break;
                },
            }
        }
    }

    fn gather_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return,
                Err(Errno::ECHILD) | Err(Errno::EAGAIN) => return,
                Err(e) => {
                    log::warn!("waitpid failed: {}", e);
                    return;
                },
                Ok(WaitStatus::Exited(pid, code)) => self.push_child_exit(pid, ChildExit::Exited(code)),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.push_child_exit(pid, ChildExit::Signaled(signal))
                },
                Ok(_) => (), // Stops and continues are not interesting here
            }
        }
    }

    fn push_child_exit(&mut self, pid: Pid, exit: ChildExit) {
        if let Some(handle) = self.children.remove(&pid.as_raw()) {
            self.pending.push_back(Completion::ProcessExit { handle, exit });
        }
        // No handle waiting for it → the zombie is reaped and the status thrown away
    }

    fn invoke_signal_cb(&mut self, h: Handle, signal: Signal) {
        let cb = match &mut self.handles[h.id].imp {
            HandleImp::Signal(s) => s.cb.take(),
            _ => unreachable!(),
        };
        if let Some(mut cb) = cb {
            {
                let mut scope = Scope { lp: &mut *self, handle: h };
                cb(&mut scope, signal);
            }
            if self.handles.valid_gen(h.id, h.generation) {
                if let HandleImp::Signal(s) = &mut self.handles[h.id].imp {
                    if s.cb.is_none() {
                        s.cb = Some(cb);
                    }
                }
            }
        }
    }

    // ---- worker pool ----

    /// Set the number of threads available to [queue_work](#method.queue_work).
    ///
    /// Raising the number is immediate; lowering takes effect as workers finish their current
    /// task. Before the first explicit setting the size comes from `ZMIJ_THREADPOOL_SIZE`.
    pub fn pool_thread_count_set(&mut self, count: usize) {
        let count = count.clamp(1, 128);
        self.pool_size = count;
        if let Some(pool) = &mut self.pool {
            pool.set_num_threads(count);
        }
    }

    pub(crate) fn next_request_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    pub(crate) fn wq_sender(&self) -> AsyncSender {
        match &self.handles[self.wq_async.id].imp {
            HandleImp::Async(a) => AsyncSender {
                shared: Arc::clone(&a.shared),
            },
            _ => unreachable!(),
        }
    }

    pub(crate) fn pool_execute<F: FnOnce() + Send + 'static>(&mut self, job: F) {
        if self.pool.is_none() {
            self.pool = Some(ThreadPool::new(self.pool_size));
        }
        self.pool.as_mut().unwrap().execute(job);
    }

    /// Run `work` on the thread pool; once it finishes, `after_work` runs on the loop thread.
    ///
    /// The work item counts as an active request and keeps the loop alive until `after_work` was
    /// dispatched. A panic inside `work` is caught by the bridge and surfaces as
    /// `Err(BackgroundPanicked)`.
    pub fn queue_work<W, A>(&mut self, work: W, after_work: A) -> RequestId
    where
        W: FnOnce() + Send + 'static,
        A: FnOnce(&mut Scope, Result<()>) + 'static,
    {
        let id = self.next_request_id();
        let state = Arc::new(AtomicU8::new(WORK_QUEUED));
        self.work_after.insert(id, AfterWork::User(Box::new(after_work)));
        self.work_states.insert(id, Arc::clone(&state));
        self.active_reqs += 1;

        let queue = Arc::clone(&self.wq_done);
        let sender = self.wq_sender();
        self.pool_execute(move || {
            if state
                .compare_exchange(WORK_QUEUED, WORK_RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return; // Canceled before it got a thread; the cancel already posted the outcome
            }
            let mut guard = DoneGuard::new(id, queue, sender);
            work();
            state.store(WORK_DONE, Ordering::Release);
            guard.post(Ok(0));
        });
        RequestId(id)
    }

    /// Cancel a queued work item. Only possible while it still waits for a thread; once it runs,
    /// this reports `Err(Busy)`. A successful cancel delivers `after_work` with
    /// `Err(Canceled)`.
    pub fn cancel_work(&mut self, req: RequestId) -> Result<()> {
        let state = match self.work_states.get(&req.0) {
            Some(s) => s,
            None => return Err(Error::Missing),
        };
        match state.compare_exchange(WORK_QUEUED, WORK_CANCELED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.wq_done.lock().unwrap().push_back((req.0, Err(Error::Canceled)));
                let _ = self.wq_sender().send();
                Ok(())
            },
            Err(_) => Err(Error::Busy),
        }
    }

    pub(crate) fn drain_work(&mut self) {
        loop {
            let item = self.wq_done.lock().unwrap().pop_front();
            let (id, outcome) = match item {
                Some(x) => x,
                None => break,
            };
            self.work_states.remove(&id);
            self.active_reqs -= 1;
            match self.work_after.remove(&id) {
                Some(AfterWork::User(cb)) => {
                    let handle = self.wq_async;
                    let mut scope = Scope { lp: &mut *self, handle };
                    cb(&mut scope, outcome.map(|_| ()));
                },
                Some(AfterWork::SlowPoll { handle, slot }) => {
                    if self.handles.valid_gen(handle.id, handle.generation) {
                        crate::poll::process_poll_result(self, handle, slot, outcome);
                    }
                },
                None => (),
            }
        }
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        registry::unregister(self.registry_id);
        // Senders still out there learn that the loop left
        for idx in self.handles.indexes() {
            if let HandleImp::Async(a) = &self.handles[idx].imp {
                a.shared.state.store(ASYNC_LOOP_GONE, Ordering::Release);
            }
        }
    }
}

/// The view of the loop a callback gets.
///
/// It dereferences to [Loop](struct.Loop.html), so the entire API is available, and additionally
/// knows which handle the callback belongs to.
pub struct Scope<'l> {
    pub(crate) lp: &'l mut Loop,
    pub(crate) handle: Handle,
}

impl<'l> Scope<'l> {
    /// The handle this callback was invoked for.
    pub fn current(&self) -> Handle {
        self.handle
    }
}

impl<'l> Deref for Scope<'l> {
    type Target = Loop;

    fn deref(&self) -> &Loop {
        self.lp
    }
}

impl<'l> DerefMut for Scope<'l> {
    fn deref_mut(&mut self) -> &mut Loop {
        self.lp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    macro_rules! err {
        ($result:expr, $err:pat) => {
            assert!(match $result {
                Err($err) => true,
                _ => false,
            })
        };
    }

    /// A loop with nothing to do is not alive and returns right away in every mode.
    #[test]
    fn empty_loop() {
        let mut l = Loop::new().unwrap();
        assert!(!l.alive());
        assert!(!l.run(RunMode::Default));
        assert!(!l.run(RunMode::Once));
        assert!(!l.run(RunMode::NoWait));
        // Only the internal worker-pool wakeup handle lives inside
        assert_eq!(1, l.handle_count());
        let mut seen = Vec::new();
        l.walk(|_, kind| seen.push(kind));
        assert_eq!(vec![HandleKind::Async], seen);
    }

    /// A timer fires once, the loop then runs out of work.
    #[test]
    fn timer_fires() {
        let mut l = Loop::new().unwrap();
        let fired = Rc::new(Cell::new(0u32));
        let timer = l.timer_init().unwrap();
        let fired2 = Rc::clone(&fired);
        let started = Instant::now();
        l.update_time();
        l.timer_start(timer, Duration::from_millis(5), Duration::ZERO, move |scope| {
            fired2.set(fired2.get() + 1);
            let h = scope.current();
            scope.close(h, None);
        })
        .unwrap();
        assert!(l.is_active(timer));
        assert!(!l.run(RunMode::Default));
        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(1, fired.get());
        assert!(!l.is_valid(timer));
    }

    /// Three timers due at the same instant fire in start order.
    #[test]
    fn timer_tie_breaking() {
        let mut l = Loop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        for label in 1..=3u32 {
            let timer = l.timer_init().unwrap();
            let order = Rc::clone(&order);
            l.timer_start(timer, Duration::from_millis(10), Duration::ZERO, move |scope| {
                order.borrow_mut().push(label);
                let h = scope.current();
                scope.close(h, None);
            })
            .unwrap();
        }
        l.run(RunMode::Default);
        assert_eq!(vec![1, 2, 3], *order.borrow());
    }

    /// A repeating timer re-arms relative to the fire time and can be stopped from its callback.
    #[test]
    fn timer_repeat() {
        let mut l = Loop::new().unwrap();
        let fired = Rc::new(Cell::new(0u32));
        let timer = l.timer_init().unwrap();
        let fired2 = Rc::clone(&fired);
        l.timer_start(timer, Duration::from_millis(1), Duration::from_millis(1), move |scope| {
            fired2.set(fired2.get() + 1);
            if fired2.get() == 3 {
                let h = scope.current();
                scope.timer_stop(h);
                scope.close(h, None);
            }
        })
        .unwrap();
        l.run(RunMode::Default);
        assert_eq!(3, fired.get());
    }

    /// Closing a handle from inside its own callback finalizes it in the same iteration, and the
    /// close callback fires exactly once.
    #[test]
    fn close_in_callback() {
        let mut l = Loop::new().unwrap();
        let closed = Rc::new(Cell::new(0u32));
        let timer = l.timer_init().unwrap();
        let closed2 = Rc::clone(&closed);
        l.timer_start(timer, Duration::ZERO, Duration::ZERO, move |scope| {
            let h = scope.current();
            let closed3 = Rc::clone(&closed2);
            scope.close(
                h,
                Some(Box::new(move |_| {
                    closed3.set(closed3.get() + 1);
                })),
            );
        })
        .unwrap();
        // One pass without blocking finalizes the handle in its endgame phase
        let alive = l.run(RunMode::Once);
        assert_eq!(1, closed.get());
        assert!(!alive);
        assert!(!l.run(RunMode::NoWait));
    }

    /// Callbacks (other than the close callback) never fire after close.
    #[test]
    fn no_callbacks_after_close() {
        let mut l = Loop::new().unwrap();
        let fired = Rc::new(Cell::new(0u32));
        let timer = l.timer_init().unwrap();
        let fired2 = Rc::clone(&fired);
        l.timer_start(timer, Duration::ZERO, Duration::ZERO, move |_| {
            fired2.set(fired2.get() + 1);
        })
        .unwrap();
        l.close(timer, None);
        l.run(RunMode::Default);
        assert_eq!(0, fired.get());
    }

    #[test]
    #[should_panic(expected = "handle closed twice")]
    fn double_close_asserts() {
        let mut l = Loop::new().unwrap();
        let timer = l.timer_init().unwrap();
        l.close(timer, None);
        l.close(timer, None);
    }

    /// An unreferenced active handle does not keep the loop running.
    #[test]
    fn unref_drops_liveness() {
        let mut l = Loop::new().unwrap();
        let timer = l.timer_init().unwrap();
        l.timer_start(timer, Duration::from_secs(3600), Duration::ZERO, |_| ())
            .unwrap();
        assert!(l.alive());
        l.unref_handle(timer);
        assert!(!l.alive());
        assert!(!l.run(RunMode::NoWait));
        l.ref_handle(timer);
        assert!(l.alive());
        l.close(timer, None);
        l.run(RunMode::Default);
    }

    /// Idle hooks run every iteration and keep the poller from blocking; hooks started inside a
    /// callback wait for the next iteration.
    #[test]
    fn idle_hooks() {
        let mut l = Loop::new().unwrap();
        let counts = Rc::new(RefCell::new((0u32, 0u32)));
        let idle = l.idle_init().unwrap();
        let counts2 = Rc::clone(&counts);
        l.hook_start(idle, move |scope| {
            let mut c = counts2.borrow_mut();
            c.0 += 1;
            if c.0 == 1 {
                // A second idle born inside the phase must not run in this same iteration
                let late = scope.idle_init().unwrap();
                let counts3 = Rc::clone(&counts2);
                scope
                    .hook_start(late, move |scope| {
                        counts3.borrow_mut().1 += 1;
                        let h = scope.current();
                        scope.close(h, None);
                    })
                    .unwrap();
            }
        })
        .unwrap();
        assert_eq!(Some(Duration::ZERO), l.backend_timeout());
        l.run(RunMode::NoWait);
        assert_eq!((1, 0), *counts.borrow());
        l.run(RunMode::NoWait);
        assert_eq!((2, 1), *counts.borrow());
        l.close(idle, None);
        l.run(RunMode::Default);
    }

    /// Prepare runs before the poll, check after it, in that order.
    #[test]
    fn prepare_check_order() {
        let mut l = Loop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let prep = l.prepare_init().unwrap();
        let check = l.check_init().unwrap();
        let o1 = Rc::clone(&order);
        l.hook_start(prep, move |_| o1.borrow_mut().push("prepare")).unwrap();
        let o2 = Rc::clone(&order);
        l.hook_start(check, move |_| o2.borrow_mut().push("check")).unwrap();
        l.run(RunMode::NoWait);
        assert_eq!(vec!["prepare", "check"], *order.borrow());
        l.close(prep, None);
        l.close(check, None);
        l.run(RunMode::Default);
    }

    /// Same-thread async sends coalesce into at least one and at most N callbacks.
    #[test]
    fn async_coalesce() {
        let mut l = Loop::new().unwrap();
        let fired = Rc::new(Cell::new(0u32));
        let fired2 = Rc::clone(&fired);
        let async_h = l
            .async_init(move |scope| {
                fired2.set(fired2.get() + 1);
                let h = scope.current();
                scope.close(h, None);
            })
            .unwrap();
        let sender = l.async_sender(async_h).unwrap();
        for _ in 0..100 {
            sender.send().unwrap();
        }
        l.run(RunMode::Default);
        assert_eq!(1, fired.get());
        err!(sender.send(), Error::Missing);
    }

    /// Background work keeps the loop alive and reports back on the loop thread.
    #[test]
    fn background_work() {
        let mut l = Loop::new().unwrap();
        let done = Rc::new(Cell::new(false));
        let done2 = Rc::clone(&done);
        l.queue_work(
            || std::thread::sleep(Duration::from_millis(5)),
            move |_, status| {
                assert_eq!(Ok(()), status);
                done2.set(true);
            },
        );
        assert!(l.alive());
        l.run(RunMode::Default);
        assert!(done.get());
        assert!(!l.alive());
    }

    /// A panicking work item surfaces as an error instead of tearing anything down.
    #[test]
    fn background_panic() {
        let mut l = Loop::new().unwrap();
        let seen = Rc::new(Cell::new(false));
        let seen2 = Rc::clone(&seen);
        l.queue_work(
            || panic!("testing handling of panic"),
            move |_, status| {
                err!(status, Error::BackgroundPanicked);
                seen2.set(true);
            },
        );
        l.run(RunMode::Default);
        assert!(seen.get());
    }

    /// Canceling work that has not started yet delivers ECANCELED exactly once.
    #[test]
    fn cancel_queued_work() {
        let mut l = Loop::new().unwrap();
        // Fill the single thread with a slow job so the second one stays queued
        l.pool_thread_count_set(1);
        let slow_done = Rc::new(Cell::new(false));
        let slow_done2 = Rc::clone(&slow_done);
        l.queue_work(
            || std::thread::sleep(Duration::from_millis(50)),
            move |_, _| slow_done2.set(true),
        );
        let canceled = Rc::new(Cell::new(0u32));
        let canceled2 = Rc::clone(&canceled);
        let req = l.queue_work(
            || unreachable!("canceled work must not run"),
            move |_, status| {
                err!(status, Error::Canceled);
                canceled2.set(canceled2.get() + 1);
            },
        );
        l.cancel_work(req).unwrap();
        err!(l.cancel_work(req), Error::Busy);
        l.run(RunMode::Default);
        assert!(slow_done.get());
        assert_eq!(1, canceled.get());
    }

    /// The backend timeout tracks the nearest timer and the run state.
    #[test]
    fn backend_timeout_shape() {
        let mut l = Loop::new().unwrap();
        assert_eq!(Some(Duration::ZERO), l.backend_timeout());
        let timer = l.timer_init().unwrap();
        l.timer_start(timer, Duration::from_millis(100), Duration::ZERO, |_| ())
            .unwrap();
        l.update_time();
        let t = l.backend_timeout().unwrap();
        assert!(t <= Duration::from_millis(100) && t > Duration::ZERO);
        l.timer_stop(timer);
        // Active handle exists? No: stopping deactivated it, so no blocking either.
        assert_eq!(Some(Duration::ZERO), l.backend_timeout());
        l.close(timer, None);
        l.run(RunMode::Default);
    }

    /// Stop interrupts a default run at the next iteration border.
    #[test]
    fn stop_stops() {
        let mut l = Loop::new().unwrap();
        let ticks = Rc::new(Cell::new(0u32));
        let timer = l.timer_init().unwrap();
        let ticks2 = Rc::clone(&ticks);
        l.timer_start(timer, Duration::ZERO, Duration::from_millis(1), move |scope| {
            ticks2.set(ticks2.get() + 1);
            scope.stop();
        })
        .unwrap();
        // Still alive: the repeating timer stays armed
        assert!(l.run(RunMode::Default));
        assert_eq!(1, ticks.get());
        l.close(timer, None);
        l.run(RunMode::Default);
    }

    /// kind_of and token staleness.
    #[test]
    fn tokens_go_stale() {
        let mut l = Loop::new().unwrap();
        let timer = l.timer_init().unwrap();
        assert_eq!(Ok(HandleKind::Timer), l.kind_of(timer));
        assert!(!l.is_closing(timer));
        l.close(timer, None);
        assert!(l.is_closing(timer));
        l.run(RunMode::Default);
        assert!(!l.is_valid(timer));
        assert!(l.is_closing(timer));
        err!(l.kind_of(timer), Error::Missing);
    }
}
