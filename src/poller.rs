//! The platform poller.
//!
//! One half of the poller contract: given a timeout, block at most that long and report what
//! became ready. The loop owns the other half (turning the reports into queued completions). The
//! implementation sits on top of mio, which speaks epoll here; descriptors are watched through
//! `SourceFd`, so anything with a file descriptor can participate.
//!
//! Tokens are laid out the way the loop's ancestor did it: a fixed token for the cross-thread
//! waker, a fixed one for the signal descriptor, and everything above a small shift indexes the
//! watcher table. Watcher slots carry a generation stamp, so a descriptor that is closed and
//! recycled while reports are still in flight can never be confused with its successor.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::{fatal_error, Error, Result};
use crate::recycler::Recycler;
use crate::Handle;

pub const WAKER_TOK: Token = Token(0);
pub const SIGNAL_TOK: Token = Token(1);
const TOKEN_SHIFT: usize = 2;

/// Readiness bits a watcher may ask for. Unlike mio's `Interest` this one can be empty, which
/// models "registered but currently quiet".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestMask(u8);

impl InterestMask {
    pub const NONE: InterestMask = InterestMask(0);
    pub const READ: InterestMask = InterestMask(1);
    pub const WRITE: InterestMask = InterestMask(2);

    pub fn union(self, other: InterestMask) -> InterestMask {
        InterestMask(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn to_mio(self) -> Option<Interest> {
        match (self.0 & 1 != 0, self.0 & 2 != 0) {
            (false, false) => None,
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        }
    }
}

/// A ticket for one watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherId {
    idx: usize,
    generation: u64,
}

struct Watcher {
    fd: RawFd,
    handle: Handle,
    /// What the owner wants to hear about.
    desired: InterestMask,
    /// What the kernel currently knows. `None` while deregistered.
    registered: Option<Interest>,
    dirty: bool,
}

/// One readiness report, already resolved to the owning handle.
#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    pub handle: Handle,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

/// What a wait produced besides descriptor readiness.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitOutcome {
    /// The cross-thread waker fired.
    pub woke: bool,
    /// The signal descriptor is readable.
    pub signal: bool,
}

pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    watchers: Recycler<Watcher>,
    /// Indexes with a pending interest change, applied in one batch right before the wait.
    dirty: Vec<usize>,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOK)?;
        Ok(Poller {
            poll,
            events: Events::with_capacity(1024),
            waker: Arc::new(waker),
            watchers: Recycler::new(),
            dirty: Vec::new(),
        })
    }

    /// The cross-thread wakeup channel. Cloning the `Arc` is how senders escape the loop thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Hook the signal descriptor under its fixed token.
    pub fn register_signal_fd(&mut self, fd: RawFd) -> Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), SIGNAL_TOK, Interest::READABLE)?;
        Ok(())
    }

    /// Start watching a descriptor on behalf of a handle.
    ///
    /// The error is handed back untranslated enough to matter: a descriptor the readiness engine
    /// refuses (`EPERM` for regular files under epoll) makes the caller fall back to the slow,
    /// worker-driven path.
    pub fn add(&mut self, fd: RawFd, handle: Handle, desired: InterestMask) -> Result<WatcherId> {
        let (idx, generation) = self.watchers.store(Watcher {
            fd,
            handle,
            desired,
            registered: None,
            dirty: false,
        });
        if let Some(interest) = desired.to_mio() {
            let token = Token(idx + TOKEN_SHIFT);
            if let Err(e) = self.poll.registry().register(&mut SourceFd(&fd), token, interest) {
                self.watchers.release(idx);
                return Err(Error::from(e));
            }
            self.watchers[idx].registered = Some(interest);
        }
        trace!("watching fd {} for {:?} as {:?}", fd, handle, idx);
        Ok(WatcherId { idx, generation })
    }

    /// Change what a watcher listens for. The kernel-side update is batched until the next wait.
    pub fn update(&mut self, id: WatcherId, desired: InterestMask) {
        assert!(self.watchers.valid_gen(id.idx, id.generation));
        let watcher = &mut self.watchers[id.idx];
        if watcher.desired != desired {
            watcher.desired = desired;
            if !watcher.dirty {
                watcher.dirty = true;
                self.dirty.push(id.idx);
            }
        }
    }

    /// Stop watching and forget the slot. Safe to call with reports still queued; they carry the
    /// owning handle and the handle table filters the stale ones.
    pub fn remove(&mut self, id: WatcherId) {
        assert!(self.watchers.valid_gen(id.idx, id.generation));
        let watcher = self.watchers.release(id.idx);
        if watcher.registered.is_some() {
            // The descriptor may already be closed; deregistration of a dead fd is a no-op.
            let _ = self.poll.registry().deregister(&mut SourceFd(&watcher.fd));
        }
        trace!("forgot fd {} of {:?}", watcher.fd, watcher.handle);
    }

    fn flush_changes(&mut self) {
        for idx in std::mem::take(&mut self.dirty) {
            if !self.watchers.valid(idx) {
                continue; // Removed after the change was queued
            }
            let token = Token(idx + TOKEN_SHIFT);
            let watcher = &mut self.watchers[idx];
            if !watcher.dirty {
                continue;
            }
            watcher.dirty = false;
            let registry = self.poll.registry();
            let result = match (watcher.registered, watcher.desired.to_mio()) {
                (None, None) => Ok(()),
                (None, Some(interest)) => {
                    let r = registry.register(&mut SourceFd(&watcher.fd), token, interest);
                    if r.is_ok() {
                        watcher.registered = Some(interest);
                    }
                    r
                },
                (Some(_), None) => {
                    let r = registry.deregister(&mut SourceFd(&watcher.fd));
                    if r.is_ok() {
                        watcher.registered = None;
                    }
                    r
                },
                (Some(old), Some(interest)) => {
                    if old == interest {
                        Ok(())
                    } else {
                        let r = registry.reregister(&mut SourceFd(&watcher.fd), token, interest);
                        if r.is_ok() {
                            watcher.registered = Some(interest);
                        }
                        r
                    }
                },
            };
            if let Err(e) = result {
                // A descriptor that went away mid-flight loses its events; its handle learns
                // about that from the next syscall it issues.
                log::warn!("interest change for fd {} failed: {}", watcher.fd, e);
            }
        }
    }

    /// Block until something happens or the timeout runs out; translate every report.
    ///
    /// `None` blocks forever. The kernel is allowed to return a bit early; the wait re-enters
    /// with the remaining time and, from the third consecutive early return on, pads the timeout
    /// exponentially so a misbehaving clock cannot produce a busy loop.
    pub fn wait(&mut self, timeout: Option<Duration>, sink: &mut Vec<IoEvent>) -> WaitOutcome {
        self.flush_changes();

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut current = timeout;
        let mut outcome = WaitOutcome::default();
        let mut repeat: u32 = 0;

        loop {
            match self.poll.poll(&mut self.events, current) {
                Ok(()) => (),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => (),
                Err(e) => fatal_error(e, "poll"),
            }

            if !self.events.is_empty() {
                break;
            }
            let deadline = match deadline {
                // Infinite wait woken by nothing visible: somebody nudged the waker before we
                // registered interest, or the kernel hiccuped. Just wait again.
                None => continue,
                Some(d) => d,
            };
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            // Returned early; go back to sleep for the remainder, padded after round two.
            let padding = if repeat > 0 {
                Duration::from_millis(1u64 << (repeat - 1).min(10))
            } else {
                Duration::ZERO
            };
            current = Some(deadline - now + padding);
            repeat += 1;
        }

        for event in self.events.iter() {
            match event.token() {
                WAKER_TOK => outcome.woke = true,
                SIGNAL_TOK => outcome.signal = true,
                Token(tok) => {
                    let idx = tok - TOKEN_SHIFT;
                    if !self.watchers.valid(idx) {
                        continue;
                    }
                    let watcher = &self.watchers[idx];
                    sink.push(IoEvent {
                        handle: watcher.handle,
                        readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                        writable: event.is_writable() || event.is_write_closed(),
                        hangup: event.is_read_closed(),
                    });
                },
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    fn handle(id: usize) -> Handle {
        Handle { id, generation: 0 }
    }

    #[test]
    fn reports_readiness() {
        let mut poller = Poller::new().unwrap();
        let (a, b) = sys::socketpair_stream().unwrap();
        let id = poller
            .add(a.as_raw_fd(), handle(7), InterestMask::READ.union(InterestMask::WRITE))
            .unwrap();

        let mut sink = Vec::new();
        poller.wait(Some(Duration::from_millis(100)), &mut sink);
        assert!(sink.iter().any(|e| e.handle == handle(7) && e.writable));

        sink.clear();
        let mut peer = std::fs::File::from(b);
        peer.write_all(b"x").unwrap();
        poller.wait(Some(Duration::from_millis(1000)), &mut sink);
        assert!(sink.iter().any(|e| e.handle == handle(7) && e.readable));

        poller.remove(id);
    }

    #[test]
    fn waker_wakes_and_coalesces() {
        let mut poller = Poller::new().unwrap();
        let waker = poller.waker();
        waker.wake().unwrap();
        waker.wake().unwrap();
        let mut sink = Vec::new();
        let outcome = poller.wait(None, &mut sink);
        assert!(outcome.woke);
        assert!(sink.is_empty());
        // Both nudges were folded into the one report; nothing else is pending.
        let outcome = poller.wait(Some(Duration::ZERO), &mut sink);
        assert!(!outcome.woke);
    }

    #[test]
    fn timeout_is_honored() {
        let mut poller = Poller::new().unwrap();
        let start = Instant::now();
        let mut sink = Vec::new();
        poller.wait(Some(Duration::from_millis(30)), &mut sink);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn rejects_plain_files() {
        let mut poller = Poller::new().unwrap();
        let null = sys::open_devnull().unwrap();
        // The null device is pollable; a regular file is not. Use a real file.
        let file = std::fs::File::open("/proc/self/cmdline")
            .or_else(|_| std::fs::File::open("/etc/hostname"))
            .unwrap();
        let err = poller.add(file.as_raw_fd(), handle(1), InterestMask::READ);
        assert!(err.is_err());
        drop(null);
    }
}
