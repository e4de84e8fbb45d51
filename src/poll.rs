//! Poll handles: readable/writable/disconnect notifications for a descriptor the library does
//! not own.
//!
//! Two poll requests are kept in flight alternately, so that while one callback runs the other
//! request is already re-armable and event delivery stays continuous. Each submission records a
//! suppression mask for its sibling, which keeps a single readiness condition from being
//! reported twice.
//!
//! Submission has a fast and a slow flavor sharing this state machine. The fast path probes the
//! descriptor without blocking and otherwise arms the loop's poller. The slow path exists for
//! descriptors the readiness engine refuses (regular files, most prominently): a worker-pool
//! task performs a bounded `poll(2)` wait and posts the outcome back through the loop's wakeup.

use std::os::unix::io::RawFd;

use log::trace;

use crate::core::{AfterWork, Completion, DoneGuard, HandleImp, Scope, CLOSING, POLL_SLOW};
use crate::error::{Error, Result};
use crate::poller::{InterestMask, WatcherId};
use crate::sys;
use crate::{Handle, HandleKind, Loop};

/// The event set of a poll handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvents(pub u8);

impl PollEvents {
    pub const NONE: PollEvents = PollEvents(0);
    pub const READABLE: PollEvents = PollEvents(1);
    pub const WRITABLE: PollEvents = PollEvents(2);
    pub const DISCONNECT: PollEvents = PollEvents(4);

    pub fn union(self, other: PollEvents) -> PollEvents {
        PollEvents(self.0 | other.0)
    }

    pub fn contains(self, other: PollEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Callback of a poll handle: the portable status and, on success, the events seen.
pub type PollCb = Box<dyn FnMut(&mut Scope, Result<PollEvents>)>;

/// How long the slow path lets one `poll(2)` wait run. Bounded so a descriptor closed behind
/// our back cannot park a worker forever.
const SLOW_POLL_BOUND_MS: libc::c_int = 3 * 60 * 1000;

pub(crate) struct PollImp {
    fd: RawFd,
    watcher: Option<WatcherId>,
    /// What the user currently wants to hear about.
    events: u8,
    /// Events each in-flight request was submitted with; 0 means the slot is free.
    submitted: [u8; 2],
    /// Events the sibling request already covers, suppressed on delivery.
    mask: [u8; 2],
    cb: Option<PollCb>,
}

impl PollImp {
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

fn poll_mut(lp: &mut Loop, h: Handle) -> &mut PollImp {
    match &mut lp.handles[h.id].imp {
        HandleImp::Poll(p) => p,
        _ => unreachable!(),
    }
}

fn poll_ref(lp: &Loop, h: Handle) -> &PollImp {
    match &lp.handles[h.id].imp {
        HandleImp::Poll(p) => p,
        _ => unreachable!(),
    }
}

fn events_to_poll_mask(events: u8) -> libc::c_short {
    let mut mask = 0;
    if events & PollEvents::READABLE.0 != 0 {
        mask |= libc::POLLIN;
    }
    if events & PollEvents::WRITABLE.0 != 0 {
        mask |= libc::POLLOUT;
    }
    mask
}

fn revents_to_events(revents: libc::c_short) -> u8 {
    let mut events = 0;
    if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
        events |= PollEvents::READABLE.0;
    }
    if revents & (libc::POLLOUT | libc::POLLERR) != 0 {
        events |= PollEvents::WRITABLE.0;
    }
    if revents & libc::POLLHUP != 0 {
        events |= PollEvents::READABLE.0 | PollEvents::DISCONNECT.0;
    }
    events
}

impl Loop {
    /// Create a poll handle watching a foreign descriptor.
    ///
    /// The descriptor is switched to nonblocking mode but its ownership stays with the caller;
    /// closing the handle does not close the descriptor. Descriptors the readiness engine cannot
    /// watch are transparently served by the slow worker-driven path.
    pub fn poll_init(&mut self, fd: RawFd) -> Result<Handle> {
        sys::set_nonblocking(fd)?;
        let h = self.handle_init(
            HandleKind::Poll,
            HandleImp::Poll(PollImp {
                fd,
                watcher: None,
                events: 0,
                submitted: [0; 2],
                mask: [0; 2],
                cb: None,
            }),
        );
        // Probing registration tells the paths apart: epoll refuses plain files with EPERM.
        match self.poller.add(fd, h, InterestMask::READ) {
            Ok(watcher) => {
                self.poller.update(watcher, InterestMask::NONE);
                poll_mut(self, h).watcher = Some(watcher);
            },
            Err(Error::Acces) => {
                self.handles[h.id].flags |= POLL_SLOW;
                trace!("poll handle {:?} takes the slow path", h);
            },
            Err(e) => {
                // The probe failed for real; undo the slot and report
                self.handles.release(h.id);
                return Err(e);
            },
        }
        Ok(h)
    }

    /// Start or re-target polling. The callback fires whenever one of the requested conditions
    /// holds; a level that stays high keeps reporting once per loop iteration.
    pub fn poll_start<F>(&mut self, h: Handle, events: PollEvents, cb: F) -> Result<()>
    where
        F: FnMut(&mut Scope, Result<PollEvents>) + 'static,
    {
        let slot = self.checked_slot(h, HandleKind::Poll);
        assert!(slot.flags & CLOSING == 0, "poll_start on a closing handle");
        let slow = slot.flags & POLL_SLOW != 0;
        let allowed = if slow {
            PollEvents::READABLE.0 | PollEvents::WRITABLE.0
        } else {
            PollEvents::READABLE.0 | PollEvents::WRITABLE.0 | PollEvents::DISCONNECT.0
        };
        assert!(events.0 & !allowed == 0, "unsupported poll event mask");

        let imp = poll_mut(self, h);
        imp.events = events.0;
        imp.cb = Some(Box::new(cb));
        if events.0 != 0 {
            self.handle_start(h);
        } else {
            self.handle_stop(h);
        }
        let imp = poll_ref(self, h);
        if imp.events & !(imp.submitted[0] | imp.submitted[1]) != 0 {
            submit_poll_req(self, h);
        }
        Ok(())
    }

    /// Stop polling. In-flight slow requests finish on their own; their reports are suppressed.
    pub fn poll_stop(&mut self, h: Handle) {
        self.checked_slot(h, HandleKind::Poll);
        let imp = poll_mut(self, h);
        imp.events = 0;
        let fast = self.handles[h.id].flags & POLL_SLOW == 0;
        if fast {
            // Fast submissions are just armed interest; nothing will come back once cleared
            let imp = poll_mut(self, h);
            imp.submitted = [0; 2];
            imp.mask = [0; 2];
            sync_fast_interest(self, h);
        }
        self.handle_stop(h);
    }
}

fn sync_fast_interest(lp: &mut Loop, h: Handle) {
    let imp = poll_ref(lp, h);
    let armed = imp.submitted[0] | imp.submitted[1];
    let watcher = match imp.watcher {
        Some(w) => w,
        None => return,
    };
    let mut mask = InterestMask::NONE;
    if armed & (PollEvents::READABLE.0 | PollEvents::DISCONNECT.0) != 0 {
        mask = mask.union(InterestMask::READ);
    }
    if armed & PollEvents::WRITABLE.0 != 0 {
        mask = mask.union(InterestMask::WRITE);
    }
    lp.poller.update(watcher, mask);
}

/// Arm the next free request slot, fast or slow as the handle demands.
fn submit_poll_req(lp: &mut Loop, h: Handle) {
    let slow = lp.handles[h.id].flags & POLL_SLOW != 0;
    let imp = poll_mut(lp, h);
    let events = imp.events;
    let slot = if imp.submitted[0] == 0 {
        imp.submitted[0] = events;
        imp.mask[0] = 0;
        imp.mask[1] = events;
        0
    } else if imp.submitted[1] == 0 {
        imp.submitted[1] = events;
        imp.mask[0] = events;
        imp.mask[1] = 0;
        1
    } else {
        // Both requests are out; one is about to return and the resubmission logic in
        // process_poll_result will pick the pending events up.
        return;
    };
    let fd = imp.fd;

    if slow {
        let id = lp.next_request_id();
        lp.work_after.insert(id, AfterWork::SlowPoll { handle: h, slot });
        lp.active_reqs += 1;
        let queue = std::sync::Arc::clone(&lp.wq_done);
        let sender = lp.wq_sender();
        lp.pool_execute(move || {
            let mut guard = DoneGuard::new(id, queue, sender);
            let outcome = sys::poll_once(fd, events_to_poll_mask(events), SLOW_POLL_BOUND_MS)
                .map(revents_to_events);
            guard.post(outcome);
        });
        return;
    }

    // Fast path: ask the kernel right now; only if nothing is pending arm the poller.
    match sys::poll_once(fd, events_to_poll_mask(events), 0) {
        Ok(0) => sync_fast_interest(lp, h),
        Ok(revents) => {
            lp.pending.push_back(Completion::PollResult {
                handle: h,
                slot,
                result: Ok(revents_to_events(revents)),
            });
        },
        Err(e) => {
            lp.pending.push_back(Completion::PollResult {
                handle: h,
                slot,
                result: Err(e),
            });
        },
    }
}

/// A readiness report from the poller for the fast path: it completes the older in-flight
/// request.
pub(crate) fn process_io(lp: &mut Loop, h: Handle, readable: bool, writable: bool, hangup: bool) {
    let mut events = 0u8;
    if readable {
        events |= PollEvents::READABLE.0;
    }
    if writable {
        events |= PollEvents::WRITABLE.0;
    }
    if hangup {
        events |= PollEvents::READABLE.0 | PollEvents::DISCONNECT.0;
    }
    let imp = poll_ref(lp, h);
    let slot = if imp.submitted[0] != 0 {
        0
    } else if imp.submitted[1] != 0 {
        1
    } else {
        return; // Nothing armed; a stale report
    };
    process_poll_result(lp, h, slot, Ok(events));
}

/// One poll request returned, from either path. Deliver what survives the masks, then re-arm or
/// finish closing.
pub(crate) fn process_poll_result(lp: &mut Loop, h: Handle, slot: usize, result: Result<u8>) {
    let imp = poll_mut(lp, h);
    imp.submitted[slot] = 0;
    let suppressed = imp.mask[slot];
    let wanted = imp.events;

    match result {
        Err(e) => {
            if wanted != 0 {
                // The watcher stops itself on error, like a stream would
                poll_mut(lp, h).events = 0;
                lp.handle_stop(h);
                invoke_poll_cb(lp, h, Err(e));
            }
        },
        Ok(reported) => {
            let delivered = reported & wanted & !suppressed;
            if delivered != 0 {
                invoke_poll_cb(lp, h, Ok(PollEvents(delivered)));
            }
        },
    }

    if !lp.handles.valid_gen(h.id, h.generation) {
        return;
    }
    let imp = poll_ref(lp, h);
    let outstanding = imp.submitted[0] | imp.submitted[1];
    if imp.events & !outstanding != 0 {
        submit_poll_req(lp, h);
    } else if lp.handles[h.id].flags & CLOSING != 0 && outstanding == 0 {
        lp.want_endgame(h);
    }
    if lp.handles[h.id].flags & (CLOSING | POLL_SLOW) == 0 {
        sync_fast_interest(lp, h);
    }
}

fn invoke_poll_cb(lp: &mut Loop, h: Handle, result: Result<PollEvents>) {
    let cb = poll_mut(lp, h).cb.take();
    if let Some(mut cb) = cb {
        {
            let mut scope = Scope {
                lp: &mut *lp,
                handle: h,
            };
            cb(&mut scope, result);
        }
        if lp.handles.valid_gen(h.id, h.generation) {
            let imp = poll_mut(lp, h);
            if imp.cb.is_none() {
                imp.cb = Some(cb);
            }
        }
    }
}

/// Close-time teardown. Fast submissions are canceled on the spot; slow ones must come home
/// first, so the endgame may wait for the worker.
pub(crate) fn close(lp: &mut Loop, h: Handle) {
    let fast = lp.handles[h.id].flags & POLL_SLOW == 0;
    {
        let imp = poll_mut(lp, h);
        imp.events = 0;
        if fast {
            imp.submitted = [0; 2];
            imp.mask = [0; 2];
        }
    }
    if fast {
        if let Some(watcher) = poll_mut(lp, h).watcher.take() {
            lp.poller.remove(watcher);
        }
    }
    lp.handle_stop(h);
    lp.mark_closing(h);
    let imp = poll_ref(lp, h);
    if imp.submitted[0] == 0 && imp.submitted[1] == 0 {
        lp.want_endgame(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use crate::RunMode;
    use std::cell::RefCell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::rc::Rc;

    #[test]
    fn event_translation() {
        assert_eq!(PollEvents::READABLE.0, revents_to_events(libc::POLLIN));
        assert_eq!(PollEvents::WRITABLE.0, revents_to_events(libc::POLLOUT));
        assert_eq!(
            PollEvents::READABLE.union(PollEvents::DISCONNECT).0,
            revents_to_events(libc::POLLHUP)
        );
        assert_eq!(libc::POLLIN | libc::POLLOUT, events_to_poll_mask(3));
    }

    /// An idle socket reports writable immediately, readable once the peer wrote, and a peer
    /// close surfaces as a disconnect.
    #[test]
    fn socket_readiness() {
        let mut l = Loop::new().unwrap();
        let (ours, theirs) = sys::socketpair_stream().unwrap();
        let h = l.poll_init(ours.as_raw_fd()).unwrap();

        let peer = Rc::new(RefCell::new(Some(std::fs::File::from(theirs))));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let peer2 = Rc::clone(&peer);
        l.poll_start(
            h,
            PollEvents::READABLE
                .union(PollEvents::WRITABLE)
                .union(PollEvents::DISCONNECT),
            move |scope, result| {
                let events = result.unwrap();
                let stage = seen2.borrow().len();
                match stage {
                    0 => {
                        assert!(events.contains(PollEvents::WRITABLE));
                        seen2.borrow_mut().push("writable");
                        let mut peer = peer2.borrow_mut();
                        peer.as_mut().unwrap().write_all(b"x").unwrap();
                    },
                    1 => {
                        // The socket stays writable; wait for the byte to show up
                        if events.contains(PollEvents::READABLE) {
                            seen2.borrow_mut().push("readable");
                            // Hang up; the unread byte stays queued
                            peer2.borrow_mut().take();
                        }
                    },
                    2 => {
                        if events.contains(PollEvents::DISCONNECT) {
                            assert!(events.contains(PollEvents::READABLE));
                            seen2.borrow_mut().push("disconnect");
                            let h = scope.current();
                            scope.poll_stop(h);
                            scope.close(h, None);
                        }
                    },
                    _ => unreachable!(),
                }
            },
        )
        .unwrap();

        l.run(RunMode::Default);
        assert_eq!(vec!["writable", "readable", "disconnect"], *seen.borrow());
    }

    /// A regular file cannot ride epoll; the slow path reports it readable and writable anyway.
    #[test]
    fn slow_path_regular_file() {
        let mut l = Loop::new().unwrap();
        let file = std::fs::File::open("/proc/self/cmdline")
            .or_else(|_| std::fs::File::open("/etc/hostname"))
            .unwrap();
        let h = l.poll_init(file.as_raw_fd()).unwrap();
        assert!(l.handles[h.id].flags & POLL_SLOW != 0);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        l.poll_start(
            h,
            PollEvents::READABLE.union(PollEvents::WRITABLE),
            move |scope, result| {
                let events = result.unwrap();
                seen2.borrow_mut().push(events);
                let h = scope.current();
                scope.poll_stop(h);
                scope.close(h, None);
            },
        )
        .unwrap();
        l.run(RunMode::Default);
        let seen = seen.borrow();
        assert_eq!(1, seen.len());
        assert!(seen[0].contains(PollEvents::READABLE));
    }
}
