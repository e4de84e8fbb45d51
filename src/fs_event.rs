//! Filesystem change notifications.
//!
//! Each watcher owns its own inotify instance, registered with the poller like any other
//! descriptor. When the kernel queues change records the loop drains them, translates each into
//! a `(filename, rename-or-change)` pair and calls back once per record. Watching a single file
//! filters the records down to that one name.

use std::ffi::OsString;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use log::trace;

use crate::core::{HandleImp, Scope, CLOSING};
use crate::error::{Error, Result};
use crate::poller::{InterestMask, WatcherId};
use crate::sys;
use crate::{Handle, HandleKind, Loop};

/// Change notification kinds reported by a filesystem watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsEventFlags(pub u32);

impl FsEventFlags {
    pub const RENAME: FsEventFlags = FsEventFlags(1);
    pub const CHANGE: FsEventFlags = FsEventFlags(2);

    pub fn contains(self, other: FsEventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: FsEventFlags) -> FsEventFlags {
        FsEventFlags(self.0 | other.0)
    }
}

/// Callback of a filesystem watcher: the changed name (when known) and what happened to it.
pub type FsEventCb = Box<dyn FnMut(&mut Scope, Result<(Option<OsString>, FsEventFlags)>)>;

const EVENT_BUF_SIZE: usize = 4096;

const WATCH_MASK: u32 = libc::IN_ATTRIB
    | libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_DELETE_SELF
    | libc::IN_MODIFY
    | libc::IN_MOVE_SELF
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO;

pub(crate) struct FsEventImp {
    inotify: Option<OwnedFd>,
    watcher: Option<WatcherId>,
    /// Set when the watched path is a single file; records for other names are dropped and
    /// records without a name report this one.
    filename: Option<OsString>,
    cb: Option<FsEventCb>,
}

impl FsEventImp {
    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.inotify.as_ref().map(|fd| fd.as_raw_fd())
    }
}

fn fs_event_mut(lp: &mut Loop, h: Handle) -> &mut FsEventImp {
    match &mut lp.handles[h.id].imp {
        HandleImp::FsEvent(f) => f,
        _ => unreachable!(),
    }
}

impl Loop {
    /// Create a filesystem watcher handle.
    pub fn fs_event_init(&mut self) -> Result<Handle> {
        Ok(self.handle_init(
            HandleKind::FsEvent,
            HandleImp::FsEvent(FsEventImp {
                inotify: None,
                watcher: None,
                filename: None,
                cb: None,
            }),
        ))
    }

    /// Start watching a path. Directories report changes to their entries by name; a file
    /// reports changes to itself.
    pub fn fs_event_start<F>(&mut self, h: Handle, path: &Path, cb: F) -> Result<()>
    where
        F: FnMut(&mut Scope, Result<(Option<OsString>, FsEventFlags)>) + 'static,
    {
        let slot = self.checked_slot(h, HandleKind::FsEvent);
        if slot.flags & CLOSING != 0 {
            return Err(Error::Inval);
        }
        if fs_event_mut(self, h).inotify.is_some() {
            return Err(Error::Busy);
        }

        let meta = std::fs::metadata(path).map_err(Error::from)?;
        let filename = if meta.is_dir() {
            None
        } else {
            path.file_name().map(OsString::from)
        };

        let inotify = sys::inotify_init()?;
        sys::inotify_add_watch(inotify.as_raw_fd(), path, WATCH_MASK)?;
        let watcher = self.poller.add(inotify.as_raw_fd(), h, InterestMask::READ)?;

        let imp = fs_event_mut(self, h);
        imp.inotify = Some(inotify);
        imp.watcher = Some(watcher);
        imp.filename = filename;
        imp.cb = Some(Box::new(cb));
        self.handle_start(h);
        trace!("watching {:?} with {:?}", path, h);
        Ok(())
    }

    /// Stop watching. Idempotent; the handle can be started again on another path.
    pub fn fs_event_stop(&mut self, h: Handle) {
        self.checked_slot(h, HandleKind::FsEvent);
        let watcher = fs_event_mut(self, h).watcher.take();
        if let Some(id) = watcher {
            self.poller.remove(id);
        }
        let imp = fs_event_mut(self, h);
        imp.inotify = None;
        imp.filename = None;
        self.handle_stop(h);
    }
}

/// The inotify descriptor went readable: parse the queued records and call back per record.
pub(crate) fn process_io(lp: &mut Loop, h: Handle) {
    let mut buf = [0u8; EVENT_BUF_SIZE];
    loop {
        if !lp.handles.valid_gen(h.id, h.generation) || lp.handles[h.id].flags & CLOSING != 0 {
            return;
        }
        let fd = match fs_event_mut(lp, h).fd() {
            Some(fd) => fd,
            None => return,
        };
        let n = match sys::read(fd, &mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(Error::Again) => return,
            Err(e) => {
                invoke_fs_event_cb(lp, h, Err(e));
                return;
            },
        };

        let mut offset = 0;
        while offset + mem::size_of::<libc::inotify_event>() <= n {
            // The records are variable length: a fixed header plus a NUL-padded name
            let header: libc::inotify_event = unsafe {
                std::ptr::read_unaligned(buf[offset..].as_ptr() as *const libc::inotify_event)
            };
            let name_start = offset + mem::size_of::<libc::inotify_event>();
            let name_end = name_start + header.len as usize;
            if name_end > n {
                break;
            }
            offset = name_end;

            if header.mask & libc::IN_IGNORED != 0 {
                continue;
            }
            let name = if header.len > 0 {
                let raw = &buf[name_start..name_end];
                let trimmed = match raw.iter().position(|b| *b == 0) {
                    Some(pos) => &raw[..pos],
                    None => raw,
                };
                Some(OsString::from(sys::os_str_from_bytes(trimmed)))
            } else {
                None
            };

            let flags = if header.mask & (libc::IN_ATTRIB | libc::IN_MODIFY) != 0 {
                FsEventFlags::CHANGE
            } else {
                FsEventFlags::RENAME
            };

            let reported = {
                let imp = fs_event_mut(lp, h);
                match (&imp.filename, &name) {
                    // Watching one file: records that name someone else are not ours
                    (Some(want), Some(got)) if want != got => continue,
                    (Some(want), _) => Some(want.clone()),
                    (None, _) => name,
                }
            };

            invoke_fs_event_cb(lp, h, Ok((reported, flags)));
        }
    }
}

fn invoke_fs_event_cb(lp: &mut Loop, h: Handle, event: Result<(Option<OsString>, FsEventFlags)>) {
    if !lp.handles.valid_gen(h.id, h.generation) || lp.handles[h.id].flags & CLOSING != 0 {
        return;
    }
    let cb = fs_event_mut(lp, h).cb.take();
    if let Some(mut cb) = cb {
        {
            let mut scope = Scope {
                lp: &mut *lp,
                handle: h,
            };
            cb(&mut scope, event);
        }
        if lp.handles.valid_gen(h.id, h.generation) {
            let imp = fs_event_mut(lp, h);
            if imp.cb.is_none() {
                imp.cb = Some(cb);
            }
        }
    }
}

pub(crate) fn close(lp: &mut Loop, h: Handle) {
    let watcher = fs_event_mut(lp, h).watcher.take();
    if let Some(id) = watcher {
        lp.poller.remove(id);
    }
    let imp = fs_event_mut(lp, h);
    imp.inotify = None;
    imp.cb = None;
    lp.handle_stop(h);
    lp.mark_closing(h);
    lp.want_endgame(h);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RunMode;
    use std::cell::RefCell;
    use std::io::Write;
    use std::path::PathBuf;
    use std::rc::Rc;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("zmij-fsevent-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Creating and modifying files in a watched directory reports renames and changes.
    #[test]
    fn directory_events() {
        let dir = scratch_dir("dir");
        let mut l = Loop::new().unwrap();
        let watcher = l.fs_event_init().unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        l.fs_event_start(watcher, &dir, move |scope, event| {
            let (name, flags) = event.unwrap();
            seen2.borrow_mut().push((name, flags));
            if seen2.borrow().len() >= 2 {
                let h = scope.current();
                scope.fs_event_stop(h);
                scope.close(h, None);
            }
        })
        .unwrap();

        // Touch the directory from a timer so the loop is already watching
        let dir2 = dir.clone();
        let timer = l.timer_init().unwrap();
        l.timer_start(
            timer,
            std::time::Duration::from_millis(10),
            std::time::Duration::ZERO,
            move |scope| {
                let path = dir2.join("brand-new");
                let mut f = std::fs::File::create(&path).unwrap();
                f.write_all(b"contents").unwrap();
                let h = scope.current();
                scope.close(h, None);
            },
        )
        .unwrap();

        l.run(RunMode::Default);
        let seen = seen.borrow();
        assert!(seen.len() >= 2);
        assert_eq!(
            Some(OsString::from("brand-new")),
            seen[0].0.clone()
        );
        assert_eq!(FsEventFlags::RENAME, seen[0].1); // Creation reports as a rename
        assert!(seen.iter().any(|(_, f)| *f == FsEventFlags::CHANGE));
        let _ = std::fs::remove_dir_all(&dir);
    }

    /// Watching one file filters out the neighbors.
    #[test]
    fn single_file_filter() {
        let dir = scratch_dir("file");
        let target = dir.join("target");
        std::fs::write(&target, b"x").unwrap();

        let mut l = Loop::new().unwrap();
        let watcher = l.fs_event_init().unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        l.fs_event_start(watcher, &target, move |scope, event| {
            let (name, flags) = event.unwrap();
            seen2.borrow_mut().push((name, flags));
            let h = scope.current();
            scope.fs_event_stop(h);
            scope.close(h, None);
        })
        .unwrap();

        let target2 = target.clone();
        let timer = l.timer_init().unwrap();
        l.timer_start(
            timer,
            std::time::Duration::from_millis(10),
            std::time::Duration::ZERO,
            move |scope| {
                std::fs::write(&target2, b"updated").unwrap();
                let h = scope.current();
                scope.close(h, None);
            },
        )
        .unwrap();

        l.run(RunMode::Default);
        let seen = seen.borrow();
        assert_eq!(1, seen.len());
        assert_eq!(Some(OsString::from("target")), seen[0].0.clone());
        assert_eq!(FsEventFlags::CHANGE, seen[0].1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
