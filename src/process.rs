//! Child processes: spawning with plumbed stdio, termination signals, exit notification.
//!
//! Exit notification rides the loop's SIGCHLD handling: the signal descriptor reports the
//! signal, the loop reaps every finished child with `waitpid` and the matching process handle
//! gets its exit callback through the ordinary completion queue. Spawning therefore enables
//! SIGCHLD handling before the fork, so a child that dies instantly cannot slip past its
//! notification.

use std::ffi::OsString;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use log::debug;
use nix::sys::signal::{kill as nix_kill, Signal};
use nix::unistd::Pid;

use crate::core::{HandleImp, Scope, CLOSING};
use crate::error::{Error, Result};
use crate::sys;
use crate::{Handle, HandleKind, Loop};

/// How did the child exit?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// A normal exit, with the given exit code.
    Exited(i32),
    /// Death caused by a signal.
    Signaled(Signal),
}

/// Callback invoked once the child terminated.
pub type ExitCb = Box<dyn FnMut(&mut Scope, ChildExit)>;

/// Spawn flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessFlags(pub u32);

impl ProcessFlags {
    pub const NONE: ProcessFlags = ProcessFlags(0);
    /// Start the child in its own session, detached from the controlling terminal.
    pub const DETACHED: ProcessFlags = ProcessFlags(1);

    pub fn contains(self, other: ProcessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// What the child finds at one slot of its descriptor table.
pub enum StdioContainer {
    /// The slot points at the null device.
    Ignore,
    /// The slot inherits a descriptor of this process.
    InheritFd(RawFd),
    /// The slot inherits the descriptor behind one of our stream handles.
    InheritStream(Handle),
    /// A fresh pipe pair; the child gets one end, the given pipe handle adopts the other.
    /// `readable`/`writable` describe the child's view of its end.
    CreatePipe {
        handle: Handle,
        readable: bool,
        writable: bool,
    },
}

/// Everything a spawn needs to know.
pub struct ProcessOptions {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// `None` inherits this process's environment wholesale.
    pub env: Option<Vec<(OsString, OsString)>>,
    pub cwd: Option<PathBuf>,
    pub flags: ProcessFlags,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Slot `i` becomes descriptor `i` of the child. Missing slots up to stderr default to
    /// [Ignore](enum.StdioContainer.html). At most 256 entries.
    pub stdio: Vec<StdioContainer>,
}

impl ProcessOptions {
    pub fn new<S: Into<OsString>>(program: S) -> Self {
        ProcessOptions {
            program: program.into(),
            args: Vec::new(),
            env: None,
            cwd: None,
            flags: ProcessFlags::NONE,
            uid: None,
            gid: None,
            stdio: Vec::new(),
        }
    }
}

pub(crate) struct ProcessImp {
    pid: libc::pid_t,
    pub(crate) exit_cb: Option<ExitCb>,
}

fn process_mut(lp: &mut Loop, h: Handle) -> &mut ProcessImp {
    match &mut lp.handles[h.id].imp {
        HandleImp::Process(p) => p,
        _ => unreachable!(),
    }
}

impl Loop {
    /// Spawn a child process.
    ///
    /// On success the returned handle is active until the exit callback has fired; close it
    /// whenever convenient after (or before) that. When any stdio slot fails to set up, every
    /// descriptor created so far is released again, nothing is spawned and the error is
    /// returned.
    pub fn spawn<F>(&mut self, options: ProcessOptions, exit_cb: F) -> Result<Handle>
    where
        F: FnMut(&mut Scope, ChildExit) + 'static,
    {
        assert!(options.stdio.len() <= 256, "too many stdio slots");
        // The reaper must be listening before the child can possibly die
        self.signal_enable(Signal::SIGCHLD)?;

        let slot_count = options.stdio.len().max(3);

        // Build the child's descriptor table in the parent. Everything is owned here, so a
        // failure on slot N releases slots 0..N on the way out.
        let mut child_fds: Vec<OwnedFd> = Vec::with_capacity(slot_count);
        for (i, slot) in options.stdio.iter().enumerate() {
            let fd = match slot {
                StdioContainer::Ignore => sys::open_devnull()?,
                StdioContainer::InheritFd(fd) => sys::dup_cloexec_above(*fd, slot_count as RawFd)?,
                StdioContainer::InheritStream(h) => {
                    let fd = self.handle_fd(*h)?;
                    sys::dup_cloexec_above(fd, slot_count as RawFd)?
                },
                StdioContainer::CreatePipe {
                    handle,
                    readable,
                    writable,
                } => {
                    let _ = (readable, writable); // Both ends of a socketpair go both ways
                    let (parent_end, child_end) = sys::socketpair_stream()?;
                    let child_end = sys::dup_cloexec_above(child_end.as_raw_fd(), slot_count as RawFd)?;
                    self.pipe_open(*handle, parent_end)?;
                    child_end
                },
            };
            debug_assert!(fd.as_raw_fd() >= 0, "stdio slot {} without descriptor", i);
            child_fds.push(fd);
        }
        for _ in options.stdio.len()..slot_count {
            child_fds.push(sys::open_devnull()?);
        }

        let mut cmd = Command::new(&options.program);
        cmd.args(&options.args);
        if let Some(env) = &options.env {
            cmd.env_clear();
            cmd.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(uid) = options.uid {
            cmd.uid(uid);
        }
        if let Some(gid) = options.gid {
            cmd.gid(gid);
        }

        let detached = options.flags.contains(ProcessFlags::DETACHED);
        let raw_table: Vec<RawFd> = child_fds.iter().map(|fd| fd.as_raw_fd()).collect();
        // Runs in the child between fork and exec: undo the loop's signal mask, wire the
        // descriptor table, then maybe leave the session. dup2 also clears close-on-exec on the
        // target. Only async-signal-safe calls are allowed in here.
        unsafe {
            cmd.pre_exec(move || {
                let mut empty: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut empty);
                libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
                for (target, src) in raw_table.iter().enumerate() {
                    if libc::dup2(*src, target as RawFd) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if detached && libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(Error::from)?;
        let pid = child.id() as libc::pid_t;
        // The loop reaps through waitpid(-1); the std handle must not try again later
        drop(child);
        drop(child_fds);

        debug!("spawned {:?} as pid {}", options.program, pid);
        let h = self.handle_init(
            HandleKind::Process,
            HandleImp::Process(ProcessImp {
                pid,
                exit_cb: Some(Box::new(exit_cb)),
            }),
        );
        self.children.insert(pid, h);
        self.handle_start(h);
        Ok(h)
    }

    /// The child's process id.
    pub fn process_pid(&self, h: Handle) -> Result<i32> {
        if !self.is_valid(h) {
            return Err(Error::Missing);
        }
        match &self.handles[h.id].imp {
            HandleImp::Process(p) => Ok(p.pid),
            _ => Err(Error::Inval),
        }
    }

    /// Send a signal to the child behind the handle.
    pub fn process_kill(&mut self, h: Handle, signum: i32) -> Result<()> {
        let pid = self.process_pid(h)?;
        kill(pid, signum)
    }
}

/// Send a signal to an arbitrary process. `signum` 0 probes for liveness without delivering
/// anything; a number no signal corresponds to reports `Nosys`.
pub fn kill(pid: i32, signum: i32) -> Result<()> {
    let target = Pid::from_raw(pid);
    if signum == 0 {
        return nix_kill(target, None).map_err(Error::from);
    }
    let signal = Signal::try_from(signum).map_err(|_| Error::Nosys)?;
    nix_kill(target, signal).map_err(Error::from)
}

/// The reaper found our child. Deliver the exit, unless the user is already closing the handle.
pub(crate) fn process_exit(lp: &mut Loop, h: Handle, exit: ChildExit) {
    lp.handle_stop(h);
    if lp.handles[h.id].flags & CLOSING != 0 {
        return;
    }
    let cb = process_mut(lp, h).exit_cb.take();
    if let Some(mut cb) = cb {
        {
            let mut scope = Scope {
                lp: &mut *lp,
                handle: h,
            };
            cb(&mut scope, exit);
        }
        if lp.handles.valid_gen(h.id, h.generation) {
            let imp = process_mut(lp, h);
            if imp.exit_cb.is_none() {
                imp.exit_cb = Some(cb);
            }
        }
    }
}

pub(crate) fn close(lp: &mut Loop, h: Handle) {
    let pid = match &lp.handles[h.id].imp {
        HandleImp::Process(p) => p.pid,
        _ => unreachable!(),
    };
    // A still-running child keeps being reaped by the loop, it just tells nobody
    lp.children.remove(&pid);
    lp.handle_stop(h);
    lp.mark_closing(h);
    lp.want_endgame(h);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_translation() {
        // Probing our own pid with signal 0 succeeds
        assert_eq!(Ok(()), kill(std::process::id() as i32, 0));
        // A nonexistent signal number is refused before reaching the kernel
        assert_eq!(Err(Error::Nosys), kill(std::process::id() as i32, 4096));
        // Probing a hopefully-unused pid reports ESRCH
        assert_eq!(Err(Error::Srch), kill(0x7fff_fff0, 0));
    }

    #[test]
    fn options_builder() {
        let opts = ProcessOptions::new("echo");
        assert!(opts.args.is_empty());
        assert!(opts.env.is_none());
        assert!(!opts.flags.contains(ProcessFlags::DETACHED));
    }
}
