//! Zmij is a callback-style asynchronous I/O event loop for Rust.
//!
//! # Motivation
//!
//! Why another event loop library? What is wrong with the others?
//!
//! Well, [mio](https://crates.io/crates/mio) is rather very low level. It's simply a wrapper
//! around epoll or whatever the equivalent is on your system. It's more of a building block for
//! an event loop than being one.
//!
//! The futures-based runtimes offer sophisticated models which work great for network servers.
//! These models turn to a hindrance once trying to write something a bit different. For example,
//! few of them support easy handling of executed subprocesses (which doesn't mean only waiting
//! for them to terminate, but interacting with their stdios as well), or watching a directory,
//! or polling a foreign descriptor somebody else owns.
//!
//! Zmij goes with the good old callback style. Everything lives behind one uniform abstraction:
//! a *handle* is a long-lived thing that can produce events (a socket, a timer, a child process,
//! a watched directory), a *request* is one outstanding operation that completes exactly once (a
//! write, a connect, a piece of work on the thread pool). You create handles on a
//! [Loop](struct.Loop.html), arm them with callbacks and run the loop; the loop multiplexes the
//! whole menagerie over a single readiness poller and calls you back, one callback at a time, on
//! the loop thread.
//!
//! # The iteration
//!
//! Each turn of the loop is strictly phased: due timers fire first, then the queued completions
//! of finished operations, then idle and prepare hooks, then the poller blocks (for exactly as
//! long as the timer heap and the pending work allow), then check hooks run and finally closing
//! handles are finalized. The ordering is observable and part of the contract; see
//! [Loop::run](struct.Loop.html#method.run).
//!
//! # Thread safety
//!
//! The loop is not thread safe, you need a different loop in each thread. Exactly two things may
//! be done from foreign threads: waking an [async handle](struct.AsyncSender.html) and submitting
//! work to the thread pool. Furthermore, due to POSIX limitations, it is possible to handle each
//! signal in only one thread. As handling of child processes contains receiving a SIGCHLD, only
//! one loop per process should spawn children.
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//! use zmij::{Loop, RunMode};
//!
//! let mut lp = Loop::new().unwrap();
//! let timer = lp.timer_init().unwrap();
//! lp.timer_start(timer, Duration::from_millis(10), Duration::ZERO, |scope| {
//!     println!("tick");
//!     let timer = scope.current();
//!     scope.close(timer, None);
//! })
//! .unwrap();
//! lp.run(RunMode::Default);
//! ```

pub mod error;

mod core;
mod fs_event;
mod heap;
mod poll;
mod poller;
mod process;
mod recycler;
mod registry;
mod stream;
mod sys;

pub use crate::core::{AsyncCb, AsyncSender, CloseCb, HookCb, Loop, RunMode, Scope, SignalCb, TimerCb};
pub use crate::error::{Error, Result};
pub use crate::fs_event::{FsEventCb, FsEventFlags};
pub use crate::poll::{PollCb, PollEvents};
pub use crate::process::{kill, ChildExit, ExitCb, ProcessFlags, ProcessOptions, StdioContainer};
pub use crate::registry::wake_all_loops;
pub use crate::stream::{AllocCb, ConnectCb, ConnectionCb, ReadCb, ShutdownCb, WriteCb};

pub use nix::sys::signal::Signal;

/// A token referring to one handle inside one loop.
///
/// Handles are owned by their loop; user code holds these light-weight tokens. A token stays
/// unique for the whole life of its loop: after the handle is closed the token goes stale and
/// the loop detects attempts to use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub(crate) id: usize,
    pub(crate) generation: u64,
}

/// A token referring to one outstanding request (a queued write, a connect, a piece of
/// background work). Requests complete at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

/// The closed set of handle kinds.
///
/// Some kinds exist only so the type can name everything a descriptor may turn out to be (for
/// example in [guess_handle](fn.guess_handle.html)); the loop itself has no operations for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Unknown,
    Async,
    Check,
    FsEvent,
    FsPoll,
    Idle,
    NamedPipe,
    Poll,
    Prepare,
    Process,
    Signal,
    Stream,
    Tcp,
    Timer,
    Tty,
    Udp,
    File,
}

/// Guess what kind of resource a raw descriptor refers to.
///
/// Follows the platform conventions rather than inventing new ones; notably an anonymous
/// UNIX-domain socket (one with an empty address) reports as a named pipe.
pub fn guess_handle(fd: std::os::unix::io::RawFd) -> HandleKind {
    sys::guess_fd_kind(fd)
}
