//! Tests for child processes, signal delivery and cross-thread wakeups.
//!
//! These run without the normal harness. Signal handling needs the signals masked in every
//! thread of the process, and the threads the harness spawns are outside our reach; a plain
//! `main` keeps the process single-threaded except where the test itself says otherwise. In
//! case of a problem this whole thing simply crashes, which is enough here.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use zmij::{ChildExit, Error, Loop, ProcessOptions, RunMode, StdioContainer};

/// Flood an async handle from another thread; the callback fires at least once, at most once
/// per send, and at least once after the last send.
fn async_flood() {
    let mut l = Loop::new().unwrap();
    let fired = Arc::new(AtomicU32::new(0));

    let fired2 = Arc::clone(&fired);
    let flood = l
        .async_init(move |_| {
            fired2.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    // A second async handle marks the end of the flood; its completion is queued after the
    // flood's last one, so by the time it runs the flood callback has fired.
    let flood_copy = flood;
    let done = l
        .async_init(move |scope| {
            let me = scope.current();
            scope.close(flood_copy, None);
            scope.close(me, None);
        })
        .unwrap();

    let flood_sender = l.async_sender(flood).unwrap();
    let done_sender = l.async_sender(done).unwrap();
    let thread = std::thread::spawn(move || {
        for i in 0..1000 {
            flood_sender.send().unwrap();
            if i % 100 == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        done_sender.send().unwrap();
    });

    l.run(RunMode::Default);
    thread.join().unwrap();

    let count = fired.load(Ordering::Relaxed);
    assert!(count >= 1, "the flood never arrived");
    assert!(count <= 1000, "more callbacks than sends");
}

/// Spawn `echo hello` with its stdout plumbed into a pipe handle; expect the bytes and a clean
/// exit.
fn spawn_echo() {
    let mut l = Loop::new().unwrap();
    let out_pipe = l.pipe_init(false).unwrap();

    let mut options = ProcessOptions::new("echo");
    options.args.push("hello".into());
    options.stdio = vec![
        StdioContainer::Ignore,
        StdioContainer::CreatePipe {
            handle: out_pipe,
            readable: false,
            writable: true,
        },
        StdioContainer::Ignore,
    ];

    let exit_seen = Rc::new(Cell::new(false));
    let exit_seen2 = Rc::clone(&exit_seen);
    let child = l
        .spawn(options, move |scope, exit| {
            assert_eq!(ChildExit::Exited(0), exit);
            exit_seen2.set(true);
            let me = scope.current();
            scope.close(me, None);
        })
        .unwrap();
    assert!(l.process_pid(child).unwrap() > 0);

    let collected = Rc::new(RefCell::new(Vec::new()));
    let collected2 = Rc::clone(&collected);
    l.read_start(
        out_pipe,
        |_, size| vec![0; size],
        move |scope, result, buf| match result {
            Ok(n) => collected2.borrow_mut().extend_from_slice(&buf[..n]),
            Err(Error::Eof) => {
                let me = scope.current();
                scope.close(me, None);
            },
            Err(e) => panic!("pipe read failed: {}", e),
        },
    )
    .unwrap();

    l.run(RunMode::Default);
    assert!(exit_seen.get());
    assert_eq!(b"hello\n".to_vec(), *collected.borrow());
}

/// A long-running child killed by us reports the signal instead of an exit code.
fn kill_child() {
    let mut l = Loop::new().unwrap();
    let mut options = ProcessOptions::new("sleep");
    options.args.push("600".into());

    let seen = Rc::new(Cell::new(false));
    let seen2 = Rc::clone(&seen);
    let child = l
        .spawn(options, move |scope, exit| {
            assert_eq!(ChildExit::Signaled(Signal::SIGTERM), exit);
            seen2.set(true);
            let me = scope.current();
            scope.close(me, None);
        })
        .unwrap();

    l.process_kill(child, Signal::SIGTERM as i32).unwrap();
    l.run(RunMode::Default);
    assert!(seen.get());
}

/// Signal delivery: several recipients of one signal all fire, others stay quiet.
fn signals() {
    let mut l = Loop::new().unwrap();
    let usr1_fired = Rc::new(Cell::new(0u32));
    let usr2_fired = Rc::new(Cell::new(0u32));

    let h1 = l.signal_init().unwrap();
    let usr1_fired2 = Rc::clone(&usr1_fired);
    l.signal_start(h1, Signal::SIGUSR1, move |scope, signal| {
        assert_eq!(Signal::SIGUSR1, signal);
        usr1_fired2.set(usr1_fired2.get() + 1);
        let me = scope.current();
        scope.close(me, None);
    })
    .unwrap();

    for _ in 0..3 {
        let h = l.signal_init().unwrap();
        let usr2_fired2 = Rc::clone(&usr2_fired);
        l.signal_start(h, Signal::SIGUSR2, move |scope, signal| {
            assert_eq!(Signal::SIGUSR2, signal);
            usr2_fired2.set(usr2_fired2.get() + 1);
            let me = scope.current();
            scope.close(me, None);
        })
        .unwrap();
    }

    raise(Signal::SIGUSR2).unwrap();
    while usr2_fired.get() < 3 {
        l.run(RunMode::Once);
    }
    assert_eq!(0, usr1_fired.get());

    raise(Signal::SIGUSR1).unwrap();
    while usr1_fired.get() < 1 {
        l.run(RunMode::Once);
    }
    assert_eq!(1, usr1_fired.get());
    assert_eq!(3, usr2_fired.get());
    // Only the internal wakeup handle is left, so the loop is done
    assert!(!l.run(RunMode::NoWait));
}

fn main() {
    let _ = env_logger::try_init();
    async_flood();
    spawn_echo();
    kill_child();
    signals();
    println!("child-process: all scenarios passed");
}
