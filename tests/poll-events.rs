//! Poll-handle readiness over a connected TCP pair, end to end: writable right away, readable
//! once the peer wrote, and a peer close observed as either a disconnect report or a readable
//! whose recv yields end of stream. A second test drives the slow, worker-backed path with a
//! regular file, which the readiness engine refuses to watch directly.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use zmij::{Loop, PollEvents, RunMode};

#[test]
fn tcp_pair_readiness() {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (peer, _) = listener.accept().unwrap();

    let mut l = Loop::new().unwrap();
    // The handle borrows the descriptor; the TcpStream stays ours
    let h = l.poll_init(client.as_raw_fd()).unwrap();

    let stage = Rc::new(Cell::new(0u32));
    let peer = Rc::new(RefCell::new(Some(peer)));
    let client = Rc::new(RefCell::new(client));

    let stage2 = Rc::clone(&stage);
    let peer2 = Rc::clone(&peer);
    let client2 = Rc::clone(&client);
    l.poll_start(
        h,
        PollEvents::READABLE
            .union(PollEvents::WRITABLE)
            .union(PollEvents::DISCONNECT),
        move |scope, result| {
            let events = result.unwrap();
            match stage2.get() {
                0 => {
                    // A fresh connection has send-buffer room immediately
                    assert!(events.contains(PollEvents::WRITABLE));
                    stage2.set(1);
                    peer2.borrow_mut().as_mut().unwrap().write_all(b"x").unwrap();
                },
                1 => {
                    // Writable keeps reporting; wait for the byte to arrive
                    if events.contains(PollEvents::READABLE) {
                        let mut byte = [0u8; 8];
                        assert_eq!(1, client2.borrow_mut().read(&mut byte).unwrap());
                        assert_eq!(b'x', byte[0]);
                        stage2.set(2);
                        // Close the peer; TCP half-close may show as a plain readable
                        peer2.borrow_mut().take();
                    }
                },
                2 => {
                    let hung_up = if events.contains(PollEvents::DISCONNECT) {
                        true
                    } else if events.contains(PollEvents::READABLE) {
                        // Readable with nothing behind it means end of stream
                        let mut byte = [0u8; 8];
                        matches!(client2.borrow_mut().read(&mut byte), Ok(0))
                    } else {
                        false
                    };
                    if hung_up {
                        stage2.set(3);
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

    assert!(!l.run(RunMode::Default));
    assert_eq!(3, stage.get());
}

#[test]
fn regular_file_takes_slow_path() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data");
    std::fs::write(&path, b"payload").unwrap();
    let file = std::fs::File::open(&path).unwrap();

    let mut l = Loop::new().unwrap();
    // epoll refuses regular files, so this registration silently picks the worker-backed path;
    // the observable contract stays the same.
    let h = l.poll_init(file.as_raw_fd()).unwrap();

    let seen = Rc::new(Cell::new(false));
    let seen2 = Rc::clone(&seen);
    l.poll_start(
        h,
        PollEvents::READABLE.union(PollEvents::WRITABLE),
        move |scope, result| {
            let events = result.unwrap();
            // Plain files are always ready
            assert!(events.contains(PollEvents::READABLE));
            seen2.set(true);
            let h = scope.current();
            scope.poll_stop(h);
            scope.close(h, None);
        },
    )
    .unwrap();

    assert!(!l.run(RunMode::Default));
    assert!(seen.get());
}
