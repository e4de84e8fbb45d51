//! A TCP echo conversation inside a single loop: server and client are both handles of the same
//! loop, which exercises listen/accept/connect, ordered writes, reads and the EOF contract end
//! to end.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use zmij::{Error, Loop, RunMode};

#[derive(Default)]
struct ClientState {
    received: Vec<u8>,
    eof_seen: bool,
}

#[test]
fn echo_roundtrip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut l = Loop::new().unwrap();

    // The server: accept one connection and echo what arrives; seeing "QS" closes the
    // connection (the listener stays).
    let server = l.tcp_init().unwrap();
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    l.tcp_bind(server, any).unwrap();
    l.listen(server, 128, move |scope, status| {
        status.unwrap();
        let listener = scope.current();
        let conn = scope.tcp_init().unwrap();
        scope.accept(listener, conn).unwrap();
        scope
            .read_start(
                conn,
                |_, size| vec![0; size],
                move |scope, result, buf| {
                    let conn = scope.current();
                    match result {
                        Ok(0) => (),
                        Ok(n) => {
                            if &buf[..n] == b"QS" {
                                scope.close(conn, None);
                            } else {
                                let payload = buf[..n].to_vec();
                                scope
                                    .write(conn, vec![payload], |_, status| status.unwrap())
                                    .unwrap();
                            }
                        },
                        Err(Error::Eof) => scope.close(conn, None),
                        Err(e) => panic!("server read failed: {}", e),
                    }
                },
            )
            .unwrap();
    })
    .unwrap();
    let addr = l.tcp_getsockname(server).unwrap();

    // The client: say HELLO, wait for the echo, say QS, expect the connection to end.
    let state = Rc::new(RefCell::new(ClientState::default()));
    let client = l.tcp_init().unwrap();
    let state2 = Rc::clone(&state);
    l.tcp_connect(client, addr, move |scope, status| {
        status.unwrap();
        let client = scope.current();
        scope
            .write(client, vec![b"HELLO\n".to_vec()], |_, status| status.unwrap())
            .unwrap();
        let state = state2;
        scope
            .read_start(
                client,
                |_, size| vec![0; size],
                move |scope, result, buf| {
                    let client = scope.current();
                    match result {
                        Ok(0) => (),
                        Ok(n) => {
                            let mut st = state.borrow_mut();
                            st.received.extend_from_slice(&buf[..n]);
                            if st.received == b"HELLO\n" {
                                drop(st);
                                scope
                                    .write(client, vec![b"QS".to_vec()], |_, status| {
                                        status.unwrap()
                                    })
                                    .unwrap();
                            }
                        },
                        Err(Error::Eof) => {
                            state.borrow_mut().eof_seen = true;
                            scope.close(client, None);
                        },
                        Err(e) => panic!("client read failed: {}", e),
                    }
                },
            )
            .unwrap();
    })
    .unwrap();

    // The listener would keep the loop alive forever; fold it up once the client is done.
    let watchdog = l.check_init().unwrap();
    let state3 = Rc::clone(&state);
    l.hook_start(watchdog, move |scope| {
        if state3.borrow().eof_seen {
            let me = scope.current();
            scope.close(server, None);
            scope.close(me, None);
        }
    })
    .unwrap();

    assert!(!l.run(RunMode::Default));
    let state = state.borrow();
    assert_eq!(b"HELLO\n".to_vec(), state.received);
    assert!(state.eof_seen);
}

/// Backpressure bookkeeping: queued bytes are visible through the accessor until the kernel
/// takes them.
#[test]
fn write_queue_accounting() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut l = Loop::new().unwrap();
    let server = l.tcp_init().unwrap();
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    l.tcp_bind(server, any).unwrap();
    l.listen(server, 8, |scope, status| {
        status.unwrap();
        // Accept and park the connection so the peer's send buffer eventually fills
        let listener = scope.current();
        let conn = scope.tcp_init().unwrap();
        scope.accept(listener, conn).unwrap();
    })
    .unwrap();
    let addr = l.tcp_getsockname(server).unwrap();

    let client = l.tcp_init().unwrap();
    l.tcp_connect(client, addr, move |scope, status| {
        status.unwrap();
        let client = scope.current();
        // A burst far beyond any socket buffer; most of it must sit in the queue
        for _ in 0..256 {
            let _ = scope.write(client, vec![vec![0u8; 64 * 1024]], |_, _| ());
        }
        assert!(scope.write_queue_size(client) > 0);
        scope.close(client, None);
        scope.close(server, None);
    })
    .unwrap();

    l.run(RunMode::Default);
}
