//! A named-pipe server bound to a filesystem path, with a client connecting over the same loop.

use std::cell::Cell;
use std::rc::Rc;

use zmij::{Error, Loop, RunMode};

#[test]
fn pipe_listen_connect() {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zmij.sock");

    let mut l = Loop::new().unwrap();
    let server = l.pipe_init(false).unwrap();
    l.pipe_bind(server, &path).unwrap();
    let greeted = Rc::new(Cell::new(false));
    l.listen(server, 16, move |scope, status| {
        status.unwrap();
        let listener = scope.current();
        let conn = scope.pipe_init(false).unwrap();
        scope.accept(listener, conn).unwrap();
        scope
            .write(conn, vec![b"welcome\n".to_vec()], move |scope, status| {
                status.unwrap();
                let conn = scope.current();
                scope.close(conn, None);
            })
            .unwrap();
    })
    .unwrap();

    let client = l.pipe_init(false).unwrap();
    let greeted2 = Rc::clone(&greeted);
    l.pipe_connect(client, &path, move |scope, status| {
        status.unwrap();
        let client = scope.current();
        let greeted = greeted2;
        scope
            .read_start(
                client,
                |_, size| vec![0; size],
                move |scope, result, buf| {
                    let client = scope.current();
                    match result {
                        Ok(0) => (),
                        Ok(n) => {
                            assert_eq!(b"welcome\n", &buf[..n]);
                            greeted.set(true);
                        },
                        Err(Error::Eof) => {
                            assert!(greeted.get());
                            scope.close(client, None);
                            scope.close(server, None);
                        },
                        Err(e) => panic!("client read failed: {}", e),
                    }
                },
            )
            .unwrap();
    })
    .unwrap();

    assert!(!l.run(RunMode::Default));
    assert!(greeted.get());

    // Binding the same path again collides
    let mut l2 = Loop::new().unwrap();
    let second = l2.pipe_init(false).unwrap();
    assert_eq!(Err(Error::AddrInUse), l2.pipe_bind(second, &path));
}
