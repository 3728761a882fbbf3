//! End-to-end store scenarios: a live server on its own thread, fed
//! through a pipe, queried over its unix socket.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use manifold_store::{Config, Exit, Framing, Server, StoreClient, StoreError, Window};

struct TestStore {
    producer: Option<File>,
    socket_path: PathBuf,
    server: JoinHandle<Result<Exit, StoreError>>,
    _dir: tempfile::TempDir,
}

impl TestStore {
    fn spawn(config: Config) -> TestStore {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("store.sock");

        let (read_end, write_end) = pipe();
        let (bound_tx, bound_rx) = mpsc::channel();
        let server_path = socket_path.clone();
        let server = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let mut server = Server::bind(config, &server_path, read_end)?;
                bound_tx.send(()).unwrap();
                server.run().await
            })
        });
        bound_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("server failed to bind");

        TestStore {
            producer: Some(File::from(write_end)),
            socket_path,
            server,
            _dir: dir,
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.producer.as_mut().unwrap().write_all(bytes).unwrap();
    }

    /// Close the producer side: the server sees EOF.
    fn finish_input(&mut self) {
        self.producer = None;
    }

    fn client(&self) -> StoreClient {
        StoreClient::connect(&self.socket_path).unwrap()
    }

    /// Send `Q` and collect the loop's exit.
    fn quit(self) -> Result<Exit, StoreError> {
        self.client().quit().unwrap();
        self.server.join().unwrap()
    }
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(ret, 0, "pipe failed: {}", std::io::Error::last_os_error());
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

#[test]
fn current_value_is_the_latest_record_framed() {
    let mut store = TestStore::spawn(Config::default());
    store.feed(b"a\nbb\nccc\n");

    // Raw socket, to pin down the exact bytes on the wire.
    let mut raw = UnixStream::connect(&store.socket_path).unwrap();
    raw.write_all(b"C").unwrap();
    let mut response = [0u8; 13];
    raw.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"0000000003ccc");

    // Nothing further arrives before the client closes.
    raw.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let mut extra = [0u8; 1];
    match raw.read(&mut extra) {
        Ok(0) => panic!("server closed before the client"),
        Ok(_) => panic!("unexpected bytes after the response"),
        Err(e) => assert!(matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )),
    }
    drop(raw);

    let exit = store.quit().unwrap();
    assert_eq!(exit, Exit::Quit);
}

#[test]
fn window_selects_records_back_from_the_newest() {
    let mut config = Config::default();
    config.window = Window::new(1, 2).unwrap();
    let mut store = TestStore::spawn(config);
    store.feed(b"a\nbb\nccc\n");

    assert_eq!(store.client().fetch_current().unwrap(), b"bb");
}

#[test]
fn later_records_win() {
    let mut store = TestStore::spawn(Config::default());
    store.feed(b"first\n");
    assert_eq!(store.client().fetch_current().unwrap(), b"first");

    store.feed(b"second\n");
    // The store serves whatever is freshest once the write has landed;
    // poll briefly since the producer pipe is asynchronous.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let value = store.client().fetch_current().unwrap();
        if value == b"second" {
            break;
        }
        assert_eq!(value, b"first");
        assert!(std::time::Instant::now() < deadline, "never saw the update");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn fixed_length_discards_the_trailing_partial_record() {
    let mut store = TestStore::spawn(Config::with_framing(Framing::FixedLength(4)));
    store.feed(b"ABCDEFGHIJ");
    store.finish_input();

    let mut raw = UnixStream::connect(&store.socket_path).unwrap();
    raw.write_all(b"L").unwrap();
    let mut response = [0u8; 14];
    raw.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"0000000004EFGH");
}

#[test]
fn last_value_waits_for_producer_eof() {
    let mut store = TestStore::spawn(Config::default());
    store.feed(b"early\n");

    let (value_tx, value_rx) = mpsc::channel();
    let mut client = store.client();
    let reader = std::thread::spawn(move || {
        value_tx.send(client.fetch_last().unwrap()).unwrap();
    });

    // The L response is gated on EOF, not on data availability.
    assert!(value_rx.recv_timeout(Duration::from_millis(200)).is_err());

    store.feed(b"final\n");
    store.finish_input();
    assert_eq!(
        value_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        b"final"
    );
    reader.join().unwrap();
}

#[test]
fn eof_without_any_separator_serves_all_input() {
    let mut store = TestStore::spawn(Config::default());
    store.feed(b"unterminated");
    store.finish_input();

    assert_eq!(store.client().fetch_last().unwrap(), b"unterminated");
}

#[test]
fn eof_with_no_input_serves_an_empty_record() {
    let mut store = TestStore::spawn(Config::default());
    store.finish_input();

    let mut raw = UnixStream::connect(&store.socket_path).unwrap();
    raw.write_all(b"L").unwrap();
    let mut response = [0u8; 10];
    raw.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"0000000000");
}

#[test]
fn quit_unlinks_the_socket_and_stops_the_loop() {
    let mut store = TestStore::spawn(Config::default());
    store.feed(b"value\n");

    // Another client may be connected and idle; quit wins immediately.
    let _idle = UnixStream::connect(&store.socket_path).unwrap();

    let socket_path = store.socket_path.clone();
    let exit = store.quit().unwrap();
    assert_eq!(exit, Exit::Quit);
    assert!(!socket_path.exists());
}

#[test]
fn records_spanning_many_tiny_buffers_are_served_whole() {
    let mut config = Config::default();
    // Force every record across several buffers.
    config.buffer_capacity = 5;
    let mut store = TestStore::spawn(config);
    store.feed(b"one-long-record-across-buffers\nand-the-second-one\n");

    assert_eq!(
        store.client().fetch_current().unwrap(),
        b"and-the-second-one"
    );
}

#[test]
fn slow_reader_survives_reclamation_of_old_buffers() {
    let mut store = TestStore::spawn(Config::default());

    // A record big enough that the server cannot push it into the socket
    // in one go, so the client stays mid-response.
    let big = vec![b'x'; 1 << 20];
    store.feed(&big);
    store.feed(b"\n");

    let mut slow = UnixStream::connect(&store.socket_path).unwrap();
    slow.write_all(b"C").unwrap();
    let mut header = [0u8; 10];
    slow.read_exact(&mut header).unwrap();
    assert_eq!(&header, b"0001048576");

    // While the slow reader sits on a half-written response, the store
    // keeps consuming input and relocating the current record.
    for _ in 0..64 {
        store.feed(b"newer\n");
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store.client().fetch_current().unwrap() == b"newer" {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "relocation never happened");
        std::thread::sleep(Duration::from_millis(10));
    }

    // The half-sent span was never reclaimed out from under the reader.
    let mut payload = vec![0u8; big.len()];
    slow.read_exact(&mut payload).unwrap();
    assert_eq!(payload, big);
    drop(slow);

    store.quit().unwrap();
}
