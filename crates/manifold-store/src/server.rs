//! The store's event loop.
//!
//! One process, one task. Each wakeup multiplexes readiness of standard
//! input, the listening socket, and every client whose state makes it
//! interesting, then handles exactly one ready descriptor. Conditions are
//! re-derived from scratch on every iteration, which is the level-triggered
//! discipline the client state machine assumes; a rotation keeps one
//! perpetually ready descriptor from starving the rest.

use std::future::Future;
use std::io::{self, IoSlice, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use futures::future::select_all;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tracing::{debug, trace};

use crate::buffer::BufferQueue;
use crate::client::{oldest_writer_seq, Client, ClientState, MAX_CLIENTS};
use crate::config::Config;
use crate::cursor::{self, DataPointer};
use crate::error::StoreError;
use crate::record::{locate, CurrentRecord};

/// Width of the decimal content-length header preceding every response.
pub const CONTENT_LENGTH_DIGITS: usize = 10;

/// Why the loop stopped on its own terms.
#[derive(Debug, PartialEq, Eq)]
pub enum Exit {
    /// A client sent `Q`; the socket path is already unlinked.
    Quit,
}

enum Wake {
    Input,
    Listener,
    Client(usize),
}

enum CommandRead {
    Retry,
    Closed,
    Byte(u8),
}

/// The store: producer input, listener, client table, buffer queue.
pub struct Server {
    config: Config,
    socket_path: PathBuf,
    input: AsyncFd<OwnedFd>,
    listener: AsyncFd<UnixListener>,
    queue: BufferQueue,
    clients: Vec<Option<Client>>,
    current: Option<CurrentRecord>,
    reached_eof: bool,
    rotation: usize,
}

impl Server {
    /// Unlink and recreate the socket, prepare the producer descriptor,
    /// and assemble an empty store.
    pub fn bind(
        config: Config,
        socket_path: impl Into<PathBuf>,
        input: OwnedFd,
    ) -> Result<Server, StoreError> {
        let socket_path = socket_path.into();
        let listener = bind_listener(&socket_path)?;
        let listener = AsyncFd::new(listener).map_err(StoreError::SocketSetup)?;
        set_nonblocking(input.as_raw_fd())
            .map_err(|e| StoreError::io("preparing standard input", e))?;
        let input =
            AsyncFd::new(input).map_err(|e| StoreError::io("preparing standard input", e))?;
        Ok(Server {
            queue: BufferQueue::new(config.framing),
            config,
            socket_path,
            input,
            listener,
            clients: (0..MAX_CLIENTS).map(|_| None).collect(),
            current: None,
            reached_eof: false,
            rotation: 0,
        })
    }

    /// Run until a client quits the store or something fatal happens.
    pub async fn run(&mut self) -> Result<Exit, StoreError> {
        loop {
            let wake = self
                .next_wake()
                .await
                .map_err(|e| StoreError::io("waiting for descriptor readiness", e))?;
            self.rotation = self.rotation.wrapping_add(1);
            match wake {
                Wake::Input => self.read_input()?,
                Wake::Listener => self.accept()?,
                Wake::Client(index) => {
                    if let Some(exit) = self.service_client(index)? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    /// Wait for the next interesting descriptor.
    ///
    /// The interest set is rebuilt from current state on every call, the
    /// way a `select()` loop refills its fd sets: a client in
    /// `SendCurrent` only joins once a record is available, one in
    /// `SendLast` only after producer EOF.
    async fn next_wake(&self) -> io::Result<Wake> {
        let mut waits: Vec<Pin<Box<dyn Future<Output = io::Result<Wake>> + '_>>> = Vec::new();
        if !self.reached_eof {
            waits.push(Box::pin(async {
                self.input.readable().await.map(|_| Wake::Input)
            }));
        }
        waits.push(Box::pin(async {
            self.listener.readable().await.map(|_| Wake::Listener)
        }));
        for (index, slot) in self.clients.iter().enumerate() {
            let Some(client) = slot else { continue };
            match client.state {
                ClientState::ReadCommand | ClientState::WaitClose => {
                    waits.push(Box::pin(async move {
                        client.io.readable().await.map(|_| Wake::Client(index))
                    }));
                }
                ClientState::SendCurrent if self.current.is_some() => {
                    waits.push(Box::pin(async move {
                        client.io.writable().await.map(|_| Wake::Client(index))
                    }));
                }
                ClientState::SendLast if self.reached_eof => {
                    waits.push(Box::pin(async move {
                        client.io.writable().await.map(|_| Wake::Client(index))
                    }));
                }
                ClientState::Sending { .. } => {
                    waits.push(Box::pin(async move {
                        client.io.writable().await.map(|_| Wake::Client(index))
                    }));
                }
                ClientState::SendCurrent | ClientState::SendLast => {}
            }
        }
        let len = waits.len();
        waits.rotate_left(self.rotation % len);
        let (result, _, _) = select_all(waits).await;
        result
    }

    /// Pull one buffer's worth off standard input.
    fn read_input(&mut self) -> Result<(), StoreError> {
        let outcome = {
            let Some(mut guard) = poll_ready_read(&self.input) else {
                return Ok(());
            };
            let mut data = vec![0u8; self.config.buffer_capacity];
            match guard.try_io(|inner| raw_read(inner.get_ref().as_raw_fd(), &mut data)) {
                Err(_would_block) => return Ok(()),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Ok(Err(e)) => return Err(StoreError::io("read from standard input", e)),
                Ok(Ok(n)) => {
                    data.truncate(n);
                    data
                }
            }
        };
        if outcome.is_empty() {
            self.input_eof();
            return Ok(());
        }
        trace!(bytes = outcome.len(), "read from standard input");
        self.queue.push(outcome);
        if let Some(record) = locate(&self.queue, self.config.framing, self.config.window) {
            self.current = Some(record);
        }
        self.reclaim();
        Ok(())
    }

    /// Producer EOF is sticky. If no record was ever located, the whole
    /// input (possibly nothing) becomes the record, so `L` clients are
    /// released instead of waiting forever.
    fn input_eof(&mut self) {
        debug!("end of file on standard input");
        self.reached_eof = true;
        if self.current.is_some() {
            return;
        }
        if self.queue.is_empty() {
            let seq = self.queue.push(Vec::new());
            let dp = DataPointer { seq, pos: 0 };
            self.current = Some(CurrentRecord { begin: dp, end: dp });
            return;
        }
        if let (Some(front), Some(back)) = (self.queue.front(), self.queue.back()) {
            self.current = Some(CurrentRecord {
                begin: DataPointer {
                    seq: front.seq(),
                    pos: 0,
                },
                end: DataPointer {
                    seq: back.seq(),
                    pos: back.len(),
                },
            });
        }
    }

    /// Free buffers preceding both the current record and every in-flight
    /// response.
    fn reclaim(&mut self) {
        let Some(record) = self.current else { return };
        let mut keep = record.begin.seq;
        if let Some(oldest) = oldest_writer_seq(&self.clients) {
            keep = keep.min(oldest);
        }
        let freed = self.queue.reclaim_before(keep);
        if freed > 0 {
            trace!(freed, keep, "reclaimed buffers");
        }
        debug_assert!(
            self.clients.iter().flatten().all(|c| match c.state {
                ClientState::Sending { begin, .. } => self.queue.get(begin.seq).is_some(),
                _ => true,
            }),
            "reclamation passed a live client span"
        );
    }

    /// Take one connection off the listener.
    fn accept(&mut self) -> Result<(), StoreError> {
        let stream = {
            let Some(mut guard) = poll_ready_read(&self.listener) else {
                return Ok(());
            };
            match guard.try_io(|inner| inner.get_ref().accept()) {
                Err(_would_block) => return Ok(()),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Ok(Err(e)) => return Err(StoreError::Accept(e)),
                Ok(Ok((stream, _addr))) => stream,
            }
        };
        let Some(slot) = self.clients.iter().position(|c| c.is_none()) else {
            return Err(StoreError::Usage(format!(
                "maximum number of clients exceeded for socket {}",
                self.socket_path.display()
            )));
        };
        debug!(slot, "accepted client");
        self.clients[slot] =
            Some(Client::new(stream).map_err(|e| StoreError::io("preparing client socket", e))?);
        Ok(())
    }

    /// Dispatch one ready client according to its state.
    fn service_client(&mut self, index: usize) -> Result<Option<Exit>, StoreError> {
        let Some(client) = self.clients[index].as_ref() else {
            return Ok(None);
        };
        match client.state {
            ClientState::ReadCommand | ClientState::WaitClose => self.read_command(index),
            ClientState::SendCurrent if self.current.is_some() => {
                self.start_response(index)?;
                Ok(None)
            }
            ClientState::SendLast if self.reached_eof => {
                self.start_response(index)?;
                Ok(None)
            }
            ClientState::Sending { .. } => {
                self.write_record(index)?;
                Ok(None)
            }
            ClientState::SendCurrent | ClientState::SendLast => Ok(None),
        }
    }

    /// Read and act on a one-byte command.
    fn read_command(&mut self, index: usize) -> Result<Option<Exit>, StoreError> {
        let outcome = {
            let Some(client) = self.clients[index].as_ref() else {
                return Ok(None);
            };
            let Some(mut guard) = poll_ready_read(&client.io) else {
                return Ok(None);
            };
            let mut byte = [0u8; 1];
            match guard.try_io(|inner| {
                let mut stream = inner.get_ref();
                stream.read(&mut byte)
            }) {
                Err(_would_block) => CommandRead::Retry,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => CommandRead::Retry,
                Ok(Err(e)) => return Err(StoreError::io("read from client socket", e)),
                Ok(Ok(0)) => CommandRead::Closed,
                Ok(Ok(_)) => CommandRead::Byte(byte[0]),
            }
        };
        match outcome {
            CommandRead::Retry => Ok(None),
            CommandRead::Closed => {
                debug!(index, "client closed its connection");
                self.clients[index] = None;
                Ok(None)
            }
            CommandRead::Byte(cmd) => {
                trace!(index, cmd = %(cmd as char), "command received");
                match cmd {
                    b'C' => {
                        self.set_client_state(index, ClientState::SendCurrent);
                        Ok(None)
                    }
                    b'L' => {
                        self.set_client_state(index, ClientState::SendLast);
                        Ok(None)
                    }
                    b'Q' => {
                        debug!("quit requested; unlinking socket");
                        let _ = std::fs::remove_file(&self.socket_path);
                        Ok(Some(Exit::Quit))
                    }
                    other => Err(StoreError::Protocol(format!(
                        "unknown command [{}]",
                        other as char
                    ))),
                }
            }
        }
    }

    /// Freeze the current record into the client and push the first chunk.
    fn start_response(&mut self, index: usize) -> Result<(), StoreError> {
        let Some(record) = self.current else {
            return Ok(());
        };
        self.set_client_state(
            index,
            ClientState::Sending {
                begin: record.begin,
                end: record.end,
                header_sent: false,
            },
        );
        self.write_record(index)
    }

    /// Push response bytes to one sending client.
    ///
    /// The first successful write carries the 10-digit content length and
    /// the first payload chunk in a single scattered write; a short write
    /// inside the header is fatal, short payload writes resume later.
    fn write_record(&mut self, index: usize) -> Result<(), StoreError> {
        let Some(client) = self.clients[index].as_ref() else {
            return Ok(());
        };
        let ClientState::Sending {
            begin,
            end,
            header_sent,
        } = client.state
        else {
            return Ok(());
        };

        let buf = self
            .queue
            .get(begin.seq)
            .expect("sending span references a reclaimed buffer");
        let chunk_end = if begin.seq == end.seq { end.pos } else { buf.len() };
        let chunk = &buf.data()[begin.pos..chunk_end];

        let wrote = {
            let Some(mut guard) = poll_ready_write(&client.io) else {
                return Ok(());
            };
            let result = if header_sent {
                guard.try_io(|inner| {
                    let mut stream = inner.get_ref();
                    stream.write(chunk)
                })
            } else {
                let length = cursor::distance(&self.queue, begin, end);
                let header = format!("{length:010}");
                let iov = [IoSlice::new(header.as_bytes()), IoSlice::new(chunk)];
                guard.try_io(|inner| {
                    let mut stream = inner.get_ref();
                    stream.write_vectored(&iov)
                })
            };
            match result {
                Err(_would_block) => return Ok(()),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Ok(Err(e)) => return Err(StoreError::io("write to client socket", e)),
                Ok(Ok(n)) => n,
            }
        };

        let payload_bytes = if header_sent {
            wrote
        } else {
            if wrote < CONTENT_LENGTH_DIGITS {
                return Err(StoreError::Protocol(format!(
                    "short content length header write: {wrote}"
                )));
            }
            wrote - CONTENT_LENGTH_DIGITS
        };
        trace!(index, bytes = payload_bytes, "wrote response bytes");

        let mut advanced = begin;
        advanced.pos += payload_bytes;

        let state = if advanced.pos < buf.len()
            && (advanced.seq != end.seq || advanced.pos < end.pos)
        {
            // More to write from this buffer.
            ClientState::Sending {
                begin: advanced,
                end,
                header_sent: true,
            }
        } else if advanced.seq != end.seq {
            ClientState::Sending {
                begin: DataPointer {
                    seq: advanced.seq + 1,
                    pos: 0,
                },
                end,
                header_sent: true,
            }
        } else {
            debug!(index, "response complete");
            ClientState::WaitClose
        };
        self.set_client_state(index, state);
        Ok(())
    }

    fn set_client_state(&mut self, index: usize, state: ClientState) {
        if let Some(client) = self.clients[index].as_mut() {
            client.state = state;
        }
    }
}

/// Create the listening socket the way the exit-code contract demands:
/// socket creation, bind, and listen each fail distinctly.
fn bind_listener(path: &Path) -> Result<UnixListener, StoreError> {
    let _ = std::fs::remove_file(path);

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(StoreError::SocketSetup(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(StoreError::Usage(format!(
            "socket path {} is too long",
            path.display()
        )));
    }
    for (slot, byte) in addr.sun_path.iter_mut().zip(bytes) {
        *slot = *byte as libc::c_char;
    }

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(StoreError::io(
            format!("error binding socket to unix domain address {}", path.display()),
            io::Error::last_os_error(),
        ));
    }

    if unsafe { libc::listen(fd.as_raw_fd(), 5) } < 0 {
        return Err(StoreError::Listen(io::Error::last_os_error()));
    }

    set_nonblocking(fd.as_raw_fd()).map_err(StoreError::SocketSetup)?;
    Ok(unsafe { UnixListener::from_raw_fd(fd.into_raw_fd()) })
}

/// Consume cached read readiness without blocking. `None` means the wake
/// was stale; the next loop iteration will wait properly.
fn poll_ready_read<T: AsRawFd>(fd: &AsyncFd<T>) -> Option<AsyncFdReadyGuard<'_, T>> {
    let mut cx = Context::from_waker(Waker::noop());
    match fd.poll_read_ready(&mut cx) {
        Poll::Ready(Ok(guard)) => Some(guard),
        Poll::Ready(Err(_)) | Poll::Pending => None,
    }
}

fn poll_ready_write<T: AsRawFd>(fd: &AsyncFd<T>) -> Option<AsyncFdReadyGuard<'_, T>> {
    let mut cx = Context::from_waker(Waker::noop());
    match fd.poll_write_ready(&mut cx) {
        Poll::Ready(Ok(guard)) => Some(guard),
        Poll::Ready(Err(_)) | Poll::Pending => None,
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
