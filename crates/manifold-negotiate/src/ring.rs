//! Descriptor-level transport for the negotiation ring.
//!
//! A [`Ring`] wraps the tool's graph-aware descriptors in
//! `tokio::io::unix::AsyncFd` and speaks framed message blocks over them:
//! read from whichever side produces bytes first, write whole blocks to a
//! chosen side. The shell connects neighboring tools with socketpairs, so
//! traffic (and later, passed descriptors) can flow both ways on each.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tracing::trace;

use manifold_wire::{codec, MessageBlock, Side, HEADER_LEN};

use crate::error::NegotiateError;
use crate::fdpass;

/// The two negotiation descriptors, non-blocking and readiness-driven.
/// A side that is not graph-aware is absent and never touched.
pub struct Ring {
    sides: [Option<AsyncFd<OwnedFd>>; 2],
}

impl Ring {
    /// Wrap the given descriptors. Each present descriptor is switched to
    /// non-blocking mode and registered with the runtime's reactor.
    pub fn new(input: Option<OwnedFd>, output: Option<OwnedFd>) -> io::Result<Ring> {
        let wrap = |fd: OwnedFd| -> io::Result<AsyncFd<OwnedFd>> {
            set_nonblocking(fd.as_raw_fd())?;
            AsyncFd::new(fd)
        };
        Ok(Ring {
            sides: [input.map(wrap).transpose()?, output.map(wrap).transpose()?],
        })
    }

    /// Duplicate the process's standard descriptors into a ring, taking
    /// only the graph-aware sides.
    pub fn from_stdio(graph_in: bool, graph_out: bool) -> io::Result<Ring> {
        let input = if graph_in { Some(dup_fd(0)?) } else { None };
        let output = if graph_out { Some(dup_fd(1)?) } else { None };
        Ring::new(input, output)
    }

    fn side(&self, side: Side) -> Result<&AsyncFd<OwnedFd>, NegotiateError> {
        self.sides[side.index()].as_ref().ok_or_else(|| {
            NegotiateError::protocol(format!("no graph-aware descriptor on the {side} side"))
        })
    }

    /// Read one complete message block from whichever side delivers bytes
    /// first. Returns the decoded block and the side it arrived on.
    pub async fn read_block(&self) -> Result<(MessageBlock, Side), NegotiateError> {
        let (side, mut buf) = self.await_first_chunk().await?;
        if buf.len() < HEADER_LEN {
            self.read_exact(side, &mut buf, HEADER_LEN).await?;
        }
        let total = codec::declared_total_size(&buf[..HEADER_LEN])?;
        self.read_exact(side, &mut buf, total).await?;
        let block = codec::decode(&buf)?;
        trace!(bytes = total, %side, "read message block");
        Ok((block, side))
    }

    /// Write a complete block to one side, resuming across short writes.
    pub async fn write_block(&self, bytes: &[u8], side: Side) -> Result<(), NegotiateError> {
        let fd = self.side(side)?;
        let mut written = 0;
        while written < bytes.len() {
            let mut guard = fd
                .writable()
                .await
                .map_err(|e| NegotiateError::io("waiting to write negotiation descriptor", e))?;
            match guard.try_io(|inner| raw_write(inner.get_ref().as_raw_fd(), &bytes[written..])) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    return Err(NegotiateError::io("writing negotiation descriptor", e));
                }
                Err(_would_block) => continue,
            }
        }
        trace!(bytes = bytes.len(), %side, "wrote message block");
        Ok(())
    }

    /// Pass a descriptor to the peer on `side`.
    pub async fn send_fd(&self, side: Side, fd: BorrowedFd<'_>) -> Result<(), NegotiateError> {
        let sock = self.side(side)?;
        loop {
            let mut guard = sock
                .writable()
                .await
                .map_err(|e| NegotiateError::io("waiting to pass descriptor", e))?;
            match guard.try_io(|inner| fdpass::send_fd(inner.get_ref().as_raw_fd(), fd.as_raw_fd()))
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(NegotiateError::io("passing descriptor", e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive a descriptor from the peer on `side`.
    ///
    /// A leftover end-stamped block may still sit ahead of the descriptor
    /// message in the socket buffer (rings with cycles deliver the end
    /// twice); such blocks are consumed and discarded.
    pub async fn recv_fd(&self, side: Side) -> Result<OwnedFd, NegotiateError> {
        loop {
            let sock = self.side(side)?;
            let received = loop {
                let mut guard = sock
                    .readable()
                    .await
                    .map_err(|e| NegotiateError::io("waiting to receive descriptor", e))?;
                match guard.try_io(|inner| fdpass::recv_fd(inner.get_ref().as_raw_fd())) {
                    Ok(Ok(received)) => break received,
                    Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Ok(Err(e)) => return Err(NegotiateError::io("receiving descriptor", e)),
                    Err(_would_block) => continue,
                }
            };
            match received {
                fdpass::Received::Fd(fd) => return Ok(fd),
                fdpass::Received::Stray(first_byte) => {
                    self.discard_block(side, first_byte).await?;
                }
            }
        }
    }

    /// Consume the remainder of a block whose first byte was already read.
    async fn discard_block(&self, side: Side, first_byte: u8) -> Result<(), NegotiateError> {
        let mut buf = vec![first_byte];
        self.read_exact(side, &mut buf, HEADER_LEN).await?;
        let total = codec::declared_total_size(&buf[..HEADER_LEN])?;
        self.read_exact(side, &mut buf, total).await?;
        trace!(bytes = total, %side, "discarded leftover block during descriptor exchange");
        Ok(())
    }

    /// Wait for either side to produce bytes and return the first chunk
    /// (at most a header's worth, so a chunk never crosses a block
    /// boundary).
    async fn await_first_chunk(&self) -> Result<(Side, Vec<u8>), NegotiateError> {
        loop {
            let (guard, side) = match (&self.sides[0], &self.sides[1]) {
                (Some(input), Some(output)) => {
                    tokio::select! {
                        guard = input.readable() => (guard, Side::Input),
                        guard = output.readable() => (guard, Side::Output),
                    }
                }
                (Some(input), None) => (input.readable().await, Side::Input),
                (None, Some(output)) => (output.readable().await, Side::Output),
                (None, None) => {
                    return Err(NegotiateError::protocol(
                        "no graph-aware descriptor to read from",
                    ));
                }
            };
            let mut guard =
                guard.map_err(|e| NegotiateError::io("waiting on negotiation descriptors", e))?;
            let mut chunk = vec![0u8; HEADER_LEN];
            match guard.try_io(|inner| raw_read(inner.get_ref().as_raw_fd(), &mut chunk)) {
                Ok(Ok(0)) => {
                    return Err(NegotiateError::io(
                        "reading negotiation descriptor",
                        io::Error::new(io::ErrorKind::UnexpectedEof, "peer left the ring"),
                    ));
                }
                Ok(Ok(n)) => {
                    chunk.truncate(n);
                    return Ok((side, chunk));
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(NegotiateError::io("reading negotiation descriptor", e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Grow `buf` to `target` bytes by reading from one committed side.
    async fn read_exact(
        &self,
        side: Side,
        buf: &mut Vec<u8>,
        target: usize,
    ) -> Result<(), NegotiateError> {
        let fd = self.side(side)?;
        let mut filled = buf.len();
        buf.resize(target, 0);
        while filled < target {
            let mut guard = fd
                .readable()
                .await
                .map_err(|e| NegotiateError::io("waiting on negotiation descriptor", e))?;
            match guard.try_io(|inner| raw_read(inner.get_ref().as_raw_fd(), &mut buf[filled..])) {
                Ok(Ok(0)) => {
                    return Err(NegotiateError::io(
                        "reading negotiation descriptor",
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer left the ring mid-block",
                        ),
                    ));
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(NegotiateError::io("reading negotiation descriptor", e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
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

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn dup_fd(fd: RawFd) -> io::Result<OwnedFd> {
    let ret = unsafe { libc::dup(fd) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(ret) })
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
