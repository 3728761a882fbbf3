//! Blocking client for the store's wire protocol.
//!
//! One connection, one-byte commands, framed responses. The integration
//! tests use it directly; the HTTP façade speaks the same few lines.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::server::CONTENT_LENGTH_DIGITS;

/// A connected store client.
#[derive(Debug)]
pub struct StoreClient {
    stream: UnixStream,
}

impl StoreClient {
    pub fn connect(path: impl AsRef<Path>) -> io::Result<StoreClient> {
        Ok(StoreClient {
            stream: UnixStream::connect(path)?,
        })
    }

    /// `C`: the current value, as soon as one exists.
    pub fn fetch_current(&mut self) -> io::Result<Vec<u8>> {
        self.fetch(b'C')
    }

    /// `L`: the last value, once the producer reached end of file.
    pub fn fetch_last(&mut self) -> io::Result<Vec<u8>> {
        self.fetch(b'L')
    }

    /// `Q`: ask the store to unlink its socket and exit.
    pub fn quit(mut self) -> io::Result<()> {
        self.stream.write_all(b"Q")
    }

    fn fetch(&mut self, command: u8) -> io::Result<Vec<u8>> {
        self.stream.write_all(&[command])?;

        let mut header = [0u8; CONTENT_LENGTH_DIGITS];
        self.stream.read_exact(&mut header)?;
        let length = parse_content_length(&header)?;

        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }
}

fn parse_content_length(header: &[u8]) -> io::Result<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| malformed(header))?;
    text.parse().map_err(|_| malformed(header))
}

fn malformed(header: &[u8]) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed content-length header {header:?}"),
    )
}
