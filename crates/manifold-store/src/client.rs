//! Per-connection client state.

use std::io;
use std::os::unix::net::UnixStream;

use tokio::io::unix::AsyncFd;

use crate::cursor::DataPointer;

/// Concurrent-connection cap. A full table is a hard error, not a queue.
pub const MAX_CLIENTS: usize = 64;

/// Where one connection stands.
///
/// A free slot is simply absent from the table. `SendCurrent` and
/// `SendLast` wait for their gate condition (a record available, producer
/// EOF) before the first write; `Sending` owns the span still to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Waiting for the one-byte command.
    ReadCommand,
    /// Serve as soon as a record is available.
    SendCurrent,
    /// Serve only once the producer reached end of file.
    SendLast,
    /// A response is going out.
    Sending {
        begin: DataPointer,
        end: DataPointer,
        /// The content-length header went out with the first chunk.
        header_sent: bool,
    },
    /// Response done; waiting for the client to close.
    WaitClose,
}

/// One accepted connection.
#[derive(Debug)]
pub struct Client {
    pub io: AsyncFd<UnixStream>,
    pub state: ClientState,
}

impl Client {
    pub fn new(stream: UnixStream) -> io::Result<Client> {
        stream.set_nonblocking(true)?;
        Ok(Client {
            io: AsyncFd::new(stream)?,
            state: ClientState::ReadCommand,
        })
    }
}

/// The earliest buffer any in-flight response still needs. Reclamation
/// never passes it.
pub fn oldest_writer_seq(clients: &[Option<Client>]) -> Option<u64> {
    clients
        .iter()
        .flatten()
        .filter_map(|c| match c.state {
            ClientState::Sending { begin, .. } => Some(begin.seq),
            _ => None,
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sending(seq: u64, peers: &mut Vec<UnixStream>) -> Option<Client> {
        let (a, b) = UnixStream::pair().unwrap();
        peers.push(b);
        let mut client = Client::new(a).unwrap();
        client.state = ClientState::Sending {
            begin: DataPointer { seq, pos: 0 },
            end: DataPointer { seq, pos: 1 },
            header_sent: true,
        };
        Some(client)
    }

    #[tokio::test]
    async fn oldest_writer_is_the_minimum_sending_begin() {
        let mut peers = Vec::new();
        let (idle, idle_peer) = UnixStream::pair().unwrap();
        peers.push(idle_peer);
        let clients = vec![
            sending(7, &mut peers),
            None,
            sending(3, &mut peers),
            Some(Client::new(idle).unwrap()),
        ];
        assert_eq!(oldest_writer_seq(&clients), Some(3));

        let none: Vec<Option<Client>> = vec![None, None];
        assert_eq!(oldest_writer_seq(&none), None);
    }
}
