//! Connection allocation: turn the final graph into real pipes.
//!
//! Every edge in the graph connects tools that are adjacent on the
//! negotiation ring (an edge is only ever added between a tool and the
//! block's origin), so each edge maps to one of this tool's two
//! descriptors. The edge's source creates a pipe and passes the read end
//! to the destination over that descriptor; the destination receives it.
//! Both endpoints walk the edges in the same `(from, to)` order, and all
//! sends happen before any receive, so the exchange cannot deadlock.

use std::io;
use std::os::unix::io::{AsFd, FromRawFd, OwnedFd};

use tracing::debug;

use manifold_wire::{Edge, Side};

use crate::error::NegotiateError;
use crate::ring::Ring;
use crate::session::Session;

/// The negotiated solution handed back to the tool.
#[derive(Debug)]
pub struct Negotiated {
    /// Read ends, one per incoming edge, in `(from, to)` edge order.
    pub input_fds: Vec<OwnedFd>,
    /// Write ends, one per outgoing edge, in `(from, to)` edge order.
    pub output_fds: Vec<OwnedFd>,
    /// The final graph, for tools that want to inspect it.
    pub graph: manifold_wire::MessageBlock,
    /// This tool's index in the final graph.
    pub self_index: u32,
}

/// Check arities, create pipes for outgoing edges, and exchange ends with
/// the adjacent tools.
pub(crate) async fn allocate(
    ring: &Ring,
    session: &Session,
) -> Result<(Vec<OwnedFd>, Vec<OwnedFd>), NegotiateError> {
    let block = session.block();
    let spec = session.spec();
    let self_index = session.self_index();

    let mut incoming: Vec<Edge> = block.incoming_edges(self_index).copied().collect();
    let mut outgoing: Vec<Edge> = block.outgoing_edges(self_index).copied().collect();
    incoming.sort_by_key(|e| (e.from, e.to));
    outgoing.sort_by_key(|e| (e.from, e.to));

    if incoming.len() != spec.requires as usize || outgoing.len() != spec.provides as usize {
        return Err(NegotiateError::ArityMismatch {
            name: spec.name.clone(),
            pid: spec.pid,
            requires: spec.requires,
            incoming: incoming.len() as u32,
            provides: spec.provides,
            outgoing: outgoing.len() as u32,
        });
    }

    let mut output_fds = Vec::with_capacity(outgoing.len());
    for edge in &outgoing {
        let side = edge_side(session, edge.to, Side::Output)?;
        let (read_end, write_end) = make_pipe()
            .map_err(|e| NegotiateError::io("creating a data pipe", e))?;
        ring.send_fd(side, read_end.as_fd()).await?;
        debug!(%edge, %side, "passed pipe read end downstream");
        output_fds.push(write_end);
    }

    let mut input_fds = Vec::with_capacity(incoming.len());
    for edge in &incoming {
        let side = edge_side(session, edge.from, Side::Input)?;
        let fd = ring.recv_fd(side).await?;
        debug!(%edge, %side, "received pipe read end from upstream");
        input_fds.push(fd);
    }

    Ok((input_fds, output_fds))
}

/// The descriptor side facing the given peer node.
fn edge_side(
    session: &Session,
    peer_index: u32,
    preferred: Side,
) -> Result<Side, NegotiateError> {
    let peer = session
        .block()
        .nodes
        .get(peer_index as usize)
        .ok_or_else(|| {
            NegotiateError::protocol(format!("edge references node {peer_index} outside the graph"))
        })?;
    session.side_for_neighbor(peer.pid, preferred).ok_or_else(|| {
        NegotiateError::protocol(format!(
            "edge peer {} (pid {}) is not adjacent on either descriptor",
            peer.name, peer.pid
        ))
    })
}

/// A close-on-exec pipe as (read end, write end).
fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];

    #[cfg(target_os = "linux")]
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    #[cfg(not(target_os = "linux"))]
    for fd in [&read_end, &write_end] {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok((read_end, write_end))
}
