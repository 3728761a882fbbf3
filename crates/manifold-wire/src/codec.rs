//! Explicit byte layout for the message block.
//!
//! One self-contained region: header, then the node records, then the edge
//! records, packed in native byte order. This is a local-machine protocol;
//! cross-arch interchange is a non-goal, but every field sits at a fixed,
//! explicit offset so there are no pointers to fix up on either end. The
//! `total_size` header field is authoritative: receivers read exactly that
//! many bytes per block.

use crate::block::{Edge, MessageBlock, Node, Origin, NAME_MAX};
use crate::types::{ProtocolState, Side};

/// Protocol version carried in every block.
pub const WIRE_VERSION: u32 = 1;

/// Header layout:
///
/// | offset | field          |
/// |--------|----------------|
/// | 0      | version: u32   |
/// | 4      | n_nodes: u32   |
/// | 8      | n_edges: u32   |
/// | 12     | initiator: i32 |
/// | 16     | state: u32     |
/// | 20     | serial: u32    |
/// | 24     | origin_index: i32 (-1 = none) |
/// | 28     | origin_side: i32 (-1 = none)  |
/// | 32     | total_size: u32 |
pub const HEADER_LEN: usize = 36;

/// Node record layout: pid i32 @0, name_len u32 @4, name bytes @8
/// (fixed 100-byte field, zero padded), requires u32 @108, provides u32
/// @112, flags u32 @116 (bit 0 graph-in, bit 1 graph-out).
pub const NODE_RECORD_LEN: usize = 120;

/// Edge record layout: from u32 @0, to u32 @4.
pub const EDGE_RECORD_LEN: usize = 8;

const FLAG_GRAPH_IN: u32 = 1 << 0;
const FLAG_GRAPH_OUT: u32 = 1 << 1;

/// Wire size of a block with the given element counts.
pub fn encoded_len(n_nodes: usize, n_edges: usize) -> usize {
    HEADER_LEN + n_nodes * NODE_RECORD_LEN + n_edges * EDGE_RECORD_LEN
}

/// Decode or encode failure. All of these are fatal protocol errors for
/// the process that hits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than a header.
    ShortHeader { have: usize },
    /// Unknown protocol version.
    VersionMismatch { found: u32 },
    /// `total_size` disagrees with the bytes provided.
    SizeMismatch { declared: usize, actual: usize },
    /// `total_size` disagrees with the node/edge counts.
    CountMismatch { declared: usize, computed: usize },
    /// Node name exceeds the fixed-width field.
    NameTooLong { len: usize },
    /// Node name is not valid UTF-8.
    NameNotUtf8,
    /// Unknown state discriminant.
    BadState(u32),
    /// Unknown origin side discriminant.
    BadSide(i32),
    /// Origin index does not refer to an existing node.
    OriginOutOfRange { index: i32, n_nodes: usize },
    /// Edge endpoint does not refer to an existing node.
    EdgeOutOfRange { from: u32, to: u32, n_nodes: usize },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::ShortHeader { have } => {
                write!(f, "short message block header: {have} of {HEADER_LEN} bytes")
            }
            WireError::VersionMismatch { found } => {
                write!(f, "unknown protocol version {found} (expected {WIRE_VERSION})")
            }
            WireError::SizeMismatch { declared, actual } => write!(
                f,
                "message block declares {declared} bytes but {actual} were provided"
            ),
            WireError::CountMismatch { declared, computed } => write!(
                f,
                "message block declares {declared} bytes but its counts imply {computed}"
            ),
            WireError::NameTooLong { len } => {
                write!(f, "tool name of {len} bytes exceeds the {NAME_MAX}-byte field")
            }
            WireError::NameNotUtf8 => write!(f, "tool name is not valid UTF-8"),
            WireError::BadState(v) => write!(f, "unknown negotiation state {v}"),
            WireError::BadSide(v) => write!(f, "unknown origin side {v}"),
            WireError::OriginOutOfRange { index, n_nodes } => write!(
                f,
                "origin index {index} not present in graph of {n_nodes} nodes"
            ),
            WireError::EdgeOutOfRange { from, to, n_nodes } => write!(
                f,
                "edge {from} -> {to} references nodes outside graph of {n_nodes} nodes"
            ),
        }
    }
}

impl std::error::Error for WireError {}

fn put_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_ne_bytes());
}

fn put_i32(buf: &mut [u8], offset: usize, val: i32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_ne_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn get_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

/// Read the authoritative total size out of a header fragment.
///
/// Used by framed readers to learn how many bytes to consume; validates
/// the version and that the declared size can at least hold the header.
pub fn declared_total_size(header: &[u8]) -> Result<usize, WireError> {
    if header.len() < HEADER_LEN {
        return Err(WireError::ShortHeader { have: header.len() });
    }
    let version = get_u32(header, 0);
    if version != WIRE_VERSION {
        return Err(WireError::VersionMismatch { found: version });
    }
    let total = get_u32(header, 32) as usize;
    if total < HEADER_LEN {
        return Err(WireError::SizeMismatch {
            declared: total,
            actual: HEADER_LEN,
        });
    }
    Ok(total)
}

/// Encode a block into its contiguous wire region.
pub fn encode(mb: &MessageBlock) -> Result<Vec<u8>, WireError> {
    for node in &mb.nodes {
        if node.name.len() > NAME_MAX {
            return Err(WireError::NameTooLong {
                len: node.name.len(),
            });
        }
    }

    let total = encoded_len(mb.nodes.len(), mb.edges.len());
    let mut buf = vec![0u8; total];

    put_u32(&mut buf, 0, mb.version);
    put_u32(&mut buf, 4, mb.nodes.len() as u32);
    put_u32(&mut buf, 8, mb.edges.len() as u32);
    put_i32(&mut buf, 12, mb.initiator_pid);
    put_u32(&mut buf, 16, mb.state.as_u32());
    put_u32(&mut buf, 20, mb.serial);
    match mb.origin {
        Some(origin) => {
            put_i32(&mut buf, 24, origin.index as i32);
            put_i32(&mut buf, 28, origin.side.to_wire());
        }
        None => {
            put_i32(&mut buf, 24, -1);
            put_i32(&mut buf, 28, -1);
        }
    }
    put_u32(&mut buf, 32, total as u32);

    let mut offset = HEADER_LEN;
    for node in &mb.nodes {
        put_i32(&mut buf, offset, node.pid);
        put_u32(&mut buf, offset + 4, node.name.len() as u32);
        buf[offset + 8..offset + 8 + node.name.len()].copy_from_slice(node.name.as_bytes());
        put_u32(&mut buf, offset + 108, node.requires_channels);
        put_u32(&mut buf, offset + 112, node.provides_channels);
        let mut flags = 0;
        if node.graph_in {
            flags |= FLAG_GRAPH_IN;
        }
        if node.graph_out {
            flags |= FLAG_GRAPH_OUT;
        }
        put_u32(&mut buf, offset + 116, flags);
        offset += NODE_RECORD_LEN;
    }
    for edge in &mb.edges {
        put_u32(&mut buf, offset, edge.from);
        put_u32(&mut buf, offset + 4, edge.to);
        offset += EDGE_RECORD_LEN;
    }
    debug_assert_eq!(offset, total);

    Ok(buf)
}

/// Decode a complete wire region back into a block.
///
/// `buf` must contain exactly one block: the declared `total_size` has to
/// match both `buf.len()` and the node/edge counts. Every index field is
/// validated with a bounded scan before the block is accepted.
pub fn decode(buf: &[u8]) -> Result<MessageBlock, WireError> {
    let total = declared_total_size(buf)?;
    if total != buf.len() {
        return Err(WireError::SizeMismatch {
            declared: total,
            actual: buf.len(),
        });
    }

    let n_nodes = get_u32(buf, 4) as usize;
    let n_edges = get_u32(buf, 8) as usize;
    let computed = encoded_len(n_nodes, n_edges);
    if computed != total {
        return Err(WireError::CountMismatch {
            declared: total,
            computed,
        });
    }

    let initiator_pid = get_i32(buf, 12);
    let state_raw = get_u32(buf, 16);
    let state = ProtocolState::from_u32(state_raw).ok_or(WireError::BadState(state_raw))?;
    let serial = get_u32(buf, 20);

    let origin_index = get_i32(buf, 24);
    let origin_side = get_i32(buf, 28);
    let origin = if origin_index < 0 {
        None
    } else {
        if origin_index as usize >= n_nodes {
            return Err(WireError::OriginOutOfRange {
                index: origin_index,
                n_nodes,
            });
        }
        let side = Side::from_wire(origin_side).ok_or(WireError::BadSide(origin_side))?;
        Some(Origin {
            index: origin_index as u32,
            side,
        })
    };

    let mut nodes = Vec::with_capacity(n_nodes);
    let mut offset = HEADER_LEN;
    for _ in 0..n_nodes {
        let pid = get_i32(buf, offset);
        let name_len = get_u32(buf, offset + 4) as usize;
        if name_len > NAME_MAX {
            return Err(WireError::NameTooLong { len: name_len });
        }
        let name = std::str::from_utf8(&buf[offset + 8..offset + 8 + name_len])
            .map_err(|_| WireError::NameNotUtf8)?
            .to_string();
        let requires_channels = get_u32(buf, offset + 108);
        let provides_channels = get_u32(buf, offset + 112);
        let flags = get_u32(buf, offset + 116);
        nodes.push(Node {
            pid,
            name,
            requires_channels,
            provides_channels,
            graph_in: flags & FLAG_GRAPH_IN != 0,
            graph_out: flags & FLAG_GRAPH_OUT != 0,
        });
        offset += NODE_RECORD_LEN;
    }

    let mut edges = Vec::with_capacity(n_edges);
    for _ in 0..n_edges {
        let from = get_u32(buf, offset);
        let to = get_u32(buf, offset + 4);
        if from as usize >= n_nodes || to as usize >= n_nodes {
            return Err(WireError::EdgeOutOfRange { from, to, n_nodes });
        }
        edges.push(Edge { from, to });
        offset += EDGE_RECORD_LEN;
    }

    Ok(MessageBlock {
        version: WIRE_VERSION,
        nodes,
        edges,
        initiator_pid,
        state,
        serial,
        origin,
    })
}
