#![deny(unsafe_code)]

//! Wire-level types for manifold negotiation.
//!
//! The message block is the single object that circulates through a pipeline
//! while its tools negotiate. This crate holds the in-memory graph model
//! ([`MessageBlock`], [`Node`], [`Edge`]) and the explicit byte layout it is
//! shipped in ([`codec`]). The two representations are deliberately separate:
//! the in-memory form owns plain arrays with value semantics, the wire form
//! is a fixed-offset native-endian region whose `total_size` field is
//! authoritative for framing.

pub mod block;
pub mod codec;
pub mod types;

pub use block::{Edge, MessageBlock, Node, Origin, NAME_MAX};
pub use codec::{WireError, EDGE_RECORD_LEN, HEADER_LEN, NODE_RECORD_LEN, WIRE_VERSION};
pub use types::{ProtocolState, Side};
