//! Small shared protocol types.

use std::fmt;

/// Which of a tool's two inherited descriptors an operation refers to.
///
/// A graph-aware tool inherits exactly two descriptors from the shell:
/// its standard input (`Input`) and its standard output (`Output`). The
/// negotiation traffic may flow in either direction on both of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Input,
    Output,
}

impl Side {
    /// The other side.
    pub fn opposite(self) -> Side {
        match self {
            Side::Input => Side::Output,
            Side::Output => Side::Input,
        }
    }

    /// Stable index for side-keyed tables.
    pub fn index(self) -> usize {
        match self {
            Side::Input => 0,
            Side::Output => 1,
        }
    }

    /// Wire discriminant (0 = input, 1 = output).
    pub fn to_wire(self) -> i32 {
        self.index() as i32
    }

    /// Decode a wire discriminant. Returns `None` for anything but 0 or 1.
    pub fn from_wire(val: i32) -> Option<Side> {
        match val {
            0 => Some(Side::Input),
            1 => Some(Side::Output),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Input => write!(f, "input"),
            Side::Output => write!(f, "output"),
        }
    }
}

/// Negotiation lifecycle carried inside the message block.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// The graph is still being assembled.
    Negotiating = 0,
    /// The initiator observed a stable round; the graph is final.
    End = 1,
    /// A participant failed; the block is poisoned.
    Error = 2,
}

impl ProtocolState {
    /// Decode a wire discriminant.
    pub fn from_u32(val: u32) -> Option<ProtocolState> {
        match val {
            0 => Some(ProtocolState::Negotiating),
            1 => Some(ProtocolState::End),
            2 => Some(ProtocolState::Error),
            _ => None,
        }
    }

    /// Wire discriminant.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolState::Negotiating => write!(f, "negotiating"),
            ProtocolState::End => write!(f, "end"),
            ProtocolState::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Input.opposite(), Side::Output);
        assert_eq!(Side::Output.opposite(), Side::Input);
    }

    #[test]
    fn side_wire_roundtrip() {
        assert_eq!(Side::from_wire(Side::Input.to_wire()), Some(Side::Input));
        assert_eq!(Side::from_wire(Side::Output.to_wire()), Some(Side::Output));
        assert_eq!(Side::from_wire(-1), None);
        assert_eq!(Side::from_wire(2), None);
    }

    #[test]
    fn state_wire_roundtrip() {
        for state in [
            ProtocolState::Negotiating,
            ProtocolState::End,
            ProtocolState::Error,
        ] {
            assert_eq!(ProtocolState::from_u32(state.as_u32()), Some(state));
        }
        assert_eq!(ProtocolState::from_u32(3), None);
    }
}
