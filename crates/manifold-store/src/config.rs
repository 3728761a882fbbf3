//! Store configuration.

use crate::error::StoreError;

/// Release-build buffer capacity; sized to the usual pipe granularity.
/// Tests shrink it so records straddle buffers.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// How records are delimited on standard input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Records end with this byte. The byte between two records belongs to
    /// the earlier one for counting purposes but is not part of any
    /// response payload.
    Separator(u8),
    /// Records are exactly this many bytes, back to back.
    FixedLength(usize),
}

/// The response window, in records counted backward from the newest.
///
/// `rbegin` is inclusive, `rend` exclusive: (0, 1) is the latest record,
/// (10, 15) is five records ending ten records back from the latest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub rbegin: u64,
    pub rend: u64,
}

impl Window {
    /// Just the latest record.
    pub const LATEST: Window = Window { rbegin: 0, rend: 1 };

    pub fn new(rbegin: u64, rend: u64) -> Result<Window, StoreError> {
        if rend <= rbegin {
            return Err(StoreError::Usage(format!(
                "empty response window ({rbegin}, {rend})"
            )));
        }
        Ok(Window { rbegin, rend })
    }

    /// Number of records in the window.
    pub fn records(&self) -> u64 {
        self.rend - self.rbegin
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub framing: Framing,
    pub window: Window,
    pub buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            framing: Framing::Separator(b'\n'),
            window: Window::LATEST,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl Config {
    pub fn with_framing(framing: Framing) -> Config {
        Config {
            framing,
            ..Config::default()
        }
    }
}
