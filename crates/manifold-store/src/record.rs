//! The record locator: find the response span for the configured window.

use tracing::trace;

use crate::buffer::BufferQueue;
use crate::config::{Framing, Window};
use crate::cursor::DataPointer;

/// The span served to the next client, `begin` inclusive to `end`
/// exclusive. Record separators between the window's records stay in the
/// payload; the final record's terminator does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentRecord {
    pub begin: DataPointer,
    pub end: DataPointer,
}

/// Locate the window counted back from the newest complete record.
///
/// Returns `None` while fewer than `window.rend` complete records exist;
/// the caller keeps whatever span it had.
pub fn locate(q: &BufferQueue, framing: Framing, window: Window) -> Option<CurrentRecord> {
    let tail = q.back()?;
    if tail.record_count() < window.rend {
        trace!(
            records = tail.record_count(),
            needed = window.rend,
            "not enough records for the window"
        );
        return None;
    }

    let mut end = DataPointer {
        seq: tail.seq(),
        pos: tail.len(),
    };

    let record = match framing {
        Framing::Separator(rs) => {
            // Skip any trailing partial record, then back over the skipped
            // part of the window. Both leave `end` just past a separator.
            end.move_back_records(q, 0, rs);
            end.move_back_records(q, window.rbegin, rs);

            let mut begin = end;
            begin.move_back_records(q, window.records(), rs);

            // The separator terminating the final record is counted, not
            // served.
            end.decrement(q);
            CurrentRecord { begin, end }
        }
        Framing::FixedLength(len) => {
            end.subtract(q, (tail.byte_count() % len as u64) as usize);
            end.subtract(q, (window.rbegin * len as u64) as usize);
            let mut begin = end;
            begin.subtract(q, (window.records() * len as u64) as usize);
            CurrentRecord { begin, end }
        }
    };

    trace!(?record, "current record relocated");
    Some(record)
}
