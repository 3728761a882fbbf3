//! Property tests for the buffer queue, locator, and reclamation.

use proptest::prelude::*;

use crate::buffer::BufferQueue;
use crate::config::{Framing, Window};
use crate::record::{locate, CurrentRecord};

fn span_bytes(q: &BufferQueue, r: CurrentRecord) -> Vec<u8> {
    let mut out = Vec::new();
    let mut dp = r.begin;
    while dp != r.end {
        out.push(dp.byte_at(q));
        if !dp.increment(q) {
            break;
        }
    }
    out
}

/// Record bodies avoid the separator byte so a flat model stays trivial.
fn record_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(97u8..=122u8, 0..12)
}

proptest! {
    #[test]
    fn separator_locator_matches_flat_model(
        records in prop::collection::vec(record_strategy(), 1..20),
        partial in record_strategy(),
        chunk in 1usize..7,
        rbegin in 0u64..4,
        span in 1u64..4,
    ) {
        let sep = b'\n';
        let mut flat = Vec::new();
        for record in &records {
            flat.extend_from_slice(record);
            flat.push(sep);
        }
        flat.extend_from_slice(&partial);

        let mut q = BufferQueue::new(Framing::Separator(sep));
        for piece in flat.chunks(chunk) {
            q.push(piece.to_vec());
        }

        let window = Window { rbegin, rend: rbegin + span };
        let located = locate(&q, Framing::Separator(sep), window);

        let have = records.len() as u64;
        if have < window.rend {
            prop_assert!(located.is_none());
        } else {
            let lo = (have - window.rend) as usize;
            let hi = (have - rbegin) as usize;
            let expected = records[lo..hi].join(&sep);
            prop_assert_eq!(span_bytes(&q, located.unwrap()), expected);
        }
    }

    #[test]
    fn fixed_length_locator_matches_flat_model(
        flat in prop::collection::vec(any::<u8>(), 0..64),
        length in 1usize..6,
        chunk in 1usize..7,
    ) {
        let mut q = BufferQueue::new(Framing::FixedLength(length));
        for piece in flat.chunks(chunk) {
            q.push(piece.to_vec());
        }

        let located = locate(&q, Framing::FixedLength(length), Window::LATEST);
        let complete = flat.len() / length;
        if complete == 0 {
            prop_assert!(located.is_none());
        } else {
            let expected = &flat[(complete - 1) * length..complete * length];
            prop_assert_eq!(span_bytes(&q, located.unwrap()), expected);
        }
    }

    #[test]
    fn reclamation_never_frees_live_spans(
        chunks in prop::collection::vec(
            prop::collection::vec(
                (0u8..27).prop_map(|i| if i == 26 { b'\n' } else { 97 + i }),
                1..9,
            ),
            1..30,
        ),
        snapshots in prop::collection::vec(any::<bool>(), 30),
    ) {
        let framing = Framing::Separator(b'\n');
        let mut q = BufferQueue::new(framing);
        let mut current: Option<CurrentRecord> = None;
        let mut sending: Vec<CurrentRecord> = Vec::new();

        for (chunk, snapshot) in chunks.into_iter().zip(snapshots) {
            q.push(chunk);
            if let Some(record) = locate(&q, framing, Window::LATEST) {
                current = Some(record);
            }

            // A client freezes the current span when it starts sending;
            // old ones finish and drop off.
            if snapshot {
                if let Some(record) = current {
                    sending.push(record);
                }
            }
            if sending.len() > 3 {
                sending.remove(0);
            }

            if let Some(record) = current {
                let keep = sending
                    .iter()
                    .map(|s| s.begin.seq)
                    .fold(record.begin.seq, u64::min);
                q.reclaim_before(keep);
            }

            // Every span still in flight must be fully dereferenceable.
            for span in sending.iter().chain(current.iter()) {
                let mut dp = span.begin;
                prop_assert!(q.get(dp.seq).is_some());
                while dp != span.end {
                    prop_assert!(q.get(dp.seq).is_some());
                    if !dp.increment(&q) {
                        break;
                    }
                }
                prop_assert_eq!(dp, span.end);
            }
        }
    }
}
