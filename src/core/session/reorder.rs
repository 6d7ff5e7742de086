//! Inbound frame reordering.
//!
//! The telephony transport numbers media frames but does not guarantee
//! arrival order. The session pushes every decoded frame through a small
//! reorder window: out-of-order frames inside the window are held and
//! re-sequenced; frames that arrive after the window has moved past them
//! are stale and get dropped with a warning.

use std::collections::BTreeMap;

use crate::core::audio::AudioFrame;

/// Sequence-window reorder buffer for one direction of one session.
#[derive(Debug)]
pub struct FrameReorder {
    /// Next sequence number expected out; `None` until the first frame
    next_seq: Option<u64>,
    /// Maximum frames held back waiting for a gap to fill
    window: u64,
    pending: BTreeMap<u64, AudioFrame>,
    dropped_stale: u64,
}

impl FrameReorder {
    /// Create a reorder buffer with the given window size.
    pub fn new(window: u64) -> Self {
        Self {
            next_seq: None,
            window: window.max(1),
            pending: BTreeMap::new(),
            dropped_stale: 0,
        }
    }

    /// Offer a frame; returns every frame now deliverable in order.
    pub fn push(&mut self, frame: AudioFrame) -> Vec<AudioFrame> {
        let seq = frame.sequence_number;
        let next = *self.next_seq.get_or_insert(seq);

        if seq < next {
            self.dropped_stale += 1;
            tracing::warn!(
                seq,
                expected = next,
                dropped_total = self.dropped_stale,
                "dropping stale audio frame"
            );
            return Vec::new();
        }

        self.pending.insert(seq, frame);

        let mut ready = Vec::new();
        self.drain_consecutive(&mut ready);

        // A gap has outlived the window: give up waiting and move on from
        // the earliest frame we do have
        if self.pending.len() as u64 > self.window
            && let Some((&earliest, _)) = self.pending.iter().next()
        {
            let next = self.next_seq.unwrap_or(earliest);
            tracing::warn!(
                from = next,
                to = earliest,
                "sequence gap exceeded reorder window, skipping ahead"
            );
            self.next_seq = Some(earliest);
            self.drain_consecutive(&mut ready);
        }

        ready
    }

    /// Frames dropped as stale since creation.
    pub fn dropped_stale(&self) -> u64 {
        self.dropped_stale
    }

    fn drain_consecutive(&mut self, out: &mut Vec<AudioFrame>) {
        while let Some(next) = self.next_seq {
            match self.pending.remove(&next) {
                Some(frame) => {
                    out.push(frame);
                    self.next_seq = Some(next + 1);
                }
                None => break,
            }
        }
    }
}
