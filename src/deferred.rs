// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deferred output-order queue.
//!
//! Pictures whose display index and presentation time cannot be determined
//! at parse time are parked here, keyed by their extended picture order
//! count, and resolved once enough future (or past, in reverse play)
//! context has arrived. Entries live in two parallel structures: a dense
//! table indexed by the unit's pool slot and an order-preserving insertion
//! list walked by the draining operations.

use log::debug;
use log::error;

use crate::frame::FrameHandle;
use crate::frame::VideoHandle;
use crate::pool::CodedFrameBufferPool;
use crate::pool::UnitToken;
use crate::timing::TimingGenerator;
use crate::PlayDirection;

/// PTS inversions further apart than this are treated as legitimate jumps
/// (loops, ad insertion) rather than a broken ordering key (1 second).
const PTS_JUMP_THRESHOLD_US: u64 = 1_000_000;

const INVALID_ORDER_SLOT: usize = usize::MAX;

struct DeferredEntry {
    token: UnitToken,
    frame: FrameHandle,
    video: VideoHandle,
    key: u64,
}

/// Borrowed context needed to resolve an entry.
pub struct DeferContext<'a> {
    pub timing: &'a mut TimingGenerator,
    pub pool: &'a mut CodedFrameBufferPool,
    pub direction: PlayDirection,
}

/// Outcome of a deferral, reported so the codec can react to a PTS
/// sequence turning out to be inconsistent with the ordering key.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferOutcome {
    /// This insertion detected the first PTS inversion.
    pub pts_newly_invalidated: bool,
}

#[derive(Default)]
pub struct DeferredQueue {
    /// Dense table indexed by pool slot.
    table: Vec<Option<DeferredEntry>>,
    /// Pool slots in ascending key order. Slots cleared by the PTS
    /// tie-break are left as `INVALID_ORDER_SLOT` until compaction.
    order: Vec<usize>,
    pts_sequence_invalid: bool,
}

impl DeferredQueue {
    pub fn new(pool_capacity: usize) -> Self {
        let mut table = Vec::with_capacity(pool_capacity);
        table.resize_with(pool_capacity, || None);
        Self {
            table,
            order: Vec::with_capacity(pool_capacity),
            pts_sequence_invalid: false,
        }
    }

    pub fn pending(&self) -> usize {
        self.order.iter().filter(|&&s| s != INVALID_ORDER_SLOT).count()
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Whether a PTS inversion has been detected on this stream.
    pub fn pts_sequence_invalid(&self) -> bool {
        self.pts_sequence_invalid
    }

    /// Park a picture until its display order can be resolved. `key` is the
    /// already-adjusted ordering key (doubled extended POC plus the field or
    /// duplicate tie-break bit). The queue takes over the caller's claim on
    /// the unit.
    ///
    /// Deferral is capacity limited: once `max_deferrals` entries are
    /// pending the oldest (or newest, in reverse) entry is force-processed.
    /// This is a flow-control valve, not an error.
    pub fn defer(
        &mut self,
        token: UnitToken,
        frame: FrameHandle,
        video: VideoHandle,
        key: u64,
        max_deferrals: usize,
        cx: &mut DeferContext,
    ) -> DeferOutcome {
        let slot = token.index();
        if slot >= self.table.len() {
            self.table.resize_with(slot + 1, || None);
        }
        if self.table[slot].is_some() {
            error!("deferred list entry {} already in use", slot);
        }

        self.table[slot] = Some(DeferredEntry {
            token,
            frame,
            video,
            key,
        });

        let position = self
            .order
            .iter()
            .position(|&s| s != INVALID_ORDER_SLOT && key < self.table[s].as_ref().unwrap().key)
            .unwrap_or(self.order.len());
        self.order.insert(position, slot);

        let outcome = DeferOutcome {
            pts_newly_invalidated: self.validate_pts_neighbours(position),
        };

        if self.pending() >= max_deferrals {
            error!(
                "unable to defer, too many outstanding ({} >= {}); there may be \
                 too few decode buffers for this stream",
                self.pending(),
                max_deferrals
            );
            match cx.direction {
                PlayDirection::Forward => {
                    let lowest = self.first_valid().unwrap();
                    let bound = (self.table[lowest].as_ref().unwrap().key >> 1) + 1;
                    self.process_upto(bound, cx);
                }
                PlayDirection::Backward => {
                    let highest = self.last_valid().unwrap();
                    let bound = (self.table[highest].as_ref().unwrap().key >> 1) + 1;
                    self.process_downto(bound, cx);
                }
            }
        }

        outcome
    }

    fn first_valid(&self) -> Option<usize> {
        self.order.iter().copied().find(|&s| s != INVALID_ORDER_SLOT)
    }

    fn last_valid(&self) -> Option<usize> {
        self.order
            .iter()
            .rev()
            .copied()
            .find(|&s| s != INVALID_ORDER_SLOT)
    }

    /// Check the new entry's presentation time against its immediate
    /// neighbours in key order. A small inversion means the ordering key
    /// disagrees with the coded PTS sequence.
    fn validate_pts_neighbours(&mut self, position: usize) -> bool {
        let slot = self.order[position];
        let pts = match self.table[slot]
            .as_ref()
            .unwrap()
            .frame
            .borrow()
            .normalized_playback_time
        {
            Some(pts) => pts,
            None => return false,
        };

        let neighbour_pts = |s: usize| -> Option<u64> {
            if s == INVALID_ORDER_SLOT {
                return None;
            }
            self.table[s].as_ref().unwrap().frame.borrow().normalized_playback_time
        };

        let mut inversion = false;
        if position > 0 {
            if let Some(before) = neighbour_pts(self.order[position - 1]) {
                if pts < before && before - pts < PTS_JUMP_THRESHOLD_US {
                    inversion = true;
                }
            }
        }
        if position + 1 < self.order.len() {
            if let Some(after) = neighbour_pts(self.order[position + 1]) {
                if pts > after && pts - after < PTS_JUMP_THRESHOLD_US {
                    inversion = true;
                }
            }
        }

        if inversion && !self.pts_sequence_invalid {
            self.pts_sequence_invalid = true;
            return true;
        }
        false
    }

    fn resolve(&mut self, slot: usize, cx: &mut DeferContext) {
        let entry = self.table[slot].take().unwrap();
        debug!("resolving deferred entry {} (key {:#x})", slot, entry.key);
        cx.timing.calculate_frame_index_and_pts(
            &mut entry.frame.borrow_mut(),
            &entry.video.borrow(),
            cx.direction,
        );
        cx.pool.release(entry.token);
    }

    fn compact(&mut self) {
        self.order.retain(|&s| s != INVALID_ORDER_SLOT);
    }

    /// Drain entries whose key lies below `extended_poc`, assigning display
    /// indices and timestamps. Among the eligible entries the one with the
    /// earliest valid presentation time goes first.
    pub fn process_upto(&mut self, extended_poc: u64, cx: &mut DeferContext) {
        let bound = extended_poc.saturating_mul(2);

        let mut i = 0;
        while i < self.order.len() {
            let slot = self.order[i];
            if slot == INVALID_ORDER_SLOT {
                i += 1;
                continue;
            }
            if self.table[slot].as_ref().unwrap().key >= bound {
                break;
            }

            // The next entry in key order is eligible, but an entry with an
            // earlier PTS anywhere in the list takes precedence.
            let mut chosen = i;
            if let Some(mut least) = self.table[slot].as_ref().unwrap().frame.borrow().normalized_playback_time {
                for (j, &other) in self.order.iter().enumerate().skip(i + 1) {
                    if other == INVALID_ORDER_SLOT {
                        continue;
                    }
                    if let Some(pts) =
                        self.table[other].as_ref().unwrap().frame.borrow().normalized_playback_time
                    {
                        if pts < least {
                            least = pts;
                            chosen = j;
                        }
                    }
                }
            }

            let chosen_slot = self.order[chosen];
            self.resolve(chosen_slot, cx);
            if chosen == i {
                i += 1;
            } else {
                self.order[chosen] = INVALID_ORDER_SLOT;
            }
        }

        self.compact();
    }

    /// Reverse-play counterpart of [`Self::process_upto`]: drain entries
    /// whose key lies above `extended_poc`, latest presentation time first.
    pub fn process_downto(&mut self, extended_poc: u64, cx: &mut DeferContext) {
        let bound = extended_poc.saturating_mul(2) | 1;

        while let Some(&slot) = self.order.last() {
            if slot == INVALID_ORDER_SLOT {
                self.order.pop();
                continue;
            }
            if self.table[slot].as_ref().unwrap().key <= bound {
                break;
            }

            let mut chosen = self.order.len() - 1;
            if let Some(mut greatest) = self.table[slot].as_ref().unwrap().frame.borrow().normalized_playback_time {
                for (j, &other) in self.order.iter().enumerate().take(self.order.len() - 1) {
                    if other == INVALID_ORDER_SLOT {
                        continue;
                    }
                    if let Some(pts) =
                        self.table[other].as_ref().unwrap().frame.borrow().normalized_playback_time
                    {
                        if pts > greatest {
                            greatest = pts;
                            chosen = j;
                        }
                    }
                }
            }

            let chosen_slot = self.order[chosen];
            self.resolve(chosen_slot, cx);
            if chosen == self.order.len() - 1 {
                self.order.pop();
            } else {
                self.order[chosen] = INVALID_ORDER_SLOT;
            }
        }

        self.compact();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::frame::ParsedFrame;
    use crate::frame::VideoParams;
    use crate::pool::AccessUnit;

    fn entry(pts: Option<u64>) -> (FrameHandle, VideoHandle) {
        let frame = ParsedFrame {
            first_parsed_parameters_for_output_frame: true,
            normalized_playback_time: pts,
            ..Default::default()
        };
        let video = VideoParams {
            first_slice: true,
            display_count: [2, 0],
            ..Default::default()
        };
        (Rc::new(RefCell::new(frame)), Rc::new(RefCell::new(video)))
    }

    struct Fixture {
        pool: CodedFrameBufferPool,
        timing: TimingGenerator,
        queue: DeferredQueue,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pool: CodedFrameBufferPool::new(16),
                timing: TimingGenerator::default(),
                queue: DeferredQueue::new(16),
            }
        }

        fn defer(&mut self, extended_poc: u64, pts: Option<u64>) -> (FrameHandle, DeferOutcome) {
            let token = self.pool.commit(AccessUnit::default()).unwrap();
            let (frame, video) = entry(pts);
            let mut cx = DeferContext {
                timing: &mut self.timing,
                pool: &mut self.pool,
                direction: PlayDirection::Forward,
            };
            let outcome =
                self.queue
                    .defer(token, frame.clone(), video, extended_poc << 1, 64, &mut cx);
            (frame, outcome)
        }

        fn process_upto(&mut self, extended_poc: u64) {
            let mut cx = DeferContext {
                timing: &mut self.timing,
                pool: &mut self.pool,
                direction: PlayDirection::Forward,
            };
            self.queue.process_upto(extended_poc, &mut cx);
        }
    }

    #[test]
    fn entries_resolve_in_key_order() {
        let mut f = Fixture::new();
        let (p, _) = f.defer(4, None);
        let (b, _) = f.defer(2, None);
        let (i, _) = f.defer(0, None);

        f.process_upto(u64::MAX >> 1);
        assert_eq!(i.borrow().display_frame_index, Some(0));
        assert_eq!(b.borrow().display_frame_index, Some(1));
        assert_eq!(p.borrow().display_frame_index, Some(2));
        assert!(f.queue.is_empty());
        assert_eq!(f.pool.in_use(), 0);
    }

    #[test]
    fn upto_bound_is_exclusive() {
        let mut f = Fixture::new();
        let (a, _) = f.defer(2, None);
        let (b, _) = f.defer(4, None);

        f.process_upto(4);
        assert!(a.borrow().display_frame_index.is_some());
        assert!(b.borrow().display_frame_index.is_none());
        assert_eq!(f.queue.pending(), 1);
    }

    #[test]
    fn earliest_pts_wins_among_eligible() {
        let mut f = Fixture::new();
        let (late, _) = f.defer(2, Some(80_000));
        let (early, _) = f.defer(4, Some(40_000));

        f.process_upto(u64::MAX >> 1);
        assert_eq!(early.borrow().display_frame_index, Some(0));
        assert_eq!(late.borrow().display_frame_index, Some(1));
    }

    #[test]
    fn monotonic_pts_never_invalidates_sequence() {
        // 200 pictures with strictly increasing, valid presentation times.
        let mut f = Fixture::new();
        for n in 0..200u64 {
            let (_, outcome) = f.defer(2 * n, Some(40_000 * n));
            assert!(!outcome.pts_newly_invalidated);
            assert!(!f.queue.pts_sequence_invalid());
            f.process_upto(2 * n + 1);
        }
    }

    #[test]
    fn small_pts_inversion_flags_sequence_invalid() {
        let mut f = Fixture::new();
        f.defer(0, Some(100_000));
        let (_, outcome) = f.defer(2, Some(60_000));
        assert!(outcome.pts_newly_invalidated);
        assert!(f.queue.pts_sequence_invalid());
    }

    #[test]
    fn large_pts_jump_is_tolerated() {
        // A jump of more than a second reads as a splice, not an inversion.
        let mut f = Fixture::new();
        f.defer(0, Some(10_000_000));
        let (_, outcome) = f.defer(2, Some(50_000));
        assert!(!outcome.pts_newly_invalidated);
    }

    #[test]
    fn capacity_valve_force_processes_oldest() {
        let mut f = Fixture::new();
        let (first, _) = f.defer(0, None);

        let token = f.pool.commit(AccessUnit::default()).unwrap();
        let (frame, video) = entry(None);
        let mut cx = DeferContext {
            timing: &mut f.timing,
            pool: &mut f.pool,
            direction: PlayDirection::Forward,
        };
        // A maximum of 2 deferrals trips the valve on the second entry.
        f.queue.defer(token, frame.clone(), video, 2 << 1, 2, &mut cx);

        assert!(first.borrow().display_frame_index.is_some());
        assert!(frame.borrow().display_frame_index.is_none());
        assert_eq!(f.queue.pending(), 1);
    }

    #[test]
    fn downto_drains_from_the_top() {
        let mut f = Fixture::new();
        let token_a = f.pool.commit(AccessUnit::default()).unwrap();
        let token_b = f.pool.commit(AccessUnit::default()).unwrap();
        let (a, video_a) = entry(None);
        let (b, video_b) = entry(None);

        let mut cx = DeferContext {
            timing: &mut f.timing,
            pool: &mut f.pool,
            direction: PlayDirection::Backward,
        };
        f.queue.defer(token_a, a.clone(), video_a, 10 << 1, 64, &mut cx);
        f.queue.defer(token_b, b.clone(), video_b, 20 << 1, 64, &mut cx);

        let mut cx = DeferContext {
            timing: &mut f.timing,
            pool: &mut f.pool,
            direction: PlayDirection::Backward,
        };
        f.queue.process_downto(10, &mut cx);
        assert!(b.borrow().display_frame_index.is_some());
        assert!(a.borrow().display_frame_index.is_none());
    }
}
