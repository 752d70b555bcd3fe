// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coded frame buffer pool.
//!
//! Every access unit delivered to the parser is committed into one slot of
//! this pool and addressed through a generation-tagged [`UnitToken`] from
//! then on. Ownership is expressed as explicit claims: each component that
//! needs the unit to stay alive (the decode output port, the deferred
//! output-order queue, the reverse-play stacks) takes a claim and releases
//! it exactly once. The generation tag catches use of a token after its
//! slot has been freed and reused; releasing more claims than were taken is
//! a logic error and panics in debug builds.

use log::debug;

use crate::frame::FrameHandle;
use crate::frame::VideoHandle;
use crate::FrameParserError;
use crate::Result;
use crate::TimeFormat;

/// Flags delivered alongside the byte range of a coded access unit.
#[derive(Copy, Clone, Debug, Default)]
pub struct UnitFlags {
    /// The unit follows a break in the stream (splice, channel change, jump).
    pub stream_discontinuity: bool,
    /// Reverse play only: the discontinuity is a jump to the group of
    /// pictures immediately preceding the data already seen, so the decode
    /// stacks should be processed rather than purged.
    pub continuous_reverse_jump: bool,
    /// Data before the discontinuity was surplus and has been flushed.
    pub flush_before_discontinuity: bool,
    /// The unit is the last one before a stream termination point.
    pub followed_by_stream_terminate: bool,
}

/// One coded access unit as delivered by the upstream collator.
#[derive(Debug, Default)]
pub struct AccessUnit {
    pub data: Vec<u8>,
    pub flags: UnitFlags,
    pub playback_time: Option<u64>,
    pub decode_time: Option<u64>,
    pub time_format: TimeFormat,
}

/// Generation-tagged handle to a pool slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UnitToken {
    index: u32,
    generation: u32,
}

impl UnitToken {
    /// Slot index of the token, used as the dense key of the deferred list.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Default)]
struct Slot {
    data: Option<std::rc::Rc<[u8]>>,
    flags: UnitFlags,
    playback_time: Option<u64>,
    decode_time: Option<u64>,
    time_format: TimeFormat,
    frame: Option<FrameHandle>,
    video: Option<VideoHandle>,
    claims: u32,
    generation: u32,
}

/// Fixed-capacity pool of coded access units.
pub struct CodedFrameBufferPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl CodedFrameBufferPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self {
            slots,
            free: (0..capacity as u32).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of units currently held in the pool.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Commit a unit into the pool with one claim taken on behalf of the
    /// caller.
    pub fn commit(&mut self, unit: AccessUnit) -> Result<UnitToken> {
        let index = self
            .free
            .pop()
            .ok_or(FrameParserError::FailedToAllocateBuffer)?;
        let slot = &mut self.slots[index as usize];
        slot.data = Some(unit.data.into());
        slot.flags = unit.flags;
        slot.playback_time = unit.playback_time;
        slot.decode_time = unit.decode_time;
        slot.time_format = unit.time_format;
        slot.frame = None;
        slot.video = None;
        slot.claims = 1;
        Ok(UnitToken {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, token: UnitToken) -> &Slot {
        let slot = &self.slots[token.index()];
        debug_assert_eq!(
            slot.generation, token.generation,
            "stale unit token: slot was released and reused"
        );
        slot
    }

    fn slot_mut(&mut self, token: UnitToken) -> &mut Slot {
        let slot = &mut self.slots[token.index()];
        debug_assert_eq!(
            slot.generation, token.generation,
            "stale unit token: slot was released and reused"
        );
        slot
    }

    /// Take an additional claim on the unit.
    pub fn claim(&mut self, token: UnitToken) {
        let slot = self.slot_mut(token);
        debug_assert!(slot.claims > 0, "claim on a fully released unit");
        slot.claims += 1;
    }

    /// Release one claim. The slot is freed once the last claim goes.
    pub fn release(&mut self, token: UnitToken) {
        let index = token.index();
        let slot = &mut self.slots[index];
        debug_assert_eq!(
            slot.generation, token.generation,
            "release of a stale unit token"
        );
        debug_assert!(slot.claims > 0, "double release of a unit claim");
        if slot.claims == 0 {
            return;
        }
        slot.claims -= 1;
        if slot.claims == 0 {
            debug!("freeing coded frame buffer slot {}", index);
            slot.data = None;
            slot.frame = None;
            slot.video = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
        }
    }

    /// Cheap handle to the unit's byte range.
    pub fn data(&self, token: UnitToken) -> std::rc::Rc<[u8]> {
        std::rc::Rc::clone(self.slot(token).data.as_ref().unwrap())
    }

    pub fn flags(&self, token: UnitToken) -> UnitFlags {
        self.slot(token).flags
    }

    /// Coded timestamps of the unit: playback, decode, and their format.
    pub fn times(&self, token: UnitToken) -> (Option<u64>, Option<u64>, TimeFormat) {
        let slot = self.slot(token);
        (slot.playback_time, slot.decode_time, slot.time_format)
    }

    /// Attach the parsed descriptors produced by header decoding.
    pub fn attach_metadata(&mut self, token: UnitToken, frame: FrameHandle, video: VideoHandle) {
        let slot = self.slot_mut(token);
        slot.frame = Some(frame);
        slot.video = Some(video);
    }

    /// Drop the parsed descriptors, e.g. when header decoding failed after
    /// a partial commit.
    pub fn invalidate_metadata(&mut self, token: UnitToken) {
        let slot = self.slot_mut(token);
        slot.frame = None;
        slot.video = None;
    }

    pub fn frame(&self, token: UnitToken) -> Option<FrameHandle> {
        self.slot(token).frame.clone()
    }

    pub fn video(&self, token: UnitToken) -> Option<VideoHandle> {
        self.slot(token).video.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> AccessUnit {
        AccessUnit {
            data: vec![0u8; 4],
            ..Default::default()
        }
    }

    #[test]
    fn commit_and_release_frees_slot() {
        let mut pool = CodedFrameBufferPool::new(2);
        let a = pool.commit(unit()).unwrap();
        let b = pool.commit(unit()).unwrap();
        assert_eq!(pool.in_use(), 2);
        assert!(matches!(
            pool.commit(unit()),
            Err(FrameParserError::FailedToAllocateBuffer)
        ));

        pool.release(a);
        assert_eq!(pool.in_use(), 1);
        pool.commit(unit()).unwrap();
        pool.release(b);
    }

    #[test]
    fn extra_claims_keep_slot_alive() {
        let mut pool = CodedFrameBufferPool::new(1);
        let t = pool.commit(unit()).unwrap();
        pool.claim(t);
        pool.release(t);
        assert_eq!(pool.in_use(), 1);
        pool.release(t);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "stale unit token")]
    #[cfg(debug_assertions)]
    fn double_release_is_detected() {
        let mut pool = CodedFrameBufferPool::new(2);
        let t = pool.commit(unit()).unwrap();
        pool.release(t);
        // The slot was freed and its generation bumped, so a second release
        // through the old token trips the staleness check.
        pool.release(t);
    }
}
