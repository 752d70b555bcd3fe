// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Boundary surface of the frame parser: the ordered decode sink, the codec
//! command channel, read-only policy queries and the advisory statistics
//! counters.

use std::sync::Mutex;

use crate::frame::FrameHandle;
use crate::frame::VideoHandle;
use crate::pool::UnitToken;
use crate::FrameParserError;
use crate::Resolution;

/// A unit ready to be decoded, in the order decode should occur. Marker
/// frames carry no descriptors.
#[derive(Clone)]
pub struct DecodeUnit {
    pub token: UnitToken,
    pub frame: Option<FrameHandle>,
    pub video: Option<VideoHandle>,
}

/// Ordered sink consumed by the decode stage. The parser only inserts units
/// that are ready to decode; the consumer owns the claim carried by the
/// token and releases it when done.
pub trait OutputPort {
    fn insert(&mut self, unit: DecodeUnit);
}

/// When a sequenced decoder call should take effect.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SequencePoint {
    Immediate,
    BeforePlaybackTime(u64),
}

/// Calls routed into the downstream decoder through its command queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecoderCall {
    /// Flush any partially accumulated decode buffers (e.g. an unpaired
    /// field) out of the decoder.
    OutputPartialDecodeBuffers,
    /// Release the decoder's hold on the reference with this decode index.
    ReleaseReferenceFrame(i64),
    /// Release every reference the decoder holds.
    ReleaseAllReferenceFrames,
}

/// Command channel into the decoder. Calls are synchronous from the
/// parser's perspective; queuing semantics are the collaborator's concern.
pub trait DecoderCommands {
    fn call_in_sequence(&mut self, point: SequencePoint, call: DecoderCall);
}

/// Policies the parser consults. Values may change between calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Policy {
    TrickModeDomain,
    StreamOnlyKeyFrames,
    StreamDiscardFrames,
    OperateCollapseHolesInDisplayIndices,
    AllowNonIdrResynchronization,
    TreatDuplicateDpbValuesAsNonReferenceFrameFirst,
    ValidateDpbValuesAgainstPtsValues,
    UsePtsDeducedDefaultFrameRates,
    ContainerFrameRatePrecedence,
    MemoryProfile,
    SupportSmoothReversePlay,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PolicyValue {
    #[default]
    Disapply,
    Apply,
    /// Trick mode domain: only key frames are decoded.
    TrickModeDecodeKeyFrames,
    /// Discard policy value: drop everything but key frames.
    KeyFramesOnly,
    /// Memory profiles bounding the maximum decode resolution.
    MemoryProfileSd,
    MemoryProfileHd,
    MemoryProfile4k2k,
}

impl PolicyValue {
    pub fn applies(self) -> bool {
        self == PolicyValue::Apply
    }

    /// Maximum decode resolution for a memory-profile value.
    pub fn max_resolution(self) -> Resolution {
        match self {
            PolicyValue::MemoryProfileSd => Resolution {
                width: 720,
                height: 576,
            },
            PolicyValue::MemoryProfile4k2k => Resolution {
                width: 4096,
                height: 2400,
            },
            _ => Resolution {
                width: 1920,
                height: 1088,
            },
        }
    }
}

/// Read-only policy lookup, queried per frame.
pub trait PolicyQuery {
    fn policy_value(&self, policy: Policy) -> PolicyValue;
}

/// A policy source that leaves every policy at its default.
pub struct DefaultPolicies;

impl PolicyQuery for DefaultPolicies {
    fn policy_value(&self, policy: Policy) -> PolicyValue {
        match policy {
            Policy::SupportSmoothReversePlay => PolicyValue::Apply,
            Policy::OperateCollapseHolesInDisplayIndices => PolicyValue::Apply,
            Policy::ValidateDpbValuesAgainstPtsValues => PolicyValue::Apply,
            _ => PolicyValue::Disapply,
        }
    }
}

/// Monotonic counters; advisory only, never consulted for control flow.
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub frames_parsed: u64,
    pub frames_queued_for_decode: u64,
    pub marker_frames: u64,
    pub syntax_errors: u64,
    pub missing_context_errors: u64,
    pub insufficient_reference_errors: u64,
    pub buffer_allocation_failures: u64,
    pub implementation_errors: u64,
    pub unplayable_streams: u64,
    pub other_errors: u64,
}

impl Statistics {
    pub fn count_error(&mut self, error: &FrameParserError) {
        match error {
            FrameParserError::HeaderSyntaxError => self.syntax_errors += 1,
            FrameParserError::NoStreamParameters | FrameParserError::NoPictureParameters(_) => {
                self.missing_context_errors += 1
            }
            FrameParserError::InsufficientReferenceFrames => {
                self.insufficient_reference_errors += 1
            }
            FrameParserError::FailedToAllocateBuffer => self.buffer_allocation_failures += 1,
            FrameParserError::StreamUnplayable => self.unplayable_streams += 1,
            FrameParserError::Implementation(_) => self.implementation_errors += 1,
            FrameParserError::Other(_) => self.other_errors += 1,
        }
    }
}

/// Configuration-update bits pushed towards the decoder.
pub mod config_bits {
    pub const TRICK_MODE: u32 = 1 << 0;
    pub const SMOOTH_REVERSE_DISABLED: u32 = 1 << 1;
    pub const REFERENCE_LIMITS: u32 = 1 << 2;
}

#[derive(Debug, Default)]
struct ConfigState {
    pending: u32,
    applied: u32,
}

/// The only cross-thread state in the parser: a small, write-mostly channel
/// of configuration updates the decoder polls. Guarded by a mutex; no
/// operation blocks beyond the lock itself.
#[derive(Debug, Default)]
pub struct DecoderConfigChannel {
    state: Mutex<ConfigState>,
}

impl DecoderConfigChannel {
    /// Mark the given bits as pending application.
    pub fn apply(&self, mask: u32) {
        let mut state = self.state.lock().unwrap();
        state.pending |= mask;
    }

    /// Re-queue everything that has already been applied, e.g. after the
    /// decoder has been torn down and rebuilt.
    pub fn reapply(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending |= state.applied;
        state.applied = 0;
    }

    /// Poll side: take the pending bits, marking them applied.
    pub fn query(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        let pending = state.pending;
        state.applied |= pending;
        state.pending = 0;
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_channel_apply_query_reapply() {
        let channel = DecoderConfigChannel::default();
        channel.apply(config_bits::TRICK_MODE);
        channel.apply(config_bits::SMOOTH_REVERSE_DISABLED);
        assert_eq!(
            channel.query(),
            config_bits::TRICK_MODE | config_bits::SMOOTH_REVERSE_DISABLED
        );
        assert_eq!(channel.query(), 0);

        channel.reapply();
        assert_eq!(
            channel.query(),
            config_bits::TRICK_MODE | config_bits::SMOOTH_REVERSE_DISABLED
        );
    }
}
