// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Descriptors attached to a coded access unit once its headers have been
//! parsed: the frame descriptor consumed by the decode stage and the video
//! content parameters consumed by display timing.

use std::cell::RefCell;
use std::rc::Rc;

use crate::timing::Rational;
use crate::Resolution;

/// Shared handle to the frame descriptor of a committed picture. The deferred
/// output-order queue and the reverse-play stacks keep clones of this and
/// mutate the descriptor (display index, timestamps) after the unit has
/// already been queued for decode.
pub type FrameHandle = Rc<RefCell<ParsedFrame>>;

/// Shared handle to the video content parameters of a committed picture.
pub type VideoHandle = Rc<RefCell<VideoParams>>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PictureStructure {
    #[default]
    Empty,
    Frame,
    TopField,
    BottomField,
}

impl PictureStructure {
    /// Whether two field structures are of opposite parity.
    pub fn opposite_parity(self, other: PictureStructure) -> bool {
        matches!(
            (self, other),
            (PictureStructure::TopField, PictureStructure::BottomField)
                | (PictureStructure::BottomField, PictureStructure::TopField)
        )
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    #[default]
    I,
}

/// Field usage of a reference list entry.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FieldUse {
    #[default]
    Frame,
    TopField,
    BottomField,
}

/// Per-entry metadata of a reference picture list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceDetail {
    pub long_term: bool,
    pub picture_number: i32,
    pub pic_order_cnt: i32,
    pub usage: FieldUse,
}

/// One ordered reference picture list: decode frame indices plus per-entry
/// metadata, truncated to the active reference count of the slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceList {
    pub entries: Vec<(i64, ReferenceDetail)>,
}

impl ReferenceList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Snapshot of the reference picture lists for one slice: P list, B list 0
/// and B list 1.
pub const NUM_REF_FRAME_LISTS: usize = 3;
pub const P_REF_PIC_LIST: usize = 0;
pub const B_REF_PIC_LIST_0: usize = 1;
pub const B_REF_PIC_LIST_1: usize = 2;

/// Back-link from a frame descriptor to the codec-specific picture state
/// needed when the frame is revisited (deferred resolution, reverse-play
/// carry-over).
#[derive(Debug, Default, Clone)]
pub enum CodecFrameInfo {
    #[default]
    None,
    H264(crate::h264::H264FrameInfo),
}

/// The parsed frame descriptor. One per output frame or field, created when
/// the first slice of the picture is committed and mutated by the ordering
/// machinery until the deferred queue resolves it.
#[derive(Debug, Default)]
pub struct ParsedFrame {
    /// Index of this frame in decode order. Assigned when queued for decode.
    pub decode_frame_index: i64,
    /// Index of this frame in display order. `None` until the deferred
    /// output-order queue resolves it.
    pub display_frame_index: Option<i64>,
    /// Whether holes in the display index sequence before this frame should
    /// be collapsed by the downstream re-ordering loop.
    pub collapse_holes_in_display_indices: bool,

    pub native_playback_time: Option<u64>,
    pub normalized_playback_time: Option<u64>,
    pub native_decode_time: Option<u64>,
    pub normalized_decode_time: Option<u64>,

    /// Frame resets all prediction state (IDR, or I under the non-IDR
    /// resynchronization policy).
    pub key_frame: bool,
    /// Frame can be decoded without references.
    pub independent_frame: bool,
    /// Frame will be used as a prediction reference.
    pub reference_frame: bool,

    /// First parsed parameters for this output frame (first field of a pair,
    /// first slice of a picture).
    pub first_parsed_parameters_for_output_frame: bool,
    pub first_parsed_parameters_after_input_jump: bool,
    pub surplus_data_injected: bool,
    pub continuous_reverse_jump: bool,

    pub new_frame_parameters: bool,
    pub new_stream_parameters: bool,

    /// Reference picture lists for this slice, `None` when list construction
    /// failed (unsatisfied references, the "open group" marker in reverse
    /// play).
    pub reference_frame_lists: Option<[ReferenceList; NUM_REF_FRAME_LISTS]>,

    pub codec_info: CodecFrameInfo,
}

impl ParsedFrame {
    /// Whether this descriptor starts a brand new output frame, as opposed to
    /// a continuation slice or a second field.
    pub fn starts_new_output_frame(&self) -> bool {
        self.new_frame_parameters && self.first_parsed_parameters_for_output_frame
    }
}

/// Content parameters of the committed picture.
#[derive(Debug, Clone)]
pub struct VideoContent {
    pub width: u32,
    pub height: u32,
    pub decode_width: u32,
    pub decode_height: u32,
    pub frame_rate: Rational,
    pub pixel_aspect_ratio: Rational,
    pub progressive: bool,
}

impl Default for VideoContent {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            decode_width: 0,
            decode_height: 0,
            frame_rate: Rational::INVALID,
            pixel_aspect_ratio: Rational::new(1, 1),
            progressive: true,
        }
    }
}

impl VideoContent {
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }
}

/// Video parameters attached to each committed access unit.
#[derive(Debug, Clone, Default)]
pub struct VideoParams {
    pub content: VideoContent,
    pub picture_structure: PictureStructure,
    pub slice_type: SliceType,
    /// First slice of the picture. Continuation slices share the decode
    /// index of the first one.
    pub first_slice: bool,
    pub top_field_first: bool,
    /// Number of display fields contributed by the first and second field of
    /// this picture (3:2 pulldown can make these exceed one each).
    pub display_count: [u32; 2],
}

impl VideoParams {
    pub fn total_display_count(&self) -> i64 {
        i64::from(self.display_count[0]) + i64::from(self.display_count[1])
    }
}
