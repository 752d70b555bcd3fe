// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The H.264 codec frontend: header decoding, picture order counts,
//! reference picture lists, reference marking and the multi-entry deferred
//! output-order queue.

use std::rc::Rc;

use log::debug;
use log::error;

use crate::deferred::DeferContext;
use crate::deferred::DeferredQueue;
use crate::frame::CodecFrameInfo;
use crate::frame::FrameHandle;
use crate::frame::ParsedFrame;
use crate::frame::PictureStructure;
use crate::frame::ReferenceList;
use crate::frame::SliceType as FrameSliceType;
use crate::frame::VideoHandle;
use crate::frame::VideoParams;
use crate::frame::NUM_REF_FRAME_LISTS;
use crate::h264::marking::mark_reference_pictures;
use crate::h264::marking::CurrentPicture;
use crate::h264::marking::MarkingSink;
use crate::h264::parser::split_nal_units;
use crate::h264::parser::NaluType;
use crate::h264::parser::Parser;
use crate::h264::parser::SeiPictureTiming;
use crate::h264::parser::SliceHeader;
use crate::h264::parser::SliceType;
use crate::h264::poc::PocContext;
use crate::h264::poc::PocResult;
use crate::h264::reflist::build_reference_lists;
use crate::h264::reflist::ListParams;
use crate::h264::reflist::ReferenceFrameTable;
use crate::pipeline::CodecParser;
use crate::pipeline::Host;
use crate::pool::CodedFrameBufferPool;
use crate::pool::UnitToken;
use crate::ports::DecoderCall;
use crate::ports::DecoderCommands;
use crate::ports::Policy;
use crate::ports::SequencePoint;
use crate::timing::Rational;
use crate::timing::TimingGenerator;
use crate::FrameParserError;
use crate::PlayDirection;
use crate::Result;

pub mod marking;
pub mod nalu_reader;
pub mod parser;
pub mod poc;
pub mod reflist;

/// Codec-side picture state carried on the frame descriptor.
#[derive(Debug, Clone)]
pub struct H264FrameInfo {
    pub hdr: SliceHeader,
    pub poc: PocResult,
}

/// Releases issued by the marking process: tell the decoder, then let the
/// deferred output-order queue resolve everything up to the released
/// picture's ordering key.
struct DecoderSink<'a> {
    decoder: &'a mut dyn DecoderCommands,
    deferred: &'a mut DeferredQueue,
    timing: &'a mut TimingGenerator,
    pool: &'a mut CodedFrameBufferPool,
    direction: PlayDirection,
}

impl MarkingSink for DecoderSink<'_> {
    fn release_reference(&mut self, decode_index: i64) {
        self.decoder.call_in_sequence(
            SequencePoint::Immediate,
            DecoderCall::ReleaseReferenceFrame(decode_index),
        );
    }

    fn slot_released(&mut self, decode_index: i64, extended_poc: u64) {
        self.decoder.call_in_sequence(
            SequencePoint::Immediate,
            DecoderCall::ReleaseReferenceFrame(decode_index),
        );
        let mut cx = DeferContext {
            timing: &mut *self.timing,
            pool: &mut *self.pool,
            direction: self.direction,
        };
        self.deferred.process_upto(extended_poc, &mut cx);
    }
}

#[derive(Default)]
pub struct H264Parser {
    parser: Parser,
    poc: PocContext,
    refs: ReferenceFrameTable,
    deferred: DeferredQueue,

    seen_an_idr: bool,
    pending_new_stream_parameters: bool,
    pending_pic_timing: Option<SeiPictureTiming>,

    // Field pairing accumulation across slices/units.
    accumulated_structure: PictureStructure,
    accumulated_frame_num: i32,
    accumulated_reference: bool,
    accumulated_video: Option<VideoHandle>,

    first_field_seen: bool,
    deduced_interlaced: bool,
    deduced_top_field_first: bool,
    last_field_extended_poc: u64,

    last_committed: Option<(FrameHandle, VideoHandle)>,

    // Constant POC-step detection for low-latency release.
    step_last_extended: Option<u64>,
    step_size: Option<u64>,
    step_run: u32,
    poc_step_trigger: bool,
}

impl H264Parser {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn reference_frames_in_use(&self) -> usize {
        self.refs.in_use()
    }

    #[cfg(test)]
    pub(crate) fn deferred_pending(&self) -> usize {
        self.deferred.pending()
    }

    fn frame_info(frame: &FrameHandle) -> Result<(SliceHeader, PocResult, i64)> {
        let frame = frame.borrow();
        match &frame.codec_info {
            CodecFrameInfo::H264(info) => {
                Ok((info.hdr.clone(), info.poc, frame.decode_frame_index))
            }
            _ => Err(FrameParserError::Implementation(
                "frame carries no H.264 picture state",
            )),
        }
    }

    /// Track constant-POC-step runs. A picture exactly continuing an
    /// established run can release its predecessor without waiting for the
    /// next reference frame.
    fn update_poc_step(&mut self, extended: u64) -> bool {
        let continues = match (self.step_last_extended, self.step_size) {
            (Some(last), Some(step)) => extended == last.wrapping_add(step),
            _ => false,
        };

        if continues {
            self.step_run += 1;
        } else if let Some(last) = self.step_last_extended {
            self.step_size = extended.checked_sub(last).filter(|&s| s > 0);
            self.step_run = 1;
        }
        self.step_last_extended = Some(extended);

        continues && self.step_run >= 2
    }

    fn commit_frame(&mut self, host: &mut Host, token: UnitToken, hdr: SliceHeader) -> Result<()> {
        let sps = Rc::clone(&hdr.sps);

        // Profile admission: main, high, baseline, or constraint-set-1
        // compatible.
        if !matches!(sps.profile_idc, 66 | 77 | 100) && !sps.constraint_set1_flag {
            error!("unsupported profile (profile_idc {})", sps.profile_idc);
            return Err(FrameParserError::StreamUnplayable);
        }

        // Resolution against the configured memory profile.
        let max = host
            .policies
            .policy_value(Policy::MemoryProfile)
            .max_resolution();
        if sps.width() > max.width || sps.height() > max.height {
            error!(
                "stream resolution {}x{} exceeds the memory profile limit {}x{}",
                sps.width(),
                sps.height(),
                max.width,
                max.height
            );
            return Err(FrameParserError::StreamUnplayable);
        }

        // A stream carrying picture timing delays orders output by DPB
        // values.
        let pic_timing = self.pending_pic_timing.take();
        if pic_timing.is_some() {
            self.poc.enable_dpb_ordering();
        }
        let dpb_output_delay = pic_timing.map(|t| t.dpb_output_delay).unwrap_or(0);

        let mut poc = self.poc.compute(&hdr, dpb_output_delay);

        let structure = if !hdr.field_pic {
            PictureStructure::Frame
        } else if hdr.bottom_field {
            PictureStructure::BottomField
        } else {
            PictureStructure::TopField
        };

        // Check whether the previous field was left unpaired: a repeated
        // structure, a whole frame, a reference-nature change or a frame
        // number change all mean its pair is never coming.
        if self.accumulated_structure != PictureStructure::Empty {
            let field_sequence_error = self.accumulated_structure == structure
                || structure == PictureStructure::Frame;
            let reference_nature_change = self.accumulated_reference != hdr.is_reference();
            let non_paired = field_sequence_error
                || reference_nature_change
                || self.accumulated_frame_num != hdr.frame_num;

            if non_paired {
                debug!("non-paired field promoted to a whole frame");
                if self.poc.display_order_by_dpb {
                    self.poc.base_dpb_value += 1;
                    poc.extended += 1;
                }
                if let Some(video) = &self.accumulated_video {
                    video.borrow_mut().display_count[0] = 2;
                }
                host.timing.next_decode_field_index += 1;
                host.decoder.call_in_sequence(
                    SequencePoint::Immediate,
                    DecoderCall::OutputPartialDecodeBuffers,
                );
                self.accumulated_structure = PictureStructure::Empty;
            }
        }

        let first_decode_of_frame = self.accumulated_structure == PictureStructure::Empty;
        self.accumulated_structure = if first_decode_of_frame && structure != PictureStructure::Frame
        {
            structure
        } else {
            PictureStructure::Empty
        };
        self.accumulated_frame_num = hdr.frame_num;
        self.accumulated_reference = hdr.is_reference();

        // Deduce interlacing and field order.
        if structure == PictureStructure::Frame {
            self.deduced_interlaced = poc.top != poc.bot;
            self.deduced_top_field_first = poc.top <= poc.bot;
        } else if !self.first_field_seen {
            self.deduced_interlaced = true;
            self.deduced_top_field_first = !hdr.bottom_field;
        } else if !first_decode_of_frame {
            self.deduced_interlaced = true;
            self.deduced_top_field_first = if hdr.bottom_field {
                self.last_field_extended_poc <= poc.extended
            } else {
                poc.extended <= self.last_field_extended_poc
            };
        }
        self.first_field_seen = true;
        self.last_field_extended_poc = poc.extended;

        if hdr.idr {
            self.seen_an_idr = true;
        }
        self.poc_step_trigger = if first_decode_of_frame {
            self.update_poc_step(poc.extended)
        } else {
            false
        };

        let key_frame = if host
            .policies
            .policy_value(Policy::AllowNonIdrResynchronization)
            .applies()
        {
            hdr.slice_type.is_i()
        } else {
            hdr.idr
        };

        let stream_rate = if sps.vui.timing_info_present && sps.vui.num_units_in_tick > 0 {
            Rational::new(sps.vui.time_scale, 2 * sps.vui.num_units_in_tick)
        } else {
            Rational::INVALID
        };
        let container_rate = host.timing.container_frame_rate;
        let frame_rate = host.timing.resolve_frame_rate(
            stream_rate,
            container_rate,
            host.policies
                .policy_value(Policy::ContainerFrameRatePrecedence)
                .applies(),
            host.policies
                .policy_value(Policy::UsePtsDeducedDefaultFrameRates)
                .applies(),
        );

        let progressive = sps.frame_mbs_only && !self.deduced_interlaced;

        let frame = ParsedFrame {
            key_frame,
            independent_frame: key_frame || hdr.slice_type.is_i(),
            reference_frame: hdr.is_reference(),
            first_parsed_parameters_for_output_frame: first_decode_of_frame,
            first_parsed_parameters_after_input_jump: host.first_decode_after_input_jump,
            surplus_data_injected: host.surplus_data_injected,
            continuous_reverse_jump: host.continuous_reverse_jump,
            new_frame_parameters: true,
            new_stream_parameters: self.pending_new_stream_parameters,
            codec_info: CodecFrameInfo::H264(H264FrameInfo {
                hdr: hdr.clone(),
                poc,
            }),
            ..Default::default()
        };
        self.pending_new_stream_parameters = false;

        let display_count = if structure == PictureStructure::Frame {
            [1, u32::from(!progressive)]
        } else {
            [1, 0]
        };

        let video = VideoParams {
            content: crate::frame::VideoContent {
                width: sps.width(),
                height: sps.height(),
                decode_width: 0,
                decode_height: 0,
                frame_rate,
                pixel_aspect_ratio: Rational::new(1, 1),
                progressive,
            },
            picture_structure: structure,
            slice_type: match hdr.slice_type {
                SliceType::B => FrameSliceType::B,
                SliceType::P | SliceType::Sp => FrameSliceType::P,
                SliceType::I | SliceType::Si => FrameSliceType::I,
            },
            first_slice: true,
            top_field_first: self.deduced_top_field_first,
            display_count,
        };

        let frame = FrameHandle::new(frame.into());
        let video = VideoHandle::new(video.into());
        host.pool
            .attach_metadata(token, frame.clone(), video.clone());
        self.accumulated_video = Some(video.clone());
        self.last_committed = Some((frame, video));
        Ok(())
    }

    /// A slice that continues the picture committed by an earlier unit:
    /// shares the codec state, rewinds nothing.
    fn commit_continuation_slice(&mut self, host: &mut Host, token: UnitToken) -> Result<()> {
        let (last_frame, last_video) = match &self.last_committed {
            Some(last) => last,
            None => {
                error!("continuation slice without a committed picture");
                return Err(FrameParserError::HeaderSyntaxError);
            }
        };

        let previous = last_frame.borrow();
        let frame = ParsedFrame {
            key_frame: previous.key_frame,
            independent_frame: previous.independent_frame,
            reference_frame: previous.reference_frame,
            first_parsed_parameters_for_output_frame: false,
            new_frame_parameters: false,
            new_stream_parameters: false,
            codec_info: previous.codec_info.clone(),
            ..Default::default()
        };
        let mut video = last_video.borrow().clone();
        video.first_slice = false;
        drop(previous);

        host.pool.attach_metadata(
            token,
            FrameHandle::new(frame.into()),
            VideoHandle::new(video.into()),
        );
        Ok(())
    }

    fn defer_key(&self, host: &Host, frame: &ParsedFrame, video: &VideoParams, poc: &PocResult) -> u64 {
        let mut key = poc.extended << 1;

        if !self.poc.display_order_by_dpb {
            // A field displayed second shares its pair's count; the +1
            // keeps the pair ordered within the key space.
            if video.picture_structure != PictureStructure::Frame
                && ((video.picture_structure == PictureStructure::TopField)
                    != video.top_field_first)
            {
                key += 1;
            }
        } else if frame.reference_frame
            && host
                .policies
                .policy_value(Policy::TreatDuplicateDpbValuesAsNonReferenceFrameFirst)
                .applies()
        {
            key += 1;
        }

        key
    }
}

impl CodecParser for H264Parser {
    fn read_headers(&mut self, host: &mut Host, token: UnitToken) -> Result<bool> {
        let data = host.pool.data(token);
        let mut frame_to_decode = false;

        for nalu in split_nal_units(&data) {
            let nalu = nalu?;
            match nalu.header.type_ {
                NaluType::Sps => {
                    self.parser.parse_sps(nalu.payload)?;
                    self.pending_new_stream_parameters = true;
                }
                NaluType::Pps => {
                    self.parser.parse_pps(nalu.payload)?;
                    self.pending_new_stream_parameters = true;
                }
                NaluType::Sei => {
                    if let Some(timing) = self.parser.parse_sei(nalu.payload)? {
                        self.pending_pic_timing = Some(timing);
                    }
                }
                NaluType::Slice | NaluType::SliceIdr => {
                    if frame_to_decode {
                        // Further slices of the same picture in this unit.
                        continue;
                    }
                    let hdr = self.parser.parse_slice_header(nalu.header, nalu.payload)?;
                    if hdr.first_mb_in_slice == 0 {
                        self.commit_frame(host, token, hdr)?;
                    } else {
                        self.commit_continuation_slice(host, token)?;
                    }
                    frame_to_decode = true;
                }
                _ => (),
            }
        }

        Ok(frame_to_decode)
    }

    fn prepare_reference_list(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        _video: &VideoHandle,
    ) -> Result<()> {
        let (hdr, poc, _) = Self::frame_info(frame)?;

        self.refs.num_reference_frames = hdr.sps.max_num_ref_frames as usize;
        self.refs
            .update_picture_numbers(hdr.frame_num, hdr.sps.max_frame_num(), hdr.field_pic);

        // One reference is trusted for B prediction once the stream has
        // produced an IDR; reverse play always demands the full two.
        let apply_two_ref_test_for_b =
            !self.seen_an_idr || host.direction == PlayDirection::Backward;

        let params = ListParams {
            slice_type: hdr.slice_type,
            field_pic: hdr.field_pic,
            bottom_field: hdr.bottom_field,
            poc: poc.poc,
            num_ref_idx_l0_active: hdr.num_ref_idx_l0_active(),
            num_ref_idx_l1_active: hdr.num_ref_idx_l1_active(),
            apply_two_ref_test_for_b,
        };
        let lists = build_reference_lists(&self.refs, &params)?;

        let mut frame = frame.borrow_mut();
        // Independent frames carry empty lists; populated lists would
        // contradict the flag downstream.
        frame.reference_frame_lists = if frame.independent_frame {
            Some(<[ReferenceList; NUM_REF_FRAME_LISTS]>::default())
        } else {
            Some(lists)
        };
        Ok(())
    }

    fn process_queued_post_decode_settings(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        _video: &VideoHandle,
    ) {
        let (first_parsed, reference, idr, extended) = {
            let frame = frame.borrow();
            let (idr, extended) = match &frame.codec_info {
                CodecFrameInfo::H264(info) => (info.hdr.idr, info.poc.extended),
                _ => return,
            };
            (
                frame.first_parsed_parameters_for_output_frame,
                frame.reference_frame,
                idr,
                extended,
            )
        };

        // An IDR or a non-reference picture bounds everything that can
        // still precede it in output; a constant POC step run releases
        // low-latency streams without waiting for the next reference.
        if first_parsed && (idr || !reference || self.poc_step_trigger) {
            let mut cx = DeferContext {
                timing: &mut *host.timing,
                pool: &mut *host.pool,
                direction: host.direction,
            };
            self.deferred.process_upto(extended, &mut cx);
        }
    }

    fn generate_post_decode_settings(
        &mut self,
        host: &mut Host,
        token: UnitToken,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) -> Result<()> {
        host.timing
            .initialize_post_decode_settings(&mut frame.borrow_mut());

        let (_, poc, _) = Self::frame_info(frame)?;
        let key = self.defer_key(host, &frame.borrow(), &video.borrow(), &poc);

        let max_deferrals = match host.direction {
            PlayDirection::Forward => host.configuration.decode_buffer_count,
            PlayDirection::Backward => host.configuration.coded_frame_count,
        };

        host.pool.claim(token);
        let outcome = {
            let mut cx = DeferContext {
                timing: &mut *host.timing,
                pool: &mut *host.pool,
                direction: host.direction,
            };
            self.deferred
                .defer(token, frame.clone(), video.clone(), key, max_deferrals, &mut cx)
        };

        if outcome.pts_newly_invalidated
            && self.poc.display_order_by_dpb
            && host
                .policies
                .policy_value(Policy::ValidateDpbValuesAgainstPtsValues)
                .applies()
        {
            self.poc.invalidate_dpb_ordering();
        }

        host.timing
            .calculate_dts(&mut frame.borrow_mut(), &video.borrow());
        Ok(())
    }

    fn purge_queued_post_decode_settings(&mut self, host: &mut Host) {
        let mut cx = DeferContext {
            timing: &mut *host.timing,
            pool: &mut *host.pool,
            direction: host.direction,
        };
        self.deferred.process_upto(u64::MAX, &mut cx);
    }

    fn update_reference_frame_list(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        _video: &VideoHandle,
    ) -> Result<()> {
        if !frame.borrow().reference_frame {
            return Ok(());
        }

        let (hdr, poc, decode_index) = Self::frame_info(frame)?;
        let cur = CurrentPicture {
            hdr: &hdr,
            poc,
            decode_index,
        };
        let mut sink = DecoderSink {
            decoder: &mut *host.decoder,
            deferred: &mut self.deferred,
            timing: &mut *host.timing,
            pool: &mut *host.pool,
            direction: host.direction,
        };

        match mark_reference_pictures(&mut self.refs, &mut self.poc, &cur, true, &mut sink) {
            Ok(()) => Ok(()),
            Err(error) => {
                // A table with nowhere to place a new reference cannot be
                // trusted any further.
                if matches!(error, FrameParserError::Implementation(_)) {
                    self.reset_reference_frame_list(host);
                }
                Err(error)
            }
        }
    }

    fn reset_reference_frame_list(&mut self, host: &mut Host) {
        host.decoder.call_in_sequence(
            SequencePoint::Immediate,
            DecoderCall::ReleaseAllReferenceFrames,
        );
        self.refs.reset();
    }

    fn rev_append_to_reference_frame_list(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        _video: &VideoHandle,
    ) -> Result<()> {
        if !frame.borrow().reference_frame {
            return Ok(());
        }

        let (hdr, poc, decode_index) = Self::frame_info(frame)?;
        let cur = CurrentPicture {
            hdr: &hdr,
            poc,
            decode_index,
        };
        let mut sink = DecoderSink {
            decoder: &mut *host.decoder,
            deferred: &mut self.deferred,
            timing: &mut *host.timing,
            pool: &mut *host.pool,
            direction: host.direction,
        };
        // Bookkeeping only: the stack walk releases frames to the decoder.
        mark_reference_pictures(&mut self.refs, &mut self.poc, &cur, false, &mut sink)
    }

    fn rev_junk_reference_frame_list(&mut self) {
        self.refs.reset();
    }

    fn note_input_jump(&mut self) {
        self.accumulated_structure = PictureStructure::Empty;
        self.accumulated_video = None;
    }

    fn rev_pre_queue_frame(&mut self, host: &mut Host, frame: &FrameHandle, video: &VideoHandle) {
        host.timing
            .calculate_dts(&mut frame.borrow_mut(), &video.borrow());
    }

    fn rev_post_queue_frame(
        &mut self,
        host: &mut Host,
        token: UnitToken,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) {
        // Every stacked picture enters the deferred table; the stack walk
        // resolves them downwards in display order.
        let poc = match Self::frame_info(frame) {
            Ok((_, poc, _)) => poc,
            Err(_) => return,
        };
        let key = self.defer_key(host, &frame.borrow(), &video.borrow(), &poc);

        host.pool.claim(token);
        let mut cx = DeferContext {
            timing: &mut *host.timing,
            pool: &mut *host.pool,
            direction: host.direction,
        };
        self.deferred.defer(
            token,
            frame.clone(),
            video.clone(),
            key,
            host.configuration.coded_frame_count,
            &mut cx,
        );
    }

    fn rev_generate_post_decode_settings(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        _video: &VideoHandle,
    ) {
        if let Ok((_, poc, _)) = Self::frame_info(frame) {
            let mut cx = DeferContext {
                timing: &mut *host.timing,
                pool: &mut *host.pool,
                direction: host.direction,
            };
            self.deferred.process_downto(poc.extended, &mut cx);
        }
    }

    fn rev_purge_queued_post_decode_settings(&mut self, host: &mut Host) {
        let mut cx = DeferContext {
            timing: &mut *host.timing,
            pool: &mut *host.pool,
            direction: host.direction,
        };
        self.deferred.process_downto(0, &mut cx);
    }

    fn rev_next_sequence_frame_process(&mut self, host: &mut Host, frame: &FrameHandle) {
        // When jumping backwards one group at a time, any positive movement
        // of the POC MSB during the group just processed must be reflected
        // in the frames held over from the following group.
        let mut frame = frame.borrow_mut();
        let info = match &mut frame.codec_info {
            CodecFrameInfo::H264(info) => info,
            _ => return,
        };
        if info.hdr.sps.pic_order_cnt_type != 0 {
            return;
        }

        let adjustment = self.poc.last_exit_pic_order_cnt_msb - info.poc.entry_msb;
        if adjustment != 0 {
            let mut cx = DeferContext {
                timing: &mut *host.timing,
                pool: &mut *host.pool,
                direction: host.direction,
            };
            self.deferred.process_downto(info.poc.extended, &mut cx);

            info.poc.top += adjustment;
            info.poc.bot += adjustment;
            info.poc.poc += adjustment;
            info.poc.extended = (info.poc.extended as i64 + i64::from(adjustment)) as u64;
        }

        self.poc.last_exit_pic_order_cnt_msb = info.poc.exit_msb;
        if !info.poc.exit_msb_forced {
            self.poc.last_exit_pic_order_cnt_msb += adjustment;
        }
    }

    fn rev_stacks_processed(&mut self) {
        // The next backward group starts a fresh sequence.
        self.seen_an_idr = false;
        self.poc.reset_previous();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::parser::test_stream::*;
    use super::*;
    use crate::pipeline::FrameParser;
    use crate::pipeline::ParserConfiguration;
    use crate::pool::AccessUnit;
    use crate::pool::UnitFlags;
    use crate::ports::DecodeUnit;
    use crate::ports::DefaultPolicies;
    use crate::ports::OutputPort;
    use crate::TimeFormat;

    /// Collects queued decode units so tests can inspect decode order and
    /// watch display indices resolve.
    #[derive(Default)]
    struct CollectingPort {
        queued: Rc<RefCell<Vec<DecodeUnit>>>,
    }

    impl OutputPort for CollectingPort {
        fn insert(&mut self, unit: DecodeUnit) {
            self.queued.borrow_mut().push(unit);
        }
    }

    #[derive(Default)]
    struct RecordingDecoder {
        calls: Rc<RefCell<Vec<DecoderCall>>>,
    }

    impl DecoderCommands for RecordingDecoder {
        fn call_in_sequence(&mut self, _point: SequencePoint, call: DecoderCall) {
            self.calls.borrow_mut().push(call);
        }
    }

    struct Fixture {
        parser: FrameParser<H264Parser>,
        queued: Rc<RefCell<Vec<DecodeUnit>>>,
        decoder_calls: Rc<RefCell<Vec<DecoderCall>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let port = CollectingPort::default();
            let queued = Rc::clone(&port.queued);
            let decoder = RecordingDecoder::default();
            let decoder_calls = Rc::clone(&decoder.calls);
            let parser = FrameParser::new(
                H264Parser::new(),
                Box::new(port),
                Box::new(decoder),
                Box::new(DefaultPolicies),
                ParserConfiguration::default(),
            );
            Self {
                parser,
                queued,
                decoder_calls,
            }
        }

        fn deliver(&mut self, data: Vec<u8>) -> crate::Result<()> {
            self.parser.deliver(AccessUnit {
                data,
                ..Default::default()
            })
        }

        fn deliver_with(
            &mut self,
            data: Vec<u8>,
            flags: UnitFlags,
            playback_time: Option<u64>,
        ) -> crate::Result<()> {
            self.parser.deliver(AccessUnit {
                data,
                flags,
                playback_time,
                decode_time: None,
                time_format: TimeFormat::Pts90kHz,
            })
        }

        fn display_indices(&self) -> Vec<Option<i64>> {
            self.queued
                .borrow()
                .iter()
                .map(|unit| unit.frame.as_ref().unwrap().borrow().display_frame_index)
                .collect()
        }
    }

    fn idr_unit() -> Vec<u8> {
        idr_unit_with_parameter_sets(
            &SpsSpec::default(),
            &PpsSpec::default(),
            &SliceSpec {
                idr: true,
                frame_num: 0,
                pic_order_cnt_lsb: 0,
                ..Default::default()
            },
        )
    }

    fn p_unit(frame_num: u32, lsb: u32) -> Vec<u8> {
        slice_unit(
            2,
            &SliceSpec {
                slice_type_coded: 5,
                frame_num,
                pic_order_cnt_lsb: lsb,
                ..Default::default()
            },
        )
    }

    fn b_unit(frame_num: u32, lsb: u32) -> Vec<u8> {
        slice_unit(
            0,
            &SliceSpec {
                slice_type_coded: 6,
                frame_num,
                pic_order_cnt_lsb: lsb,
                reference: false,
                ..Default::default()
            },
        )
    }

    #[test]
    fn idr_p_b_reorders_to_display_order() {
        // IDR(POC 0) -> P(POC 4) -> B(POC 2) in decode order must come out
        // in display order I, B, P with display indices 0, 1, 2.
        let mut f = Fixture::new();
        f.deliver(idr_unit()).unwrap();
        f.deliver(p_unit(1, 4)).unwrap();

        let mut flags = UnitFlags::default();
        flags.followed_by_stream_terminate = true;
        f.deliver_with(b_unit(2, 2), flags, None).unwrap();

        // Decode order is delivery order.
        let queued = f.queued.borrow();
        assert_eq!(queued.len(), 3);
        let decode_indices: Vec<i64> = queued
            .iter()
            .map(|u| u.frame.as_ref().unwrap().borrow().decode_frame_index)
            .collect();
        assert_eq!(decode_indices, vec![0, 1, 2]);
        drop(queued);

        // Display: I first, then B, then P.
        let display = f.display_indices();
        assert_eq!(display[0], Some(0)); // IDR
        assert_eq!(display[2], Some(1)); // B
        assert_eq!(display[1], Some(2)); // P
    }

    #[test]
    fn extended_poc_is_monotonic_over_committed_run() {
        let mut f = Fixture::new();
        f.deliver(idr_unit()).unwrap();
        for n in 1..8 {
            f.deliver(p_unit(n % 16, (2 * n) % 256)).unwrap();
        }

        let queued = f.queued.borrow();
        let mut last = 0u64;
        for unit in queued.iter() {
            let frame = unit.frame.as_ref().unwrap().borrow();
            let extended = match &frame.codec_info {
                CodecFrameInfo::H264(info) => info.poc.extended,
                _ => unreachable!(),
            };
            assert!(extended >= last);
            last = extended;
        }
    }

    #[test]
    fn b_frame_releases_deferred_predecessors() {
        let mut f = Fixture::new();
        f.deliver(idr_unit()).unwrap();
        f.deliver(p_unit(1, 4)).unwrap();
        // The non-reference B triggers resolution of everything below its
        // key: the IDR gets its display index without any flush.
        f.deliver(b_unit(2, 2)).unwrap();

        let display = f.display_indices();
        assert_eq!(display[0], Some(0));
        assert_eq!(display[1], None);
    }

    #[test]
    fn syntax_error_aborts_unit_and_stream_continues() {
        let mut f = Fixture::new();
        f.deliver(idr_unit()).unwrap();

        // A truncated slice NAL: reading past the end is a syntax error.
        let garbage = vec![0x00, 0x00, 0x01, 0x21, 0x80];
        assert!(matches!(
            f.deliver(garbage),
            Err(FrameParserError::HeaderSyntaxError)
        ));

        f.deliver(p_unit(1, 4)).unwrap();
        assert_eq!(f.queued.borrow().len(), 2);
        assert_eq!(f.parser.statistics().syntax_errors, 1);
    }

    #[test]
    fn slice_without_parameter_sets_is_missing_context() {
        let mut f = Fixture::new();
        assert!(matches!(
            f.deliver(p_unit(1, 4)),
            Err(FrameParserError::NoPictureParameters(0))
        ));
        assert_eq!(f.parser.statistics().missing_context_errors, 1);
    }

    #[test]
    fn marker_frame_passes_straight_through() {
        let mut f = Fixture::new();
        f.deliver(Vec::new()).unwrap();
        let queued = f.queued.borrow();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].frame.is_none());
    }

    #[test]
    fn reference_release_reaches_the_decoder() {
        let mut f = Fixture::new();
        // max_num_ref_frames is 4: the fifth reference evicts the oldest.
        f.deliver(idr_unit()).unwrap();
        for n in 1..6 {
            f.deliver(p_unit(n, (2 * n) % 256)).unwrap();
        }
        assert!(f
            .decoder_calls
            .borrow()
            .iter()
            .any(|c| matches!(c, DecoderCall::ReleaseReferenceFrame(0))));
    }

    #[test]
    fn reverse_discontinuity_purges_stacks_and_references() {
        // Three open-group pictures sit on the unsatisfied-reference stack;
        // a discontinuity without a continuous reverse jump must empty the
        // stacks and the reference list.
        let mut f = Fixture::new();
        f.deliver(idr_unit()).unwrap();
        let mut flags = UnitFlags::default();
        flags.followed_by_stream_terminate = true;
        f.deliver_with(p_unit(1, 4), flags, None).unwrap();

        f.parser.set_direction(crate::PlayDirection::Backward);

        // The jump into reverse play starts from a clean reference list.
        let mut flags = UnitFlags::default();
        flags.stream_discontinuity = true;
        f.deliver_with(Vec::new(), flags, None).unwrap();

        // Non-reference pictures with no references available stack up as
        // an open group.
        for n in 0..3u32 {
            f.deliver(b_unit(10 + n, (20 + 2 * n) % 256)).unwrap();
        }
        assert_eq!(f.parser.reverse_stack_depths(), (0, 3, 0));

        // A continuous reverse jump walks the stacks; the open group moves
        // to the unsatisfied-reference stack.
        let mut flags = UnitFlags::default();
        flags.stream_discontinuity = true;
        flags.continuous_reverse_jump = true;
        f.deliver_with(Vec::new(), flags, None).unwrap();
        assert_eq!(f.parser.reverse_stack_depths(), (3, 0, 0));

        // A hard discontinuity purges everything.
        let mut flags = UnitFlags::default();
        flags.stream_discontinuity = true;
        f.deliver_with(Vec::new(), flags, None).unwrap();

        assert_eq!(f.parser.reverse_stack_depths(), (0, 0, 0));
        assert_eq!(f.parser.codec().reference_frames_in_use(), 0);
        assert_eq!(f.parser.codec().deferred_pending(), 0);
        // Only the claims owned by the decode output port survive.
        assert_eq!(f.parser.pool().in_use(), f.queued.borrow().len());
    }

    #[test]
    fn reverse_reference_without_references_enters_discarding() {
        let mut f = Fixture::new();

        // Seed the parameter sets without committing a picture.
        let mut parameter_sets = annexb(3, NaluType::Sps, &build_sps(&SpsSpec::default()));
        parameter_sets.extend(annexb(3, NaluType::Pps, &build_pps(&PpsSpec::default())));
        f.deliver(parameter_sets).unwrap();

        f.parser.set_direction(crate::PlayDirection::Backward);

        // A reference frame whose list cannot be built fails loudly and
        // flips the engine into the discarding state.
        assert!(matches!(
            f.deliver(p_unit(1, 4)),
            Err(FrameParserError::InsufficientReferenceFrames)
        ));

        // Everything after that is silently dropped until the next clear.
        f.deliver(p_unit(2, 8)).unwrap();
        f.deliver(b_unit(3, 6)).unwrap();
        assert_eq!(f.queued.borrow().len(), 0);
        assert_eq!(f.parser.reverse_stack_depths(), (0, 0, 0));
    }

    #[test]
    fn forward_stack_claims_are_conserved() {
        // Every claim taken while frames travel through deferral must be
        // released by the time the stream is flushed.
        let mut f = Fixture::new();
        f.deliver(idr_unit()).unwrap();
        for n in 1..5 {
            f.deliver(p_unit(n, (4 * n) % 256)).unwrap();
        }
        f.parser.halt().unwrap();

        // Only the claims owned by the output port remain.
        let queued_claims = f.queued.borrow().len();
        assert_eq!(f.parser.pool().in_use(), queued_claims);
        assert_eq!(f.parser.codec().deferred_pending(), 0);
    }
}
