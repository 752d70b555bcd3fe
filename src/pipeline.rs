// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The generic buffer-processing pipeline.
//!
//! [`FrameParser`] drives one elementary stream: it accepts coded access
//! units, routes them through header decoding and the forward or reverse
//! processing chain, and queues decode-ready units on the output port.
//! Codec-specific behaviour is supplied through the [`CodecParser`]
//! capability trait; the trait's default methods implement the single-slot
//! deferral used by codecs whose output order is resolvable one reference
//! frame at a time.

use std::collections::VecDeque;

use log::debug;
use log::error;
use log::info;

use crate::frame::FrameHandle;
use crate::frame::PictureStructure;
use crate::frame::VideoHandle;
use crate::pool::AccessUnit;
use crate::pool::CodedFrameBufferPool;
use crate::pool::UnitFlags;
use crate::pool::UnitToken;
use crate::ports::config_bits;
use crate::ports::DecodeUnit;
use crate::ports::DecoderCall;
use crate::ports::DecoderCommands;
use crate::ports::DecoderConfigChannel;
use crate::ports::OutputPort;
use crate::ports::Policy;
use crate::ports::PolicyQuery;
use crate::ports::PolicyValue;
use crate::ports::SequencePoint;
use crate::ports::Statistics;
use crate::timing::TimingGenerator;
use crate::FrameParserError;
use crate::PlayDirection;
use crate::Result;

/// After this many consecutive smooth-reverse failures we assume reverse
/// play just isn't practical for the stream.
const MAX_ALLOWED_SMOOTH_REVERSE_PLAY_FAILURES: u32 = 2;

/// Decode buffers that must stay available for the decoder to make
/// progress.
const MINIMUM_WORKING_DECODE_BUFFERS: usize = 2;

/// Static limits of the stream instance, fixed at connection time.
#[derive(Copy, Clone, Debug)]
pub struct ParserConfiguration {
    /// Capacity of the coded frame buffer pool.
    pub coded_frame_count: usize,
    /// Frame parameter records available downstream.
    pub frame_parameters_count: usize,
    /// Stream parameter records available downstream.
    pub stream_parameters_count: usize,
    /// Decode buffers available downstream.
    pub decode_buffer_count: usize,
    /// Maximum number of reference frames the codec stage can hold.
    pub max_reference_frame_count: usize,
}

impl Default for ParserConfiguration {
    fn default() -> Self {
        Self {
            coded_frame_count: 256,
            frame_parameters_count: 64,
            stream_parameters_count: 64,
            decode_buffer_count: 16,
            max_reference_frame_count: 16,
        }
    }
}

/// One parked picture of the single-slot deferral.
struct DeferredSlot {
    token: UnitToken,
    frame: FrameHandle,
    video: VideoHandle,
}

/// Post-decode settings state shared by the default (non-H.264) codec
/// behaviour: at most one deferred reference frame (plus its second field),
/// and the ring used to re-order settings generation during a reverse walk.
#[derive(Default)]
pub struct GenericSettingsQueue {
    first: Option<DeferredSlot>,
    second: Option<DeferredSlot>,
    pub rev_ring: VecDeque<(FrameHandle, VideoHandle)>,
}

impl GenericSettingsQueue {
    pub fn is_occupied(&self) -> bool {
        self.first.is_some()
    }

    fn resolve(
        slot: DeferredSlot,
        timing: &mut TimingGenerator,
        pool: &mut CodedFrameBufferPool,
        direction: PlayDirection,
    ) {
        timing.calculate_frame_index_and_pts(
            &mut slot.frame.borrow_mut(),
            &slot.video.borrow(),
            direction,
        );
        pool.release(slot.token);
    }

    /// Resolve whatever is parked, first field then second.
    pub fn process(
        &mut self,
        timing: &mut TimingGenerator,
        pool: &mut CodedFrameBufferPool,
        direction: PlayDirection,
    ) {
        if let Some(slot) = self.first.take() {
            Self::resolve(slot, timing, pool, direction);
            if let Some(second) = self.second.take() {
                Self::resolve(second, timing, pool, direction);
            }
        }
    }

    /// Park a reference frame (or its second field). The queue owns one
    /// claim on the unit.
    fn defer(
        &mut self,
        token: UnitToken,
        frame: FrameHandle,
        video: VideoHandle,
        timing: &mut TimingGenerator,
        pool: &mut CodedFrameBufferPool,
        direction: PlayDirection,
    ) {
        let pairing_broken = match &self.first {
            Some(first) => {
                let deferred_structure = first.video.borrow().picture_structure;
                let structure = video.borrow().picture_structure;
                if !deferred_structure.opposite_parity(structure) {
                    error!("deferred field/frame inconsistency - broken stream");
                    true
                } else if self.second.is_some() {
                    error!("repeated deferral of second field - broken stream");
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if pairing_broken {
            self.process(timing, pool, direction);
        }

        let slot = DeferredSlot {
            token,
            frame,
            video,
        };
        if self.first.is_some() {
            self.second = Some(slot);
        } else {
            self.first = Some(slot);
        }
    }
}

/// Borrowed view of the pipeline's services handed into codec hooks.
pub struct Host<'a> {
    pub pool: &'a mut CodedFrameBufferPool,
    pub timing: &'a mut TimingGenerator,
    pub output: &'a mut dyn OutputPort,
    pub decoder: &'a mut dyn DecoderCommands,
    pub policies: &'a dyn PolicyQuery,
    pub stats: &'a mut Statistics,
    pub settings: &'a mut GenericSettingsQueue,
    pub configuration: &'a ParserConfiguration,
    pub direction: PlayDirection,
    pub first_decode_after_input_jump: bool,
    pub surplus_data_injected: bool,
    pub continuous_reverse_jump: bool,
}

/// Per-codec capabilities composed by the pipeline driver. Default method
/// bodies implement the generic single-slot deferral; codecs with a real
/// re-ordering problem (H.264) override them.
pub trait CodecParser {
    /// Decode every header in the access unit, committing at most one new
    /// picture by attaching frame/video descriptors to the pool slot.
    /// Returns whether the unit produced a frame to decode.
    fn read_headers(&mut self, host: &mut Host, token: UnitToken) -> Result<bool>;

    /// Build the reference picture lists for the committed frame and store
    /// the snapshot on the descriptor.
    fn prepare_reference_list(&mut self, host: &mut Host, frame: &FrameHandle, video: &VideoHandle)
        -> Result<()>;

    /// Forward play: update reference bookkeeping after the frame was
    /// queued, releasing evicted references to the decoder.
    fn update_reference_frame_list(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) -> Result<()>;

    /// Drop every live reference, telling the decoder to do the same.
    fn reset_reference_frame_list(&mut self, host: &mut Host);

    /// Reverse play: record the frame in the reference bookkeeping without
    /// releasing anything to the decoder.
    fn rev_append_to_reference_frame_list(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) -> Result<()>;

    /// Reverse play: forget the reference list without releasing frames
    /// (they were released individually during the stack walk).
    fn rev_junk_reference_frame_list(&mut self);

    /// A discontinuity was inserted; forget any accumulated field-pairing
    /// state.
    fn note_input_jump(&mut self) {}

    /// Resolve previously queued post-decode settings that the current
    /// picture makes computable.
    fn process_queued_post_decode_settings(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) {
        let resolvable = {
            let frame = frame.borrow();
            let video = video.borrow();
            video.first_slice
                && frame.first_parsed_parameters_for_output_frame
                && frame.reference_frame
        };
        if resolvable && host.settings.is_occupied() {
            host.settings.process(host.timing, host.pool, host.direction);
        }
    }

    /// Generate (or defer) the display index and timestamps of the current
    /// picture, and derive its decode time.
    fn generate_post_decode_settings(
        &mut self,
        host: &mut Host,
        token: UnitToken,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) -> Result<()> {
        host.timing.initialize_post_decode_settings(&mut frame.borrow_mut());

        // In key-frame-only trick modes nothing downstream will resolve a
        // deferral, so independent frames are indexed immediately.
        let trick_mode = host.policies.policy_value(Policy::TrickModeDomain)
            == PolicyValue::TrickModeDecodeKeyFrames
            || host
                .policies
                .policy_value(Policy::StreamOnlyKeyFrames)
                .applies()
            || host.policies.policy_value(Policy::StreamDiscardFrames) == PolicyValue::KeyFramesOnly;
        if trick_mode && frame.borrow().independent_frame {
            host.settings.process(host.timing, host.pool, host.direction);
            host.timing.calculate_frame_index_and_pts(
                &mut frame.borrow_mut(),
                &video.borrow(),
                host.direction,
            );
            return Ok(());
        }

        if !frame.borrow().reference_frame {
            host.timing.calculate_frame_index_and_pts(
                &mut frame.borrow_mut(),
                &video.borrow(),
                host.direction,
            );
        } else {
            // Deferred so trick modes can discard the frame before decode;
            // the claim guarantees the descriptors stay valid until then.
            host.pool.claim(token);
            host.settings.defer(
                token,
                frame.clone(),
                video.clone(),
                host.timing,
                host.pool,
                host.direction,
            );
            host.timing.calculate_dts(&mut frame.borrow_mut(), &video.borrow());
        }
        Ok(())
    }

    /// Resolve everything still parked, as if a reference frame had
    /// arrived.
    fn purge_queued_post_decode_settings(&mut self, host: &mut Host) {
        host.settings.process(host.timing, host.pool, host.direction);
    }

    /// Reverse play, before the frame is stacked.
    fn rev_pre_queue_frame(&mut self, _host: &mut Host, _frame: &FrameHandle, _video: &VideoHandle) {
    }

    /// Reverse play, after the frame was stacked.
    fn rev_post_queue_frame(
        &mut self,
        _host: &mut Host,
        _token: UnitToken,
        _frame: &FrameHandle,
        _video: &VideoHandle,
    ) {
    }

    /// Reverse walk: generate post-decode settings for one entry of the
    /// single-frame stack, re-ordering through the ring so that a group
    /// I B B comes out numbered I=0, B=2, B=1.
    fn rev_generate_post_decode_settings(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) {
        if !frame.borrow().reference_frame {
            host.settings.rev_ring.push_back((frame.clone(), video.clone()));
            return;
        }

        host.timing.calculate_frame_index_and_pts(
            &mut frame.borrow_mut(),
            &video.borrow(),
            host.direction,
        );
        if frame.borrow().first_parsed_parameters_for_output_frame {
            while let Some((deferred_frame, deferred_video)) = host.settings.rev_ring.pop_front() {
                host.timing.calculate_frame_index_and_pts(
                    &mut deferred_frame.borrow_mut(),
                    &deferred_video.borrow(),
                    host.direction,
                );
            }
        }
    }

    /// Reverse walk: release a reference frame back to the decoder once its
    /// settings have been generated.
    fn rev_remove_reference_frame_from_list(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        _video: &VideoHandle,
    ) {
        host.decoder.call_in_sequence(
            SequencePoint::Immediate,
            DecoderCall::ReleaseReferenceFrame(frame.borrow().decode_frame_index),
        );
    }

    /// Reverse play: purge any codec-held post-decode settings.
    fn rev_purge_queued_post_decode_settings(&mut self, host: &mut Host) {
        host.settings.rev_ring.clear();
    }

    /// Reverse play: a carried-over open group is getting another chance;
    /// adjust any ordering state that moved while it waited.
    fn rev_next_sequence_frame_process(&mut self, _host: &mut Host, _frame: &FrameHandle) {}

    /// Reverse play: a stack walk has completed; the next backward jump
    /// starts a fresh sequence.
    fn rev_stacks_processed(&mut self) {}
}

#[derive(Default)]
struct ReverseState {
    /// Open groups awaiting a future key frame.
    unsatisfied: Vec<UnitToken>,
    /// All buffered units of the current backward run.
    decode: Vec<UnitToken>,
    /// Scratch space to re-linearize one picture's fields/slices.
    single_frame: Vec<UnitToken>,

    discarding: bool,
    accumulated_frames: u64,
    discarded_frames: u64,
    smooth_reverse_failures: u32,

    utilized_frame_parameters: usize,
    utilized_stream_parameters: usize,
    utilized_decode_buffers: usize,

    last_decode_was_independent_first_field: bool,
}

/// The pipeline driver for one elementary stream.
pub struct FrameParser<C: CodecParser> {
    codec: C,
    pool: CodedFrameBufferPool,
    timing: TimingGenerator,
    output: Box<dyn OutputPort>,
    decoder: Box<dyn DecoderCommands>,
    policies: Box<dyn PolicyQuery>,
    stats: Statistics,
    settings: GenericSettingsQueue,
    config_channel: DecoderConfigChannel,
    configuration: ParserConfiguration,
    reverse: ReverseState,

    direction: PlayDirection,
    stream_unplayable: bool,
    support_smooth_reverse: bool,
    first_decode_after_input_jump: bool,
    surplus_data_injected: bool,
    continuous_reverse_jump: bool,
    new_stream_parameters_seen_but_not_queued: bool,
}

impl<C: CodecParser> FrameParser<C> {
    pub fn new(
        codec: C,
        output: Box<dyn OutputPort>,
        decoder: Box<dyn DecoderCommands>,
        policies: Box<dyn PolicyQuery>,
        configuration: ParserConfiguration,
    ) -> Self {
        Self {
            codec,
            pool: CodedFrameBufferPool::new(configuration.coded_frame_count),
            timing: TimingGenerator::default(),
            output,
            decoder,
            policies,
            stats: Statistics::default(),
            settings: GenericSettingsQueue::default(),
            config_channel: DecoderConfigChannel::default(),
            configuration,
            reverse: ReverseState::default(),
            direction: PlayDirection::Forward,
            stream_unplayable: false,
            support_smooth_reverse: true,
            first_decode_after_input_jump: true,
            surplus_data_injected: false,
            continuous_reverse_jump: false,
            new_stream_parameters_seen_but_not_queued: false,
        }
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn config_channel(&self) -> &DecoderConfigChannel {
        &self.config_channel
    }

    pub fn direction(&self) -> PlayDirection {
        self.direction
    }

    pub fn set_direction(&mut self, direction: PlayDirection) {
        self.direction = direction;
    }

    pub fn timing(&self) -> &TimingGenerator {
        &self.timing
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &CodedFrameBufferPool {
        &self.pool
    }

    #[cfg(test)]
    pub(crate) fn reverse_stack_depths(&self) -> (usize, usize, usize) {
        (
            self.reverse.unsatisfied.len(),
            self.reverse.decode.len(),
            self.reverse.single_frame.len(),
        )
    }

    fn split(&mut self) -> (&mut C, Host<'_>) {
        (
            &mut self.codec,
            Host {
                pool: &mut self.pool,
                timing: &mut self.timing,
                output: self.output.as_mut(),
                decoder: self.decoder.as_mut(),
                policies: self.policies.as_ref(),
                stats: &mut self.stats,
                settings: &mut self.settings,
                configuration: &self.configuration,
                direction: self.direction,
                first_decode_after_input_jump: self.first_decode_after_input_jump,
                surplus_data_injected: self.surplus_data_injected,
                continuous_reverse_jump: self.continuous_reverse_jump,
            },
        )
    }

    /// Deliver one coded access unit for parsing.
    pub fn deliver(&mut self, unit: AccessUnit) -> Result<()> {
        if self.stream_unplayable {
            let error = FrameParserError::StreamUnplayable;
            self.stats.count_error(&error);
            return Err(error);
        }

        let flags = unit.flags;
        let token = match self.pool.commit(unit) {
            Ok(token) => token,
            Err(error) => {
                self.stats.count_error(&error);
                return Err(error);
            }
        };

        let status = self.process_buffer(token, flags);
        self.pool.release(token);

        if let Err(error) = &status {
            self.stats.count_error(error);
            if matches!(error, FrameParserError::StreamUnplayable) {
                self.stream_unplayable = true;
            }
        }
        status
    }

    /// Give up access to everything held: resolve or discard all parked
    /// state. Invoked on stream teardown.
    pub fn halt(&mut self) -> Result<()> {
        if self.direction == PlayDirection::Forward {
            let (codec, mut host) = self.split();
            codec.purge_queued_post_decode_settings(&mut host);
            Ok(())
        } else {
            self.rev_play_purge_decode_stacks()
        }
    }

    /// Reset per-stream failure state (stream reconnect). Re-enables smooth
    /// reverse play.
    pub fn reset(&mut self) {
        self.reverse.smooth_reverse_failures = 0;
        self.support_smooth_reverse = true;
        self.stream_unplayable = false;
        self.config_channel.reapply();
    }

    fn process_buffer(&mut self, token: UnitToken, flags: UnitFlags) -> Result<()> {
        if flags.stream_discontinuity {
            debug!("inserting discontinuity at parser level");
            if self.direction == PlayDirection::Backward && flags.continuous_reverse_jump {
                self.rev_play_process_decode_stacks()?;
            } else {
                if self.direction == PlayDirection::Forward {
                    let (codec, mut host) = self.split();
                    codec.purge_queued_post_decode_settings(&mut host);
                }
                if self.direction == PlayDirection::Backward
                    || !self.reverse.decode.is_empty()
                    || !self.reverse.unsatisfied.is_empty()
                {
                    self.rev_play_purge_decode_stacks()?;
                }
                self.timing.reset_recorded_times();
                let (codec, mut host) = self.split();
                codec.reset_reference_frame_list(&mut host);
            }

            self.codec.note_input_jump();
            self.first_decode_after_input_jump = true;
            self.surplus_data_injected = flags.flush_before_discontinuity;
            self.continuous_reverse_jump = flags.continuous_reverse_jump;
            self.decoder.call_in_sequence(
                SequencePoint::Immediate,
                DecoderCall::OutputPartialDecodeBuffers,
            );
        }

        let is_empty = self.pool.data(token).is_empty();
        let (playback, decode, format) = self.pool.times(token);

        if is_empty {
            // A marker frame: no flags, no data. Passed straight through.
            if !flags.stream_discontinuity {
                self.pool.claim(token);
                self.output.insert(DecodeUnit {
                    token,
                    frame: None,
                    video: None,
                });
                self.stats.marker_frames += 1;
            }
            return Ok(());
        }

        self.timing.latch_coded_times(playback, decode, format);

        let frame_to_decode = {
            let (codec, mut host) = self.split();
            codec.read_headers(&mut host, token)
        };
        let frame_to_decode = match frame_to_decode {
            Ok(frame_to_decode) => frame_to_decode,
            Err(error) => {
                self.pool.invalidate_metadata(token);
                if matches!(error, FrameParserError::HeaderSyntaxError) {
                    error!("syntax errors detected");
                }
                return Err(error);
            }
        };

        if !frame_to_decode {
            return Ok(());
        }

        // If the decode width/height were not overridden, use the stream's.
        if let Some(video) = self.pool.video(token) {
            let mut video = video.borrow_mut();
            if video.content.decode_width == 0 {
                video.content.decode_width = video.content.width;
            }
            if video.content.decode_height == 0 {
                video.content.decode_height = video.content.height;
            }
        }

        self.stats.frames_parsed += 1;

        match self.direction {
            PlayDirection::Forward => self.for_play_process_frame(token),
            PlayDirection::Backward => self.rev_play_process_frame(token),
        }
    }

    fn descriptors(&self, token: UnitToken) -> Result<(FrameHandle, VideoHandle)> {
        match (self.pool.frame(token), self.pool.video(token)) {
            (Some(frame), Some(video)) => Ok((frame, video)),
            _ => Err(FrameParserError::Implementation(
                "committed unit has no descriptors",
            )),
        }
    }

    fn for_play_process_frame(&mut self, token: UnitToken) -> Result<()> {
        let (frame, video) = self.descriptors(token)?;

        {
            let mut frame = frame.borrow_mut();
            if self.new_stream_parameters_seen_but_not_queued {
                frame.new_stream_parameters = true;
            } else if frame.new_stream_parameters {
                self.new_stream_parameters_seen_but_not_queued = true;
            }
        }

        {
            let (codec, mut host) = self.split();
            codec.prepare_reference_list(&mut host, &frame, &video)?;
            codec.process_queued_post_decode_settings(&mut host, &frame, &video);
            codec.generate_post_decode_settings(&mut host, token, &frame, &video)?;
        }

        self.queue_frame_for_decode(token, &frame, &video);

        self.first_decode_after_input_jump = false;
        self.surplus_data_injected = false;
        self.continuous_reverse_jump = false;

        {
            let (codec, mut host) = self.split();
            codec.update_reference_frame_list(&mut host, &frame, &video)?;
        }

        // Last thing before a stream termination: clean out the labellings.
        if self.pool.flags(token).followed_by_stream_terminate {
            let (codec, mut host) = self.split();
            codec.purge_queued_post_decode_settings(&mut host);
        }

        Ok(())
    }

    /// Assign the decode index and hand the unit to the output port.
    fn queue_frame_for_decode(&mut self, token: UnitToken, frame: &FrameHandle, video: &VideoHandle) {
        {
            let video = video.borrow();
            if !video.first_slice {
                // Continuation slices share the decode index of the first.
                self.timing.next_decode_frame_index -= 1;
            } else {
                match self.direction {
                    PlayDirection::Forward => {
                        self.timing.next_decode_field_index += video.total_display_count()
                    }
                    PlayDirection::Backward => {
                        self.timing.next_decode_field_index -= video.total_display_count()
                    }
                }
            }
        }

        {
            let mut frame = frame.borrow_mut();
            // An "independent" frame with a populated reference list is not
            // actually independent; the codec default was optimistic.
            if frame.independent_frame {
                if let Some(lists) = &frame.reference_frame_lists {
                    if lists.iter().any(|list| !list.is_empty()) {
                        frame.independent_frame = false;
                    }
                }
            }
            frame.decode_frame_index = self.timing.next_decode_frame_index;
        }
        self.timing.next_decode_frame_index += 1;

        self.new_stream_parameters_seen_but_not_queued = false;
        self.pool.claim(token);
        self.output.insert(DecodeUnit {
            token,
            frame: Some(frame.clone()),
            video: Some(video.clone()),
        });
        self.stats.frames_queued_for_decode += 1;
    }

    fn rev_play_process_frame(&mut self, token: UnitToken) -> Result<()> {
        let (frame, video) = self.descriptors(token)?;

        let (independent, second_field_of_independent, new_frame, display_fields) = {
            let frame = frame.borrow();
            let video = video.borrow();

            // A non-I second field of an I first field counts as I here.
            let second_field_of_independent = !self.first_decode_after_input_jump
                && self.reverse.last_decode_was_independent_first_field
                && !frame.first_parsed_parameters_for_output_frame;
            self.reverse.last_decode_was_independent_first_field = frame.independent_frame
                && frame.first_parsed_parameters_for_output_frame
                && video.picture_structure != PictureStructure::Frame;

            (
                frame.independent_frame,
                second_field_of_independent,
                frame.starts_new_output_frame(),
                video.total_display_count(),
            )
        };

        let smooth = self.support_smooth_reverse
            && self
                .policies
                .policy_value(Policy::SupportSmoothReversePlay)
                .applies();
        if !smooth && !independent && !second_field_of_independent {
            // Key frames only; keep the field count honest for timing.
            self.timing.next_display_field_index -= display_fields;
            return Ok(());
        }

        if !self.reverse.discarding {
            self.rev_play_check_resource_utilization(token)?;
        }

        if self.reverse.discarding {
            if new_frame {
                self.reverse.discarded_frames += 1;
            }
            return Ok(());
        }

        if new_frame {
            self.reverse.accumulated_frames += 1;
        }

        self.timing
            .initialize_post_decode_settings(&mut frame.borrow_mut());

        self.rev_play_queue_frame_for_decode(token, &frame, &video)?;

        self.first_decode_after_input_jump = false;
        self.surplus_data_injected = false;
        self.continuous_reverse_jump = false;

        let (codec, mut host) = self.split();
        codec.rev_append_to_reference_frame_list(&mut host, &frame, &video)
    }

    fn rev_play_queue_frame_for_decode(
        &mut self,
        token: UnitToken,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) -> Result<()> {
        {
            let (codec, mut host) = self.split();
            codec.rev_pre_queue_frame(&mut host, frame, video);
            if codec.prepare_reference_list(&mut host, frame, video).is_err() {
                frame.borrow_mut().reference_frame_lists = None;
            }
        }

        if frame.borrow().reference_frame {
            if frame.borrow().reference_frame_lists.is_none() {
                // Perfectly valid H.264 streams can do this; such streams
                // only reverse in IDR-synchronized mode.
                error!("insufficient reference frames for a reference frame in reverse play");
                self.reverse.discarding = true;
                self.reverse.smooth_reverse_failures += 1;
                return Err(FrameParserError::InsufficientReferenceFrames);
            }
            self.queue_frame_for_decode(token, frame, video);
        }

        // Reference or not, it goes on the stack for the next walk.
        self.pool.claim(token);
        self.reverse.decode.push(token);

        let (codec, mut host) = self.split();
        codec.rev_post_queue_frame(&mut host, token, frame, video);
        Ok(())
    }

    /// Count resource utilization and check whether smooth reverse can
    /// continue. Only called outside the discarding state.
    fn rev_play_check_resource_utilization(&mut self, token: UnitToken) -> Result<()> {
        let (frame, video) = self.descriptors(token)?;
        {
            let frame = frame.borrow();
            let video = video.borrow();

            if frame.new_frame_parameters && video.first_slice {
                self.reverse.utilized_frame_parameters += 1;
            }
            if frame.new_stream_parameters {
                self.reverse.utilized_stream_parameters += 1;
            }
            if video.first_slice
                && frame.first_parsed_parameters_for_output_frame
                && frame.reference_frame
            {
                self.reverse.utilized_decode_buffers += 1;
            }
        }

        // Resources needed up to this point use >= checks, resources needed
        // after it use > checks. 2x the working set for field decodes.
        let working = 2 * (MINIMUM_WORKING_DECODE_BUFFERS + 1);
        let over = |used: usize, available: usize, strictly: bool, what: &str| -> bool {
            let exceeded = if strictly {
                used > available
            } else {
                used >= available
            };
            if exceeded {
                info!("unable to smooth reverse ({})", what);
            }
            exceeded
        };

        let config = &self.configuration;
        let discarding = over(
            self.reverse.utilized_frame_parameters,
            config.frame_parameters_count.saturating_sub(working),
            true,
            "FrameParameters",
        ) || over(
            self.reverse.utilized_stream_parameters,
            config.stream_parameters_count.saturating_sub(working),
            false,
            "StreamParameters",
        ) || over(
            self.reverse.utilized_decode_buffers,
            config.decode_buffer_count.saturating_sub(3),
            true,
            "DecodeBuffers",
        ) || over(
            self.reverse.utilized_decode_buffers,
            config.max_reference_frame_count.saturating_sub(3),
            true,
            "ReferenceFrames",
        );

        // Transitioning to discard also purges the unsatisfied-reference
        // stack: their references will never be satisfied now.
        if discarding && !self.reverse.discarding {
            self.reverse.discarding = true;
            self.reverse.smooth_reverse_failures += 1;
            self.reverse.discarded_frames = 0;
            self.rev_play_purge_unsatisfied_reference_stack()?;
        }

        Ok(())
    }

    fn rev_play_clear_resource_utilization(&mut self) {
        self.reverse.utilized_frame_parameters = 0;
        self.reverse.utilized_stream_parameters = 0;
        self.reverse.utilized_decode_buffers = 0;
        self.reverse.discarding = false;
        self.reverse.accumulated_frames = 0;
        self.reverse.discarded_frames = 0;

        if self.reverse.smooth_reverse_failures > MAX_ALLOWED_SMOOTH_REVERSE_PLAY_FAILURES
            && self.support_smooth_reverse
        {
            info!("smooth reverse play disabled for this stream");
            self.support_smooth_reverse = false;
            self.config_channel.apply(config_bits::SMOOTH_REVERSE_DISABLED);
        }
    }

    /// Walk the stacks to re-linearize a backward-delivered run into
    /// forward decode order.
    fn rev_play_process_decode_stacks(&mut self) -> Result<()> {
        // Give last time's open groups another chance now that more of the
        // sequence is available.
        while let Some(token) = self.reverse.unsatisfied.pop() {
            let (frame, video) = self.descriptors(token)?;

            {
                let (codec, mut host) = self.split();
                codec.rev_next_sequence_frame_process(&mut host, &frame);
            }

            if frame.borrow().reference_frame_lists.is_none() {
                let prepared = {
                    let (codec, mut host) = self.split();
                    codec.prepare_reference_list(&mut host, &frame, &video)
                };
                if prepared.is_err() {
                    error!("insufficient reference frames for a deferred decode");
                    frame.borrow_mut().reference_frame_lists = None;
                    // Lose this frame.
                    self.pool.release(token);
                    continue;
                }
            }

            {
                let (codec, mut host) = self.split();
                let _ = codec.rev_append_to_reference_frame_list(&mut host, &frame, &video);
            }
            self.reverse.decode.push(token);
        }

        // Process the decode stack in reverse delivery order.
        'walk: while !self.reverse.decode.is_empty() {
            // Extract one picture onto the single-frame stack: individual
            // frames are always decoded in forward order.
            loop {
                let token = match self.reverse.decode.pop() {
                    Some(token) => token,
                    None => break,
                };
                self.reverse.single_frame.push(token);

                let frame = self
                    .pool
                    .frame(token)
                    .ok_or(FrameParserError::Implementation("stacked unit lost its frame"))?;
                let frame = frame.borrow();
                if frame.reference_frame_lists.is_none() {
                    // An open group: stop processing and carry everything
                    // left onto the unsatisfied-reference stack.
                    break 'walk;
                }
                if self.reverse.decode.is_empty()
                    || frame.first_parsed_parameters_for_output_frame
                {
                    break;
                }
            }

            // Drain the single picture in forward order.
            while let Some(token) = self.reverse.single_frame.pop() {
                let (frame, video) = self.descriptors(token)?;

                {
                    let (codec, mut host) = self.split();
                    codec.rev_generate_post_decode_settings(&mut host, &frame, &video);
                }

                if frame.borrow().reference_frame {
                    let (codec, mut host) = self.split();
                    codec.rev_remove_reference_frame_from_list(&mut host, &frame, &video);
                } else {
                    // Non-reference frames take the ordinary decode path;
                    // this cannot meaningfully fail, and even if it did we
                    // must carry on regardless.
                    self.queue_frame_for_decode(token, &frame, &video);
                }

                self.pool.release(token);
            }
        }

        self.rev_play_clear_resource_utilization();

        // The partially extracted picture goes back first, restoring the
        // reverse order of its fields/slices.
        while let Some(token) = self.reverse.single_frame.pop() {
            self.reverse.decode.push(token);
        }
        while let Some(token) = self.reverse.decode.pop() {
            self.reverse.unsatisfied.push(token);
            self.rev_play_check_resource_utilization(token)?;
        }

        // Junk the reference list; the frames themselves were released
        // individually during the walk.
        self.codec.rev_junk_reference_frame_list();
        self.settings.rev_ring.clear();
        self.codec.rev_stacks_processed();
        Ok(())
    }

    /// Discard everything on the stacks when reverse decode is abandoned.
    /// Reference frames still get settings generated so frames held in
    /// re-ordering are guaranteed to be released.
    fn rev_play_purge_decode_stacks(&mut self) -> Result<()> {
        while let Some(token) = self.reverse.unsatisfied.pop() {
            self.reverse.decode.push(token);
        }

        while let Some(token) = self.reverse.decode.pop() {
            let (frame, video) = self.descriptors(token)?;

            if frame.borrow().reference_frame {
                let (codec, mut host) = self.split();
                codec.rev_generate_post_decode_settings(&mut host, &frame, &video);
            }
            // Non-reference frames were never passed on; nobody else knows
            // about them.

            self.pool.release(token);
        }

        // Some codecs may still hold frames for post-decode settings.
        {
            let (codec, mut host) = self.split();
            codec.rev_purge_queued_post_decode_settings(&mut host);
        }

        self.rev_play_clear_resource_utilization();
        Ok(())
    }

    /// Walk only the unsatisfied-reference stack after a smooth-reverse
    /// failure, discarding everything on it.
    fn rev_play_purge_unsatisfied_reference_stack(&mut self) -> Result<()> {
        while let Some(token) = self.reverse.unsatisfied.pop() {
            let (frame, video) = self.descriptors(token)?;

            if frame.borrow().reference_frame {
                {
                    let (codec, mut host) = self.split();
                    codec.rev_generate_post_decode_settings(&mut host, &frame, &video);
                }
                // Not yet in the reference list, but the codec holds it as a
                // reference and must be told to let go.
                self.decoder.call_in_sequence(
                    SequencePoint::Immediate,
                    DecoderCall::ReleaseReferenceFrame(frame.borrow().decode_frame_index),
                );
            }

            if frame.borrow().starts_new_output_frame() {
                self.reverse.discarded_frames += 1;
            }

            self.pool.release(token);
        }
        Ok(())
    }
}
