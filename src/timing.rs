// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Display and decode timing: translation between native timestamps and
//! normalized microseconds, generation of display/decode indices, PTS/DTS
//! interpolation and frame-rate resolution.

use log::debug;
use log::error;
use log::info;

use crate::frame::ParsedFrame;
use crate::frame::PictureStructure;
use crate::frame::VideoParams;
use crate::PlayDirection;
use crate::TimeFormat;

/// Deduced decode times further than this from the presentation time are
/// discarded (4 seconds, in microseconds).
const MAXIMUM_DECODE_TIME_OFFSET_US: u64 = 4_000_000;

/// We define matching as within 8 us, since expressing a frame time as a
/// 90 kHz tick count carries up to 5.56 us of error.
const FRAME_TIME_MATCH_WINDOW_US: i64 = 8;

/// A non-negative rational, used for frame and field rates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const INVALID: Rational = Rational { num: 0, den: 1 };

    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    /// Frame rates outside 7..=120 fps are treated as bogus.
    pub fn is_valid_frame_rate(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        let fps = u64::from(self.num) / u64::from(self.den);
        (7..=120).contains(&fps)
    }

    pub fn doubled(&self) -> Rational {
        Rational::new(self.num.saturating_mul(2), self.den)
    }

    /// Microseconds covered by `fields` display fields at this field rate,
    /// truncated like the integer part of the rational product.
    pub fn us_for_fields(&self, fields: i64) -> i64 {
        if !self.is_valid() {
            return 0;
        }
        1_000_000 * i64::from(self.den) * fields / i64::from(self.num)
    }

    /// Microseconds per frame, rounded.
    pub fn us_per_frame(&self) -> i64 {
        if !self.is_valid() {
            return 0;
        }
        (1_000_000 * i64::from(self.den) + i64::from(self.num) / 2) / i64::from(self.num)
    }
}

/// Translate a native timestamp to normalized microseconds.
pub fn native_to_normalized(native: u64, format: TimeFormat) -> u64 {
    match format {
        TimeFormat::Pts90kHz => native * 100 / 9,
        TimeFormat::Microseconds => native,
    }
}

/// Translate normalized microseconds back to a native timestamp.
pub fn normalized_to_native(normalized: u64, format: TimeFormat) -> u64 {
    match format {
        TimeFormat::Pts90kHz => normalized * 9 / 100,
        TimeFormat::Microseconds => normalized,
    }
}

/// Display/decode index bookkeeping and timestamp derivation for one
/// elementary stream.
pub struct TimingGenerator {
    pub next_display_frame_index: i64,
    pub next_display_field_index: i64,
    pub next_decode_frame_index: i64,
    pub next_decode_field_index: i64,

    collapse_holes_in_display_indices: bool,

    last_recorded_playback_field_index: i64,
    last_recorded_normalized_playback_time: Option<u64>,
    last_recorded_decode_field_index: i64,
    last_recorded_normalized_decode_time: Option<u64>,
    last_field_rate: Rational,

    /// Native timestamps latched from the current coded access unit. Sticky
    /// until consumed by the next committed picture.
    coded_playback_time: Option<u64>,
    coded_decode_time: Option<u64>,
    time_format: TimeFormat,

    /// Frame rate advertised by the container, if any.
    pub container_frame_rate: Rational,
    default_frame_rate: Rational,
    user_specified_default_frame_rate: bool,
    pts_deduced_frame_rate: Rational,
    standard_pts_deduced_frame_rate: bool,
    last_standard_pts_deduced_frame_rate: Rational,
    deduce_elapsed_fields: i64,
    deduce_elapsed_time_us: i64,
    last_resolved_frame_rate: Rational,
}

impl Default for TimingGenerator {
    fn default() -> Self {
        Self {
            next_display_frame_index: 0,
            next_display_field_index: 0,
            next_decode_frame_index: 0,
            next_decode_field_index: 0,
            collapse_holes_in_display_indices: true,
            last_recorded_playback_field_index: 0,
            last_recorded_normalized_playback_time: None,
            last_recorded_decode_field_index: 0,
            last_recorded_normalized_decode_time: None,
            last_field_rate: Rational::new(1, 1),
            coded_playback_time: None,
            coded_decode_time: None,
            time_format: TimeFormat::default(),
            container_frame_rate: Rational::INVALID,
            default_frame_rate: Rational::new(24, 1),
            user_specified_default_frame_rate: false,
            pts_deduced_frame_rate: Rational::INVALID,
            standard_pts_deduced_frame_rate: false,
            last_standard_pts_deduced_frame_rate: Rational::INVALID,
            deduce_elapsed_fields: 0,
            deduce_elapsed_time_us: 0,
            last_resolved_frame_rate: Rational::INVALID,
        }
    }
}

impl TimingGenerator {
    /// Latch the timestamps of the access unit under parse. They stick until
    /// the next committed picture consumes them.
    pub fn latch_coded_times(
        &mut self,
        playback: Option<u64>,
        decode: Option<u64>,
        format: TimeFormat,
    ) {
        if playback.is_some() {
            self.coded_playback_time = playback;
            self.time_format = format;
        }
        if decode.is_some() {
            self.coded_decode_time = decode;
        }
    }

    /// Invalidate the interpolation bases, e.g. across a discontinuity.
    pub fn reset_recorded_times(&mut self) {
        self.last_recorded_playback_field_index = 0;
        self.last_recorded_normalized_playback_time = None;
        self.last_recorded_decode_field_index = 0;
        self.last_recorded_normalized_decode_time = None;
        self.collapse_holes_in_display_indices = true;
    }

    /// Default-initialize the post-decode settings of a freshly committed
    /// picture, stamping the latched coded times onto it.
    pub fn initialize_post_decode_settings(&mut self, frame: &mut ParsedFrame) {
        frame.display_frame_index = None;
        frame.native_playback_time = None;
        frame.normalized_playback_time = None;
        frame.native_decode_time = None;
        frame.normalized_decode_time = None;

        if let Some(playback) = self.coded_playback_time.take() {
            frame.native_playback_time = Some(playback);
            frame.normalized_playback_time = Some(native_to_normalized(playback, self.time_format));
        }

        if let Some(mut decode) = self.coded_decode_time.take() {
            if let Some(playback) = frame.native_playback_time {
                if decode > playback {
                    info!("DTS {:#x} > PTS {:#x}, clamping", decode, playback);
                    decode = playback;
                }
                let offset_us = native_to_normalized(playback - decode, self.time_format);
                if offset_us >= MAXIMUM_DECODE_TIME_OFFSET_US {
                    error!(
                        "(PTS - DTS) ridiculously large ({} us), dropping decode time",
                        offset_us
                    );
                    return;
                }
            }
            frame.native_decode_time = Some(decode);
            frame.normalized_decode_time = Some(native_to_normalized(decode, self.time_format));
        }
    }

    /// Assign the display field/frame index and presentation time of one
    /// frame. Shared between the immediate path, both deferral mechanisms
    /// and the reverse-play walker.
    pub fn calculate_frame_index_and_pts(
        &mut self,
        frame: &mut ParsedFrame,
        video: &VideoParams,
        direction: PlayDirection,
    ) {
        let mut field_index;
        let display_fields = video.total_display_count();

        match direction {
            PlayDirection::Forward => {
                field_index = self.next_display_field_index;
                self.next_display_field_index += display_fields;
            }
            PlayDirection::Backward => {
                self.next_display_field_index -= display_fields;
                field_index = self.next_display_field_index;
            }
        }

        if !frame.first_parsed_parameters_for_output_frame {
            return;
        }

        // A field that is not the first one displayed belongs with the field
        // index of its pair. Picture-adaptive frame/field streams routinely
        // switch decode order (frame, top, bottom, bottom, top, ...).
        if video.picture_structure != PictureStructure::Frame
            && ((video.picture_structure == PictureStructure::TopField) != video.top_field_first)
        {
            field_index -= 1;
        }

        let derive_presentation_time = frame.normalized_playback_time.is_none();
        if derive_presentation_time {
            if let Some(base) = self.last_recorded_normalized_playback_time {
                let elapsed_fields = field_index - self.last_recorded_playback_field_index;
                let elapsed = self.last_field_rate.us_for_fields(elapsed_fields);
                let normalized = (base as i64 + elapsed).max(0) as u64;
                frame.normalized_playback_time = Some(normalized);
                frame.native_playback_time =
                    Some(normalized_to_native(normalized, self.time_format));
            }
        } else if let Some(last) = self.last_recorded_normalized_playback_time {
            // A real PTS pair lets us deduce the content frame rate.
            let progressive_scale = if video.content.progressive { 2 } else { 1 };
            self.deduce_elapsed_fields +=
                (field_index - self.last_recorded_playback_field_index) * progressive_scale;
            self.deduce_elapsed_time_us +=
                frame.normalized_playback_time.unwrap() as i64 - last as i64;

            if self.deduce_elapsed_time_us >= 200_000 && self.deduce_elapsed_fields >= 12 {
                let us_per_frame = 2 * self.deduce_elapsed_time_us / self.deduce_elapsed_fields;
                self.deduce_frame_rate_from_presentation_time(us_per_frame);
                self.deduce_elapsed_fields = 0;
                self.deduce_elapsed_time_us = 0;
            }
        }

        // Rebase the recorded times on a specified time, or when the field
        // rate changed under an interpolated one.
        let mut field_rate = video.content.frame_rate;
        if !video.content.progressive {
            field_rate = field_rate.doubled();
        }

        if !derive_presentation_time
            || (self.last_recorded_normalized_playback_time.is_some()
                && field_rate != self.last_field_rate)
        {
            self.last_recorded_playback_field_index = field_index;
            self.last_recorded_normalized_playback_time = frame.normalized_playback_time;
        }
        self.last_field_rate = field_rate;

        // Setting the display index releases the frame from the downstream
        // re-ordering loop, so it must come after the timing is in place.
        frame.display_frame_index = Some(self.next_display_frame_index);
        self.next_display_frame_index += 1;
        frame.collapse_holes_in_display_indices = self.collapse_holes_in_display_indices;
        self.collapse_holes_in_display_indices = false;

        debug!(
            "display index {} (PTS {:?})",
            frame.display_frame_index.unwrap(),
            frame.normalized_playback_time
        );
    }

    /// Derive the decode timestamp. Deduced decode times are jittered by up
    /// to a quarter of a frame period under 3:2 pulldown; the output timer
    /// tolerates that, and callers wanting accuracy should code DTS values.
    pub fn calculate_dts(&mut self, frame: &mut ParsedFrame, video: &VideoParams) {
        if !frame.first_parsed_parameters_for_output_frame {
            return;
        }

        match frame.normalized_decode_time {
            None => {
                if let Some(base) = self.last_recorded_normalized_decode_time {
                    let elapsed_fields =
                        self.next_decode_field_index - self.last_recorded_decode_field_index;
                    let mut field_rate = video.content.frame_rate;
                    if !video.content.progressive {
                        field_rate = field_rate.doubled();
                    }
                    let normalized =
                        (base as i64 + field_rate.us_for_fields(elapsed_fields)).max(0) as u64;
                    frame.normalized_decode_time = Some(normalized);
                    frame.native_decode_time =
                        Some(normalized_to_native(normalized, self.time_format));
                }
            }
            Some(normalized) => {
                self.last_recorded_decode_field_index = self.next_decode_field_index;
                self.last_recorded_normalized_decode_time = Some(normalized);
            }
        }
    }

    /// Collapse a measured microseconds-per-frame onto the standard
    /// broadcast rates, with hysteresis for non-standard but stable rates.
    fn deduce_frame_rate_from_presentation_time(&mut self, us_per_frame: i64) {
        let matches = |target: i64| {
            (target - FRAME_TIME_MATCH_WINDOW_US..=target + FRAME_TIME_MATCH_WINDOW_US)
                .contains(&us_per_frame)
        };

        if self.pts_deduced_frame_rate.is_valid_frame_rate() && self.standard_pts_deduced_frame_rate
        {
            if !matches(self.pts_deduced_frame_rate.us_per_frame()) {
                // Possibly just a glitch; force a recalculation next time
                // rather than switching immediately.
                self.standard_pts_deduced_frame_rate = false;
            }
            return;
        }

        self.standard_pts_deduced_frame_rate = true;
        self.pts_deduced_frame_rate = if matches(16_667) {
            Rational::new(60, 1)
        } else if matches(16_683) {
            Rational::new(60_000, 1001)
        } else if matches(20_000) {
            Rational::new(50, 1)
        } else if matches(33_333) {
            Rational::new(30, 1)
        } else if matches(33_367) {
            Rational::new(30_000, 1001)
        } else if matches(40_000) {
            Rational::new(25, 1)
        } else if matches(41_667) {
            Rational::new(24, 1)
        } else if matches(41_708) {
            Rational::new(24_000, 1001)
        } else if matches(66_733) {
            Rational::new(30_000 / 2, 1001)
        } else if matches(133_467) {
            Rational::new(30_000 / 4, 1001)
        } else {
            let measured = Rational::new(1_000_000, us_per_frame.max(1) as u32);
            if self.pts_deduced_frame_rate != measured {
                // Non-standard and changed since last time: not yet trusted.
                self.standard_pts_deduced_frame_rate = false;
            }
            measured
        };

        if self.standard_pts_deduced_frame_rate {
            if self.pts_deduced_frame_rate != self.last_standard_pts_deduced_frame_rate {
                info!(
                    "deduced frame rate {}/{} from presentation times",
                    self.pts_deduced_frame_rate.num, self.pts_deduced_frame_rate.den
                );
            }
            self.last_standard_pts_deduced_frame_rate = self.pts_deduced_frame_rate;
        }
    }

    /// Resolve the content frame rate from the available sources in
    /// precedence order.
    pub fn resolve_frame_rate(
        &mut self,
        stream_encoded: Rational,
        container: Rational,
        container_precedence: bool,
        use_pts_deduced_default: bool,
    ) -> Rational {
        if use_pts_deduced_default
            && !self.user_specified_default_frame_rate
            && self.pts_deduced_frame_rate.is_valid_frame_rate()
            && self.standard_pts_deduced_frame_rate
        {
            self.default_frame_rate = self.pts_deduced_frame_rate;
        }

        let resolved = if container_precedence && container.is_valid_frame_rate() {
            container
        } else if stream_encoded.is_valid_frame_rate() {
            stream_encoded
        } else if container.is_valid_frame_rate() {
            container
        } else if self.pts_deduced_frame_rate.is_valid_frame_rate()
            && self.standard_pts_deduced_frame_rate
        {
            self.pts_deduced_frame_rate
        } else if self.last_resolved_frame_rate.is_valid_frame_rate() {
            self.last_resolved_frame_rate
        } else {
            self.default_frame_rate
        };

        self.last_resolved_frame_rate = resolved;
        resolved
    }

    /// Force a specific default frame rate, disabling PTS-deduced adoption.
    pub fn set_default_frame_rate(&mut self, rate: Rational) {
        self.default_frame_rate = rate;
        self.user_specified_default_frame_rate = true;
    }

    pub fn pts_deduced_frame_rate(&self) -> Rational {
        if self.standard_pts_deduced_frame_rate {
            self.pts_deduced_frame_rate
        } else {
            Rational::INVALID
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::VideoContent;

    fn video(rate: Rational, progressive: bool) -> VideoParams {
        VideoParams {
            content: VideoContent {
                frame_rate: rate,
                progressive,
                ..Default::default()
            },
            picture_structure: PictureStructure::Frame,
            first_slice: true,
            display_count: [1, if progressive { 0 } else { 1 }],
            ..Default::default()
        }
    }

    #[test]
    fn native_translation_round_trip() {
        assert_eq!(native_to_normalized(90_000, TimeFormat::Pts90kHz), 1_000_000);
        assert_eq!(normalized_to_native(1_000_000, TimeFormat::Pts90kHz), 90_000);
        assert_eq!(native_to_normalized(1234, TimeFormat::Microseconds), 1234);
    }

    #[test]
    fn display_indices_are_contiguous_in_forward_play() {
        let mut timing = TimingGenerator::default();
        let video = video(Rational::new(25, 1), true);

        for expected in 0..4 {
            let mut frame = ParsedFrame {
                first_parsed_parameters_for_output_frame: true,
                ..Default::default()
            };
            timing.initialize_post_decode_settings(&mut frame);
            timing.calculate_frame_index_and_pts(&mut frame, &video, PlayDirection::Forward);
            assert_eq!(frame.display_frame_index, Some(expected));
        }
        assert_eq!(timing.next_display_field_index, 4);
    }

    #[test]
    fn pts_interpolation_follows_field_rate() {
        let mut timing = TimingGenerator::default();
        let video = video(Rational::new(25, 1), true);

        let mut first = ParsedFrame {
            first_parsed_parameters_for_output_frame: true,
            ..Default::default()
        };
        timing.latch_coded_times(Some(0), None, TimeFormat::Microseconds);
        timing.initialize_post_decode_settings(&mut first);
        timing.calculate_frame_index_and_pts(&mut first, &video, PlayDirection::Forward);
        assert_eq!(first.normalized_playback_time, Some(0));

        let mut second = ParsedFrame {
            first_parsed_parameters_for_output_frame: true,
            ..Default::default()
        };
        timing.initialize_post_decode_settings(&mut second);
        timing.calculate_frame_index_and_pts(&mut second, &video, PlayDirection::Forward);
        assert_eq!(second.normalized_playback_time, Some(40_000));
    }

    #[test]
    fn frame_rate_deduction_collapses_to_standard_rates() {
        let mut timing = TimingGenerator::default();
        timing.deduce_frame_rate_from_presentation_time(40_000);
        assert_eq!(timing.pts_deduced_frame_rate(), Rational::new(25, 1));

        timing.deduce_frame_rate_from_presentation_time(33_367);
        // One mismatch only clears the standard flag.
        assert_eq!(timing.pts_deduced_frame_rate(), Rational::INVALID);
        timing.deduce_frame_rate_from_presentation_time(33_367);
        assert_eq!(timing.pts_deduced_frame_rate(), Rational::new(30_000, 1001));
    }

    #[test]
    fn nonstandard_rate_adopted_after_two_matches() {
        let mut timing = TimingGenerator::default();
        timing.deduce_frame_rate_from_presentation_time(50_000);
        assert_eq!(timing.pts_deduced_frame_rate(), Rational::INVALID);
        timing.deduce_frame_rate_from_presentation_time(50_000);
        assert_eq!(timing.pts_deduced_frame_rate(), Rational::new(1_000_000, 50_000));
    }

    #[test]
    fn dts_clamped_to_pts() {
        let mut timing = TimingGenerator::default();
        let mut frame = ParsedFrame {
            first_parsed_parameters_for_output_frame: true,
            ..Default::default()
        };
        timing.latch_coded_times(Some(90_000), Some(95_000), TimeFormat::Pts90kHz);
        timing.initialize_post_decode_settings(&mut frame);
        assert_eq!(frame.native_decode_time, Some(90_000));
    }

    #[test]
    fn unreasonable_dts_is_dropped() {
        let mut timing = TimingGenerator::default();
        let mut frame = ParsedFrame {
            first_parsed_parameters_for_output_frame: true,
            ..Default::default()
        };
        // 10 seconds of PTS/DTS offset is beyond the 4 second limit.
        timing.latch_coded_times(Some(990_000), Some(90_000), TimeFormat::Pts90kHz);
        timing.initialize_post_decode_settings(&mut frame);
        assert_eq!(frame.native_decode_time, None);
        assert_eq!(frame.native_playback_time, Some(990_000));
    }

    #[test]
    fn frame_rate_precedence() {
        let mut timing = TimingGenerator::default();
        let stream = Rational::new(30, 1);
        let container = Rational::new(25, 1);

        assert_eq!(
            timing.resolve_frame_rate(stream, container, false, false),
            stream
        );
        assert_eq!(
            timing.resolve_frame_rate(stream, container, true, false),
            container
        );
        assert_eq!(
            timing.resolve_frame_rate(Rational::INVALID, Rational::INVALID, false, false),
            container,
            "falls back to the last resolved rate"
        );
    }
}
