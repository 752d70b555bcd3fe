// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The MPEG-2 codec frontend. Output order is resolvable one reference
//! frame at a time, so the generic single-slot deferral of the pipeline
//! covers it; what remains here is header decoding and the two-slot
//! reference handling.

use log::debug;
use log::error;

use crate::frame::FieldUse;
use crate::frame::FrameHandle;
use crate::frame::ParsedFrame;
use crate::frame::PictureStructure;
use crate::frame::ReferenceDetail;
use crate::frame::ReferenceList;
use crate::frame::SliceType;
use crate::frame::VideoContent;
use crate::frame::VideoHandle;
use crate::frame::VideoParams;
use crate::frame::B_REF_PIC_LIST_0;
use crate::frame::B_REF_PIC_LIST_1;
use crate::frame::NUM_REF_FRAME_LISTS;
use crate::frame::P_REF_PIC_LIST;
use crate::h264::nalu_reader::NaluReader;
use crate::pipeline::CodecParser;
use crate::pipeline::Host;
use crate::pool::UnitToken;
use crate::ports::DecoderCall;
use crate::ports::Policy;
use crate::ports::SequencePoint;
use crate::timing::Rational;
use crate::FrameParserError;
use crate::Result;

const PICTURE_START_CODE: u8 = 0x00;
const SEQUENCE_HEADER_CODE: u8 = 0xb3;
const EXTENSION_START_CODE: u8 = 0xb5;
const GROUP_START_CODE: u8 = 0xb8;

const PICTURE_CODING_EXTENSION_ID: u32 = 8;

/// ISO 13818-2 frame rate codes.
const FRAME_RATES: [Rational; 9] = [
    Rational::INVALID,
    Rational { num: 24_000, den: 1001 },
    Rational { num: 24, den: 1 },
    Rational { num: 25, den: 1 },
    Rational { num: 30_000, den: 1001 },
    Rational { num: 30, den: 1 },
    Rational { num: 50, den: 1 },
    Rational { num: 60_000, den: 1001 },
    Rational { num: 60, den: 1 },
];

#[derive(Clone, Debug)]
struct SequenceHeader {
    width: u32,
    height: u32,
    frame_rate: Rational,
}

#[derive(Clone, Debug)]
struct PictureHeader {
    temporal_reference: u32,
    coding_type: u8,
}

#[derive(Clone, Debug)]
struct PictureCodingExtension {
    picture_structure: u32,
    top_field_first: bool,
    repeat_first_field: bool,
    progressive_frame: bool,
}

/// Split an MPEG-2 elementary stream chunk into start-code units.
fn split_units(data: &[u8]) -> Vec<(u8, &[u8])> {
    let mut units = Vec::new();
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    starts.push(data.len() + 3);

    for n in 0..starts.len().saturating_sub(1) {
        let begin = starts[n];
        let end = starts[n + 1] - 3;
        units.push((data[begin], &data[begin + 1..end]));
    }
    units
}

#[derive(Default)]
pub struct Mpeg2Parser {
    sequence: Option<SequenceHeader>,
    pending_new_stream_parameters: bool,

    /// Decode indices of the live references, oldest first. MPEG-2 never
    /// holds more than two.
    references: Vec<i64>,

    accumulated_structure: PictureStructure,
}

impl Mpeg2Parser {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn references(&self) -> &[i64] {
        &self.references
    }

    fn parse_sequence_header(&mut self, payload: &[u8]) -> Result<()> {
        let r = &mut NaluReader::with_emulation_prevention(payload, false);
        let width: u32 = r.read_bits(12).map_err(FrameParserError::from)?;
        let height: u32 = r.read_bits(12).map_err(FrameParserError::from)?;
        r.skip_bits(4).map_err(FrameParserError::from)?; // aspect_ratio_information
        let frame_rate_code: usize = r.read_bits(4).map_err(FrameParserError::from)?;

        let frame_rate = FRAME_RATES
            .get(frame_rate_code)
            .copied()
            .filter(|rate| rate.is_valid())
            .ok_or(FrameParserError::HeaderSyntaxError)?;

        let header = SequenceHeader {
            width,
            height,
            frame_rate,
        };
        debug!("sequence header {}x{}", header.width, header.height);

        self.pending_new_stream_parameters = true;
        self.sequence = Some(header);
        Ok(())
    }

    fn parse_picture_header(&self, payload: &[u8]) -> Result<PictureHeader> {
        let r = &mut NaluReader::with_emulation_prevention(payload, false);
        let temporal_reference: u32 = r.read_bits(10).map_err(FrameParserError::from)?;
        let coding_type: u8 = r.read_bits(3).map_err(FrameParserError::from)?;
        if !(1..=3).contains(&coding_type) {
            return Err(FrameParserError::HeaderSyntaxError);
        }
        Ok(PictureHeader {
            temporal_reference,
            coding_type,
        })
    }

    fn parse_picture_coding_extension(payload: &[u8]) -> Result<Option<PictureCodingExtension>> {
        let r = &mut NaluReader::with_emulation_prevention(payload, false);
        let id: u32 = r.read_bits(4).map_err(FrameParserError::from)?;
        if id != PICTURE_CODING_EXTENSION_ID {
            return Ok(None);
        }

        r.skip_bits(16).map_err(FrameParserError::from)?; // f_codes
        r.skip_bits(2).map_err(FrameParserError::from)?; // intra_dc_precision
        let picture_structure: u32 = r.read_bits(2).map_err(FrameParserError::from)?;
        let top_field_first = r.read_bit().map_err(FrameParserError::from)?;
        r.skip_bits(5).map_err(FrameParserError::from)?;
        let repeat_first_field = r.read_bit().map_err(FrameParserError::from)?;
        r.skip_bits(1).map_err(FrameParserError::from)?; // chroma_420_type
        let progressive_frame = r.read_bit().map_err(FrameParserError::from)?;

        Ok(Some(PictureCodingExtension {
            picture_structure,
            top_field_first,
            repeat_first_field,
            progressive_frame,
        }))
    }

    fn commit_picture(
        &mut self,
        host: &mut Host,
        token: UnitToken,
        picture: PictureHeader,
        extension: Option<PictureCodingExtension>,
    ) -> Result<()> {
        let sequence = self
            .sequence
            .clone()
            .ok_or(FrameParserError::NoStreamParameters)?;

        let max = host
            .policies
            .policy_value(Policy::MemoryProfile)
            .max_resolution();
        if sequence.width > max.width || sequence.height > max.height {
            error!(
                "stream resolution {}x{} exceeds the memory profile limit",
                sequence.width, sequence.height
            );
            return Err(FrameParserError::StreamUnplayable);
        }

        let structure = match extension.as_ref().map(|e| e.picture_structure) {
            Some(1) => PictureStructure::TopField,
            Some(2) => PictureStructure::BottomField,
            _ => PictureStructure::Frame,
        };

        // Minimal field pairing: the opposite parity directly following a
        // field opens no new output frame.
        let first_decode_of_frame = if structure == PictureStructure::Frame {
            self.accumulated_structure = PictureStructure::Empty;
            true
        } else if self.accumulated_structure.opposite_parity(structure) {
            self.accumulated_structure = PictureStructure::Empty;
            false
        } else {
            self.accumulated_structure = structure;
            true
        };

        let slice_type = match picture.coding_type {
            1 => SliceType::I,
            2 => SliceType::P,
            _ => SliceType::B,
        };
        let reference = slice_type != SliceType::B;
        let independent = slice_type == SliceType::I;

        let container_rate = host.timing.container_frame_rate;
        let frame_rate = host.timing.resolve_frame_rate(
            sequence.frame_rate,
            container_rate,
            host.policies
                .policy_value(Policy::ContainerFrameRatePrecedence)
                .applies(),
            host.policies
                .policy_value(Policy::UsePtsDeducedDefaultFrameRates)
                .applies(),
        );

        let (progressive, top_field_first, repeat_first_field) = match &extension {
            Some(e) => (e.progressive_frame, e.top_field_first, e.repeat_first_field),
            None => (true, true, false),
        };

        debug!(
            "picture temporal_reference {} type {:?}",
            picture.temporal_reference, slice_type
        );

        let frame = ParsedFrame {
            key_frame: independent,
            independent_frame: independent,
            reference_frame: reference,
            first_parsed_parameters_for_output_frame: first_decode_of_frame,
            first_parsed_parameters_after_input_jump: host.first_decode_after_input_jump,
            surplus_data_injected: host.surplus_data_injected,
            continuous_reverse_jump: host.continuous_reverse_jump,
            new_frame_parameters: true,
            new_stream_parameters: self.pending_new_stream_parameters,
            ..Default::default()
        };
        self.pending_new_stream_parameters = false;

        let display_count = if structure == PictureStructure::Frame {
            [
                1 + u32::from(repeat_first_field),
                u32::from(!progressive),
            ]
        } else {
            [1, 0]
        };

        let video = VideoParams {
            content: VideoContent {
                width: sequence.width,
                height: sequence.height,
                decode_width: 0,
                decode_height: 0,
                frame_rate,
                pixel_aspect_ratio: Rational::new(1, 1),
                progressive,
            },
            picture_structure: structure,
            slice_type,
            first_slice: true,
            top_field_first,
            display_count,
        };

        host.pool.attach_metadata(
            token,
            FrameHandle::new(frame.into()),
            VideoHandle::new(video.into()),
        );
        Ok(())
    }
}

impl CodecParser for Mpeg2Parser {
    fn read_headers(&mut self, host: &mut Host, token: UnitToken) -> Result<bool> {
        let data = host.pool.data(token);

        let mut picture: Option<PictureHeader> = None;
        let mut extension: Option<PictureCodingExtension> = None;

        for (code, payload) in split_units(&data) {
            match code {
                SEQUENCE_HEADER_CODE => self.parse_sequence_header(payload)?,
                PICTURE_START_CODE => {
                    if picture.is_none() {
                        picture = Some(self.parse_picture_header(payload)?);
                    }
                }
                EXTENSION_START_CODE => {
                    if picture.is_some() && extension.is_none() {
                        extension = Self::parse_picture_coding_extension(payload)?;
                    }
                }
                GROUP_START_CODE => (),
                _ => (),
            }
        }

        match picture {
            Some(picture) => {
                self.commit_picture(host, token, picture, extension)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn prepare_reference_list(
        &mut self,
        _host: &mut Host,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) -> Result<()> {
        let slice_type = video.borrow().slice_type;

        let detail = ReferenceDetail {
            long_term: false,
            picture_number: 0,
            pic_order_cnt: 0,
            usage: FieldUse::Frame,
        };

        let mut lists = <[ReferenceList; NUM_REF_FRAME_LISTS]>::default();
        match slice_type {
            SliceType::I => (),
            SliceType::P => {
                let newest = *self
                    .references
                    .last()
                    .ok_or(FrameParserError::InsufficientReferenceFrames)?;
                lists[P_REF_PIC_LIST].entries.push((newest, detail));
            }
            SliceType::B => {
                if self.references.len() < 2 {
                    return Err(FrameParserError::InsufficientReferenceFrames);
                }
                lists[B_REF_PIC_LIST_0]
                    .entries
                    .push((self.references[0], detail));
                lists[B_REF_PIC_LIST_1]
                    .entries
                    .push((self.references[1], detail));
            }
        }

        let mut frame = frame.borrow_mut();
        frame.reference_frame_lists = if frame.independent_frame {
            Some(Default::default())
        } else {
            Some(lists)
        };
        Ok(())
    }

    fn update_reference_frame_list(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) -> Result<()> {
        let frame = frame.borrow();
        if !frame.reference_frame {
            return Ok(());
        }

        // Only the last field of a picture enters the list; a first field
        // leaves the slot to its pair.
        let last_field = video.borrow().picture_structure == PictureStructure::Frame
            || !frame.first_parsed_parameters_for_output_frame;
        if !last_field {
            return Ok(());
        }

        if self.references.len() >= 2 {
            let released = self.references.remove(0);
            host.decoder.call_in_sequence(
                SequencePoint::Immediate,
                DecoderCall::ReleaseReferenceFrame(released),
            );
        }
        self.references.push(frame.decode_frame_index);
        Ok(())
    }

    fn reset_reference_frame_list(&mut self, host: &mut Host) {
        host.decoder.call_in_sequence(
            SequencePoint::Immediate,
            DecoderCall::ReleaseAllReferenceFrames,
        );
        self.references.clear();
    }

    fn rev_append_to_reference_frame_list(
        &mut self,
        _host: &mut Host,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) -> Result<()> {
        let frame = frame.borrow();
        let last_field = video.borrow().picture_structure == PictureStructure::Frame
            || !frame.first_parsed_parameters_for_output_frame;

        if frame.reference_frame && last_field {
            if self.references.len() >= 2 {
                error!("reference list full - implementation error");
                return Err(FrameParserError::Implementation(
                    "reverse reference list overflow",
                ));
            }
            self.references.push(frame.decode_frame_index);
        }
        Ok(())
    }

    fn rev_remove_reference_frame_from_list(
        &mut self,
        host: &mut Host,
        frame: &FrameHandle,
        video: &VideoHandle,
    ) {
        let decode_index = frame.borrow().decode_frame_index;
        let last_field = video.borrow().picture_structure == PictureStructure::Frame
            || !frame.borrow().first_parsed_parameters_for_output_frame;

        if !self.references.is_empty() {
            host.decoder.call_in_sequence(
                SequencePoint::Immediate,
                DecoderCall::ReleaseReferenceFrame(decode_index),
            );
            if last_field {
                self.references.pop();
            }
        }
    }

    fn rev_junk_reference_frame_list(&mut self) {
        self.references.clear();
    }

    fn note_input_jump(&mut self) {
        self.accumulated_structure = PictureStructure::Empty;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::h264::parser::test_stream::BitWriter;
    use crate::pipeline::FrameParser;
    use crate::pipeline::ParserConfiguration;
    use crate::pool::AccessUnit;
    use crate::ports::DecodeUnit;
    use crate::ports::DecoderCommands;
    use crate::ports::DefaultPolicies;
    use crate::ports::OutputPort;

    fn sequence_header_unit() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_bits(720, 12);
        w.put_bits(576, 12);
        w.put_bits(1, 4); // aspect_ratio_information
        w.put_bits(3, 4); // frame_rate_code: 25 fps
        w.put_bits(0x3ffff, 18); // bit_rate
        w.put_bit(true); // marker
        w.put_bits(112, 10); // vbv_buffer_size
        w.put_bit(false); // constrained_parameters
        w.put_bit(false); // load_intra_quantiser_matrix
        w.put_bit(false); // load_non_intra_quantiser_matrix
        let mut unit = vec![0x00, 0x00, 0x01, SEQUENCE_HEADER_CODE];
        unit.extend(w.finish());
        unit
    }

    fn picture_unit(temporal_reference: u32, coding_type: u8) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_bits(temporal_reference, 10);
        w.put_bits(u32::from(coding_type), 3);
        w.put_bits(0xffff, 16); // vbv_delay
        if coding_type == 2 || coding_type == 3 {
            w.put_bit(false);
            w.put_bits(7, 3);
        }
        if coding_type == 3 {
            w.put_bit(false);
            w.put_bits(7, 3);
        }
        let mut unit = vec![0x00, 0x00, 0x01, PICTURE_START_CODE];
        unit.extend(w.finish());
        unit
    }

    #[derive(Default)]
    struct CollectingPort {
        queued: Rc<RefCell<Vec<DecodeUnit>>>,
    }

    impl OutputPort for CollectingPort {
        fn insert(&mut self, unit: DecodeUnit) {
            self.queued.borrow_mut().push(unit);
        }
    }

    struct NullDecoder;

    impl DecoderCommands for NullDecoder {
        fn call_in_sequence(&mut self, _point: SequencePoint, _call: DecoderCall) {}
    }

    struct Fixture {
        parser: FrameParser<Mpeg2Parser>,
        queued: Rc<RefCell<Vec<DecodeUnit>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let port = CollectingPort::default();
            let queued = Rc::clone(&port.queued);
            let parser = FrameParser::new(
                Mpeg2Parser::new(),
                Box::new(port),
                Box::new(NullDecoder),
                Box::new(DefaultPolicies),
                ParserConfiguration::default(),
            );
            Self { parser, queued }
        }

        fn deliver(&mut self, data: Vec<u8>) -> crate::Result<()> {
            self.parser.deliver(AccessUnit {
                data,
                ..Default::default()
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

    #[test]
    fn sequence_header_parses() {
        let mut parser = Mpeg2Parser::new();
        let unit = sequence_header_unit();
        let units = split_units(&unit);
        assert_eq!(units.len(), 1);
        parser.parse_sequence_header(units[0].1).unwrap();
        let sequence = parser.sequence.as_ref().unwrap();
        assert_eq!(sequence.width, 720);
        assert_eq!(sequence.height, 576);
        assert_eq!(sequence.frame_rate, Rational::new(25, 1));
    }

    #[test]
    fn picture_before_sequence_header_is_missing_context() {
        let mut f = Fixture::new();
        assert!(matches!(
            f.deliver(picture_unit(0, 1)),
            Err(FrameParserError::NoStreamParameters)
        ));
    }

    #[test]
    fn i_p_b_b_resolves_to_display_order() {
        // Decode order I P B B displays as I B B P with contiguous
        // indices: the single-slot deferral holds each reference until the
        // next one arrives.
        let mut f = Fixture::new();
        let mut first = sequence_header_unit();
        first.extend(picture_unit(0, 1)); // I
        f.deliver(first).unwrap();
        f.deliver(picture_unit(3, 2)).unwrap(); // P
        f.deliver(picture_unit(1, 3)).unwrap(); // B
        f.deliver(picture_unit(2, 3)).unwrap(); // B
        f.parser.halt().unwrap();

        let display = f.display_indices();
        assert_eq!(display, vec![Some(0), Some(3), Some(1), Some(2)]);
    }

    #[test]
    fn b_without_two_references_is_insufficient() {
        let mut f = Fixture::new();
        let mut first = sequence_header_unit();
        first.extend(picture_unit(0, 1));
        f.deliver(first).unwrap();

        assert!(matches!(
            f.deliver(picture_unit(1, 3)),
            Err(FrameParserError::InsufficientReferenceFrames)
        ));
        assert_eq!(
            f.parser.statistics().insufficient_reference_errors,
            1
        );
    }

    #[test]
    fn p_frames_rotate_the_reference_slots() {
        let mut f = Fixture::new();
        let mut first = sequence_header_unit();
        first.extend(picture_unit(0, 1));
        f.deliver(first).unwrap();
        for n in 1..4 {
            f.deliver(picture_unit(n, 2)).unwrap();
        }
        assert_eq!(f.parser.codec().references(), &[2, 3]);
    }
}
