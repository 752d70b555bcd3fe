// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed H.264 header records and their decoding.
//!
//! Only the subset of the syntax consumed by the cross-frame algorithms is
//! retained in the records; the rest of each NAL unit is parsed far enough
//! to keep the bit cursor honest and then skipped.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::debug;

use crate::h264::nalu_reader::NaluReader;
use crate::h264::nalu_reader::NaluReaderError;
use crate::FrameParserError;
use crate::Result;

pub const MAX_SPS_COUNT: u32 = 32;
pub const MAX_PPS_COUNT: u32 = 256;

impl From<NaluReaderError> for FrameParserError {
    fn from(error: NaluReaderError) -> Self {
        debug!("bitstream read error: {}", error);
        FrameParserError::HeaderSyntaxError
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    Filler = 12,
}

impl NaluType {
    pub fn from_type_field(value: u8) -> NaluType {
        match value {
            1 => NaluType::Slice,
            2 => NaluType::SliceDpa,
            3 => NaluType::SliceDpb,
            4 => NaluType::SliceDpc,
            5 => NaluType::SliceIdr,
            6 => NaluType::Sei,
            7 => NaluType::Sps,
            8 => NaluType::Pps,
            9 => NaluType::AuDelimiter,
            10 => NaluType::SeqEnd,
            11 => NaluType::StreamEnd,
            12 => NaluType::Filler,
            _ => NaluType::Unknown,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct NaluHeader {
    pub ref_idc: u8,
    pub type_: NaluType,
}

impl NaluHeader {
    pub fn parse(byte: u8) -> Result<NaluHeader> {
        if byte & 0x80 != 0 {
            // forbidden_zero_bit
            return Err(FrameParserError::HeaderSyntaxError);
        }
        Ok(NaluHeader {
            ref_idc: (byte >> 5) & 0x3,
            type_: NaluType::from_type_field(byte & 0x1f),
        })
    }

    pub fn idr_pic_flag(&self) -> bool {
        self.type_ == NaluType::SliceIdr
    }
}

/// One NAL unit: header plus RBSP payload (still escaped).
pub struct Nalu<'a> {
    pub header: NaluHeader,
    pub payload: &'a [u8],
}

/// Split a start-code-delimited access unit into its NAL units.
pub fn split_nal_units(data: &[u8]) -> impl Iterator<Item = Result<Nalu<'_>>> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    starts.push(data.len() + 3);

    (0..starts.len().saturating_sub(1)).map(move |n| {
        let begin = starts[n];
        let mut end = starts[n + 1] - 3;
        // The start code may have been coded with a leading zero byte.
        if end > begin && data[end - 1] == 0 {
            end -= 1;
        }
        if begin >= end {
            return Err(FrameParserError::HeaderSyntaxError);
        }
        Ok(Nalu {
            header: NaluHeader::parse(data[begin])?,
            payload: &data[begin + 1..end],
        })
    })
}

#[derive(Clone, Debug, Default)]
pub struct HrdParams {
    pub cpb_cnt_minus1: u32,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

#[derive(Clone, Debug, Default)]
pub struct VuiParams {
    pub aspect_ratio_idc: u8,
    pub sar_width: u32,
    pub sar_height: u32,
    pub matrix_coefficients: u8,
    pub timing_info_present: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate: bool,
    pub nal_hrd: Option<HrdParams>,
    pub vcl_hrd: Option<HrdParams>,
    pub pic_struct_present: bool,
    pub bitstream_restriction: bool,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

impl VuiParams {
    /// Whether SEI picture timing messages carry the CPB/DPB delay pair.
    pub fn cpb_dpb_delays_present(&self) -> bool {
        self.nal_hrd.is_some() || self.vcl_hrd.is_some()
    }

    fn delay_hrd(&self) -> Option<&HrdParams> {
        self.nal_hrd.as_ref().or(self.vcl_hrd.as_ref())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_set1_flag: bool,
    pub constraint_set3_flag: bool,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane: bool,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offset_for_ref_frame: Vec<i32>,
    pub max_num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed: bool,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only: bool,
    pub mb_adaptive_frame_field: bool,
    pub vui_parameters_present: bool,
    pub vui: VuiParams,
}

impl Sps {
    pub fn max_frame_num(&self) -> i32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    pub fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 + 1) * 16
    }

    pub fn height(&self) -> u32 {
        let height = (self.pic_height_in_map_units_minus1 + 1) * 16;
        if self.frame_mbs_only {
            height
        } else {
            height * 2
        }
    }

    pub fn chroma_array_type(&self) -> u8 {
        if self.separate_colour_plane {
            0
        } else {
            self.chroma_format_idc
        }
    }

    pub fn expected_delta_per_pic_order_cnt_cycle(&self) -> i32 {
        self.offset_for_ref_frame.iter().sum()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub bottom_field_pic_order_in_frame_present: bool,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub weighted_pred: bool,
    pub weighted_bipred_idc: u8,
    pub redundant_pic_cnt_present: bool,
}

/// One memory management control operation of an adaptive marking list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MmcoOp {
    /// MMCO 1: mark a short-term picture unused by relative pic num.
    ForgetShort { difference_of_pic_nums_minus1: u32 },
    /// MMCO 2: mark a long-term picture unused by long-term pic num.
    ForgetLong { long_term_pic_num: u32 },
    /// MMCO 3: promote a short-term picture to a long-term index.
    ShortToLong {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    /// MMCO 4: set the maximum long-term index, evicting above it.
    MaxLongTermIdx { max_long_term_frame_idx_plus1: u32 },
    /// MMCO 5: clear the entire reference set.
    Clear,
    /// MMCO 6: assign a long-term index to the current picture.
    CurrentToLong { long_term_frame_idx: u32 },
}

#[derive(Clone, Debug, Default)]
pub struct RefPicMarking {
    /// IDR only: the current picture becomes a long-term reference.
    pub long_term_reference_flag: bool,
    /// Non-IDR: explicit operations follow instead of the sliding window.
    pub adaptive_ref_pic_marking_mode: bool,
    pub ops: Vec<MmcoOp>,
}

impl RefPicMarking {
    pub fn has_clear(&self) -> bool {
        self.adaptive_ref_pic_marking_mode && self.ops.contains(&MmcoOp::Clear)
    }
}

#[derive(Clone, Debug)]
pub struct SliceHeader {
    pub sps: Rc<Sps>,
    pub pps: Rc<Pps>,

    pub nal_ref_idc: u8,
    pub idr: bool,

    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub frame_num: i32,
    pub field_pic: bool,
    pub bottom_field: bool,
    pub idr_pic_id: u16,

    pub pic_order_cnt_lsb: i32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],

    pub num_ref_idx_active_override: bool,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,

    pub dec_ref_pic_marking: RefPicMarking,
}

impl SliceHeader {
    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }

    /// Active reference count for list 0, per-slice override included.
    pub fn num_ref_idx_l0_active(&self) -> usize {
        if self.num_ref_idx_active_override {
            self.num_ref_idx_l0_active_minus1 as usize + 1
        } else {
            self.pps.num_ref_idx_l0_default_active_minus1 as usize + 1
        }
    }

    pub fn num_ref_idx_l1_active(&self) -> usize {
        if self.num_ref_idx_active_override {
            self.num_ref_idx_l1_active_minus1 as usize + 1
        } else {
            self.pps.num_ref_idx_l1_default_active_minus1 as usize + 1
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceType {
    fn from_coded(value: u32) -> Result<SliceType> {
        match value % 5 {
            0 => Ok(SliceType::P),
            1 => Ok(SliceType::B),
            2 => Ok(SliceType::I),
            3 => Ok(SliceType::Sp),
            4 => Ok(SliceType::Si),
            _ => unreachable!(),
        }
    }

    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P | SliceType::Sp)
    }

    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

/// An SEI picture timing message, valid for the next committed picture.
#[derive(Copy, Clone, Debug, Default)]
pub struct SeiPictureTiming {
    pub valid: bool,
    pub cpb_removal_delay: u32,
    pub dpb_output_delay: u32,
}

/// Header decoder state: the id-keyed parameter set tables.
#[derive(Default)]
pub struct Parser {
    active_spses: BTreeMap<u8, Rc<Sps>>,
    active_ppses: BTreeMap<u8, Rc<Pps>>,
    last_sps_id: Option<u8>,
}

fn read_u32(r: &mut NaluReader<&[u8]>) -> std::result::Result<u32, NaluReaderError> {
    let high: u32 = r.read_bits(16)?;
    let low: u32 = r.read_bits(16)?;
    Ok((high << 16) | low)
}

fn skip_scaling_list(r: &mut NaluReader<&[u8]>, size: usize) -> Result<()> {
    // The values are not consumed downstream, but the deltas must be read
    // to keep the cursor in step, and a delta of -last terminates early.
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

fn parse_hrd(r: &mut NaluReader<&[u8]>) -> Result<HrdParams> {
    let mut hrd = HrdParams {
        cpb_cnt_minus1: r.read_ue_bounded(0, 31)?,
        ..Default::default()
    };
    r.skip_bits(4)?; // bit_rate_scale
    r.skip_bits(4)?; // cpb_size_scale
    for _ in 0..=hrd.cpb_cnt_minus1 {
        r.read_ue::<u32>()?; // bit_rate_value_minus1
        r.read_ue::<u32>()?; // cpb_size_value_minus1
        r.read_bit()?; // cbr_flag
    }
    hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
    hrd.cpb_removal_delay_length_minus1 = r.read_bits(5)?;
    hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
    hrd.time_offset_length = r.read_bits(5)?;
    Ok(hrd)
}

fn parse_vui(r: &mut NaluReader<&[u8]>) -> Result<VuiParams> {
    let mut vui = VuiParams::default();

    if r.read_bit()? {
        // aspect_ratio_info_present
        vui.aspect_ratio_idc = r.read_bits(8)?;
        if vui.aspect_ratio_idc == 255 {
            // Extended_SAR
            vui.sar_width = r.read_bits(16)?;
            vui.sar_height = r.read_bits(16)?;
        }
    }

    if r.read_bit()? {
        // overscan_info_present
        r.read_bit()?;
    }

    if r.read_bit()? {
        // video_signal_type_present
        r.skip_bits(3)?; // video_format
        r.read_bit()?; // video_full_range
        if r.read_bit()? {
            // colour_description_present
            r.skip_bits(8)?; // colour_primaries
            r.skip_bits(8)?; // transfer_characteristics
            vui.matrix_coefficients = r.read_bits(8)?;
        }
    }

    if r.read_bit()? {
        // chroma_loc_info_present
        r.read_ue::<u32>()?;
        r.read_ue::<u32>()?;
    }

    vui.timing_info_present = r.read_bit()?;
    if vui.timing_info_present {
        vui.num_units_in_tick = read_u32(r)?;
        vui.time_scale = read_u32(r)?;
        vui.fixed_frame_rate = r.read_bit()?;
    }

    if r.read_bit()? {
        vui.nal_hrd = Some(parse_hrd(r)?);
    }
    if r.read_bit()? {
        vui.vcl_hrd = Some(parse_hrd(r)?);
    }
    if vui.cpb_dpb_delays_present() {
        r.read_bit()?; // low_delay_hrd
    }

    vui.pic_struct_present = r.read_bit()?;

    vui.bitstream_restriction = r.read_bit()?;
    if vui.bitstream_restriction {
        r.read_bit()?; // motion_vectors_over_pic_boundaries
        r.read_ue::<u32>()?; // max_bytes_per_pic_denom
        r.read_ue::<u32>()?; // max_bits_per_mb_denom
        r.read_ue::<u32>()?; // log2_max_mv_length_horizontal
        r.read_ue::<u32>()?; // log2_max_mv_length_vertical
        vui.max_num_reorder_frames = r.read_ue()?;
        vui.max_dec_frame_buffering = r.read_ue()?;
    }

    Ok(vui)
}

const HIGH_PROFILE_IDCS: [u8; 12] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134];

impl Parser {
    pub fn get_sps(&self, id: u8) -> Result<&Rc<Sps>> {
        self.active_spses
            .get(&id)
            .ok_or(FrameParserError::NoStreamParameters)
    }

    pub fn get_pps(&self, id: u8) -> Result<&Rc<Pps>> {
        self.active_ppses
            .get(&id)
            .ok_or(FrameParserError::NoPictureParameters(id))
    }

    /// SPS most recently parsed or referenced, used to interpret SEI
    /// messages that precede slice data.
    pub fn last_sps(&self) -> Option<&Rc<Sps>> {
        self.last_sps_id.and_then(|id| self.active_spses.get(&id))
    }

    pub fn have_stream_parameters(&self) -> bool {
        !self.active_spses.is_empty()
    }

    pub fn parse_sps(&mut self, payload: &[u8]) -> Result<Rc<Sps>> {
        let r = &mut NaluReader::new(payload);
        let mut sps = Sps::default();

        sps.profile_idc = r.read_bits(8)?;
        r.read_bit()?; // constraint_set0_flag
        sps.constraint_set1_flag = r.read_bit()?;
        r.read_bit()?; // constraint_set2_flag
        sps.constraint_set3_flag = r.read_bit()?;
        r.skip_bits(4)?; // constraint_set4/5, reserved_zero_2bits
        sps.level_idc = r.read_bits(8)?;
        sps.seq_parameter_set_id = r.read_ue_bounded(0, MAX_SPS_COUNT - 1)? as u8;

        sps.chroma_format_idc = 1;
        if HIGH_PROFILE_IDCS.contains(&sps.profile_idc) || sps.profile_idc == 135 {
            sps.chroma_format_idc = r.read_ue_bounded(0, 3)? as u8;
            if sps.chroma_format_idc == 3 {
                sps.separate_colour_plane = r.read_bit()?;
            }
            r.read_ue::<u32>()?; // bit_depth_luma_minus8
            r.read_ue::<u32>()?; // bit_depth_chroma_minus8
            r.read_bit()?; // qpprime_y_zero_transform_bypass
            if r.read_bit()? {
                // seq_scaling_matrix_present
                let count = if sps.chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..count {
                    if r.read_bit()? {
                        skip_scaling_list(r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        sps.log2_max_frame_num_minus4 = r.read_ue_bounded(0, 12)? as u8;
        sps.pic_order_cnt_type = r.read_ue_bounded(0, 2)? as u8;

        match sps.pic_order_cnt_type {
            0 => {
                sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_bounded(0, 12)? as u8;
            }
            1 => {
                sps.delta_pic_order_always_zero = r.read_bit()?;
                sps.offset_for_non_ref_pic = r.read_se()?;
                sps.offset_for_top_to_bottom_field = r.read_se()?;
                let count = r.read_ue_bounded(0, 255)?;
                for _ in 0..count {
                    sps.offset_for_ref_frame.push(r.read_se()?);
                }
            }
            _ => (),
        }

        sps.max_num_ref_frames = r.read_ue()?;
        sps.gaps_in_frame_num_value_allowed = r.read_bit()?;
        sps.pic_width_in_mbs_minus1 = r.read_ue()?;
        sps.pic_height_in_map_units_minus1 = r.read_ue()?;
        sps.frame_mbs_only = r.read_bit()?;
        if !sps.frame_mbs_only {
            sps.mb_adaptive_frame_field = r.read_bit()?;
        }
        r.read_bit()?; // direct_8x8_inference

        if r.read_bit()? {
            // frame_cropping
            r.read_ue::<u32>()?;
            r.read_ue::<u32>()?;
            r.read_ue::<u32>()?;
            r.read_ue::<u32>()?;
        }

        sps.vui_parameters_present = r.read_bit()?;
        if sps.vui_parameters_present {
            sps.vui = parse_vui(r)?;
        }

        debug!(
            "parsed SPS {} (profile {}, {}x{}, poc type {})",
            sps.seq_parameter_set_id,
            sps.profile_idc,
            sps.width(),
            sps.height(),
            sps.pic_order_cnt_type
        );

        let id = sps.seq_parameter_set_id;
        let sps = Rc::new(sps);
        self.active_spses.insert(id, Rc::clone(&sps));
        self.last_sps_id = Some(id);
        Ok(sps)
    }

    pub fn parse_pps(&mut self, payload: &[u8]) -> Result<Rc<Pps>> {
        let r = &mut NaluReader::new(payload);
        let mut pps = Pps {
            pic_parameter_set_id: r.read_ue_bounded(0, MAX_PPS_COUNT - 1)? as u8,
            seq_parameter_set_id: r.read_ue_bounded(0, MAX_SPS_COUNT - 1)? as u8,
            ..Default::default()
        };

        // The referenced SPS must already be live.
        self.get_sps(pps.seq_parameter_set_id)?;

        r.read_bit()?; // entropy_coding_mode
        pps.bottom_field_pic_order_in_frame_present = r.read_bit()?;

        let num_slice_groups_minus1: u32 = r.read_ue()?;
        if num_slice_groups_minus1 > 0 {
            // Slice group maps only position the cursor; FMO itself is the
            // decoder's problem.
            let map_type: u32 = r.read_ue()?;
            match map_type {
                0 => {
                    for _ in 0..=num_slice_groups_minus1 {
                        r.read_ue::<u32>()?;
                    }
                }
                2 => {
                    for _ in 0..num_slice_groups_minus1 {
                        r.read_ue::<u32>()?;
                        r.read_ue::<u32>()?;
                    }
                }
                3..=5 => {
                    r.read_bit()?;
                    r.read_ue::<u32>()?;
                }
                6 => {
                    let pic_size: u32 = r.read_ue()?;
                    let bits = 32 - num_slice_groups_minus1.leading_zeros() as usize;
                    for _ in 0..=pic_size {
                        r.skip_bits(bits)?;
                    }
                }
                _ => (),
            }
        }

        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_bounded(0, 31)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_bounded(0, 31)?;
        pps.weighted_pred = r.read_bit()?;
        pps.weighted_bipred_idc = r.read_bits(2)?;
        r.read_se()?; // pic_init_qp_minus26
        r.read_se()?; // pic_init_qs_minus26
        r.read_se()?; // chroma_qp_index_offset
        r.read_bit()?; // deblocking_filter_control_present
        r.read_bit()?; // constrained_intra_pred
        pps.redundant_pic_cnt_present = r.read_bit()?;

        debug!("parsed PPS {}", pps.pic_parameter_set_id);

        let id = pps.pic_parameter_set_id;
        let pps = Rc::new(pps);
        self.active_ppses.insert(id, Rc::clone(&pps));
        Ok(pps)
    }

    /// Parse a slice header up to and including `dec_ref_pic_marking`; the
    /// slice data itself is never touched.
    pub fn parse_slice_header(&mut self, nalu: NaluHeader, payload: &[u8]) -> Result<SliceHeader> {
        let r = &mut NaluReader::new(payload);

        let first_mb_in_slice = r.read_ue()?;
        let slice_type = SliceType::from_coded(r.read_ue_bounded(0, 9)?)?;
        let pps = Rc::clone(self.get_pps(r.read_ue_bounded(0, MAX_PPS_COUNT - 1)? as u8)?);
        let sps = Rc::clone(self.get_sps(pps.seq_parameter_set_id)?);
        self.last_sps_id = Some(sps.seq_parameter_set_id);

        let mut header = SliceHeader {
            sps: Rc::clone(&sps),
            pps: Rc::clone(&pps),
            nal_ref_idc: nalu.ref_idc,
            idr: nalu.idr_pic_flag(),
            first_mb_in_slice,
            slice_type,
            frame_num: 0,
            field_pic: false,
            bottom_field: false,
            idr_pic_id: 0,
            pic_order_cnt_lsb: 0,
            delta_pic_order_cnt_bottom: 0,
            delta_pic_order_cnt: [0; 2],
            num_ref_idx_active_override: false,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            dec_ref_pic_marking: RefPicMarking::default(),
        };

        if sps.separate_colour_plane {
            r.skip_bits(2)?; // colour_plane_id
        }

        header.frame_num = r.read_bits((sps.log2_max_frame_num_minus4 + 4) as usize)?;

        if !sps.frame_mbs_only {
            header.field_pic = r.read_bit()?;
            if header.field_pic {
                header.bottom_field = r.read_bit()?;
            }
        }

        if header.idr {
            header.idr_pic_id = r.read_ue()?;
        }

        match sps.pic_order_cnt_type {
            0 => {
                header.pic_order_cnt_lsb =
                    r.read_bits((sps.log2_max_pic_order_cnt_lsb_minus4 + 4) as usize)?;
                if pps.bottom_field_pic_order_in_frame_present && !header.field_pic {
                    header.delta_pic_order_cnt_bottom = r.read_se()?;
                }
            }
            1 if !sps.delta_pic_order_always_zero => {
                header.delta_pic_order_cnt[0] = r.read_se()?;
                if pps.bottom_field_pic_order_in_frame_present && !header.field_pic {
                    header.delta_pic_order_cnt[1] = r.read_se()?;
                }
            }
            _ => (),
        }

        if pps.redundant_pic_cnt_present {
            r.read_ue::<u32>()?; // redundant_pic_cnt
        }

        if header.slice_type.is_b() {
            r.read_bit()?; // direct_spatial_mv_pred
        }

        if header.slice_type.is_p() || header.slice_type.is_b() {
            header.num_ref_idx_active_override = r.read_bit()?;
            if header.num_ref_idx_active_override {
                header.num_ref_idx_l0_active_minus1 = r.read_ue_bounded(0, 31)?;
                if header.slice_type.is_b() {
                    header.num_ref_idx_l1_active_minus1 = r.read_ue_bounded(0, 31)?;
                }
            }
        }

        self.skip_ref_pic_list_modification(r, &header)?;
        self.skip_pred_weight_table(r, &header)?;

        if header.is_reference() {
            header.dec_ref_pic_marking = Self::parse_dec_ref_pic_marking(r, header.idr)?;
        }

        Ok(header)
    }

    /// The modification commands are applied by the decoder stage; here they
    /// only advance the cursor towards `dec_ref_pic_marking`.
    fn skip_ref_pic_list_modification(
        &self,
        r: &mut NaluReader<&[u8]>,
        header: &SliceHeader,
    ) -> Result<()> {
        let mut skip_list = |r: &mut NaluReader<&[u8]>| -> Result<()> {
            if r.read_bit()? {
                // ref_pic_list_modification_flag
                loop {
                    let idc: u32 = r.read_ue_bounded(0, 3)?;
                    match idc {
                        0 | 1 => {
                            r.read_ue::<u32>()?; // abs_diff_pic_num_minus1
                        }
                        2 => {
                            r.read_ue::<u32>()?; // long_term_pic_num
                        }
                        _ => break,
                    }
                }
            }
            Ok(())
        };

        if !header.slice_type.is_i() {
            skip_list(r)?;
        }
        if header.slice_type.is_b() {
            skip_list(r)?;
        }
        Ok(())
    }

    fn skip_pred_weight_table(&self, r: &mut NaluReader<&[u8]>, header: &SliceHeader) -> Result<()> {
        let present = (header.pps.weighted_pred && header.slice_type.is_p())
            || (header.pps.weighted_bipred_idc == 1 && header.slice_type.is_b());
        if !present {
            return Ok(());
        }

        let chroma = header.sps.chroma_array_type() != 0;
        r.read_ue::<u32>()?; // luma_log2_weight_denom
        if chroma {
            r.read_ue::<u32>()?; // chroma_log2_weight_denom
        }

        let mut skip_entries = |r: &mut NaluReader<&[u8]>, count: usize| -> Result<()> {
            for _ in 0..count {
                if r.read_bit()? {
                    // luma_weight_flag
                    r.read_se()?;
                    r.read_se()?;
                }
                if chroma && r.read_bit()? {
                    // chroma_weight_flag
                    for _ in 0..4 {
                        r.read_se()?;
                    }
                }
            }
            Ok(())
        };

        skip_entries(r, header.num_ref_idx_l0_active())?;
        if header.slice_type.is_b() {
            skip_entries(r, header.num_ref_idx_l1_active())?;
        }
        Ok(())
    }

    fn parse_dec_ref_pic_marking(r: &mut NaluReader<&[u8]>, idr: bool) -> Result<RefPicMarking> {
        let mut marking = RefPicMarking::default();

        if idr {
            r.read_bit()?; // no_output_of_prior_pics
            marking.long_term_reference_flag = r.read_bit()?;
            return Ok(marking);
        }

        marking.adaptive_ref_pic_marking_mode = r.read_bit()?;
        if !marking.adaptive_ref_pic_marking_mode {
            return Ok(marking);
        }

        loop {
            let op: u32 = r.read_ue_bounded(0, 6)?;
            let op = match op {
                0 => break,
                1 => MmcoOp::ForgetShort {
                    difference_of_pic_nums_minus1: r.read_ue()?,
                },
                2 => MmcoOp::ForgetLong {
                    long_term_pic_num: r.read_ue()?,
                },
                3 => MmcoOp::ShortToLong {
                    difference_of_pic_nums_minus1: r.read_ue()?,
                    long_term_frame_idx: r.read_ue()?,
                },
                4 => MmcoOp::MaxLongTermIdx {
                    max_long_term_frame_idx_plus1: r.read_ue()?,
                },
                5 => MmcoOp::Clear,
                6 => MmcoOp::CurrentToLong {
                    long_term_frame_idx: r.read_ue()?,
                },
                _ => unreachable!(),
            };
            marking.ops.push(op);
            if marking.ops.len() > 64 {
                return Err(FrameParserError::HeaderSyntaxError);
            }
        }

        Ok(marking)
    }

    /// Parse the SEI messages of one NAL unit, returning the picture timing
    /// message if present.
    pub fn parse_sei(&mut self, payload: &[u8]) -> Result<Option<SeiPictureTiming>> {
        let r = &mut NaluReader::new(payload);
        let mut timing = None;

        while r.num_bits_left() >= 16 {
            let mut payload_type: u32 = 0;
            loop {
                let byte: u32 = r.read_bits(8)?;
                payload_type += byte;
                if byte != 0xff {
                    break;
                }
            }
            let mut payload_size: u32 = 0;
            loop {
                let byte: u32 = r.read_bits(8)?;
                payload_size += byte;
                if byte != 0xff {
                    break;
                }
            }

            if payload_type == 1 {
                timing = self.parse_sei_pic_timing(r, payload_size as usize)?;
            } else {
                for _ in 0..payload_size {
                    r.skip_bits(8)?;
                }
            }

            if !r.has_more_rbsp_data() {
                break;
            }
        }

        Ok(timing)
    }

    fn parse_sei_pic_timing(
        &self,
        r: &mut NaluReader<&[u8]>,
        payload_size: usize,
    ) -> Result<Option<SeiPictureTiming>> {
        // The message can only be interpreted against the active sequence
        // parameters; without them it is skipped whole.
        let sps = match self.last_sps() {
            Some(sps) => Rc::clone(sps),
            None => {
                for _ in 0..payload_size {
                    r.skip_bits(8)?;
                }
                return Ok(None);
            }
        };

        let mut consumed_bits = 0usize;
        let mut timing = SeiPictureTiming::default();

        if sps.vui.cpb_dpb_delays_present() {
            let hrd = sps.vui.delay_hrd().unwrap();
            let cpb_len = hrd.cpb_removal_delay_length_minus1 as usize + 1;
            let dpb_len = hrd.dpb_output_delay_length_minus1 as usize + 1;
            timing.cpb_removal_delay = read_long(r, cpb_len)?;
            timing.dpb_output_delay = read_long(r, dpb_len)?;
            timing.valid = true;
            consumed_bits += cpb_len + dpb_len;
        }

        // pic_struct and the clock timestamps are not consumed; skip to the
        // end of the payload.
        let total_bits = payload_size * 8;
        let mut remaining = total_bits.saturating_sub(consumed_bits);
        while remaining >= 8 {
            r.skip_bits(8)?;
            remaining -= 8;
        }
        if remaining > 0 {
            r.skip_bits(remaining)?;
        }

        Ok(if timing.valid { Some(timing) } else { None })
    }
}

fn read_long(r: &mut NaluReader<&[u8]>, bits: usize) -> Result<u32> {
    if bits > 31 {
        let high: u32 = r.read_bits(bits - 16)?;
        let low: u32 = r.read_bits(16)?;
        Ok((high << 16) | low)
    } else {
        Ok(r.read_bits(bits)?)
    }
}

#[cfg(test)]
pub(crate) mod test_stream;
