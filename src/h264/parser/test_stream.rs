// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Test-only bitstream writer: builds the header subset the parser consumes
//! so tests can drive the pipeline with synthetic access units.

use crate::h264::parser::MmcoOp;
use crate::h264::parser::NaluType;

pub struct BitWriter {
    bytes: Vec<u8>,
    acc: u8,
    used: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            acc: 0,
            used: 0,
        }
    }

    pub fn put_bit(&mut self, bit: bool) {
        self.acc = (self.acc << 1) | u8::from(bit);
        self.used += 1;
        if self.used == 8 {
            self.bytes.push(self.acc);
            self.acc = 0;
            self.used = 0;
        }
    }

    pub fn put_bits(&mut self, value: u32, count: usize) {
        for i in (0..count).rev() {
            self.put_bit((value >> i) & 1 != 0);
        }
    }

    pub fn put_ue(&mut self, value: u32) {
        let coded = value + 1;
        let bits = 32 - coded.leading_zeros() as usize;
        self.put_bits(0, bits - 1);
        self.put_bits(coded, bits);
    }

    pub fn put_se(&mut self, value: i32) {
        let ue = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            (-(value as i64) as u32) * 2
        };
        self.put_ue(ue);
    }

    /// Terminate the RBSP with the stop bit and byte alignment.
    pub fn finish(mut self) -> Vec<u8> {
        self.put_bit(true);
        while self.used != 0 {
            self.put_bit(false);
        }
        self.bytes
    }
}

pub struct SpsSpec {
    pub seq_parameter_set_id: u32,
    pub log2_max_frame_num_minus4: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub offsets_for_ref_frames: Vec<i32>,
    pub max_num_ref_frames: u32,
    pub pic_width_in_mbs_minus1: u32,
    pub pic_height_in_map_units_minus1: u32,
    pub frame_mbs_only: bool,
}

impl Default for SpsSpec {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: 0,
            log2_max_frame_num_minus4: 4,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 4,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            offsets_for_ref_frames: Vec::new(),
            max_num_ref_frames: 4,
            pic_width_in_mbs_minus1: 44,
            pic_height_in_map_units_minus1: 35,
            frame_mbs_only: true,
        }
    }
}

pub fn build_sps(spec: &SpsSpec) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put_bits(77, 8); // profile_idc: main
    w.put_bits(0, 8); // constraint flags + reserved
    w.put_bits(40, 8); // level_idc
    w.put_ue(spec.seq_parameter_set_id);
    w.put_ue(spec.log2_max_frame_num_minus4);
    w.put_ue(spec.pic_order_cnt_type);
    match spec.pic_order_cnt_type {
        0 => w.put_ue(spec.log2_max_pic_order_cnt_lsb_minus4),
        1 => {
            w.put_bit(false); // delta_pic_order_always_zero
            w.put_se(spec.offset_for_non_ref_pic);
            w.put_se(spec.offset_for_top_to_bottom_field);
            w.put_ue(spec.offsets_for_ref_frames.len() as u32);
            for offset in &spec.offsets_for_ref_frames {
                w.put_se(*offset);
            }
        }
        _ => (),
    }
    w.put_ue(spec.max_num_ref_frames);
    w.put_bit(false); // gaps_in_frame_num_value_allowed
    w.put_ue(spec.pic_width_in_mbs_minus1);
    w.put_ue(spec.pic_height_in_map_units_minus1);
    w.put_bit(spec.frame_mbs_only);
    if !spec.frame_mbs_only {
        w.put_bit(false); // mb_adaptive_frame_field
    }
    w.put_bit(false); // direct_8x8_inference
    w.put_bit(false); // frame_cropping
    w.put_bit(false); // vui_parameters_present
    w.finish()
}

#[derive(Default)]
pub struct PpsSpec {
    pub pic_parameter_set_id: u32,
    pub seq_parameter_set_id: u32,
}

pub fn build_pps(spec: &PpsSpec) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put_ue(spec.pic_parameter_set_id);
    w.put_ue(spec.seq_parameter_set_id);
    w.put_bit(false); // entropy_coding_mode
    w.put_bit(false); // bottom_field_pic_order_in_frame_present
    w.put_ue(0); // num_slice_groups_minus1
    w.put_ue(0); // num_ref_idx_l0_default_active_minus1
    w.put_ue(0); // num_ref_idx_l1_default_active_minus1
    w.put_bit(false); // weighted_pred
    w.put_bits(0, 2); // weighted_bipred_idc
    w.put_se(0); // pic_init_qp_minus26
    w.put_se(0); // pic_init_qs_minus26
    w.put_se(0); // chroma_qp_index_offset
    w.put_bit(false); // deblocking_filter_control_present
    w.put_bit(false); // constrained_intra_pred
    w.put_bit(false); // redundant_pic_cnt_present
    w.finish()
}

/// A slice against the default `SpsSpec`/`PpsSpec` shapes (frame coding,
/// POC type 0 with 8-bit LSBs, 8-bit frame numbers).
pub struct SliceSpec {
    pub first_mb_in_slice: u32,
    pub slice_type_coded: u32,
    pub pic_parameter_set_id: u32,
    pub idr: bool,
    pub frame_num: u32,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    /// Whether the slice carries a `dec_ref_pic_marking` section.
    pub reference: bool,
    pub long_term_reference_flag: bool,
    pub mmco_ops: Vec<MmcoOp>,
}

impl Default for SliceSpec {
    fn default() -> Self {
        Self {
            first_mb_in_slice: 0,
            slice_type_coded: 7, // I
            pic_parameter_set_id: 0,
            idr: false,
            frame_num: 0,
            idr_pic_id: 0,
            pic_order_cnt_lsb: 0,
            reference: true,
            long_term_reference_flag: false,
            mmco_ops: Vec::new(),
        }
    }
}

pub fn build_slice(spec: &SliceSpec) -> Vec<u8> {
    let slice_type = spec.slice_type_coded % 5;
    let is_i = slice_type == 2 || slice_type == 4;
    let is_b = slice_type == 1;

    let mut w = BitWriter::new();
    w.put_ue(spec.first_mb_in_slice);
    w.put_ue(spec.slice_type_coded);
    w.put_ue(spec.pic_parameter_set_id);
    w.put_bits(spec.frame_num, 8);
    if spec.idr {
        w.put_ue(spec.idr_pic_id);
    }
    w.put_bits(spec.pic_order_cnt_lsb, 8);

    if is_b {
        w.put_bit(false); // direct_spatial_mv_pred
    }
    if !is_i {
        w.put_bit(false); // num_ref_idx_active_override
    }

    // ref_pic_list_modification flags
    if !is_i {
        w.put_bit(false);
    }
    if is_b {
        w.put_bit(false);
    }

    if spec.reference {
        if spec.idr {
            w.put_bit(false); // no_output_of_prior_pics
            w.put_bit(spec.long_term_reference_flag);
        } else {
            w.put_bit(!spec.mmco_ops.is_empty()); // adaptive marking
            for op in &spec.mmco_ops {
                match op {
                    MmcoOp::ForgetShort {
                        difference_of_pic_nums_minus1,
                    } => {
                        w.put_ue(1);
                        w.put_ue(*difference_of_pic_nums_minus1);
                    }
                    MmcoOp::ForgetLong { long_term_pic_num } => {
                        w.put_ue(2);
                        w.put_ue(*long_term_pic_num);
                    }
                    MmcoOp::ShortToLong {
                        difference_of_pic_nums_minus1,
                        long_term_frame_idx,
                    } => {
                        w.put_ue(3);
                        w.put_ue(*difference_of_pic_nums_minus1);
                        w.put_ue(*long_term_frame_idx);
                    }
                    MmcoOp::MaxLongTermIdx {
                        max_long_term_frame_idx_plus1,
                    } => {
                        w.put_ue(4);
                        w.put_ue(*max_long_term_frame_idx_plus1);
                    }
                    MmcoOp::Clear => w.put_ue(5),
                    MmcoOp::CurrentToLong {
                        long_term_frame_idx,
                    } => {
                        w.put_ue(6);
                        w.put_ue(*long_term_frame_idx);
                    }
                }
            }
            if !spec.mmco_ops.is_empty() {
                w.put_ue(0); // end of operations
            }
        }
    }

    // A handful of opaque "slice data" bits keep the payload non-empty.
    w.put_bits(0x2a, 6);
    w.finish()
}

/// Escape a RBSP into the on-the-wire form (emulation prevention bytes).
pub fn escape_rbsp(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len());
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// Wrap a RBSP into a start-code-delimited NAL unit.
pub fn annexb(ref_idc: u8, type_: NaluType, rbsp: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x01, (ref_idc << 5) | type_ as u8];
    out.extend(escape_rbsp(rbsp));
    out
}

/// A complete access unit holding a single slice.
pub fn slice_unit(ref_idc: u8, spec: &SliceSpec) -> Vec<u8> {
    let type_ = if spec.idr {
        NaluType::SliceIdr
    } else {
        NaluType::Slice
    };
    annexb(ref_idc, type_, &build_slice(spec))
}

/// An access unit carrying SPS + PPS ahead of an IDR slice.
pub fn idr_unit_with_parameter_sets(sps: &SpsSpec, pps: &PpsSpec, slice: &SliceSpec) -> Vec<u8> {
    let mut out = annexb(3, NaluType::Sps, &build_sps(sps));
    out.extend(annexb(3, NaluType::Pps, &build_pps(pps)));
    out.extend(slice_unit(3, slice));
    out
}
