// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count computation: the three derivation types of the
//! codec specification plus the 64-bit extended ordering key that stays
//! monotonic across sequence boundaries.

use log::error;
use log::info;

use crate::h264::parser::SliceHeader;

/// Added to the extended-POC offset accumulator on every IDR (and, under
/// POC-based ordering, on every marking clear) so the raw POC restarting
/// near zero never moves the extended key backwards.
pub const POC_OFFSET_ADJUST: u64 = 1 << 32;

/// Per-picture output of the POC engine.
#[derive(Copy, Clone, Debug, Default)]
pub struct PocResult {
    pub top: i32,
    pub bot: i32,
    pub poc: i32,
    /// Wrap-free ordering key used by the deferred output-order queue.
    pub extended: u64,
    /// POC MSB state on entry, recorded for the reverse-play carry-over
    /// adjustment.
    pub entry_msb: i32,
    /// POC MSB state on exit.
    pub exit_msb: i32,
    /// The exit MSB was forced to zero (IDR or marking clear).
    pub exit_msb_forced: bool,
}

/// Cross-picture POC state for one stream.
#[derive(Debug, Default)]
pub struct PocContext {
    prev_pic_order_cnt_msb: i32,
    prev_pic_order_cnt_lsb: i32,
    prev_frame_num: i32,
    prev_frame_num_offset: i32,
    /// MSB of the last reference picture to leave POC computation, used
    /// when re-basing carried-over open groups in reverse play.
    pub last_exit_pic_order_cnt_msb: i32,

    offset: u64,
    /// Base added to `dpb_output_delay` under DPB-based ordering.
    pub base_dpb_value: u32,
    /// Order by DPB output delays instead of POC values. Set when the
    /// stream carries picture timing with CPB/DPB delays.
    pub display_order_by_dpb: bool,
    /// PTS validation found the DPB values inconsistent; POC ordering is
    /// used for the remainder of the stream.
    pub dpb_values_invalidated_by_pts: bool,
}

impl PocContext {
    /// Compute the field order counts of one committed picture.
    pub fn compute(&mut self, hdr: &SliceHeader, dpb_output_delay: u32) -> PocResult {
        let sps = &hdr.sps;
        let max_frame_num = sps.max_frame_num();
        let clear_seen = hdr.is_reference() && hdr.dec_ref_pic_marking.has_clear();
        let is_ref = hdr.is_reference();

        let mut result = PocResult::default();

        let mut top = None;
        let mut bot = None;

        match sps.pic_order_cnt_type {
            0 => {
                result.entry_msb = self.prev_pic_order_cnt_msb;

                if hdr.idr {
                    self.prev_pic_order_cnt_msb = 0;
                    self.prev_pic_order_cnt_lsb = 0;
                    result.exit_msb_forced = true;
                }

                let max_lsb = sps.max_pic_order_cnt_lsb();
                let lsb = hdr.pic_order_cnt_lsb;

                let msb = if lsb < self.prev_pic_order_cnt_lsb
                    && (self.prev_pic_order_cnt_lsb - lsb) >= (max_lsb / 2)
                {
                    self.prev_pic_order_cnt_msb + max_lsb
                } else if lsb > self.prev_pic_order_cnt_lsb
                    && (lsb - self.prev_pic_order_cnt_lsb) > (max_lsb / 2)
                {
                    self.prev_pic_order_cnt_msb - max_lsb
                } else {
                    self.prev_pic_order_cnt_msb
                };

                if !(hdr.field_pic && hdr.bottom_field) {
                    top = Some(msb + lsb);
                }
                if !hdr.field_pic {
                    bot = Some(top.unwrap() + hdr.delta_pic_order_cnt_bottom);
                } else if hdr.bottom_field {
                    bot = Some(msb + lsb);
                }

                if is_ref {
                    if clear_seen {
                        self.prev_pic_order_cnt_msb = 0;
                        self.prev_pic_order_cnt_lsb = if hdr.field_pic && hdr.bottom_field {
                            0
                        } else {
                            top.unwrap()
                        };
                        result.exit_msb_forced = true;
                    } else {
                        self.prev_pic_order_cnt_msb = msb;
                        self.prev_pic_order_cnt_lsb = lsb;
                    }

                    self.last_exit_pic_order_cnt_msb = msb;
                    result.exit_msb = msb;
                }
            }

            1 => {
                let frame_num_offset = self.frame_num_offset(hdr, max_frame_num);

                let cycle_len = sps.offset_for_ref_frame.len() as i32;
                let mut abs_frame_num = if cycle_len != 0 {
                    frame_num_offset + hdr.frame_num
                } else {
                    0
                };
                if !is_ref && abs_frame_num > 0 {
                    abs_frame_num -= 1;
                }

                let mut expected = 0;
                if abs_frame_num > 0 {
                    let cycle_cnt = (abs_frame_num - 1) / cycle_len;
                    let frame_num_in_cycle = (abs_frame_num - 1) % cycle_len;

                    expected = cycle_cnt * sps.expected_delta_per_pic_order_cnt_cycle();
                    for i in 0..=frame_num_in_cycle {
                        expected += sps.offset_for_ref_frame[i as usize];
                    }
                }
                if !is_ref {
                    expected += sps.offset_for_non_ref_pic;
                }

                if !hdr.field_pic {
                    let t = expected + hdr.delta_pic_order_cnt[0];
                    top = Some(t);
                    bot = Some(
                        t + sps.offset_for_top_to_bottom_field + hdr.delta_pic_order_cnt[1],
                    );
                } else if !hdr.bottom_field {
                    top = Some(expected + hdr.delta_pic_order_cnt[0]);
                } else {
                    bot = Some(
                        expected
                            + sps.offset_for_top_to_bottom_field
                            + hdr.delta_pic_order_cnt[0],
                    );
                }

                self.prev_frame_num_offset = if clear_seen { 0 } else { frame_num_offset };
                self.prev_frame_num = hdr.frame_num;
            }

            2 => {
                // Output order identical to decode order.
                let frame_num_offset = self.frame_num_offset(hdr, max_frame_num);

                let temp = if hdr.idr {
                    0
                } else if !is_ref {
                    2 * (frame_num_offset + hdr.frame_num) - 1
                } else {
                    2 * (frame_num_offset + hdr.frame_num)
                };

                if !hdr.field_pic {
                    top = Some(temp);
                    bot = Some(temp);
                } else if hdr.bottom_field {
                    bot = Some(temp);
                } else {
                    top = Some(temp);
                }

                self.prev_frame_num_offset = if clear_seen { 0 } else { frame_num_offset };
                self.prev_frame_num = hdr.frame_num;
            }

            other => {
                error!("invalid pic_order_cnt_type {}", other);
            }
        }

        // The absent field of a field picture mirrors the coded one until
        // its pair overwrites it during reference marking.
        result.top = top.or(bot).unwrap_or(0);
        result.bot = bot.or(top).unwrap_or(0);
        result.poc = if hdr.field_pic {
            if hdr.bottom_field {
                result.bot
            } else {
                result.top
            }
        } else {
            result.top.min(result.bot)
        };

        // The extended count is based on the pic order count, or on the DPB
        // output delay when picture timing messages drive output order.
        if hdr.idr {
            self.offset += POC_OFFSET_ADJUST;
            self.base_dpb_value = 0;
        }

        result.extended = if self.display_order_by_dpb {
            self.offset + u64::from(self.base_dpb_value) + u64::from(dpb_output_delay)
        } else {
            (self.offset as i64 + i64::from(result.poc)) as u64
        };

        if clear_seen && !self.display_order_by_dpb {
            self.offset += POC_OFFSET_ADJUST;
        }

        result
    }

    fn frame_num_offset(&self, hdr: &SliceHeader, max_frame_num: i32) -> i32 {
        if hdr.idr {
            0
        } else if self.prev_frame_num > hdr.frame_num {
            self.prev_frame_num_offset + max_frame_num
        } else {
            self.prev_frame_num_offset
        }
    }

    /// A marking clear re-bases frame numbering to zero.
    pub fn note_mmco_clear(&mut self) {
        self.prev_frame_num = 0;
    }

    /// Forget the previous-picture state after a reverse jump; the next
    /// group starts from scratch.
    pub fn reset_previous(&mut self) {
        self.prev_pic_order_cnt_msb = 0;
        self.prev_pic_order_cnt_lsb = 0;
        self.prev_frame_num = 0;
        self.prev_frame_num_offset = 0;
    }

    /// The PTS sequence contradicted the DPB output delays: fall back to
    /// POC ordering for good, keeping the extended key above everything
    /// already issued.
    pub fn invalidate_dpb_ordering(&mut self) {
        if !self.dpb_values_invalidated_by_pts {
            info!(
                "DPB values incompatible with PTS ordering, falling back to \
                 re-ordering based on pic order counts"
            );
            self.dpb_values_invalidated_by_pts = true;
            self.display_order_by_dpb = false;
            self.offset += POC_OFFSET_ADJUST;
        }
    }

    /// A stream with picture timing delays orders output by DPB values
    /// unless PTS validation has already ruled that out.
    pub fn enable_dpb_ordering(&mut self) {
        if !self.dpb_values_invalidated_by_pts {
            self.display_order_by_dpb = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::h264::parser::Pps;
    use crate::h264::parser::RefPicMarking;
    use crate::h264::parser::SliceType;
    use crate::h264::parser::Sps;

    fn header(sps: &Rc<Sps>, idr: bool, ref_idc: u8, frame_num: i32, lsb: i32) -> SliceHeader {
        SliceHeader {
            sps: Rc::clone(sps),
            pps: Rc::new(Pps::default()),
            nal_ref_idc: ref_idc,
            idr,
            first_mb_in_slice: 0,
            slice_type: SliceType::P,
            frame_num,
            field_pic: false,
            bottom_field: false,
            idr_pic_id: 0,
            pic_order_cnt_lsb: lsb,
            delta_pic_order_cnt_bottom: 0,
            delta_pic_order_cnt: [0; 2],
            num_ref_idx_active_override: false,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            dec_ref_pic_marking: RefPicMarking::default(),
        }
    }

    fn sps_type0() -> Rc<Sps> {
        Rc::new(Sps {
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            ..Default::default()
        })
    }

    #[test]
    fn type0_basic_sequence() {
        let sps = sps_type0();
        let mut ctx = PocContext::default();

        let idr = ctx.compute(&header(&sps, true, 3, 0, 0), 0);
        assert_eq!(idr.poc, 0);

        let p = ctx.compute(&header(&sps, false, 2, 1, 4), 0);
        assert_eq!(p.poc, 4);

        let b = ctx.compute(&header(&sps, false, 0, 2, 2), 0);
        assert_eq!(b.poc, 2);
    }

    #[test]
    fn type0_lsb_wraparound_bumps_msb() {
        // max_pic_order_cnt_lsb is 16 here.
        let sps = sps_type0();
        let mut ctx = PocContext::default();

        ctx.compute(&header(&sps, true, 3, 0, 0), 0);
        ctx.compute(&header(&sps, false, 2, 1, 6), 0);
        ctx.compute(&header(&sps, false, 2, 2, 12), 0);
        // The LSB dropping by more than half the modulus wraps forward.
        let wrapped = ctx.compute(&header(&sps, false, 2, 3, 2), 0);
        assert_eq!(wrapped.poc, 18);
    }

    #[test]
    fn type2_output_order_is_decode_order() {
        let sps = Rc::new(Sps {
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 2,
            ..Default::default()
        });
        let mut ctx = PocContext::default();

        assert_eq!(ctx.compute(&header(&sps, true, 3, 0, 0), 0).poc, 0);
        assert_eq!(ctx.compute(&header(&sps, false, 2, 1, 0), 0).poc, 2);
        // Non-reference pictures sit one below the following reference.
        assert_eq!(ctx.compute(&header(&sps, false, 0, 2, 0), 0).poc, 3);
        assert_eq!(ctx.compute(&header(&sps, false, 2, 2, 0), 0).poc, 4);
    }

    #[test]
    fn type1_cyclic_offsets() {
        let sps = Rc::new(Sps {
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 1,
            offset_for_ref_frame: vec![4],
            ..Default::default()
        });
        let mut ctx = PocContext::default();

        assert_eq!(ctx.compute(&header(&sps, true, 3, 0, 0), 0).poc, 0);
        assert_eq!(ctx.compute(&header(&sps, false, 2, 1, 0), 0).poc, 4);
        assert_eq!(ctx.compute(&header(&sps, false, 2, 2, 0), 0).poc, 8);
    }

    #[test]
    fn extended_poc_is_monotonic_across_idr() {
        let sps = sps_type0();
        let mut ctx = PocContext::default();

        let mut last = 0;
        // Two closed GOPs; the raw POC restarts at the second IDR but the
        // extended key keeps growing.
        for gop in 0..2 {
            let idr = ctx.compute(&header(&sps, true, 3, 0, 0), 0);
            if gop > 0 {
                assert!(idr.extended > last);
            }
            last = idr.extended;
            for n in 1..4 {
                let p = ctx.compute(&header(&sps, false, 2, n, (n * 2) % 16), 0);
                assert!(p.extended > last);
                last = p.extended;
            }
        }
    }

    #[test]
    fn dpb_ordering_and_fallback() {
        let sps = sps_type0();
        let mut ctx = PocContext::default();
        ctx.enable_dpb_ordering();

        let first = ctx.compute(&header(&sps, true, 3, 0, 0), 2);
        let second = ctx.compute(&header(&sps, false, 2, 1, 4), 0);
        assert_eq!(first.extended - POC_OFFSET_ADJUST, 2);
        assert_eq!(second.extended - POC_OFFSET_ADJUST, 0);

        // Once invalidated the ordering falls back to POC and never
        // returns, even if DPB ordering is requested again.
        ctx.invalidate_dpb_ordering();
        assert!(!ctx.display_order_by_dpb);
        ctx.enable_dpb_ordering();
        assert!(!ctx.display_order_by_dpb);
        let back = ctx.compute(&header(&sps, false, 2, 2, 8), 0);
        assert!(back.extended > second.extended);
        assert_eq!(back.extended, 2 * POC_OFFSET_ADJUST + 8);
    }
}
