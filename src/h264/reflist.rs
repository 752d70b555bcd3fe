// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The live reference set and the per-slice reference picture list
//! initialization, frame and field variants.

use std::cmp::Reverse;

use bitflags::bitflags;

use crate::frame::FieldUse;
use crate::frame::ReferenceDetail;
use crate::frame::ReferenceList;
use crate::frame::B_REF_PIC_LIST_0;
use crate::frame::B_REF_PIC_LIST_1;
use crate::frame::NUM_REF_FRAME_LISTS;
use crate::frame::P_REF_PIC_LIST;
use crate::h264::parser::SliceType;
use crate::FrameParserError;
use crate::Result;

/// Hard bound of the codec level tables; the live bound is the SPS's
/// `max_num_ref_frames`.
pub const MAX_REFERENCE_FRAMES: usize = 16;

bitflags! {
    /// Field-granular usage of one reference frame slot. A slot is free
    /// iff no bit is set.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct Usage: u8 {
        const TOP_SHORT = 0b0001;
        const BOT_SHORT = 0b0010;
        const TOP_LONG = 0b0100;
        const BOT_LONG = 0b1000;
    }
}

impl Usage {
    pub const ANY_SHORT: Usage = Usage::TOP_SHORT.union(Usage::BOT_SHORT);
    pub const ANY_LONG: Usage = Usage::TOP_LONG.union(Usage::BOT_LONG);
    pub const ANY_TOP: Usage = Usage::TOP_SHORT.union(Usage::TOP_LONG);
    pub const ANY_BOT: Usage = Usage::BOT_SHORT.union(Usage::BOT_LONG);

    pub fn short_term(self) -> bool {
        self.intersects(Usage::ANY_SHORT)
    }

    pub fn long_term(self) -> bool {
        self.intersects(Usage::ANY_LONG)
    }

    /// Both fields referenced: usable as a whole-frame reference.
    pub fn complementary_pair(self) -> bool {
        self.intersects(Usage::ANY_TOP) && self.intersects(Usage::ANY_BOT)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RefFrameSlot {
    pub usage: Usage,
    pub is_field: bool,
    pub frame_num: i32,
    /// Wrap-corrected picture number; doubled in field decoding.
    pub pic_num: i32,
    pub long_term_pic_num: i32,
    pub long_term_frame_idx: i32,
    pub poc_top: i32,
    pub poc_bot: i32,
    pub poc: i32,
    pub extended_poc: u64,
    pub decode_index: i64,
}

/// The bounded reference set: `max_num_ref_frames + 1` slots so the
/// current picture can be inserted before the marking process evicts.
pub struct ReferenceFrameTable {
    pub slots: [RefFrameSlot; MAX_REFERENCE_FRAMES + 1],
    /// Live bound from the sequence parameters.
    pub num_reference_frames: usize,
    pub num_short_term: usize,
    pub num_long_term: usize,
    /// `None` encodes "no long-term frame indices".
    pub max_long_term_frame_idx: Option<i32>,
}

impl Default for ReferenceFrameTable {
    fn default() -> Self {
        Self {
            slots: [RefFrameSlot::default(); MAX_REFERENCE_FRAMES + 1],
            num_reference_frames: 0,
            num_short_term: 0,
            num_long_term: 0,
            max_long_term_frame_idx: None,
        }
    }
}

impl ReferenceFrameTable {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slots.len()).filter(|&i| !self.slots[i].usage.is_empty())
    }

    pub fn in_use(&self) -> usize {
        self.num_short_term + self.num_long_term
    }

    /// Derive `PicNum` and `LongTermPicNum` for every occupied slot
    /// relative to the current frame number. Field decoding doubles the
    /// numbers; parity adjustment happens per list entry.
    pub fn update_picture_numbers(&mut self, frame_num: i32, max_frame_num: i32, field_pic: bool) {
        for slot in self.slots.iter_mut() {
            if slot.usage.is_empty() {
                continue;
            }
            let wrap = if slot.frame_num > frame_num {
                slot.frame_num - max_frame_num
            } else {
                slot.frame_num
            };
            slot.pic_num = if field_pic { 2 * wrap } else { wrap };
            slot.long_term_pic_num = if field_pic {
                2 * slot.long_term_frame_idx
            } else {
                slot.long_term_frame_idx
            };
        }
    }
}

/// Per-slice inputs of list construction.
pub struct ListParams {
    pub slice_type: SliceType,
    pub field_pic: bool,
    pub bottom_field: bool,
    pub poc: i32,
    pub num_ref_idx_l0_active: usize,
    pub num_ref_idx_l1_active: usize,
    /// Require two references for B slices. Streams that have produced an
    /// IDR are trusted to predict from a single one in forward play.
    pub apply_two_ref_test_for_b: bool,
}

fn frame_entry(slot: &RefFrameSlot, long_term: bool) -> (i64, ReferenceDetail) {
    (
        slot.decode_index,
        ReferenceDetail {
            long_term,
            picture_number: if long_term {
                slot.long_term_pic_num
            } else {
                slot.pic_num
            },
            pic_order_cnt: slot.poc,
            usage: FieldUse::Frame,
        },
    )
}

fn field_entry(slot: &RefFrameSlot, long_term: bool, top: bool, same_parity: bool) -> (i64, ReferenceDetail) {
    let base = if long_term {
        slot.long_term_pic_num
    } else {
        slot.pic_num
    };
    (
        slot.decode_index,
        ReferenceDetail {
            long_term,
            picture_number: if same_parity { base + 1 } else { base },
            pic_order_cnt: if top { slot.poc_top } else { slot.poc_bot },
            usage: if top {
                FieldUse::TopField
            } else {
                FieldUse::BottomField
            },
        },
    )
}

/// Alternate-parity interleave of a frame-ordered candidate list,
/// starting with the parity of the current field. When the wanted parity
/// runs out the remaining fields of the other parity follow in order.
fn interleave_fields(
    table: &ReferenceFrameTable,
    frames: &[usize],
    long_term: bool,
    current_is_top: bool,
    out: &mut Vec<(i64, ReferenceDetail)>,
) {
    let has_parity = |slot: &RefFrameSlot, top: bool| {
        let mask = match (long_term, top) {
            (false, true) => Usage::TOP_SHORT,
            (false, false) => Usage::BOT_SHORT,
            (true, true) => Usage::TOP_LONG,
            (true, false) => Usage::BOT_LONG,
        };
        slot.usage.intersects(mask)
    };

    let mut tops = frames
        .iter()
        .copied()
        .filter(|&i| has_parity(&table.slots[i], true));
    let mut bots = frames
        .iter()
        .copied()
        .filter(|&i| has_parity(&table.slots[i], false));

    let mut want_top = current_is_top;
    loop {
        let next = if want_top { tops.next() } else { bots.next() };
        match next {
            Some(i) => {
                let same_parity = want_top == current_is_top;
                out.push(field_entry(
                    &table.slots[i],
                    long_term,
                    want_top,
                    same_parity,
                ));
                want_top = !want_top;
            }
            None => break,
        }
    }
    // Drain whichever parity is left, in candidate order.
    let rest: Vec<usize> = if want_top {
        bots.collect()
    } else {
        tops.collect()
    };
    for i in rest {
        let top = !want_top;
        out.push(field_entry(
            &table.slots[i],
            long_term,
            top,
            top == current_is_top,
        ));
    }
}

/// Build the P, B0 and B1 reference picture lists for one slice from the
/// current reference set. Pure with respect to the table.
pub fn build_reference_lists(
    table: &ReferenceFrameTable,
    params: &ListParams,
) -> Result<[ReferenceList; NUM_REF_FRAME_LISTS]> {
    let mut lists: [ReferenceList; NUM_REF_FRAME_LISTS] = Default::default();

    if params.field_pic {
        build_field_lists(table, params, &mut lists);
    } else {
        build_frame_lists(table, params, &mut lists);
    }

    lists[P_REF_PIC_LIST]
        .entries
        .truncate(params.num_ref_idx_l0_active);
    lists[B_REF_PIC_LIST_0]
        .entries
        .truncate(params.num_ref_idx_l0_active);
    lists[B_REF_PIC_LIST_1]
        .entries
        .truncate(params.num_ref_idx_l1_active);

    // When both B lists come out identical with more than one entry, the
    // first two entries of list 1 are switched to avoid symmetric
    // prediction.
    let b0 = &lists[B_REF_PIC_LIST_0];
    let b1 = &lists[B_REF_PIC_LIST_1];
    if b1.len() > 1 && b0.entries == b1.entries {
        lists[B_REF_PIC_LIST_1].entries.swap(0, 1);
    }

    // Too few usable references for this slice type. Not fatal: the caller
    // decides between discarding and deferring.
    let available = table.in_use();
    let needs_two = params.apply_two_ref_test_for_b && params.slice_type.is_b();
    if (!params.slice_type.is_i() && available < 1) || (needs_two && available < 2) {
        return Err(FrameParserError::InsufficientReferenceFrames);
    }

    Ok(lists)
}

fn build_frame_lists(
    table: &ReferenceFrameTable,
    params: &ListParams,
    lists: &mut [ReferenceList; NUM_REF_FRAME_LISTS],
) {
    let mut short: Vec<usize> = table
        .occupied()
        .filter(|&i| {
            let slot = &table.slots[i];
            slot.usage.complementary_pair() && slot.usage.short_term()
        })
        .collect();
    let mut long: Vec<usize> = table
        .occupied()
        .filter(|&i| {
            let slot = &table.slots[i];
            slot.usage.complementary_pair() && slot.usage.long_term()
        })
        .collect();
    long.sort_by_key(|&i| table.slots[i].long_term_pic_num);

    // P list: short term by descending PicNum, then long term by
    // ascending LongTermPicNum.
    short.sort_by_key(|&i| Reverse(table.slots[i].pic_num));
    for &i in &short {
        lists[P_REF_PIC_LIST]
            .entries
            .push(frame_entry(&table.slots[i], false));
    }
    for &i in &long {
        lists[P_REF_PIC_LIST]
            .entries
            .push(frame_entry(&table.slots[i], true));
    }

    // B list 0: short term before the current POC descending, then after
    // it ascending; list 1 swaps the two partitions. Long term entries
    // are appended identically to both.
    let mut before: Vec<usize> = Vec::new();
    let mut after: Vec<usize> = Vec::new();
    for &i in &short {
        if table.slots[i].poc < params.poc {
            before.push(i);
        } else {
            after.push(i);
        }
    }
    before.sort_by_key(|&i| Reverse(table.slots[i].poc));
    after.sort_by_key(|&i| table.slots[i].poc);

    for &i in before.iter().chain(after.iter()) {
        lists[B_REF_PIC_LIST_0]
            .entries
            .push(frame_entry(&table.slots[i], false));
    }
    for &i in after.iter().chain(before.iter()) {
        lists[B_REF_PIC_LIST_1]
            .entries
            .push(frame_entry(&table.slots[i], false));
    }
    for &i in &long {
        let entry = frame_entry(&table.slots[i], true);
        lists[B_REF_PIC_LIST_0].entries.push(entry);
        lists[B_REF_PIC_LIST_1].entries.push(entry);
    }
}

fn build_field_lists(
    table: &ReferenceFrameTable,
    params: &ListParams,
    lists: &mut [ReferenceList; NUM_REF_FRAME_LISTS],
) {
    let current_is_top = !params.bottom_field;

    let mut short: Vec<usize> = table
        .occupied()
        .filter(|&i| table.slots[i].usage.short_term())
        .collect();
    let mut long: Vec<usize> = table
        .occupied()
        .filter(|&i| table.slots[i].usage.long_term())
        .collect();
    long.sort_by_key(|&i| table.slots[i].long_term_frame_idx);

    // P list: frames by descending FrameNumWrap, parity-interleaved.
    short.sort_by_key(|&i| Reverse(table.slots[i].pic_num));
    interleave_fields(
        table,
        &short,
        false,
        current_is_top,
        &mut lists[P_REF_PIC_LIST].entries,
    );
    interleave_fields(
        table,
        &long,
        true,
        current_is_top,
        &mut lists[P_REF_PIC_LIST].entries,
    );

    // B lists: POC partitions at frame level (<= for fields), then the
    // same parity interleave.
    let mut before: Vec<usize> = Vec::new();
    let mut after: Vec<usize> = Vec::new();
    for &i in &short {
        if table.slots[i].poc <= params.poc {
            before.push(i);
        } else {
            after.push(i);
        }
    }
    before.sort_by_key(|&i| Reverse(table.slots[i].poc));
    after.sort_by_key(|&i| table.slots[i].poc);

    let list0_frames: Vec<usize> = before.iter().chain(after.iter()).copied().collect();
    let list1_frames: Vec<usize> = after.iter().chain(before.iter()).copied().collect();

    interleave_fields(
        table,
        &list0_frames,
        false,
        current_is_top,
        &mut lists[B_REF_PIC_LIST_0].entries,
    );
    interleave_fields(
        table,
        &long,
        true,
        current_is_top,
        &mut lists[B_REF_PIC_LIST_0].entries,
    );
    interleave_fields(
        table,
        &list1_frames,
        false,
        current_is_top,
        &mut lists[B_REF_PIC_LIST_1].entries,
    );
    interleave_fields(
        table,
        &long,
        true,
        current_is_top,
        &mut lists[B_REF_PIC_LIST_1].entries,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_term_frame(decode_index: i64, frame_num: i32, poc: i32) -> RefFrameSlot {
        RefFrameSlot {
            usage: Usage::ANY_SHORT,
            frame_num,
            poc,
            poc_top: poc,
            poc_bot: poc,
            decode_index,
            ..Default::default()
        }
    }

    fn long_term_frame(decode_index: i64, long_term_frame_idx: i32, poc: i32) -> RefFrameSlot {
        RefFrameSlot {
            usage: Usage::ANY_LONG,
            long_term_frame_idx,
            poc,
            poc_top: poc,
            poc_bot: poc,
            decode_index,
            ..Default::default()
        }
    }

    fn params(slice_type: SliceType, poc: i32) -> ListParams {
        ListParams {
            slice_type,
            field_pic: false,
            bottom_field: false,
            poc,
            num_ref_idx_l0_active: 16,
            num_ref_idx_l1_active: 16,
            apply_two_ref_test_for_b: false,
        }
    }

    fn table_with(slots: &[RefFrameSlot]) -> ReferenceFrameTable {
        let mut table = ReferenceFrameTable {
            num_reference_frames: 4,
            ..Default::default()
        };
        for (i, slot) in slots.iter().enumerate() {
            table.slots[i] = *slot;
            if slot.usage.short_term() {
                table.num_short_term += 1;
            } else if slot.usage.long_term() {
                table.num_long_term += 1;
            }
        }
        table
    }

    #[test]
    fn p_list_orders_short_desc_then_long_asc() {
        let mut table = table_with(&[
            short_term_frame(10, 1, 2),
            short_term_frame(11, 3, 6),
            short_term_frame(12, 2, 4),
            long_term_frame(13, 1, 0),
            long_term_frame(14, 0, -2),
        ]);
        table.update_picture_numbers(4, 16, false);

        let lists = build_reference_lists(&table, &params(SliceType::P, 8)).unwrap();
        let p: Vec<i64> = lists[P_REF_PIC_LIST].entries.iter().map(|e| e.0).collect();
        // Short term: frame_num 3, 2, 1; long term: idx 0, 1.
        assert_eq!(p, vec![11, 12, 10, 14, 13]);
    }

    #[test]
    fn p_list_wraps_picture_numbers() {
        let mut table = table_with(&[
            short_term_frame(10, 14, 2),
            short_term_frame(11, 15, 4),
            short_term_frame(12, 0, 6),
        ]);
        // Current frame_num 1: 14 and 15 wrap to -2 and -1.
        table.update_picture_numbers(1, 16, false);

        let lists = build_reference_lists(&table, &params(SliceType::P, 8)).unwrap();
        let p: Vec<i64> = lists[P_REF_PIC_LIST].entries.iter().map(|e| e.0).collect();
        assert_eq!(p, vec![12, 11, 10]);
    }

    #[test]
    fn b_lists_partition_around_current_poc() {
        let mut table = table_with(&[
            short_term_frame(10, 1, 2),
            short_term_frame(11, 2, 4),
            short_term_frame(12, 3, 8),
            short_term_frame(13, 4, 10),
        ]);
        table.update_picture_numbers(5, 16, false);

        let lists = build_reference_lists(&table, &params(SliceType::B, 6)).unwrap();
        let b0: Vec<i64> = lists[B_REF_PIC_LIST_0].entries.iter().map(|e| e.0).collect();
        let b1: Vec<i64> = lists[B_REF_PIC_LIST_1].entries.iter().map(|e| e.0).collect();
        // B0: below 6 descending (4, 2), then above ascending (8, 10).
        assert_eq!(b0, vec![11, 10, 12, 13]);
        // B1: above ascending first, then below descending.
        assert_eq!(b1, vec![12, 13, 11, 10]);
    }

    #[test]
    fn identical_b_lists_swap_first_two_of_list1() {
        // All references on one side of the current POC make both lists
        // identical.
        let mut table = table_with(&[
            short_term_frame(10, 1, 2),
            short_term_frame(11, 2, 4),
        ]);
        table.update_picture_numbers(3, 16, false);

        let lists = build_reference_lists(&table, &params(SliceType::B, 6)).unwrap();
        let b0: Vec<i64> = lists[B_REF_PIC_LIST_0].entries.iter().map(|e| e.0).collect();
        let b1: Vec<i64> = lists[B_REF_PIC_LIST_1].entries.iter().map(|e| e.0).collect();
        assert_eq!(b0, vec![11, 10]);
        assert_eq!(b1, vec![10, 11]);
    }

    #[test]
    fn list_construction_is_deterministic() {
        let mut table = table_with(&[
            short_term_frame(10, 1, 2),
            short_term_frame(11, 2, 4),
            long_term_frame(13, 0, 0),
        ]);
        table.update_picture_numbers(3, 16, false);

        let p = params(SliceType::B, 3);
        let first = build_reference_lists(&table, &p).unwrap();
        let second = build_reference_lists(&table, &p).unwrap();
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.entries, b.entries);
        }
    }

    #[test]
    fn b_slice_with_one_reference_fails_two_ref_test() {
        let mut table = table_with(&[short_term_frame(10, 1, 2)]);
        table.update_picture_numbers(2, 16, false);

        let mut p = params(SliceType::B, 4);
        p.apply_two_ref_test_for_b = true;
        assert!(matches!(
            build_reference_lists(&table, &p),
            Err(FrameParserError::InsufficientReferenceFrames)
        ));

        // Without the policy a single reference is accepted.
        p.apply_two_ref_test_for_b = false;
        assert!(build_reference_lists(&table, &p).is_ok());
    }

    #[test]
    fn p_slice_without_references_is_insufficient() {
        let table = table_with(&[]);
        assert!(matches!(
            build_reference_lists(&table, &params(SliceType::P, 0)),
            Err(FrameParserError::InsufficientReferenceFrames)
        ));
    }

    #[test]
    fn active_count_truncates_lists() {
        let mut table = table_with(&[
            short_term_frame(10, 1, 2),
            short_term_frame(11, 2, 4),
            short_term_frame(12, 3, 6),
        ]);
        table.update_picture_numbers(4, 16, false);

        let mut p = params(SliceType::P, 8);
        p.num_ref_idx_l0_active = 2;
        let lists = build_reference_lists(&table, &p).unwrap();
        assert_eq!(lists[P_REF_PIC_LIST].len(), 2);
    }

    #[test]
    fn field_lists_interleave_parities() {
        let mut table = table_with(&[
            short_term_frame(10, 1, 2),
            short_term_frame(11, 2, 4),
        ]);
        table.update_picture_numbers(3, 16, true);

        let mut p = params(SliceType::P, 5);
        p.field_pic = true;
        let lists = build_reference_lists(&table, &p).unwrap();
        let entries = &lists[P_REF_PIC_LIST].entries;
        // Two frames, both fields referenced: top/bottom alternating,
        // same-parity entries carry the +1 picture number.
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].1.usage, FieldUse::TopField);
        assert_eq!(entries[1].1.usage, FieldUse::BottomField);
        assert_eq!(entries[0].1.picture_number, table.slots[1].pic_num + 1);
        assert_eq!(entries[1].1.picture_number, table.slots[1].pic_num);
    }
}
