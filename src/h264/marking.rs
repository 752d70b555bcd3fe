// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded reference picture marking process: sliding-window and
//! adaptive (memory management control operation) maintenance of the
//! bounded reference set.

use log::debug;
use log::error;
use log::info;

use crate::h264::parser::MmcoOp;
use crate::h264::parser::SliceHeader;
use crate::h264::poc::PocContext;
use crate::h264::poc::PocResult;
use crate::h264::reflist::ReferenceFrameTable;
use crate::h264::reflist::Usage;
use crate::FrameParserError;
use crate::Result;

/// Where marking reports releases. In forward play releases go to the
/// decoder immediately; in reverse play the bookkeeping runs dry
/// (`actually_release = false`) because the frames are released by the
/// stack walk instead.
pub trait MarkingSink {
    /// Tell the decoder to drop its hold on a decode index.
    fn release_reference(&mut self, decode_index: i64);

    /// A slot fully left the reference set; the deferred output-order
    /// queue can resolve everything up to its ordering key.
    fn slot_released(&mut self, decode_index: i64, extended_poc: u64);
}

/// The committed picture driving the marking process.
pub struct CurrentPicture<'a> {
    pub hdr: &'a SliceHeader,
    pub poc: PocResult,
    pub decode_index: i64,
}

/// Field-parity masks of the current picture.
struct Masks {
    short_this: Usage,
    short_other: Usage,
    long_this: Usage,
    long_other: Usage,
    field_used: Usage,
    other_field_used: Usage,
}

impl Masks {
    fn for_picture(field: bool, top: bool) -> Masks {
        if field {
            let (short_this, short_other, long_this, long_other) = if top {
                (
                    Usage::TOP_SHORT,
                    Usage::BOT_SHORT,
                    Usage::TOP_LONG,
                    Usage::BOT_LONG,
                )
            } else {
                (
                    Usage::BOT_SHORT,
                    Usage::TOP_SHORT,
                    Usage::BOT_LONG,
                    Usage::TOP_LONG,
                )
            };
            Masks {
                short_this,
                short_other,
                long_this,
                long_other,
                field_used: short_this | long_this,
                other_field_used: short_other | long_other,
            }
        } else {
            Masks {
                short_this: Usage::ANY_SHORT,
                short_other: Usage::empty(),
                long_this: Usage::ANY_LONG,
                long_other: Usage::empty(),
                field_used: Usage::ANY_SHORT | Usage::ANY_LONG,
                other_field_used: Usage::empty(),
            }
        }
    }
}

/// Clear `mask` from a slot's usage, updating the short/long counts and
/// reporting a fully released slot to the sink.
fn release_reference(
    table: &mut ReferenceFrameTable,
    actually_release: bool,
    entry: usize,
    mask: Usage,
    sink: &mut dyn MarkingSink,
) {
    let old_usage = table.slots[entry].usage;
    table.slots[entry].usage &= !mask;
    let new_usage = table.slots[entry].usage;

    debug!(
        "release entry {} (frame_num {}) {:?} => {:?}",
        entry, table.slots[entry].frame_num, old_usage, new_usage
    );

    if new_usage.is_empty() && actually_release {
        sink.slot_released(
            table.slots[entry].decode_index,
            table.slots[entry].extended_poc,
        );
    }

    if old_usage.short_term() && !new_usage.short_term() {
        table.num_short_term = table.num_short_term.saturating_sub(1);
    }
    if old_usage.long_term() && !new_usage.long_term() {
        table.num_long_term = table.num_long_term.saturating_sub(1);
    }
}

/// Run the decoded reference picture marking process for a committed
/// reference picture, inserting it into the table and applying the
/// sliding-window or adaptive management policy.
pub fn mark_reference_pictures(
    table: &mut ReferenceFrameTable,
    poc_ctx: &mut PocContext,
    cur: &CurrentPicture,
    actually_release: bool,
    sink: &mut dyn MarkingSink,
) -> Result<()> {
    let hdr = cur.hdr;
    let field = hdr.field_pic;
    let top = field && !hdr.bottom_field;
    let idr = hdr.idr;
    let long_term = hdr.dec_ref_pic_marking.long_term_reference_flag;
    let adaptive = hdr.dec_ref_pic_marking.adaptive_ref_pic_marking_mode;
    let masks = Masks::for_picture(field, top);
    let max_frame_num = hdr.sps.max_frame_num();
    let frame_num = hdr.frame_num;

    table.num_reference_frames = hdr.sps.max_num_ref_frames as usize;

    // Is this the second field of a frame already in the table?
    let mut current_entry = 0usize;
    let mut second_field_entry = false;

    if field {
        for i in 0..table.slots.len() {
            let slot = &table.slots[i];
            if slot.usage.is_empty()
                || !slot.is_field
                || slot.frame_num != frame_num
                || slot.decode_index + 1 != cur.decode_index
            {
                continue;
            }

            if slot.usage.intersects(masks.field_used)
                || !slot.usage.intersects(masks.other_field_used)
            {
                error!("duplicate reference field, or invalid reference list entry");
                return Err(FrameParserError::HeaderSyntaxError);
            }

            let slot = &mut table.slots[i];
            if top {
                slot.poc_top = cur.poc.top;
            } else {
                slot.poc_bot = cur.poc.bot;
            }
            slot.poc = slot.poc_top.min(slot.poc_bot);

            if long_term {
                slot.usage |= masks.long_this;
                slot.long_term_frame_idx = frame_num;
                if !(slot.usage & masks.long_other).intersects(masks.long_other) {
                    table.num_long_term += 1;
                }
            } else {
                slot.usage |= masks.short_this;
                slot.frame_num = frame_num;
                if !(slot.usage & masks.short_other).intersects(masks.short_other) {
                    table.num_short_term += 1;
                }
            }

            // The coded buffer is held through the first field's entry;
            // the second field's own hold can go immediately.
            if actually_release {
                sink.release_reference(cur.decode_index);
            }

            current_entry = i;
            second_field_entry = true;
        }
    }

    // A fresh IDR releases everyone.
    if !second_field_entry && idr {
        for i in 0..table.slots.len() {
            if table.slots[i].usage.is_empty() {
                continue;
            }
            if actually_release {
                sink.release_reference(table.slots[i].decode_index);
            }
            table.slots[i].usage = Usage::empty();
        }
        table.num_short_term = 0;
        table.num_long_term = 0;
    }

    // Insert the current picture.
    if !second_field_entry {
        // A live entry with the same frame number is obsolete.
        for i in 0..table.slots.len() {
            if !table.slots[i].usage.is_empty() && table.slots[i].frame_num == frame_num {
                info!("deleting obsolete reference with frame_num {}", frame_num);
                release_reference(table, true, i, Usage::all(), sink);
            }
        }

        let mut placed = false;
        for i in 0..table.slots.len() {
            if !table.slots[i].usage.is_empty() {
                continue;
            }
            let slot = &mut table.slots[i];
            slot.is_field = field;
            slot.decode_index = cur.decode_index;
            slot.poc = cur.poc.poc;
            slot.poc_top = cur.poc.top;
            slot.poc_bot = cur.poc.bot;
            slot.extended_poc = cur.poc.extended;
            slot.frame_num = frame_num;

            if long_term {
                slot.usage = masks.long_this;
                slot.long_term_frame_idx = frame_num;
                table.num_long_term += 1;
                if idr {
                    table.max_long_term_frame_idx = Some(0);
                }
            } else {
                slot.usage = masks.short_this;
                table.num_short_term += 1;
                if idr {
                    table.max_long_term_frame_idx = None;
                }
            }

            current_entry = i;
            placed = true;
            break;
        }

        if !placed {
            // Nowhere to put a new reference: the table state is beyond
            // repair and the caller resets the list.
            return Err(FrameParserError::Implementation(
                "reference frame table full",
            ));
        }
    }

    if !idr {
        if !adaptive {
            sliding_window(table, cur, frame_num, max_frame_num, current_entry, actually_release, sink);
        } else {
            adaptive_marking(
                table,
                poc_ctx,
                cur,
                &masks,
                current_entry,
                field,
                long_term,
                actually_release,
                sink,
            );
        }

        // After processing, occupancy may still exceed the configured
        // maximum.
        let over = table.in_use() as i64 - table.num_reference_frames as i64;
        if over == 1 {
            error!(
                "more than the allowed number of reference frames after marking; \
                 the oldest will be discarded"
            );
            let oldest = table
                .occupied()
                .min_by_key(|&i| table.slots[i].decode_index);
            if let Some(entry) = oldest {
                release_reference(table, true, entry, Usage::all(), sink);
            }
        } else if over > 1 {
            error!(
                "reference set {} over the allowed maximum after marking; \
                 force-clearing everything but the current picture",
                over
            );
            for i in 0..table.slots.len() {
                if i != current_entry && !table.slots[i].usage.is_empty() {
                    release_reference(table, actually_release, i, Usage::all(), sink);
                }
            }
        }
    }

    Ok(())
}

/// 8.2.5.3: evict the short-term slot with the smallest wrapped frame
/// number once the set exceeds the configured reference count.
fn sliding_window(
    table: &mut ReferenceFrameTable,
    _cur: &CurrentPicture,
    frame_num: i32,
    max_frame_num: i32,
    current_entry: usize,
    actually_release: bool,
    sink: &mut dyn MarkingSink,
) {
    if table.in_use() <= table.num_reference_frames {
        return;
    }

    let mut lowest: Option<(i32, usize)> = None;
    for i in 0..table.slots.len() {
        if i == current_entry || !table.slots[i].usage.short_term() {
            continue;
        }
        let wrap = if table.slots[i].frame_num > frame_num {
            table.slots[i].frame_num - max_frame_num
        } else {
            table.slots[i].frame_num
        };
        if lowest.map_or(true, |(w, _)| wrap < w) {
            lowest = Some((wrap, i));
        }
    }

    if let Some((_, entry)) = lowest {
        release_reference(table, actually_release, entry, Usage::ANY_SHORT, sink);
    }
}

/// The adaptive memory control process: an explicit, bounded operation
/// list replaces the sliding window for this picture.
#[allow(clippy::too_many_arguments)]
fn adaptive_marking(
    table: &mut ReferenceFrameTable,
    poc_ctx: &mut PocContext,
    cur: &CurrentPicture,
    masks: &Masks,
    current_entry: usize,
    field: bool,
    long_term: bool,
    actually_release: bool,
    sink: &mut dyn MarkingSink,
) {
    let hdr = cur.hdr;
    let frame_num = hdr.frame_num;

    // Re-derive the picture numbers; in reverse play they have not been
    // computed for this picture yet.
    table.update_picture_numbers(frame_num, hdr.sps.max_frame_num(), field);

    let ops = hdr.dec_ref_pic_marking.ops.clone();
    for op in &ops {
        match *op {
            MmcoOp::ForgetShort {
                difference_of_pic_nums_minus1,
            } => {
                let diff = difference_of_pic_nums_minus1 as i32 + 1;
                if !field {
                    let pic_num_x = frame_num - diff;
                    if let Some(j) = (0..table.slots.len()).find(|&j| {
                        table.slots[j].usage.short_term() && table.slots[j].pic_num == pic_num_x
                    }) {
                        release_reference(table, actually_release, j, Usage::ANY_SHORT, sink);
                    }
                } else {
                    let pic_num_x = 2 * frame_num + 1 - diff;
                    if let Some(j) = (0..table.slots.len()).find(|&j| {
                        table.slots[j].usage.short_term()
                            && (table.slots[j].pic_num == pic_num_x
                                || table.slots[j].pic_num + 1 == pic_num_x)
                    }) {
                        let mask = if table.slots[j].pic_num == pic_num_x {
                            masks.short_other
                        } else {
                            masks.short_this
                        };
                        release_reference(table, actually_release, j, mask, sink);
                    }
                }
            }

            MmcoOp::ForgetLong { long_term_pic_num } => {
                let n = long_term_pic_num as i32;
                if !field {
                    if let Some(j) = (0..table.slots.len()).find(|&j| {
                        table.slots[j].usage.long_term() && table.slots[j].long_term_pic_num == n
                    }) {
                        release_reference(table, actually_release, j, Usage::ANY_LONG, sink);
                    }
                } else if let Some(j) = (0..table.slots.len()).find(|&j| {
                    table.slots[j].usage.long_term()
                        && (table.slots[j].long_term_pic_num == n
                            || table.slots[j].long_term_pic_num + 1 == n)
                }) {
                    let mask = if table.slots[j].long_term_pic_num == n {
                        masks.long_other
                    } else {
                        masks.long_this
                    };
                    release_reference(table, actually_release, j, mask, sink);
                }
            }

            MmcoOp::ShortToLong {
                difference_of_pic_nums_minus1,
                long_term_frame_idx,
            } => {
                let diff = difference_of_pic_nums_minus1 as i32 + 1;
                let idx = long_term_frame_idx as i32;
                if !field {
                    // Evict any existing occupant of the index first.
                    if let Some(j) = (0..table.slots.len()).find(|&j| {
                        table.slots[j].usage.long_term()
                            && table.slots[j].long_term_frame_idx == idx
                    }) {
                        release_reference(table, actually_release, j, Usage::ANY_LONG, sink);
                    }

                    let pic_num_x = frame_num - diff;
                    if let Some(j) = (0..table.slots.len()).find(|&j| {
                        table.slots[j].usage.short_term() && table.slots[j].pic_num == pic_num_x
                    }) {
                        table.slots[j].long_term_frame_idx = idx;
                        table.slots[j].usage ^= Usage::ANY_SHORT & table.slots[j].usage;
                        table.slots[j].usage |= Usage::ANY_LONG;
                        table.num_short_term = table.num_short_term.saturating_sub(1);
                        table.num_long_term += 1;
                    }
                } else {
                    // Assignment before eviction: a complementary field of
                    // the assignee must not be released.
                    let pic_num_x = 2 * frame_num + 1 - diff;
                    let mut assigned = None;
                    if let Some(j) = (0..table.slots.len()).find(|&j| {
                        table.slots[j].usage.short_term()
                            && (table.slots[j].pic_num == pic_num_x
                                || table.slots[j].pic_num + 1 == pic_num_x)
                    }) {
                        assigned = Some(j);
                        let slot = &mut table.slots[j];
                        slot.long_term_frame_idx = idx;
                        if slot.pic_num == pic_num_x {
                            slot.usage ^= masks.short_other & slot.usage;
                            slot.usage |= masks.long_other;
                        } else {
                            slot.usage ^= masks.short_this & slot.usage;
                            slot.usage |= masks.long_this;
                        }
                        if !slot.usage.short_term() {
                            table.num_short_term = table.num_short_term.saturating_sub(1);
                        }
                        if slot.usage & Usage::ANY_LONG != Usage::ANY_LONG {
                            table.num_long_term += 1;
                        }
                    }

                    if let Some(j) = (0..table.slots.len()).find(|&j| {
                        table.slots[j].usage.long_term()
                            && table.slots[j].long_term_frame_idx == idx
                            && Some(j) != assigned
                    }) {
                        release_reference(table, actually_release, j, Usage::ANY_LONG, sink);
                    }
                }
            }

            MmcoOp::MaxLongTermIdx {
                max_long_term_frame_idx_plus1,
            } => {
                let max = max_long_term_frame_idx_plus1 as i32 - 1;
                for j in 0..table.slots.len() {
                    if table.slots[j].usage.long_term()
                        && table.slots[j].long_term_frame_idx > max
                    {
                        release_reference(table, actually_release, j, Usage::ANY_LONG, sink);
                    }
                }
                table.max_long_term_frame_idx = if max_long_term_frame_idx_plus1 > 0 {
                    Some(max)
                } else {
                    None
                };
            }

            MmcoOp::Clear => {
                for j in 0..table.slots.len() {
                    if j != current_entry && !table.slots[j].usage.is_empty() {
                        release_reference(table, actually_release, j, Usage::all(), sink);
                    }
                }

                // The current picture is re-based to the origin.
                let slot = &mut table.slots[current_entry];
                slot.poc_top -= cur.poc.poc;
                slot.poc_bot -= cur.poc.poc;
                slot.poc = 0;
                slot.frame_num = 0;
                poc_ctx.note_mmco_clear();

                table.num_long_term = usize::from(long_term);
                table.num_short_term = usize::from(!long_term);
                table.max_long_term_frame_idx = None;
            }

            MmcoOp::CurrentToLong {
                long_term_frame_idx,
            } => {
                let idx = long_term_frame_idx as i32;
                if let Some(j) = (0..table.slots.len()).find(|&j| {
                    table.slots[j].usage.long_term()
                        && table.slots[j].long_term_frame_idx == idx
                        && j != current_entry
                }) {
                    release_reference(table, actually_release, j, Usage::ANY_LONG, sink);
                }

                let slot = &mut table.slots[current_entry];
                slot.long_term_frame_idx = idx;
                slot.usage &= !masks.short_this;
                slot.usage |= masks.long_this;

                if !long_term {
                    if !slot.usage.short_term() {
                        table.num_short_term = table.num_short_term.saturating_sub(1);
                    }
                    if !field || slot.usage & Usage::ANY_LONG != Usage::ANY_LONG {
                        table.num_long_term += 1;
                    }
                }
            }
        }
    }
}
