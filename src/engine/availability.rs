use crate::model::*;

// ── Booked-block merging ──────────────────────────────────────────

/// Merge a day's active bookings into display blocks.
///
/// Rows are ordered by slot ordinal (then start time). A row joins the
/// current block when it belongs to the same reservation and its slot ordinal
/// is exactly one past the block's last ordinal. Blocks report the earliest
/// start, latest end and the summed price of their rows.
pub fn merge_booked_blocks<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> Vec<BookedBlock> {
    let mut rows: Vec<&Booking> = bookings
        .into_iter()
        .filter(|b| b.status.is_active())
        .collect();
    rows.sort_by(|a, b| a.slot_id.cmp(&b.slot_id).then(a.range.start.cmp(&b.range.start)));

    let mut blocks: Vec<BookedBlock> = Vec::new();
    for row in rows {
        if let Some(last) = blocks.last_mut()
            && last.reservation_id == row.reservation_id
            && last.date == row.date
            && last.slot_ids.last().is_some_and(|&s| s + 1 == row.slot_id)
        {
            last.booking_ids.push(row.id);
            last.slot_ids.push(row.slot_id);
            last.range.start = last.range.start.min(row.range.start);
            last.range.end = last.range.end.max(row.range.end);
            last.price += row.price;
            continue;
        }
        blocks.push(BookedBlock {
            reservation_id: row.reservation_id,
            booking_ids: vec![row.id],
            slot_ids: vec![row.slot_id],
            date: row.date,
            range: row.range,
            price: row.price,
        });
    }
    blocks
}

/// Split a merged block back into `(booking id, slot ordinal)` pairs.
pub fn split_block(block: &BookedBlock) -> Vec<(ulid::Ulid, SlotId)> {
    block
        .booking_ids
        .iter()
        .copied()
        .zip(block.slot_ids.iter().copied())
        .collect()
}

// ── Range merging ─────────────────────────────────────────────────

/// Merge overlapping or touching ranges into disjoint ranges, sorted by start.
pub fn merge_ranges(ranges: &[TimeRange]) -> Vec<TimeRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| r.start);
    let mut merged: Vec<TimeRange> = Vec::new();
    for range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}
