//! Event gap detector
//!
//! Works out which event indices of a device are still unknown and which of
//! them to fetch this cycle. The depth bound keeps a long-offline device
//! from turning into one unbounded catch-up burst: holes are filled a few
//! at a time across cycles.

use crate::device_gateway::EventIndices;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Inclusive index range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub from: u32,
    pub to: u32,
}

impl Interval {
    pub fn new(from: u32, to: u32) -> Self {
        Self { from, to }
    }

    pub fn is_open(&self) -> bool {
        self.to == u32::MAX
    }
}

/// Unknown index ranges given the known indices.
///
/// The first interval is always the open range above the highest known
/// index. Interior holes follow, most recent first. `depth < 0` returns
/// every hole, otherwise at most `depth + 1` holes.
pub fn missing(known: &BTreeSet<u32>, depth: i32) -> Vec<Interval> {
    missing_above(known, 0, depth)
}

/// Same as [`missing`], treating every index up to `floor` as known
pub fn missing_above(known: &BTreeSet<u32>, floor: u32, depth: i32) -> Vec<Interval> {
    let mut holes = Vec::new();
    let mut prev = floor;

    for &index in known.range(floor.saturating_add(1)..) {
        if index > prev.saturating_add(1) {
            holes.push(Interval::new(prev + 1, index - 1));
        }
        prev = index;
    }

    let mut intervals = Vec::with_capacity(holes.len() + 1);
    if prev < u32::MAX {
        intervals.push(Interval::new(prev + 1, u32::MAX));
    }

    holes.reverse();
    if depth >= 0 {
        holes.truncate(depth as usize + 1);
    }
    intervals.extend(holes);

    intervals
}

/// Indices to fetch from a device this cycle: missing intervals clamped to
/// the range the device still holds, newest first, then the `retry`
/// placeholders still in that range, at most `batch` in total
pub fn plan_fetch(
    known: &BTreeSet<u32>,
    retry: &BTreeSet<u32>,
    device: &EventIndices,
    depth: i32,
    batch: usize,
) -> Vec<u32> {
    if device.last == 0 || device.first > device.last || batch == 0 {
        return Vec::new();
    }

    let floor = device.first.saturating_sub(1);
    let mut plan = Vec::new();

    for interval in missing_above(known, floor, depth) {
        let lo = interval.from.max(device.first);
        let hi = interval.to.min(device.last);
        if lo > hi {
            continue;
        }

        for index in (lo..=hi).rev() {
            if plan.len() >= batch {
                return plan;
            }
            plan.push(index);
        }
    }

    let room = batch - plan.len();
    plan.extend(retry.range(device.first..=device.last).rev().take(room));
    plan
}
