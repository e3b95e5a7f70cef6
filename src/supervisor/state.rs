// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-interface reachability counters.
//!
//! Probers for one interface report concurrently, so the counters are
//! atomics updated with a compare-and-swap loop that clamps at the
//! boundaries. The counter can never be observed outside
//! `[0, total_hosts[family]]`, and edge detection compares the value the
//! update actually moved from, so a clamped call never fires a transition.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::Family;

pub struct UpCounter {
    up4: AtomicI64,
    up6: AtomicI64,
    total4: i64,
    total6: i64,
    minimum_up: i64,
}

impl UpCounter {
    pub fn new(total4: usize, total6: usize, minimum_up: usize) -> Self {
        Self {
            up4: AtomicI64::new(0),
            up6: AtomicI64::new(0),
            total4: total4 as i64,
            total6: total6 as i64,
            minimum_up: minimum_up as i64,
        }
    }

    fn cell(&self, family: Family) -> &AtomicI64 {
        match family {
            Family::V4 => &self.up4,
            Family::V6 => &self.up6,
        }
    }

    fn total(&self, family: Family) -> i64 {
        match family {
            Family::V4 => self.total4,
            Family::V6 => self.total6,
        }
    }

    /// Count one host as reachable. Returns true exactly when the counter
    /// moved and landed on `minimum_up`: the family just came up.
    pub fn host_up(&self, family: Family) -> bool {
        let total = self.total(family);
        let moved = self
            .cell(family)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                (v < total).then_some(v + 1)
            });
        match moved {
            Ok(prev) => prev + 1 == self.minimum_up,
            Err(_) => false,
        }
    }

    /// Count one host as unreachable. Returns true exactly when the counter
    /// moved and landed on `minimum_up - 1`: the family just went down.
    pub fn host_down(&self, family: Family) -> bool {
        let moved = self
            .cell(family)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                (v > 0).then_some(v - 1)
            });
        match moved {
            Ok(prev) => prev - 1 == self.minimum_up - 1,
            Err(_) => false,
        }
    }

    /// Link went down: every host of the next up cycle starts unknown.
    pub fn reset(&self) {
        self.up4.store(0, Ordering::SeqCst);
        self.up6.store(0, Ordering::SeqCst);
    }

    pub fn up(&self, family: Family) -> i64 {
        self.cell(family).load(Ordering::SeqCst)
    }
}
