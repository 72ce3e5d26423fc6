// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's two monotonic counters: a tick count advanced by the
//! timer IRQ, and a seconds count advanced by the RTC IRQ.
//!
//! Programming the PIT's divisor and the CMOS/RTC registers is a
//! driver concern this crate does not take on; [`tick`] and
//! [`rtc_tick`] exist purely so whichever code owns those interrupt
//! handlers has somewhere to record that they fired.

#![no_std]

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);
static SECONDS: AtomicU64 = AtomicU64::new(0);

/// Records that the timer IRQ fired once.
///
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// The number of timer IRQs observed since boot.
///
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Records that the RTC IRQ fired once.
///
pub fn rtc_tick() {
    SECONDS.fetch_add(1, Ordering::Relaxed);
}

/// The number of RTC IRQs observed since boot.
///
/// The RTC this kernel targets is configured (by whichever driver owns
/// it) to interrupt once a second, so this doubles as an elapsed-time
/// counter.
///
pub fn seconds() -> u64 {
    SECONDS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_and_rtc_tick_count_independently() {
        let before_ticks = ticks();
        let before_seconds = seconds();
        tick();
        tick();
        rtc_tick();
        assert_eq!(ticks(), before_ticks + 2);
        assert_eq!(seconds(), before_seconds + 1);
    }
}
