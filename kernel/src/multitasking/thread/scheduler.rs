// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The round-robin dispatcher: picks the next runnable process and
//! hands control to it.
//!
//! [`dispatch`] is the single entry point, called both from the timer
//! IRQ handler registered below (preemptive) and directly by the
//! yield/exit syscalls (cooperative) — the two paths only ever differ
//! in who currently holds the interrupt frame, not in what dispatch
//! itself does with it.

use crate::{switch, ProcessKind, ProcessState, CURRENT_SLOT, PROCESS_TABLE};
use core::sync::atomic::{AtomicU64, Ordering};
use interrupts::{register_irq, InterruptFrame, Irq};

static TICKS_SINCE_DISPATCH: AtomicU64 = AtomicU64::new(0);

/// Registers the timer and RTC IRQ handlers, and the fault handler that
/// terminates a user process on a ring-3 general-protection or page
/// fault. Called once, by [`crate::init`].
///
pub(crate) fn register_handlers() {
    register_irq(Irq::new(0).unwrap(), timer_handler);
    register_irq(Irq::new(8).unwrap(), rtc_handler);
    interrupts::set_fault_handler(fault_handler);
}

/// Marks the faulting process exited and dispatches away from it, the
/// same way the exit syscall does.
///
fn fault_handler(frame: &mut InterruptFrame) {
    crate::mark_current_exited();
    dispatch(frame);
}

fn timer_handler(frame: &InterruptFrame, _irq: Irq) {
    time::tick();

    let ticks = TICKS_SINCE_DISPATCH.fetch_add(1, Ordering::Relaxed) + 1;
    if ticks < config::QUANTUM_TICKS {
        return;
    }
    TICKS_SINCE_DISPATCH.store(0, Ordering::Relaxed);
    dispatch(frame);
}

fn rtc_handler(_frame: &InterruptFrame, _irq: Irq) {
    time::rtc_tick();
}

/// Saves the current process's stack pointer, picks the next runnable
/// slot round-robin from the one after it, and switches to it.
///
/// If no other slot is runnable, returns without switching and the
/// caller resumes normally. Otherwise this never returns: the switched
/// process resumes through the shared ISR epilogue instead.
///
pub fn dispatch(frame: &InterruptFrame) {
    let mut table = PROCESS_TABLE.lock();
    let current = CURRENT_SLOT.load(Ordering::Relaxed);

    if let Some(process) = table[current].as_mut() {
        process.stack_pointer = frame as *const InterruptFrame as u32;
    }

    let mut next_slot = None;
    for offset in 1..=config::MAX_PROCESSES {
        let candidate = (current + offset) % config::MAX_PROCESSES;

        // A process left Exited by the last time we passed over it is
        // reclaimed here, on the next scheduler pass: the slot is
        // freed for reuse, but (per Process::mark_exited) its owned
        // memory is not.
        if matches!(table[candidate], Some(ref process) if process.state == ProcessState::Exited)
        {
            table[candidate] = None;
            continue;
        }

        if matches!(table[candidate], Some(ref process) if process.state.is_runnable()) {
            next_slot = Some(candidate);
            break;
        }
    }

    let next_slot = match next_slot {
        Some(slot) if slot != current => slot,
        _ => return,
    };

    let was_first_run;
    let kind;
    let new_esp;
    {
        let process = table[next_slot].as_mut().expect("scanned slot vanished");
        was_first_run = process.state == ProcessState::FirstRun;
        process.state = ProcessState::Running;
        kind = process.kind;
        new_esp = process.stack_pointer;

        segmentation::set_kernel_stack(process.kernel_stack_top.as_u32());

        let directory = process
            .address_space
            .as_ref()
            .map(|space| space.directory())
            .unwrap_or_else(crate::kernel_directory);
        unsafe { cpu::load_page_directory(directory) };
    }
    CURRENT_SLOT.store(next_slot, Ordering::Relaxed);

    drop(table);

    if was_first_run && kind == ProcessKind::User {
        unsafe { switch::first_dispatch_to_user(new_esp) };
    } else {
        unsafe { switch::context_switch(new_esp) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_and_first_run_are_runnable() {
        assert!(ProcessState::Running.is_runnable());
        assert!(ProcessState::FirstRun.is_runnable());
        assert!(!ProcessState::Exited.is_runnable());
    }
}
