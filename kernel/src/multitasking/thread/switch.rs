// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The two low-level routines the scheduler jumps into to actually
//! resume a different process: [`context_switch`] for the steady
//! state, [`first_dispatch_to_user`] for a process's first trip to
//! ring 3.
//!
//! Both are mechanically identical: load the new process's saved
//! stack pointer into ESP, then fall into [`interrupts`](../interrupts/index.html)'s
//! shared ISR epilogue, which pops the manufactured or previously
//! saved register state and `iret`s into it. Whether that `iret` drops
//! privilege to ring 3 is decided entirely by the CS value already
//! sitting in the frame, not by which of these two labels got there —
//! they are kept distinct because the scheduler's call site needs to
//! state which case it believes it is in, not because the assembly
//! differs.

use core::arch::global_asm;

global_asm!(include_str!("switch.s"));

extern "C" {
    /// Switches onto the saved stack frame at `new_esp` and resumes
    /// it. Used for every dispatch except a user process's first run.
    ///
    /// Never returns: the resumed frame's `iret` is this function's
    /// only exit.
    ///
    pub fn context_switch(new_esp: u32) -> !;

    /// Switches onto the saved stack frame at `new_esp` and resumes
    /// it, for a `FirstRun` user process.
    ///
    /// Identical to [`context_switch`] in every respect but name: the
    /// frame's own CS selector (ring 3, set when the process was
    /// created) is what actually causes `iret` to drop privilege.
    ///
    pub fn first_dispatch_to_user(new_esp: u32) -> !;
}
