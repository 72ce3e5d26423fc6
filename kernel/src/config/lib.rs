// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Compile-time tuning knobs, collected in one place so they are easy
//! to find and to change together.
//!
//! Mirrors the source's `#define`-based constants in a single module
//! rather than scattering them across the crates that use them.

#![no_std]

/// The number of slots in the process table.
///
/// Fixed at compile time: the table is a `[Option<Process>; MAX_PROCESSES]`
/// array, not a growable collection, so a full table fails process
/// creation rather than growing unboundedly.
///
pub const MAX_PROCESSES: usize = 64;

/// The size, in bytes, of every process's kernel stack.
///
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// The number of timer quanta a process runs before a preemption is
/// attempted.
///
pub const QUANTUM_TICKS: u64 = 1;

/// The split-threshold policy [`heap::init`] is started with.
///
pub const HEAP_SPLIT_POLICY: heap::SplitPolicy = heap::SplitPolicy::ReclaimQuarter;

/// The number of physical frames reserved for a new user process's
/// code image, starting at `memlayout::USER_CODE`.
///
pub const USER_CODE_FRAMES: u32 = 1;

/// The number of physical frames reserved for a new user process's
/// stack, starting at `memlayout::USER_STACK`.
///
pub const USER_STACK_FRAMES: u32 = 1;
