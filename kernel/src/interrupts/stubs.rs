// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The assembly trampolines that land on every interrupt vector and
//! build the [`InterruptFrame`] handed to [`isr_dispatch`].
//!
//! `extern "x86-interrupt"` is a long-mode-era convenience the CPU's
//! own calling convention doesn't need here: the scheduler manufactures
//! and rewrites raw stack frames (see the `thread` crate), so the frame
//! layout has to be pinned down exactly rather than left to the
//! compiler. These stubs are hand-written instead, one per vector, all
//! falling through to a single common body.

use crate::InterruptFrame;
use core::arch::global_asm;

global_asm!(
    r#"
.intel_syntax noprefix

.macro isr_no_err num
.global isr\num
isr\num:
    push 0
    push \num
    jmp isr_common_stub
.endm

.macro isr_err num
.global isr\num
isr\num:
    push \num
    jmp isr_common_stub
.endm

isr_no_err 0
isr_no_err 1
isr_no_err 2
isr_no_err 3
isr_no_err 4
isr_no_err 5
isr_no_err 6
isr_no_err 7
isr_err    8
isr_no_err 9
isr_err    10
isr_err    11
isr_err    12
isr_err    13
isr_err    14
isr_no_err 15
isr_no_err 16
isr_err    17
isr_no_err 18
isr_no_err 19
isr_no_err 20
isr_no_err 21
isr_no_err 22
isr_no_err 23
isr_no_err 24
isr_no_err 25
isr_no_err 26
isr_no_err 27
isr_no_err 28
isr_no_err 29
isr_no_err 30
isr_no_err 31

isr_no_err 32
isr_no_err 33
isr_no_err 34
isr_no_err 35
isr_no_err 36
isr_no_err 37
isr_no_err 38
isr_no_err 39
isr_no_err 40
isr_no_err 41
isr_no_err 42
isr_no_err 43
isr_no_err 44
isr_no_err 45
isr_no_err 46
isr_no_err 47

isr_no_err 128

isr_common_stub:
    push gs
    push fs
    push es
    push ds
    pusha

    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax

    push esp
    call isr_dispatch
    add esp, 4

.global isr_return_common
isr_return_common:
    popa
    pop ds
    pop es
    pop fs
    pop gs
    add esp, 8
    iretd

.att_syntax
"#
);

extern "C" {
    pub fn isr0();
    pub fn isr1();
    pub fn isr2();
    pub fn isr3();
    pub fn isr4();
    pub fn isr5();
    pub fn isr6();
    pub fn isr7();
    pub fn isr8();
    pub fn isr9();
    pub fn isr10();
    pub fn isr11();
    pub fn isr12();
    pub fn isr13();
    pub fn isr14();
    pub fn isr15();
    pub fn isr16();
    pub fn isr17();
    pub fn isr18();
    pub fn isr19();
    pub fn isr20();
    pub fn isr21();
    pub fn isr22();
    pub fn isr23();
    pub fn isr24();
    pub fn isr25();
    pub fn isr26();
    pub fn isr27();
    pub fn isr28();
    pub fn isr29();
    pub fn isr30();
    pub fn isr31();
    pub fn isr32();
    pub fn isr33();
    pub fn isr34();
    pub fn isr35();
    pub fn isr36();
    pub fn isr37();
    pub fn isr38();
    pub fn isr39();
    pub fn isr40();
    pub fn isr41();
    pub fn isr42();
    pub fn isr43();
    pub fn isr44();
    pub fn isr45();
    pub fn isr46();
    pub fn isr47();
    pub fn isr128();
}

/// The addresses of every ISR stub, indexed by vector number, in the
/// order [`crate::init`] loads them into the IDT.
///
pub const STUBS: [(u8, unsafe extern "C" fn()); 49] = [
    (0, isr0),
    (1, isr1),
    (2, isr2),
    (3, isr3),
    (4, isr4),
    (5, isr5),
    (6, isr6),
    (7, isr7),
    (8, isr8),
    (9, isr9),
    (10, isr10),
    (11, isr11),
    (12, isr12),
    (13, isr13),
    (14, isr14),
    (15, isr15),
    (16, isr16),
    (17, isr17),
    (18, isr18),
    (19, isr19),
    (20, isr20),
    (21, isr21),
    (22, isr22),
    (23, isr23),
    (24, isr24),
    (25, isr25),
    (26, isr26),
    (27, isr27),
    (28, isr28),
    (29, isr29),
    (30, isr30),
    (31, isr31),
    (32, isr32),
    (33, isr33),
    (34, isr34),
    (35, isr35),
    (36, isr36),
    (37, isr37),
    (38, isr38),
    (39, isr39),
    (40, isr40),
    (41, isr41),
    (42, isr42),
    (43, isr43),
    (44, isr44),
    (45, isr45),
    (46, isr46),
    (47, isr47),
    (128, isr128),
];

#[no_mangle]
extern "C" fn isr_dispatch(frame: *mut InterruptFrame) {
    crate::dispatch(unsafe { &mut *frame });
}
