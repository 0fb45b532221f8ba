//! x86_64 context switching implementation
//!
//! Uses inline assembly for the voluntary switch.

use std::arch::naked_asm;

/// Callee-saved register block for a suspended fiber.
///
/// Field order is load-bearing: the switch assembly addresses these
/// by fixed offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fiber's register block so the first switch into it
/// enters `entry_fn(entry_arg)` on the given stack.
///
/// # Safety
///
/// `regs` must point to valid SavedRegs memory. `stack_top` must be
/// the high end of a live stack allocation.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // Stack must be 16-byte aligned per System V AMD64 ABI.
    let sp = stack_top as usize;

    // Align to 16 bytes, then subtract 8 for the "call" alignment.
    let aligned_sp = (sp & !0xF) - 8;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64; // Entry function
    regs.r13 = entry_arg as u64; // Entry argument
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First-switch trampoline: calls the entry function with its argument.
///
/// The entry function transfers control back to its resumer and never
/// returns; reaching the instruction after the call is fatal.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Perform a voluntary context switch.
///
/// Saves callee-saved registers to `from` and loads from `to`.
/// Returns (into the restored context) when something later switches
/// back to `from`.
///
/// # Safety
///
/// Both pointers must reference valid SavedRegs; `to` must describe a
/// suspended context whose stack is still live.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_from: *mut SavedRegs, _to: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to from (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from to (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
