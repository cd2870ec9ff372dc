//! x86_64 System V context routines.
//!
//! Callee-saved state under the SysV ABI: rbx, rbp, r12-r15, plus the
//! mxcsr and x87 control words. The saved ip is the return address of the
//! call, and the saved sp is the caller's stack pointer after that return,
//! so a restore behaves as a second return from the same call.

use super::Jmpbuf;
use core::arch::naked_asm;

#[unsafe(naked)]
pub unsafe extern "C" fn ctx_save(buf: *mut Jmpbuf) -> usize {
    naked_asm!(
        "mov r8, [rsp]",
        "lea r9, [rsp + 8]",
        "mov [rdi + 0], r8",
        "mov [rdi + 8], r9",
        "mov [rdi + 16], rbx",
        "mov [rdi + 24], rbp",
        "mov [rdi + 32], r12",
        "mov [rdi + 40], r13",
        "mov [rdi + 48], r14",
        "mov [rdi + 56], r15",
        "stmxcsr [rdi + 64]",
        "fnstcw [rdi + 68]",
        "mov eax, 1",
        "ret",
    )
}

#[unsafe(naked)]
pub unsafe extern "C" fn ctx_restore(buf: *mut Jmpbuf) -> ! {
    naked_asm!(
        "ldmxcsr [rdi + 64]",
        "fldcw [rdi + 68]",
        "mov rbx, [rdi + 16]",
        "mov rbp, [rdi + 24]",
        "mov r12, [rdi + 32]",
        "mov r13, [rdi + 40]",
        "mov r14, [rdi + 48]",
        "mov r15, [rdi + 56]",
        "mov rsp, [rdi + 8]",
        "xor eax, eax",
        "jmp qword ptr [rdi + 0]",
    )
}

#[unsafe(naked)]
pub unsafe extern "C" fn ctx_enter(
    base: *mut u8,
    landing: *mut Jmpbuf,
    start: super::StackStartFn,
    arg: *mut u8,
) -> usize {
    naked_asm!(
        // Save the caller's context into `landing`, exactly as ctx_save
        // would at this call site.
        "mov r8, [rsp]",
        "lea r9, [rsp + 8]",
        "mov [rsi + 0], r8",
        "mov [rsi + 8], r9",
        "mov [rsi + 16], rbx",
        "mov [rsi + 24], rbp",
        "mov [rsi + 32], r12",
        "mov [rsi + 40], r13",
        "mov [rsi + 48], r14",
        "mov [rsi + 56], r15",
        "stmxcsr [rsi + 64]",
        "fnstcw [rsi + 68]",
        // Switch to the fresh stack. A zero rbp and a zero return address
        // terminate the frame chain for unwinders and profilers; after the
        // push the stack has the alignment of a just-called function.
        "and rdi, -16",
        "mov rsp, rdi",
        "xor ebp, ebp",
        "mov rdi, rcx",
        "push rbp",
        "jmp rdx",
    )
}
