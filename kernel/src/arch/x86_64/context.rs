//! x86-64 context save/restore.
//!
//! The switch is cooperative-style: it stores the callee-visible register
//! state (callee-saved GPRs, RSP, RIP, RFLAGS) of the caller into `out`,
//! then resumes `in` at its saved RIP. Returning from `context_switch`
//! means some other context switched back into us. Register offsets in the
//! assembly are pinned to the struct layout by the asserts below.

use core::arch::global_asm;
use core::mem::offset_of;

/// Saved CPU context of a suspended task.
///
/// Caller-saved registers do not appear: the switch is a function call, so
/// the compiler already treats them as clobbered at every call site.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Stack pointer at the instruction after the switch call.
    pub rsp: u64,
    /// Resume address.
    pub rip: u64,
    /// RFLAGS image; IF decides whether the context runs with IRQs masked.
    pub rflags: u64,
}

const _: () = {
    assert!(offset_of!(Context, rbx) == 0x00);
    assert!(offset_of!(Context, rbp) == 0x08);
    assert!(offset_of!(Context, r12) == 0x10);
    assert!(offset_of!(Context, r13) == 0x18);
    assert!(offset_of!(Context, r14) == 0x20);
    assert!(offset_of!(Context, r15) == 0x28);
    assert!(offset_of!(Context, rsp) == 0x30);
    assert!(offset_of!(Context, rip) == 0x38);
    assert!(offset_of!(Context, rflags) == 0x40);
};

impl Context {
    /// An all-zero context; only meaningful after [`context_init`].
    pub const fn zeroed() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
        }
    }
}

/// RFLAGS image for a fresh kernel task: reserved bit 1 set, IF clear
/// (kernel mode, IRQs masked until the task's entry shim enables them).
const INITIAL_RFLAGS: u64 = 0x0002;

global_asm!(
    r#"
.global basalt_context_switch
basalt_context_switch:
    mov [rdi + 0x00], rbx
    mov [rdi + 0x08], rbp
    mov [rdi + 0x10], r12
    mov [rdi + 0x18], r13
    mov [rdi + 0x20], r14
    mov [rdi + 0x28], r15
    lea rax, [rsp + 8]
    mov [rdi + 0x30], rax
    mov rax, [rsp]
    mov [rdi + 0x38], rax
    pushfq
    pop rax
    mov [rdi + 0x40], rax

    mov rsp, [rsi + 0x30]
    push qword ptr [rsi + 0x40]
    popfq
    mov rbx, [rsi + 0x00]
    mov rbp, [rsi + 0x08]
    mov r12, [rsi + 0x10]
    mov r13, [rsi + 0x18]
    mov r14, [rsi + 0x20]
    mov r15, [rsi + 0x28]
    jmp qword ptr [rsi + 0x38]

.global basalt_task_entry
basalt_task_entry:
    mov rdi, r12
    call r13
    call basalt_task_exit
    ud2
"#
);

extern "C" {
    fn basalt_context_switch(out: *mut Context, input: *const Context);
    /// First-instruction thunk of every fresh task: moves the stashed
    /// argument into RDI and calls the stashed entry point.
    fn basalt_task_entry();
}

/// Switch from the current context to `input`, saving into `out`.
///
/// # Safety
/// Both contexts must be fully initialized, `input` must not be the running
/// context, and no spinlock may be held across the call. Callers mask IRQs
/// for the duration (the scheduler's IRQ-save lock discipline ensures this)
/// so the window between saving and loading register state cannot be
/// interrupted with an ambiguous stack pointer.
#[inline]
pub unsafe fn context_switch(out: &mut Context, input: &Context) {
    // SAFETY: Contract forwarded to the caller; the asm only touches the
    // two context records and the stacks they designate.
    unsafe { basalt_context_switch(out, input) }
}

/// Prepare `ctx` so that switching into it enters `entry(arg)` on the given
/// stack in kernel mode with IRQs masked.
///
/// `stack_top` is the exclusive upper bound of the stack region; it is
/// aligned down to 16 bytes per the SysV ABI before use.
pub fn context_init(ctx: &mut Context, entry: extern "C" fn(usize), stack_top: usize, arg: usize) {
    *ctx = Context::zeroed();
    ctx.rsp = (stack_top & !0xF) as u64;
    ctx.rip = basalt_task_entry as usize as u64;
    ctx.r12 = arg as u64;
    ctx.r13 = entry as usize as u64;
    ctx.rflags = INITIAL_RFLAGS;
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;

    // Two contexts ping-pong on a heap stack, the task side incrementing a
    // counter on every switch-in. After N round trips the counter must
    // equal N. This runs in user space too: the switch touches only general
    // registers, RFLAGS, and the stacks.
    #[repr(C)]
    struct PingPong {
        main: Context,
        task: Context,
        count: u64,
    }

    extern "C" fn pong_task(pp: usize) {
        let pp = pp as *mut PingPong;
        loop {
            // SAFETY: The test leaked the PingPong record; the main side
            // only touches it while this context is suspended.
            unsafe {
                (*pp).count += 1;
                context_switch(&mut (*pp).task, &(*pp).main);
            }
        }
    }

    #[test_case]
    fn switch_round_trips() {
        const ROUNDS: u64 = 64;
        let stack = alloc::vec![0u8; 32 * 1024].leak();
        let stack_top = stack.as_ptr() as usize + stack.len();

        let pp = Box::into_raw(Box::new(PingPong {
            main: Context::zeroed(),
            task: Context::zeroed(),
            count: 0,
        }));
        // SAFETY: pp is valid; the two contexts alternate strictly, so the
        // record is never touched by both sides at once.
        unsafe {
            context_init(&mut (*pp).task, pong_task, stack_top, pp as usize);
            for round in 1..=ROUNDS {
                context_switch(&mut (*pp).main, &(*pp).task);
                assert_eq!((*pp).count, round);
            }
            drop(Box::from_raw(pp));
        }
    }
}
