//! AArch64 context save/restore.
//!
//! Mirrors the x86-64 module: the switch stores the callee-visible state
//! (x19..x28, frame pointer, SP, resume PC, NZCV+DAIF image) into `out`
//! and resumes `in` at its saved PC. Offsets in the assembly are pinned to
//! the struct layout by the asserts below.

use core::arch::global_asm;
use core::mem::offset_of;

/// Saved CPU context of a suspended task.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    /// Callee-saved x19..x28.
    pub x: [u64; 10],
    /// Frame pointer (x29).
    pub fp: u64,
    /// Stack pointer.
    pub sp: u64,
    /// Resume address.
    pub pc: u64,
    /// NZCV | DAIF image; DAIF decides whether the context runs with IRQs
    /// masked.
    pub pstate: u64,
}

const _: () = {
    assert!(offset_of!(Context, x) == 0x00);
    assert!(offset_of!(Context, fp) == 0x50);
    assert!(offset_of!(Context, sp) == 0x58);
    assert!(offset_of!(Context, pc) == 0x60);
    assert!(offset_of!(Context, pstate) == 0x68);
};

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 10],
            fp: 0,
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }
}

/// PSTATE image for a fresh kernel task: DAIF fully masked (kernel mode,
/// IRQs masked until the task's entry shim enables them), flags clear.
const INITIAL_PSTATE: u64 = 0x3C0;

global_asm!(
    r#"
.global basalt_context_switch
basalt_context_switch:
    stp x19, x20, [x0, #0x00]
    stp x21, x22, [x0, #0x10]
    stp x23, x24, [x0, #0x20]
    stp x25, x26, [x0, #0x30]
    stp x27, x28, [x0, #0x40]
    str x29, [x0, #0x50]
    mov x9, sp
    str x9, [x0, #0x58]
    str x30, [x0, #0x60]
    mrs x9, nzcv
    mrs x10, daif
    orr x9, x9, x10
    str x9, [x0, #0x68]

    ldr x9, [x1, #0x68]
    msr nzcv, x9
    msr daif, x9
    ldp x19, x20, [x1, #0x00]
    ldp x21, x22, [x1, #0x10]
    ldp x23, x24, [x1, #0x20]
    ldp x25, x26, [x1, #0x30]
    ldp x27, x28, [x1, #0x40]
    ldr x29, [x1, #0x50]
    ldr x9, [x1, #0x58]
    mov sp, x9
    ldr x30, [x1, #0x60]
    ret

.global basalt_task_entry
basalt_task_entry:
    mov x0, x20
    blr x19
    bl basalt_task_exit
    b .
"#
);

extern "C" {
    fn basalt_context_switch(out: *mut Context, input: *const Context);
    /// First-instruction thunk of every fresh task: moves the stashed
    /// argument into x0 and calls the stashed entry point.
    fn basalt_task_entry();
}

/// Switch from the current context to `input`, saving into `out`.
///
/// # Safety
/// Same contract as the x86-64 twin: both contexts initialized, `input`
/// not currently running, no spinlock held across the call, IRQs masked
/// for the duration by the caller's lock discipline.
#[inline]
pub unsafe fn context_switch(out: &mut Context, input: &Context) {
    // SAFETY: Contract forwarded to the caller.
    unsafe { basalt_context_switch(out, input) }
}

/// Prepare `ctx` so that switching into it enters `entry(arg)` on the given
/// stack in kernel mode with IRQs masked. `stack_top` is aligned down to
/// 16 bytes per the AAPCS64.
pub fn context_init(ctx: &mut Context, entry: extern "C" fn(usize), stack_top: usize, arg: usize) {
    *ctx = Context::zeroed();
    ctx.sp = (stack_top & !0xF) as u64;
    ctx.pc = basalt_task_entry as usize as u64;
    ctx.x[0] = entry as usize as u64; // x19
    ctx.x[1] = arg as u64; // x20
    ctx.pstate = INITIAL_PSTATE;
}
