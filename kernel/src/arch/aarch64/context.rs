//! 上下文切换
//!
//! 只保存 AAPCS64 被调用者保存寄存器：x19-x30、sp、d8-d15。
//! 调用者保存寄存器已由编译器在调用 `switch` 之前处理。

use core::arch::global_asm;

use crate::error::Result;

#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    /// x19..x30，x30 即返回地址
    regs: [u64; 12],
    sp: u64,
    fp: [u64; 8],
}

const X19: usize = 0;
const X29: usize = 10;
const X30: usize = 11;

extern "C" {
    fn __sc_context_switch(from: *mut Context, to: *const Context);
    fn __sc_context_load(to: *const Context) -> !;
    fn __sc_context_start();
}

global_asm!(
    ".section .text",
    ".global __sc_context_switch",
    "__sc_context_switch:",
    "    stp x19, x20, [x0, #0]",
    "    stp x21, x22, [x0, #16]",
    "    stp x23, x24, [x0, #32]",
    "    stp x25, x26, [x0, #48]",
    "    stp x27, x28, [x0, #64]",
    "    stp x29, x30, [x0, #80]",
    "    mov x9, sp",
    "    str x9, [x0, #96]",
    "    stp d8, d9, [x0, #104]",
    "    stp d10, d11, [x0, #120]",
    "    stp d12, d13, [x0, #136]",
    "    stp d14, d15, [x0, #152]",
    "    mov x0, x1",
    ".global __sc_context_load",
    "__sc_context_load:",
    "    ldp x19, x20, [x0, #0]",
    "    ldp x21, x22, [x0, #16]",
    "    ldp x23, x24, [x0, #32]",
    "    ldp x25, x26, [x0, #48]",
    "    ldp x27, x28, [x0, #64]",
    "    ldp x29, x30, [x0, #80]",
    "    ldr x9, [x0, #96]",
    "    mov sp, x9",
    "    ldp d8, d9, [x0, #104]",
    "    ldp d10, d11, [x0, #120]",
    "    ldp d12, d13, [x0, #136]",
    "    ldp d14, d15, [x0, #152]",
    "    ret",
    ".global __sc_context_start",
    "__sc_context_start:",
    "    mov x0, x19",
    "    bl {entry}",
    "    brk #0",
    entry = sym context_entry,
);

extern "C" fn context_entry(entry: usize) -> ! {
    // 由 Context::new 写入的 fn() -> ! 指针
    let entry: fn() -> ! = unsafe { core::mem::transmute(entry) };
    entry()
}

impl Context {
    /// 核自身调度循环的现场，第一次切出时填充
    pub fn empty() -> Self {
        Self::default()
    }

    /// 构造首次切入时在 `stack_top` 上调用 `entry` 的现场
    pub fn new(stack_top: usize, entry: fn() -> !) -> Result<Self> {
        let mut ctx = Self::default();
        ctx.regs[X19] = entry as usize as u64;
        ctx.regs[X29] = 0;
        ctx.regs[X30] = __sc_context_start as usize as u64;
        ctx.sp = (stack_top & !0xf) as u64;
        Ok(ctx)
    }
}

/// 保存当前现场到 `from` 并切换到 `to`
///
/// # Safety
/// 两个指针在调用者恢复之前必须保持有效，`to` 不能正在任何核上运行。
#[inline(always)]
pub unsafe fn switch(from: *mut Context, to: *const Context) {
    __sc_context_switch(from, to);
}

/// 切换到 `to`，不保存当前现场
///
/// # Safety
/// 同 [`switch`]；当前现场此后不得再被切入。
#[inline(always)]
pub unsafe fn exit_to(to: *const Context) -> ! {
    __sc_context_load(to)
}
