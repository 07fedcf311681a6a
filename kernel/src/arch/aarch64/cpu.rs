use aarch64_cpu::registers::{Readable, Writeable};
use aarch64_cpu::{asm, registers};
use core::arch::asm as inline_asm;

/// 当前CPU ID（MPIDR_EL1.Aff0）
#[inline(always)]
pub fn try_id() -> Option<usize> {
    Some((registers::MPIDR_EL1.get() & 0xff) as usize)
}

#[inline(always)]
pub fn id() -> usize {
    (registers::MPIDR_EL1.get() & 0xff) as usize
}

/// 每个核同一时刻只执行一个执行流，核编号即可区分。
#[inline(always)]
pub fn execution_id() -> usize {
    (registers::MPIDR_EL1.get() & 0xff) as usize
}

/// 等待事件；`notify()` 的 SEV 或任何中断都会唤醒
#[inline(always)]
pub fn idle() {
    asm::wfe();
}

/// SEV 是广播的，目标核之外的核会多醒一次
#[inline(always)]
pub fn notify(_core: usize) {
    asm::barrier::dsb(asm::barrier::ISH);
    asm::sev();
}

#[inline(always)]
pub fn relax() {
    core::hint::spin_loop();
}

#[inline(always)]
pub fn enable_interrupts() {
    registers::DAIF.write(registers::DAIF::I::Unmasked);
}

/// 保存 DAIF 并屏蔽 IRQ，析构时恢复
pub struct IrqGuard {
    daif: u64,
}

impl IrqGuard {
    #[inline(always)]
    pub fn new() -> Self {
        let daif = registers::DAIF.get();
        unsafe { inline_asm!("msr daifset, #2", options(nostack, preserves_flags)) };
        Self { daif }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    #[inline(always)]
    fn drop(&mut self) {
        registers::DAIF.set(self.daif);
    }
}
