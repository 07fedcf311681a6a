//! AArch64 裸机后端
//!
//! 使用aarch64-cpu访问系统寄存器：
//! - MPIDR_EL1 提供核编号
//! - CNTVCT_EL0 / CNTFRQ_EL0 提供单调时钟
//! - CNTV_TVAL_EL0 / CNTV_CTL_EL0 提供节拍中断
//!
//! 多核启动、异常向量和中断控制器由引导层负责：引导层在启动核上调用
//! `sc_kernel::init()`，随后在每个核上调用 `sc_kernel::sched::run_core()`，
//! 并在每个核的节拍中断应答之后调用 `sc_kernel::sched::tick()`。

pub mod console;
pub mod context;
pub mod cpu;
pub mod timestamp;

pub const NAME: &str = "aarch64";

/// 每个核由引导层进入调度循环，这里无需额外动作。
pub fn start() {
    timestamp::rearm_tick();
}
