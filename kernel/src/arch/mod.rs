//! 内核架构抽象层
//!
//! 运行时核心代码只通过本模块访问硬件：
//! - `cpu`：核编号、空闲等待与唤醒、中断屏蔽
//! - `context`：保存的寄存器现场与上下文切换
//! - `timestamp`：单调时钟
//! - `console`：日志使用的原始字符输出
//!
//! 裸机 aarch64 目标使用真实实现；所有宿主目标使用基于宿主线程的
//! 模拟实现，使运行时可以在宿主机上测试。

#[cfg(all(target_os = "none", not(target_arch = "aarch64")))]
compile_error!("bare-metal builds are only supported on aarch64");

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod aarch64;
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use aarch64 as imp;

#[cfg(not(target_os = "none"))]
mod hosted;
#[cfg(not(target_os = "none"))]
use hosted as imp;

/// 当前后端名称
pub const BACKEND: &str = imp::NAME;

/// 启动后端的核执行体。由 `sched::init()` 在调度表建立之后调用一次。
pub(crate) fn start() {
    imp::start();
}

/// 架构特定的CPU操作
pub mod cpu {
    use super::imp;

    /// 作用域内屏蔽本核中断，析构时恢复之前的屏蔽状态
    pub use imp::cpu::IrqGuard;

    /// 获取当前CPU ID；不在任何核上运行时返回 0
    #[inline(always)]
    pub fn id() -> usize {
        imp::cpu::id()
    }

    /// 获取当前CPU ID；调用者不属于任何核时返回 `None`
    #[inline(always)]
    pub fn try_id() -> Option<usize> {
        imp::cpu::try_id()
    }

    /// 在线核数量
    #[inline(always)]
    pub fn core_count() -> usize {
        crate::config::CORE_COUNT
    }

    /// 暂停当前核直到被唤醒或下一次中断
    #[inline(always)]
    pub fn idle() {
        imp::cpu::idle();
    }

    /// 唤醒处于 `idle()` 中的目标核
    #[inline(always)]
    pub fn notify(core: usize) {
        imp::cpu::notify(core);
    }

    /// 自旋等待中的退让
    #[inline(always)]
    pub fn relax() {
        imp::cpu::relax();
    }

    /// 使能中断
    #[inline(always)]
    pub fn enable_interrupts() {
        imp::cpu::enable_interrupts();
    }

    /// 当前执行流的唯一标识（用于识别定时器回调内部的调用）
    #[inline(always)]
    pub fn execution_id() -> usize {
        imp::cpu::execution_id()
    }
}

/// 架构特定的上下文切换
pub mod context {
    pub use super::imp::context::{exit_to, switch, Context};
}

/// 架构特定的时间戳
pub mod timestamp {
    use super::imp;

    /// 启动以来的微秒数
    #[inline(always)]
    pub fn now_us() -> u64 {
        imp::timestamp::now_us()
    }

    /// 重新装载本核的节拍定时器
    #[inline(always)]
    pub fn rearm_tick() {
        imp::timestamp::rearm_tick();
    }
}

/// 控制台输出
pub mod console {
    /// 输出字符串
    #[inline(always)]
    pub fn write_str(s: &str) {
        super::imp::console::write_str(s);
    }
}
