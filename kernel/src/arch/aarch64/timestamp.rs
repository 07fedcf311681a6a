use aarch64_cpu::registers::{Readable, Writeable, CNTFRQ_EL0, CNTVCT_EL0, CNTV_CTL_EL0, CNTV_TVAL_EL0};

use crate::config;

/// 计数器值换算为微秒
pub fn now_us() -> u64 {
    let freq = CNTFRQ_EL0.get().max(1) as u128;
    let count = CNTVCT_EL0.get() as u128;
    (count * 1_000_000 / freq) as u64
}

/// 装载下一次节拍并打开虚拟定时器
pub fn rearm_tick() {
    let interval = CNTFRQ_EL0.get() / config::TICK_HZ;
    CNTV_TVAL_EL0.set(interval.max(1));
    CNTV_CTL_EL0.write(CNTV_CTL_EL0::ENABLE::SET + CNTV_CTL_EL0::IMASK::CLEAR);
}
