use std::sync::OnceLock;
use std::time::Instant;

static BOOT: OnceLock<Instant> = OnceLock::new();

pub fn now_us() -> u64 {
    let micros = BOOT.get_or_init(Instant::now).elapsed().as_micros();
    micros.min(u64::MAX as u128) as u64
}

/// The tick thread sleeps on its own; nothing to reload.
pub fn rearm_tick() {}
