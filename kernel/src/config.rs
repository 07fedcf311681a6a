//! Board configuration
//!
//! The constants below are generated by `build.rs` from
//! `configs/board/<BOARD>.toml` (default board: `qemu-virt`).

include!(concat!(env!("OUT_DIR"), "/config.rs"));

/// Capacity of every per-core table in the runtime.
pub const MAX_CORES: usize = 8;

const _: () = assert!(CORE_COUNT >= 1 && CORE_COUNT <= MAX_CORES);

/// Length of one scheduler tick in microseconds.
pub const TICK_US: u64 = 1_000_000 / TICK_HZ;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_config_is_sane() {
        assert!(CORE_COUNT >= 1 && CORE_COUNT <= MAX_CORES);
        assert!(STACK_SIZE >= 4096);
        assert!(TIME_SLICE_TICKS >= 1);
        assert!(TICK_US >= 1);
        assert!(!BOARD.is_empty());
    }
}
