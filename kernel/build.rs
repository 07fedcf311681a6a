// build.rs
use std::env;
use std::fs;
use std::path::PathBuf;
use toml::Value;

const DEFAULT_BOARD: &str = "qemu-virt";
const MAX_CORES: i64 = 8;

fn main() {
    let board = env::var("BOARD").unwrap_or_else(|_| DEFAULT_BOARD.to_string());
    let config = load_board_config(&board);

    generate_kernel_config(&config);

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=BOARD");
    println!("cargo:rerun-if-changed=../configs/board/{}.toml", board);
}

/// Reads `configs/board/<board>.toml`, falling back to defaults for anything missing.
fn load_board_config(board: &str) -> Config {
    let mut config = Config {
        board: board.to_string(),
        ..Config::default()
    };

    let path = format!("../configs/board/{}.toml", board);
    let value = match fs::read_to_string(&path).ok().and_then(|s| toml::from_str::<Value>(&s).ok()) {
        Some(value) => value,
        None => {
            println!("cargo:warning=board config {} not found, using defaults", path);
            return config;
        }
    };

    if let Some(name) = value.get("board").and_then(|b| b.get("name")).and_then(Value::as_str) {
        config.board = name.to_string();
    }

    if let Some(cores) = value.get("cpu").and_then(|c| c.get("cores")).and_then(Value::as_integer) {
        config.cores = cores.clamp(1, MAX_CORES) as u64;
    }

    if let Some(sched) = value.get("sched") {
        if let Some(size) = sched.get("stack_size").and_then(Value::as_integer) {
            config.stack_size = size.max(4096) as u64;
        }
        if let Some(slice) = sched.get("time_slice_ticks").and_then(Value::as_integer) {
            config.time_slice_ticks = slice.max(1) as u64;
        }
    }

    if let Some(hz) = value
        .get("timer")
        .and_then(|t| t.get("tick_hz"))
        .and_then(Value::as_integer)
    {
        config.tick_hz = hz.clamp(1, 1_000_000) as u64;
    }

    if let Some(base) = value
        .get("console")
        .and_then(|c| c.get("uart_base"))
        .and_then(Value::as_str)
    {
        config.uart_base = parse_hex(base);
    }

    config
}

fn generate_kernel_config(config: &Config) {
    let out_dir = env::var("OUT_DIR").unwrap();
    let config_rs = format!(
        r#"
        pub const BOARD: &str = {:?};
        pub const CORE_COUNT: usize = {};
        pub const STACK_SIZE: usize = {};
        pub const TIME_SLICE_TICKS: u64 = {};
        pub const TICK_HZ: u64 = {};
        pub const UART_BASE: usize = 0x{:x};
    "#,
        config.board,
        config.cores,
        config.stack_size,
        config.time_slice_ticks,
        config.tick_hz,
        config.uart_base
    );

    let config_path = PathBuf::from(out_dir).join("config.rs");
    fs::write(config_path, config_rs).unwrap();
}

fn parse_hex(hex_str: &str) -> u64 {
    let trimmed = hex_str.trim().trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).unwrap_or(0)
}

struct Config {
    board: String,
    cores: u64,
    stack_size: u64,
    time_slice_ticks: u64,
    tick_hz: u64,
    uart_base: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            board: DEFAULT_BOARD.to_string(),
            cores: 4,
            stack_size: 16 * 1024,
            time_slice_ticks: 10,
            tick_hz: 1000,
            uart_base: 0x0900_0000,
        }
    }
}
