//! 内核控制台模块
//!
//! 串行化所有控制台输出，并作为 `log` 门面的后端：
//! 每条记录输出为 `[LEVEL] cpuN <module> => message`。

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};

use crate::arch;
use crate::sync::Spinlock;

/// 控制台管理器
pub struct ConsoleManager {
    /// 控制台锁；中断上下文也会打日志，所以总是 irqsave
    console_lock: Spinlock<()>,
}

static CONSOLE_MANAGER: ConsoleManager = ConsoleManager::new();

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        arch::console::write_str(s);
        Ok(())
    }
}

impl ConsoleManager {
    pub const fn new() -> Self {
        Self {
            console_lock: Spinlock::new(()),
        }
    }

    /// 写入格式化参数
    pub fn write(&self, args: fmt::Arguments) {
        let _lock = self.console_lock.lock_irqsave();
        let _ = ConsoleWriter.write_fmt(args);
    }

    /// 写入一条日志记录
    pub fn log(&self, record: &Record) {
        let _lock = self.console_lock.lock_irqsave();
        let _ = format_record(&mut ConsoleWriter, record, arch::cpu::id());
    }
}

impl Default for ConsoleManager {
    fn default() -> Self {
        Self::new()
    }
}

fn format_record<W: Write>(out: &mut W, record: &Record, cpu: usize) -> fmt::Result {
    writeln!(
        out,
        "[{}] cpu{} <{}> => {}",
        record.level(),
        cpu,
        record.module_path().unwrap_or("?"),
        record.args()
    )
}

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            CONSOLE_MANAGER.log(record);
        }
    }

    fn flush(&self) {}
}

/// 安装日志后端并设置级别；重复调用保持第一次的设置
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// 直接写控制台，不经过日志级别过滤
pub fn write(args: fmt::Arguments) {
    CONSOLE_MANAGER.write(args);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;

    #[test]
    fn test_record_format() {
        let mut out = String::new();
        format_record(
            &mut out,
            &Record::builder()
                .args(format_args!("hello {}", 42))
                .level(log::Level::Warn)
                .module_path(Some("sc_kernel::sched"))
                .build(),
            2,
        )
        .unwrap();
        assert_eq!(out, "[WARN] cpu2 <sc_kernel::sched> => hello 42\n");
    }

    #[test]
    fn test_init_is_idempotent() {
        init(LevelFilter::Info);
        init(LevelFilter::Trace);
        assert!(log::max_level() <= LevelFilter::Info);
        write(format_args!(""));
    }
}
