//! Hosted backend
//!
//! Every core is a host thread running the scheduler loop. Every runtime
//! thread is a host thread too, but only the one holding its core's baton
//! executes, so each core still runs exactly one context at a time. A
//! separate host thread plays the role of the periodic tick interrupt and
//! drives the global timer engine. There is no preemption between threads
//! of the same core.

pub mod console;
pub mod context;
pub mod cpu;
pub mod timestamp;

use std::format;
use std::time::Duration;

use crate::config;

pub const NAME: &str = "hosted";

pub fn start() {
    timestamp::now_us();

    for core in 0..config::CORE_COUNT {
        std::thread::Builder::new()
            .name(format!("sc-cpu{}", core))
            .spawn(move || {
                cpu::set_core(Some(core));
                crate::sched::run_core()
            })
            .expect("failed to start host thread for core");
    }

    std::thread::Builder::new()
        .name("sc-tick".into())
        .spawn(|| loop {
            std::thread::sleep(Duration::from_micros(config::TICK_US));
            crate::time::timer::tick();
        })
        .expect("failed to start tick thread");
}
