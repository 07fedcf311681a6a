//! PL011 串口输出

use core::ptr::{read_volatile, write_volatile};

use crate::config::UART_BASE;

const UART_DR: usize = 0x00;
const UART_FR: usize = 0x18;
const FR_TXFF: u32 = 1 << 5;

fn putc(byte: u8) {
    unsafe {
        let fr = (UART_BASE + UART_FR) as *const u32;
        while read_volatile(fr) & FR_TXFF != 0 {
            core::hint::spin_loop();
        }
        write_volatile((UART_BASE + UART_DR) as *mut u32, byte as u32);
    }
}

pub fn write_str(s: &str) {
    for byte in s.bytes() {
        if byte == b'\n' {
            putc(b'\r');
        }
        putc(byte);
    }
}
