//! Kernel log output.
//!
//! Bare-metal builds write to the COM1 UART. Hosted builds keep the most
//! recent lines in an in-memory ring so tests and tools can inspect them.

use lazy_static::lazy_static;
use spin::Mutex;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod uart {
    use x86_64::instructions::port::Port;

    pub struct SerialPort {
        data: Port<u8>,
        int_en: Port<u8>,
        fifo_ctrl: Port<u8>,
        line_ctrl: Port<u8>,
        modem_ctrl: Port<u8>,
        line_sts: Port<u8>,
    }

    impl SerialPort {
        pub const unsafe fn new(base: u16) -> SerialPort {
            SerialPort {
                data: Port::new(base),
                int_en: Port::new(base + 1),
                fifo_ctrl: Port::new(base + 2),
                line_ctrl: Port::new(base + 3),
                modem_ctrl: Port::new(base + 4),
                line_sts: Port::new(base + 5),
            }
        }

        pub fn init(&mut self) {
            unsafe {
                self.int_en.write(0x00);
                self.line_ctrl.write(0x80);
                self.data.write(0x03);
                self.int_en.write(0x00);
                self.line_ctrl.write(0x03);
                self.fifo_ctrl.write(0xC7);
                self.modem_ctrl.write(0x0B);
            }
        }

        fn send(&mut self, byte: u8) {
            unsafe {
                while (self.line_sts.read() & 0x20) == 0 {}
                self.data.write(byte);
            }
        }
    }

    impl core::fmt::Write for SerialPort {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for byte in s.bytes() {
                self.send(byte);
            }
            Ok(())
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
lazy_static! {
    pub static ref SERIAL1: Mutex<uart::SerialPort> = {
        let mut serial_port = unsafe { uart::SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = SERIAL1.lock().write_fmt(args);
}

// ──────────────────────────────────────────────────────────────
//  Hosted sink
// ──────────────────────────────────────────────────────────────

/// Lines kept by the hosted sink before the oldest are dropped.
pub const LOG_CAPACITY: usize = 256;

pub struct LogBuffer {
    lines: alloc::collections::VecDeque<alloc::string::String>,
    partial: alloc::string::String,
}

impl LogBuffer {
    pub const fn new() -> Self {
        LogBuffer {
            lines: alloc::collections::VecDeque::new(),
            partial: alloc::string::String::new(),
        }
    }

    fn push_line(&mut self) {
        if self.lines.len() == LOG_CAPACITY {
            self.lines.pop_front();
        }
        let line = core::mem::take(&mut self.partial);
        self.lines.push_back(line);
    }

    pub fn drain(&mut self) -> alloc::vec::Vec<alloc::string::String> {
        self.lines.drain(..).collect()
    }
}

impl core::fmt::Write for LogBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for ch in s.chars() {
            if ch == '\n' {
                self.push_line();
            } else {
                self.partial.push(ch);
            }
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref LOG: Mutex<LogBuffer> = Mutex::new(LogBuffer::new());
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = LOG.lock().write_fmt(args);
}

/// Take every complete line logged so far.
pub fn drain() -> alloc::vec::Vec<alloc::string::String> {
    LOG.lock().drain()
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("[INFO] {}\n", format_args!($($arg)*)))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("[WARN] {}\n", format_args!($($arg)*)))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!("[ERROR] {}\n", format_args!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    #[test]
    fn buffer_splits_lines_and_drops_oldest() {
        let mut buf = LogBuffer::new();
        for i in 0..LOG_CAPACITY + 3 {
            writeln!(buf, "line {}", i).unwrap();
        }
        write!(buf, "unterminated").unwrap();
        let lines = buf.drain();
        assert_eq!(lines.len(), LOG_CAPACITY);
        assert_eq!(lines[0], "line 3");
        assert_eq!(lines.last().map(|s| s.as_str()), Some("line 258"));
    }
}
