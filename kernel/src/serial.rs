//! Kernel console: the registered character sink behind printk.
//!
//! 115200-8N1 on the platform's primary UART (16550 at COM1 on x86-64,
//! PL011 on the ARM virt machine). Newlines go out as CRLF. All output is
//! synchronous; the console lock is taken with IRQ save so logging from
//! interrupt handlers cannot deadlock against task-context logging.

use core::fmt;

use crate::sync::SpinLock;

struct Console {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    port: uart_16550::SerialPort,
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    uart: crate::arch::aarch64::serial::Pl011,
}

impl Console {
    fn new() -> Self {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            Self {
                port: crate::arch::x86_64::serial::console(),
            }
        }
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        {
            let uart = crate::arch::aarch64::serial::Pl011::new();
            uart.init();
            Self { uart }
        }
        #[cfg(not(target_os = "none"))]
        {
            Self {}
        }
    }

    fn put(&mut self, byte: u8) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        self.port.send_raw(byte);
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        self.uart.write_byte(byte);
        #[cfg(not(target_os = "none"))]
        let _ = byte;
    }

    fn write_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            self.put(b'\r');
        }
        self.put(byte);
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

static CONSOLE: SpinLock<Option<Console>> = SpinLock::new(None);

/// Bring up the UART. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let mut console = CONSOLE.lock_irqsave();
    if console.is_none() {
        *console = Some(Console::new());
    }
}

/// Write formatted text to the console, initializing it on first use.
#[doc(hidden)]
pub fn _write(args: fmt::Arguments) {
    use fmt::Write;
    let mut console = CONSOLE.lock_irqsave();
    if console.is_none() {
        *console = Some(Console::new());
    }
    if let Some(c) = console.as_mut() {
        // Writes to the UART cannot fail; the Result is fmt plumbing.
        let _ = c.write_fmt(args);
    }
}

/// Write raw bytes to the console (panic path, ring dump).
pub fn write_bytes(bytes: &[u8]) {
    let mut console = CONSOLE.lock_irqsave();
    if console.is_none() {
        *console = Some(Console::new());
    }
    if let Some(c) = console.as_mut() {
        for &b in bytes {
            c.write_byte(b);
        }
    }
}
