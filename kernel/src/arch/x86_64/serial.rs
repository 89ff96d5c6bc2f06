//! 16550 UART on COM1, the x86 log sink.

use uart_16550::SerialPort;

/// COM1 base port.
const COM1: u16 = 0x3F8;

/// Create and initialize the COM1 port (115200-8N1 is the 16550 default
/// rate programmed by `init`).
pub fn console() -> SerialPort {
    // SAFETY: COM1 at 0x3F8 is the platform's primary UART; constructing
    // two handles is harmless because writes are byte-wise and the caller
    // serializes through the console lock.
    let mut port = unsafe { SerialPort::new(COM1) };
    port.init();
    port
}
