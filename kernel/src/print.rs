//! Printk: formatted kernel output with severity routing.
//!
//! `kprint!`/`kprintln!` write through the console sink; the [`log`] facade
//! provides the severity surface (`log::info!` and friends) and lands in
//! the same sink with a level prefix. Everything also lands in a small
//! ring buffer holding the most recent output so the panic path can re-emit
//! context even if earlier lines scrolled away on the wire.

use core::fmt;

use crate::sync::SpinLock;

/// Bytes of recent log output retained for the panic dump.
const RING_SIZE: usize = 16 * 1024;

struct LogRing {
    buf: [u8; RING_SIZE],
    /// Next write position.
    head: usize,
    /// Number of valid bytes (saturates at RING_SIZE).
    len: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            buf: [0; RING_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.buf[self.head] = b;
            self.head = (self.head + 1) % RING_SIZE;
            if self.len < RING_SIZE {
                self.len += 1;
            }
        }
    }

    /// Call `f` over the buffered bytes in write order.
    fn with_contents(&self, mut f: impl FnMut(&[u8])) {
        if self.len < RING_SIZE {
            f(&self.buf[..self.len]);
        } else {
            f(&self.buf[self.head..]);
            f(&self.buf[..self.head]);
        }
    }
}

static RING: SpinLock<LogRing> = SpinLock::new(LogRing::new());

struct RingWriter;

impl fmt::Write for RingWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        RING.lock_irqsave().push(s.as_bytes());
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = RingWriter.write_fmt(args);
    crate::serial::_write(args);
}

/// Re-emit the retained ring contents to the console. Used by panic.
pub fn dump_ring() {
    // Ring and console locks are distinct and always taken in this order,
    // so holding the ring across the emit cannot deadlock.
    let ring = RING.lock_irqsave();
    ring.with_contents(|part| crate::serial::write_bytes(part));
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

// Serial aliases used by the test framework and integration tests.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

// ---------------------------------------------------------------------------
// log facade
// ---------------------------------------------------------------------------

struct KernelLog;

static LOGGER: KernelLog = KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        _print(format_args!(
            "[{:>5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Register the kernel logger with the `log` facade. Runs once, before the
/// first subsystem that logs.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

/// Raise or lower the global severity floor.
pub fn set_level(level: log::LevelFilter) {
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ring_wraps_and_preserves_order() {
        let mut ring = LogRing::new();
        ring.push(b"abc");
        let mut collected = alloc::vec::Vec::new();
        ring.with_contents(|part| collected.extend_from_slice(part));
        assert_eq!(collected, b"abc");

        // Fill past capacity; the oldest bytes fall off the front.
        let big = alloc::vec![b'x'; RING_SIZE - 1];
        ring.push(&big);
        ring.push(b"tail");
        let mut collected = alloc::vec::Vec::new();
        ring.with_contents(|part| collected.extend_from_slice(part));
        assert_eq!(collected.len(), RING_SIZE);
        assert!(collected.ends_with(b"tail"));
    }
}
