//! No-std test framework.
//!
//! `#[test_case]` functions are collected by the custom test runner and
//! reported over the serial console. On bare metal the run finishes by
//! exiting QEMU through the debug-exit device (x86-64) or PSCI
//! SYSTEM_OFF (AArch64); hosted runs return to the harness.

use core::panic::PanicInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Anything runnable by the test runner.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        crate::serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        crate::serial_println!("[ok]");
    }
}

/// Custom test runner wired up by `#![test_runner]`.
pub fn test_runner(tests: &[&dyn Testable]) {
    crate::serial_println!("Running {} tests", tests.len());
    for test in tests {
        test.run();
    }
    crate::serial_println!("All {} tests passed", tests.len());
    exit(QemuExitCode::Success);
}

/// Panic handler used by bare-metal test builds.
pub fn test_panic_handler(info: &PanicInfo) -> ! {
    crate::serial_println!("[failed]");
    crate::serial_println!("Error: {}", info);
    exit(QemuExitCode::Failed);
    // Unreachable on bare metal; keep the signature honest elsewhere.
    loop {
        core::hint::spin_loop();
    }
}

/// Leave the test environment.
pub fn exit(code: QemuExitCode) {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    {
        // SAFETY: Port 0xF4 is QEMU's isa-debug-exit device; writing the
        // code terminates the VM.
        unsafe {
            x86_64::instructions::port::Port::new(0xF4).write(code as u32);
        }
    }
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    {
        // PSCI SYSTEM_OFF via HVC; QEMU terminates the machine.
        const PSCI_SYSTEM_OFF: u64 = 0x8400_0008;
        let _ = code;
        // SAFETY: Standard PSCI call; does not return.
        unsafe {
            core::arch::asm!(
                "mov x0, {call}",
                "hvc #0",
                call = in(reg) PSCI_SYSTEM_OFF,
                options(nostack),
            );
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        if code == QemuExitCode::Failed {
            std::process::exit(1);
        }
    }
}
