//! Local APIC and I/O APIC interrupt controllers.
//!
//! Initialization masks the legacy 8259 pair off entirely (0xFF to both
//! data ports, via `pic8259`), enables the local APIC through the spurious
//! vector register, and programs the I/O APIC redirection entries on
//! demand. The local APIC timer is the scheduler tick source; it runs in
//! periodic mode with a divide-by-16 configuration and an initial count
//! calibrated against PIT channel 2.

use core::sync::atomic::{AtomicUsize, Ordering};

use pic8259::ChainedPics;
use spin::Mutex;

use super::{idt, inb, msr, outb};
use crate::error::{KernelError, KernelResult};
use crate::irq::{IrqController, IrqNumber};

/// Local APIC MMIO physical base (fixed by IA32_APIC_BASE at reset).
const LAPIC_PHYS_BASE: usize = 0xFEE0_0000;

/// I/O APIC MMIO physical base on PC-class machines.
const IOAPIC_PHYS_BASE: usize = 0xFEC0_0000;

// Local APIC register byte offsets.
const LAPIC_ID: usize = 0x020;
const LAPIC_TPR: usize = 0x080;
const LAPIC_EOI: usize = 0x0B0;
const LAPIC_SVR: usize = 0x0F0;
const LAPIC_LVT_TIMER: usize = 0x320;
const LAPIC_LVT_LINT0: usize = 0x350;
const LAPIC_LVT_LINT1: usize = 0x360;
const LAPIC_TIMER_INIT_COUNT: usize = 0x380;
const LAPIC_TIMER_CUR_COUNT: usize = 0x390;
const LAPIC_TIMER_DIV: usize = 0x3E0;

/// SVR bit 8: software APIC enable.
const SVR_ENABLE: u32 = 1 << 8;
/// LVT bit 16: mask.
const LVT_MASK: u32 = 1 << 16;
/// LVT timer bits 18:17 = 01: periodic mode.
const TIMER_PERIODIC: u32 = 0b01 << 17;
/// Divide configuration value selecting divide-by-16.
const TIMER_DIV_16: u32 = 0b0011;

/// PIT input clock in Hz.
const PIT_HZ: u64 = 1_193_182;

static LAPIC_BASE: AtomicUsize = AtomicUsize::new(0);
static IOAPIC: Mutex<Option<IoApic>> = Mutex::new(None);

fn lapic_read(offset: usize) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "APIC used before init");
    // SAFETY: base is the mapped local APIC MMIO region; offsets are the
    // architecturally defined register offsets above. Volatile keeps the
    // compiler from caching or eliding device accesses.
    unsafe { core::ptr::read_volatile((base + offset) as *const u32) }
}

fn lapic_write(offset: usize, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "APIC used before init");
    // SAFETY: As for `lapic_read`; volatile write reaches the device.
    unsafe { core::ptr::write_volatile((base + offset) as *mut u32, value) }
}

// ---------------------------------------------------------------------------
// I/O APIC
// ---------------------------------------------------------------------------

/// I/O APIC accessor. Registers are reached indirectly: write the register
/// index to IOREGSEL (offset 0), then read/write IOWIN (offset 0x10).
struct IoApic {
    base: usize,
}

impl IoApic {
    const IOREGSEL: usize = 0x00;
    const IOWIN: usize = 0x10;

    /// Redirection table base register index; two registers per entry.
    const REG_REDTBL: u32 = 0x10;

    fn read(&self, reg: u32) -> u32 {
        // SAFETY: The two MMIO words of the I/O APIC window; indirect
        // access protocol per the 82093AA datasheet.
        unsafe {
            core::ptr::write_volatile((self.base + Self::IOREGSEL) as *mut u32, reg);
            core::ptr::read_volatile((self.base + Self::IOWIN) as *const u32)
        }
    }

    fn write(&self, reg: u32, value: u32) {
        // SAFETY: As for `read`.
        unsafe {
            core::ptr::write_volatile((self.base + Self::IOREGSEL) as *mut u32, reg);
            core::ptr::write_volatile((self.base + Self::IOWIN) as *mut u32, value);
        }
    }

    /// Point `gsi` at `vector`, edge-triggered, active-high, physical
    /// destination APIC 0, unmasked.
    fn route(&self, gsi: u8, vector: u8) {
        let low = Self::REG_REDTBL + 2 * gsi as u32;
        let high = low + 1;
        self.write(high, 0); // destination APIC ID 0
        self.write(low, vector as u32);
    }

    fn set_masked(&self, gsi: u8, masked: bool) {
        let low = Self::REG_REDTBL + 2 * gsi as u32;
        let mut entry = self.read(low);
        if masked {
            entry |= 1 << 16;
        } else {
            entry &= !(1 << 16);
        }
        self.write(low, entry);
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Mask the PICs, enable the local APIC, and prepare the I/O APIC.
pub fn init() {
    // Remap the legacy PICs clear of the exception range, then mask every
    // line. They stay dead; the I/O APIC owns external interrupts.
    // SAFETY: Standard 8259 initialization sequence on the fixed legacy
    // ports; no other code touches the PICs after this.
    unsafe {
        let mut pics = ChainedPics::new(0x20, 0x28);
        pics.initialize();
        pics.disable();
    }

    // Globally enable the APIC in IA32_APIC_BASE, map it, and set the
    // software-enable bit in the spurious vector register.
    let apic_base = msr::read_apic_base();
    msr::write_apic_base(apic_base | (1 << 11));
    let virt = crate::mm::phys_to_virt(LAPIC_PHYS_BASE);
    LAPIC_BASE.store(virt, Ordering::Relaxed);

    lapic_write(LAPIC_TPR, 0); // accept everything
    lapic_write(LAPIC_LVT_LINT0, LVT_MASK);
    lapic_write(LAPIC_LVT_LINT1, LVT_MASK);
    lapic_write(
        LAPIC_SVR,
        SVR_ENABLE | idt::SPURIOUS_VECTOR as u32,
    );

    *IOAPIC.lock() = Some(IoApic {
        base: crate::mm::phys_to_virt(IOAPIC_PHYS_BASE),
    });

    log::debug!("lapic id {} enabled", lapic_read(LAPIC_ID) >> 24);
}

/// Signal end-of-interrupt: a write of zero to the EOI register.
#[inline]
pub fn eoi() {
    lapic_write(LAPIC_EOI, 0);
}

/// Route a global system interrupt to its IDT vector and unmask it.
pub fn route_irq(irq: IrqNumber) -> KernelResult<()> {
    let gsi = irq.as_u32();
    if gsi == 0 || gsi > 23 {
        return Err(KernelError::InvalidArgument { what: "gsi" });
    }
    let guard = IOAPIC.lock();
    let ioapic = guard.as_ref().ok_or(KernelError::NotInitialized {
        subsystem: "ioapic",
    })?;
    ioapic.route(gsi as u8, idt::IRQ_BASE + gsi as u8);
    Ok(())
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Calibrate the APIC timer against PIT channel 2 and start it in periodic
/// mode at `hz`. Returns the measured APIC timer frequency in Hz (with the
/// divide-by-16 configuration already applied).
pub fn start_periodic_timer(hz: u64) -> u64 {
    const CALIBRATE_MS: u64 = 10;

    lapic_write(LAPIC_TIMER_DIV, TIMER_DIV_16);

    // Gate PIT channel 2 low, program a one-shot countdown of 10 ms, then
    // raise the gate and let the APIC timer free-run over the same window.
    let gate = inb(0x61) & 0xFC;
    outb(0x61, gate);
    outb(0x43, 0xB0); // channel 2, lobyte/hibyte, mode 0
    let pit_count = (PIT_HZ * CALIBRATE_MS / 1000) as u16;
    outb(0x42, (pit_count & 0xFF) as u8);
    outb(0x42, (pit_count >> 8) as u8);

    lapic_write(LAPIC_TIMER_INIT_COUNT, u32::MAX);
    outb(0x61, gate | 0x01);

    // OUT2 (port 0x61 bit 5) goes high when the countdown expires.
    while inb(0x61) & 0x20 == 0 {
        core::hint::spin_loop();
    }

    let elapsed = u32::MAX - lapic_read(LAPIC_TIMER_CUR_COUNT);
    lapic_write(LAPIC_TIMER_INIT_COUNT, 0);
    let apic_hz = elapsed as u64 * (1000 / CALIBRATE_MS);

    let initial = (apic_hz / hz).max(1) as u32;
    lapic_write(
        LAPIC_LVT_TIMER,
        TIMER_PERIODIC | idt::TIMER_VECTOR as u32,
    );
    lapic_write(LAPIC_TIMER_INIT_COUNT, initial);
    apic_hz
}

// ---------------------------------------------------------------------------
// IrqController
// ---------------------------------------------------------------------------

/// Unit type implementing [`IrqController`] over the APIC pair.
pub struct Apic;

impl IrqController for Apic {
    fn enable(&self, irq: IrqNumber) -> KernelResult<()> {
        if irq.as_u32() == 0 {
            // Timer lives on the local APIC LVT, not the I/O APIC.
            let lvt = lapic_read(LAPIC_LVT_TIMER);
            lapic_write(LAPIC_LVT_TIMER, lvt & !LVT_MASK);
            return Ok(());
        }
        route_irq(irq)
    }

    fn disable(&self, irq: IrqNumber) -> KernelResult<()> {
        if irq.as_u32() == 0 {
            let lvt = lapic_read(LAPIC_LVT_TIMER);
            lapic_write(LAPIC_LVT_TIMER, lvt | LVT_MASK);
            return Ok(());
        }
        let guard = IOAPIC.lock();
        let ioapic = guard.as_ref().ok_or(KernelError::NotInitialized {
            subsystem: "ioapic",
        })?;
        ioapic.set_masked(irq.as_u32() as u8, true);
        Ok(())
    }

    fn eoi(&self, _irq: IrqNumber) {
        eoi();
    }

    fn set_priority(&self, _irq: IrqNumber, _priority: u8) -> KernelResult<()> {
        // Per-IRQ priority is a GIC concept; the APIC orders by vector.
        Ok(())
    }
}
