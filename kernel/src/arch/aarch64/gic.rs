//! GICv3 interrupt controller driver for the QEMU virt platform.
//!
//! Three pieces cooperate:
//!
//! - **Distributor (GICD)**: affinity routing, per-SPI enable/priority.
//! - **Redistributor (GICR)**: one per PE; must be woken from processor
//!   sleep before it forwards anything. Its SGI frame configures the
//!   banked SGIs/PPIs (the timer PPI lives here).
//! - **CPU interface**: system registers (`ICC_*`); acknowledge reads
//!   `ICC_IAR1_EL1`, completion writes the matching `ICC_EOIR1_EL1`.
//!
//! An acknowledged INTID of 1020 or above is spurious and is dropped
//! without EOI.

use core::ptr;

use super::sysreg;
use crate::error::{KernelError, KernelResult};
use crate::irq::{IrqController, IrqNumber};

/// Distributor base on the QEMU virt machine.
const GICD_BASE: usize = 0x0800_0000;

/// Redistributor region base on the QEMU virt machine (hart 0's frame).
const GICR_BASE: usize = 0x080A_0000;

/// Offset of the SGI/PPI page within a redistributor frame.
const GICR_SGI_OFFSET: usize = 0x1_0000;

// Distributor registers.
const GICD_CTLR: usize = 0x000;
const GICD_TYPER: usize = 0x004;
const GICD_IGROUPR: usize = 0x080;
const GICD_ISENABLER: usize = 0x100;
const GICD_ICENABLER: usize = 0x180;
const GICD_IPRIORITYR: usize = 0x400;
const GICD_IROUTER: usize = 0x6100; // IROUTER(32), first SPI

// GICD_CTLR bits (single security state).
const CTLR_ENABLE_G1: u32 = 1 << 1;
const CTLR_ARE: u32 = 1 << 4;
const CTLR_RWP: u32 = 1 << 31;

// Redistributor registers.
const GICR_WAKER: usize = 0x014;
const WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
const WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;

// SGI-frame registers (banked per PE).
const GICR_IGROUPR0: usize = 0x080;
const GICR_ISENABLER0: usize = 0x100;
const GICR_ICENABLER0: usize = 0x180;
const GICR_IPRIORITYR: usize = 0x400;

/// First INTID that means "spurious" rather than a real interrupt.
const SPURIOUS_INTID: u64 = 1020;

/// Default priority for newly enabled interrupts (lower value = higher).
const DEFAULT_PRIORITY: u8 = 0xA0;

/// Highest INTID banked in the redistributor (SGIs 0-15, PPIs 16-31).
const PPI_LIMIT: u32 = 32;

fn gicd_read(offset: usize) -> u32 {
    // SAFETY: GICD_BASE..+64K is the distributor MMIO region on the QEMU
    // virt machine; offsets come from the constants above. Volatile keeps
    // device accesses explicit.
    unsafe { ptr::read_volatile((GICD_BASE + offset) as *const u32) }
}

fn gicd_write(offset: usize, value: u32) {
    // SAFETY: As for `gicd_read`.
    unsafe { ptr::write_volatile((GICD_BASE + offset) as *mut u32, value) }
}

fn gicd_write64(offset: usize, value: u64) {
    // SAFETY: IROUTER registers are 64-bit; same region as `gicd_read`.
    unsafe { ptr::write_volatile((GICD_BASE + offset) as *mut u64, value) }
}

fn gicr_read(offset: usize) -> u32 {
    // SAFETY: Hart 0's redistributor frame on the QEMU virt machine.
    unsafe { ptr::read_volatile((GICR_BASE + offset) as *const u32) }
}

fn gicr_write(offset: usize, value: u32) {
    // SAFETY: As for `gicr_read`.
    unsafe { ptr::write_volatile((GICR_BASE + offset) as *mut u32, value) }
}

fn sgi_write(offset: usize, value: u32) {
    // SAFETY: The SGI page of hart 0's redistributor frame.
    unsafe {
        ptr::write_volatile((GICR_BASE + GICR_SGI_OFFSET + offset) as *mut u32, value)
    }
}

/// Wait for a distributor register write to take effect.
fn wait_rwp() {
    while gicd_read(GICD_CTLR) & CTLR_RWP != 0 {
        core::hint::spin_loop();
    }
}

fn barrier() {
    // SAFETY: DSB SY orders the preceding MMIO configuration writes before
    // anything after; ISB makes the pipeline observe them. Plain barrier
    // instructions, no other effect.
    unsafe {
        core::arch::asm!("dsb sy", "isb", options(nostack, preserves_flags));
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Number of interrupt lines the distributor implements.
fn num_irqs() -> u32 {
    let typer = gicd_read(GICD_TYPER);
    (((typer & 0x1F) + 1) * 32).min(1020)
}

/// Wake this PE's redistributor: clear ProcessorSleep, then wait for
/// ChildrenAsleep to drop.
fn wake_redistributor() {
    let waker = gicr_read(GICR_WAKER) & !WAKER_PROCESSOR_SLEEP;
    gicr_write(GICR_WAKER, waker);
    while gicr_read(GICR_WAKER) & WAKER_CHILDREN_ASLEEP != 0 {
        core::hint::spin_loop();
    }
}

/// Bring up distributor, redistributor, and CPU interface on hart 0.
pub fn init() {
    let lines = num_irqs();

    // Disable and drain the distributor while reconfiguring.
    gicd_write(GICD_CTLR, 0);
    wait_rwp();

    // All SPIs: group 1, disabled, default priority.
    let regs = (lines / 32) as usize;
    for i in 1..regs {
        gicd_write(GICD_IGROUPR + i * 4, 0xFFFF_FFFF);
        gicd_write(GICD_ICENABLER + i * 4, 0xFFFF_FFFF);
    }
    let prio_word = u32::from_ne_bytes([DEFAULT_PRIORITY; 4]);
    for i in 8..(lines as usize / 4) {
        gicd_write(GICD_IPRIORITYR + i * 4, prio_word);
    }
    // With affinity routing every SPI needs an explicit route; aim them
    // all at hart 0 (affinity 0.0.0.0).
    for spi in 0..(lines.saturating_sub(32) as usize) {
        gicd_write64(GICD_IROUTER + spi * 8, 0);
    }
    barrier();

    gicd_write(GICD_CTLR, CTLR_ARE | CTLR_ENABLE_G1);
    wait_rwp();

    wake_redistributor();

    // Banked SGIs/PPIs: group 1, disabled until a driver asks.
    sgi_write(GICR_IGROUPR0, 0xFFFF_FFFF);
    sgi_write(GICR_ICENABLER0, 0xFFFF_FFFF);
    for i in 0..8 {
        sgi_write(GICR_IPRIORITYR + i * 4, prio_word);
    }
    barrier();

    // CPU interface: system-register access, accept all priorities,
    // group 1 delivery on.
    sysreg::write_icc_sre(sysreg::read_icc_sre() | 1);
    barrier();
    sysreg::write_icc_pmr(0xFF);
    sysreg::write_icc_bpr1(0);
    sysreg::write_icc_ctlr(0);
    sysreg::write_icc_igrpen1(1);
    barrier();

    log::debug!("gicv3: {} interrupt lines", lines);
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// IRQ exception entry: acknowledge, dispatch, complete, then let the
/// scheduler preempt if the tick asked for it.
pub fn handle_irq() {
    let intid = sysreg::read_icc_iar1() & 0xFF_FFFF;
    if intid >= SPURIOUS_INTID {
        // Spurious: dropped without EOI.
        return;
    }
    crate::irq::dispatch(IrqNumber::new(intid as u32));
    sysreg::write_icc_eoir1(intid);
    crate::sched::preempt_if_needed();
}

// ---------------------------------------------------------------------------
// IrqController
// ---------------------------------------------------------------------------

/// Unit type implementing [`IrqController`] over the GICv3.
pub struct Gic;

impl IrqController for Gic {
    fn enable(&self, irq: IrqNumber) -> KernelResult<()> {
        let id = irq.as_u32();
        if id >= num_irqs() {
            return Err(KernelError::InvalidArgument { what: "intid" });
        }
        self.set_priority(irq, DEFAULT_PRIORITY)?;
        if id < PPI_LIMIT {
            sgi_write(GICR_ISENABLER0, 1 << id);
        } else {
            gicd_write(GICD_ISENABLER + (id / 32 * 4) as usize, 1 << (id % 32));
        }
        barrier();
        Ok(())
    }

    fn disable(&self, irq: IrqNumber) -> KernelResult<()> {
        let id = irq.as_u32();
        if id >= num_irqs() {
            return Err(KernelError::InvalidArgument { what: "intid" });
        }
        if id < PPI_LIMIT {
            sgi_write(GICR_ICENABLER0, 1 << id);
        } else {
            gicd_write(GICD_ICENABLER + (id / 32 * 4) as usize, 1 << (id % 32));
        }
        barrier();
        Ok(())
    }

    fn eoi(&self, irq: IrqNumber) {
        sysreg::write_icc_eoir1(irq.as_u32() as u64);
    }

    fn set_priority(&self, irq: IrqNumber, priority: u8) -> KernelResult<()> {
        let id = irq.as_u32();
        if id >= num_irqs() {
            return Err(KernelError::InvalidArgument { what: "intid" });
        }
        // One priority byte per interrupt, four to a register.
        let reg = (id / 4 * 4) as usize;
        let shift = (id % 4) * 8;
        if id < PPI_LIMIT {
            let cur = {
                // SAFETY: SGI-page priority register read, same region as
                // the other redistributor accesses.
                unsafe {
                    ptr::read_volatile((GICR_BASE + GICR_SGI_OFFSET + GICR_IPRIORITYR + reg) as *const u32)
                }
            };
            let next = (cur & !(0xFF << shift)) | ((priority as u32) << shift);
            sgi_write(GICR_IPRIORITYR + reg, next);
        } else {
            let cur = gicd_read(GICD_IPRIORITYR + reg);
            let next = (cur & !(0xFF << shift)) | ((priority as u32) << shift);
            gicd_write(GICD_IPRIORITYR + reg, next);
        }
        Ok(())
    }
}
