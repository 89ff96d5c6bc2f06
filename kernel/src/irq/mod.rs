//! Architecture-independent IRQ handling.
//!
//! The per-architecture controllers (APIC on x86-64, GICv3 on AArch64)
//! implement [`IrqController`]; this module owns the handler registry and
//! the dispatch path the vector stubs call into. Registration binds an IRQ
//! number to a handler function plus an opaque data word; binding an
//! already-bound IRQ fails unless the caller passes the replace flag.

use crate::error::{KernelError, KernelResult};
use crate::sync::SpinLock;

/// Architecture-independent IRQ number.
///
/// On x86-64 this is the GSI (vector minus the external base); on AArch64
/// it is the GIC INTID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IrqNumber(u32);

impl IrqNumber {
    pub const fn new(irq: u32) -> Self {
        Self(irq)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "IRQ#{}", self.0)
    }
}

/// Handler function: receives the IRQ that fired and the opaque data word
/// supplied at registration. Runs with IRQs masked; must not block.
pub type IrqHandlerFn = fn(IrqNumber, usize);

/// Hardware interrupt controller interface implemented per architecture.
pub trait IrqController {
    /// Unmask an interrupt line so it can be delivered.
    fn enable(&self, irq: IrqNumber) -> KernelResult<()>;

    /// Mask an interrupt line.
    fn disable(&self, irq: IrqNumber) -> KernelResult<()>;

    /// Signal end-of-interrupt.
    fn eoi(&self, irq: IrqNumber);

    /// Set delivery priority where the hardware supports it (GIC); no-op
    /// on controllers that order by vector (APIC).
    fn set_priority(&self, irq: IrqNumber, priority: u8) -> KernelResult<()>;
}

/// Registry capacity. Covers the 24 I/O APIC lines and the GIC PPI/SPI
/// range this kernel routes.
const MAX_IRQ: usize = 256;

#[derive(Clone, Copy)]
struct Binding {
    handler: IrqHandlerFn,
    data: usize,
}

static HANDLERS: SpinLock<[Option<Binding>; MAX_IRQ]> = SpinLock::new([None; MAX_IRQ]);

/// Bind `handler` (with `data`) to `irq`.
///
/// Fails with `AlreadyExists` if the IRQ is bound and `replace` is false.
pub fn register_handler(
    irq: IrqNumber,
    handler: IrqHandlerFn,
    data: usize,
    replace: bool,
) -> KernelResult<()> {
    let idx = irq.as_u32() as usize;
    if idx >= MAX_IRQ {
        return Err(KernelError::InvalidArgument { what: "irq number" });
    }
    let mut table = HANDLERS.lock_irqsave();
    if table[idx].is_some() && !replace {
        return Err(KernelError::AlreadyExists { what: "irq handler" });
    }
    table[idx] = Some(Binding { handler, data });
    Ok(())
}

/// Remove the binding for `irq`.
pub fn unregister_handler(irq: IrqNumber) -> KernelResult<()> {
    let idx = irq.as_u32() as usize;
    if idx >= MAX_IRQ {
        return Err(KernelError::InvalidArgument { what: "irq number" });
    }
    let mut table = HANDLERS.lock_irqsave();
    if table[idx].take().is_none() {
        return Err(KernelError::NotFound);
    }
    Ok(())
}

/// Run the handler bound to `irq`. Called from the vector stubs with IRQs
/// masked. An unbound IRQ is logged at warning severity and otherwise
/// ignored.
pub fn dispatch(irq: IrqNumber) {
    let idx = irq.as_u32() as usize;
    let binding = if idx < MAX_IRQ {
        // Copy the binding out so the handler runs without the table lock:
        // a handler re-registering (replace) must not deadlock.
        *HANDLERS.lock().get(idx).unwrap_or(&None)
    } else {
        None
    };
    match binding {
        Some(b) => (b.handler)(irq, b.data),
        None => log::warn!("{}: no handler registered", irq),
    }
}

/// The active hardware controller for this architecture.
pub fn controller() -> &'static dyn IrqController {
    #[cfg(target_arch = "x86_64")]
    {
        static APIC: crate::arch::x86_64::apic::Apic = crate::arch::x86_64::apic::Apic;
        &APIC
    }
    #[cfg(target_arch = "aarch64")]
    {
        static GIC: crate::arch::aarch64::gic::Gic = crate::arch::aarch64::gic::Gic;
        &GIC
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_handler(_irq: IrqNumber, data: usize) {
        FIRED.fetch_add(data, Ordering::SeqCst);
    }

    #[test_case]
    fn register_dispatch_unregister() {
        let irq = IrqNumber::new(200);
        FIRED.store(0, Ordering::SeqCst);

        register_handler(irq, count_handler, 3, false).unwrap();
        assert_eq!(
            register_handler(irq, count_handler, 5, false),
            Err(KernelError::AlreadyExists { what: "irq handler" })
        );

        dispatch(irq);
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);

        // Replace flag swaps the data word.
        register_handler(irq, count_handler, 5, true).unwrap();
        dispatch(irq);
        assert_eq!(FIRED.load(Ordering::SeqCst), 8);

        unregister_handler(irq).unwrap();
        assert_eq!(unregister_handler(irq), Err(KernelError::NotFound));

        // Dispatch with nothing bound is a logged no-op.
        dispatch(irq);
        assert_eq!(FIRED.load(Ordering::SeqCst), 8);
    }

    #[test_case]
    fn rejects_out_of_range() {
        let irq = IrqNumber::new(4096);
        assert_eq!(
            register_handler(irq, count_handler, 0, false),
            Err(KernelError::InvalidArgument { what: "irq number" })
        );
    }
}
