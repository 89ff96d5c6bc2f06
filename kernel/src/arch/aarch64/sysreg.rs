//! Typed system-register accessors.
//!
//! One function per register instead of a generic "read register N": a
//! wrong-register bug then fails to compile or is obvious at the call
//! site. The GIC CPU-interface registers use their S3_* encodings so the
//! assembler needs no architecture-extension flags.

#![allow(dead_code)]

macro_rules! read_sysreg {
    ($fn_name:ident, $reg:literal, $doc:literal) => {
        #[doc = $doc]
        #[inline]
        pub fn $fn_name() -> u64 {
            let value: u64;
            // SAFETY: MRS from this register is a side-effect-free read at
            // EL1 (acknowledge registers excepted and documented at the
            // call sites that use them).
            unsafe {
                core::arch::asm!(
                    concat!("mrs {}, ", $reg),
                    out(reg) value,
                    options(nomem, nostack, preserves_flags),
                );
            }
            value
        }
    };
}

macro_rules! write_sysreg {
    ($fn_name:ident, $reg:literal, $doc:literal) => {
        #[doc = $doc]
        #[inline]
        pub fn $fn_name(value: u64) {
            // SAFETY: MSR to this register is the documented way to
            // configure it; callers pass architecturally valid values.
            unsafe {
                core::arch::asm!(
                    concat!("msr ", $reg, ", {}"),
                    in(reg) value,
                    options(nomem, nostack, preserves_flags),
                );
            }
        }
    };
}

read_sysreg!(read_daif, "daif", "Interrupt mask bits (PSTATE.DAIF view).");
write_sysreg!(write_daif, "daif", "Restore a DAIF image.");

read_sysreg!(read_mpidr, "mpidr_el1", "Multiprocessor affinity register.");
read_sysreg!(read_current_el, "CurrentEL", "Current exception level.");

read_sysreg!(read_cntfrq, "cntfrq_el0", "Generic timer frequency in Hz.");
read_sysreg!(read_cntpct, "cntpct_el0", "Physical counter value.");
write_sysreg!(
    write_cntp_tval,
    "cntp_tval_el0",
    "EL1 physical timer countdown value."
);
write_sysreg!(
    write_cntp_ctl,
    "cntp_ctl_el0",
    "EL1 physical timer control (bit 0 enable, bit 1 mask)."
);

write_sysreg!(write_vbar, "vbar_el1", "Exception vector table base.");
read_sysreg!(read_esr, "esr_el1", "Exception syndrome.");
read_sysreg!(read_far, "far_el1", "Faulting virtual address.");
read_sysreg!(read_elr, "elr_el1", "Exception link register.");
read_sysreg!(read_spsr, "spsr_el1", "Saved program status.");

read_sysreg!(read_ttbr0, "ttbr0_el1", "Translation table base 0.");
write_sysreg!(write_ttbr0, "ttbr0_el1", "Install translation table base 0.");
write_sysreg!(write_mair, "mair_el1", "Memory attribute indirection.");

// GICv3 CPU interface (system-register access, ICC_SRE enabled).
read_sysreg!(
    read_icc_iar1,
    "S3_0_C12_C12_0",
    "ICC_IAR1_EL1: acknowledge the highest-priority pending group-1 \
     interrupt. Reading has the side effect of activating it."
);
write_sysreg!(
    write_icc_eoir1,
    "S3_0_C12_C12_1",
    "ICC_EOIR1_EL1: signal end-of-interrupt for a group-1 INTID."
);
write_sysreg!(
    write_icc_bpr1,
    "S3_0_C12_C12_3",
    "ICC_BPR1_EL1: group-1 binary point."
);
write_sysreg!(
    write_icc_ctlr,
    "S3_0_C12_C12_4",
    "ICC_CTLR_EL1: CPU interface control."
);
read_sysreg!(read_icc_sre, "S3_0_C12_C12_5", "ICC_SRE_EL1: register access control.");
write_sysreg!(
    write_icc_sre,
    "S3_0_C12_C12_5",
    "ICC_SRE_EL1: enable system-register access to the CPU interface."
);
write_sysreg!(
    write_icc_igrpen1,
    "S3_0_C12_C12_7",
    "ICC_IGRPEN1_EL1: group-1 interrupt enable."
);
write_sysreg!(
    write_icc_pmr,
    "S3_0_C4_C6_0",
    "ICC_PMR_EL1: priority mask (0xFF accepts everything)."
);
