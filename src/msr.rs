//! Model-specific register access.
//!
//! [`read_msr`] and [`write_msr`] run `RDMSR`/`WRMSR` inside a trap region
//! (see [`crate::trap`]): touching an MSR that does not exist, is protected,
//! or rejects the written value comes back as
//! [`HostCpuError::HardwareFault`] instead of a host crash. The trap costs a
//! few stores and a preemption toggle per access; hot paths that have already
//! established that an MSR exists use [`read_msr_unchecked`] and
//! [`write_msr_unchecked`].
//!
//! Accesses are atomic on the issuing CPU only. Making a write visible on
//! other CPUs is the job of [`crate::xcall`].

use core::arch::asm;

use raw_cpuid::CpuId;

use crate::error::{FaultKind, HostCpuError, Result};
use crate::trap::{OnTrap, TrapRecord, TrapVectors};

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(non_camel_case_types)]
/// Well-known MSR indices.
pub enum Msr {
    IA32_TIME_STAMP_COUNTER = 0x10,
    IA32_APIC_BASE = 0x1b,
    IA32_FEATURE_CONTROL = 0x3a,
    IA32_TSC_ADJUST = 0x3b,
    IA32_SPEC_CTRL = 0x48,
    IA32_SYSENTER_CS = 0x174,
    IA32_SYSENTER_ESP = 0x175,
    IA32_SYSENTER_EIP = 0x176,
    IA32_MISC_ENABLE = 0x1a0,
    IA32_DEBUGCTL = 0x1d9,
    IA32_PAT = 0x277,
    IA32_MTRR_DEF_TYPE = 0x2ff,

    IA32_VMX_BASIC = 0x480,
    IA32_VMX_PINBASED_CTLS = 0x481,
    IA32_VMX_PROCBASED_CTLS = 0x482,
    IA32_VMX_EXIT_CTLS = 0x483,
    IA32_VMX_ENTRY_CTLS = 0x484,
    IA32_VMX_MISC = 0x485,
    IA32_VMX_CR0_FIXED0 = 0x486,
    IA32_VMX_CR0_FIXED1 = 0x487,
    IA32_VMX_CR4_FIXED0 = 0x488,
    IA32_VMX_CR4_FIXED1 = 0x489,
    IA32_VMX_PROCBASED_CTLS2 = 0x48b,
    IA32_VMX_EPT_VPID_CAP = 0x48c,

    IA32_TSC_DEADLINE = 0x6e0,
    IA32_XSS = 0xda0,

    IA32_EFER = 0xc000_0080,
    IA32_STAR = 0xc000_0081,
    IA32_LSTAR = 0xc000_0082,
    IA32_CSTAR = 0xc000_0083,
    IA32_FMASK = 0xc000_0084,

    IA32_FS_BASE = 0xc000_0100,
    IA32_GS_BASE = 0xc000_0101,
    IA32_KERNEL_GSBASE = 0xc000_0102,
    IA32_TSC_AUX = 0xc000_0103,
}
}

impl Msr {
    /// Read 64 bits msr register. The caller must know the MSR exists on
    /// this CPU; use [`Msr::try_read`] otherwise.
    #[inline(always)]
    pub fn read(self) -> u64 {
        // SAFETY: reading an existing MSR has no side effects.
        unsafe { read_msr_unchecked(self as u32) }
    }

    /// Write 64 bits to msr register.
    ///
    /// # Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline(always)]
    pub unsafe fn write(self, value: u64) {
        unsafe { write_msr_unchecked(self as u32, value) }
    }

    pub fn try_read(self) -> Result<u64> {
        read_msr(self as u32)
    }

    /// Trapped write.
    ///
    /// # Safety
    ///
    /// Same as [`Msr::write`]: a write that the processor accepts takes full
    /// effect.
    pub unsafe fn try_write(self, value: u64) -> Result {
        unsafe { write_msr(self as u32, value) }
    }
}

fn hardware_fault(msr: u32, vector: u8) -> HostCpuError {
    let kind = FaultKind::from_vector(vector);
    warn!("MSR {msr:#x} access faulted: {kind:?}");
    HostCpuError::HardwareFault { msr, kind }
}

/// Reads MSR `index`, containing any fault the access raises.
pub fn read_msr(index: u32) -> Result<u64> {
    let record = TrapRecord::new(TrapVectors::MSR_ACCESS);
    let (low, high): (u32, u32);
    {
        let _trap = OnTrap::arm(&record);
        // SAFETY: `record` is armed for this CPU; a fault on the `rdmsr` below
        // resumes right after it with the record marked as faulted.
        unsafe {
            asm!(
                "lea {tmp}, [rip + 2f]",
                "mov [{rec} + {fault_ip}], {tmp}",
                "lea {tmp}, [rip + 3f]",
                "mov [{rec} + {fixup_ip}], {tmp}",
                "2:",
                "rdmsr",
                "3:",
                rec = in(reg) record.as_ptr(),
                tmp = out(reg) _,
                fault_ip = const TrapRecord::FAULT_IP_OFFSET,
                fixup_ip = const TrapRecord::FIXUP_IP_OFFSET,
                in("ecx") index,
                out("eax") low,
                out("edx") high,
                options(nostack, preserves_flags),
            );
        }
    }
    if let Some(vector) = record.fault() {
        return Err(hardware_fault(index, vector));
    }
    let value = (high as u64) << 32 | low as u64;
    #[cfg(feature = "tracing")]
    trace!("rdmsr {index:#x} -> {value:#x}");
    Ok(value)
}

/// Writes `value` to MSR `index`, containing any fault the access raises.
///
/// # Safety
///
/// A write the processor accepts takes full effect; the caller must ensure it
/// does not break the host (e.g. `IA32_EFER`, `IA32_GS_BASE`).
pub unsafe fn write_msr(index: u32, value: u64) -> Result {
    let record = TrapRecord::new(TrapVectors::MSR_ACCESS);
    {
        let _trap = OnTrap::arm(&record);
        // SAFETY: as in `read_msr`; the effect of the write is the caller's
        // responsibility.
        unsafe {
            asm!(
                "lea {tmp}, [rip + 2f]",
                "mov [{rec} + {fault_ip}], {tmp}",
                "lea {tmp}, [rip + 3f]",
                "mov [{rec} + {fixup_ip}], {tmp}",
                "2:",
                "wrmsr",
                "3:",
                rec = in(reg) record.as_ptr(),
                tmp = out(reg) _,
                fault_ip = const TrapRecord::FAULT_IP_OFFSET,
                fixup_ip = const TrapRecord::FIXUP_IP_OFFSET,
                in("ecx") index,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nostack, preserves_flags),
            );
        }
    }
    if let Some(vector) = record.fault() {
        return Err(hardware_fault(index, vector));
    }
    #[cfg(feature = "tracing")]
    trace!("wrmsr {index:#x} <- {value:#x}");
    Ok(())
}

/// Reads MSR `index` without a trap region.
///
/// # Safety
///
/// The MSR must exist and be readable at the current privilege level;
/// otherwise the processor raises `#GP`, which the host treats as fatal.
#[inline(always)]
pub unsafe fn read_msr_unchecked(index: u32) -> u64 {
    unsafe { x86::msr::rdmsr(index) }
}

/// Writes MSR `index` without a trap region.
///
/// # Safety
///
/// The MSR must exist and accept `value`, and the write must not break the
/// host.
#[inline(always)]
pub unsafe fn write_msr_unchecked(index: u32, value: u64) {
    unsafe { x86::msr::wrmsr(index, value) }
}

/// Whether the processor implements `RDMSR`/`WRMSR` at all.
pub fn msr_available() -> bool {
    CpuId::new()
        .get_feature_info()
        .map(|f| f.has_msr())
        .unwrap_or(false)
}
