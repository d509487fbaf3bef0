//! Guest operating-mode predicates.

use x86_64::registers::control::{Cr0Flags, Cr4Flags, EferFlags};

/// EDX after reset or INIT: family 6, model 0, stepping 0.
pub const RESET_RDX: u64 = 0x600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmCpuMode {
    Real,
    Protected,
    Compatibility, // IA-32E mode (CS.L = 0)
    Mode64,        // IA-32E mode (CS.L = 1)
}

/// The guest control registers that decide its operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestControlState {
    pub cr0: Cr0Flags,
    pub cr4: Cr4Flags,
    pub efer: EferFlags,
}

impl GuestControlState {
    /// Decodes raw register values, dropping undefined bits.
    pub fn from_raw(cr0: u64, cr4: u64, efer: u64) -> Self {
        Self {
            cr0: Cr0Flags::from_bits_truncate(cr0),
            cr4: Cr4Flags::from_bits_truncate(cr4),
            efer: EferFlags::from_bits_truncate(efer),
        }
    }

    pub fn is_protmode(&self) -> bool {
        self.cr0.contains(Cr0Flags::PROTECTED_MODE_ENABLE)
    }

    pub fn is_paging(&self) -> bool {
        self.cr0.contains(Cr0Flags::PAGING)
    }

    pub fn is_pae(&self) -> bool {
        self.cr4.contains(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION)
    }

    pub fn is_pse(&self) -> bool {
        self.cr4.contains(Cr4Flags::PAGE_SIZE_EXTENSION)
    }

    /// `EFER.LMA`, set by the processor once paging is enabled with `EFER.LME`.
    pub fn is_long_mode(&self) -> bool {
        self.efer.contains(EferFlags::LONG_MODE_ACTIVE)
    }

    /// Operating mode given the `L` bit of the guest's current CS.
    pub fn cpu_mode(&self, cs_long: bool) -> VmCpuMode {
        if self.is_long_mode() {
            if cs_long {
                VmCpuMode::Mode64
            } else {
                VmCpuMode::Compatibility
            }
        } else if self.is_protmode() {
            VmCpuMode::Protected
        } else {
            VmCpuMode::Real
        }
    }
}
