//! Legacy x87/SSE state images (`FXSAVE` / `FXRSTOR`).

use core::arch::asm;

use raw_cpuid::CpuId;

/// Memory image written by `FXSAVE`.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FxSaveArea {
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u8,
    _reserved0: u8,
    pub fop: u16,
    pub fip: u64,
    pub fdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st: [u128; 8],
    pub xmm: [u128; 16],
    _reserved1: [u8; 96],
}

const _: () = assert!(size_of::<FxSaveArea>() == 512);

impl FxSaveArea {
    /// Default FCW after `FNINIT`.
    pub const FCW_INIT: u16 = 0x037f;
    /// Default MXCSR after reset: all SIMD exceptions masked.
    pub const MXCSR_INIT: u32 = 0x1f80;

    pub const fn new() -> Self {
        Self {
            fcw: Self::FCW_INIT,
            fsw: 0,
            ftw: 0,
            _reserved0: 0,
            fop: 0,
            fip: 0,
            fdp: 0,
            mxcsr: Self::MXCSR_INIT,
            mxcsr_mask: 0,
            st: [0; 8],
            xmm: [0; 16],
            _reserved1: [0; 96],
        }
    }
}

impl Default for FxSaveArea {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FxSaveArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FxSaveArea")
            .field("fcw", &format_args!("{:#x}", self.fcw))
            .field("fsw", &format_args!("{:#x}", self.fsw))
            .field("ftw", &format_args!("{:#x}", self.ftw))
            .field("mxcsr", &format_args!("{:#x}", self.mxcsr))
            .finish_non_exhaustive()
    }
}

/// Saves the current x87/SSE state into `area`.
#[inline]
pub fn fx_save(area: &mut FxSaveArea) {
    // SAFETY: `area` is 512 bytes and 16-byte aligned.
    unsafe { asm!("fxsave64 [{}]", in(reg) area as *mut FxSaveArea, options(nostack, preserves_flags)) }
}

/// Loads the x87/SSE state from `area`.
///
/// # Safety
///
/// `area` must hold a valid image; reserved MXCSR bits set raise `#GP`. The
/// loaded state replaces whatever the current context was using.
#[inline]
pub unsafe fn fx_restore(area: &FxSaveArea) {
    unsafe { asm!("fxrstor64 [{}]", in(reg) area as *const FxSaveArea, options(nostack, preserves_flags, readonly)) }
}

/// Resets the x87 FPU to its initial state.
///
/// # Safety
///
/// Discards the current x87 state of the running context.
#[inline]
pub unsafe fn fx_init() {
    unsafe { asm!("fninit", options(nomem, nostack, preserves_flags)) }
}

/// Check if FXSAVE and FXRSTOR are available on the current CPU.
pub fn fxsr_available() -> bool {
    CpuId::new()
        .get_feature_info()
        .map(|f| f.has_fxsave_fxstor())
        .unwrap_or(false)
}
