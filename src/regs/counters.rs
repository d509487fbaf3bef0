//! Time-stamp and performance-monitoring counters.

use core::arch::asm;
use core::arch::x86_64::{__rdtscp, _rdtsc};

use raw_cpuid::CpuId;

/// Reads the time-stamp counter.
#[inline]
pub fn read_tsc() -> u64 {
    // SAFETY: `rdtsc` is available on every x86_64 processor.
    unsafe { _rdtsc() }
}

/// Reads the time-stamp counter together with `IA32_TSC_AUX`, which hosts set
/// to the CPU number.
///
/// The processor must support `RDTSCP`, see [`rdtscp_available`].
#[inline]
pub fn read_tscp() -> (u64, u32) {
    let mut aux = 0;
    // SAFETY: callers check `rdtscp_available` once at startup.
    let tsc = unsafe { __rdtscp(&mut aux) };
    (tsc, aux)
}

/// Reads performance-monitoring counter `counter`.
///
/// # Safety
///
/// `counter` must name an implemented counter, and `RDPMC` must be permitted
/// at the current privilege level.
#[inline]
pub unsafe fn read_pmc(counter: u32) -> u64 {
    let (low, high): (u32, u32);
    unsafe {
        asm!(
            "rdpmc",
            in("ecx") counter,
            out("eax") low,
            out("edx") high,
            options(nomem, nostack, preserves_flags),
        );
    }
    (high as u64) << 32 | low as u64
}

pub fn rdtscp_available() -> bool {
    CpuId::new()
        .get_extended_processor_and_feature_identifiers()
        .map(|f| f.has_rdtscp())
        .unwrap_or(false)
}
