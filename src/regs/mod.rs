//! Direct reads of host CPU registers.
//!
//! All accessors here are total: they never fault at CPL0. Each control
//! register access is bracketed by a compiler fence and its assembly is not
//! marked `nomem`, so two reads of the same register are never merged or moved
//! across an intervening write. Dropping the fences makes a
//! read-modify-write of CR4 (for example) observe a stale value; they are
//! required for correctness.

mod counters;
mod segment;

use core::arch::asm;
use core::sync::atomic::{Ordering, compiler_fence};

use x86_64::VirtAddr;
use x86_64::structures::DescriptorTablePointer;

pub use counters::{read_pmc, read_tsc, read_tscp, rdtscp_available};
pub use segment::{load_fs, load_gs, load_ldt, read_fs, read_gs, read_tr, sldt};

macro_rules! control_register_reader {
    ($($cr:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Reads `", stringify!($cr), "`.")]
                #[inline]
                pub fn [<read_ $cr>]() -> u64 {
                    let value: u64;
                    compiler_fence(Ordering::SeqCst);
                    // SAFETY: moving from a control register has no side effects at CPL0.
                    unsafe {
                        asm!(
                            concat!("mov {}, ", stringify!($cr)),
                            out(reg) value,
                            options(nostack, preserves_flags),
                        );
                    }
                    compiler_fence(Ordering::SeqCst);
                    value
                }
            )*
        }
    };
}

control_register_reader!(cr0, cr3, cr4);

/// Captures the GDT register.
pub fn sgdt() -> DescriptorTablePointer {
    let mut gdt = DescriptorTablePointer {
        limit: 0,
        base: VirtAddr::zero(),
    };
    compiler_fence(Ordering::SeqCst);
    // SAFETY: `sgdt` only stores 10 bytes into `gdt`.
    unsafe {
        asm!("sgdt [{0}]", in(reg) &mut gdt, options(nostack, preserves_flags));
    }
    compiler_fence(Ordering::SeqCst);
    gdt
}

/// Captures the IDT register.
pub fn sidt() -> DescriptorTablePointer {
    compiler_fence(Ordering::SeqCst);
    let idt = x86_64::instructions::tables::sidt();
    compiler_fence(Ordering::SeqCst);
    idt
}
