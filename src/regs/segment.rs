//! Segment selector and LDTR access.

use core::arch::asm;
use core::sync::atomic::{Ordering, compiler_fence};

use x86::segmentation::{self, SegmentSelector};

/// Current `FS` selector.
pub fn read_fs() -> SegmentSelector {
    segmentation::fs()
}

/// Current `GS` selector.
pub fn read_gs() -> SegmentSelector {
    segmentation::gs()
}

/// Current task register selector.
pub fn read_tr() -> SegmentSelector {
    // SAFETY: `str` only reads the task register.
    unsafe { x86::task::tr() }
}

/// Current local descriptor table selector.
pub fn sldt() -> SegmentSelector {
    let selector: u16;
    compiler_fence(Ordering::SeqCst);
    // SAFETY: `sldt` only reads LDTR.
    unsafe {
        asm!("sldt {0:x}", out(reg) selector, options(nomem, nostack, preserves_flags));
    }
    compiler_fence(Ordering::SeqCst);
    SegmentSelector::from_raw(selector)
}

macro_rules! segment_loader {
    ($($seg:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Loads `", stringify!($seg), "` with `selector`.")]
                ///
                /// # Safety
                ///
                /// `selector` must reference a valid data segment (or be null).
                /// Loading it clobbers the hidden base, which callers restore
                /// through the matching base MSR.
                pub unsafe fn [<load_ $seg>](selector: SegmentSelector) {
                    unsafe { segmentation::[<load_ $seg>](selector) }
                }
            )*
        }
    };
}

segment_loader!(fs, gs);

/// Loads LDTR with `selector`.
///
/// # Safety
///
/// `selector` must be null or reference an LDT descriptor in the current GDT.
pub unsafe fn load_ldt(selector: SegmentSelector) {
    unsafe {
        asm!("lldt {0:x}", in(reg) selector.bits(), options(nostack, preserves_flags));
    }
}
