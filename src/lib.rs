#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

#[cfg(test)]
extern crate std;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod error;
        mod hal;

        pub mod bitmap;
        pub mod context;
        pub mod events;
        pub mod mode;
        pub mod msr;
        pub mod regs;
        pub mod segmentation;
        pub mod trap;
        pub mod xcall;
        pub mod xstate;
    } else {
        compile_error!("x86_hostcpu only supports x86_64 hosts");
    }
}

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use bitmap::{DirtyBitmap, dirty_bitmap_bytes, find_first_zero_bit};
pub use context::HostContext;
pub use error::{FaultKind, HostCpuError, Result};
pub use events::{ExceptionVector, VcpuEvents};
pub use hal::{HostCpuIf, MAX_CPUS, PreemptGuard};
pub use mode::{GuestControlState, VmCpuMode};
pub use msr::{Msr, read_msr, write_msr};
pub use segmentation::{DescriptorTable, Segment, SegmentAccessRights, SegmentDescriptor};
pub use trap::handle_trap;
pub use xcall::{CpuMask, CpuTopology, CrossCallDispatcher, XcallTarget};
pub use xstate::FxSaveArea;
