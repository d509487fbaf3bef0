use x86::segmentation::SegmentSelector;
use x86_64::VirtAddr;
use x86_64::structures::DescriptorTablePointer;

use crate::msr::Msr;
use crate::regs;
use crate::segmentation::{DescriptorTable, Segment};

/// Host segment registers that a guest switch may clobber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSegments {
    pub fs: Segment,
    pub gs: Segment,
    pub ldt: Segment,
    pub tss: Segment,
}

impl HostSegments {
    /// Decodes the given selectors through `gdt`.
    pub fn decode(
        gdt: &DescriptorTable,
        fs: SegmentSelector,
        gs: SegmentSelector,
        ldt: SegmentSelector,
        tr: SegmentSelector,
    ) -> Self {
        Self {
            fs: Segment::from_selector(fs, gdt),
            gs: Segment::from_selector(gs, gdt),
            ldt: Segment::from_selector(ldt, gdt),
            tss: Segment::from_selector(tr, gdt),
        }
    }
}

/// Snapshot of the host state around a guest entry.
#[derive(Debug, Clone, Copy)]
pub struct HostContext {
    pub segments: HostSegments,
    pub gdt: DescriptorTablePointer,
    pub idt: DescriptorTablePointer,

    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gsbase: u64,
}

impl Default for HostContext {
    fn default() -> Self {
        Self {
            segments: HostSegments {
                fs: Segment::invalid(),
                gs: Segment::invalid(),
                ldt: Segment::invalid(),
                tss: Segment::invalid(),
            },
            gdt: DescriptorTablePointer {
                limit: 0,
                base: VirtAddr::zero(),
            },
            idt: DescriptorTablePointer {
                limit: 0,
                base: VirtAddr::zero(),
            },
            cr0: 0,
            cr3: 0,
            cr4: 0,
            efer: 0,
            star: 0,
            lstar: 0,
            cstar: 0,
            fmask: 0,
            kernel_gsbase: 0,
        }
    }
}

impl HostContext {
    /// Captures the current CPU's host state. Must run at CPL0 with
    /// preemption disabled.
    pub fn capture() -> Self {
        let gdt = regs::sgdt();
        let idt = regs::sidt();
        // SAFETY: the GDTR of the running CPU describes its mapped GDT.
        let table = unsafe { DescriptorTable::from_pointer(&gdt) };

        let mut segments = HostSegments::decode(
            &table,
            regs::read_fs(),
            regs::read_gs(),
            regs::sldt(),
            regs::read_tr(),
        );
        // Hidden 64-bit bases live in MSRs, not in the descriptors.
        segments.fs.base = Msr::IA32_FS_BASE.read();
        segments.gs.base = Msr::IA32_GS_BASE.read();

        let ctx = Self {
            segments,
            gdt,
            idt,
            cr0: regs::read_cr0(),
            cr3: regs::read_cr3(),
            cr4: regs::read_cr4(),
            efer: Msr::IA32_EFER.read(),
            star: Msr::IA32_STAR.read(),
            lstar: Msr::IA32_LSTAR.read(),
            cstar: Msr::IA32_CSTAR.read(),
            fmask: Msr::IA32_FMASK.read(),
            kernel_gsbase: Msr::IA32_KERNEL_GSBASE.read(),
        };
        trace!("captured host context: {:#x?}", ctx.segments);
        ctx
    }

    /// Reloads the FS/GS/LDT selectors and the FS/GS bases captured earlier.
    ///
    /// # Safety
    ///
    /// Must run on the CPU the context was captured on, with its GDT
    /// unchanged since the capture.
    pub unsafe fn restore_segments(&self) {
        unsafe {
            regs::load_ldt(self.segments.ldt.selector);
            regs::load_fs(self.segments.fs.selector);
            // gs must be reloaded before its base, which the load clobbers.
            regs::load_gs(self.segments.gs.selector);

            Msr::IA32_FS_BASE.write(self.segments.fs.base);
            Msr::IA32_GS_BASE.write(self.segments.gs.base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::{SegmentAccessRights, SegmentDescriptor};
    use x86::Ring;

    #[test]
    fn test_decode_host_segments() {
        let tss = SegmentDescriptor::new(
            0x8000_1000,
            0x67,
            SegmentAccessRights::TSS_AVAIL | SegmentAccessRights::PRESENT,
        );
        let gdt = [
            0,
            0x00af_9b00_0000_ffff,
            0x00cf_9300_0000_ffff,
            tss.raw(),
            0xffff_ffff,
        ];
        let table = DescriptorTable::from_slice(&gdt);
        let segments = HostSegments::decode(
            &table,
            SegmentSelector::new(0, Ring::Ring0),
            SegmentSelector::new(2, Ring::Ring0),
            SegmentSelector::new(0, Ring::Ring0),
            SegmentSelector::new(3, Ring::Ring0),
        );

        assert!(!segments.fs.is_usable());
        assert!(!segments.ldt.is_usable());
        assert!(segments.gs.is_usable());
        assert_eq!(segments.gs.limit, 0xffff_ffff);
        assert_eq!(segments.tss.base, 0xffff_ffff_8000_1000);
        assert_eq!(segments.tss.limit, 0x67);
    }

    #[test]
    fn test_context_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HostContext>();
    }

    #[test]
    fn test_default_is_unusable() {
        let ctx = HostContext::default();
        assert!(!ctx.segments.tss.is_usable());
        assert_eq!(ctx.gdt.limit, 0);
    }
}
