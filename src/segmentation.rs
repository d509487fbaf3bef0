//! Segment descriptor decoding.
//!
//! A legacy descriptor splits its base and limit across the 8-byte entry:
//!
//! ```text
//!  63    56 55  52 51  48 47      40 39    32 31          16 15           0
//! | base2  | flags| lim1 |  access  |  base1 |     base0    |    limit0    |
//! ```
//!
//! `base = base0 | base1 << 16 | base2 << 24`, `limit = limit0 | lim1 << 16`.
//! In IA-32e mode, system descriptors (LDT, TSS) take two slots and the second
//! one holds base bits 32..64.

use bit_field::BitField;
use bitflags::bitflags;
use x86::segmentation::SegmentSelector;
use x86_64::structures::DescriptorTablePointer;

use crate::regs;

bitflags! {
    /// Access rights of a segment, in the layout of the VMCS access-rights
    /// fields (descriptor bits 40..56 shifted down by 40).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        const ACCESSED = 1 << 0;
        const WRITABLE = 1 << 1;
        const CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Code or data segment (S = 1); clear for system descriptors.
        const CODE_DATA = 1 << 4;
        const DPL_RING_3 = 3 << 5;
        const PRESENT = 1 << 7;
        const AVAILABLE = 1 << 12;
        const LONG_MODE = 1 << 13;
        const DB = 1 << 14;
        const GRANULARITY = 1 << 15;
        /// Not a descriptor bit: marks a segment loaded with a null selector.
        const UNUSABLE = 1 << 16;

        const LDT = 0b0010;
        const TSS_AVAIL = 0b1001;
        const TSS_BUSY = 0b1011;
    }
}

impl SegmentAccessRights {
    const DESCRIPTOR_MASK: u32 = 0xf0ff;

    /// Descriptor privilege level.
    pub fn dpl(&self) -> u8 {
        self.bits().get_bits(5..7) as u8
    }

    /// The 4-bit type field.
    pub fn type_field(&self) -> u8 {
        self.bits().get_bits(0..4) as u8
    }

    /// Extracts the access rights of a raw descriptor.
    pub fn from_descriptor(desc: u64) -> Self {
        Self::from_bits_truncate(desc.get_bits(40..56) as u32 & Self::DESCRIPTOR_MASK)
    }
}

/// One raw 8-byte GDT/LDT entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Encodes a descriptor. `limit` is truncated to 20 bits; the
    /// `UNUSABLE` pseudo-flag and the limit nibble of `access` are ignored.
    pub fn new(base: u32, limit: u32, access: SegmentAccessRights) -> Self {
        let base = base as u64;
        let limit = limit as u64;
        let access = (access.bits() & SegmentAccessRights::DESCRIPTOR_MASK) as u64;
        let mut raw = 0u64;
        raw.set_bits(0..16, limit.get_bits(0..16));
        raw.set_bits(16..32, base.get_bits(0..16));
        raw.set_bits(32..40, base.get_bits(16..24));
        raw.set_bits(40..56, access);
        raw.set_bits(48..52, limit.get_bits(16..20));
        raw.set_bits(56..64, base.get_bits(24..32));
        Self(raw)
    }

    /// Segment base, reassembled from its three fields.
    pub fn base(self) -> u32 {
        let base0 = self.0.get_bits(16..32);
        let base1 = self.0.get_bits(32..40);
        let base2 = self.0.get_bits(56..64);
        (base0 | base1 << 16 | base2 << 24) as u32
    }

    /// The raw 20-bit limit, in bytes or pages depending on granularity.
    pub fn limit(self) -> u32 {
        let limit0 = self.0.get_bits(0..16);
        let limit1 = self.0.get_bits(48..52);
        (limit0 | limit1 << 16) as u32
    }

    /// The limit in bytes: page-granular limits are scaled to 4 KiB units.
    pub fn byte_limit(self) -> u32 {
        if self.access_rights().contains(SegmentAccessRights::GRANULARITY) {
            self.limit() << 12 | 0xfff
        } else {
            self.limit()
        }
    }

    pub fn access_rights(self) -> SegmentAccessRights {
        SegmentAccessRights::from_descriptor(self.0)
    }

    pub fn is_present(self) -> bool {
        self.access_rights().contains(SegmentAccessRights::PRESENT)
    }

    /// System descriptors (LDT, TSS, gates) have S = 0.
    pub fn is_system(self) -> bool {
        !self.access_rights().contains(SegmentAccessRights::CODE_DATA)
    }
}

/// Borrowed view of a descriptor table.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorTable<'a> {
    entries: &'a [u64],
}

impl<'a> DescriptorTable<'a> {
    pub const fn from_slice(entries: &'a [u64]) -> Self {
        Self { entries }
    }

    /// Views the table described by a captured GDTR/IDTR.
    ///
    /// # Safety
    ///
    /// `pointer` must describe mapped memory that stays unchanged for `'a`.
    pub unsafe fn from_pointer(pointer: &DescriptorTablePointer) -> Self {
        let len = (pointer.limit as usize + 1) / size_of::<u64>();
        Self {
            entries: unsafe { core::slice::from_raw_parts(pointer.base.as_ptr(), len) },
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The descriptor `selector` refers to. `None` for LDT selectors and
    /// out-of-range indices.
    pub fn entry(&self, selector: SegmentSelector) -> Option<SegmentDescriptor> {
        if selector.contains(SegmentSelector::TI_LDT) {
            return None;
        }
        self.entries
            .get(selector.index() as usize)
            .copied()
            .map(SegmentDescriptor::from_raw)
    }

    /// Full 64-bit base of the 16-byte system descriptor at `selector`.
    /// `None` if the descriptor is missing, not present, or not a system
    /// descriptor.
    pub fn system_base(&self, selector: SegmentSelector) -> Option<u64> {
        let desc = self.entry(selector)?;
        if !desc.is_present() || !desc.is_system() {
            return None;
        }
        let high = *self.entries.get(selector.index() as usize + 1)?;
        Some(desc.base() as u64 | high.get_bits(0..32) << 32)
    }
}

/// A host segment register as seen through its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: SegmentSelector,
    pub base: u64,
    pub limit: u32,
    pub access_rights: SegmentAccessRights,
}

impl Segment {
    pub const fn invalid() -> Self {
        Self {
            selector: SegmentSelector::empty(),
            base: 0,
            limit: 0,
            access_rights: SegmentAccessRights::UNUSABLE,
        }
    }

    /// Decodes the segment `selector` loads from `table`.
    ///
    /// Null selectors and selectors that do not resolve to a present
    /// descriptor give an unusable segment. System descriptors get their full
    /// 64-bit base.
    pub fn from_selector(selector: SegmentSelector, table: &DescriptorTable) -> Self {
        let unusable = Self {
            selector,
            ..Self::invalid()
        };
        if selector.index() == 0 {
            return unusable;
        }
        let Some(desc) = table.entry(selector) else {
            return unusable;
        };
        if !desc.is_present() {
            return unusable;
        }
        let base = if desc.is_system() {
            table.system_base(selector).unwrap_or(desc.base() as u64)
        } else {
            desc.base() as u64
        };
        Self {
            selector,
            base,
            limit: desc.byte_limit(),
            access_rights: desc.access_rights(),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.access_rights.contains(SegmentAccessRights::UNUSABLE)
    }
}

/// Base of the host TSS, read through the live GDT. Zero if TR does not
/// reference a present descriptor.
pub fn tr_base() -> u64 {
    let gdt = regs::sgdt();
    // SAFETY: the GDTR of the running CPU describes its mapped GDT.
    let table = unsafe { DescriptorTable::from_pointer(&gdt) };
    table.system_base(regs::read_tr()).unwrap_or(0)
}
