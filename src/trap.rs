//! Fault-trap regions around single instructions.
//!
//! A protected instruction runs while a [`TrapRecord`] is published in the
//! current CPU's trap slot. If the instruction raises one of the vectors the
//! record accepts, the host exception handler calls [`handle_trap`], which
//! marks the record as faulted and moves the saved instruction pointer to the
//! recovery address right after the instruction. The protected code then reads
//! the outcome from the record instead of taking the host down.
//!
//! The record is armed and disarmed by [`OnTrap`], so the slot is restored on
//! every exit path, including unwinding.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use bitflags::bitflags;

use crate::hal::{MAX_CPUS, PreemptGuard, current_cpu_id};

bitflags! {
    /// Exception vectors a trap region recovers from, one bit per vector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrapVectors: u32 {
        /// `#UD`
        const INVALID_OPCODE = 1 << 6;
        /// `#GP`
        const GENERAL_PROTECTION = 1 << 13;
        /// `#PF`
        const PAGE_FAULT = 1 << 14;
        /// Faults raised by `RDMSR`/`WRMSR`.
        const MSR_ACCESS = Self::INVALID_OPCODE.bits() | Self::GENERAL_PROTECTION.bits();
    }
}

impl TrapVectors {
    fn accepts(self, vector: u8) -> bool {
        vector < 32 && self.bits() & (1 << vector) != 0
    }
}

/// Book-keeping of one trap region. Lives on the stack of the protected code.
///
/// The address fields are written by the protected assembly itself, right
/// before the instruction executes, at the offsets given by
/// [`TrapRecord::FAULT_IP_OFFSET`] and [`TrapRecord::FIXUP_IP_OFFSET`].
#[repr(C)]
#[derive(Debug)]
pub struct TrapRecord {
    fault_ip: Cell<usize>,
    fixup_ip: Cell<usize>,
    vectors: TrapVectors,
    fault: Cell<Option<u8>>,
    prev: Cell<*mut TrapRecord>,
}

impl TrapRecord {
    pub const FAULT_IP_OFFSET: usize = core::mem::offset_of!(TrapRecord, fault_ip);
    pub const FIXUP_IP_OFFSET: usize = core::mem::offset_of!(TrapRecord, fixup_ip);

    pub const fn new(vectors: TrapVectors) -> Self {
        Self {
            fault_ip: Cell::new(0),
            fixup_ip: Cell::new(0),
            vectors,
            fault: Cell::new(None),
            prev: Cell::new(ptr::null_mut()),
        }
    }

    /// Pointer handed to the protected assembly.
    pub fn as_ptr(&self) -> *mut TrapRecord {
        self as *const Self as *mut Self
    }

    /// The vector that aborted the protected instruction, if any.
    pub fn fault(&self) -> Option<u8> {
        self.fault.get()
    }

    #[cfg(test)]
    pub(crate) fn set_addresses(&self, fault_ip: usize, fixup_ip: usize) {
        self.fault_ip.set(fault_ip);
        self.fixup_ip.set(fixup_ip);
    }
}

static TRAP_SLOTS: [AtomicPtr<TrapRecord>; MAX_CPUS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS];

fn trap_slot(cpu: usize) -> &'static AtomicPtr<TrapRecord> {
    assert!(cpu < MAX_CPUS, "CPU id {cpu} exceeds MAX_CPUS");
    &TRAP_SLOTS[cpu]
}

/// An armed trap region. Disarms on drop.
///
/// Preemption stays disabled while the region is armed, so the protected
/// instruction runs on the CPU whose slot holds the record.
pub struct OnTrap<'a> {
    record: &'a TrapRecord,
    cpu: usize,
    _preempt: PreemptGuard,
}

impl<'a> OnTrap<'a> {
    pub fn arm(record: &'a TrapRecord) -> Self {
        let preempt = PreemptGuard::new();
        let cpu = current_cpu_id();
        let slot = trap_slot(cpu);
        record.fault.set(None);
        record.prev.set(slot.load(Ordering::Acquire));
        slot.store(record.as_ptr(), Ordering::Release);
        Self {
            record,
            cpu,
            _preempt: preempt,
        }
    }
}

impl Drop for OnTrap<'_> {
    fn drop(&mut self) {
        trap_slot(self.cpu).store(self.record.prev.get(), Ordering::Release);
    }
}

/// Recovery hook for the host exception handler.
///
/// `vector` is the exception being handled and `rip` the saved instruction
/// pointer of the interrupted context. Returns `true` if the exception was
/// raised by an armed protected instruction on this CPU; `rip` then points to
/// the recovery address and the handler must return to the interrupted
/// context. Returns `false`, leaving `rip` untouched, for every other
/// exception.
pub fn handle_trap(vector: u8, rip: &mut usize) -> bool {
    let cpu = current_cpu_id();
    let Some(slot) = TRAP_SLOTS.get(cpu) else {
        return false;
    };
    let ptr = slot.load(Ordering::Acquire);
    if ptr.is_null() {
        return false;
    }
    // SAFETY: a published record is borrowed by a live `OnTrap` on this CPU,
    // which unpublishes it before the borrow ends.
    let record = unsafe { &*ptr };
    if record.fault_ip.get() != *rip || !record.vectors.accepts(vector) {
        return false;
    }
    record.fault.set(Some(vector));
    *rip = record.fixup_ip.get();
    debug!("cpu {cpu}: contained exception {vector} at {:#x}", record.fault_ip.get());
    true
}

/// Whether the current CPU has an armed trap region.
pub fn is_armed() -> bool {
    !trap_slot(current_cpu_id())
        .load(Ordering::Acquire)
        .is_null()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_exception_is_not_handled() {
        let mut rip = 0x1000;
        assert!(!is_armed());
        assert!(!handle_trap(13, &mut rip));
        assert_eq!(rip, 0x1000);
    }

    #[test]
    fn test_armed_fault_is_redirected() {
        let record = TrapRecord::new(TrapVectors::MSR_ACCESS);
        {
            let _trap = OnTrap::arm(&record);
            record.set_addresses(0x2000, 0x2002);
            assert!(is_armed());

            let mut rip = 0x2000;
            assert!(handle_trap(13, &mut rip));
            assert_eq!(rip, 0x2002);
        }
        assert_eq!(record.fault(), Some(13));
        assert!(!is_armed());
    }

    #[test]
    fn test_foreign_address_is_not_handled() {
        let record = TrapRecord::new(TrapVectors::MSR_ACCESS);
        let _trap = OnTrap::arm(&record);
        record.set_addresses(0x2000, 0x2002);

        let mut rip = 0x3000;
        assert!(!handle_trap(13, &mut rip));
        assert_eq!(rip, 0x3000);
        assert_eq!(record.fault(), None);
    }

    #[test]
    fn test_unaccepted_vector_is_not_handled() {
        let record = TrapRecord::new(TrapVectors::MSR_ACCESS);
        let _trap = OnTrap::arm(&record);
        record.set_addresses(0x2000, 0x2002);

        let mut rip = 0x2000;
        assert!(!handle_trap(14, &mut rip));
        assert_eq!(rip, 0x2000);
        assert!(handle_trap(6, &mut rip));
        assert_eq!(record.fault(), Some(6));
    }

    #[test]
    fn test_nested_regions_restore_outer() {
        let outer = TrapRecord::new(TrapVectors::GENERAL_PROTECTION);
        let _outer_trap = OnTrap::arm(&outer);
        outer.set_addresses(0x4000, 0x4002);
        {
            let inner = TrapRecord::new(TrapVectors::GENERAL_PROTECTION);
            let _inner_trap = OnTrap::arm(&inner);
            inner.set_addresses(0x5000, 0x5002);

            let mut rip = 0x4000;
            assert!(!handle_trap(13, &mut rip));
        }

        let mut rip = 0x4000;
        assert!(handle_trap(13, &mut rip));
        assert_eq!(rip, 0x4002);
        assert_eq!(outer.fault(), Some(13));
    }

    #[test]
    fn test_rearm_clears_previous_fault() {
        let record = TrapRecord::new(TrapVectors::MSR_ACCESS);
        {
            let _trap = OnTrap::arm(&record);
            record.set_addresses(0x2000, 0x2002);
            let mut rip = 0x2000;
            assert!(handle_trap(13, &mut rip));
        }
        let _trap = OnTrap::arm(&record);
        assert_eq!(record.fault(), None);
    }

    #[test]
    fn test_trap_vectors_accepts() {
        assert!(TrapVectors::MSR_ACCESS.accepts(13));
        assert!(TrapVectors::MSR_ACCESS.accepts(6));
        assert!(!TrapVectors::MSR_ACCESS.accepts(14));
        assert!(!TrapVectors::all().accepts(200));
    }
}
