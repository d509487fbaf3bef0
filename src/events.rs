//! Pending exception/interrupt/NMI storage of a virtual CPU.
//!
//! The state is owned by the thread running the virtual CPU. Every mutation
//! takes `&mut self`, so sharing one [`VcpuEvents`] between threads requires
//! the caller to wrap it in a lock; unsynchronized concurrent mutation does
//! not compile.

numeric_enum_macro::numeric_enum! {
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Architectural exception vectors. (SDM Vol. 3A, Section 6.3.1)
pub enum ExceptionVector {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    X87FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
    Virtualization = 20,
    ControlProtection = 21,
}
}

/// Returns `true` if `vector` is raised by an instruction (`INT3`, `INTO`)
/// and must be re-delivered as a software exception.
pub fn exception_is_soft(vector: u8) -> bool {
    vector == ExceptionVector::Breakpoint as u8 || vector == ExceptionVector::Overflow as u8
}

/// A queued exception.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingException {
    pub pending: bool,
    pub vector: u8,
    pub error_code: Option<u32>,
}

/// A queued external or software interrupt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingInterrupt {
    pub pending: bool,
    pub vector: u8,
    /// Delivered as a software interrupt (`INT n`) rather than an external one.
    pub soft: bool,
}

/// Events of one virtual CPU that still have to be delivered to the guest.
///
/// Flags are cleared explicitly and never expire.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VcpuEvents {
    pub exception: PendingException,
    pub interrupt: PendingInterrupt,
    pub nmi_injected: bool,
}

impl VcpuEvents {
    pub const fn new() -> Self {
        Self {
            exception: PendingException {
                pending: false,
                vector: 0,
                error_code: None,
            },
            interrupt: PendingInterrupt {
                pending: false,
                vector: 0,
                soft: false,
            },
            nmi_injected: false,
        }
    }

    /// Queues exception `vector`, replacing any exception already queued.
    pub fn queue_exception(&mut self, vector: u8, error_code: Option<u32>) {
        trace!("queue exception {vector:#x} err {error_code:x?}");
        self.exception = PendingException {
            pending: true,
            vector,
            error_code,
        };
    }

    /// Queues a `#GP` with `error_code`.
    pub fn inject_gp(&mut self, error_code: u32) {
        self.queue_exception(ExceptionVector::GeneralProtection as u8, Some(error_code));
    }

    pub fn clear_exception_queue(&mut self) {
        self.exception.pending = false;
    }

    pub fn queue_interrupt(&mut self, vector: u8, soft: bool) {
        trace!("queue interrupt {vector:#x} soft {soft}");
        self.interrupt = PendingInterrupt {
            pending: true,
            vector,
            soft,
        };
    }

    pub fn clear_interrupt_queue(&mut self) {
        self.interrupt.pending = false;
    }

    pub fn set_nmi_injected(&mut self, injected: bool) {
        self.nmi_injected = injected;
    }

    /// Whether an event was in flight and must be replayed on the next entry.
    pub fn needs_reinjection(&self) -> bool {
        self.exception.pending || self.interrupt.pending || self.nmi_injected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_has_nothing_pending() {
        let events = VcpuEvents::new();
        assert!(!events.needs_reinjection());
        assert_eq!(events, VcpuEvents::default());
    }

    #[test]
    fn test_queue_interrupt_needs_reinjection() {
        let mut events = VcpuEvents::new();
        events.queue_interrupt(0x20, false);
        assert!(events.needs_reinjection());
        assert_eq!(
            events.interrupt,
            PendingInterrupt {
                pending: true,
                vector: 0x20,
                soft: false
            }
        );

        events.clear_interrupt_queue();
        assert!(!events.needs_reinjection());
    }

    #[test]
    fn test_soft_interrupt_flag_kept() {
        let mut events = VcpuEvents::new();
        events.queue_interrupt(0x80, true);
        assert!(events.interrupt.soft);
        assert_eq!(events.interrupt.vector, 0x80);
    }

    #[test]
    fn test_clear_interrupt_keeps_exception() {
        let mut events = VcpuEvents::new();
        events.queue_exception(ExceptionVector::PageFault as u8, Some(2));
        events.queue_interrupt(0x30, false);
        events.clear_interrupt_queue();
        assert!(events.needs_reinjection());

        events.clear_exception_queue();
        assert!(!events.needs_reinjection());
    }

    #[test]
    fn test_nmi_injected_needs_reinjection() {
        let mut events = VcpuEvents::new();
        events.set_nmi_injected(true);
        assert!(events.needs_reinjection());
        events.set_nmi_injected(false);
        assert!(!events.needs_reinjection());
    }

    #[test]
    fn test_inject_gp() {
        let mut events = VcpuEvents::new();
        events.inject_gp(0);
        assert_eq!(
            events.exception,
            PendingException {
                pending: true,
                vector: 13,
                error_code: Some(0)
            }
        );
    }

    #[test]
    fn test_exception_is_soft() {
        assert!(exception_is_soft(3));
        assert!(exception_is_soft(4));
        assert!(!exception_is_soft(0));
        assert!(!exception_is_soft(13));
        assert!(!exception_is_soft(0x80));
    }

    #[test]
    fn test_exception_vector_conversion() {
        assert_eq!(
            ExceptionVector::try_from(13u8),
            Ok(ExceptionVector::GeneralProtection)
        );
        assert_eq!(ExceptionVector::try_from(9u8), Err(9));
        assert_eq!(u8::from(ExceptionVector::PageFault), 14);
    }
}
