//! MSR accesses that fault must come back as errors.
//!
//! At CPL3 every `RDMSR`/`WRMSR` raises `#GP`, so any index exercises the
//! recovery path.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::signal::install_fault_handler;
use crate::error::{FaultKind, HostCpuError};
use crate::msr::{Msr, read_msr, write_msr};
use crate::test_utils::mock::{CpuThreads, preempt_depth};
use crate::trap;
use crate::xcall::XcallTarget;

const UNDEFINED_MSR: u32 = 0xdead_beef;

fn gp_fault(msr: u32) -> HostCpuError {
    HostCpuError::HardwareFault {
        msr,
        kind: FaultKind::GeneralProtection,
    }
}

#[test]
fn test_read_undefined_msr_is_contained() {
    install_fault_handler();
    assert_eq!(read_msr(UNDEFINED_MSR), Err(gp_fault(UNDEFINED_MSR)));
    assert!(!trap::is_armed());
    assert_eq!(preempt_depth(), 0);
}

#[test]
fn test_write_is_contained() {
    install_fault_handler();
    let err = unsafe { write_msr(UNDEFINED_MSR, 0x1234_5678_9abc_def0) };
    assert_eq!(err, Err(gp_fault(UNDEFINED_MSR)));
    let err = unsafe { Msr::IA32_TSC_AUX.try_write(7) };
    assert_eq!(err, Err(gp_fault(Msr::IA32_TSC_AUX as u32)));
}

#[test]
fn test_repeated_faults_leave_no_state_behind() {
    install_fault_handler();
    for _ in 0..100 {
        assert!(Msr::IA32_EFER.try_read().is_err());
    }
    assert!(!trap::is_armed());
    assert_eq!(preempt_depth(), 0);
}

#[test]
fn test_fault_converts_to_invalid_input() {
    install_fault_handler();
    let err: axerrno::AxError = read_msr(UNDEFINED_MSR).unwrap_err().into();
    assert_eq!(
        alloc::format!("{err:?}"),
        alloc::format!("{:?}", axerrno::AxError::InvalidInput)
    );
}

#[test]
fn test_faults_contained_on_every_cpu() {
    install_fault_handler();
    let cpus = CpuThreads::spawn(3);
    let contained = AtomicUsize::new(0);

    cpus.dispatcher()
        .run_on_cpus(XcallTarget::All, &|_| {
            if read_msr(UNDEFINED_MSR) == Err(gp_fault(UNDEFINED_MSR)) {
                contained.fetch_add(1, Ordering::Relaxed);
            }
        })
        .unwrap();
    assert_eq!(contained.load(Ordering::Relaxed), 4);
}

#[test]
#[ignore = "needs CPL0"]
fn test_tsc_aux_round_trip() {
    let saved = Msr::IA32_TSC_AUX.try_read().unwrap();
    unsafe { Msr::IA32_TSC_AUX.try_write(0x2a).unwrap() };
    assert_eq!(read_msr(Msr::IA32_TSC_AUX as u32), Ok(0x2a));
    unsafe { Msr::IA32_TSC_AUX.try_write(saved).unwrap() };
}
