//! Scenario tests for the host CPU layer.
//!
//! They run on an x86_64 Linux host at CPL3, where privileged instructions
//! fault; `signal` turns those faults back into trap-region recoveries.

#[cfg(target_os = "linux")]
mod msr_fault;
