use core::fmt;

use axerrno::{AxError, ax_err_type};

use crate::events::ExceptionVector;

/// The processor exception that aborted a protected instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// `#GP`: reserved or unimplemented MSR, reserved bits set, or CPL > 0.
    GeneralProtection,
    /// `#UD`: the instruction itself is not supported.
    InvalidOpcode,
    /// Any other vector accepted by the trap region.
    Other(u8),
}

impl FaultKind {
    pub(crate) fn from_vector(vector: u8) -> Self {
        match ExceptionVector::try_from(vector) {
            Ok(ExceptionVector::GeneralProtection) => Self::GeneralProtection,
            Ok(ExceptionVector::InvalidOpcode) => Self::InvalidOpcode,
            _ => Self::Other(vector),
        }
    }
}

/// Errors reported by the host CPU primitives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCpuError {
    /// An MSR access raised a processor exception that was contained by the
    /// trap region.
    HardwareFault { msr: u32, kind: FaultKind },
    /// A cross-call target is out of range or not online.
    InvalidCpu(usize),
}

impl fmt::Display for HostCpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardwareFault { msr, kind } => {
                write!(f, "access to MSR {msr:#x} faulted ({kind:?})")
            }
            Self::InvalidCpu(cpu) => write!(f, "CPU {cpu} is not a valid cross-call target"),
        }
    }
}

impl From<HostCpuError> for AxError {
    fn from(err: HostCpuError) -> Self {
        match err {
            // Every contained fault is reported as EINVAL, whatever its vector.
            HostCpuError::HardwareFault { .. } => ax_err_type!(InvalidInput),
            HostCpuError::InvalidCpu(_) => ax_err_type!(InvalidInput),
        }
    }
}

/// Result type of the host CPU primitives.
pub type Result<T = ()> = core::result::Result<T, HostCpuError>;
