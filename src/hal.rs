//! Interfaces the host kernel must provide to this crate.

/// Per-CPU services of the host kernel.
///
/// Implement it once in the hypervisor with
/// `#[crate_interface::impl_interface]`.
#[crate_interface::def_interface]
pub trait HostCpuIf {
    /// Index of the physical CPU executing the caller, in `0..MAX_CPUS`.
    fn current_cpu_id() -> usize;

    /// Disables preemption of the current thread. Calls nest.
    fn preempt_disable();

    /// Re-enables preemption disabled by [`HostCpuIf::preempt_disable`].
    fn preempt_enable();
}

/// Maximum number of physical CPUs the per-CPU tables are sized for.
pub const MAX_CPUS: usize = 64;

pub(crate) fn current_cpu_id() -> usize {
    crate_interface::call_interface!(HostCpuIf::current_cpu_id)
}

/// Keeps preemption disabled for as long as it is alive.
pub struct PreemptGuard {
    // Not `Send`: the guard must be dropped on the CPU that created it.
    _not_send: core::marker::PhantomData<*const ()>,
}

impl PreemptGuard {
    pub fn new() -> Self {
        crate_interface::call_interface!(HostCpuIf::preempt_disable);
        Self {
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        crate_interface::call_interface!(HostCpuIf::preempt_enable);
    }
}
