//! Synchronous cross-processor function calls.
//!
//! [`CrossCallDispatcher::run_on_cpus`] runs a function on one or all online
//! CPUs and returns only after every target finished it. It is the rendezvous
//! the vCPU engine uses before resuming guests after a change that every CPU
//! must observe (VPID/EPT invalidation, vCPU migration).
//!
//! Requests travel through per-CPU mailboxes. The platform delivers an IPI to
//! each remote target, and its IPI handler calls
//! [`CrossCallDispatcher::handle_ipi`], which runs the queued functions with
//! interrupts disabled, so the target cannot enter a guest while the function
//! runs. Each target then stays in the handler until all targets finished,
//! and the caller returns only after every target has left. Cross calls on
//! one dispatcher are serialized.
//!
//! The function must not itself call `run_on_cpus`: nested rendezvous are not
//! supported and are not detected.

use alloc::collections::VecDeque;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

use bit_field::BitField;
use spin::Mutex;

use crate::error::{HostCpuError, Result};
use crate::hal::{MAX_CPUS, PreemptGuard, current_cpu_id};

/// The CPUs a cross call runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcallTarget {
    /// Every online CPU, including the caller's.
    All,
    /// Exactly one CPU.
    Cpu(usize),
}

/// A set of physical CPU ids below [`MAX_CPUS`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// A mask holding only `cpu`. `None` if `cpu` is out of range.
    pub fn single(cpu: usize) -> Option<Self> {
        (cpu < MAX_CPUS).then(|| Self(1 << cpu))
    }

    pub fn insert(&mut self, cpu: usize) {
        self.0.set_bit(cpu, true);
    }

    pub fn remove(&mut self, cpu: usize) {
        self.0.set_bit(cpu, false);
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0.get_bit(cpu)
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CPUS).filter(move |&cpu| self.contains(cpu))
    }
}

impl FromIterator<usize> for CpuMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for cpu in iter {
            mask.insert(cpu);
        }
        mask
    }
}

/// CPU enumeration and IPI delivery, provided by the platform.
pub trait CpuTopology {
    /// CPUs currently able to take cross calls.
    fn online_cpus(&self) -> CpuMask;

    /// Interrupts `cpu` so that it calls [`CrossCallDispatcher::handle_ipi`].
    fn send_ipi(&self, cpu: usize);
}

/// A latch released once every target has counted down.
struct Countdown {
    remaining: AtomicUsize,
}

impl Countdown {
    fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    fn count_down(&self) {
        // Release: publishes everything the target wrote while running.
        self.remaining.fetch_sub(1, Ordering::Release);
    }

    fn is_released(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    fn wait(&self) {
        while !self.is_released() {
            spin_loop();
        }
    }
}

/// The two latches of one cross call.
///
/// `done` opens once every target returned from the function; no target
/// leaves before that. `exited` opens once every target stopped looking at
/// `done`, after which the caller's frame may go away.
struct Rendezvous {
    done: Countdown,
    exited: Countdown,
}

impl Rendezvous {
    fn new(targets: usize) -> Self {
        Self {
            done: Countdown::new(targets),
            exited: Countdown::new(targets),
        }
    }

    /// Counts the current CPU as finished and holds it until all targets are.
    fn arrive(&self) {
        self.done.count_down();
        self.done.wait();
        self.exited.count_down();
    }
}

/// A function queued for one target CPU.
///
/// Both pointers reference the caller's stack frame, which stays alive until
/// every target has left the rendezvous.
#[derive(Clone, Copy)]
struct CrossCallRequest {
    call: unsafe fn(*const (), usize),
    func: *const (),
    rendezvous: *const Rendezvous,
}

// SAFETY: `func` points to a `Sync` closure and `rendezvous` to atomic latches.
unsafe impl Send for CrossCallRequest {}

impl CrossCallRequest {
    fn new<F: Fn(usize) + Sync>(func: &F, rendezvous: &Rendezvous) -> Self {
        unsafe fn call<F: Fn(usize) + Sync>(func: *const (), cpu: usize) {
            // SAFETY: `func` was created from a `&F` in `CrossCallRequest::new`.
            let func = unsafe { &*(func as *const F) };
            func(cpu)
        }

        Self {
            call: call::<F>,
            func: func as *const F as *const (),
            rendezvous,
        }
    }

    /// Runs the function, then waits for the other targets.
    ///
    /// # Safety
    ///
    /// The dispatching call must still be waiting on the rendezvous.
    unsafe fn run(self, cpu: usize) {
        unsafe {
            (self.call)(self.func, cpu);
            (*self.rendezvous).arrive();
        }
    }
}

/// Per-CPU mailboxes and the rendezvous logic on top of a [`CpuTopology`].
pub struct CrossCallDispatcher<T: CpuTopology> {
    topology: T,
    mailboxes: [Mutex<VecDeque<CrossCallRequest>>; MAX_CPUS],
    // One cross call in flight at a time; targets held in a rendezvous cannot
    // serve another one.
    in_flight: Mutex<()>,
}

impl<T: CpuTopology> CrossCallDispatcher<T> {
    pub const fn new(topology: T) -> Self {
        Self {
            topology,
            mailboxes: [const { Mutex::new(VecDeque::new()) }; MAX_CPUS],
            in_flight: Mutex::new(()),
        }
    }

    pub fn topology(&self) -> &T {
        &self.topology
    }

    fn resolve(&self, target: XcallTarget) -> Result<CpuMask> {
        let online = self.topology.online_cpus();
        match target {
            XcallTarget::All => Ok(online),
            XcallTarget::Cpu(cpu) if online.contains(cpu) => {
                CpuMask::single(cpu).ok_or(HostCpuError::InvalidCpu(cpu))
            }
            XcallTarget::Cpu(cpu) => Err(HostCpuError::InvalidCpu(cpu)),
        }
    }

    /// Runs `func` on every CPU of `target` and waits until all of them have
    /// returned from it. `func` receives the id of the CPU it runs on.
    ///
    /// This is a barrier: a target that finished `func` stays in its IPI
    /// handler, and cannot resume a guest or take other work, until every
    /// target finished. Preemption is disabled on the calling CPU for the
    /// whole call. When the call returns, every memory write `func` made on
    /// any target is visible to the caller.
    ///
    /// Targets are checked before anything is queued: an offline or
    /// out-of-range CPU fails with [`HostCpuError::InvalidCpu`] and `func`
    /// runs nowhere. Past that check the call cannot fail; it keeps waiting
    /// until every target completed.
    pub fn run_on_cpus<F: Fn(usize) + Sync>(&self, target: XcallTarget, func: &F) -> Result {
        let targets = self.resolve(target)?;

        let _preempt = PreemptGuard::new();
        let this_cpu = current_cpu_id();

        // Keep serving our own mailbox while waiting, or two CPUs calling
        // each other would wait forever.
        let _in_flight = loop {
            if let Some(guard) = self.in_flight.try_lock() {
                break guard;
            }
            self.drain_mailbox(this_cpu);
            spin_loop();
        };

        let rendezvous = Rendezvous::new(targets.count());
        let request = CrossCallRequest::new(func, &rendezvous);

        trace!("cpu {this_cpu}: cross call to {:#x}", targets.bits());
        for cpu in targets.iter().filter(|&cpu| cpu != this_cpu) {
            self.mailboxes[cpu].lock().push_back(request);
            self.topology.send_ipi(cpu);
        }
        if targets.contains(this_cpu) {
            func(this_cpu);
            rendezvous.done.count_down();
        }

        while !rendezvous.done.is_released() {
            self.drain_mailbox(this_cpu);
            spin_loop();
        }
        if targets.contains(this_cpu) {
            rendezvous.exited.count_down();
        }
        rendezvous.exited.wait();
        Ok(())
    }

    /// IPI handler entry: runs every request queued for the current CPU.
    ///
    /// The platform calls this from its cross-call IPI handler with
    /// interrupts disabled.
    pub fn handle_ipi(&self) {
        self.drain_mailbox(current_cpu_id());
    }

    fn drain_mailbox(&self, cpu: usize) {
        loop {
            // A busy mailbox is either being filled by a sender, which sends
            // another IPI once done, or drained by the code this IPI
            // interrupted, which keeps draining after we return.
            let Some(mut mailbox) = self.mailboxes[cpu].try_lock() else {
                return;
            };
            let request = mailbox.pop_front();
            drop(mailbox);

            match request {
                // SAFETY: the caller of `run_on_cpus` spins until every
                // target left the rendezvous this request points to.
                Some(request) => unsafe { request.run(cpu) },
                None => return,
            }
        }
    }
}
