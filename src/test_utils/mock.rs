//! Mock host kernel: every test thread acts as its own physical CPU.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, mpsc};
use std::thread::JoinHandle;

use crate::hal::{HostCpuIf, MAX_CPUS, current_cpu_id};
use crate::xcall::{CpuMask, CpuTopology, CrossCallDispatcher};

static CPU_IDS_IN_USE: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// A CPU id owned by one thread, returned when the thread exits.
struct CpuIdLease(usize);

impl CpuIdLease {
    fn acquire() -> Self {
        loop {
            for (id, in_use) in CPU_IDS_IN_USE.iter().enumerate() {
                if in_use
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Self(id);
                }
            }
            std::thread::yield_now();
        }
    }
}

impl Drop for CpuIdLease {
    fn drop(&mut self) {
        CPU_IDS_IN_USE[self.0].store(false, Ordering::Release);
    }
}

std::thread_local! {
    static CPU_ID: CpuIdLease = CpuIdLease::acquire();
    static PREEMPT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct MockHostCpuIf;

#[crate_interface::impl_interface]
impl HostCpuIf for MockHostCpuIf {
    fn current_cpu_id() -> usize {
        CPU_ID.with(|lease| lease.0)
    }

    fn preempt_disable() {
        PREEMPT_DEPTH.with(|depth| depth.set(depth.get() + 1));
    }

    fn preempt_enable() {
        PREEMPT_DEPTH.with(|depth| {
            assert!(depth.get() > 0, "unbalanced preempt_enable");
            depth.set(depth.get() - 1);
        });
    }
}

/// Preemption-disable nesting depth of the calling thread.
pub fn preempt_depth() -> usize {
    PREEMPT_DEPTH.with(|depth| depth.get())
}

/// Topology whose IPIs are only counted; worker threads poll their mailbox.
pub struct MockTopology {
    online: AtomicU64,
    ipis: [AtomicUsize; MAX_CPUS],
}

impl MockTopology {
    fn new() -> Self {
        Self {
            online: AtomicU64::new(0),
            ipis: [const { AtomicUsize::new(0) }; MAX_CPUS],
        }
    }

    pub fn ipis_sent(&self, cpu: usize) -> usize {
        self.ipis[cpu].load(Ordering::Relaxed)
    }

    pub fn total_ipis(&self) -> usize {
        self.ipis.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }
}

impl CpuTopology for MockTopology {
    fn online_cpus(&self) -> CpuMask {
        CpuMask::from_bits(self.online.load(Ordering::Acquire))
    }

    fn send_ipi(&self, cpu: usize) {
        self.ipis[cpu].fetch_add(1, Ordering::Relaxed);
    }
}

// CPU ids are a bounded resource; keep one set of worker threads at a time.
static CPU_THREADS_LOCK: Mutex<()> = Mutex::new(());

/// Worker threads standing in for remote CPUs. The thread that spawns them
/// is online as well.
pub struct CpuThreads {
    dispatcher: Arc<CrossCallDispatcher<MockTopology>>,
    worker_ids: Vec<usize>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    _serial: MutexGuard<'static, ()>,
}

impl CpuThreads {
    pub fn spawn(count: usize) -> Self {
        let serial = CPU_THREADS_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let dispatcher = Arc::new(CrossCallDispatcher::new(MockTopology::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (id_tx, id_rx) = mpsc::channel();

        let workers = (0..count)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let stop = stop.clone();
                let id_tx = id_tx.clone();
                std::thread::spawn(move || {
                    id_tx.send(current_cpu_id()).unwrap();
                    while !stop.load(Ordering::Acquire) {
                        dispatcher.handle_ipi();
                        std::thread::yield_now();
                    }
                })
            })
            .collect();
        let worker_ids: Vec<usize> = (0..count).map(|_| id_rx.recv().unwrap()).collect();

        let mut online: CpuMask = worker_ids.iter().copied().collect();
        online.insert(current_cpu_id());
        dispatcher
            .topology()
            .online
            .store(online.bits(), Ordering::Release);

        Self {
            dispatcher,
            worker_ids,
            stop,
            workers,
            _serial: serial,
        }
    }

    pub fn dispatcher(&self) -> &CrossCallDispatcher<MockTopology> {
        &self.dispatcher
    }

    pub fn shared_dispatcher(&self) -> Arc<CrossCallDispatcher<MockTopology>> {
        self.dispatcher.clone()
    }

    pub fn worker_ids(&self) -> &[usize] {
        &self.worker_ids
    }
}

impl Drop for CpuThreads {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
