//! Preemptive scheduler implementation
//!
//! One [`Scheduler`] serves every core. Each timer tick (and each yield,
//! which raises the same vector) runs [`Scheduler::schedule`] on the
//! interrupted core: persist the interrupted thread, refresh process and
//! sleep states, pick the highest-priority Ready thread after the core's last
//! round-robin position, and load it into the trap frame the interrupt
//! return restores.
//!
//! Locks, outermost first: `list_lock` (create and reap), the task table
//! (the fast scheduling lock), then the per-TCB/PCB locks. The tick takes
//! only the table and per-block locks, and never allocates or frees while
//! holding the table.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::arch::{CpuOps, InterruptHandler, InterruptRegistrar, Platform, TrapFrame};
use crate::config::{BootEntries, TaskingConfig};
use crate::error::{TaskError, TaskResult};
use crate::per_cpu::{CoreContext, CoreTable};
use crate::process::Pcb;
use crate::signal::constants::SIGSEGV;
use crate::signal::delivery::Delivery;
use crate::signal::signal_exit_code;
use crate::spinlock::SpinLock;
use crate::task::info::{CoreAffinity, ExecutionMode, TaskPriority};
use crate::task::lifecycle::{ProcessOptions, ThreadOptions};
use crate::task::stack::PendingFree;
use crate::task::table::TaskTable;
use crate::task::thread::Tcb;
use crate::task::{Pid, TaskStatus, Tid};

/// Initial arena sizes; the arena grows by doubling
const INITIAL_PROCESSES: usize = 16;
const INITIAL_THREADS: usize = 64;

/// The kernel process owns the boot, idle and cleanup threads
pub const KERNEL_PID: Pid = Pid(0);

pub struct Scheduler {
    pub(crate) config: TaskingConfig,
    pub(crate) platform: Platform,
    pub(crate) entries: BootEntries,
    /// The fast scheduling lock
    pub(crate) tasks: SpinLock<TaskTable>,
    /// Serializes arena growth, creation and reaping
    pub(crate) list_lock: SpinLock<()>,
    pub(crate) cores: CoreTable,
    next_pid: AtomicU64,
    next_tid: AtomicU64,
    /// Panic flag: ticks leave the running context alone
    stopped: AtomicBool,
    cleanup_tid: AtomicU64,
    /// Processes that died with watchers; drained into SIGCHLD by cleanup
    pub(crate) notifications: ArrayQueue<Pid>,
    /// Frees a collaborator refused; retried every cleanup pass
    pub(crate) deferred: SpinLock<Vec<PendingFree>>,
}

impl Scheduler {
    /// Bring up tasking on the boot core.
    ///
    /// Creates the kernel process with its "Main Thread" (the caller's own
    /// context, marked Running on core 0), one idle thread per core and the
    /// cleanup thread.
    pub fn boot(config: TaskingConfig, platform: Platform, entries: BootEntries) -> TaskResult<Arc<Scheduler>> {
        config.validate()?;
        log::info!(
            "Scheduler: booting {:?} with {} core(s)",
            config.architecture,
            config.core_count
        );

        let scheduler = Arc::new(Scheduler {
            config,
            platform,
            entries,
            tasks: SpinLock::new(
                "sched",
                TaskTable::with_capacity(INITIAL_PROCESSES, INITIAL_THREADS + config.core_count),
            ),
            list_lock: SpinLock::new("sched.list", ()),
            cores: CoreTable::new(config.core_count),
            next_pid: AtomicU64::new(KERNEL_PID.0),
            next_tid: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            cleanup_tid: AtomicU64::new(0),
            notifications: ArrayQueue::new(config.notification_capacity),
            deferred: SpinLock::new("sched.deferred", Vec::new()),
        });

        let kernel = scheduler.create_process(ProcessOptions::kernel("Kernel"))?;
        let all = CoreAffinity::all(config.core_count);

        let main = scheduler.create_thread(
            kernel.id(),
            ThreadOptions::new("Main Thread", entries.kernel_main).with_affinity(all),
        )?;
        // The caller is already executing this thread; the first tick saves it
        main.status_cell().store(TaskStatus::Running);
        if let Some(core) = scheduler.cores.get(0) {
            core.set_current(kernel.id(), main.id());
        }

        for id in 0..config.core_count {
            let name = alloc::format!("Idle Thread {}", id);
            let idle = scheduler.create_thread(
                kernel.id(),
                ThreadOptions::new(&name, entries.idle_loop)
                    .with_priority(TaskPriority::Idle)
                    .with_affinity(CoreAffinity::only(id)),
            )?;
            if let Some(core) = scheduler.cores.get(id) {
                core.set_idle(idle.id());
            }
        }

        let cleanup = scheduler.create_thread(
            kernel.id(),
            ThreadOptions::new("Cleanup", entries.cleanup_loop)
                .with_priority(TaskPriority::Low)
                .with_affinity(all),
        )?;
        scheduler.cleanup_tid.store(cleanup.id().0, Ordering::Relaxed);

        log::info!("Scheduler: ready, main thread {}", main.id());
        Ok(scheduler)
    }

    /// Bind the tick and yield vectors to this scheduler
    pub fn register_interrupts(self: &Arc<Self>, registrar: &mut dyn InterruptRegistrar) -> TaskResult<()> {
        let handler: Arc<dyn InterruptHandler> = Arc::new(TickHandler {
            scheduler: Arc::clone(self),
        });
        if !registrar.register(self.config.tick_vector, Arc::clone(&handler)) {
            log::error!("Scheduler: tick vector {:#x} is taken", self.config.tick_vector);
            return Err(TaskError::InvalidState);
        }
        if self.config.yield_vector != self.config.tick_vector && !registrar.register(self.config.yield_vector, handler)
        {
            log::error!("Scheduler: yield vector {:#x} is taken", self.config.yield_vector);
            return Err(TaskError::InvalidState);
        }
        Ok(())
    }

    /// Arm the first time slice on every core
    pub fn start(&self) {
        for core in self.cores.iter() {
            self.platform.timer.one_shot(core.id(), TaskPriority::Normal.time_slice());
        }
        log::info!("Scheduler: started on {} core(s)", self.cores.len());
    }

    /// Stop rescheduling; the context running on each core keeps running
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            log::warn!("Scheduler: stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &TaskingConfig {
        &self.config
    }

    pub fn core(&self, id: usize) -> Option<&CoreContext> {
        self.cores.get(id)
    }

    pub fn cleanup_thread(&self) -> Tid {
        Tid(self.cleanup_tid.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn cpu(&self) -> &dyn CpuOps {
        &*self.platform.cpu
    }

    pub(crate) fn allocate_pid(&self) -> Pid {
        Pid(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn allocate_tid(&self) -> Tid {
        Tid(self.next_tid.fetch_add(1, Ordering::Relaxed))
    }

    // =========================================================================
    // Voluntary entry
    // =========================================================================

    /// Give up the core; runs the same path as a timer tick
    pub fn yield_now(&self) {
        self.cpu().raise_yield();
    }

    /// Reload the current thread's saved frame on the next tick.
    ///
    /// For syscalls that rewrite their own thread's saved registers.
    pub fn update_frame(&self) {
        if let Some(core) = self.cores.get(self.cpu().core_id()) {
            core.request_update_frame();
        }
        self.yield_now();
    }

    /// Page fault or exception that could not be resolved.
    ///
    /// User faults kill the faulting process like an unhandled SIGSEGV and
    /// reschedule; a kernel fault stops the scheduler.
    pub fn handle_user_fault(&self, frame: &mut TrapFrame, address: u64) {
        if !frame.is_user_mode() {
            log::error!(
                "Scheduler: kernel fault at {:#x} (ip {:#x}), stopping",
                address,
                frame.instruction_pointer()
            );
            self.stop();
            return;
        }
        if let Some(pcb) = self.current_process() {
            log::warn!(
                "{}: segmentation fault at {:#x} (ip {:#x})",
                pcb.id(),
                address,
                frame.instruction_pointer()
            );
            let code = signal_exit_code(SIGSEGV, pcb.info.compatibility);
            self.retire_process(&pcb, code, true);
        }
        self.schedule(frame);
    }

    // =========================================================================
    // The tick
    // =========================================================================

    /// Select the next thread for the interrupted core and load it into `frame`
    pub fn schedule(&self, frame: &mut TrapFrame) {
        if self.is_stopped() {
            log::warn!("Scheduler: tick while stopped, frame left alone");
            return;
        }
        let cpu = self.cpu();
        let core_id = cpu.core_id();
        let Some(core) = self.cores.get(core_id) else {
            log::error!("Scheduler: tick on unknown core {}", core_id);
            return;
        };
        if !core.is_valid() {
            log::error!("Scheduler: core {} context is corrupt", core_id);
            return;
        }

        let arch = self.config.architecture;
        let started = self.platform.timer.now_ns();
        // Interrupts are already off in the handler
        let table = self.tasks.lock();

        let previous = core
            .current()
            .and_then(|(pid, tid)| table.thread_in(pid, tid))
            .filter(|t| t.is_valid());

        if core.take_update_frame() {
            if let Some(prev) = previous {
                arch.restore_context(&prev.context().lock().frame, frame);
                let _ = prev.status_cell().transition(TaskStatus::Ready, TaskStatus::Running);
                let slice = prev.priority().time_slice();
                drop(table);
                self.platform.timer.one_shot(core_id, slice);
                core.record_tick(false, self.platform.timer.now_ns().saturating_sub(started));
                return;
            }
        }

        if let Some(prev) = previous {
            let mut context = prev.context().lock();
            arch.save_context(frame, &mut context.frame);
            cpu.save_fpu(&mut context.fpu);
            context.bases = cpu.thread_bases();
            drop(context);
            let _ = prev.status_cell().transition(TaskStatus::Running, TaskStatus::Ready);

            let mode = if frame.is_user_mode() {
                ExecutionMode::User
            } else {
                ExecutionMode::Kernel
            };
            prev.info.update_usage(mode, started);
            if let Some(pcb) = table.process(prev.owner()) {
                pcb.info.update_usage(mode, started);
            }
        }

        self.update_process_states(&table);
        self.wake_sleepers(&table, started);

        let (next, pcb) = loop {
            let Some(next) = self.select(&table, core) else {
                drop(table);
                log::error!("Scheduler: core {} has nothing to run", core_id);
                return;
            };
            let Some(pcb) = table.process(next.owner()) else {
                let _ = next.status_cell().transition(TaskStatus::Running, TaskStatus::Ready);
                continue;
            };

            core.set_current(next.owner(), next.id());
            if core.idle() != Some(next.id()) {
                core.set_last_position(next.owner(), next.id());
            }

            {
                let mut context = next.context().lock();
                arch.restore_context(&context.frame, frame);
                context.record_ip(frame.instruction_pointer());
                cpu.restore_fpu(&context.fpu);
                cpu.set_thread_bases(&context.bases);
            }
            cpu.set_kernel_stack(next.stack().top());
            self.platform.spaces.activate(pcb.address_space());

            // Delivery may stop or kill the process; pick again if so
            match self.deliver_pending(&table, pcb, next, frame) {
                Delivery::Resume => break (next, pcb),
                Delivery::Descheduled => {
                    let _ = next.status_cell().transition(TaskStatus::Running, TaskStatus::Ready);
                    log::debug!("{}: descheduled by signal delivery", next.id());
                }
            }
        };

        #[cfg(feature = "sched_debug")]
        log::trace!("core {}: -> {} ({:?}) {:?}", core_id, next.id(), next.priority(), frame);

        let idle = core.idle() == Some(next.id());
        let slice = next.priority().time_slice();
        next.info.update_usage(ExecutionMode::Kernel, started);
        pcb.info.update_usage(ExecutionMode::Kernel, started);
        drop(table);

        self.platform.timer.one_shot(core_id, slice);
        let elapsed = self.platform.timer.now_ns().saturating_sub(started);
        core.record_tick(idle, elapsed);
    }

    /// Pick and claim the next thread for `core`, falling back to its idle thread
    fn select<'t>(&self, table: &'t TaskTable, core: &CoreContext) -> Option<&'t Arc<Tcb>> {
        let threads = table.threads();
        let count = threads.len();
        for _ in 0..=count {
            let start = core
                .last_position()
                .map_or(0, |(pid, tid)| table.position_after(pid, tid));

            let mut best: Option<&Arc<Tcb>> = None;
            for step in 0..count {
                let candidate = &threads[(start + step) % count];
                if !self.is_eligible(table, candidate, core) {
                    continue;
                }
                match best {
                    // Ties keep the first one found after the last position
                    Some(current) if current.priority() >= candidate.priority() => {}
                    _ => best = Some(candidate),
                }
            }

            let Some(chosen) = best else { break };
            if chosen.status_cell().transition(TaskStatus::Ready, TaskStatus::Running).is_ok() {
                log::trace!("core {}: selected {} ({:?})", core.id(), chosen.id(), chosen.priority());
                return Some(chosen);
            }
            // Killed or blocked from another core since the check; look again
        }

        let idle = core.idle().and_then(|tid| table.thread_in(KERNEL_PID, tid))?;
        match idle.status_cell().transition(TaskStatus::Ready, TaskStatus::Running) {
            Ok(_) | Err(TaskStatus::Running) => Some(idle),
            Err(status) => {
                log::error!("core {}: idle thread is {:?}", core.id(), status);
                None
            }
        }
    }

    fn is_eligible(&self, table: &TaskTable, thread: &Tcb, core: &CoreContext) -> bool {
        if !thread.is_valid() {
            log::error!("Scheduler: {} failed its checksum, skipped", thread.id());
            return false;
        }
        if core.idle() == Some(thread.id()) {
            return false;
        }
        if thread.status() != TaskStatus::Ready || !thread.info.affinity().contains(core.id()) {
            return false;
        }
        let Some(pcb) = table.process(thread.owner()) else {
            return false;
        };
        if !pcb.is_valid() {
            log::error!("Scheduler: {} failed its checksum, skipped", pcb.id());
            return false;
        }
        let status = pcb.status();
        !(status.is_terminal() || status == TaskStatus::Stopped || status == TaskStatus::Blocked || pcb.is_stopped())
    }

    /// Derive process states from their threads and wake satisfied waiters
    fn update_process_states(&self, table: &TaskTable) {
        for pcb in table.processes() {
            if !pcb.is_valid() || pcb.status().is_terminal() {
                continue;
            }
            let threads = table.threads_of(pcb.id());
            if threads.is_empty() {
                continue;
            }

            let mut live = 0;
            let mut sleeping = 0;
            let mut last_exit = None;
            let mut sole = TaskStatus::Unknown;
            for thread in threads {
                match thread.status() {
                    status if status.is_terminal() => last_exit = Some(thread.exit_code()),
                    status => {
                        live += 1;
                        sleeping += usize::from(status == TaskStatus::Sleeping);
                        sole = status;
                    }
                }
            }

            if live == 0 {
                let code = last_exit.unwrap_or(pcb.exit_code());
                self.retire_process(pcb, code, false);
            } else if pcb.is_stopped() {
                // Stop and continue own the status while stopped
            } else if threads.len() == 1 {
                pcb.status_cell().store_if_live(sole);
            } else if sleeping == live {
                pcb.status_cell().store_if_live(TaskStatus::Sleeping);
            } else {
                let _ = pcb.status_cell().transition(TaskStatus::Sleeping, TaskStatus::Ready);
            }
        }

        for thread in table.threads() {
            if thread.status() != TaskStatus::Blocked || thread.is_stopped() {
                continue;
            }
            let target = *thread.wait_target().lock();
            if let Some(target) = target {
                if target.is_satisfied(table, thread) && thread.unblock() {
                    Self::follow_wake(table, thread);
                    log::debug!("{}: wait satisfied ({:?})", thread.id(), target);
                }
            }
        }
    }

    /// A woken sole thread brings its process out of Blocked or Sleeping
    pub(crate) fn follow_wake(table: &TaskTable, thread: &Tcb) {
        if let (Some(pcb), [_]) = (table.process(thread.owner()), table.threads_of(thread.owner())) {
            let _ = pcb.status_cell().transition(TaskStatus::Blocked, TaskStatus::Ready);
            let _ = pcb.status_cell().transition(TaskStatus::Sleeping, TaskStatus::Ready);
        }
    }

    /// Sleeping to Ready for elapsed deadlines and satisfied signal waits
    fn wake_sleepers(&self, table: &TaskTable, now: u64) {
        for thread in table.threads() {
            if thread.status() != TaskStatus::Sleeping {
                continue;
            }
            let due = thread.sleep_until() <= now;
            let target = *thread.wait_target().lock();
            let signalled =
                !due && target.map_or(false, |target| target.is_signal() && target.is_satisfied(table, thread));
            if (due || signalled) && thread.wake() {
                Self::follow_wake(table, thread);
                log::trace!("{}: woke", thread.id());
            }
        }
    }

    // =========================================================================
    // Arena growth (callers hold the list lock)
    // =========================================================================

    pub(crate) fn insert_process(&self, mut pcb: Arc<Pcb>) {
        loop {
            let mut table = self.tasks.lock_irq(self.cpu());
            match table.insert_process(pcb) {
                Ok(()) => return,
                Err(rejected) => pcb = rejected,
            }
            let wanted = (table.process_capacity() * 2).max(INITIAL_PROCESSES);
            drop(table);

            let bigger = Vec::with_capacity(wanted);
            let leftover = self.tasks.lock_irq(self.cpu()).adopt_processes(bigger);
            drop(leftover);
            log::debug!("Scheduler: process arena grown to {}", wanted);
        }
    }

    pub(crate) fn insert_thread(&self, mut tcb: Arc<Tcb>) {
        loop {
            let mut table = self.tasks.lock_irq(self.cpu());
            match table.insert_thread(tcb) {
                Ok(()) => return,
                Err(rejected) => tcb = rejected,
            }
            let wanted = (table.thread_capacity() * 2).max(INITIAL_THREADS);
            drop(table);

            let bigger = Vec::with_capacity(wanted);
            let leftover = self.tasks.lock_irq(self.cpu()).adopt_threads(bigger);
            drop(leftover);
            log::debug!("Scheduler: thread arena grown to {}", wanted);
        }
    }
}

/// What the interrupt layer calls for the tick and yield vectors
struct TickHandler {
    scheduler: Arc<Scheduler>,
}

impl InterruptHandler for TickHandler {
    fn handle(&self, frame: &mut TrapFrame) {
        self.scheduler.schedule(frame);
    }
}
