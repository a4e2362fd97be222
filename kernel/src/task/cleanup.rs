//! Second phase of task death: reclaiming what killing left behind.
//!
//! The cleanup thread calls [`Scheduler::cleanup`] periodically. A pass
//! counts the dead entries under the scheduling lock, reserves room for them
//! with the lock released, then moves them out of the arena in one short
//! critical section. Stacks, syscall blocks and address spaces go back to
//! their collaborators only after both locks are released; a free that is
//! refused is kept and retried on the next pass.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::AddressSpace;
use crate::process::Pcb;
use crate::task::stack::{PendingFree, StackKind};
use crate::task::table::TaskTable;
use crate::task::thread::Tcb;
use crate::task::{Scheduler, TaskStatus};

/// What one cleanup pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub threads_freed: usize,
    pub processes_freed: usize,
    /// Control blocks dropped because their checksum was bad
    pub corrupt_dropped: usize,
    /// Frees refused this pass, kept for the next
    pub frees_deferred: usize,
    pub notifications_sent: usize,
}

impl Scheduler {
    /// Reap dead threads and processes and release their resources.
    pub fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cpu = self.cpu();

        // Before the dead leave the arena, so each child is still found
        report.notifications_sent = self.deliver_child_notifications();

        let (dead_threads, dead_processes) = {
            let _list = self.list_lock.lock();

            let (thread_count, process_count) = {
                let table = self.tasks.lock_irq(cpu);
                for process in table.processes() {
                    self.retire_if_threads_dead(&table, process, None);
                }
                // Threads of dead processes die with the process's code
                for thread in table.threads() {
                    let owner = table.process(thread.owner());
                    let process_dead = owner.map_or(true, |p| p.status().is_terminal());
                    if process_dead && thread.is_valid() {
                        let code = owner.map_or(thread.exit_code(), |p| p.exit_code());
                        thread.terminate(code);
                    }
                }
                let threads = table.threads().iter().filter(|t| self.is_reapable_thread(t)).count();
                let processes = table
                    .processes()
                    .iter()
                    .filter(|p| !p.is_valid() || p.status() == TaskStatus::Terminated)
                    .count();
                (threads, processes)
            };
            if thread_count == 0 && process_count == 0 {
                (Vec::new(), Vec::new())
            } else {
                // Allocate with the scheduling lock released
                let mut dead_threads: Vec<Arc<Tcb>> = Vec::with_capacity(thread_count);
                let mut dead_processes: Vec<Arc<Pcb>> = Vec::with_capacity(process_count);

                let mut table = self.tasks.lock_irq(cpu);
                table.take_threads(&mut dead_threads, |t| self.is_reapable_thread(t));
                // Threads killed since the count may have been a process's last
                for thread in dead_threads.iter().rev() {
                    if let Some(owner) = table.process(thread.owner()) {
                        self.retire_if_threads_dead(&table, owner, Some(thread.exit_code()));
                    }
                }
                table.take_processes(&mut dead_processes, |p, threads| {
                    !p.is_valid() || (p.status() == TaskStatus::Terminated && threads == 0)
                });
                (dead_threads, dead_processes)
            }
        };

        // Both locks are released from here on
        let mut frees = core::mem::take(&mut *self.deferred.lock());
        let retried = frees.len();

        let destroyed: Vec<_> = dead_processes
            .iter()
            .filter(|p| p.is_valid())
            .filter_map(|p| p.address_space())
            .collect();

        for thread in &dead_threads {
            if !thread.is_valid() {
                log::error!("cleanup: dropping corrupt {} without freeing its memory", thread.id());
                report.corrupt_dropped += 1;
                continue;
            }
            frees.push(thread.stack().pending_free());
            let user_frees = thread
                .user_stack()
                .map(|stack| stack.pending_free())
                .into_iter()
                .chain(thread.tls().map(|tls| tls.pending_free()));
            for free in user_frees {
                if !destroyed.iter().any(|&space| free.is_covered_by(space)) {
                    frees.push(free);
                }
            }
            self.clear_child_tid(thread, &destroyed);
            if let Some(block) = thread.syscall_block() {
                frees.extend(block.pending_frees());
            }
            report.threads_freed += 1;
            log::debug!("cleanup: reaped thread {} '{}'", thread.id(), thread.name());
        }

        for process in &dead_processes {
            if !process.is_valid() {
                log::error!("cleanup: dropping corrupt {} without freeing its memory", process.id());
                report.corrupt_dropped += 1;
                continue;
            }
            if let Some(space) = process.address_space() {
                frees.push(PendingFree::AddressSpace(space));
            }
            report.processes_freed += 1;
            log::info!("cleanup: reaped process {} '{}'", process.id(), process.name());
        }

        let mut refused = Vec::new();
        for free in frees {
            if let Err(error) = free.attempt(&self.platform) {
                log::debug!("cleanup: {:?} refused ({:?}), retrying next pass", free, error);
                refused.push(free);
            }
        }
        report.frees_deferred = refused.len();
        if !refused.is_empty() {
            self.deferred.lock().append(&mut refused);
        }

        if report != CleanupReport::default() || retried > 0 {
            log::debug!("cleanup: {:?}", report);
        }
        report
    }

    /// Zero a reaped thread's `clear_child_tid` word while its space lives
    fn clear_child_tid(&self, thread: &Tcb, destroyed: &[AddressSpace]) {
        let addr = thread.clear_child_tid();
        let space = match thread.user_stack().map(|stack| stack.kind()) {
            Some(StackKind::User(space)) if addr != 0 && !destroyed.contains(&space) => space,
            _ => return,
        };
        if let Err(fault) = self.platform.memory.write(Some(space), addr, &0u32.to_le_bytes()) {
            log::debug!("cleanup: clear_child_tid of {} at {:#x}: {:?}", thread.id(), addr, fault);
        }
    }

    /// Retire a live process none of whose remaining threads is alive.
    ///
    /// The exit code is `taken`'s (a thread already moved out of the arena)
    /// or else the last dead thread's. A process that never had threads is
    /// left alone.
    fn retire_if_threads_dead(&self, table: &TaskTable, process: &Pcb, taken: Option<i32>) {
        if !process.is_valid() || process.status().is_terminal() {
            return;
        }
        let mut code = taken;
        for thread in table.threads_of(process.id()) {
            if !thread.status().is_terminal() {
                return;
            }
            code = Some(thread.exit_code());
        }
        if let Some(code) = code {
            self.retire_process(process, code, false);
        }
    }

    /// Terminated (or corrupt) and not executing on any core
    fn is_reapable_thread(&self, thread: &Tcb) -> bool {
        if !thread.is_valid() {
            return !self.cores.is_running_anywhere(thread.id());
        }
        thread.status() == TaskStatus::Terminated && !self.cores.is_running_anywhere(thread.id())
    }

    /// Turn queued child-state changes into each watcher's signal
    fn deliver_child_notifications(&self) -> usize {
        let mut sent = 0;
        while let Some(child) = self.notifications.pop() {
            let Some(process) = self.process_entry(child) else {
                continue;
            };
            for watcher in process.watchers() {
                match self.send_signal(watcher.pid, watcher.sig, child.0, None) {
                    Ok(()) => sent += 1,
                    Err(error) => {
                        log::debug!("cleanup: signal {} for {} to {}: {}", watcher.sig, child, watcher.pid, error)
                    }
                }
            }
        }
        sent
    }
}
