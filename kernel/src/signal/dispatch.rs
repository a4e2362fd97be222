//! Sending signals, managing actions and masks, and waiting for signals.
//!
//! These run in thread context (syscalls, drivers, the cleanup task). Queue
//! pushes allocate, so they happen with the scheduling lock released; the
//! table is locked only to validate targets, apply immediate actions and
//! wake signal waiters.

use alloc::sync::Arc;

use super::constants::*;
use super::trampoline::Trampoline;
use super::types::{Disposition, QueuedSignal, SignalAction};
use crate::error::{TaskError, TaskResult};
use crate::process::Pcb;
use crate::signal::signal_exit_code;
use crate::task::lifecycle::NS_PER_MS;
use crate::task::stack::PendingFree;
use crate::task::table::TaskTable;
use crate::task::thread::Tcb;
use crate::task::wait::WaitTarget;
use crate::task::{Pid, Scheduler, TaskCompatibility, TaskStatus, Tid};

impl Scheduler {
    // =========================================================================
    // Sending
    // =========================================================================

    /// Send `sig` with payload `value` to process `pid`, or to one of its
    /// threads when `tid` is given.
    ///
    /// SIGKILL, SIGSTOP and SIGCONT act at once. Kernel processes never cross
    /// the user boundary, so their default action is applied immediately.
    /// Everything else is queued unless its effective action is Ignore.
    pub fn send_signal(&self, pid: Pid, sig: u32, value: u64, tid: Option<Tid>) -> TaskResult<()> {
        if !is_valid_signal(sig) {
            log::warn!("send_signal: invalid signal number {}", sig);
            return Err(TaskError::InvalidSignal(sig));
        }
        let cpu = self.cpu();

        let pcb = {
            let table = self.tasks.lock_irq(cpu);
            let pcb = table
                .process(pid)
                .filter(|p| !p.is_reaped())
                .ok_or(TaskError::NoSuchProcess(pid))?;
            if let Some(tid) = tid {
                table.thread_in(pid, tid).ok_or(TaskError::NoSuchThread(tid))?;
            }
            pcb.record_signal(sig);
            if pcb.status().is_terminal() {
                return Ok(());
            }

            match sig {
                SIGKILL => {
                    log::info!("SIGKILL sent to {} - terminating immediately", pid);
                    self.retire_process(pcb, signal_exit_code(SIGKILL, pcb.info.compatibility), false);
                    return Ok(());
                }
                SIGSTOP => {
                    self.stop_process(&table, pcb);
                    return Ok(());
                }
                SIGCONT => {
                    self.continue_process(&table, pcb);
                    // Only queued when someone will run a handler for it
                    if !Self::has_handler(&table, pid, tid, sig) {
                        return Ok(());
                    }
                }
                _ => {}
            }

            if !pcb.is_user() {
                self.apply_default(&table, pcb, sig);
                return Ok(());
            }
            let handled = Self::has_handler(&table, pid, tid, sig);
            if !handled && pcb.dispositions().lock().get(sig) == Disposition::Ignore {
                log::trace!("{} ignored by {}, discarded", signal_name(sig), pid);
                return Ok(());
            }
            Arc::clone(pcb)
        };

        pcb.signals().lock_irq(cpu).push(QueuedSignal { sig, value, tid });
        log::debug!("{} ({}) queued for {}", signal_name(sig), sig, pid);

        let table = self.tasks.lock_irq(cpu);
        for thread in table.threads_of(pid) {
            if tid.map_or(false, |t| t != thread.id()) {
                continue;
            }
            self.wake_signal_waiter(&table, thread);
        }
        Ok(())
    }

    fn has_handler(table: &TaskTable, pid: Pid, tid: Option<Tid>, sig: u32) -> bool {
        table
            .threads_of(pid)
            .iter()
            .filter(|t| tid.map_or(true, |tid| t.id() == tid))
            .any(|t| t.actions().lock().has_user_handler(sig))
    }

    /// The disposition, applied now (kernel-mode targets)
    fn apply_default(&self, table: &TaskTable, pcb: &Pcb, sig: u32) {
        let disposition = pcb.dispositions().lock().get(sig);
        log::debug!("{} applied to kernel {}: {:?}", signal_name(sig), pcb.id(), disposition);
        match disposition {
            Disposition::Ignore => {}
            Disposition::Terminate | Disposition::CoreDump => {
                let code = signal_exit_code(sig, pcb.info.compatibility);
                self.retire_process(pcb, code, disposition == Disposition::CoreDump);
            }
            Disposition::Stop => self.stop_process(table, pcb),
            Disposition::Continue => self.continue_process(table, pcb),
        }
    }

    /// Make a thread waiting on a signal runnable if its wait is satisfied
    fn wake_signal_waiter(&self, table: &TaskTable, thread: &Tcb) {
        let target = *thread.wait_target().lock();
        let Some(target) = target.filter(|t| t.is_signal()) else {
            return;
        };
        if !target.is_satisfied(table, thread) {
            return;
        }
        let woke = match thread.status() {
            TaskStatus::Blocked if !thread.is_stopped() => thread.unblock(),
            TaskStatus::Sleeping => thread.wake(),
            _ => false,
        };
        if woke {
            Self::follow_wake(table, thread);
            log::trace!("{}: woken by signal", thread.id());
        }
    }

    // =========================================================================
    // Queue inspection and watchers
    // =========================================================================

    /// Drop every queued instance of `sig` for `pid`
    pub fn remove_signal(&self, pid: Pid, sig: u32) -> TaskResult<()> {
        if !is_valid_signal(sig) {
            return Err(TaskError::InvalidSignal(sig));
        }
        let pcb = self.process(pid).ok_or(TaskError::NoSuchProcess(pid))?;
        let removed = pcb.signals().lock_irq(self.cpu()).discard(sig);
        log::debug!("{}: removed {} queued {}", pid, removed, signal_name(sig));
        if removed == 0 {
            return Err(TaskError::NotPending(sig));
        }
        Ok(())
    }

    pub fn has_pending_signal(&self, pid: Pid) -> TaskResult<bool> {
        let pcb = self.process(pid).ok_or(TaskError::NoSuchProcess(pid))?;
        let pending = !pcb.signals().lock_irq(self.cpu()).is_empty();
        Ok(pending)
    }

    /// The most recent signal sent to `pid`, delivered or not
    pub fn last_signal(&self, pid: Pid) -> TaskResult<Option<u32>> {
        let pcb = self.process(pid).ok_or(TaskError::NoSuchProcess(pid))?;
        Ok(pcb.last_signal())
    }

    /// Have `watcher` sent `sig` when `target` exits, dumps core or is killed
    pub fn add_watcher(&self, target: Pid, watcher: Pid, sig: u32) -> TaskResult<()> {
        if !is_valid_signal(sig) {
            return Err(TaskError::InvalidSignal(sig));
        }
        let pcb = self.process(target).ok_or(TaskError::NoSuchProcess(target))?;
        self.process(watcher).ok_or(TaskError::NoSuchProcess(watcher))?;
        if pcb.status().is_terminal() {
            return Err(TaskError::InvalidState);
        }
        pcb.add_watcher(watcher, sig);
        log::debug!("{} watches {} with {}", watcher, target, signal_name(sig));
        Ok(())
    }

    pub fn remove_watcher(&self, target: Pid, watcher: Pid, sig: u32) -> TaskResult<()> {
        let pcb = self.process(target).ok_or(TaskError::NoSuchProcess(target))?;
        pcb.remove_watcher(watcher, sig)
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Install `action` for `sig` on thread `tid` of `pid`; returns the old one.
    ///
    /// SIG_IGN also discards queued instances; SIG_DFL restores the default
    /// disposition. The first user handler maps the process's trampoline.
    pub fn set_action(&self, pid: Pid, tid: Tid, sig: u32, action: SignalAction) -> TaskResult<SignalAction> {
        if !is_valid_signal(sig) {
            return Err(TaskError::InvalidSignal(sig));
        }
        if !is_catchable(sig) {
            return Err(TaskError::UncatchableSignal(sig));
        }
        let (pcb, thread) = self.signal_target(pid, tid)?;
        if action.is_user_handler() {
            if !pcb.is_user() {
                return Err(TaskError::KernelHandler);
            }
            self.ensure_trampoline(&pcb)?;
        }

        let cpu = self.cpu();
        let previous = thread.actions().lock_irq(cpu).set(sig, action);
        if action.is_ignore() {
            pcb.dispositions().lock_irq(cpu).set(sig, Disposition::Ignore);
            let dropped = pcb.signals().lock_irq(cpu).discard(sig);
            if dropped > 0 {
                log::debug!("{}: discarded {} queued {}", pid, dropped, signal_name(sig));
            }
        } else if action.is_default() {
            pcb.dispositions().lock_irq(cpu).reset(sig);
        }
        log::debug!("{}: {} handler {:#x} (was {:#x})", tid, signal_name(sig), action.handler, previous.handler);
        Ok(previous)
    }

    pub fn get_action(&self, pid: Pid, tid: Tid, sig: u32) -> TaskResult<SignalAction> {
        if !is_valid_signal(sig) {
            return Err(TaskError::InvalidSignal(sig));
        }
        let (_, thread) = self.signal_target(pid, tid)?;
        let action = thread.actions().lock_irq(self.cpu()).get(sig);
        Ok(action)
    }

    fn signal_target(&self, pid: Pid, tid: Tid) -> TaskResult<(Arc<Pcb>, Arc<Tcb>)> {
        let pcb = self.process(pid).ok_or(TaskError::NoSuchProcess(pid))?;
        let thread = self
            .thread(tid)
            .filter(|t| t.owner() == pid)
            .ok_or(TaskError::NoSuchThread(tid))?;
        Ok((pcb, thread))
    }

    /// Map and fill the sigreturn trampoline page if the process has none
    fn ensure_trampoline(&self, pcb: &Pcb) -> TaskResult<()> {
        let _list = self.list_lock.lock();
        if pcb.trampoline() != 0 {
            return Ok(());
        }
        let space = pcb.address_space().ok_or(TaskError::KernelHandler)?;
        let sigreturn = match pcb.info.compatibility {
            TaskCompatibility::Linux => self.config.linux_sigreturn,
            _ => self.config.native_sigreturn,
        };
        let code = Trampoline::build(self.config.architecture, sigreturn);

        let addr = self.platform.spaces.map_user_pages(space, 1);
        if let Err(fault) = self.platform.memory.write(Some(space), addr, code.bytes()) {
            self.defer_free(PendingFree::UserPages { space, addr, count: 1 });
            return Err(fault.into());
        }
        pcb.set_trampoline(addr);
        log::debug!("{}: trampoline at {:#x} (sigreturn {})", pcb.id(), addr, sigreturn);
        Ok(())
    }

    // =========================================================================
    // Masks (KILL and STOP are never blocked)
    // =========================================================================

    /// Add `mask` to `tid`'s blocked set; returns the old mask
    pub fn block_signals(&self, tid: Tid, mask: u64) -> TaskResult<u64> {
        let thread = self.thread(tid).ok_or(TaskError::NoSuchThread(tid))?;
        Ok(thread.block_signals(mask))
    }

    /// Remove `mask` from `tid`'s blocked set; returns the old mask
    pub fn unblock_signals(&self, tid: Tid, mask: u64) -> TaskResult<u64> {
        let thread = self.thread(tid).ok_or(TaskError::NoSuchThread(tid))?;
        Ok(thread.unblock_signals(mask))
    }

    pub fn set_signal_mask(&self, tid: Tid, mask: u64) -> TaskResult<u64> {
        let thread = self.thread(tid).ok_or(TaskError::NoSuchThread(tid))?;
        Ok(thread.set_signal_mask(mask))
    }

    pub fn signal_mask(&self, tid: Tid) -> TaskResult<u64> {
        let thread = self.thread(tid).ok_or(TaskError::NoSuchThread(tid))?;
        Ok(thread.signal_mask())
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Block until any new signal is queued for the caller's process.
    ///
    /// Always ends in `Interrupted`, like `pause`.
    pub fn wait_any_signal(&self) -> TaskResult<()> {
        let (me, pcb) = self.current_pair()?;
        let cpu = self.cpu();
        let generation = pcb.signals().lock_irq(cpu).generation();
        loop {
            if pcb.signals().lock_irq(cpu).generation() != generation || pcb.status().is_terminal() {
                return Err(TaskError::Interrupted);
            }
            self.block_current_on(&me, WaitTarget::Signal { generation });
        }
    }

    /// Wait for an instance of `sig` directed at the caller and consume it,
    /// returning its value. The mask is not consulted, so callers normally
    /// block `sig` first to keep it from being delivered instead.
    pub fn wait_signal(&self, sig: u32) -> TaskResult<u64> {
        if !is_valid_signal(sig) {
            return Err(TaskError::InvalidSignal(sig));
        }
        let (me, pcb) = self.current_pair()?;
        let cpu = self.cpu();
        loop {
            if let Some(signal) = pcb.signals().lock_irq(cpu).take(sig, me.id()) {
                return Ok(signal.value);
            }
            if pcb.status().is_terminal() {
                return Err(TaskError::Interrupted);
            }
            self.block_current_on(&me, WaitTarget::SignalNumber(sig));
        }
    }

    /// [`wait_signal`](Self::wait_signal), giving up with `TimedOut` after `ms`
    pub fn wait_signal_timeout(&self, sig: u32, ms: u64) -> TaskResult<u64> {
        if !is_valid_signal(sig) {
            return Err(TaskError::InvalidSignal(sig));
        }
        let (me, pcb) = self.current_pair()?;
        let cpu = self.cpu();
        let timer = &self.platform.timer;
        let deadline = timer.now_ns().saturating_add(ms.saturating_mul(NS_PER_MS));
        loop {
            if let Some(signal) = pcb.signals().lock_irq(cpu).take(sig, me.id()) {
                return Ok(signal.value);
            }
            if pcb.status().is_terminal() {
                return Err(TaskError::Interrupted);
            }
            if timer.now_ns() >= deadline {
                return Err(TaskError::TimedOut);
            }
            *me.wait_target().lock_irq(cpu) = Some(WaitTarget::SignalNumber(sig));
            if me.sleep(deadline) || me.status() == TaskStatus::Sleeping {
                self.yield_now();
            }
            *me.wait_target().lock_irq(cpu) = None;
        }
    }

    fn current_pair(&self) -> TaskResult<(Arc<Tcb>, Arc<Pcb>)> {
        let me = self.current_thread().ok_or(TaskError::InvalidState)?;
        let pcb = self.process(me.owner()).ok_or(TaskError::NoSuchProcess(me.owner()))?;
        Ok((me, pcb))
    }
}
