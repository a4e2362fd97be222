//! Blocking waits on other tasks.
//!
//! A waiter records a [`WaitTarget`] on its own TCB, blocks, and yields.
//! The tick's status pass wakes Blocked threads whose target is satisfied,
//! so a wake that races with the block is picked up on the next tick on any
//! core instead of being lost.

use crate::error::{TaskError, TaskResult};
use crate::process::Pcb;
use crate::task::table::TaskTable;
use crate::task::thread::Tcb;
use crate::task::{Pid, Scheduler, TaskStatus, Tid};

/// A set of [`TaskStatus`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSet(u16);

impl StatusSet {
    /// Zombie, CoreDump and Terminated
    pub const TERMINAL: StatusSet = StatusSet(
        1 << TaskStatus::Zombie as u16 | 1 << TaskStatus::CoreDump as u16 | 1 << TaskStatus::Terminated as u16,
    );

    pub const fn only(status: TaskStatus) -> Self {
        StatusSet(1 << status as u16)
    }

    pub const fn with(self, status: TaskStatus) -> Self {
        StatusSet(self.0 | 1 << status as u16)
    }

    #[inline]
    pub fn contains(self, status: TaskStatus) -> bool {
        self.0 & (1 << status as u16) != 0
    }
}

/// What a Blocked (or signal-sleeping) thread is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Process(Pid, StatusSet),
    Thread(Tid, StatusSet),
    /// Any signal queued after the queue reached `generation`
    Signal { generation: u64 },
    /// An instance of this signal for the waiting thread
    SignalNumber(u32),
}

impl WaitTarget {
    /// Whether the waiter can run again. A target that vanished from the
    /// arena counts as satisfied so the waiter can report it.
    pub(crate) fn is_satisfied(&self, table: &TaskTable, waiter: &Tcb) -> bool {
        match *self {
            WaitTarget::Process(pid, set) => table.process(pid).map_or(true, |p| set.contains(p.status())),
            WaitTarget::Thread(tid, set) => table.thread(tid).map_or(true, |t| set.contains(t.status())),
            WaitTarget::Signal { generation } => table
                .process(waiter.owner())
                .map_or(true, |p| p.signals().lock().generation() != generation),
            WaitTarget::SignalNumber(sig) => table
                .process(waiter.owner())
                .map_or(true, |p| p.signals().lock().is_pending_for(sig, waiter.id())),
        }
    }

    pub(crate) fn is_signal(&self) -> bool {
        matches!(self, WaitTarget::Signal { .. } | WaitTarget::SignalNumber(_))
    }
}

impl Scheduler {
    /// Block until `pid` dies, then collect its exit code.
    ///
    /// Exactly one waiter collects the status; the process is invisible to
    /// lookups afterwards and later waiters get `AlreadyReaped`.
    pub fn wait_for_process(&self, pid: Pid) -> TaskResult<i32> {
        let pcb = self.wait_process_until(pid, StatusSet::TERMINAL)?;
        if !pcb.claim_reap() {
            return Err(TaskError::AlreadyReaped(pid));
        }
        let code = pcb.exit_code();
        // Collected; the next cleanup pass may free it
        pcb.status_cell().store(TaskStatus::Terminated);
        log::info!("{}: reaped with exit code {}", pid, code);
        Ok(code)
    }

    /// Block until `pid` reaches `status` or dies; returns the status seen
    pub fn wait_for_process_status(&self, pid: Pid, status: TaskStatus) -> TaskResult<TaskStatus> {
        let pcb = self.wait_process_until(pid, StatusSet::TERMINAL.with(status))?;
        Ok(pcb.status())
    }

    /// Block until thread `tid` terminates; returns its exit code
    pub fn wait_for_thread(&self, tid: Tid) -> TaskResult<i32> {
        let tcb = self.wait_thread_until(tid, StatusSet::TERMINAL)?;
        Ok(tcb.exit_code())
    }

    /// Block until thread `tid` reaches `status` or terminates
    pub fn wait_for_thread_status(&self, tid: Tid, status: TaskStatus) -> TaskResult<TaskStatus> {
        let tcb = self.wait_thread_until(tid, StatusSet::TERMINAL.with(status))?;
        Ok(tcb.status())
    }

    fn wait_process_until(&self, pid: Pid, set: StatusSet) -> TaskResult<alloc::sync::Arc<Pcb>> {
        let me = self.current_thread().ok_or(TaskError::InvalidState)?;
        if me.owner() == pid {
            return Err(TaskError::InvalidState);
        }
        loop {
            let target = self.process_entry(pid).ok_or(TaskError::NoSuchProcess(pid))?;
            if target.is_reaped() {
                return Err(TaskError::AlreadyReaped(pid));
            }
            if set.contains(target.status()) {
                return Ok(target);
            }
            self.block_current_on(&me, WaitTarget::Process(pid, set));
        }
    }

    fn wait_thread_until(&self, tid: Tid, set: StatusSet) -> TaskResult<alloc::sync::Arc<Tcb>> {
        let me = self.current_thread().ok_or(TaskError::InvalidState)?;
        if me.id() == tid {
            return Err(TaskError::InvalidState);
        }
        loop {
            let target = self.thread(tid).ok_or(TaskError::NoSuchThread(tid))?;
            if set.contains(target.status()) {
                return Ok(target);
            }
            self.block_current_on(&me, WaitTarget::Thread(tid, set));
        }
    }

    /// Record `target`, block the calling thread and yield until woken
    pub(crate) fn block_current_on(&self, me: &Tcb, target: WaitTarget) {
        let cpu = self.cpu();
        *me.wait_target().lock_irq(cpu) = Some(target);
        if me.block() || me.status() == TaskStatus::Blocked {
            self.yield_now();
        }
        *me.wait_target().lock_irq(cpu) = None;
    }
}
