//! Error type for tasking operations
//!
//! Every failure a syscall can observe maps onto a POSIX errno so the
//! syscall layer can hand `-errno` back to user space.

use core::fmt;

use crate::arch::MemoryFault;
use crate::errno;
use crate::task::{Pid, Tid};

/// Errors returned by scheduler, lifecycle and signal operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// No live process with this id
    NoSuchProcess(Pid),
    /// No live thread with this id (or not owned by the named process)
    NoSuchThread(Tid),
    /// Signal number outside 1..=64
    InvalidSignal(u32),
    /// User handlers cannot be installed on kernel-mode processes
    KernelHandler,
    /// SIGKILL and SIGSTOP cannot be caught, ignored or blocked
    UncatchableSignal(u32),
    /// The task is in a state that does not allow the operation
    InvalidState,
    /// A soft resource limit would be exceeded
    LimitExceeded(&'static str),
    /// The caller is not a watcher of the target
    NotWatcher(Pid),
    /// No instance of this signal is queued
    NotPending(u32),
    /// The exit status was already collected by another waiter
    AlreadyReaped(Pid),
    /// A signal arrived while waiting
    Interrupted,
    /// A timed wait reached its deadline
    TimedOut,
    /// The sigreturn block on the user stack is not one we wrote
    BadSignalFrame,
    /// A user-memory access failed
    MemoryFault(u64),
    /// The scheduler has been stopped
    SchedulerStopped,
}

/// Result alias used throughout the crate
pub type TaskResult<T> = Result<T, TaskError>;

impl TaskError {
    /// The positive errno for this error
    pub fn errno(&self) -> i32 {
        match self {
            TaskError::NoSuchProcess(_) | TaskError::NoSuchThread(_) => errno::ESRCH,
            TaskError::InvalidSignal(_)
            | TaskError::KernelHandler
            | TaskError::UncatchableSignal(_)
            | TaskError::InvalidState
            | TaskError::BadSignalFrame => errno::EINVAL,
            TaskError::LimitExceeded(_) => errno::EAGAIN,
            TaskError::NotWatcher(_) | TaskError::NotPending(_) => errno::ENOENT,
            TaskError::AlreadyReaped(_) => errno::ECHILD,
            TaskError::Interrupted => errno::EINTR,
            TaskError::TimedOut => errno::EAGAIN,
            TaskError::MemoryFault(_) => errno::EFAULT,
            TaskError::SchedulerStopped => errno::EBUSY,
        }
    }

    /// Value placed in the syscall return register
    pub fn as_syscall_return(&self) -> i64 {
        -(self.errno() as i64)
    }
}

impl From<MemoryFault> for TaskError {
    fn from(fault: MemoryFault) -> Self {
        TaskError::MemoryFault(fault.address)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::NoSuchProcess(pid) => write!(f, "{} does not exist", pid),
            TaskError::NoSuchThread(tid) => write!(f, "{} does not exist", tid),
            TaskError::InvalidSignal(sig) => write!(f, "invalid signal {}", sig),
            TaskError::KernelHandler => f.write_str("kernel processes cannot install signal handlers"),
            TaskError::UncatchableSignal(sig) => write!(f, "signal {} cannot be caught or blocked", sig),
            TaskError::InvalidState => f.write_str("task is in the wrong state"),
            TaskError::LimitExceeded(what) => write!(f, "{} limit exceeded", what),
            TaskError::NotWatcher(pid) => write!(f, "{} is not watching", pid),
            TaskError::NotPending(sig) => write!(f, "signal {} is not pending", sig),
            TaskError::AlreadyReaped(pid) => write!(f, "{} was already reaped", pid),
            TaskError::Interrupted => f.write_str("interrupted by signal"),
            TaskError::TimedOut => f.write_str("timed out"),
            TaskError::BadSignalFrame => f.write_str("corrupt signal frame"),
            TaskError::MemoryFault(addr) => write!(f, "fault accessing {:#x}", addr),
            TaskError::SchedulerStopped => f.write_str("scheduler stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_negative_errno() {
        assert_eq!(
            TaskError::NoSuchProcess(Pid(9)).as_syscall_return(),
            -(errno::ESRCH as i64),
            "unknown target is ESRCH"
        );
        assert_eq!(TaskError::InvalidSignal(99).errno(), errno::EINVAL);
        assert_eq!(TaskError::Interrupted.errno(), errno::EINTR);
        assert_eq!(TaskError::TimedOut.errno(), errno::EAGAIN, "sigtimedwait reports EAGAIN");
        assert_eq!(TaskError::AlreadyReaped(Pid(3)).errno(), errno::ECHILD);
        assert_eq!(TaskError::NotPending(10).errno(), errno::ENOENT);
    }
}
