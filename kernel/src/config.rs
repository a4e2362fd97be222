//! Boot-time tasking configuration.
//!
//! Built once by the boot code, validated, and owned by the scheduler.
//! Defaults describe a single-core x86_64 machine; the `with_*` setters
//! override individual values the way platform discovery reports them.

use crate::arch::Architecture;
use crate::error::{TaskError, TaskResult};

/// Width of the core-affinity bitmask
pub const MAX_CORES: usize = 64;

// =============================================================================
// Resource limits
// =============================================================================

/// One set of per-process resource ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub open_files: u64,
    pub threads: u64,
    /// Bytes of program break growth
    pub memory: u64,
}

/// Soft limits are enforced; hard limits bound how far soft ones may be raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub soft: ResourceLimits,
    pub hard: ResourceLimits,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            soft: ResourceLimits {
                open_files: 128,
                threads: 64,
                memory: 1 << 30,
            },
            hard: ResourceLimits {
                open_files: 4096,
                threads: 1024,
                memory: 8 << 30,
            },
        }
    }
}

impl ProcessLimits {
    /// Raise or lower the soft limits, refusing anything above the hard ones
    pub fn set_soft(&mut self, soft: ResourceLimits) -> TaskResult<()> {
        if soft.open_files > self.hard.open_files
            || soft.threads > self.hard.threads
            || soft.memory > self.hard.memory
        {
            return Err(TaskError::LimitExceeded("hard"));
        }
        self.soft = soft;
        Ok(())
    }
}

// =============================================================================
// Boot entries
// =============================================================================

/// Kernel addresses the scheduler needs to create its own threads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootEntries {
    /// Continuation of kernel main, run as the kernel's "Main Thread"
    pub kernel_main: u64,
    /// `loop { halt }` body of the idle threads
    pub idle_loop: u64,
    /// Body of the cleanup thread, which calls `Scheduler::cleanup` and sleeps
    pub cleanup_loop: u64,
    /// Where kernel thread entry functions return to; kills the caller
    pub thread_exit: u64,
}

// =============================================================================
// Tasking configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskingConfig {
    pub architecture: Architecture,
    pub core_count: usize,
    pub kernel_stack_pages: usize,
    pub user_stack_pages: usize,
    pub syscall_stack_pages: usize,
    /// Unmapped pages below every kernel stack
    pub guard_pages: usize,
    /// Timer vector bound to the scheduler tick
    pub tick_vector: u8,
    /// Software interrupt raised by `yield_now`
    pub yield_vector: u8,
    /// Syscall number the native signal trampoline uses to return
    pub native_sigreturn: u64,
    /// Syscall number the Linux-compatible trampoline uses (rt_sigreturn)
    pub linux_sigreturn: u64,
    /// Child-state notifications that can be pending before new ones drop
    pub notification_capacity: usize,
    pub limits: ProcessLimits,
}

impl TaskingConfig {
    pub fn for_architecture(architecture: Architecture) -> Self {
        let linux_sigreturn = match architecture {
            Architecture::X86_64 => 15,
            Architecture::X86_32 => 173,
            Architecture::Aarch64 => 139,
        };
        Self {
            architecture,
            core_count: 1,
            kernel_stack_pages: 4,
            user_stack_pages: 8,
            syscall_stack_pages: 2,
            guard_pages: 1,
            tick_vector: 0x30,
            yield_vector: 0x30,
            native_sigreturn: linux_sigreturn,
            linux_sigreturn,
            notification_capacity: 256,
            limits: ProcessLimits::default(),
        }
    }

    pub fn with_core_count(mut self, cores: usize) -> Self {
        self.core_count = cores;
        self
    }

    pub fn with_kernel_stack_pages(mut self, pages: usize) -> Self {
        self.kernel_stack_pages = pages;
        self
    }

    pub fn with_user_stack_pages(mut self, pages: usize) -> Self {
        self.user_stack_pages = pages;
        self
    }

    pub fn with_native_sigreturn(mut self, nr: u64) -> Self {
        self.native_sigreturn = nr;
        self
    }

    pub fn with_limits(mut self, limits: ProcessLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Check the values the scheduler relies on
    pub fn validate(&self) -> TaskResult<()> {
        if self.core_count == 0 || self.core_count > MAX_CORES {
            log::error!("config: core count {} outside 1..={}", self.core_count, MAX_CORES);
            return Err(TaskError::InvalidState);
        }
        if self.kernel_stack_pages == 0 || self.user_stack_pages == 0 || self.syscall_stack_pages == 0 {
            log::error!("config: stacks must be at least one page");
            return Err(TaskError::InvalidState);
        }
        if self.notification_capacity == 0 {
            log::error!("config: notification queue needs capacity");
            return Err(TaskError::InvalidState);
        }
        Ok(())
    }
}

impl Default for TaskingConfig {
    fn default() -> Self {
        Self::for_architecture(Architecture::X86_64)
    }
}
