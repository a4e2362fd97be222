//! Preemptive multiprocessor tasking core.
//!
//! Process and thread control blocks, the per-core timer-tick scheduler,
//! the task lifecycle with deferred cleanup, and POSIX-style signals. All
//! hardware and memory-manager access goes through the collaborator traits
//! in [`arch`], chosen once at boot.
//!
//! The crate is `no_std` with `alloc`; unit tests build against `std` and
//! drive the scheduler through the mocks in `testing`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod errno;
pub mod error;
pub mod logger;
pub mod per_cpu;
pub mod process;
pub mod signal;
pub mod spinlock;
pub mod task;

#[cfg(test)]
mod testing;

pub use config::{BootEntries, TaskingConfig};
pub use error::{TaskError, TaskResult};
pub use task::{Pid, Scheduler, TaskStatus, Tid};
