//! POSIX-style signals for the tasking core
//!
//! This module implements:
//! - Signal constants and the Linux numbering translation
//! - Per-process pending queues and disposition tables, per-thread actions
//! - Sending, action and mask management, and signal waits (`dispatch`)
//! - Delivery to user handlers and sigreturn (`delivery`)
//! - The per-process return trampoline
//!
//! Delivery happens when a trap frame is restored to user mode: at the end
//! of the scheduler tick and on syscall return.

pub mod constants;
pub mod delivery;
pub mod dispatch;
pub mod trampoline;
pub mod types;

pub use types::*;
