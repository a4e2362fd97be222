//! x86_64 support: the trap frame layout and, on x86_64 builds, the
//! hardware implementation of [`CpuOps`](crate::arch::CpuOps).

#[cfg(target_arch = "x86_64")]
pub mod cpu;
pub mod frame;

pub use frame::X64Frame;
