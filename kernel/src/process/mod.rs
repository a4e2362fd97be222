//! Process control blocks.
//!
//! A process owns an address space and a set of threads. Threads are not
//! stored here: the task arena orders them by owner, so a process's
//! threads are one contiguous run of it (see [`crate::task::table`]).

pub mod process;

pub use process::{Credentials, Ids, Pcb, ProgramBreak, ResourceHandles, Watcher, DEFAULT_UMASK};
