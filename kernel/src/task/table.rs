//! The task arena.
//!
//! Processes are kept sorted by pid and threads by (owner pid, tid), so a
//! process's threads form one contiguous run and both lookups are binary
//! searches. The table lives behind the scheduler's fast lock, which must
//! never be held across an allocation or a free. Inserts therefore only
//! succeed into spare capacity (the caller grows the arena outside the lock,
//! see [`TaskTable::adopt_processes`]), and removals move entries into a
//! caller-reserved vector instead of dropping them in place.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::process::Pcb;
use crate::task::thread::Tcb;
use crate::task::{Pid, Tid};

pub struct TaskTable {
    processes: Vec<Arc<Pcb>>,
    threads: Vec<Arc<Tcb>>,
}

impl TaskTable {
    pub fn with_capacity(processes: usize, threads: usize) -> Self {
        Self {
            processes: Vec::with_capacity(processes),
            threads: Vec::with_capacity(threads),
        }
    }

    pub fn processes(&self) -> &[Arc<Pcb>] {
        &self.processes
    }

    /// All threads, grouped by owner
    pub fn threads(&self) -> &[Arc<Tcb>] {
        &self.threads
    }

    pub fn process(&self, pid: Pid) -> Option<&Arc<Pcb>> {
        self.processes
            .binary_search_by_key(&pid, |p| p.id())
            .ok()
            .map(|i| &self.processes[i])
    }

    /// Contiguous run of `pid`'s threads
    pub fn threads_of(&self, pid: Pid) -> &[Arc<Tcb>] {
        let start = self.threads.partition_point(|t| t.owner() < pid);
        let end = self.threads.partition_point(|t| t.owner() <= pid);
        &self.threads[start..end]
    }

    pub fn thread_in(&self, pid: Pid, tid: Tid) -> Option<&Arc<Tcb>> {
        self.threads_of(pid).iter().find(|t| t.id() == tid)
    }

    /// Thread by id alone: a scan, since the arena is ordered by owner
    pub fn thread(&self, tid: Tid) -> Option<&Arc<Tcb>> {
        self.threads.iter().find(|t| t.id() == tid)
    }

    /// Index of the first thread ordered after `(pid, tid)`
    pub fn position_after(&self, pid: Pid, tid: Tid) -> usize {
        self.threads.partition_point(|t| (t.owner(), t.id()) <= (pid, tid))
    }

    pub fn children_of(&self, pid: Pid) -> impl Iterator<Item = &Arc<Pcb>> {
        self.processes.iter().filter(move |p| p.parent() == Some(pid))
    }

    pub fn process_capacity(&self) -> usize {
        self.processes.capacity()
    }

    pub fn thread_capacity(&self) -> usize {
        self.threads.capacity()
    }

    /// Insert into spare capacity; hands the PCB back if the arena is full
    pub fn insert_process(&mut self, pcb: Arc<Pcb>) -> Result<(), Arc<Pcb>> {
        if self.processes.len() == self.processes.capacity() {
            return Err(pcb);
        }
        let at = self.processes.partition_point(|p| p.id() < pcb.id());
        self.processes.insert(at, pcb);
        Ok(())
    }

    /// Insert into spare capacity; hands the TCB back if the arena is full
    pub fn insert_thread(&mut self, tcb: Arc<Tcb>) -> Result<(), Arc<Tcb>> {
        if self.threads.len() == self.threads.capacity() {
            return Err(tcb);
        }
        let key = (tcb.owner(), tcb.id());
        let at = self.threads.partition_point(|t| (t.owner(), t.id()) < key);
        self.threads.insert(at, tcb);
        Ok(())
    }

    /// Move the processes into `bigger` if it has more room.
    ///
    /// Returns whichever vector is left over; the caller drops it after
    /// releasing the lock.
    pub fn adopt_processes(&mut self, mut bigger: Vec<Arc<Pcb>>) -> Vec<Arc<Pcb>> {
        if bigger.capacity() <= self.processes.capacity() {
            return bigger;
        }
        bigger.extend(self.processes.drain(..));
        core::mem::replace(&mut self.processes, bigger)
    }

    pub fn adopt_threads(&mut self, mut bigger: Vec<Arc<Tcb>>) -> Vec<Arc<Tcb>> {
        if bigger.capacity() <= self.threads.capacity() {
            return bigger;
        }
        bigger.extend(self.threads.drain(..));
        core::mem::replace(&mut self.threads, bigger)
    }

    /// Move threads matching `pred` into `out`, at most its spare capacity
    pub fn take_threads(&mut self, out: &mut Vec<Arc<Tcb>>, mut pred: impl FnMut(&Arc<Tcb>) -> bool) {
        self.threads.retain(|t| {
            if out.len() < out.capacity() && pred(t) {
                // `out` keeps a reference, so the arena's drop here never frees
                out.push(t.clone());
                false
            } else {
                true
            }
        });
    }

    /// Move processes matching `pred` into `out`, at most its spare capacity.
    ///
    /// `pred` also gets the number of threads the process still has.
    pub fn take_processes(&mut self, out: &mut Vec<Arc<Pcb>>, mut pred: impl FnMut(&Arc<Pcb>, usize) -> bool) {
        let threads = &self.threads;
        self.processes.retain(|p| {
            let start = threads.partition_point(|t| t.owner() < p.id());
            let end = threads.partition_point(|t| t.owner() <= p.id());
            if out.len() < out.capacity() && pred(p, end - start) {
                out.push(p.clone());
                false
            } else {
                true
            }
        });
    }
}
