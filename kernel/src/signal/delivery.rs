//! Signal delivery to userspace
//!
//! Pending signals are delivered when a trap frame is about to return to
//! user mode: at the end of the tick, after the next thread's context has
//! been loaded, and on syscall return through [`Scheduler::handle_signal`].
//!
//! A user handler runs on the interrupted stack. Delivery writes a
//! [`StackInfo`] block below the red zone and two words below that (the
//! handler address and an argument/alignment slot), then points the frame
//! at the process's trampoline. The trampoline calls the handler and issues
//! sigreturn, which lands in [`Scheduler::restore_handle_signal`].
//!
//! ```text
//!   interrupted sp ->  | ...            |
//!                      | red zone       |  128 bytes (none on i386)
//!   block          ->  | StackInfo      |  16-byte aligned
//!                      | arg / padding  |
//!   new sp         ->  | handler        |
//! ```

use core::mem::size_of;

use super::constants::*;
use super::types::{Disposition, QueuedSignal, SignalAction};
use crate::arch::{Architecture, FpuState, Plain, ThreadBases, TrapFrame};
use crate::error::{TaskError, TaskResult};
use crate::process::Pcb;
use crate::signal::signal_exit_code;
use crate::task::table::TaskTable;
use crate::task::thread::Tcb;
use crate::task::{KillCode, Scheduler, TaskCompatibility, TaskStatus};

/// Marks a block written by delivery
pub const SIGNAL_MAGIC: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Room for the largest trap frame of any architecture
const FRAME_BYTES: usize = 288;

/// What delivery did to the thread about to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Return to the (possibly redirected) frame
    Resume,
    /// The thread's process was stopped or killed; pick something else
    Descheduled,
}

/// Pre-signal state saved on the user stack while a handler runs
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct StackInfo {
    pub magic: u64,
    /// Thread mask to restore
    pub mask: u64,
    pub compatibility: u64,
    pub bases: ThreadBases,
    pub fpu: FpuState,
    /// The interrupted trap frame, as raw bytes of its architecture's layout
    pub frame: [u8; FRAME_BYTES],
}

impl Default for StackInfo {
    fn default() -> Self {
        Self {
            magic: 0,
            mask: 0,
            compatibility: 0,
            bases: ThreadBases::default(),
            fpu: FpuState::new(),
            frame: [0; FRAME_BYTES],
        }
    }
}

// repr(C), integers only, and every field lands on its natural alignment
unsafe impl Plain for StackInfo {}

impl StackInfo {
    pub const SIZE: u64 = size_of::<StackInfo>() as u64;

    /// Rebuild the saved frame of `arch`; None if it cannot be trusted
    fn saved_frame(&self, arch: Architecture) -> Option<TrapFrame> {
        let mut frame = arch.empty_frame();
        let bytes = frame.as_bytes_mut();
        let len = bytes.len();
        bytes.copy_from_slice(&self.frame[..len]);
        frame.is_user_mode().then_some(frame)
    }
}

impl Scheduler {
    /// Deliver `tcb`'s pending signals into `frame`.
    ///
    /// Runs with the scheduling lock held, so only per-block locks are taken
    /// here. Ignored signals are consumed in a loop; a user handler or a
    /// stop/kill ends the loop.
    pub(crate) fn deliver_pending(&self, table: &TaskTable, pcb: &Pcb, tcb: &Tcb, frame: &mut TrapFrame) -> Delivery {
        if !frame.is_user_mode() || !pcb.is_user() || pcb.status().is_terminal() {
            return Delivery::Resume;
        }

        loop {
            let next = pcb.signals().lock().pop_deliverable(tcb.id(), tcb.signal_mask());
            let Some(signal) = next else {
                return Delivery::Resume;
            };

            let action = tcb.actions().lock().get(signal.sig);
            log::debug!(
                "Delivering {} to {} ({}), handler={:#x}",
                signal_name(signal.sig),
                tcb.id(),
                pcb.id(),
                action.handler
            );

            if action.is_ignore() {
                continue;
            }
            if action.is_user_handler() {
                return match self.enter_handler(pcb, tcb, frame, &signal, &action) {
                    Ok(()) => Delivery::Resume,
                    Err(error) => {
                        log::warn!("{}: cannot deliver {}: {}", pcb.id(), signal_name(signal.sig), error);
                        let code = signal_exit_code(SIGSEGV, pcb.info.compatibility);
                        self.retire_process(pcb, code, true);
                        Delivery::Descheduled
                    }
                };
            }

            let disposition = pcb.dispositions().lock().get(signal.sig);
            match disposition {
                Disposition::Ignore => {}
                Disposition::Terminate | Disposition::CoreDump => {
                    log::info!("{} terminated by {}", pcb.id(), signal_name(signal.sig));
                    let code = signal_exit_code(signal.sig, pcb.info.compatibility);
                    self.retire_process(pcb, code, disposition == Disposition::CoreDump);
                    return Delivery::Descheduled;
                }
                Disposition::Stop => {
                    self.stop_process(table, pcb);
                    return Delivery::Descheduled;
                }
                Disposition::Continue => self.continue_process(table, pcb),
            }
        }
    }

    /// Build the handler's stack and redirect `frame` through the trampoline
    fn enter_handler(
        &self,
        pcb: &Pcb,
        tcb: &Tcb,
        frame: &mut TrapFrame,
        signal: &QueuedSignal,
        action: &SignalAction,
    ) -> TaskResult<()> {
        let arch = self.config.architecture;
        let cpu = self.cpu();
        let trampoline = pcb.trampoline();
        if trampoline == 0 {
            return Err(TaskError::InvalidState);
        }

        let mut info = StackInfo {
            magic: SIGNAL_MAGIC,
            mask: tcb.signal_mask(),
            compatibility: pcb.info.compatibility as u64,
            bases: cpu.thread_bases(),
            ..StackInfo::default()
        };
        cpu.save_fpu(&mut info.fpu);
        let bytes = frame.as_bytes();
        info.frame[..bytes.len()].copy_from_slice(bytes);

        let user_sp = frame.stack_pointer();
        let block = (user_sp & !0xF)
            .checked_sub(arch.red_zone() + StackInfo::SIZE)
            .map(|addr| addr & !0xF)
            .filter(|&addr| addr >= 16)
            .ok_or(TaskError::MemoryFault(user_sp))?;
        let sp = block - 16;

        let number = match pcb.info.compatibility {
            TaskCompatibility::Linux => to_linux(signal.sig),
            _ => signal.sig,
        };

        let memory = &self.platform.memory;
        let space = pcb.address_space();
        memory.write(space, block, info.as_bytes())?;
        match arch {
            Architecture::X86_32 => {
                memory.write(space, sp, &(action.handler as u32).to_le_bytes())?;
                memory.write(space, sp + 4, &number.to_le_bytes())?;
            }
            Architecture::X86_64 | Architecture::Aarch64 => {
                memory.write(space, sp, &action.handler.to_le_bytes())?;
            }
        }

        frame.set_instruction_pointer(trampoline);
        frame.set_stack_pointer(sp);
        frame.clear_call_arguments();
        frame.set_argument(number as u64);

        let mut mask = action.mask;
        if action.flags & SA_NODEFER == 0 {
            mask |= sig_mask(signal.sig);
        }
        tcb.set_signal_mask(mask);
        if action.flags & SA_RESETHAND != 0 {
            tcb.actions().lock().set(signal.sig, SignalAction::default());
        }

        log::debug!(
            "{}: {} handler at {:#x}, sp {:#x} -> {:#x}",
            tcb.id(),
            signal_name(signal.sig),
            action.handler,
            user_sp,
            sp
        );
        Ok(())
    }

    /// Deliver pending signals to the calling thread before a syscall returns.
    ///
    /// Yields if delivery stopped or killed the caller's process.
    pub fn handle_signal(&self, frame: &mut TrapFrame) -> TaskResult<()> {
        let tcb = self.current_thread().ok_or(TaskError::InvalidState)?;
        let cpu = self.cpu();
        let delivery = {
            let table = self.tasks.lock_irq(cpu);
            let pcb = table.process(tcb.owner()).ok_or(TaskError::NoSuchProcess(tcb.owner()))?;
            self.deliver_pending(&table, pcb, &tcb, frame)
        };
        if delivery == Delivery::Descheduled {
            self.yield_now();
        }
        Ok(())
    }

    /// sigreturn: restore the context saved when the handler was entered.
    ///
    /// `frame` is the trap frame of the sigreturn syscall. A block that
    /// fails validation kills the process with [`KillCode::Crash`].
    pub fn restore_handle_signal(&self, frame: &mut TrapFrame) -> TaskResult<()> {
        let tcb = self.current_thread().ok_or(TaskError::InvalidState)?;
        let pcb = self.process(tcb.owner()).ok_or(TaskError::NoSuchProcess(tcb.owner()))?;

        let (info, saved) = match self.read_signal_block(&pcb, frame) {
            Ok(restored) => restored,
            Err(error) => {
                log::warn!(
                    "{}: sigreturn at sp {:#x} failed: {}",
                    pcb.id(),
                    frame.stack_pointer(),
                    error
                );
                self.retire_process(&pcb, KillCode::Crash.into(), false);
                self.yield_now();
                return Err(error);
            }
        };

        let cpu = self.cpu();
        self.config.architecture.restore_context(&saved, frame);
        cpu.restore_fpu(&info.fpu);
        cpu.set_thread_bases(&info.bases);
        tcb.set_signal_mask(info.mask);
        log::debug!("{}: returned from signal handler to {:#x}", tcb.id(), frame.instruction_pointer());
        Ok(())
    }

    fn read_signal_block(&self, pcb: &Pcb, frame: &TrapFrame) -> TaskResult<(StackInfo, TrapFrame)> {
        let arch = self.config.architecture;
        let sp = frame.stack_pointer();
        let addr = sp
            .checked_add(arch.sigreturn_offset())
            .ok_or(TaskError::MemoryFault(sp))?;
        let mut info = StackInfo::default();
        self.platform
            .memory
            .read(pcb.address_space(), addr, info.as_bytes_mut())?;

        if info.magic != SIGNAL_MAGIC || info.compatibility != pcb.info.compatibility as u64 {
            return Err(TaskError::BadSignalFrame);
        }
        let saved = info.saved_frame(arch).ok_or(TaskError::BadSignalFrame)?;
        Ok((info, saved))
    }

    // =========================================================================
    // Job control
    // =========================================================================

    /// Stop every runnable thread of `pcb` until a continue
    pub(crate) fn stop_process(&self, table: &TaskTable, pcb: &Pcb) {
        if pcb.status().is_terminal() || pcb.is_stopped() {
            return;
        }
        pcb.set_stopped(true);
        if !pcb.status_cell().store_if_live(TaskStatus::Stopped) {
            pcb.set_stopped(false);
            return;
        }
        for thread in table.threads_of(pcb.id()) {
            // Threads already waiting keep their own wake condition
            if thread.block() {
                thread.set_stopped(true);
            }
        }
        log::info!("{}: stopped", pcb.id());
    }

    /// Resume the threads a stop blocked
    pub(crate) fn continue_process(&self, table: &TaskTable, pcb: &Pcb) {
        if !pcb.is_stopped() {
            return;
        }
        for thread in table.threads_of(pcb.id()) {
            if thread.is_stopped() {
                thread.set_stopped(false);
                thread.unblock();
            }
        }
        let _ = pcb.status_cell().transition(TaskStatus::Stopped, TaskStatus::Ready);
        pcb.set_stopped(false);
        log::info!("{}: continued", pcb.id());
    }
}
