//! Guest entry and the run loop.
//!
//! The only place the processor changes worlds is [`vmx_enter`] /
//! [`vmx_exit_landing`]: a naked pair that publishes the host stack,
//! reconciles CR2, swaps the full general-purpose register file, and
//! executes the launch-or-resume instruction. Everything else — interrupt
//! staging, lock discipline, exit classification, termination — is
//! ordinary Rust on the host side of that boundary.

use crate::exit::{self, Flow, VmExitRecord};
use crate::host::HostBridge;
use crate::probe::Probe;
use crate::vm::GuestContext;
use crate::vmcs::{ActiveVmcs, InstructionError};
use crate::{CpuContext, VmxError};
use core::arch::naked_asm;

/// X86_64 guest general-purpose register file.
///
/// Field order is load-bearing: the trampoline addresses these fields by
/// fixed offset. `cr2` rides along because hardware does not switch it on
/// entry/exit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestRegisters {
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub r11: usize,
    pub r10: usize,
    pub r9: usize,
    pub r8: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub rbp: usize,
    pub rdx: usize,
    pub rcx: usize,
    pub rbx: usize,
    pub rax: usize,
    /// The guest's CR2, reconciled with the hardware register around
    /// entry.
    pub cr2: usize,
}

/// Which entry instruction the next entry must use.
///
/// Picking the wrong one is a hardware-fatal error: `vmlaunch` demands a
/// clear VMCS, `vmresume` a launched one. The run counter decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// First entry after a clear: `vmlaunch`.
    Launch,
    /// Every later entry: `vmresume`.
    Resume,
}

impl EntryKind {
    /// Select by the guest's run counter: zero launches, anything else
    /// resumes.
    #[inline]
    pub fn select(runs: u64) -> Self {
        if runs == 0 {
            EntryKind::Launch
        } else {
            EntryKind::Resume
        }
    }

    #[inline]
    fn as_arg(self) -> u64 {
        match self {
            EntryKind::Launch => 0,
            EntryKind::Resume => 1,
        }
    }
}

/// Hand the processor to guest code.
///
/// `rdi` carries the register file, `rsi` 0 to launch or 1 to resume.
/// Returns 0 when a VM-exit brought us back through the landing point,
/// 1 when publishing the host stack failed, 2 when the entry instruction
/// itself failed (no guest code ran).
#[unsafe(naked)]
unsafe extern "C" fn vmx_enter(_regs: &mut GuestRegisters, _kind: u64) -> i8 {
    naked_asm!(
        // Callee-saved registers, then the register-file pointer: the
        // landing point pops these in exact reverse.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push rdi",
        // Publish this stack top as the host RSP the exit resumes with.
        "clc",
        "mov rax, 0x6c14", // Field::HostRsp
        "vmwrite rax, rsp",
        "setna al",
        "cmp al, 0",
        "je 2f",
        "pop rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov al, 1",
        "ret",
        "2:",
        // Reconcile CR2 only when the cached guest view differs; the
        // write is serializing and worth skipping.
        "mov rax, [rdi + 0x78]",
        "mov rdx, cr2",
        "cmp rax, rdx",
        "je 3f",
        "mov cr2, rax",
        "3:",
        // Decide launch vs resume while rsi still holds the selector;
        // the plain moves below leave the flags alone.
        "cmp rsi, 0",
        "mov rax, [rdi + 0x70]",
        "mov rbx, [rdi + 0x68]",
        "mov rcx, [rdi + 0x60]",
        "mov rdx, [rdi + 0x58]",
        "mov rbp, [rdi + 0x50]",
        "mov rsi, [rdi + 0x40]",
        "mov r8, [rdi + 0x38]",
        "mov r9, [rdi + 0x30]",
        "mov r10, [rdi + 0x28]",
        "mov r11, [rdi + 0x20]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x10]",
        "mov r14, [rdi + 0x8]",
        "mov r15, [rdi]",
        "mov rdi, [rdi + 0x48]",
        "je 4f",
        "vmresume",
        "jmp 5f",
        "4:",
        "vmlaunch",
        "5:",
        // Fall-through: the entry instruction failed; restore and report.
        "pop rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov al, 2",
        "ret",
    )
}

/// Where the hardware resumes the host on every VM-exit; the VMCS host
/// RIP points here. Stores the guest registers and CR2 into the register
/// file whose pointer sits on the published stack, restores the
/// callee-saved registers, and returns 0 to [`vmx_enter`]'s caller.
#[unsafe(naked)]
unsafe extern "C" fn vmx_exit_landing() {
    naked_asm!(
        "sub rsp, 8",
        "mov [rsp], rdi",
        "mov rdi, [rsp + 8]",
        "mov [rdi + 0x70], rax",
        "mov rax, cr2",
        "mov [rdi + 0x78], rax",
        "mov [rdi + 0x68], rbx",
        "mov [rdi + 0x60], rcx",
        "mov [rdi + 0x58], rdx",
        "mov [rdi + 0x50], rbp",
        "mov [rdi + 0x40], rsi",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x8], r14",
        "mov [rdi], r15",
        "mov rax, [rsp]",
        "mov [rdi + 0x48], rax",
        "add rsp, 16",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "xor rax, rax",
        "ret",
    )
}

/// The address the VMCS host-RIP field must carry.
pub(crate) fn exit_landing_address() -> u64 {
    vmx_exit_landing as *const () as usize as u64
}

/// Run `guest` on `cpu` until it terminates.
///
/// Each iteration: bind the VMCS (free when already Current), stage any
/// pending virtual interrupt, drop the coarse host lock, enter, retake
/// the lock, classify, dispatch. The scheduler is yielded after every
/// exit. Terminal events — HLT, a shutdown hypercall, any fatal
/// condition — funnel through the terminate-and-reclaim path and end the
/// loop; `Ok` carries the guest's shutdown code, `Err` the reason it was
/// killed.
pub fn run<P: Probe>(
    cpu: &mut CpuContext,
    guest: &mut GuestContext,
    host: &mut HostBridge<'_>,
    probe: &mut P,
) -> Result<i32, VmxError> {
    loop {
        let vmcs = guest.bind(cpu)?;
        if let Err(e) = guest.stage_pending_interrupt(&vmcs) {
            return retire(cpu, guest, host, &vmcs, Err(e));
        }
        let kind = EntryKind::select(guest.runs());

        // The guest will not cooperatively return control; holding the
        // coarse lock across entry would stall every other processor for
        // the whole guest-execution interval.
        host.lock.release();
        let rc = unsafe { vmx_enter(&mut guest.regs, kind.as_arg()) };
        host.lock.acquire();

        if rc != 0 {
            // The entry instruction failed: no guest code executed.
            let err = InstructionError::read_current();
            return retire(cpu, guest, host, &vmcs, Err(VmxError::VmEntryFailed(err)));
        }

        if let Err(e) = guest.note_exit(&vmcs) {
            return retire(cpu, guest, host, &vmcs, Err(e));
        }
        let record = match VmExitRecord::capture(&vmcs) {
            Ok(r) => r,
            Err(e) => return retire(cpu, guest, host, &vmcs, Err(e)),
        };
        match exit::dispatch(&record, guest, host, probe, &vmcs) {
            Ok(Flow::Continue) => host.sched.yield_now(),
            Ok(Flow::Shutdown(code)) => {
                return retire(cpu, guest, host, &vmcs, Ok(code));
            }
            Err(e) => {
                return retire(cpu, guest, host, &vmcs, Err(e));
            }
        }
    }
}

/// The one terminate-and-reclaim routine. Dumps the guest's state with
/// the reason, reclaims everything the guest pinned, and yields before
/// returning the outcome to the embedder.
fn retire(
    cpu: &mut CpuContext,
    guest: &mut GuestContext,
    host: &mut HostBridge<'_>,
    vmcs: &ActiveVmcs,
    outcome: Result<i32, VmxError>,
) -> Result<i32, VmxError> {
    match &outcome {
        Ok(code) => println!("vmx: guest shut down with code {}", code),
        Err(e) => println!("vmx: terminating guest: {:?}", e),
    }
    vmcs.dump();
    guest.retire(cpu);
    host.sched.yield_now();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_counter_selects_launch_then_resume() {
        assert_eq!(EntryKind::select(0), EntryKind::Launch);
        assert_eq!(EntryKind::select(1), EntryKind::Resume);
        assert_eq!(EntryKind::select(2), EntryKind::Resume);
        assert_eq!(EntryKind::select(u64::MAX), EntryKind::Resume);
    }

    #[test]
    fn register_file_layout_matches_trampoline_offsets() {
        let r = GuestRegisters::default();
        let base = &r as *const _ as usize;
        let off = |p: *const usize| p as usize - base;
        assert_eq!(off(&r.r15), 0x00);
        assert_eq!(off(&r.r14), 0x08);
        assert_eq!(off(&r.r13), 0x10);
        assert_eq!(off(&r.r12), 0x18);
        assert_eq!(off(&r.r11), 0x20);
        assert_eq!(off(&r.r10), 0x28);
        assert_eq!(off(&r.r9), 0x30);
        assert_eq!(off(&r.r8), 0x38);
        assert_eq!(off(&r.rsi), 0x40);
        assert_eq!(off(&r.rdi), 0x48);
        assert_eq!(off(&r.rbp), 0x50);
        assert_eq!(off(&r.rdx), 0x58);
        assert_eq!(off(&r.rcx), 0x60);
        assert_eq!(off(&r.rbx), 0x68);
        assert_eq!(off(&r.rax), 0x70);
        assert_eq!(off(&r.cr2), 0x78);
        assert_eq!(core::mem::size_of::<GuestRegisters>(), 0x80);
    }
}
