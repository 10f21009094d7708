//! VM-exit classification and handling.
//!
//! A [`VmExitRecord`] is captured once per exit and consumed within the
//! same dispatch cycle; nothing here persists. Classification goes
//! through the closed [`ExitRoute`] enumeration, so an exit reason
//! without a handler is a compile-time gap rather than a runtime
//! fallthrough, and every unrouted reason lands on the fatal path.

use crate::ept::{Classification, EptFlags, InvalidationScope, MemoryType};
use crate::host::{HostBridge, Hypercall, HypercallDisposition};
use crate::probe::Probe;
use crate::vm::{Gpa, Gva, GuestContext};
use crate::vmcs::{ActiveVmcs, Field};
use crate::VmxError;
use bedrock::addressing::PAGE_MASK;
use bedrock::x86_64::pio::Pio;
use num_enum::TryFromPrimitive;

/// Basic exit reasons, as the hardware numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSmi = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    CrAccess = 28,
    DrAccess = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailGuestState = 33,
    EntryFailMsrLoad = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    EntryFailMachineCheck = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    GdtrIdtrAccess = 46,
    LdtrTrAccess = 47,
    EptViolation = 48,
    EptMisconfig = 49,
    Invept = 50,
    Rdtscp = 51,
    PreemptionTimer = 52,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
}

bitflags::bitflags! {
    /// Exit qualification for EPT violations.
    pub struct EptViolationQualification: u64 {
        /// The access was a data read.
        const READ = 1 << 0;
        /// The access was a data write.
        const WRITE = 1 << 1;
        /// The access was an instruction fetch.
        const FETCH = 1 << 2;
        /// The translation permitted reads.
        const WAS_READABLE = 1 << 3;
        /// The translation permitted writes.
        const WAS_WRITABLE = 1 << 4;
        /// The translation permitted fetches.
        const WAS_EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const GLA_VALID = 1 << 7;
        /// The faulting access was the translation of a linear address
        /// (clear: a page-walk or A/D update access).
        const TRANSLATED = 1 << 8;
    }
}

/// Bit 31 of the exit reason: the exit reports a failed VM entry.
const ENTRY_FAILURE_BIT: u32 = 1 << 31;

/// Compact identification of an exit carried in errors and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Basic exit-reason number.
    pub reason: u16,
    /// Exit qualification.
    pub qualification: u64,
}

/// Everything the dispatcher needs from one VM-exit, read out of the
/// Current VMCS in a single capture.
#[derive(Debug, Clone, Copy)]
pub struct VmExitRecord {
    /// Raw exit-reason field, failure bit included.
    pub reason: u32,
    /// Exit qualification.
    pub qualification: u64,
    /// Interruption information (valid bit 31, type 10:8, vector 7:0).
    pub interruption: u32,
    /// Faulting guest-physical address, meaningful for EPT exits.
    pub guest_physical: u64,
}

/// Where one exit is routed. Closed and exhaustively matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitRoute {
    /// The failure bit was set: a hardware-detected host-state problem.
    /// Always fatal.
    Abort(u16),
    /// An external interrupt, with the acknowledged vector when the
    /// interruption-information field is valid.
    ExternalInterrupt(Option<u8>),
    /// The guest's interrupt window opened.
    InterruptWindow,
    /// RDMSR.
    MsrRead,
    /// WRMSR.
    MsrWrite,
    /// An I/O instruction trapped by the port bitmaps.
    IoInstruction,
    /// CPUID.
    Cpuid,
    /// A guest-physical translation fault.
    EptViolation {
        /// The faulting guest-physical address.
        gpa: u64,
        /// Why it faulted.
        qualification: EptViolationQualification,
    },
    /// VMCALL: the guest-to-host call boundary.
    Hypercall,
    /// HLT. Terminates the guest; there is no wake support.
    Halt,
    /// Everything else: dump and terminate.
    Fatal(u16),
}

/// What the run loop does after a handled exit.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Re-enter the guest (after the scheduler yield).
    Continue,
    /// The guest asked to stop with this code.
    Shutdown(i32),
}

impl VmExitRecord {
    /// Read the exit data out of the Current VMCS.
    pub(crate) fn capture(vmcs: &ActiveVmcs) -> Result<Self, VmxError> {
        Ok(Self {
            reason: vmcs.read(Field::ExitReason)? as u32,
            qualification: vmcs.read(Field::ExitQualification)?,
            interruption: vmcs.read(Field::ExitInterruptionInfo)? as u32,
            guest_physical: vmcs.read(Field::GuestPhysicalAddr)?,
        })
    }

    /// The basic reason number with the failure bit masked off.
    #[inline]
    pub fn basic(&self) -> u16 {
        (self.reason & 0xffff) as u16
    }

    /// Compact identification for errors.
    pub fn info(&self) -> ExitInfo {
        ExitInfo {
            reason: self.basic(),
            qualification: self.qualification,
        }
    }

    /// Classify this exit. The failure bit is masked first; everything
    /// else routes by basic reason.
    pub fn route(&self) -> ExitRoute {
        if self.reason & ENTRY_FAILURE_BIT != 0 {
            return ExitRoute::Abort(self.basic());
        }
        match BasicExitReason::try_from(self.basic()) {
            Ok(BasicExitReason::ExternalInterrupt) => {
                // Table-format interruption info: valid bit 31, type in
                // 10:8 (0 = external interrupt), vector in 7:0.
                let valid =
                    self.interruption & (1 << 31) != 0 && (self.interruption >> 8) & 0x7 == 0;
                ExitRoute::ExternalInterrupt(valid.then(|| self.interruption as u8))
            }
            Ok(BasicExitReason::InterruptWindow) => ExitRoute::InterruptWindow,
            Ok(BasicExitReason::Rdmsr) => ExitRoute::MsrRead,
            Ok(BasicExitReason::Wrmsr) => ExitRoute::MsrWrite,
            Ok(BasicExitReason::IoInstruction) => ExitRoute::IoInstruction,
            Ok(BasicExitReason::Cpuid) => ExitRoute::Cpuid,
            Ok(BasicExitReason::EptViolation) => ExitRoute::EptViolation {
                gpa: self.guest_physical,
                qualification: EptViolationQualification::from_bits_truncate(self.qualification),
            },
            Ok(BasicExitReason::Vmcall) => ExitRoute::Hypercall,
            Ok(BasicExitReason::Hlt) => ExitRoute::Halt,
            Ok(_) | Err(_) => ExitRoute::Fatal(self.basic()),
        }
    }
}

/// The MSRs the guest may read and write, each backed by a VMCS guest
/// field. Anything else is a guest error.
fn msr_field(index: u32) -> Option<Field> {
    match index {
        0xC000_0080 => Some(Field::GuestIa32Efer),
        0xC000_0100 => Some(Field::GuestFsBase),
        0xC000_0101 => Some(Field::GuestGsBase),
        _ => None,
    }
}

/// Dispatch one captured exit.
pub(crate) fn dispatch<P: Probe>(
    record: &VmExitRecord,
    guest: &mut GuestContext,
    host: &mut HostBridge<'_>,
    probe: &mut P,
    vmcs: &ActiveVmcs,
) -> Result<Flow, VmxError> {
    match record.route() {
        ExitRoute::Abort(_) => Err(VmxError::VmAbort(guest.abort_indicator())),
        ExitRoute::ExternalInterrupt(Some(vector)) => {
            // The handler owns acknowledging the interrupt controller.
            host.irq.raise(vector);
            Ok(Flow::Continue)
        }
        ExitRoute::ExternalInterrupt(None) => Err(VmxError::UnhandledExit(record.info())),
        ExitRoute::InterruptWindow => {
            // The window opened for a pended vector; disarm the exit and
            // let the next entry stage the injection.
            vmcs.set_interrupt_window(false)?;
            Ok(Flow::Continue)
        }
        ExitRoute::MsrRead => handle_rdmsr(record, guest, vmcs),
        ExitRoute::MsrWrite => handle_wrmsr(record, guest, vmcs),
        ExitRoute::IoInstruction => handle_io(record, guest, probe, vmcs),
        ExitRoute::Cpuid => handle_cpuid(guest, vmcs),
        ExitRoute::EptViolation { gpa, .. } => handle_ept_violation(record, gpa, guest),
        ExitRoute::Hypercall => handle_hypercall(record, guest, host, vmcs),
        ExitRoute::Halt => Err(VmxError::GuestRequestedHalt),
        ExitRoute::Fatal(_) => Err(VmxError::UnhandledExit(record.info())),
    }
}

fn handle_rdmsr(
    record: &VmExitRecord,
    guest: &mut GuestContext,
    vmcs: &ActiveVmcs,
) -> Result<Flow, VmxError> {
    let index = guest.regs.rcx as u32;
    let field = msr_field(index).ok_or(VmxError::UnhandledExit(record.info()))?;
    let value = vmcs.read(field)?;
    // Result splits across edx:eax with the upper halves cleared.
    guest.regs.rax = (value & 0xffff_ffff) as usize;
    guest.regs.rdx = (value >> 32) as usize;
    vmcs.forward_rip()?;
    Ok(Flow::Continue)
}

fn handle_wrmsr(
    record: &VmExitRecord,
    guest: &mut GuestContext,
    vmcs: &ActiveVmcs,
) -> Result<Flow, VmxError> {
    let index = guest.regs.rcx as u32;
    let field = msr_field(index).ok_or(VmxError::UnhandledExit(record.info()))?;
    let value = ((guest.regs.rdx as u64) << 32) | (guest.regs.rax as u64 & 0xffff_ffff);
    vmcs.write(field, value)?;
    vmcs.forward_rip()?;
    Ok(Flow::Continue)
}

fn handle_cpuid(guest: &mut GuestContext, vmcs: &ActiveVmcs) -> Result<Flow, VmxError> {
    let leaf = guest.regs.rax as u32;
    let subleaf = guest.regs.rcx as u32;
    let mut r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    if leaf == 1 {
        // The initial-APIC-id byte reports the physical core; replace it
        // with the virtual CPU index, and hide VMX from the guest.
        r.ebx = (r.ebx & 0x00ff_ffff) | ((guest.info().vcpu_id as u32) << 24);
        r.ecx &= !(1 << 5);
    }
    guest.regs.rax = r.eax as usize;
    guest.regs.rbx = r.ebx as usize;
    guest.regs.rcx = r.ecx as usize;
    guest.regs.rdx = r.edx as usize;
    vmcs.forward_rip()?;
    Ok(Flow::Continue)
}

#[derive(Clone, Copy)]
enum IoOp {
    In(u8),
    Out(u8),
    InString(u8),
    OutString(u8),
}

fn handle_io<P: Probe>(
    record: &VmExitRecord,
    guest: &mut GuestContext,
    probe: &mut P,
    vmcs: &ActiveVmcs,
) -> Result<Flow, VmxError> {
    use iced_x86::Code;

    let insn = vmcs.read_instruction(probe, guest.frames())?;
    let dx = guest.regs.rdx as u16;
    let imm = || insn.immediate8() as u16;
    let (port, op) = match insn.code() {
        Code::In_AL_imm8 => (imm(), IoOp::In(1)),
        Code::In_AX_imm8 => (imm(), IoOp::In(2)),
        Code::In_EAX_imm8 => (imm(), IoOp::In(4)),
        Code::In_AL_DX => (dx, IoOp::In(1)),
        Code::In_AX_DX => (dx, IoOp::In(2)),
        Code::In_EAX_DX => (dx, IoOp::In(4)),
        Code::Out_imm8_AL => (imm(), IoOp::Out(1)),
        Code::Out_imm8_AX => (imm(), IoOp::Out(2)),
        Code::Out_imm8_EAX => (imm(), IoOp::Out(4)),
        Code::Out_DX_AL => (dx, IoOp::Out(1)),
        Code::Out_DX_AX => (dx, IoOp::Out(2)),
        Code::Out_DX_EAX => (dx, IoOp::Out(4)),
        Code::Insb_m8_DX => (dx, IoOp::InString(1)),
        Code::Insw_m16_DX => (dx, IoOp::InString(2)),
        Code::Insd_m32_DX => (dx, IoOp::InString(4)),
        Code::Outsb_DX_m8 => (dx, IoOp::OutString(1)),
        Code::Outsw_DX_m16 => (dx, IoOp::OutString(2)),
        Code::Outsd_DX_m32 => (dx, IoOp::OutString(4)),
        _ => return Err(VmxError::FailedToDecodeInstruction),
    };

    if !guest.info().port_authorized(port) {
        return Err(VmxError::UnhandledExit(record.info()));
    }

    let pio = Pio::new(port);
    match op {
        IoOp::In(1) => guest.regs.rax = (guest.regs.rax & !0xff) | pio.read_u8() as usize,
        IoOp::In(2) => guest.regs.rax = (guest.regs.rax & !0xffff) | pio.read_u16() as usize,
        // A 32-bit destination zero-extends.
        IoOp::In(_) => guest.regs.rax = pio.read_u32() as usize,
        IoOp::Out(1) => pio.write_u8(guest.regs.rax as u8),
        IoOp::Out(2) => pio.write_u16(guest.regs.rax as u16),
        IoOp::Out(_) => pio.write_u32(guest.regs.rax as u32),
        IoOp::InString(size) | IoOp::OutString(size) => {
            let input = matches!(op, IoOp::InString(_));
            let mut count = if insn.has_rep_prefix() {
                guest.regs.rcx
            } else {
                1
            };
            // Forward direction assumed; the engine does not emulate
            // DF=1 string I/O.
            while count > 0 {
                let cursor = if input { guest.regs.rdi } else { guest.regs.rsi };
                let gva = Gva::new(cursor).ok_or(VmxError::FailedToDecodeInstruction)?;
                let hpa = probe
                    .gva2hpa(vmcs, gva)
                    .ok_or(VmxError::FailedToDecodeInstruction)?;
                let hva = guest
                    .frames()
                    .pa_to_va(hpa)
                    .ok_or(VmxError::FailedToDecodeInstruction)?
                    .into_usize();
                unsafe {
                    match (input, size) {
                        (true, 1) => (hva as *mut u8).write_volatile(pio.read_u8()),
                        (true, 2) => (hva as *mut u16).write_volatile(pio.read_u16()),
                        (true, _) => (hva as *mut u32).write_volatile(pio.read_u32()),
                        (false, 1) => pio.write_u8((hva as *const u8).read_volatile()),
                        (false, 2) => pio.write_u16((hva as *const u16).read_volatile()),
                        (false, _) => pio.write_u32((hva as *const u32).read_volatile()),
                    }
                }
                if input {
                    guest.regs.rdi += size as usize;
                } else {
                    guest.regs.rsi += size as usize;
                }
                count -= 1;
            }
            if insn.has_rep_prefix() {
                guest.regs.rcx = 0;
            }
        }
    }

    vmcs.forward_rip()?;
    Ok(Flow::Continue)
}

fn handle_ept_violation(
    record: &VmExitRecord,
    gpa_raw: u64,
    guest: &mut GuestContext,
) -> Result<Flow, VmxError> {
    let page = Gpa::new(gpa_raw as usize & !PAGE_MASK).ok_or(VmxError::UnhandledExit(record.info()))?;
    match guest.ept().classify(page) {
        Classification::Unmapped if (gpa_raw as usize) < guest.info().phys_sz => {
            // A valid guest-physical page touched for the first time:
            // populate it and flush the stale not-present translation.
            let frame = guest.frames().alloc().ok_or(VmxError::OutOfFrames)?;
            guest
                .ept_mut()
                .map(page, frame, EptFlags::FULL, MemoryType::WriteBack)
                .map_err(|_| VmxError::UnhandledExit(record.info()))?;
            guest.ept().invalidate(InvalidationScope::SingleContext);
            Ok(Flow::Continue)
        }
        // Out-of-range, a genuine permission violation, or a
        // misconfigured entry: all fatal to the guest.
        _ => Err(VmxError::UnhandledExit(record.info())),
    }
}

fn handle_hypercall(
    record: &VmExitRecord,
    guest: &mut GuestContext,
    host: &mut HostBridge<'_>,
    vmcs: &ActiveVmcs,
) -> Result<Flow, VmxError> {
    let call = Hypercall::try_from(guest.regs.rax as u64)
        .map_err(|_| VmxError::UnhandledExit(record.info()))?;
    match host.hypercalls.handle(call, &mut guest.regs)? {
        HypercallDisposition::Ret(v) => {
            guest.regs.rax = v as usize;
            vmcs.forward_rip()?;
            Ok(Flow::Continue)
        }
        HypercallDisposition::Shutdown(code) => Ok(Flow::Shutdown(code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostLock, HostScheduler, HypercallSink, IrqSink};
    use crate::vcpu::GuestRegisters;
    use std::cell::{Cell, RefCell};

    fn record(reason: u32) -> VmExitRecord {
        VmExitRecord {
            reason,
            qualification: 0,
            interruption: 0,
            guest_physical: 0,
        }
    }

    #[test]
    fn every_claimed_reason_routes_to_its_handler() {
        let mut ext = record(1);
        ext.interruption = (1 << 31) | 0x20;
        assert_eq!(ext.route(), ExitRoute::ExternalInterrupt(Some(0x20)));
        assert_eq!(record(7).route(), ExitRoute::InterruptWindow);
        assert_eq!(record(31).route(), ExitRoute::MsrRead);
        assert_eq!(record(32).route(), ExitRoute::MsrWrite);
        assert_eq!(record(30).route(), ExitRoute::IoInstruction);
        assert_eq!(record(10).route(), ExitRoute::Cpuid);
        assert_eq!(record(18).route(), ExitRoute::Hypercall);
        assert_eq!(record(12).route(), ExitRoute::Halt);
        let mut ept = record(48);
        ept.guest_physical = 0xcafe_0000;
        ept.qualification = 0b10;
        assert_eq!(
            ept.route(),
            ExitRoute::EptViolation {
                gpa: 0xcafe_0000,
                qualification: EptViolationQualification::WRITE,
            }
        );
    }

    #[test]
    fn unclaimed_reasons_reach_the_fatal_route() {
        for reason in [0u32, 2, 9, 13, 14, 28, 33, 49, 54, 55] {
            assert_eq!(record(reason).route(), ExitRoute::Fatal(reason as u16));
        }
        // A reason number the hardware has not defined yet.
        assert_eq!(record(0x777).route(), ExitRoute::Fatal(0x777));
    }

    #[test]
    fn failure_bit_masks_to_abort() {
        let r = record(33 | (1 << 31));
        assert_eq!(r.route(), ExitRoute::Abort(33));
        // Even a normally-routable reason aborts when the failure bit is
        // set.
        let r = record(12 | (1 << 31));
        assert_eq!(r.route(), ExitRoute::Abort(12));
    }

    #[test]
    fn external_interrupt_without_valid_info_has_no_vector() {
        let mut r = record(1);
        r.interruption = 0x20; // valid bit clear
        assert_eq!(r.route(), ExitRoute::ExternalInterrupt(None));
        // An NMI-typed event is not an acknowledged external vector.
        r.interruption = (1 << 31) | (2 << 8) | 0x2;
        assert_eq!(r.route(), ExitRoute::ExternalInterrupt(None));
    }

    #[test]
    fn msr_allow_list_is_closed() {
        assert_eq!(msr_field(0xC000_0080), Some(Field::GuestIa32Efer));
        assert_eq!(msr_field(0xC000_0100), Some(Field::GuestFsBase));
        assert_eq!(msr_field(0xC000_0101), Some(Field::GuestGsBase));
        assert!(msr_field(0x10).is_none()); // TSC
        assert!(msr_field(0x1B).is_none()); // APIC_BASE
        assert!(msr_field(0x277).is_none()); // PAT
    }

    // Host seam mocks for the vmcs-free dispatch paths.
    struct Mocks {
        yields: Cell<usize>,
        vectors: RefCell<Vec<u8>>,
        lock_depth: Cell<isize>,
    }

    impl HostScheduler for Mocks {
        fn yield_now(&self) {
            self.yields.set(self.yields.get() + 1);
        }
    }
    impl IrqSink for Mocks {
        fn raise(&self, vector: u8) {
            self.vectors.borrow_mut().push(vector);
        }
    }
    impl HostLock for Mocks {
        fn acquire(&self) {
            self.lock_depth.set(self.lock_depth.get() + 1);
        }
        fn release(&self) {
            self.lock_depth.set(self.lock_depth.get() - 1);
        }
    }

    struct NoCalls;
    impl HypercallSink for NoCalls {
        fn handle(
            &mut self,
            _call: Hypercall,
            _regs: &mut GuestRegisters,
        ) -> Result<HypercallDisposition, VmxError> {
            unreachable!("no hypercall expected")
        }
    }

    struct NoProbe;
    impl Probe for NoProbe {
        fn gpa2hpa(
            &self,
            _vmcs: &ActiveVmcs,
            _gpa: Gpa,
        ) -> Option<bedrock::addressing::Pa> {
            None
        }
        fn gva2hpa(
            &self,
            _vmcs: &ActiveVmcs,
            _gva: Gva,
        ) -> Option<bedrock::addressing::Pa> {
            None
        }
    }

    fn with_host<R>(f: impl FnOnce(&mut HostBridge<'_>, &Mocks) -> R) -> R {
        let mocks = Mocks {
            yields: Cell::new(0),
            vectors: RefCell::new(Vec::new()),
            lock_depth: Cell::new(0),
        };
        let mut sink = NoCalls;
        let mut host = HostBridge {
            sched: &mocks,
            irq: &mocks,
            lock: &mocks,
            hypercalls: &mut sink,
        };
        f(&mut host, &mocks)
    }

    fn test_guest() -> (GuestContext, crate::CpuContext) {
        use crate::ept::tests::HeapFrames;
        let frames: &'static HeapFrames = HeapFrames::leaked();
        let snap = crate::vm::tests::test_snapshot();
        let controls = crate::caps::compute_controls(&snap).unwrap();
        (
            GuestContext::new(frames, &snap, controls, 0, 16 << 20).unwrap(),
            crate::CpuContext::bring_up(0),
        )
    }

    #[test]
    fn halt_terminates_and_unknown_reasons_are_unhandled() {
        let (mut guest, _cpu) = test_guest();
        let mut probe = NoProbe;
        let vmcs = ActiveVmcs::test_token();
        with_host(|host, _| {
            assert_eq!(
                dispatch(&record(12), &mut guest, host, &mut probe, &vmcs),
                Err(VmxError::GuestRequestedHalt)
            );
            assert_eq!(
                dispatch(&record(2), &mut guest, host, &mut probe, &vmcs),
                Err(VmxError::UnhandledExit(ExitInfo {
                    reason: 2,
                    qualification: 0
                }))
            );
        });
    }

    #[test]
    fn external_interrupt_forwards_the_vector() {
        let (mut guest, _cpu) = test_guest();
        let mut probe = NoProbe;
        let vmcs = ActiveVmcs::test_token();
        with_host(|host, mocks| {
            let mut r = record(1);
            r.interruption = (1 << 31) | 0x30;
            assert_eq!(
                dispatch(&r, &mut guest, host, &mut probe, &vmcs),
                Ok(Flow::Continue)
            );
            assert_eq!(mocks.vectors.borrow().as_slice(), &[0x30]);
        });
    }

    #[test]
    fn abort_reports_the_region_indicator() {
        let (mut guest, _cpu) = test_guest();
        let mut probe = NoProbe;
        let vmcs = ActiveVmcs::test_token();
        with_host(|host, _| {
            assert_eq!(
                dispatch(&record(33 | (1 << 31)), &mut guest, host, &mut probe, &vmcs),
                Err(VmxError::VmAbort(0))
            );
        });
    }

    #[test]
    fn ept_violation_on_valid_page_populates_and_continues() {
        let (mut guest, _cpu) = test_guest();
        let mut r = record(48);
        r.guest_physical = 0x0030_0123; // within the 16MB guest span
        // classify: nothing mapped yet.
        assert_eq!(
            guest.ept().classify(Gpa::new(0x0030_0000).unwrap()),
            Classification::Unmapped
        );
        let flow = handle_ept_violation(&r, r.guest_physical, &mut guest);
        assert_eq!(flow, Ok(Flow::Continue));
        // The page is now mapped read/write/execute and the stale
        // translation was flushed.
        assert_eq!(
            guest.ept().classify(Gpa::new(0x0030_0000).unwrap()),
            Classification::Mapped(EptFlags::FULL)
        );
        assert_eq!(guest.ept().invalidation_count(), 1);
    }

    #[test]
    fn ept_violation_out_of_range_is_fatal() {
        let (mut guest, _cpu) = test_guest();
        let mut r = record(48);
        r.guest_physical = 0x4000_0000; // past the 16MB guest span
        assert!(handle_ept_violation(&r, r.guest_physical, &mut guest).is_err());
        assert_eq!(
            guest.ept().classify(Gpa::new(0x4000_0000).unwrap()),
            Classification::Unmapped
        );
    }
}
