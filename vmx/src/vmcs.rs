//! Virtual-machine control structure lifecycle and access.
//!
//! A VMCS is a hardware-owned 4KB region read and written only through
//! `vmread`/`vmwrite` while it is Current on the executing processor. The
//! lifecycle is rigid: a region must be cleared (`vmclear`) before its
//! first use and whenever it migrates between processors, and loaded
//! (`vmptrld`) before any field access. Exactly one VMCS is Current per
//! logical processor; [`crate::CpuContext`] tracks which, so re-loading
//! the one that is already Current costs nothing.

use crate::caps::NegotiatedControls;
use crate::controls::ProcControls;
use crate::ept::EptPointer;
use crate::host::{Frame, FrameSource};
use crate::probe::Probe;
use crate::vm::{Gva, GuestVcpuInfo};
use crate::{CpuContext, VmxError};
use bedrock::addressing::Pa;
use bedrock::x86_64::{read_cr3, segmentation, Cr0, Cr4, Rflags};
use core::arch::asm;
use iced_x86::{Decoder, DecoderOptions, Instruction};

/// Vmcs field encodings.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    // 16-bit guest state.
    GuestEsSelector = 0x00000800,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    GuestDsSelector = 0x00000806,
    GuestFsSelector = 0x00000808,
    GuestGsSelector = 0x0000080A,
    GuestLdtrSelector = 0x0000080C,
    GuestTrSelector = 0x0000080E,
    // 16-bit host state.
    HostEsSelector = 0x00000C00,
    HostCsSelector = 0x00000C02,
    HostSsSelector = 0x00000C04,
    HostDsSelector = 0x00000C06,
    HostFsSelector = 0x00000C08,
    HostGsSelector = 0x00000C0A,
    HostTrSelector = 0x00000C0C,
    // 64-bit control fields.
    IoBitmapA = 0x00002000,
    IoBitmapB = 0x00002002,
    VmexitMsrStoreAddr = 0x00002006,
    VmexitMsrLoadAddr = 0x00002008,
    VmentryMsrLoadAddr = 0x0000200A,
    Eptptr = 0x0000201A,
    // 64-bit read-only data.
    GuestPhysicalAddr = 0x00002400,
    // 64-bit guest state.
    GuestLinkPointer = 0x00002800,
    GuestIa32Debugctl = 0x00002802,
    GuestIa32Efer = 0x00002806,
    // 64-bit host state.
    HostIa32Efer = 0x00002C02,
    // 32-bit control fields.
    PinBasedControls = 0x00004000,
    ProcBasedControls = 0x00004002,
    ExceptionBitmap = 0x00004004,
    Cr3TargetCount = 0x0000400A,
    ExitControls = 0x0000400C,
    ExitMsrStoreCount = 0x0000400E,
    ExitMsrLoadCount = 0x00004010,
    EntryControls = 0x00004012,
    EntryMsrLoadCount = 0x00004014,
    EntryInterruptionInfo = 0x00004016,
    EntryExceptionErrorCode = 0x00004018,
    EntryInstructionLength = 0x0000401A,
    SecondaryControls = 0x0000401E,
    // 32-bit read-only data.
    InstructionError = 0x00004400,
    ExitReason = 0x00004402,
    ExitInterruptionInfo = 0x00004404,
    ExitInterruptionErrorCode = 0x00004406,
    IdtVectoringInfo = 0x00004408,
    IdtVectoringErrorCode = 0x0000440A,
    ExitInstructionLength = 0x0000440C,
    ExitInstructionInfo = 0x0000440E,
    // 32-bit guest state.
    GuestEsLimit = 0x00004800,
    GuestCsLimit = 0x00004802,
    GuestSsLimit = 0x00004804,
    GuestDsLimit = 0x00004806,
    GuestFsLimit = 0x00004808,
    GuestGsLimit = 0x0000480A,
    GuestLdtrLimit = 0x0000480C,
    GuestTrLimit = 0x0000480E,
    GuestGdtrLimit = 0x00004810,
    GuestIdtrLimit = 0x00004812,
    GuestEsAccessRights = 0x00004814,
    GuestCsAccessRights = 0x00004816,
    GuestSsAccessRights = 0x00004818,
    GuestDsAccessRights = 0x0000481A,
    GuestFsAccessRights = 0x0000481C,
    GuestGsAccessRights = 0x0000481E,
    GuestLdtrAccessRights = 0x00004820,
    GuestTrAccessRights = 0x00004822,
    GuestInterruptibilityState = 0x00004824,
    GuestActivityState = 0x00004826,
    GuestSysenterCs = 0x0000482A,
    // 32-bit host state.
    HostSysenterCs = 0x00004C00,
    // Natural-width read-only data.
    ExitQualification = 0x00006400,
    GuestLinearAddr = 0x0000640A,
    // Natural-width guest state.
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestEsBase = 0x00006806,
    GuestCsBase = 0x00006808,
    GuestSsBase = 0x0000680A,
    GuestDsBase = 0x0000680C,
    GuestFsBase = 0x0000680E,
    GuestGsBase = 0x00006810,
    GuestLdtrBase = 0x00006812,
    GuestTrBase = 0x00006814,
    GuestGdtrBase = 0x00006816,
    GuestIdtrBase = 0x00006818,
    GuestDr7 = 0x0000681A,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    GuestPendingDbgExceptions = 0x00006822,
    GuestSysenterEsp = 0x00006824,
    GuestSysenterEip = 0x00006826,
    // Natural-width host state.
    HostCr0 = 0x00006C00,
    HostCr3 = 0x00006C02,
    HostCr4 = 0x00006C04,
    HostFsBase = 0x00006C06,
    HostGsBase = 0x00006C08,
    HostTrBase = 0x00006C0A,
    HostGdtrBase = 0x00006C0C,
    HostIdtrBase = 0x00006C0E,
    HostSysenterEsp = 0x00006C10,
    HostSysenterEip = 0x00006C12,
    HostRsp = 0x00006C14,
    HostRip = 0x00006C16,
}

/// VM-instruction error numbers, as reported in the instruction-error
/// field after a failed VMX instruction.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy)]
#[allow(missing_docs)]
pub enum InstructionError {
    VmcallInRoot,
    VmclearInvalidAddress,
    VmclearVmxonPointer,
    VmlaunchNonclearVmcs,
    VmresumeNonlaunchedVmcs,
    VmresumeAfterVmxoff,
    EntryInvalidControlFields,
    EntryInvalidHostState,
    VmptrldInvalidAddress,
    VmptrldVmxonPointer,
    VmptrldIncorrectRevision,
    UnsupportedVmcsField,
    VmwriteReadOnlyField,
    VmxonInRoot,
    EntryInvalidExecutiveVmcs,
    EntryNonlaunchedExecutiveVmcs,
    EntryExecutiveVmcsNotVmxon,
    VmcallNonclearVmcs,
    VmcallInvalidExitControls,
    VmcallIncorrectMsegRevision,
    VmxoffDualMonitor,
    VmcallInvalidSmmFeatures,
    EntryInvalidExecutionControlsSmm,
    EntryEventsBlockedByMovSs,
    InvalidInveptOperand,
    Unknown,
}

impl InstructionError {
    /// Decode the hardware error number.
    pub fn from_number(v: u64) -> Self {
        match v {
            1 => Self::VmcallInRoot,
            2 => Self::VmclearInvalidAddress,
            3 => Self::VmclearVmxonPointer,
            4 => Self::VmlaunchNonclearVmcs,
            5 => Self::VmresumeNonlaunchedVmcs,
            6 => Self::VmresumeAfterVmxoff,
            7 => Self::EntryInvalidControlFields,
            8 => Self::EntryInvalidHostState,
            9 => Self::VmptrldInvalidAddress,
            10 => Self::VmptrldVmxonPointer,
            11 => Self::VmptrldIncorrectRevision,
            12 => Self::UnsupportedVmcsField,
            13 => Self::VmwriteReadOnlyField,
            15 => Self::VmxonInRoot,
            16 => Self::EntryInvalidExecutiveVmcs,
            17 => Self::EntryNonlaunchedExecutiveVmcs,
            18 => Self::EntryExecutiveVmcsNotVmxon,
            19 => Self::VmcallNonclearVmcs,
            20 => Self::VmcallInvalidExitControls,
            22 => Self::VmcallIncorrectMsegRevision,
            23 => Self::VmxoffDualMonitor,
            24 => Self::VmcallInvalidSmmFeatures,
            25 => Self::EntryInvalidExecutionControlsSmm,
            26 => Self::EntryEventsBlockedByMovSs,
            28 => Self::InvalidInveptOperand,
            _ => Self::Unknown,
        }
    }

    /// Read and decode the instruction-error field of the Current VMCS.
    pub(crate) fn read_current() -> Self {
        unsafe {
            let err: i8;
            let v: u64;
            asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) Field::InstructionError as u64,
                out(reg_byte) err,
            );
            if err != 0 {
                Self::Unknown
            } else {
                Self::from_number(v)
            }
        }
    }
}

/// What binding a guest's VMCS to a processor has to do.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BindAction {
    /// Already Current here; field access is immediately legal.
    Reuse,
    /// First use (or post-migration): clear, then load.
    ClearThenLoad,
    /// Cleared earlier; a load suffices.
    Load,
}

/// A guest's control-structure region.
///
/// States: Uninitialized → Cleared → Current. The region is stamped with
/// the hardware revision identifier at allocation; `clear` and `load`
/// move it through the rest of the lifecycle.
pub struct VmcsRegion {
    frame: Frame,
    cleared: bool,
    /// Static fields have been written once.
    pub(crate) init: bool,
    /// Which processor's host state is currently in the region.
    pub(crate) home: Option<usize>,
}

impl VmcsRegion {
    /// Allocate a region and stamp the revision identifier.
    pub fn new(frames: &dyn FrameSource, revision_id: u32) -> Result<Self, VmxError> {
        let frame = frames.alloc().ok_or(VmxError::OutOfFrames)?;
        unsafe {
            // Bits 30:0 hold the revision; bit 31 (shadow indicator) stays 0.
            (frame.va().into_usize() as *mut u32).write_volatile(revision_id & 0x7fff_ffff);
        }
        Ok(Self {
            frame,
            cleared: false,
            init: false,
            home: None,
        })
    }

    /// Physical address of the region.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.frame.pa()
    }

    /// The VMX-abort indicator the hardware writes on a failed exit.
    pub fn abort_indicator(&self) -> u32 {
        unsafe { ((self.frame.va().into_usize() + 4) as *const u32).read_volatile() }
    }

    pub(crate) fn plan_bind(&self, current: Option<Pa>) -> BindAction {
        if current == Some(self.pa()) {
            BindAction::Reuse
        } else if self.cleared {
            BindAction::Load
        } else {
            BindAction::ClearThenLoad
        }
    }

    /// `vmclear`: write back cached state and mark the region clear. The
    /// region stops being Current anywhere.
    pub(crate) fn clear(&mut self) -> Result<(), VmxError> {
        let pa = self.pa().into_usize();
        let err: i8;
        unsafe {
            asm!(
                "clc",
                "vmclear [{}]",
                "setna {}",
                in(reg) &pa,
                out(reg_byte) err,
            );
        }
        if err != 0 {
            Err(VmxError::VmcsInitFailed(InstructionError::read_current()))
        } else {
            self.cleared = true;
            Ok(())
        }
    }

    /// `vmptrld`: make this region Current on the executing processor.
    fn load(&self) -> Result<(), VmxError> {
        let pa = self.pa().into_usize();
        let err: i8;
        unsafe {
            asm!(
                "clc",
                "vmptrld [{}]",
                "setna {}",
                in(reg) &pa,
                out(reg_byte) err,
            );
        }
        if err != 0 {
            Err(VmxError::VmcsInitFailed(InstructionError::read_current()))
        } else {
            Ok(())
        }
    }

    /// Make this region Current on `cpu`, clearing first when the
    /// lifecycle demands it. Re-binding the region that is already
    /// Current is free and skips everything.
    pub(crate) fn bind(&mut self, cpu: &mut CpuContext) -> Result<ActiveVmcs, VmxError> {
        match self.plan_bind(cpu.current_vmcs) {
            BindAction::Reuse => {}
            BindAction::ClearThenLoad => {
                self.clear()?;
                self.load()?;
                cpu.current_vmcs = Some(self.pa());
            }
            BindAction::Load => {
                self.load()?;
                cpu.current_vmcs = Some(self.pa());
            }
        }
        Ok(ActiveVmcs { _p: () })
    }

    /// Unbind from `cpu` (clearing the region), e.g. before migrating the
    /// guest to another processor.
    pub(crate) fn unbind(&mut self, cpu: &mut CpuContext) -> Result<(), VmxError> {
        self.clear()?;
        if cpu.current_vmcs == Some(self.pa()) {
            cpu.current_vmcs = None;
        }
        Ok(())
    }

    pub(crate) fn into_frame(self) -> Frame {
        self.frame
    }
}

/// Access to the VMCS that is Current on this processor.
///
/// A zero-sized token: constructing one is only legal through
/// [`VmcsRegion::bind`], which guarantees the lifecycle reached Current.
pub struct ActiveVmcs {
    _p: (),
}

impl ActiveVmcs {
    /// A token for exercising vmcs-free dispatch paths in host tests.
    #[cfg(test)]
    pub(crate) fn test_token() -> Self {
        Self { _p: () }
    }

    /// Write to a field of the Current VMCS.
    pub fn write(&self, field: Field, v: u64) -> Result<(), VmxError> {
        unsafe {
            let err: i8;
            asm!(
                "clc",
                "vmwrite {}, {}",
                "setna {}",
                in(reg) field as u64,
                in(reg) v,
                out(reg_byte) err,
            );
            if err != 0 {
                Err(VmxError::VmcsInitFailed(InstructionError::read_current()))
            } else {
                Ok(())
            }
        }
    }

    /// Read a field of the Current VMCS.
    pub fn read(&self, field: Field) -> Result<u64, VmxError> {
        unsafe {
            let err: i8;
            let v: u64;
            asm!(
                "clc",
                "vmread {}, {}",
                "setna {}",
                out(reg) v,
                in(reg) field as u64,
                out(reg_byte) err,
            );
            if err != 0 {
                Err(VmxError::VmcsInitFailed(InstructionError::read_current()))
            } else {
                Ok(v)
            }
        }
    }

    /// Advance guest RIP over the instruction that caused the exit.
    pub fn forward_rip(&self) -> Result<(), VmxError> {
        self.write(
            Field::GuestRip,
            self.read(Field::GuestRip)? + self.read(Field::ExitInstructionLength)?,
        )
    }

    /// Fetch and decode the guest instruction at the exit RIP.
    pub fn read_instruction<P: Probe>(
        &self,
        probe: &P,
        frames: &dyn FrameSource,
    ) -> Result<Instruction, VmxError> {
        let rip = self.read(Field::GuestRip)?;
        // An x86 instruction is at most 15 bytes.
        let len = (self.read(Field::ExitInstructionLength)? as usize).min(15);
        let gva = Gva::new(rip as usize).ok_or(VmxError::FailedToDecodeInstruction)?;
        let hpa = probe
            .gva2hpa(self, gva)
            .ok_or(VmxError::FailedToDecodeInstruction)?;
        let hva = frames
            .pa_to_va(hpa)
            .ok_or(VmxError::FailedToDecodeInstruction)?;
        let mut bytes = [0u8; 15];
        bytes[..len].copy_from_slice(unsafe {
            core::slice::from_raw_parts(hva.into_usize() as *const u8, len)
        });

        let mut decoder = Decoder::with_ip(64, &bytes[..len], rip, DecoderOptions::NONE);
        let mut insn = Instruction::default();
        if decoder.can_decode() {
            decoder.decode_out(&mut insn);
            Ok(insn)
        } else {
            Err(VmxError::FailedToDecodeInstruction)
        }
    }

    /// Structured dump of the guest state for postmortem use; printed on
    /// every fatal path.
    pub fn dump(&self) {
        let read = |f: Field| self.read(f).unwrap_or(0);
        println!("vmx: --- Begin VCPU Dump ---");
        println!(
            "vmx: RIP 0x{:016x} RSP 0x{:016x} RFLAGS 0x{:x}",
            read(Field::GuestRip),
            read(Field::GuestRsp),
            read(Field::GuestRflags),
        );
        println!(
            "vmx: CR0 {:?} CR3 0x{:x} CR4 {:?}",
            Cr0::from_bits_truncate(read(Field::GuestCr0)),
            read(Field::GuestCr3),
            Cr4::from_bits_truncate(read(Field::GuestCr4)),
        );
        println!(
            "vmx: EFER 0x{:x} proc-controls 0x{:x}/0x{:x}",
            read(Field::GuestIa32Efer),
            read(Field::ProcBasedControls),
            read(Field::SecondaryControls),
        );
        for (name, base, limit, rights) in [
            ("CS", Field::GuestCsBase, Field::GuestCsLimit, Field::GuestCsAccessRights),
            ("DS", Field::GuestDsBase, Field::GuestDsLimit, Field::GuestDsAccessRights),
            ("ES", Field::GuestEsBase, Field::GuestEsLimit, Field::GuestEsAccessRights),
            ("SS", Field::GuestSsBase, Field::GuestSsLimit, Field::GuestSsAccessRights),
            ("FS", Field::GuestFsBase, Field::GuestFsLimit, Field::GuestFsAccessRights),
            ("GS", Field::GuestGsBase, Field::GuestGsLimit, Field::GuestGsAccessRights),
        ] {
            println!(
                "vmx: {}: base 0x{:x} limit 0x{:x} rights 0x{:x}",
                name,
                read(base),
                read(limit),
                read(rights),
            );
        }
        println!("vmx: --- End VCPU Dump ---");
    }

    /// Write everything in the host and guest areas that never changes
    /// over a guest's life on one processor. Runs exactly once per guest;
    /// a later load of an already-populated VMCS must not repeat it.
    pub(crate) fn init_static_fields(
        &self,
        landing_rip: u64,
        controls: &NegotiatedControls,
    ) -> Result<(), VmxError> {
        self.init_host_state(landing_rip)?;
        self.init_guest_state(controls)
    }

    /// Write the host-state area: the state the processor resumes with at
    /// the trampoline's landing point on every VM-exit. Everything except
    /// RSP (written per-entry by the trampoline) is static per processor.
    pub(crate) fn init_host_state(&self, landing_rip: u64) -> Result<(), VmxError> {
        self.write(Field::HostCr0, Cr0::current().bits())?;
        self.write(Field::HostCr3, read_cr3())?;
        self.write(Field::HostCr4, Cr4::current().bits())?;

        self.write(Field::HostCsSelector, segmentation::cs().pack() as u64)?;
        self.write(Field::HostSsSelector, segmentation::ss().pack() as u64)?;
        self.write(Field::HostDsSelector, segmentation::ds().pack() as u64)?;
        self.write(Field::HostEsSelector, segmentation::es().pack() as u64)?;
        self.write(Field::HostFsSelector, segmentation::fs().pack() as u64)?;
        self.write(Field::HostGsSelector, segmentation::gs().pack() as u64)?;
        let tr = segmentation::tr();
        self.write(Field::HostTrSelector, tr.pack() as u64)?;

        let gdt = segmentation::sgdt();
        let idt = segmentation::sidt();
        self.write(Field::HostGdtrBase, gdt.base)?;
        self.write(Field::HostIdtrBase, idt.base)?;
        self.write(Field::HostTrBase, unsafe {
            segmentation::tss_base(&gdt, tr)
        })?;

        self.write(Field::HostFsBase, 0)?;
        self.write(Field::HostGsBase, 0)?;
        self.write(Field::HostSysenterCs, 0)?;
        self.write(Field::HostSysenterEsp, 0)?;
        self.write(Field::HostSysenterEip, 0)?;

        self.write(Field::HostRip, landing_rip)
    }

    /// Write the guest-state area a fresh guest starts from: a flat
    /// descriptor model with zero bases, generous limits, and the standard
    /// access-rights encodings; control registers zero apart from the
    /// mandatory fixed bits; no pending debug or interruptibility state.
    fn init_guest_state(&self, controls: &NegotiatedControls) -> Result<(), VmxError> {
        for sel in [
            Field::GuestCsSelector,
            Field::GuestEsSelector,
            Field::GuestSsSelector,
            Field::GuestDsSelector,
            Field::GuestFsSelector,
            Field::GuestGsSelector,
            Field::GuestTrSelector,
            Field::GuestLdtrSelector,
        ] {
            self.write(sel, 0)?;
        }
        for base in [
            Field::GuestCsBase,
            Field::GuestEsBase,
            Field::GuestSsBase,
            Field::GuestDsBase,
            Field::GuestFsBase,
            Field::GuestGsBase,
            Field::GuestLdtrBase,
            Field::GuestTrBase,
            Field::GuestGdtrBase,
            Field::GuestIdtrBase,
        ] {
            self.write(base, 0)?;
        }
        for limit in [
            Field::GuestCsLimit,
            Field::GuestEsLimit,
            Field::GuestSsLimit,
            Field::GuestDsLimit,
            Field::GuestFsLimit,
            Field::GuestGsLimit,
            Field::GuestLdtrLimit,
        ] {
            self.write(limit, 0xffff)?;
        }
        self.write(Field::GuestTrLimit, 0xfffff)?;
        self.write(Field::GuestGdtrLimit, 0x30)?;
        self.write(Field::GuestIdtrLimit, 0x3ff)?;

        // Standard encodings: accessed code for CS, accessed read/write
        // data elsewhere, LDT and busy-TSS system types.
        self.write(Field::GuestCsAccessRights, 0x9b)?;
        for ar in [
            Field::GuestEsAccessRights,
            Field::GuestSsAccessRights,
            Field::GuestDsAccessRights,
            Field::GuestFsAccessRights,
            Field::GuestGsAccessRights,
        ] {
            self.write(ar, 0x93)?;
        }
        self.write(Field::GuestLdtrAccessRights, 0x82)?;
        self.write(Field::GuestTrAccessRights, 0x8b)?;

        self.write(Field::GuestActivityState, 0)?;
        self.write(Field::GuestInterruptibilityState, 0)?;

        self.write(Field::GuestCr0, Cr0::NE.bits())?;
        self.write(Field::GuestCr3, 0)?;
        self.write(Field::GuestCr4, Cr4::VMXE.bits())?;
        self.write(Field::GuestIa32Efer, controls.guest_efer)?;

        // No VMCS shadowing: the link pointer is all ones.
        self.write(Field::GuestLinkPointer, u64::MAX)?;
        self.write(Field::GuestDr7, 0)?;
        self.write(Field::GuestIa32Debugctl, 0)?;
        self.write(Field::GuestPendingDbgExceptions, 0)?;
        self.write(Field::GuestSysenterCs, 0)?;
        self.write(Field::GuestSysenterEsp, 0)?;
        self.write(Field::GuestSysenterEip, 0)?;

        self.write(Field::GuestRflags, Rflags::_1.bits())
    }

    /// Write the negotiated control words and the per-guest control
    /// plumbing. Feasibility was settled at negotiation time; nothing here
    /// re-checks hardware.
    pub(crate) fn apply_controls(
        &self,
        controls: &NegotiatedControls,
        info: &GuestVcpuInfo,
        eptp: EptPointer,
    ) -> Result<(), VmxError> {
        self.write(Field::PinBasedControls, controls.pin.bits() as u64)?;
        self.write(Field::ProcBasedControls, controls.proc.bits() as u64)?;
        self.write(Field::SecondaryControls, controls.proc2.bits() as u64)?;
        self.write(Field::ExitControls, controls.exit.bits() as u64)?;
        self.write(Field::EntryControls, controls.entry.bits() as u64)?;

        self.write(Field::Eptptr, eptp.raw())?;
        self.write(Field::ExceptionBitmap, info.exception_bitmap as u64)?;
        self.write(Field::IoBitmapA, info.io_bitmap_a_pa().into_usize() as u64)?;
        self.write(Field::IoBitmapB, info.io_bitmap_b_pa().into_usize() as u64)?;

        self.write(
            Field::VmexitMsrStoreAddr,
            info.msr_guest_area_pa().into_usize() as u64,
        )?;
        self.write(
            Field::VmexitMsrLoadAddr,
            info.msr_host_area_pa().into_usize() as u64,
        )?;
        self.write(
            Field::VmentryMsrLoadAddr,
            info.msr_guest_area_pa().into_usize() as u64,
        )?;
        self.write(Field::ExitMsrStoreCount, info.msr_count() as u64)?;
        self.write(Field::ExitMsrLoadCount, info.msr_count() as u64)?;
        self.write(Field::EntryMsrLoadCount, info.msr_count() as u64)?;

        // EFER travels in dedicated fields, not the MSR area.
        self.write(Field::HostIa32Efer, controls.host_efer)?;

        // No CR3-target optimization, no event queued at start.
        self.write(Field::Cr3TargetCount, 0)?;
        self.write(Field::EntryInterruptionInfo, 0)
    }

    /// Set or clear interrupt-window exiting in the primary controls.
    pub(crate) fn set_interrupt_window(&self, enabled: bool) -> Result<(), VmxError> {
        let cur = self.read(Field::ProcBasedControls)? as u32;
        let new = if enabled {
            cur | ProcControls::INTERRUPT_WINDOW_EXITING.bits()
        } else {
            cur & !ProcControls::INTERRUPT_WINDOW_EXITING.bits()
        };
        if new != cur {
            self.write(Field::ProcBasedControls, new as u64)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::tests::HeapFrames;

    #[test]
    fn trampoline_host_rsp_constant_matches_field() {
        // The entry trampoline publishes the host stack with a raw field
        // number; keep it in lock step with the table above.
        assert_eq!(Field::HostRsp as u32, 0x6c14);
        assert_eq!(Field::HostRip as u32, 0x6c16);
    }

    #[test]
    fn region_is_stamped_with_revision() {
        let frames = HeapFrames::leaked();
        let region = VmcsRegion::new(frames, 0x12).unwrap();
        let stamped = unsafe { (region.pa().into_usize() as *const u32).read() };
        assert_eq!(stamped, 0x12);
        // The shadow-VMCS indicator never survives the stamp.
        let region2 = VmcsRegion::new(frames, 0x8000_0012).unwrap();
        let stamped2 = unsafe { (region2.pa().into_usize() as *const u32).read() };
        assert_eq!(stamped2, 0x12);
        unsafe {
            frames.free(region.into_frame());
            frames.free(region2.into_frame());
        }
    }

    #[test]
    fn first_bind_is_clear_then_load_never_load_alone() {
        let frames = HeapFrames::leaked();
        let region = VmcsRegion::new(frames, 1).unwrap();
        assert_eq!(region.plan_bind(None), BindAction::ClearThenLoad);
        // Even if some other VMCS is current, an uncleared region must be
        // cleared first.
        let other = VmcsRegion::new(frames, 1).unwrap();
        assert_eq!(region.plan_bind(Some(other.pa())), BindAction::ClearThenLoad);
        unsafe {
            frames.free(region.into_frame());
            frames.free(other.into_frame());
        }
    }

    #[test]
    fn rebinding_current_region_is_a_no_op() {
        let frames = HeapFrames::leaked();
        let region = VmcsRegion::new(frames, 1).unwrap();
        assert_eq!(region.plan_bind(Some(region.pa())), BindAction::Reuse);
        unsafe { frames.free(region.into_frame()) };
    }

    #[test]
    fn cleared_region_loads_without_reclearing() {
        let frames = HeapFrames::leaked();
        let mut region = VmcsRegion::new(frames, 1).unwrap();
        region.cleared = true;
        assert_eq!(region.plan_bind(None), BindAction::Load);
        unsafe { frames.free(region.into_frame()) };
    }

    #[test]
    fn instruction_error_numbers_decode() {
        assert_eq!(
            InstructionError::from_number(1),
            InstructionError::VmcallInRoot
        );
        assert_eq!(
            InstructionError::from_number(7),
            InstructionError::EntryInvalidControlFields
        );
        assert_eq!(
            InstructionError::from_number(8),
            InstructionError::EntryInvalidHostState
        );
        assert_eq!(
            InstructionError::from_number(11),
            InstructionError::VmptrldIncorrectRevision
        );
        assert_eq!(InstructionError::from_number(14), InstructionError::Unknown);
        assert_eq!(InstructionError::from_number(99), InstructionError::Unknown);
    }
}
