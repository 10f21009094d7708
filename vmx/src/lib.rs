//! Hardware-assisted virtualization engine.
//!
//! This crate drives one x86-64 logical processor through the full life of a
//! hardware-virtualized guest: it negotiates what the processor can do
//! ([`caps`]), enters VMX root operation ([`root`]), builds and maintains the
//! per-guest virtual-machine control structure ([`vmcs`]), keeps the
//! second-level guest-physical→host-physical translation tree ([`ept`]), and
//! hands the processor to guest code until a VM-exit returns it, classifying
//! and handling every exit ([`vcpu`], [`exit`]).
//!
//! The engine deliberately does not own the rest of the kernel. The process
//! table, the scheduler, the physical-page allocator, interrupt delivery,
//! and hypercall semantics are all reached through the seams in [`host`] and
//! [`probe`]; the embedding kernel implements them. What the engine does own
//! is correctness of the hardware conversation: control words that the
//! capability MSRs actually allow, a VMCS that is Current exactly when it
//! must be, an EPT pointer that is never stale, and a launch/resume decision
//! that is never wrong.
//!
//! ## Per-processor state
//!
//! Everything the hardware scopes to one logical processor (root status, the
//! currently loaded VMCS) lives in an explicit [`CpuContext`] created at
//! bring-up and passed through every entry point. There are no free-floating
//! globals to get out of sync with the processor they describe.
//!
//! ## Error discipline
//!
//! All failures surface as [`VmxError`]. Failures before a guest has run
//! abort guest creation with nothing partially initialized; failures while a
//! guest is running terminate that guest through one
//! terminate-and-reclaim path and never destabilize the host.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate bedrock;

pub mod caps;
pub mod controls;
pub mod ept;
pub mod exit;
pub mod host;
pub mod probe;
pub mod root;
pub mod vcpu;
pub mod vm;
pub mod vmcs;

pub use probe::Probe;

use bedrock::addressing::Pa;

/// Errors of the virtualization engine.
///
/// The first three arise before any guest instruction has executed and
/// abort guest creation. The rest arise while a guest is running and are
/// fatal to that guest only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxError {
    /// The processor cannot satisfy a mandatory requirement. The payload
    /// names the missing capability.
    UnsupportedCpu(&'static str),
    /// Entering VMX root operation failed; processor state was restored.
    VmxRootEntryFailed(&'static str),
    /// A VMCS lifecycle operation (clear/load/field access) failed.
    VmcsInitFailed(vmcs::InstructionError),
    /// The launch/resume instruction itself failed; no guest code ran.
    VmEntryFailed(vmcs::InstructionError),
    /// The hardware reported a VM-abort: a host-state misconfiguration
    /// detected during exit. The payload is the abort indicator.
    VmAbort(u32),
    /// An exit the engine has no handler for, or a handler rejected.
    UnhandledExit(exit::ExitInfo),
    /// The instruction at the guest's exit RIP could not be fetched or
    /// decoded for emulation.
    FailedToDecodeInstruction,
    /// The guest executed HLT; there is no wake support, so the guest is
    /// terminated.
    GuestRequestedHalt,
    /// The frame allocator could not supply a page.
    OutOfFrames,
}

/// Per-logical-processor context.
///
/// Created once at processor bring-up and threaded through every engine
/// entry point that touches processor-scoped hardware state. One exists per
/// logical processor; the embedding kernel keeps it alongside its other
/// per-CPU data.
pub struct CpuContext {
    id: usize,
    /// Physical address of the root-operation region once `vmxon` has
    /// succeeded on this processor.
    pub(crate) root_region: Option<Pa>,
    /// Physical address of the VMCS that is Current on this processor, if
    /// any. Maintained by the VMCS lifecycle so a rebind of the same guest
    /// is a no-op.
    pub(crate) current_vmcs: Option<Pa>,
}

impl CpuContext {
    /// Create the context for one logical processor at bring-up.
    pub fn bring_up(id: usize) -> Self {
        Self {
            id,
            root_region: None,
            current_vmcs: None,
        }
    }

    /// The logical-processor index this context describes.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether this processor is in VMX root operation.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.root_region.is_some()
    }
}
