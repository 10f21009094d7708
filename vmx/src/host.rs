//! Seams to the host kernel.
//!
//! The engine borrows five services from the kernel it is embedded in:
//! physical pages, a scheduler to yield to, an interrupt handler to forward
//! vectors to, the coarse lock protecting shared host structures, and the
//! implementation of the guest-visible hypercalls. Each is a trait here;
//! the engine never reaches past these.

use crate::vcpu::GuestRegisters;
use crate::VmxError;
use bedrock::addressing::{Pa, Va, PAGE_MASK};
use num_enum::TryFromPrimitive;

/// One zero-initialized 4KB physical frame handed out by the host
/// allocator, together with its mapping in the host address space.
///
/// The engine treats a `Frame` as owned: whoever holds it is responsible
/// for handing it back through [`FrameSource::free`].
#[derive(Debug, PartialEq)]
pub struct Frame {
    pa: Pa,
    va: Va,
}

impl Frame {
    /// Reconstitute a frame from its two addresses.
    ///
    /// # Safety
    /// `pa` must denote a live allocation from the same [`FrameSource`] it
    /// will be freed to, `va` must be its host mapping, and no other `Frame`
    /// may alias it.
    pub unsafe fn from_raw(pa: Pa, va: Va) -> Self {
        debug_assert_eq!(pa.into_usize() & PAGE_MASK, 0);
        Self { pa, va }
    }

    /// Physical address of the frame.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Host virtual address of the frame.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// View the frame as a byte slice.
    ///
    /// # Safety
    /// The caller must ensure no concurrent mutable access.
    pub unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.va.into_usize() as *const u8, 0x1000)
    }

    /// View the frame as a mutable byte slice.
    ///
    /// # Safety
    /// The caller must ensure exclusive access.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.va.into_usize() as *mut u8, 0x1000)
    }
}

/// The physical-page allocator seam.
///
/// Implementations hand out zero-initialized, reference-counted 4KB frames
/// and translate physical addresses of live frames back into host virtual
/// addresses. Root regions, VMCS regions, EPT tables, and the I/O and MSR
/// bitmap pages all come from here.
pub trait FrameSource: Sync {
    /// Allocate one zeroed frame, or `None` when exhausted.
    fn alloc(&self) -> Option<Frame>;

    /// Return a frame.
    ///
    /// # Safety
    /// `frame` must have come from this source and must not be referenced
    /// afterwards (including by hardware: no EPT entry, VMCS pointer, or
    /// bitmap address may still name it).
    unsafe fn free(&self, frame: Frame);

    /// Host virtual address of a live frame's physical address, for walking
    /// structures (EPT tables) that store physical pointers.
    fn pa_to_va(&self, pa: Pa) -> Option<Va>;
}

/// The cooperative scheduler seam. Invoked unconditionally after every
/// VM-exit so no guest can monopolize a processor across a
/// fault/continuation boundary.
pub trait HostScheduler {
    /// Give up the processor to whatever the host wants to run next.
    fn yield_now(&self);
}

/// The interrupt-delivery seam. A VM-exit caused by an external interrupt
/// forwards the acquired vector here; the implementation must acknowledge
/// the interrupt controller.
pub trait IrqSink {
    /// Handle host interrupt `vector`.
    fn raise(&self, vector: u8);
}

/// The coarse lock protecting shared host structures (process table,
/// scheduler queues, page allocator, EPT edits).
///
/// The run loop releases it immediately before handing the processor to
/// guest code and reacquires it immediately after the VM-exit returns:
/// guest execution is unbounded, and holding a global lock across it would
/// stall every other processor.
pub trait HostLock {
    /// Take the lock.
    fn acquire(&self);
    /// Drop the lock. The caller must hold it.
    fn release(&self);
}

impl HostLock for spin_lock::RawSpinLock {
    fn acquire(&self) {
        spin_lock::RawSpinLock::acquire(self)
    }
    fn release(&self) {
        // The run loop only releases around the entry instruction while
        // holding the lock.
        unsafe { spin_lock::RawSpinLock::release(self) }
    }
}

/// Guest-to-host calls, by number.
///
/// The guest places the call number in `rax` and arguments in
/// `rdi`/`rsi`/`rdx`/`r10`/`r8`/`r9`, then executes `vmcall`. The engine
/// owns only this decode; what each call does is host policy behind
/// [`HypercallSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u64)]
pub enum Hypercall {
    /// Map a shared mailbox page into the caller.
    MailboxMap = 1,
    /// Send an IPC message.
    IpcSend = 2,
    /// Receive an IPC message.
    IpcRecv = 3,
    /// Acknowledge the local interrupt controller.
    LapicEoi = 4,
    /// Transfer control back to the host.
    BackToHost = 5,
    /// Query the disk image number backing this guest.
    DiskImageNum = 6,
    /// Request an additional CPU allocation.
    AllocCpu = 7,
    /// Cooperatively yield the virtual CPU.
    GuestYield = 8,
    /// Query the virtual CPU number.
    CpuNum = 9,
}

/// What a hypercall asked the engine to do next.
pub enum HypercallDisposition {
    /// Resume the guest; `0` is placed in the guest's `rax`.
    Ret(u64),
    /// Retire the guest with the given code.
    Shutdown(i32),
}

/// The hypercall-semantics seam.
pub trait HypercallSink {
    /// Handle one decoded hypercall. Arguments are read from (and results
    /// may be written into) the guest register file.
    fn handle(
        &mut self,
        call: Hypercall,
        regs: &mut GuestRegisters,
    ) -> Result<HypercallDisposition, VmxError>;
}

/// The bundle of host seams the run loop needs, so call sites stay
/// readable.
pub struct HostBridge<'a> {
    /// Scheduler, yielded to after every exit.
    pub sched: &'a dyn HostScheduler,
    /// Interrupt forwarding.
    pub irq: &'a dyn IrqSink,
    /// The coarse host lock, held on entry to [`crate::vcpu::run`].
    pub lock: &'a dyn HostLock,
    /// Hypercall semantics.
    pub hypercalls: &'a mut dyn HypercallSink,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypercall_numbers_decode() {
        assert_eq!(Hypercall::try_from(1u64), Ok(Hypercall::MailboxMap));
        assert_eq!(Hypercall::try_from(4u64), Ok(Hypercall::LapicEoi));
        assert_eq!(Hypercall::try_from(5u64), Ok(Hypercall::BackToHost));
        assert_eq!(Hypercall::try_from(9u64), Ok(Hypercall::CpuNum));
        assert!(Hypercall::try_from(0u64).is_err());
        assert!(Hypercall::try_from(10u64).is_err());
    }
}
