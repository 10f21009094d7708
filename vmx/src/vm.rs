//! Per-guest state: addresses, the virtual-CPU info block, and the guest
//! context the run loop drives.

use crate::caps::{CapabilitySnapshot, NegotiatedControls};
use crate::ept::ExtendedPageTable;
use crate::host::{Frame, FrameSource};
use crate::vcpu::GuestRegisters;
use crate::vmcs::{ActiveVmcs, Field, VmcsRegion};
use crate::{CpuContext, VmxError};
use bedrock::addressing::{Pa, PAGE_SIZE};
use bedrock::x86_64::Rflags;
use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// Guest virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gva(usize);

impl Gva {
    /// Create a new guest virtual address, checking canonical form.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

/// Guest physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gpa(usize);

impl Gpa {
    /// Create a new guest physical address with a range check.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::BitOr<usize> for $t {
            type Output = Self;

            fn bitor(self, other: usize) -> Self {
                Self(self.0 | other)
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Gva);
impl_arith!(Gpa);

impl core::fmt::Debug for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gva(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

/// Upper bound on MSR load/store area entries: half a page of 16-byte
/// entries.
pub const MSR_AREA_MAX: usize = (PAGE_SIZE / 2) / core::mem::size_of::<MsrAreaEntry>();

/// One entry of the VM-entry/VM-exit MSR load and store areas.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MsrAreaEntry {
    /// MSR index.
    pub index: u32,
    _rsv: u32,
    /// MSR value.
    pub value: u64,
}

/// Per-guest virtual-CPU information: everything the VMCS control area
/// points at, plus the guest's identity and memory span. Owned by, and
/// living exactly as long as, the guest.
pub struct GuestVcpuInfo {
    /// Index of this virtual CPU within its guest.
    pub vcpu_id: usize,
    /// Size of guest-physical memory in bytes; addresses below this are
    /// valid to populate lazily.
    pub phys_sz: usize,
    /// Exceptions that force a VM-exit.
    pub exception_bitmap: u32,
    io_bitmap_a: Frame,
    io_bitmap_b: Frame,
    msr_host_area: Frame,
    msr_guest_area: Frame,
    msr_count: u32,
}

impl GuestVcpuInfo {
    /// I/O ports the guest may drive through emulation by default: the
    /// RTC pair.
    const DEFAULT_PORTS: [u16; 2] = [0x70, 0x71];

    /// Allocate the bitmap and MSR-area pages for one virtual CPU.
    pub fn new(
        frames: &dyn FrameSource,
        vcpu_id: usize,
        phys_sz: usize,
    ) -> Result<Self, VmxError> {
        let mut this = Self {
            vcpu_id,
            phys_sz,
            exception_bitmap: 0,
            io_bitmap_a: frames.alloc().ok_or(VmxError::OutOfFrames)?,
            io_bitmap_b: frames.alloc().ok_or(VmxError::OutOfFrames)?,
            msr_host_area: frames.alloc().ok_or(VmxError::OutOfFrames)?,
            msr_guest_area: frames.alloc().ok_or(VmxError::OutOfFrames)?,
            msr_count: 0,
        };
        for port in Self::DEFAULT_PORTS {
            this.authorize_port(port);
        }
        Ok(this)
    }

    fn bitmap_slot(&self, port: u16) -> (&Frame, usize) {
        if port < 0x8000 {
            (&self.io_bitmap_a, port as usize)
        } else {
            (&self.io_bitmap_b, port as usize - 0x8000)
        }
    }

    /// Mark `port` as trapped-and-emulated: accesses VM-exit and the exit
    /// handler services them against host hardware.
    pub fn authorize_port(&mut self, port: u16) {
        let (frame, ofs) = self.bitmap_slot(port);
        unsafe {
            let word = (frame.va().into_usize() as *mut u64).add(ofs / 64);
            word.write(word.read() | (1 << (ofs % 64)));
        }
    }

    /// Whether `port` is in the pre-authorized set.
    pub fn port_authorized(&self, port: u16) -> bool {
        let (frame, ofs) = self.bitmap_slot(port);
        unsafe {
            let word = (frame.va().into_usize() as *const u64).add(ofs / 64);
            word.read() & (1 << (ofs % 64)) != 0
        }
    }

    /// Append an MSR to the load/store areas: the host value reloads on
    /// exit, the guest's slot starts at zero.
    ///
    /// EFER never goes here; it has dedicated VMCS fields.
    pub fn add_msr(&mut self, index: u32, host_value: u64) -> Result<(), VmxError> {
        if self.msr_count as usize >= MSR_AREA_MAX {
            return Err(VmxError::OutOfFrames);
        }
        unsafe {
            let host = (self.msr_host_area.va().into_usize() as *mut MsrAreaEntry)
                .add(self.msr_count as usize);
            host.write(MsrAreaEntry {
                index,
                _rsv: 0,
                value: host_value,
            });
            let guest = (self.msr_guest_area.va().into_usize() as *mut MsrAreaEntry)
                .add(self.msr_count as usize);
            guest.write(MsrAreaEntry {
                index,
                _rsv: 0,
                value: 0,
            });
        }
        self.msr_count += 1;
        Ok(())
    }

    pub(crate) fn io_bitmap_a_pa(&self) -> Pa {
        self.io_bitmap_a.pa()
    }

    pub(crate) fn io_bitmap_b_pa(&self) -> Pa {
        self.io_bitmap_b.pa()
    }

    pub(crate) fn msr_host_area_pa(&self) -> Pa {
        self.msr_host_area.pa()
    }

    pub(crate) fn msr_guest_area_pa(&self) -> Pa {
        self.msr_guest_area.pa()
    }

    pub(crate) fn msr_count(&self) -> u32 {
        self.msr_count
    }

    fn reclaim(self, frames: &dyn FrameSource) {
        unsafe {
            frames.free(self.io_bitmap_a);
            frames.free(self.io_bitmap_b);
            frames.free(self.msr_host_area);
            frames.free(self.msr_guest_area);
        }
    }
}

struct GuestResources {
    info: GuestVcpuInfo,
    ept: ExtendedPageTable,
    vmcs: VmcsRegion,
}

/// One guest as the engine sees it: register file, run counter, pending
/// virtual interrupts, and the hardware structures (VMCS, EPT, bitmaps).
///
/// The embedding kernel owns the `GuestContext` and its identity; the
/// engine owns its lifecycle from first launch to retirement.
pub struct GuestContext {
    /// General-purpose register file, saved/restored by the trampoline.
    pub regs: GuestRegisters,
    /// Guest RIP as of the last VM-exit (or the entry point before the
    /// first launch).
    pub rip: u64,
    /// Guest RSP as of the last VM-exit.
    pub rsp: u64,
    runs: u64,
    // Written cross-processor by inject_interrupt; padded so a remote
    // inject does not bounce the cache line carrying the hot loop state.
    pending: CachePadded<[AtomicU64; 4]>,
    controls: NegotiatedControls,
    frames: &'static dyn FrameSource,
    res: Option<GuestResources>,
}

impl GuestContext {
    /// Build the per-guest hardware state: VMCS region (stamped, not yet
    /// cleared), empty EPT, bitmaps and MSR areas. Nothing touches
    /// processor state yet; the first [`bind`] does.
    ///
    /// [`bind`]: Self::bind
    pub fn new(
        frames: &'static dyn FrameSource,
        snap: &CapabilitySnapshot,
        controls: NegotiatedControls,
        vcpu_id: usize,
        phys_sz: usize,
    ) -> Result<Self, VmxError> {
        let info = GuestVcpuInfo::new(frames, vcpu_id, phys_sz)?;
        let ept = ExtendedPageTable::new(frames).map_err(|_| VmxError::OutOfFrames)?;
        let vmcs = VmcsRegion::new(frames, snap.revision_id())?;
        Ok(Self {
            regs: GuestRegisters::default(),
            rip: 0,
            rsp: 0,
            runs: 0,
            pending: CachePadded::new([
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ]),
            controls,
            frames,
            res: Some(GuestResources { info, ept, vmcs }),
        })
    }

    /// How many times this guest has run (entered and exited). Zero
    /// selects launch; anything else selects resume.
    #[inline]
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// The negotiated configuration this guest runs under.
    #[inline]
    pub fn controls(&self) -> &NegotiatedControls {
        &self.controls
    }

    pub(crate) fn frames(&self) -> &'static dyn FrameSource {
        self.frames
    }

    /// The guest's virtual-CPU info block.
    pub fn info(&self) -> &GuestVcpuInfo {
        &self.res.as_ref().expect("guest retired").info
    }

    /// Mutable access to the info block (port authorization, MSR areas),
    /// for use before the first launch.
    pub fn info_mut(&mut self) -> &mut GuestVcpuInfo {
        &mut self.res.as_mut().expect("guest retired").info
    }

    /// The guest's translation tree.
    pub fn ept(&self) -> &ExtendedPageTable {
        &self.res.as_ref().expect("guest retired").ept
    }

    /// Mutable access to the translation tree. Structural edits must be
    /// followed by an invalidation before the guest's next entry.
    pub fn ept_mut(&mut self) -> &mut ExtendedPageTable {
        &mut self.res.as_mut().expect("guest retired").ept
    }

    /// Queue a virtual interrupt for delivery at the next entry with an
    /// open interrupt window. Callable from any processor.
    pub fn inject_interrupt(&self, vec: u8) {
        let (index, ofs) = (vec / 64, vec & 63);
        self.pending[index as usize].fetch_or(1 << ofs, Ordering::SeqCst);
    }

    /// Make this guest's VMCS Current on `cpu`, clear-then-load on first
    /// use, and populate static state exactly once. Re-binding while
    /// already Current skips everything. Binding on a different processor
    /// than last time rewrites the host area (the TSS base is
    /// per-processor).
    pub fn bind(&mut self, cpu: &mut CpuContext) -> Result<ActiveVmcs, VmxError> {
        let landing = crate::vcpu::exit_landing_address();
        let controls = self.controls;
        let (rip, rsp) = (self.rip, self.rsp);
        let res = self.res.as_mut().expect("guest retired");
        let active = res.vmcs.bind(cpu)?;
        if !res.vmcs.init {
            active.init_static_fields(landing, &controls)?;
            active.apply_controls(&controls, &res.info, res.ept.pointer())?;
            active.write(Field::GuestRip, rip)?;
            active.write(Field::GuestRsp, rsp)?;
            res.vmcs.init = true;
            res.vmcs.home = Some(cpu.id());
        } else if res.vmcs.home != Some(cpu.id()) {
            active.init_host_state(landing)?;
            res.vmcs.home = Some(cpu.id());
        }
        Ok(active)
    }

    /// Detach this guest from `cpu` so it can be bound elsewhere. The
    /// region is cleared, so the next entry launches again.
    pub fn unbind(&mut self, cpu: &mut CpuContext) -> Result<(), VmxError> {
        let res = self.res.as_mut().expect("guest retired");
        res.vmcs.unbind(cpu)?;
        self.runs = 0;
        Ok(())
    }

    /// Stage at most one pending virtual interrupt for the next entry: if
    /// the guest can take interrupts, write the entry-interruption field;
    /// otherwise arm interrupt-window exiting and deliver when it opens.
    pub(crate) fn stage_pending_interrupt(&self, vmcs: &ActiveVmcs) -> Result<(), VmxError> {
        for (index, word) in self.pending.iter().enumerate() {
            let v = word.load(Ordering::SeqCst);
            if v == 0 {
                continue;
            }
            let rflags = Rflags::from_bits_truncate(vmcs.read(Field::GuestRflags)?);
            if rflags.contains(Rflags::IF) {
                let ofs = v.trailing_zeros() as u64;
                word.fetch_and(!(1 << ofs), Ordering::SeqCst);
                let vector = index as u64 * 64 + ofs;
                // Valid, external-interrupt type.
                vmcs.write(Field::EntryInterruptionInfo, vector | (1 << 31))?;
            } else {
                vmcs.set_interrupt_window(true)?;
            }
            break;
        }
        Ok(())
    }

    /// Record one completed enter/exit cycle: bump the run counter and
    /// capture the guest's RIP/RSP for the dispatcher and diagnostics.
    pub(crate) fn note_exit(&mut self, vmcs: &ActiveVmcs) -> Result<(), VmxError> {
        self.runs += 1;
        self.rip = vmcs.read(Field::GuestRip)?;
        self.rsp = vmcs.read(Field::GuestRsp)?;
        Ok(())
    }

    /// Terminate-and-reclaim: every page this guest pinned (VMCS region,
    /// bitmaps, MSR areas, the whole translation tree and the frames it
    /// owns) goes back to the allocator. All termination paths funnel
    /// through here; afterwards the context is a husk that can only be
    /// dropped.
    pub fn retire(&mut self, cpu: &mut CpuContext) {
        if let Some(mut res) = self.res.take() {
            // Only a region that has entered the lifecycle needs a
            // hardware vmclear before the memory is reused.
            if res.vmcs.home.is_some() || cpu.current_vmcs == Some(res.vmcs.pa()) {
                let _ = res.vmcs.unbind(cpu);
            }
            if cpu.current_vmcs == Some(res.vmcs.pa()) {
                cpu.current_vmcs = None;
            }
            unsafe {
                self.frames.free(res.vmcs.into_frame());
            }
            res.info.reclaim(self.frames);
            res.ept.reclaim();
        }
    }

    /// Whether this guest has been retired.
    #[inline]
    pub fn retired(&self) -> bool {
        self.res.is_none()
    }

    /// The VMX-abort indicator from the guest's VMCS region.
    pub(crate) fn abort_indicator(&self) -> u32 {
        self.res
            .as_ref()
            .map(|r| r.vmcs.abort_indicator())
            .unwrap_or(0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ept::tests::HeapFrames;

    pub(crate) fn test_snapshot() -> CapabilitySnapshot {
        use crate::controls::EptVpidCaps;
        use bedrock::x86_64::Efer;
        let permissive = |mandatory: u32| ((u32::MAX as u64) << 32) | mandatory as u64;
        CapabilitySnapshot {
            basic: (1 << 55) | 0x1,
            pin: permissive(0x16),
            proc: permissive(0x0401_e172 & !((1 << 15) | (1 << 16))),
            proc2: (u32::MAX as u64) << 32,
            exit: permissive(0x0003_6dff),
            entry: permissive(0x11ff),
            cr0_fixed0: 0x21,
            cr0_fixed1: u64::MAX,
            cr4_fixed0: 1 << 13,
            cr4_fixed1: u64::MAX,
            ept_vpid: EptVpidCaps::MEMTYPE_WB
                | EptVpidCaps::WALK_LENGTH_4
                | EptVpidCaps::INVEPT
                | EptVpidCaps::INVEPT_SINGLE_CONTEXT
                | EptVpidCaps::INVEPT_GLOBAL,
            efer: Efer::SCE | Efer::LME | Efer::LMA | Efer::NXE,
        }
    }

    fn test_guest(frames: &'static HeapFrames) -> GuestContext {
        let snap = test_snapshot();
        let controls = crate::caps::compute_controls(&snap).unwrap();
        GuestContext::new(frames, &snap, controls, 0, 16 * 1024 * 1024).unwrap()
    }

    #[test]
    fn default_port_set_is_the_rtc_pair() {
        let frames = HeapFrames::leaked();
        let guest = test_guest(frames);
        assert!(guest.info().port_authorized(0x70));
        assert!(guest.info().port_authorized(0x71));
        assert!(!guest.info().port_authorized(0x72));
        assert!(!guest.info().port_authorized(0x3f8));
    }

    #[test]
    fn high_ports_land_in_the_second_bitmap() {
        let frames = HeapFrames::leaked();
        let mut guest = test_guest(frames);
        guest.info_mut().authorize_port(0x8042);
        assert!(guest.info().port_authorized(0x8042));
        // The same offset in the low bitmap is untouched.
        assert!(!guest.info().port_authorized(0x0042));
    }

    #[test]
    fn msr_area_is_bounded_and_laid_out() {
        let frames = HeapFrames::leaked();
        let mut guest = test_guest(frames);
        guest.info_mut().add_msr(0x277, 0x0007_0406_0007_0406).unwrap();
        assert_eq!(guest.info().msr_count(), 1);
        let entry = unsafe {
            (guest.info().msr_host_area_pa().into_usize() as *const MsrAreaEntry).read()
        };
        assert_eq!(entry.index, 0x277);
        assert_eq!(entry.value, 0x0007_0406_0007_0406);

        for i in 0..(MSR_AREA_MAX - 1) {
            guest.info_mut().add_msr(i as u32, 0).unwrap();
        }
        assert!(guest.info_mut().add_msr(0xffff, 0).is_err());
    }

    #[test]
    fn retire_reclaims_every_frame() {
        let frames = HeapFrames::leaked();
        let mut cpu = crate::CpuContext::bring_up(0);
        let mut guest = test_guest(frames);
        // Populate a few translations so the tree owns frames and tables.
        for i in 0..4 {
            let frame = frames.alloc().unwrap();
            guest
                .ept_mut()
                .map(
                    Gpa::new(i * 0x1000).unwrap(),
                    frame,
                    crate::ept::EptFlags::FULL,
                    crate::ept::MemoryType::WriteBack,
                )
                .unwrap();
        }
        assert!(!guest.retired());
        guest.retire(&mut cpu);
        assert!(guest.retired());
        assert_eq!(frames.live_count(), 0);
        // Retiring twice is harmless.
        guest.retire(&mut cpu);
    }

    #[test]
    fn injected_vector_sets_exactly_one_pending_bit() {
        let frames = HeapFrames::leaked();
        let guest = test_guest(frames);
        guest.inject_interrupt(33);
        assert_eq!(guest.pending[0].load(Ordering::SeqCst), 1 << 33);
        guest.inject_interrupt(100);
        assert_eq!(guest.pending[1].load(Ordering::SeqCst), 1 << 36);
        // A second inject of the same vector does not clobber others.
        guest.inject_interrupt(33);
        assert_eq!(guest.pending[0].load(Ordering::SeqCst), 1 << 33);
    }

    #[test]
    fn canonical_address_checks() {
        assert!(Gva::new(0xffff_8000_0000_0000).is_some());
        assert!(Gva::new(0x0000_7fff_ffff_ffff).is_some());
        assert!(Gva::new(0x0001_0000_0000_0000).is_none());
        assert!(Gpa::new(0x1000).is_some());
        assert!(Gpa::new(0xffff_0000_0000_0000).is_none());
    }
}
