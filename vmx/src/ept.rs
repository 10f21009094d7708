//! Extended page table: the guest-physical→host-physical translation tree.
//!
//! A 4-level radix structure mirroring ordinary paging. Entries are 64-bit
//! words whose low bits are permissions and memory-type, read and written
//! only through the masked accessors here. An entry with none of the
//! read/write/execute bits set does not translate anything; there is no
//! separate present bit.
//!
//! The root pointer handed to the hardware ([`EptPointer`]) encodes the
//! walk length and memory type in its low bits and is recomputed from the
//! tree every time it is needed, never cached on its own.

use crate::host::{Frame, FrameSource};
use crate::probe::Probe;
use crate::vm::{Gpa, Gva};
use crate::vmcs::ActiveVmcs;
use bedrock::addressing::{Pa, PAGE_MASK, PAGE_SHIFT};
#[cfg(not(test))]
use core::arch::asm;
use num_enum::TryFromPrimitive;

/// Depth of the translation tree.
pub const EPT_LEVELS: usize = 4;

bitflags::bitflags! {
    /// Masked view of one EPT entry's control bits.
    pub struct EptFlags: u64 {
        /// Reads allowed through this entry.
        const READ = 1 << 0;
        /// Writes allowed through this entry.
        const WRITE = 1 << 1;
        /// Instruction fetches allowed through this entry.
        const EXECUTE = 1 << 2;
        /// Ignore the guest's PAT memory type for this page (leaf only).
        const IGNORE_PAT = 1 << 6;
        /// This entry maps a large page instead of referencing a table.
        const LARGE = 1 << 7;
        /// Hardware-recorded access (only when enabled in the pointer;
        /// never enabled here).
        const ACCESSED = 1 << 8;
        /// Hardware-recorded write (same).
        const DIRTY = 1 << 9;
        /// Software bit: the mapped frame is owned by this tree and is
        /// freed with it. Bit 52 is ignored by hardware.
        const OWNED = 1 << 52;
    }
}

impl EptFlags {
    /// All three permission bits.
    pub const FULL: EptFlags = EptFlags::from_bits_truncate(0b111);
}

/// EPT memory types, encoded in bits 5:3 of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MemoryType {
    /// Uncacheable.
    Uncacheable = 0,
    /// Write combining.
    WriteCombining = 1,
    /// Write through.
    WriteThrough = 4,
    /// Write protected.
    WriteProtected = 5,
    /// Write back. The default for ordinary guest memory.
    WriteBack = 6,
}

const MEMTYPE_SHIFT: u64 = 3;
const MEMTYPE_MASK: u64 = 0x7 << MEMTYPE_SHIFT;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One 64-bit entry of the translation tree.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    /// An entry that translates nothing.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether this entry translates (any permission bit set).
    #[inline]
    pub fn is_present(&self) -> bool {
        self.0 & EptFlags::FULL.bits() != 0
    }

    /// The physical address this entry points at.
    #[inline]
    pub fn pa(&self) -> Option<Pa> {
        if self.is_present() {
            Pa::new((self.0 & ADDR_MASK) as usize)
        } else {
            None
        }
    }

    /// The control bits of this entry.
    #[inline]
    pub fn flags(&self) -> EptFlags {
        EptFlags::from_bits_truncate(self.0)
    }

    /// The permission bits of this entry.
    #[inline]
    pub fn perms(&self) -> EptFlags {
        self.flags() & EptFlags::FULL
    }

    /// The memory type encoded in a leaf entry.
    #[inline]
    pub fn memory_type(&self) -> Result<MemoryType, ()> {
        MemoryType::try_from(((self.0 & MEMTYPE_MASK) >> MEMTYPE_SHIFT) as u8).map_err(|_| ())
    }

    /// Install `pa` and `flags`, with `memtype` for leaves.
    #[inline]
    fn set(&mut self, pa: Pa, flags: EptFlags, memtype: Option<MemoryType>) {
        let mt = memtype
            .map(|t| ((t as u64) << MEMTYPE_SHIFT) | EptFlags::IGNORE_PAT.bits())
            .unwrap_or(0);
        self.0 = (pa.into_usize() as u64 & ADDR_MASK) | flags.bits() | mt;
    }

    /// Add permissions to an existing entry.
    #[inline]
    fn widen(&mut self, perm: EptFlags) {
        self.0 |= (perm & EptFlags::FULL).bits();
    }

    #[inline]
    fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EptEntry(0x{:x})", self.0)
    }
}

/// The value written into the VMCS EPT-pointer field: the root table's
/// physical address with (levels − 1) and the paging-structure memory type
/// in the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptPointer(u64);

impl EptPointer {
    /// Encode a pointer. `root` must be page-aligned; only the defined low
    /// bits carry flags.
    pub fn new(root: Pa, levels: usize, memtype: MemoryType) -> Self {
        let root = root.into_usize() as u64;
        debug_assert_eq!(root & PAGE_MASK as u64, 0);
        Self(root | (((levels as u64) - 1) << 3) | memtype as u64)
    }

    /// The raw encoded value.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The root table address without flag bits.
    #[inline]
    pub fn root(&self) -> Pa {
        Pa::new((self.0 & !(PAGE_MASK as u64)) as usize).unwrap_or(Pa::ZERO)
    }
}

/// How stale translations are evicted after a structural change.
#[derive(Debug, Clone, Copy)]
#[repr(u64)]
pub enum InvalidationScope {
    /// Translations tagged with this tree's pointer.
    SingleContext = 1,
    /// Every EPT-tagged translation on this processor.
    Global = 2,
}

/// Errors from translation-table edits.
#[derive(Debug, PartialEq, Eq)]
pub enum EptMappingError {
    /// Address not page-aligned.
    Unaligned,
    /// No translation installed for the address.
    NotExist,
    /// The translation is covered by a large-page entry this tree did not
    /// install and cannot split.
    Huge,
    /// The frame allocator ran dry while adding a table level.
    OutOfFrames,
}

/// What a faulting guest-physical address turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub enum Classification {
    /// Nothing mapped: populate lazily if the address is valid for the
    /// guest.
    Unmapped,
    /// A live translation with these permissions; a fault here is a
    /// genuine permission violation.
    Mapped(EptFlags),
    /// The entry is structurally invalid (write-without-read, or a
    /// reserved memory type).
    Misconfigured,
}

/// The per-guest translation tree.
pub struct ExtendedPageTable {
    root: Frame,
    frames: &'static dyn FrameSource,
    #[cfg(test)]
    invalidations: core::cell::Cell<usize>,
}

impl ExtendedPageTable {
    /// Allocate an empty tree.
    pub fn new(frames: &'static dyn FrameSource) -> Result<Self, EptMappingError> {
        let root = frames.alloc().ok_or(EptMappingError::OutOfFrames)?;
        Ok(Self {
            root,
            frames,
            #[cfg(test)]
            invalidations: core::cell::Cell::new(0),
        })
    }

    /// The pointer value for the VMCS. Recomputed from the live root,
    /// level count, and memory type on every call.
    pub fn pointer(&self) -> EptPointer {
        EptPointer::new(self.root.pa(), EPT_LEVELS, MemoryType::WriteBack)
    }

    fn table_of(&self, pa: Pa) -> Result<*mut EptEntry, EptMappingError> {
        Ok(self
            .frames
            .pa_to_va(pa)
            .ok_or(EptMappingError::NotExist)?
            .into_usize() as *mut EptEntry)
    }

    fn index(gpa: usize, level: usize) -> usize {
        (gpa >> (PAGE_SHIFT + 9 * level)) & 0x1ff
    }

    /// Map a frame owned by this tree. On teardown the frame is freed with
    /// the tables.
    pub fn map(
        &mut self,
        gpa: Gpa,
        frame: Frame,
        perm: EptFlags,
        memtype: MemoryType,
    ) -> Result<(), EptMappingError> {
        let pa = frame.pa();
        // The tree takes ownership; the frame is reconstituted on reclaim.
        let r = unsafe { self.install(gpa, pa, perm | EptFlags::OWNED, memtype) };
        if r.is_err() {
            unsafe { self.frames.free(frame) };
        }
        r
    }

    /// Map a frame owned elsewhere (for example host memory shared into
    /// the guest).
    ///
    /// # Safety
    /// `hpa` must stay live for as long as this translation can be used.
    pub unsafe fn map_shared(
        &mut self,
        gpa: Gpa,
        hpa: Pa,
        perm: EptFlags,
        memtype: MemoryType,
    ) -> Result<(), EptMappingError> {
        self.install(gpa, hpa, perm, memtype)
    }

    unsafe fn install(
        &mut self,
        gpa: Gpa,
        hpa: Pa,
        perm: EptFlags,
        memtype: MemoryType,
    ) -> Result<(), EptMappingError> {
        let (gpa, hpa_usize) = (gpa.into_usize(), hpa.into_usize());
        if gpa & PAGE_MASK != 0 || hpa_usize & PAGE_MASK != 0 {
            return Err(EptMappingError::Unaligned);
        }

        let mut table = self.table_of(self.root.pa())?;
        for level in (1..EPT_LEVELS).rev() {
            let entry = &mut *table.add(Self::index(gpa, level));
            if !entry.is_present() {
                let page = self.frames.alloc().ok_or(EptMappingError::OutOfFrames)?;
                entry.set(page.pa(), EptFlags::FULL, None);
                // Table frames are recovered by walking the tree on
                // reclaim; only the physical address is kept here.
                core::mem::forget(page);
            } else if entry.flags().contains(EptFlags::LARGE) {
                return Err(EptMappingError::Huge);
            }
            table = self.table_of(entry.pa().ok_or(EptMappingError::NotExist)?)?;
        }

        let leaf = &mut *table.add(Self::index(gpa, 0));
        if leaf.is_present() {
            // Same target: widen to the union of permissions.
            leaf.widen(perm);
        } else {
            leaf.set(hpa, perm, Some(memtype));
        }
        Ok(())
    }

    /// Remove the 4KB translation for `gpa`, returning the mapped frame if
    /// this tree owned it.
    pub fn unmap(&mut self, gpa: Gpa) -> Result<Option<Frame>, EptMappingError> {
        let gpa = gpa.into_usize();
        if gpa & PAGE_MASK != 0 {
            return Err(EptMappingError::Unaligned);
        }
        let mut table = self.table_of(self.root.pa())?;
        unsafe {
            for level in (1..EPT_LEVELS).rev() {
                let entry = &*table.add(Self::index(gpa, level));
                if !entry.is_present() {
                    return Err(EptMappingError::NotExist);
                }
                if entry.flags().contains(EptFlags::LARGE) {
                    return Err(EptMappingError::Huge);
                }
                table = self.table_of(entry.pa().ok_or(EptMappingError::NotExist)?)?;
            }
            let leaf = &mut *table.add(Self::index(gpa, 0));
            if !leaf.is_present() {
                return Err(EptMappingError::NotExist);
            }
            let owned = leaf.flags().contains(EptFlags::OWNED);
            let pa = leaf.pa().ok_or(EptMappingError::NotExist)?;
            leaf.clear();
            if owned {
                let va = self.frames.pa_to_va(pa).ok_or(EptMappingError::NotExist)?;
                Ok(Some(Frame::from_raw(pa, va)))
            } else {
                Ok(None)
            }
        }
    }

    /// Find the entry translating `gpa`, with the level it was found at
    /// (0 = 4KB leaf, 1 = 2MB large page).
    pub fn walk(&self, gpa: Gpa) -> Result<(EptEntry, usize), EptMappingError> {
        let gpa = gpa.into_usize();
        let mut table = self.table_of(self.root.pa())?;
        unsafe {
            for level in (1..EPT_LEVELS).rev() {
                let entry = *table.add(Self::index(gpa, level));
                if !entry.is_present() {
                    return Err(EptMappingError::NotExist);
                }
                if entry.flags().contains(EptFlags::LARGE) {
                    return Ok((entry, level));
                }
                table = self.table_of(entry.pa().ok_or(EptMappingError::NotExist)?)?;
            }
            let leaf = *table.add(Self::index(gpa, 0));
            if leaf.is_present() {
                Ok((leaf, 0))
            } else {
                Err(EptMappingError::NotExist)
            }
        }
    }

    /// Decide what a faulting guest-physical address is: absent, a live
    /// mapping (so the fault is a real permission violation), or a
    /// structurally bad entry.
    pub fn classify(&self, gpa: Gpa) -> Classification {
        match self.walk(gpa) {
            Err(_) => Classification::Unmapped,
            Ok((entry, level)) => {
                let flags = entry.flags();
                // Write-without-read is architecturally misconfigured, as
                // is a reserved memory type on a page-mapping entry.
                if flags.contains(EptFlags::WRITE) && !flags.contains(EptFlags::READ) {
                    return Classification::Misconfigured;
                }
                if (level == 0 || flags.contains(EptFlags::LARGE))
                    && entry.memory_type().is_err()
                {
                    return Classification::Misconfigured;
                }
                Classification::Mapped(entry.perms())
            }
        }
    }

    /// Evict cached translations after a structural change. Must run
    /// before the affected guest's next entry.
    #[cfg(not(test))]
    pub fn invalidate(&self, scope: InvalidationScope) {
        let descriptor: [u64; 2] = [self.pointer().raw(), 0];
        unsafe {
            asm!(
                "invept {}, [{}]",
                in(reg) scope as u64,
                in(reg) &descriptor,
                options(nostack),
            );
        }
    }

    /// Host-test double of the invept path: counts requests instead of
    /// executing the privileged instruction.
    #[cfg(test)]
    pub fn invalidate(&self, _scope: InvalidationScope) {
        self.invalidations.set(self.invalidations.get() + 1);
    }

    /// How many invalidations have been requested (host tests only).
    #[cfg(test)]
    pub(crate) fn invalidation_count(&self) -> usize {
        self.invalidations.get()
    }

    /// Tear the tree down: every table page and every owned leaf frame
    /// goes back to the allocator.
    pub fn reclaim(self) {
        unsafe {
            self.reclaim_table(self.root.pa(), EPT_LEVELS - 1);
            let Self { root, frames, .. } = self;
            frames.free(root);
        }
    }

    unsafe fn reclaim_table(&self, table_pa: Pa, level: usize) {
        let table = match self.table_of(table_pa) {
            Ok(t) => t,
            Err(_) => return,
        };
        for i in 0..512 {
            let entry = *table.add(i);
            if !entry.is_present() {
                continue;
            }
            let Some(pa) = entry.pa() else { continue };
            if level == 0 {
                if entry.flags().contains(EptFlags::OWNED) {
                    if let Some(va) = self.frames.pa_to_va(pa) {
                        self.frames.free(Frame::from_raw(pa, va));
                    }
                }
            } else if !entry.flags().contains(EptFlags::LARGE) {
                self.reclaim_table(pa, level - 1);
                if let Some(va) = self.frames.pa_to_va(pa) {
                    self.frames.free(Frame::from_raw(pa, va));
                }
            }
        }
    }

    /// Translate a guest-physical address, honoring large-page entries.
    pub fn gpa_to_hpa(&self, gpa: Gpa) -> Option<Pa> {
        let addr = gpa.into_usize();
        let (entry, level) = self.walk(Gpa::new(addr & !PAGE_MASK)?).ok()?;
        let base = entry.pa()?.into_usize();
        let span_mask = (1usize << (PAGE_SHIFT + 9 * level)) - 1;
        Pa::new((base & !span_mask) | (addr & span_mask))
    }
}

/// Address probing for guests that have not enabled their own paging:
/// guest-virtual addresses are guest-physical addresses. Embedders whose
/// guests run paged supply their own [`Probe`].
impl Probe for ExtendedPageTable {
    fn gpa2hpa(&self, _vmcs: &ActiveVmcs, gpa: Gpa) -> Option<Pa> {
        self.gpa_to_hpa(gpa)
    }

    fn gva2hpa(&self, vmcs: &ActiveVmcs, gva: Gva) -> Option<Pa> {
        self.gpa2hpa(vmcs, Gpa::new(gva.into_usize())?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bedrock::addressing::Va;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// A frame source over the host heap: physical addresses are the heap
    /// addresses themselves.
    pub(crate) struct HeapFrames {
        live: Mutex<HashSet<usize>>,
        pub allocs: Mutex<usize>,
        pub frees: Mutex<usize>,
    }

    impl HeapFrames {
        pub(crate) fn new() -> Self {
            Self {
                live: Mutex::new(HashSet::new()),
                allocs: Mutex::new(0),
                frees: Mutex::new(0),
            }
        }

        pub(crate) fn leaked() -> &'static Self {
            Box::leak(Box::new(Self::new()))
        }

        pub(crate) fn live_count(&self) -> usize {
            self.live.lock().unwrap().len()
        }
    }

    impl FrameSource for HeapFrames {
        fn alloc(&self) -> Option<Frame> {
            let layout = std::alloc::Layout::from_size_align(0x1000, 0x1000).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            self.live.lock().unwrap().insert(ptr as usize);
            *self.allocs.lock().unwrap() += 1;
            Some(unsafe {
                Frame::from_raw(Pa::new(ptr as usize).unwrap(), Va::new(ptr as usize).unwrap())
            })
        }

        unsafe fn free(&self, frame: Frame) {
            let addr = frame.pa().into_usize();
            assert!(self.live.lock().unwrap().remove(&addr), "double free");
            *self.frees.lock().unwrap() += 1;
            let layout = std::alloc::Layout::from_size_align(0x1000, 0x1000).unwrap();
            std::alloc::dealloc(addr as *mut u8, layout);
        }

        fn pa_to_va(&self, pa: Pa) -> Option<Va> {
            // Identity: frames live in the host heap.
            Va::new(pa.into_usize())
        }
    }

    fn gpa(addr: usize) -> Gpa {
        Gpa::new(addr).unwrap()
    }

    #[test]
    fn map_then_classify_reports_exact_permissions() {
        let frames = HeapFrames::leaked();
        let mut ept = ExtendedPageTable::new(frames).unwrap();
        let frame = frames.alloc().unwrap();
        ept.map(gpa(0x4000), frame, EptFlags::FULL, MemoryType::WriteBack)
            .unwrap();
        assert_eq!(ept.classify(gpa(0x4000)), Classification::Mapped(EptFlags::FULL));
        // A neighboring page is still unmapped.
        assert_eq!(ept.classify(gpa(0x5000)), Classification::Unmapped);
        ept.reclaim();
    }

    #[test]
    fn unmap_returns_to_not_present() {
        let frames = HeapFrames::leaked();
        let mut ept = ExtendedPageTable::new(frames).unwrap();
        let frame = frames.alloc().unwrap();
        ept.map(gpa(0x8000), frame, EptFlags::READ | EptFlags::WRITE, MemoryType::WriteBack)
            .unwrap();
        let owned = ept.unmap(gpa(0x8000)).unwrap();
        assert!(owned.is_some());
        unsafe { frames.free(owned.unwrap()) };
        assert_eq!(ept.classify(gpa(0x8000)), Classification::Unmapped);
        assert_eq!(ept.unmap(gpa(0x8000)), Err(EptMappingError::NotExist));
        ept.reclaim();
    }

    #[test]
    fn remap_unions_permissions() {
        let frames = HeapFrames::leaked();
        let mut ept = ExtendedPageTable::new(frames).unwrap();
        let frame = frames.alloc().unwrap();
        let pa = frame.pa();
        ept.map(gpa(0xc000), frame, EptFlags::READ, MemoryType::WriteBack)
            .unwrap();
        unsafe {
            ept.map_shared(gpa(0xc000), pa, EptFlags::EXECUTE, MemoryType::WriteBack)
                .unwrap();
        }
        assert_eq!(
            ept.classify(gpa(0xc000)),
            Classification::Mapped(EptFlags::READ | EptFlags::EXECUTE)
        );
        ept.reclaim();
    }

    #[test]
    fn unaligned_addresses_rejected() {
        let frames = HeapFrames::leaked();
        let mut ept = ExtendedPageTable::new(frames).unwrap();
        let frame = frames.alloc().unwrap();
        assert_eq!(
            ept.map(gpa(0x4008), frame, EptFlags::FULL, MemoryType::WriteBack),
            Err(EptMappingError::Unaligned)
        );
        ept.reclaim();
    }

    #[test]
    fn distant_addresses_share_no_tables() {
        let frames = HeapFrames::leaked();
        let mut ept = ExtendedPageTable::new(frames).unwrap();
        let (a, b) = (frames.alloc().unwrap(), frames.alloc().unwrap());
        // Two addresses differing at the top-level index.
        ept.map(gpa(0x0000_1000), a, EptFlags::FULL, MemoryType::WriteBack)
            .unwrap();
        ept.map(gpa(0x0080_0000_0000), b, EptFlags::FULL, MemoryType::WriteBack)
            .unwrap();
        assert_eq!(ept.classify(gpa(0x0000_1000)), Classification::Mapped(EptFlags::FULL));
        assert_eq!(
            ept.classify(gpa(0x0080_0000_0000)),
            Classification::Mapped(EptFlags::FULL)
        );
        ept.reclaim();
    }

    #[test]
    fn write_without_read_is_misconfigured() {
        let frames = HeapFrames::leaked();
        let mut ept = ExtendedPageTable::new(frames).unwrap();
        let frame = frames.alloc().unwrap();
        ept.map(gpa(0x4000), frame, EptFlags::WRITE, MemoryType::WriteBack)
            .unwrap();
        assert_eq!(ept.classify(gpa(0x4000)), Classification::Misconfigured);
        ept.reclaim();
    }

    #[test]
    fn pointer_encodes_levels_and_memtype_in_low_bits() {
        let frames = HeapFrames::leaked();
        let ept = ExtendedPageTable::new(frames).unwrap();
        let ptr = ept.pointer();
        // (levels - 1) << 3 | write-back = 0x1e.
        assert_eq!(ptr.raw() & 0x3f, ((EPT_LEVELS as u64 - 1) << 3) | 6);
        assert_eq!(ptr.root(), ept.root.pa());
        // The root address contributes no flag bits.
        assert_eq!(ptr.raw() & !0xfff, ept.root.pa().into_usize() as u64);
        ept.reclaim();
    }

    #[test]
    fn pointer_tracks_root() {
        // Recomputed, not cached: two trees never share a pointer value.
        let frames = HeapFrames::leaked();
        let a = ExtendedPageTable::new(frames).unwrap();
        let b = ExtendedPageTable::new(frames).unwrap();
        assert_ne!(a.pointer(), b.pointer());
        a.reclaim();
        b.reclaim();
    }

    #[test]
    fn reclaim_frees_every_frame() {
        let frames = HeapFrames::leaked();
        let mut ept = ExtendedPageTable::new(frames).unwrap();
        for i in 0..16 {
            let frame = frames.alloc().unwrap();
            ept.map(gpa(i * 0x1000), frame, EptFlags::FULL, MemoryType::WriteBack)
                .unwrap();
        }
        // A second branch far away, to force extra tables.
        let frame = frames.alloc().unwrap();
        ept.map(gpa(0x00f0_0000_0000), frame, EptFlags::FULL, MemoryType::WriteBack)
            .unwrap();
        ept.reclaim();
        assert_eq!(frames.live_count(), 0);
        assert_eq!(*frames.allocs.lock().unwrap(), *frames.frees.lock().unwrap());
    }

    #[test]
    fn gpa_to_hpa_applies_page_offset() {
        let frames = HeapFrames::leaked();
        let mut ept = ExtendedPageTable::new(frames).unwrap();
        let frame = frames.alloc().unwrap();
        let hpa = frame.pa();
        ept.map(gpa(0x7000), frame, EptFlags::FULL, MemoryType::WriteBack)
            .unwrap();
        assert_eq!(
            ept.gpa_to_hpa(gpa(0x7123)),
            Pa::new(hpa.into_usize() | 0x123)
        );
        assert_eq!(ept.gpa_to_hpa(gpa(0x9123)), None);
        ept.reclaim();
    }
}
