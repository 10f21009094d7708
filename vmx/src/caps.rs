//! Capability negotiation.
//!
//! The capability MSRs describe, per control category, which bits the
//! processor insists on (mandatory-1, the low word) and which it permits
//! (allowed-1, the high word). Negotiation starts from the mandatory-1
//! bits, adds the bits this engine requires, and refuses the processor
//! outright if a required bit is not permitted or a bit the engine cannot
//! honor is mandated. There is no degraded mode: a control word that ever
//! reaches the VMCS satisfies every constraint, or guest creation never
//! starts.

use crate::controls::*;
use crate::VmxError;
use bedrock::x86_64::msr::Msr;
use bedrock::x86_64::{Cr0, Cr4, Efer};

/// Everything negotiation needs from the hardware, read once per logical
/// processor at bring-up and immutable afterwards.
#[derive(Debug, Clone, Copy)]
pub struct CapabilitySnapshot {
    /// IA32_VMX_BASIC.
    pub basic: u64,
    /// Allowed-settings MSR per category. The TRUE_* variant is used when
    /// IA32_VMX_BASIC bit 55 advertises it, else the legacy register.
    pub pin: u64,
    /// Primary processor-based allowed settings.
    pub proc: u64,
    /// Secondary processor-based allowed settings (no TRUE_* variant
    /// exists).
    pub proc2: u64,
    /// VM-exit allowed settings.
    pub exit: u64,
    /// VM-entry allowed settings.
    pub entry: u64,
    /// CR0 bits forced to 1 in VMX operation.
    pub cr0_fixed0: u64,
    /// CR0 bits allowed to be 1 in VMX operation.
    pub cr0_fixed1: u64,
    /// CR4 bits forced to 1 in VMX operation.
    pub cr4_fixed0: u64,
    /// CR4 bits allowed to be 1 in VMX operation.
    pub cr4_fixed1: u64,
    /// EPT and invalidation capabilities.
    pub ept_vpid: EptVpidCaps,
    /// The host's IA32_EFER at snapshot time.
    pub efer: Efer,
}

impl CapabilitySnapshot {
    /// Read the capability state of the current processor.
    pub fn read() -> Self {
        let basic = Msr::<IA32_VMX_BASIC>::read();
        let true_ctls = basic & VMX_BASIC_TRUE_CTLS != 0;
        let (pin, proc, exit, entry) = if true_ctls {
            (
                Msr::<IA32_VMX_TRUE_PINBASED_CTLS>::read(),
                Msr::<IA32_VMX_TRUE_PROCBASED_CTLS>::read(),
                Msr::<IA32_VMX_TRUE_EXIT_CTLS>::read(),
                Msr::<IA32_VMX_TRUE_ENTRY_CTLS>::read(),
            )
        } else {
            (
                Msr::<IA32_VMX_PINBASED_CTLS>::read(),
                Msr::<IA32_VMX_PROCBASED_CTLS>::read(),
                Msr::<IA32_VMX_EXIT_CTLS>::read(),
                Msr::<IA32_VMX_ENTRY_CTLS>::read(),
            )
        };
        Self {
            basic,
            pin,
            proc,
            proc2: Msr::<IA32_VMX_PROCBASED_CTLS2>::read(),
            exit,
            entry,
            cr0_fixed0: Msr::<IA32_VMX_CR0_FIXED0>::read(),
            cr0_fixed1: Msr::<IA32_VMX_CR0_FIXED1>::read(),
            cr4_fixed0: Msr::<IA32_VMX_CR4_FIXED0>::read(),
            cr4_fixed1: Msr::<IA32_VMX_CR4_FIXED1>::read(),
            ept_vpid: EptVpidCaps::from_bits_truncate(Msr::<IA32_VMX_EPT_VPID_CAP>::read()),
            efer: Efer::current(),
        }
    }

    /// The VMCS revision identifier to stamp into every VMCS and root
    /// region.
    #[inline]
    pub fn revision_id(&self) -> u32 {
        // Bits 30:0; bit 31 is the shadow indicator and always 0 here.
        self.basic as u32 & 0x7fff_ffff
    }

    /// The advertised VMCS region size in bytes (never more than a page).
    #[inline]
    pub fn region_size(&self) -> usize {
        ((self.basic >> 32) & 0x1fff) as usize
    }
}

/// The negotiated configuration: the words written into every guest's
/// VMCS, plus the derived EFER pair and the EPT capabilities the
/// translation code consults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiatedControls {
    /// Pin-based VM-execution controls.
    pub pin: PinControls,
    /// Primary processor-based VM-execution controls.
    pub proc: ProcControls,
    /// Secondary processor-based VM-execution controls.
    pub proc2: Proc2Controls,
    /// VM-exit controls.
    pub exit: ExitControls,
    /// VM-entry controls.
    pub entry: EntryControls,
    /// EPT capabilities.
    pub ept_caps: EptVpidCaps,
    /// EFER value for the host area.
    pub host_efer: u64,
    /// EFER value the guest starts with: the host value with LMA dropped,
    /// since an unrestricted guest begins unpaged.
    pub guest_efer: u64,
}

/// Checks `value` against a fixed0/fixed1 pair: a bit forced to 1 must be
/// 1, a bit forced to 0 must be 0.
pub fn check_fixed_bits(value: u64, fixed0: u64, fixed1: u64) -> bool {
    // fixed0 bits are 1 wherever the bit must be 1; fixed1 bits are 0
    // wherever the bit must be 0.
    (fixed0 & !value) == 0 && (value & !fixed1) == 0
}

/// Derive one 32-bit control word from its allowed-settings MSR.
///
/// `required` must all be permitted by the allowed-1 half; `forbidden`
/// must not appear in the mandatory-1 half. The result is mandatory-1 OR
/// required.
fn negotiate(
    allowed: u64,
    required: u32,
    forbidden: u32,
    what: &'static str,
) -> Result<u32, VmxError> {
    let mandatory = allowed as u32;
    let permitted = (allowed >> 32) as u32;
    if mandatory & forbidden != 0 {
        return Err(VmxError::UnsupportedCpu(what));
    }
    if required & !permitted != 0 {
        return Err(VmxError::UnsupportedCpu(what));
    }
    Ok(mandatory | required)
}

/// Compute the full negotiated configuration from a capability snapshot.
///
/// Fails with [`VmxError::UnsupportedCpu`] before any processor or guest
/// state has been touched.
pub fn compute_controls(snap: &CapabilitySnapshot) -> Result<NegotiatedControls, VmxError> {
    let pin = negotiate(
        snap.pin,
        PinControls::EXTERNAL_INTERRUPT_EXITING.bits(),
        (PinControls::NMI_EXITING
            | PinControls::VIRTUAL_NMIS
            | PinControls::PREEMPTION_TIMER
            | PinControls::POSTED_INTERRUPTS)
            .bits(),
        "pin-based controls",
    )?;

    let proc = negotiate(
        snap.proc,
        (ProcControls::HLT_EXITING
            | ProcControls::USE_IO_BITMAPS
            | ProcControls::SECONDARY_CONTROLS)
            .bits(),
        (ProcControls::CR3_LOAD_EXITING
            | ProcControls::CR3_STORE_EXITING
            | ProcControls::INVLPG_EXITING
            | ProcControls::USE_MSR_BITMAPS
            | ProcControls::TPR_SHADOW
            | ProcControls::NMI_WINDOW_EXITING
            | ProcControls::TERTIARY_CONTROLS)
            .bits(),
        "processor-based controls",
    )?;

    // The secondary word has no mandatory-1 class; anything the hardware
    // insists on is something this engine does not emulate.
    let wanted2 = Proc2Controls::ENABLE_EPT | Proc2Controls::UNRESTRICTED_GUEST;
    let proc2 = negotiate(
        snap.proc2,
        wanted2.bits(),
        !wanted2.bits(),
        "secondary processor-based controls",
    )?;

    let exit = negotiate(
        snap.exit,
        (ExitControls::HOST_ADDRESS_SPACE_SIZE
            | ExitControls::ACK_INTERRUPT_ON_EXIT
            | ExitControls::SAVE_IA32_EFER
            | ExitControls::LOAD_IA32_EFER)
            .bits(),
        (ExitControls::SECONDARY_CONTROLS
            | ExitControls::SAVE_PREEMPTION_TIMER
            | ExitControls::LOAD_PERF_GLOBAL_CTRL
            | ExitControls::LOAD_IA32_PAT
            | ExitControls::LOAD_CET_STATE
            | ExitControls::LOAD_PKRS)
            .bits(),
        "exit controls",
    )?;

    let entry = negotiate(
        snap.entry,
        EntryControls::LOAD_IA32_EFER.bits(),
        (EntryControls::ENTRY_TO_SMM
            | EntryControls::DEACTIVATE_DUAL_MONITOR
            | EntryControls::LOAD_PERF_GLOBAL_CTRL
            | EntryControls::LOAD_IA32_PAT
            | EntryControls::LOAD_CET_STATE
            | EntryControls::LOAD_PKRS)
            .bits(),
        "entry controls",
    )?;

    // The translation tree is 4-level write-back, invalidated with invept;
    // all three must exist.
    if !snap.ept_vpid.contains(EptVpidCaps::MEMTYPE_WB) {
        return Err(VmxError::UnsupportedCpu("write-back EPT memory type"));
    }
    if !snap.ept_vpid.contains(EptVpidCaps::WALK_LENGTH_4) {
        return Err(VmxError::UnsupportedCpu("4-level EPT walk"));
    }
    if !snap.ept_vpid.contains(EptVpidCaps::INVEPT)
        || !snap
            .ept_vpid
            .intersects(EptVpidCaps::INVEPT_SINGLE_CONTEXT | EptVpidCaps::INVEPT_GLOBAL)
    {
        return Err(VmxError::UnsupportedCpu("invept"));
    }

    let host_efer = snap.efer.bits();
    let guest_efer = (snap.efer & !Efer::LMA).bits();

    // from_bits_unchecked keeps reserved mandatory-1 bits the flag types do
    // not name; truncating them would produce a word the hardware rejects.
    unsafe {
        Ok(NegotiatedControls {
            pin: PinControls::from_bits_unchecked(pin),
            proc: ProcControls::from_bits_unchecked(proc),
            proc2: Proc2Controls::from_bits_unchecked(proc2),
            exit: ExitControls::from_bits_unchecked(exit),
            entry: EntryControls::from_bits_unchecked(entry),
            ept_caps: snap.ept_vpid,
            host_efer,
            guest_efer,
        })
    }
}

/// Check the live CR0/CR4 against the snapshot's fixed-bit constraints.
pub fn check_control_registers(snap: &CapabilitySnapshot, cr0: Cr0, cr4: Cr4) -> bool {
    check_fixed_bits(cr0.bits(), snap.cr0_fixed0, snap.cr0_fixed1)
        && check_fixed_bits(cr4.bits(), snap.cr4_fixed0, snap.cr4_fixed1)
}

#[cfg(test)]
mod tests {
    use super::*;

    // A snapshot of a fully capable processor: nothing mandated beyond the
    // usual default-1 classes, everything the engine wants permitted.
    fn capable() -> CapabilitySnapshot {
        let permissive = |mandatory: u32| ((u32::MAX as u64) << 32) | mandatory as u64;
        CapabilitySnapshot {
            basic: (1 << 55) | 0x1000_0000_0000_0001,
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
                | EptVpidCaps::INVEPT_GLOBAL
                | EptVpidCaps::PAGE_2M,
            efer: Efer::SCE | Efer::LME | Efer::LMA | Efer::NXE,
        }
    }

    #[test]
    fn capable_processor_negotiates() {
        let c = compute_controls(&capable()).unwrap();
        // Every required bit is present...
        assert!(c.pin.contains(PinControls::EXTERNAL_INTERRUPT_EXITING));
        assert!(c
            .proc
            .contains(ProcControls::HLT_EXITING | ProcControls::USE_IO_BITMAPS));
        assert!(c.proc.contains(ProcControls::SECONDARY_CONTROLS));
        assert!(c
            .proc2
            .contains(Proc2Controls::ENABLE_EPT | Proc2Controls::UNRESTRICTED_GUEST));
        assert!(c.exit.contains(
            ExitControls::HOST_ADDRESS_SPACE_SIZE
                | ExitControls::ACK_INTERRUPT_ON_EXIT
                | ExitControls::SAVE_IA32_EFER
                | ExitControls::LOAD_IA32_EFER
        ));
        assert!(c.entry.contains(EntryControls::LOAD_IA32_EFER));
        // ...and the forbidden set is absent.
        assert!(!c.pin.intersects(
            PinControls::NMI_EXITING
                | PinControls::VIRTUAL_NMIS
                | PinControls::PREEMPTION_TIMER
                | PinControls::POSTED_INTERRUPTS
        ));
        assert!(!c
            .proc
            .intersects(ProcControls::CR3_LOAD_EXITING | ProcControls::CR3_STORE_EXITING));
    }

    #[test]
    fn negotiated_word_covers_mandatory_bits() {
        let snap = capable();
        let c = compute_controls(&snap).unwrap();
        // Mandatory-1 bits of each category are a subset of the word.
        assert_eq!(c.proc.bits() & snap.proc as u32, snap.proc as u32);
        assert_eq!(c.entry.bits() & snap.entry as u32, snap.entry as u32);
        // And nothing outside the allowed-1 half is set.
        assert_eq!(c.pin.bits() & !((snap.pin >> 32) as u32), 0);
        assert_eq!(c.exit.bits() & !((snap.exit >> 32) as u32), 0);
    }

    #[test]
    fn missing_ept_is_unsupported() {
        let mut snap = capable();
        // Clear the EPT allowed-bit in the secondary controls.
        snap.proc2 &= !((Proc2Controls::ENABLE_EPT.bits() as u64) << 32);
        assert_eq!(
            compute_controls(&snap),
            Err(VmxError::UnsupportedCpu(
                "secondary processor-based controls"
            ))
        );
    }

    #[test]
    fn mandated_forbidden_bit_is_unsupported() {
        let mut snap = capable();
        // Hardware that insists on the preemption timer cannot run this
        // engine.
        snap.pin |= PinControls::PREEMPTION_TIMER.bits() as u64;
        assert_eq!(
            compute_controls(&snap),
            Err(VmxError::UnsupportedCpu("pin-based controls"))
        );
    }

    #[test]
    fn missing_hlt_exiting_is_unsupported() {
        let mut snap = capable();
        snap.proc &= !((ProcControls::HLT_EXITING.bits() as u64) << 32);
        assert!(matches!(
            compute_controls(&snap),
            Err(VmxError::UnsupportedCpu(_))
        ));
    }

    #[test]
    fn missing_writeback_memtype_is_unsupported() {
        let mut snap = capable();
        snap.ept_vpid.remove(EptVpidCaps::MEMTYPE_WB);
        assert_eq!(
            compute_controls(&snap),
            Err(VmxError::UnsupportedCpu("write-back EPT memory type"))
        );
    }

    #[test]
    fn guest_efer_drops_lma() {
        let c = compute_controls(&capable()).unwrap();
        assert_eq!(c.host_efer & Efer::LMA.bits(), Efer::LMA.bits());
        assert_eq!(c.guest_efer & Efer::LMA.bits(), 0);
        assert_eq!(c.guest_efer & Efer::LME.bits(), Efer::LME.bits());
    }

    #[test]
    fn fixed_bits_boundaries() {
        // No constraints at all.
        assert!(check_fixed_bits(0, 0, u64::MAX));
        assert!(check_fixed_bits(u64::MAX, 0, u64::MAX));
        // Everything forced to 1: only all-ones passes.
        assert!(check_fixed_bits(u64::MAX, u64::MAX, u64::MAX));
        assert!(!check_fixed_bits(u64::MAX - 1, u64::MAX, u64::MAX));
        // Everything forced to 0: only all-zeros passes.
        assert!(check_fixed_bits(0, 0, 0));
        assert!(!check_fixed_bits(1, 0, 0));
        // Mixed: bit 0 forced 1, bit 1 forced 0.
        assert!(check_fixed_bits(0b01, 0b01, !0b10));
        assert!(!check_fixed_bits(0b11, 0b01, !0b10));
        assert!(!check_fixed_bits(0b00, 0b01, !0b10));
    }

    #[test]
    fn revision_id_masks_shadow_bit() {
        let mut snap = capable();
        snap.basic = (snap.basic & !0xffff_ffff) | 0x8000_0007;
        assert_eq!(snap.revision_id(), 0x7);
    }
}
