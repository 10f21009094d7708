//! VMX capability MSRs and the hardware control words.
//!
//! Every word here is a hardware-defined bitfield; the `bitflags` types are
//! the only way the rest of the engine spells those bits. Bits belonging to
//! features this engine refuses to run with (NMI virtualization, posted
//! interrupts, the preemption timer, APIC/TPR virtualization, SMM entry,
//! CET/PKRS/PAT/perf loading) are still named, because negotiation must
//! prove they are *off*.

// VMX capability MSRs.
/// MSR - IA32_FEATURE_CONTROL.
pub const IA32_FEATURE_CONTROL: usize = 0x03A;
/// MSR - IA32_VMX_BASIC.
pub const IA32_VMX_BASIC: usize = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: usize = 0x481;
/// MSR - IA32_VMX_PROCBASED_CTLS.
pub const IA32_VMX_PROCBASED_CTLS: usize = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: usize = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: usize = 0x484;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: usize = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: usize = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: usize = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: usize = 0x489;
/// MSR - IA32_VMX_PROCBASED_CTLS2.
pub const IA32_VMX_PROCBASED_CTLS2: usize = 0x48B;
/// MSR - IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: usize = 0x48C;
/// MSR - IA32_VMX_TRUE_PINBASED_CTLS.
pub const IA32_VMX_TRUE_PINBASED_CTLS: usize = 0x48D;
/// MSR - IA32_VMX_TRUE_PROCBASED_CTLS.
pub const IA32_VMX_TRUE_PROCBASED_CTLS: usize = 0x48E;
/// MSR - IA32_VMX_TRUE_EXIT_CTLS.
pub const IA32_VMX_TRUE_EXIT_CTLS: usize = 0x48F;
/// MSR - IA32_VMX_TRUE_ENTRY_CTLS.
pub const IA32_VMX_TRUE_ENTRY_CTLS: usize = 0x490;

/// Bit of IA32_VMX_BASIC that advertises the TRUE_* capability MSRs.
pub const VMX_BASIC_TRUE_CTLS: u64 = 1 << 55;

// IA32_FEATURE_CONTROL bits.
/// Lock bit; once set the register is immutable until reset.
pub const FEATURE_CONTROL_LOCKED: u64 = 1 << 0;
/// VMX enabled outside SMX operation.
pub const FEATURE_CONTROL_VMXON_OUTSIDE_SMX: u64 = 1 << 2;

bitflags::bitflags! {
    /// Pin-based VM-execution controls.
    pub struct PinControls: u32 {
        /// External interrupts cause VM exits regardless of guest
        /// RFLAGS.IF.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// NMIs cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// NMIs are never blocked; interruptibility tracks virtual-NMI
        /// blocking.
        const VIRTUAL_NMIS = 1 << 5;
        /// The VMX-preemption timer counts down in non-root operation.
        const PREEMPTION_TIMER = 1 << 6;
        /// Posted-interrupt processing.
        const POSTED_INTERRUPTS = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls.
    pub struct ProcControls: u32 {
        /// VM exit at the first instruction window open to interrupts.
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        /// RDTSC/RDTSCP/IA32_TIME_STAMP_COUNTER reads use the TSC offset.
        const USE_TSC_OFFSETTING = 1 << 3;
        /// HLT causes VM exits.
        const HLT_EXITING = 1 << 7;
        /// INVLPG causes VM exits.
        const INVLPG_EXITING = 1 << 9;
        /// MWAIT causes VM exits.
        const MWAIT_EXITING = 1 << 10;
        /// RDPMC causes VM exits.
        const RDPMC_EXITING = 1 << 11;
        /// RDTSC/RDTSCP cause VM exits.
        const RDTSC_EXITING = 1 << 12;
        /// MOV to CR3 causes VM exits.
        const CR3_LOAD_EXITING = 1 << 15;
        /// MOV from CR3 causes VM exits.
        const CR3_STORE_EXITING = 1 << 16;
        /// Tertiary processor-based controls are in use.
        const TERTIARY_CONTROLS = 1 << 17;
        /// MOV to CR8 causes VM exits.
        const CR8_LOAD_EXITING = 1 << 19;
        /// MOV from CR8 causes VM exits.
        const CR8_STORE_EXITING = 1 << 20;
        /// TPR virtualization.
        const TPR_SHADOW = 1 << 21;
        /// VM exit at the first instruction with no virtual-NMI blocking.
        const NMI_WINDOW_EXITING = 1 << 22;
        /// MOV DR causes VM exits.
        const MOV_DR_EXITING = 1 << 23;
        /// All I/O instructions cause VM exits.
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        /// I/O bitmaps restrict which ports cause VM exits; overrides
        /// unconditional I/O exiting.
        const USE_IO_BITMAPS = 1 << 25;
        /// Monitor trap flag debugging.
        const MONITOR_TRAP_FLAG = 1 << 27;
        /// MSR bitmaps restrict which RDMSR/WRMSR cause VM exits.
        const USE_MSR_BITMAPS = 1 << 28;
        /// MONITOR causes VM exits.
        const MONITOR_EXITING = 1 << 29;
        /// PAUSE causes VM exits.
        const PAUSE_EXITING = 1 << 30;
        /// Secondary processor-based controls are in use.
        const SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Secondary processor-based VM-execution controls.
    pub struct Proc2Controls: u32 {
        /// Accesses to the APIC-access page are treated specially.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// Extended page tables are enabled.
        const ENABLE_EPT = 1 << 1;
        /// Descriptor-table instructions cause VM exits.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// RDTSCP does not #UD.
        const ENABLE_RDTSCP = 1 << 3;
        /// Virtualized x2APIC MSR accesses.
        const VIRTUAL_X2APIC = 1 << 4;
        /// Cached linear translations carry a VPID.
        const ENABLE_VPID = 1 << 5;
        /// WBINVD causes VM exits.
        const WBINVD_EXITING = 1 << 6;
        /// Guest may run in unpaged protected mode or real-address mode.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// PAUSE loops can cause VM exits.
        const PAUSE_LOOP_EXITING = 1 << 10;
        /// INVPCID does not #UD.
        const ENABLE_INVPCID = 1 << 12;
        /// Page-modification logging.
        const ENABLE_PML = 1 << 17;
        /// EPT violations may raise #VE instead of exiting.
        const EPT_VIOLATION_VE = 1 << 18;
        /// XSAVES/XRSTORS do not #UD.
        const ENABLE_XSAVES = 1 << 20;
        /// EPT execute permission split by supervisor/user linear address.
        const MODE_BASED_EXEC_CTL = 1 << 22;
    }
}

bitflags::bitflags! {
    /// Primary VM-exit controls.
    pub struct ExitControls: u32 {
        /// DR7 and IA32_DEBUGCTL are saved on exit.
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        /// The processor is in 64-bit mode after the exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// IA32_PERF_GLOBAL_CTRL is loaded on exit.
        const LOAD_PERF_GLOBAL_CTRL = 1 << 12;
        /// On an external-interrupt exit, acknowledge the interrupt
        /// controller and store the vector in the interruption-information
        /// field.
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        /// IA32_PAT is saved on exit.
        const SAVE_IA32_PAT = 1 << 18;
        /// IA32_PAT is loaded on exit.
        const LOAD_IA32_PAT = 1 << 19;
        /// IA32_EFER is saved on exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// IA32_EFER is loaded on exit.
        const LOAD_IA32_EFER = 1 << 21;
        /// The preemption-timer value is saved on exit.
        const SAVE_PREEMPTION_TIMER = 1 << 22;
        /// IA32_BNDCFGS is cleared on exit.
        const CLEAR_IA32_BNDCFGS = 1 << 23;
        /// CET state is loaded on exit.
        const LOAD_CET_STATE = 1 << 28;
        /// IA32_PKRS is loaded on exit.
        const LOAD_PKRS = 1 << 29;
        /// Secondary VM-exit controls are in use.
        const SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags::bitflags! {
    /// VM-entry controls.
    pub struct EntryControls: u32 {
        /// DR7 and IA32_DEBUGCTL are loaded on entry.
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        /// The guest is in IA-32e mode after entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// Entry to system-management mode.
        const ENTRY_TO_SMM = 1 << 10;
        /// Deactivate dual-monitor treatment of SMIs and SMM.
        const DEACTIVATE_DUAL_MONITOR = 1 << 11;
        /// IA32_PERF_GLOBAL_CTRL is loaded on entry.
        const LOAD_PERF_GLOBAL_CTRL = 1 << 13;
        /// IA32_PAT is loaded on entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// IA32_EFER is loaded on entry.
        const LOAD_IA32_EFER = 1 << 15;
        /// IA32_BNDCFGS is loaded on entry.
        const LOAD_BNDCFGS = 1 << 16;
        /// CET state is loaded on entry.
        const LOAD_CET_STATE = 1 << 20;
        /// IA32_PKRS is loaded on entry.
        const LOAD_PKRS = 1 << 22;
    }
}

bitflags::bitflags! {
    /// IA32_VMX_EPT_VPID_CAP: what the EPT and the invalidation
    /// instructions can do.
    pub struct EptVpidCaps: u64 {
        /// Execute-only translations supported.
        const EXECUTE_ONLY = 1 << 0;
        /// 4-level EPT page walk supported.
        const WALK_LENGTH_4 = 1 << 6;
        /// Uncacheable EPT memory type supported.
        const MEMTYPE_UC = 1 << 8;
        /// Write-back EPT memory type supported.
        const MEMTYPE_WB = 1 << 14;
        /// 2MB leaf entries supported.
        const PAGE_2M = 1 << 16;
        /// 1GB leaf entries supported.
        const PAGE_1G = 1 << 17;
        /// INVEPT supported.
        const INVEPT = 1 << 20;
        /// Accessed/dirty flags for EPT supported. Detected here and
        /// deliberately never enabled.
        const ACCESSED_DIRTY = 1 << 21;
        /// Single-context INVEPT supported.
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        /// Global INVEPT supported.
        const INVEPT_GLOBAL = 1 << 26;
    }
}
