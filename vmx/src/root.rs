//! Entering VMX root operation.
//!
//! One logical processor transitions into root operation exactly once, at
//! bring-up, before any guest exists on it. Everything here happens with
//! the processor in an ordinary kernel context; on any failure the
//! processor is left as it was found (apart from CR0.NE and CR4.VMXE,
//! which are both compatible with non-VMX operation) and the allocated
//! region is returned.

use crate::caps::{check_control_registers, CapabilitySnapshot};
use crate::controls::{FEATURE_CONTROL_LOCKED, FEATURE_CONTROL_VMXON_OUTSIDE_SMX, IA32_FEATURE_CONTROL};
use crate::host::FrameSource;
use crate::{CpuContext, VmxError};
use bedrock::x86_64::msr::Msr;
use bedrock::x86_64::{vmx_supported, Cr0, Cr4};
use core::arch::asm;

/// Put this logical processor into VMX root operation.
///
/// Checks CPUID support, the CR0/CR4 fixed-bit constraints, and the
/// feature-lock MSR; allocates and stamps the root region; executes
/// `vmxon`. On success the region is recorded in `cpu`. On failure the
/// region is freed and no root state is recorded.
pub fn enter_root(
    cpu: &mut CpuContext,
    snap: &CapabilitySnapshot,
    frames: &'static dyn FrameSource,
) -> Result<(), VmxError> {
    if cpu.is_root() {
        return Err(VmxError::VmxRootEntryFailed("already in root operation"));
    }
    if !vmx_supported() {
        return Err(VmxError::UnsupportedCpu("no VMX extension"));
    }

    // Some processors report CR0.NE as fixed-1 under VMX; raise it up
    // front so the fixed-bit check sees the value that will be live.
    unsafe { (Cr0::current() | Cr0::NE).apply() };
    if !check_control_registers(snap, Cr0::current(), Cr4::current()) {
        return Err(VmxError::VmxRootEntryFailed("CR0/CR4 fixed bits"));
    }
    unsafe { (Cr4::current() | Cr4::VMXE).apply() };
    if !check_control_registers(snap, Cr0::current(), Cr4::current()) {
        return Err(VmxError::VmxRootEntryFailed("CR4 fixed bits with VMXE"));
    }

    // The firmware is supposed to program and lock IA32_FEATURE_CONTROL.
    // If it left the register unlocked, program it ourselves and re-read
    // to see whether the write took. Locked with VMX disabled is
    // unrecoverable until reset.
    let mut feature_control = Msr::<IA32_FEATURE_CONTROL>::read();
    if feature_control & FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
        if feature_control & FEATURE_CONTROL_LOCKED != 0 {
            return Err(VmxError::VmxRootEntryFailed("VMX disabled by firmware"));
        }
        unsafe {
            Msr::<IA32_FEATURE_CONTROL>::write(feature_control | FEATURE_CONTROL_VMXON_OUTSIDE_SMX)
        };
        feature_control = Msr::<IA32_FEATURE_CONTROL>::read();
        if feature_control & FEATURE_CONTROL_VMXON_OUTSIDE_SMX == 0 {
            return Err(VmxError::VmxRootEntryFailed("VMX disabled by firmware"));
        }
    }
    if feature_control & FEATURE_CONTROL_LOCKED == 0 {
        unsafe { Msr::<IA32_FEATURE_CONTROL>::write(feature_control | FEATURE_CONTROL_LOCKED) };
    }

    // The root region carries the same revision stamp as a VMCS, and the
    // advertised region size never exceeds one page.
    debug_assert!(snap.region_size() <= bedrock::addressing::PAGE_SIZE);
    let region = frames.alloc().ok_or(VmxError::OutOfFrames)?;
    unsafe {
        (region.va().into_usize() as *mut u32).write_volatile(snap.revision_id());
    }

    let pa = region.pa().into_usize();
    let err: i8;
    unsafe {
        asm!(
            "clc",
            "vmxon [{}]",
            "setna {}",
            in(reg) &pa,
            out(reg_byte) err,
        );
    }
    if err != 0 {
        unsafe { frames.free(region) };
        return Err(VmxError::VmxRootEntryFailed("vmxon"));
    }

    // The region now belongs to the hardware for as long as this processor
    // stays in root operation; only its physical address is kept.
    cpu.root_region = Some(region.pa());
    Ok(())
}
