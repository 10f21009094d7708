//! x86-64 architecture support.
//!
//! This crate carries the hardware-facing primitives the virtualization
//! engine is built on: typed physical/virtual addresses, model-specific
//! register access, control-register and flag types, segmentation state
//! readers, port-mapped I/O, and the serial console behind the `print!`
//! family of macros.
//!
//! Nothing in here knows about guests or VMCSes; that lives in the `vmx`
//! crate.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod kprint;

pub mod addressing;
pub mod x86_64;
