//! Memory management for a 32-bit x86 kernel: physical frame pools, two-level
//! page tables with copy-on-write address-space cloning, and the kernel heap.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

pub mod constants;
pub mod logging;
pub mod memory;
