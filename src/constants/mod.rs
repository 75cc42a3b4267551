//! System-wide constants for the memory subsystem.

pub mod memory;
