/// Failures the memory subsystem reports instead of halting.
///
/// Everything not listed here (pool exhaustion, double free, inconsistent
/// bookkeeping) is a kernel bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfFrames { needed: usize, available: usize },
    OutOfHeap { requested: usize },
    HeapMetadataExhausted,
    ZeroSize,
    UnsupportedAlignment { align: usize },
    SizeOverflow,
}

impl core::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MemoryError::OutOfFrames { needed, available } => write!(
                f,
                "Not enough free frames: need {}, have {}",
                needed, available
            ),
            MemoryError::OutOfHeap { requested } => {
                write!(f, "Kernel heap cannot supply {} bytes", requested)
            }
            MemoryError::HeapMetadataExhausted => write!(f, "No free heap area slots left"),
            MemoryError::ZeroSize => write!(f, "Zero-sized allocation"),
            MemoryError::UnsupportedAlignment { align } => {
                write!(f, "Alignment {} exceeds the heap granule", align)
            }
            MemoryError::SizeOverflow => write!(f, "Allocation size overflows"),
        }
    }
}
