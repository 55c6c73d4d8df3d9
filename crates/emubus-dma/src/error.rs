use thiserror::Error;

pub type Result<T> = std::result::Result<T, DmaError>;

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("region size must be non-zero (dma_addr {dma_addr:#x})")]
    EmptyRegion { dma_addr: u64 },

    #[error("region span overflows the DMA address space (dma_addr {dma_addr:#x}, size {size:#x})")]
    SpanOverflow { dma_addr: u64, size: u64 },

    #[error("region at {dma_addr:#x} overlaps a registered region; would have sorted at slot {would_insert_at}")]
    Overlap { dma_addr: u64, would_insert_at: usize },

    #[error("region table full ({max_regions} regions)")]
    TableFull { max_regions: usize },

    #[error("no region registered at exactly [{dma_addr:#x}, +{size:#x})")]
    NoSuchRegion { dma_addr: u64, size: u64 },

    #[error("region at {dma_addr:#x} still mapped {refcount} time(s)")]
    RegionBusy { dma_addr: u64, refcount: u32 },

    #[error("invalid DMA span [{dma_addr:#x}, +{len:#x})")]
    InvalidSpan { dma_addr: u64, len: u64 },

    #[error("translation requires at least one descriptor slot")]
    ZeroCapacity,

    #[error("span [{dma_addr:#x}, +{len:#x}) is not fully covered by registered regions")]
    NotRegistered { dma_addr: u64, len: u64 },

    #[error("translation needs {needed} descriptors")]
    TooManyDescriptors { needed: usize },

    #[error("scatter-gather region index {index} out of range ({nregions} regions)")]
    BadRegionIndex { index: usize, nregions: usize },

    #[error("region {index} has no virtual mapping")]
    RegionNotMapped { index: usize },

    #[error("dirty page size must be non-zero")]
    BadPageSize,

    #[error("dirty logging is not active")]
    DirtyLoggingNotActive,

    #[error("dirty page size {requested} does not match active granularity {active}")]
    PageSizeMismatch { requested: u64, active: u64 },

    #[error("dirty snapshot buffer must be {expected} bytes, got {got}")]
    SnapshotBufferSize { expected: usize, got: usize },

    #[error("os error: {0}")]
    Os(#[from] nix::errno::Errno),
}

impl DmaError {
    /// The integer encoding used on the wire for capacity and overlap
    /// failures: `-(x) - 1`, where `x` is the number of descriptors needed
    /// or the slot the region would have sorted at. Callers that relay these
    /// errors to a peer rely on this encoding bit-for-bit.
    pub fn to_raw(&self) -> i32 {
        match self {
            DmaError::TooManyDescriptors { needed } => -(*needed as i32) - 1,
            DmaError::Overlap {
                would_insert_at, ..
            } => -(*would_insert_at as i32) - 1,
            _ => -1,
        }
    }
}
