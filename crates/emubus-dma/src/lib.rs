//! Synthetic DMA address-space management for device emulation.
//!
//! A user-space device emulator is handed foreign memory in linear chunks
//! ("regions"), each backed by a file descriptor, and registered at a unique,
//! non-overlapping span of a synthetic 64-bit DMA address space. To perform
//! DMA, the emulator translates a linear DMA span into a scatter-gather list
//! with [`AddressSpace::translate`], resolves it to process-local memory with
//! [`AddressSpace::map_sg`], and releases it with [`AddressSpace::unmap_sg`].
//! Every fd-backed region is mapped read/write into the process at
//! registration time; mapping a scatter-gather list only does lookups and
//! refcounting.
//!
//! Per-page write tracking ("dirty logging") for incremental state sync is
//! layered on top: see [`AddressSpace::start_dirty_logging`].
//!
//! The address space is not internally synchronized. Translation takes
//! `&mut self` (it may mark dirty bitmaps), so concurrent users must wrap
//! the table in a lock and keep one [`TranslationHint`] per execution
//! context; hints must never be shared across threads.

mod dirty;
mod error;
mod map;
mod region;
mod sg;

pub use error::{DmaError, Result};
pub use map::MappedSpan;
pub use region::AddressSpace;
pub use sg::{Prot, SgDescriptor, TranslationHint};
